use crate::llm::BoxFuture;

/// Embedding backend port: converts text to fixed-size vectors.
pub trait EmbeddingBackend: Send + Sync {
    /// Backend name
    fn name(&self) -> &str;

    /// Fixed output dimension of every vector this backend produces
    fn dimensions(&self) -> usize;

    /// Embed a batch of texts into vectors
    fn embed<'a>(&'a self, texts: &'a [&'a str]) -> BoxFuture<'a, anyhow::Result<Vec<Vec<f32>>>>;

    /// Embed a single text
    fn embed_one<'a>(&'a self, text: &'a str) -> BoxFuture<'a, anyhow::Result<Vec<f32>>> {
        Box::pin(async move {
            let texts = [text];
            let mut results = self.embed(&texts).await?;
            results
                .pop()
                .ok_or_else(|| anyhow::anyhow!("Empty embedding result"))
        })
    }
}
