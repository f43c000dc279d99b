use futures_util::{Stream, stream};
use std::future::Future;
use std::pin::Pin;

/// Text chunks produced by a streaming completion. Dropping the stream
/// stops the underlying request.
pub type ChatStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send + 'static>>;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Chat/completion backend used by every model-driven stage.
///
/// Implementations do not enforce timeouts themselves; callers wrap each
/// call with [`with_timeout`](super::with_timeout) using the tier budget.
pub trait ChatBackend: Send + Sync {
    /// Backend identifier (e.g. "openai-compatible").
    fn name(&self) -> &str;

    fn supports_streaming(&self) -> bool {
        false
    }

    fn generate_text<'a>(
        &'a self,
        system_prompt: Option<&'a str>,
        prompt: &'a str,
        model: &'a str,
        temperature: f64,
    ) -> BoxFuture<'a, anyhow::Result<String>>;

    /// Streaming variant. Backends without native streaming yield the whole
    /// completion as a single chunk.
    fn generate_stream<'a>(
        &'a self,
        system_prompt: Option<&'a str>,
        prompt: &'a str,
        model: &'a str,
        temperature: f64,
    ) -> BoxFuture<'a, anyhow::Result<ChatStream>> {
        Box::pin(async move {
            let text = self
                .generate_text(system_prompt, prompt, model, temperature)
                .await?;
            Ok(Box::pin(stream::once(async move { Ok(text) })) as ChatStream)
        })
    }
}
