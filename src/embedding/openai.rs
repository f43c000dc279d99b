use std::time::Duration;

use super::traits::EmbeddingBackend;
use crate::llm::BoxFuture;

// ── OpenAI-compatible embedding backend ──────────────────────

pub struct OpenAiEmbedding {
    client: reqwest::Client,
    cached_embeddings_url: String,
    cached_auth_header: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbedding {
    /// `base_url` is the API root including its version segment.
    pub fn new(base_url: &str, api_key: &str, model: &str, dims: usize) -> Self {
        let base = base_url.trim_end_matches('/');
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            cached_embeddings_url: format!("{base}/embeddings"),
            cached_auth_header: format!("Bearer {api_key}"),
            model: model.to_string(),
            dims,
        }
    }

    pub fn embeddings_url(&self) -> &str {
        &self.cached_embeddings_url
    }
}

impl EmbeddingBackend for OpenAiEmbedding {
    fn name(&self) -> &str {
        "openai"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn embed<'a>(&'a self, texts: &'a [&'a str]) -> BoxFuture<'a, anyhow::Result<Vec<Vec<f32>>>> {
        Box::pin(async move {
            if texts.is_empty() {
                return Ok(Vec::new());
            }

            let body = serde_json::json!({
                "model": self.model,
                "input": texts,
            });

            let resp = self
                .client
                .post(&self.cached_embeddings_url)
                .header("Authorization", &self.cached_auth_header)
                .json(&body)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("Embedding HTTP request failed: {e}"))?;

            if !resp.status().is_success() {
                let status = resp.status();
                anyhow::bail!("Embedding API error {status}");
            }

            let json: serde_json::Value = resp.json().await?;
            let data = json
                .get("data")
                .and_then(|d| d.as_array())
                .ok_or_else(|| anyhow::anyhow!("Invalid embedding response: missing 'data'"))?;

            let mut embeddings = Vec::with_capacity(data.len());
            for item in data {
                let embedding = item
                    .get("embedding")
                    .and_then(|e| e.as_array())
                    .ok_or_else(|| anyhow::anyhow!("Invalid embedding item"))?;

                #[allow(clippy::cast_possible_truncation)]
                let vec: Vec<f32> = embedding
                    .iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect();

                if self.dims > 0 && vec.len() != self.dims {
                    anyhow::bail!(
                        "Embedding dimension mismatch: expected {}, got {}",
                        self.dims,
                        vec.len()
                    );
                }
                embeddings.push(vec);
            }

            Ok(embeddings)
        })
    }
}
