use std::sync::Arc;
use std::time::Duration;

use super::traits::{BoxFuture, ChatBackend, ChatStream};

/// Check if an error is non-retryable (client errors that won't resolve with retries).
fn is_non_retryable(err: &anyhow::Error) -> bool {
    if let Some(reqwest_err) = err.downcast_ref::<reqwest::Error>()
        && let Some(status) = reqwest_err.status()
    {
        let code = status.as_u16();
        return status.is_client_error() && code != 429 && code != 408;
    }
    // String fallback: adapters format the status into the message.
    let msg = err.to_string();
    for word in msg.split(|c: char| !c.is_ascii_digit()) {
        if let Ok(code) = word.parse::<u16>()
            && (400..500).contains(&code)
        {
            return code != 429 && code != 408;
        }
    }
    false
}

/// Chat backend wrapper that retries transient failures with exponential backoff.
pub struct ReliableChat {
    inner: Arc<dyn ChatBackend>,
    max_retries: u32,
    base_backoff_ms: u64,
}

impl ReliableChat {
    pub fn new(inner: Arc<dyn ChatBackend>, max_retries: u32, base_backoff_ms: u64) -> Self {
        Self {
            inner,
            max_retries,
            base_backoff_ms: base_backoff_ms.max(10),
        }
    }

    async fn retrying<'a, T, F>(&'a self, mut attempt_call: F) -> anyhow::Result<T>
    where
        F: FnMut() -> BoxFuture<'a, anyhow::Result<T>>,
    {
        let mut backoff_ms = self.base_backoff_ms;
        let mut failures = Vec::new();

        for attempt in 0..=self.max_retries {
            match attempt_call().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(
                            backend = self.inner.name(),
                            attempt,
                            "Chat backend recovered after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => {
                    let non_retryable = is_non_retryable(&e);
                    failures.push(format!(
                        "attempt {}/{}: {e}",
                        attempt + 1,
                        self.max_retries + 1
                    ));
                    if non_retryable {
                        tracing::warn!(backend = self.inner.name(), "Non-retryable chat error");
                        break;
                    }
                    if attempt < self.max_retries {
                        tracing::warn!(
                            backend = self.inner.name(),
                            attempt = attempt + 1,
                            max_retries = self.max_retries,
                            "Chat call failed, retrying"
                        );
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        backoff_ms = backoff_ms.saturating_mul(2).min(10_000);
                    }
                }
            }
        }

        anyhow::bail!(
            "{} failed. Attempts:\n{}",
            self.inner.name(),
            failures.join("\n")
        )
    }
}

impl ChatBackend for ReliableChat {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn supports_streaming(&self) -> bool {
        self.inner.supports_streaming()
    }

    fn generate_text<'a>(
        &'a self,
        system_prompt: Option<&'a str>,
        prompt: &'a str,
        model: &'a str,
        temperature: f64,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(self.retrying(move || {
            self.inner
                .generate_text(system_prompt, prompt, model, temperature)
        }))
    }

    // Only opening the stream is retried; a stream that fails midway surfaces
    // its error to the consumer.
    fn generate_stream<'a>(
        &'a self,
        system_prompt: Option<&'a str>,
        prompt: &'a str,
        model: &'a str,
        temperature: f64,
    ) -> BoxFuture<'a, anyhow::Result<ChatStream>> {
        Box::pin(self.retrying(move || {
            self.inner
                .generate_stream(system_prompt, prompt, model, temperature)
        }))
    }
}
