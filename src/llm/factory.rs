use std::sync::Arc;

use super::compatible::OpenAiCompatibleChat;
use super::reliable::ReliableChat;
use super::traits::ChatBackend;
use crate::config::ModelConfig;

/// Builds chat backends from validated credentials. The orchestrator only
/// ever talks to this seam, never to a concrete HTTP client.
pub trait ChatBackendFactory: Send + Sync {
    fn create(&self, component: &str, config: &ModelConfig)
    -> anyhow::Result<Arc<dyn ChatBackend>>;
}

/// Creates OpenAI-compatible HTTP backends wrapped in retry handling.
#[derive(Debug, Clone)]
pub struct HttpChatFactory {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for HttpChatFactory {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: 250,
        }
    }
}

impl ChatBackendFactory for HttpChatFactory {
    fn create(
        &self,
        component: &str,
        config: &ModelConfig,
    ) -> anyhow::Result<Arc<dyn ChatBackend>> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("{component}: base_url is required"))?;
        let api_key = config
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("{component}: api_key is required"))?;

        let http: Arc<dyn ChatBackend> = Arc::new(OpenAiCompatibleChat::new(
            &format!("openai-compatible:{component}"),
            base_url,
            api_key,
        ));
        if self.max_retries == 0 {
            return Ok(http);
        }
        Ok(Arc::new(ReliableChat::new(
            http,
            self.max_retries,
            self.backoff_ms,
        )))
    }
}
