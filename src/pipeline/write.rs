use futures_util::{Stream, StreamExt};
use serde_json::json;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tera::Context;

use super::prompts::{PromptSet, WRITER_SYSTEM};
use crate::config::{Component, ResolvedModel};
use crate::error::{EngineError, ExternalServiceError, Result};
use crate::llm::with_timeout;
use crate::tier::TierLimits;
use crate::types::{AssembledContext, GenerationPlan, Stage};

/// Writer output pulled one chunk at a time. Dropping it cancels the
/// backend request.
pub type TextStream = Pin<Box<dyn Stream<Item = std::result::Result<String, ExternalServiceError>> + Send>>;

/// Produces the final prose. Load-bearing: backend failures propagate.
pub struct Writer {
    prompts: Arc<PromptSet>,
}

impl Writer {
    pub fn new(prompts: Arc<PromptSet>) -> Self {
        Self { prompts }
    }

    pub fn build_prompt(&self, context: &AssembledContext, plan: &GenerationPlan) -> Result<String> {
        let plan_text = serde_json::to_string_pretty(&plan.directives).unwrap_or_default();
        let target_length = context
            .preferences
            .get("target_length")
            .cloned()
            .unwrap_or_else(|| json!(null));

        let mut ctx = Context::new();
        ctx.insert("user_query", &context.user_query);
        ctx.insert("target_length", &target_length);
        ctx.insert("plan", &plan_text);
        ctx.insert("must_include", &context.query.must_include);
        ctx.insert("must_avoid", &context.query.must_avoid);
        ctx.insert("characters", &context.creative.characters);
        ctx.insert("setting", &context.creative.setting);
        ctx.insert("plot_requirements", &context.creative.plot_requirements);
        ctx.insert("style", &context.creative.style);
        ctx.insert("continuation", &context.creative.continuation);
        ctx.insert("hints", &context.creative.hints);
        ctx.insert("memories", &context.memories);
        ctx.insert("earlier_summary", &context.history.earlier_summary);
        ctx.insert("history", &context.history.recent_turns);

        self.prompts
            .render(Component::Writer, &ctx)
            .map_err(|e| EngineError::pipeline(Stage::Write, format!("{e:#}")))
    }

    pub async fn write(
        &self,
        context: &AssembledContext,
        plan: &GenerationPlan,
        limits: &TierLimits,
        model: &ResolvedModel,
    ) -> Result<String> {
        let prompt = self.build_prompt(context, plan)?;
        let content = with_timeout(
            "writer",
            limits.call_timeout(),
            model.backend.generate_text(
                Some(WRITER_SYSTEM),
                &prompt,
                &model.model_id,
                model.temperature,
            ),
        )
        .await?;

        if content.trim().is_empty() {
            return Err(ExternalServiceError::failed("writer", "model returned no content").into());
        }
        Ok(content)
    }

    /// Opening the stream is bounded by the tier timeout; after that, every
    /// chunk gets the same deadline.
    pub async fn stream_write(
        &self,
        context: &AssembledContext,
        plan: &GenerationPlan,
        limits: &TierLimits,
        model: &ResolvedModel,
    ) -> Result<TextStream> {
        let prompt = self.build_prompt(context, plan)?;
        let timeout = limits.call_timeout();
        let inner = with_timeout(
            "writer",
            timeout,
            model.backend.generate_stream(
                Some(WRITER_SYSTEM),
                &prompt,
                &model.model_id,
                model.temperature,
            ),
        )
        .await?;

        Ok(per_chunk_deadline(inner, timeout))
    }
}

fn per_chunk_deadline(mut inner: crate::llm::ChatStream, timeout: Duration) -> TextStream {
    Box::pin(async_stream::stream! {
        loop {
            match tokio::time::timeout(timeout, inner.next()).await {
                Ok(Some(Ok(chunk))) => yield Ok(chunk),
                Ok(Some(Err(e))) => {
                    yield Err(ExternalServiceError::failed("writer", format!("{e:#}")));
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    yield Err(ExternalServiceError::Timeout {
                        service: "writer".to_string(),
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    });
                    break;
                }
            }
        }
    })
}
