use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tera::Context;

use super::prompts::{DIRECTOR_SYSTEM, PromptSet, extract_json_object};
use crate::config::{Component, ResolvedModel};
use crate::llm::with_timeout;
use crate::tier::TierLimits;
use crate::types::{EngineRequest, FormattedMemory, GenerationPlan, QueryUnderstandingResult};

/// The director. One model call that decides structure and focus before
/// the writer runs.
///
/// The plan only steers the writer, so a failed call falls back to a plan
/// derived from the query instead of failing the request.
pub struct Planner {
    prompts: Arc<PromptSet>,
}

impl Planner {
    pub fn new(prompts: Arc<PromptSet>) -> Self {
        Self { prompts }
    }

    pub async fn plan(
        &self,
        request: &EngineRequest,
        query: &QueryUnderstandingResult,
        memories: &[FormattedMemory],
        limits: &TierLimits,
        model: &ResolvedModel,
    ) -> GenerationPlan {
        let mut ctx = Context::new();
        ctx.insert("user_query", request.user_query());
        ctx.insert("search_intent", &query.search_intent);
        ctx.insert("keywords", &query.keywords);
        ctx.insert("target_length", &limits.target_length);
        ctx.insert("style", &request.context().style);
        ctx.insert("memories", memories);

        let prompt = match self.prompts.render(Component::Director, &ctx) {
            Ok(prompt) => prompt,
            Err(e) => {
                tracing::warn!("director prompt failed to render: {e:#}");
                return fallback_plan(query, limits);
            }
        };

        match with_timeout(
            "director",
            limits.call_timeout(),
            model.backend.generate_text(
                Some(DIRECTOR_SYSTEM),
                &prompt,
                &model.model_id,
                model.temperature,
            ),
        )
        .await
        {
            Ok(reply) => parse_plan(&reply),
            Err(e) => {
                tracing::warn!(model = model.model_id.as_str(), "director unavailable, using fallback plan: {e}");
                fallback_plan(query, limits)
            }
        }
    }
}

/// JSON object replies become directives; anything else is kept whole as
/// a free-text outline.
pub(crate) fn parse_plan(reply: &str) -> GenerationPlan {
    let directives: BTreeMap<String, Value> = match extract_json_object(reply) {
        Some(map) => map.into_iter().collect(),
        None => BTreeMap::from([("outline".to_string(), json!(reply.trim()))]),
    };
    GenerationPlan {
        directives,
        fallback: false,
    }
}

pub(crate) fn fallback_plan(query: &QueryUnderstandingResult, limits: &TierLimits) -> GenerationPlan {
    let mut focus_points = vec![json!(query.search_intent)];
    focus_points.extend(query.must_include.iter().map(|s| json!(s)));

    GenerationPlan {
        directives: BTreeMap::from([
            ("structure".to_string(), json!("opening, development, resolution")),
            ("focus_points".to_string(), Value::Array(focus_points)),
            ("target_length".to_string(), json!(limits.target_length)),
        ]),
        fallback: true,
    }
}
