use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use tera::Context;

use super::prompts::{PromptSet, UNDERSTANDING_SYSTEM, extract_json_object, string_list};
use crate::config::{Component, ResolvedModel};
use crate::error::{EngineError, Result};
use crate::llm::with_timeout;
use crate::tier::TierLimits;
use crate::types::{EngineRequest, QueryUnderstandingResult, Stage};

const MAX_FALLBACK_KEYWORDS: usize = 8;

/// Turns the raw query into structured search intent with one model call.
///
/// This stage is load-bearing: a failed or timed-out call is returned to the
/// caller instead of being papered over. An unparseable reply is not a
/// failure; the query itself becomes the search intent.
pub struct QueryUnderstander {
    prompts: Arc<PromptSet>,
}

impl QueryUnderstander {
    pub fn new(prompts: Arc<PromptSet>) -> Self {
        Self { prompts }
    }

    pub async fn understand(
        &self,
        request: &EngineRequest,
        limits: &TierLimits,
        model: &ResolvedModel,
    ) -> Result<QueryUnderstandingResult> {
        let context = request.context();
        let mut ctx = Context::new();
        ctx.insert("user_query", request.user_query());
        ctx.insert("characters", &context.characters);
        ctx.insert("setting", &context.setting);
        ctx.insert("plot_requirements", &context.plot_requirements);
        ctx.insert("style", &context.style);
        let prompt = self
            .prompts
            .render(Component::Understanding, &ctx)
            .map_err(|e| EngineError::pipeline(Stage::Understand, format!("{e:#}")))?;

        let reply = with_timeout(
            "understanding",
            limits.call_timeout(),
            model.backend.generate_text(
                Some(UNDERSTANDING_SYSTEM),
                &prompt,
                &model.model_id,
                model.temperature,
            ),
        )
        .await?;

        Ok(parse_understanding(request, &reply, &model.model_id))
    }
}

fn dedup_keywords(words: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    words
        .into_iter()
        .filter(|w| seen.insert(w.to_lowercase()))
        .collect()
}

/// Whitespace-separated words of three or more characters, stripped of
/// surrounding punctuation.
fn naive_keywords(query: &str) -> Vec<String> {
    let words = query
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase);
    let mut keywords = dedup_keywords(words);
    keywords.truncate(MAX_FALLBACK_KEYWORDS);
    keywords
}

pub(crate) fn parse_understanding(
    request: &EngineRequest,
    reply: &str,
    model_id: &str,
) -> QueryUnderstandingResult {
    let parsed = extract_json_object(reply);
    if parsed.is_none() {
        tracing::warn!(model = model_id, "understanding reply was not JSON; using the raw query");
    }
    let map = parsed.clone().unwrap_or_default();

    let search_intent = map
        .get("search_intent")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(request.user_query())
        .to_string();

    let mut keywords = dedup_keywords(string_list(&map, "keywords"));
    if keywords.is_empty() {
        keywords = naive_keywords(request.user_query());
    }

    let must_include: BTreeSet<String> = string_list(&map, "must_include")
        .into_iter()
        .chain(request.option_strings("must_include"))
        .collect();
    let must_avoid: BTreeSet<String> = string_list(&map, "must_avoid")
        .into_iter()
        .chain(request.option_strings("must_avoid"))
        .collect();

    let mut metadata = std::collections::BTreeMap::new();
    metadata.insert("model".to_string(), json!(model_id));
    metadata.insert("parsed".to_string(), json!(parsed.is_some()));

    QueryUnderstandingResult {
        search_intent,
        keywords,
        must_include,
        must_avoid,
        metadata,
    }
}
