//! Post-generation consistency checks.
//!
//! Rule checks are plain string matching against the request constraints
//! and memory metadata. The semantic check asks a model to compare the
//! passage with the background; its failure only means fewer issues.
//! Neither phase changes the generated content.

use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tera::Context;

use super::prompts::{CONSISTENCY_SYSTEM, PromptSet, extract_json_object};
use crate::config::{Component, ResolvedModel};
use crate::llm::with_timeout;
use crate::tier::TierLimits;
use crate::types::{
    AssembledContext, ConsistencyIssue, IssueKind, QueryUnderstandingResult, RetrievedMemory,
    Severity,
};

/// Memory metadata: comma-separated terms the memory's facts rule out.
pub const AVOID_TERMS_KEY: &str = "avoid_terms";
/// Memory metadata: which issue kind a contradiction of the memory is.
pub const CATEGORY_KEY: &str = "category";

pub struct ConsistencyChecker {
    prompts: Arc<PromptSet>,
}

impl ConsistencyChecker {
    pub fn new(prompts: Arc<PromptSet>) -> Self {
        Self { prompts }
    }

    /// Both phases, rule issues first.
    pub async fn check(
        &self,
        content: &str,
        context: &AssembledContext,
        memories: &[RetrievedMemory],
        limits: &TierLimits,
        model: &ResolvedModel,
    ) -> Vec<ConsistencyIssue> {
        let mut issues = check_rules(content, &context.query, memories);
        issues.extend(self.check_semantic(content, context, limits, model).await);
        issues
    }

    pub async fn check_semantic(
        &self,
        content: &str,
        context: &AssembledContext,
        limits: &TierLimits,
        model: &ResolvedModel,
    ) -> Vec<ConsistencyIssue> {
        let mut ctx = Context::new();
        ctx.insert("content", content);
        ctx.insert("memories", &context.memories);
        let prompt = match self.prompts.render(Component::Consistency, &ctx) {
            Ok(prompt) => prompt,
            Err(e) => {
                tracing::warn!("consistency prompt failed to render: {e:#}");
                return Vec::new();
            }
        };

        match with_timeout(
            "consistency",
            limits.call_timeout(),
            model.backend.generate_text(
                Some(CONSISTENCY_SYSTEM),
                &prompt,
                &model.model_id,
                model.temperature,
            ),
        )
        .await
        {
            Ok(reply) => parse_issues(&reply),
            Err(e) => {
                tracing::warn!("semantic consistency check skipped: {e}");
                Vec::new()
            }
        }
    }
}

fn contains_ci(haystack_lower: &str, needle: &str) -> bool {
    let needle = needle.trim().to_lowercase();
    !needle.is_empty() && haystack_lower.contains(&needle)
}

pub fn check_rules(
    content: &str,
    query: &QueryUnderstandingResult,
    memories: &[RetrievedMemory],
) -> Vec<ConsistencyIssue> {
    let lowered = content.to_lowercase();
    let mut issues = Vec::new();

    for required in &query.must_include {
        if !contains_ci(&lowered, required) && !required.trim().is_empty() {
            issues.push(ConsistencyIssue {
                kind: IssueKind::Rule,
                severity: Severity::Medium,
                description: format!("required element \"{required}\" does not appear"),
                related_memory_id: None,
            });
        }
    }

    for banned in &query.must_avoid {
        if contains_ci(&lowered, banned) {
            issues.push(ConsistencyIssue {
                kind: IssueKind::Rule,
                severity: Severity::High,
                description: format!("excluded element \"{banned}\" appears"),
                related_memory_id: None,
            });
        }
    }

    for memory in memories {
        let Some(terms) = memory.meta.get(AVOID_TERMS_KEY) else {
            continue;
        };
        let kind = memory
            .meta
            .get(CATEGORY_KEY)
            .and_then(|c| IssueKind::from_str(c).ok())
            .unwrap_or(IssueKind::Worldview);
        for term in terms.split(',').filter(|t| contains_ci(&lowered, t)) {
            issues.push(ConsistencyIssue {
                kind,
                severity: Severity::High,
                description: format!(
                    "\"{}\" contradicts established {kind} fact {}",
                    term.trim(),
                    memory.id
                ),
                related_memory_id: Some(memory.id.clone()),
            });
        }
    }

    issues
}

/// Lenient parse of `{"issues": [...]}`. Entries without a description
/// are dropped; unknown kinds or severities fall back to worldview/medium.
pub(crate) fn parse_issues(reply: &str) -> Vec<ConsistencyIssue> {
    let Some(map) = extract_json_object(reply) else {
        tracing::warn!("consistency reply was not JSON; no semantic issues recorded");
        return Vec::new();
    };
    let Some(Value::Array(items)) = map.get("issues") else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let description = item.get("description")?.as_str()?.trim();
            if description.is_empty() {
                return None;
            }
            let text = |key: &str| item.get(key).and_then(Value::as_str);
            Some(ConsistencyIssue {
                kind: text("type")
                    .and_then(|s| IssueKind::from_str(s).ok())
                    .unwrap_or(IssueKind::Worldview),
                severity: text("severity")
                    .and_then(|s| Severity::from_str(s).ok())
                    .unwrap_or(Severity::Medium),
                description: description.to_string(),
                related_memory_id: text("related_memory_id")
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string),
            })
        })
        .collect()
}
