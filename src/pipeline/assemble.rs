//! Budgeted context assembly.
//!
//! Builds the bundle the director and writer consume: formatted memories,
//! a conversation-history window, creative hints, and merged preferences.
//! When the serialized bundle exceeds the tier's context budget, the
//! lowest-scoring memories are dropped one at a time. Query fields are
//! never touched by trimming.

use serde_json::{Value, json};
use std::collections::BTreeMap;

use crate::tier::TierLimits;
use crate::types::{
    AssembledContext, AssemblyMetadata, ContextSummary, CreativeContext, EngineRequest,
    FieldAnalysis, FormattedMemory, HistorySummary, QueryUnderstandingResult, RetrievedMemory,
    UsageSuggestion, payload_len,
};

const ELLIPSIS: &str = "...";
const SUMMARY_SNIPPET_CHARS: usize = 60;
const SUMMARY_MAX_TURNS: usize = 3;

/// Request options that steer the pipeline rather than the prose.
const CONTROL_OPTIONS: [&str; 3] = ["must_include", "must_avoid", "filters"];

pub struct ContextAssembler {
    memory_display_chars: usize,
    history_turns: usize,
}

impl ContextAssembler {
    pub fn new(memory_display_chars: usize, history_turns: usize) -> Self {
        Self {
            memory_display_chars: memory_display_chars.max(1),
            history_turns,
        }
    }

    pub fn assemble(
        &self,
        request: &EngineRequest,
        query: &QueryUnderstandingResult,
        mut memories: Vec<RetrievedMemory>,
        limits: &TierLimits,
    ) -> AssembledContext {
        let total_memories = memories.len();

        memories.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        memories.truncate(limits.max_memories);
        let mut formatted: Vec<FormattedMemory> =
            memories.iter().map(|m| self.format_memory(m)).collect();

        let history = self.summarize_history(request);
        let creative = extract_creative(request, query);
        let preferences = merge_preferences(request, limits);

        let size = |memories: &[FormattedMemory]| {
            payload_len(
                request.user_query(),
                query,
                memories,
                &history,
                &creative,
                &preferences,
            )
        };

        let mut context_length = size(&formatted);
        let mut trimmed = false;
        while context_length > limits.max_context_length && formatted.len() > 1 {
            formatted.pop();
            trimmed = true;
            context_length = size(&formatted);
        }
        if trimmed {
            tracing::debug!(
                kept = formatted.len(),
                context_length,
                budget = limits.max_context_length,
                "trimmed memories to fit context budget"
            );
        }

        let metadata = AssemblyMetadata {
            total_memories,
            included_memories: formatted.len(),
            dropped_memories: total_memories - formatted.len(),
            context_length,
            max_context_length: limits.max_context_length,
            trimmed,
        };
        let summary = build_summary(query, &formatted, &history, &creative, &preferences);

        AssembledContext {
            user_query: request.user_query().to_string(),
            query: query.clone(),
            memories: formatted,
            history,
            creative,
            preferences,
            metadata,
            summary,
        }
    }

    fn format_memory(&self, memory: &RetrievedMemory) -> FormattedMemory {
        let (content, truncated) = truncate_chars(&memory.content, self.memory_display_chars);
        FormattedMemory {
            id: memory.id.clone(),
            content,
            score: memory.score,
            usage_suggestion: UsageSuggestion::from_score(memory.score),
            source: memory.source().map(ToString::to_string),
            truncated,
        }
    }

    fn summarize_history(&self, request: &EngineRequest) -> HistorySummary {
        let turns = &request.context().conversation_history;
        let split = turns.len().saturating_sub(self.history_turns);
        let (earlier, recent) = turns.split_at(split);

        let earlier_summary = (!earlier.is_empty()).then(|| {
            let skipped = earlier.len().saturating_sub(SUMMARY_MAX_TURNS);
            let snippets: Vec<String> = earlier[skipped..]
                .iter()
                .map(|t| format!("{}: {}", t.role, truncate_chars(&t.content, SUMMARY_SNIPPET_CHARS).0))
                .collect();
            format!("{} earlier turns; last of them: {}", earlier.len(), snippets.join(" | "))
        });

        HistorySummary {
            recent_turns: recent.to_vec(),
            earlier_turns: earlier.len(),
            earlier_summary,
        }
    }
}

/// First `max` characters plus an ellipsis when anything was cut.
fn truncate_chars(text: &str, max: usize) -> (String, bool) {
    match text.char_indices().nth(max) {
        Some((byte_index, _)) => (format!("{}{ELLIPSIS}", &text[..byte_index]), true),
        None => (text.to_string(), false),
    }
}

fn analyse(text: &str, keywords: &[String]) -> FieldAnalysis {
    let lowered = text.to_lowercase();
    FieldAnalysis {
        chars: text.chars().count(),
        words: text.split_whitespace().count(),
        detected_keywords: keywords
            .iter()
            .filter(|k| lowered.contains(&k.to_lowercase()))
            .cloned()
            .collect(),
    }
}

fn extract_creative(request: &EngineRequest, query: &QueryUnderstandingResult) -> CreativeContext {
    let context = request.context();
    let mut analysis = BTreeMap::new();

    if !context.characters.is_empty() {
        analysis.insert(
            "characters".to_string(),
            analyse(&context.characters.join(", "), &query.keywords),
        );
    }
    let fields = [
        ("setting", &context.setting),
        ("plot_requirements", &context.plot_requirements),
        ("style", &context.style),
        ("continuation", &context.last_excerpt),
    ];
    for (name, value) in fields {
        if let Some(text) = value
            && !text.trim().is_empty()
        {
            analysis.insert(name.to_string(), analyse(text, &query.keywords));
        }
    }

    CreativeContext {
        characters: context.characters.clone(),
        setting: context.setting.clone(),
        plot_requirements: context.plot_requirements.clone(),
        style: context.style.clone(),
        continuation: context.last_excerpt.clone(),
        hints: context
            .extra
            .iter()
            .filter(|(_, v)| !v.trim().is_empty())
            .map(|(k, v)| (k.clone(), v.trim().to_string()))
            .collect(),
        analysis,
    }
}

/// Tier defaults overlaid with the request's own options.
fn merge_preferences(request: &EngineRequest, limits: &TierLimits) -> BTreeMap<String, Value> {
    let mut preferences = BTreeMap::new();
    preferences.insert("target_length".to_string(), json!(limits.target_length));
    for (key, value) in request.options() {
        if !CONTROL_OPTIONS.contains(&key.as_str()) {
            preferences.insert(key.clone(), value.clone());
        }
    }
    preferences
}

fn build_summary(
    query: &QueryUnderstandingResult,
    memories: &[FormattedMemory],
    history: &HistorySummary,
    creative: &CreativeContext,
    preferences: &BTreeMap<String, Value>,
) -> ContextSummary {
    let mut goals = Vec::new();
    if let Some(length) = preferences.get("target_length") {
        goals.push(format!("about {length} characters"));
    }
    if let Some(style) = &creative.style {
        goals.push(format!("match style: {style}"));
    }
    if creative.continuation.is_some() {
        goals.push("continue from the last excerpt".to_string());
    }
    if !query.must_include.is_empty() {
        goals.push("cover every required element".to_string());
    }

    ContextSummary {
        focus: query.search_intent.clone(),
        available_memories: memories.len(),
        recent_turns: history.recent_turns.len(),
        creative_fields: creative.analysis.keys().cloned().collect(),
        must_include: query.must_include.iter().cloned().collect(),
        must_avoid: query.must_avoid.iter().cloned().collect(),
        goals,
    }
}
