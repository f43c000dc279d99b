//! Per-request data model. Every value here is created at the start of one
//! request/response cycle and dropped at its end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::tier::UserTier;

/// Prefix of `EngineResponse.content` whenever the request failed.
pub const ERROR_MARKER: &str = "[storyloom:error]";

/// Pipeline states, in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Validate,
    Understand,
    Retrieve,
    Assemble,
    Plan,
    Write,
    Check,
    Respond,
}

// ── Request ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Named hints supplied alongside the query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestContext {
    pub conversation_history: Vec<ConversationTurn>,
    pub characters: Vec<String>,
    pub setting: Option<String>,
    pub plot_requirements: Option<String>,
    pub style: Option<String>,
    pub last_excerpt: Option<String>,
    /// Free-form hints that have no dedicated field.
    pub extra: BTreeMap<String, String>,
}

/// One generation request. Fields are private so a request cannot change
/// once it has been handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineRequest {
    user_query: String,
    #[serde(default)]
    context: RequestContext,
    #[serde(default)]
    options: BTreeMap<String, Value>,
}

impl EngineRequest {
    pub fn new(user_query: impl Into<String>) -> Self {
        Self {
            user_query: user_query.into(),
            context: RequestContext::default(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn user_query(&self) -> &str {
        &self.user_query
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn options(&self) -> &BTreeMap<String, Value> {
        &self.options
    }

    /// String-list option such as `must_include`; ignores non-string entries.
    pub fn option_strings(&self, key: &str) -> Vec<String> {
        match self.options.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect(),
            Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
            _ => Vec::new(),
        }
    }
}

// ── Query understanding ──────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryUnderstandingResult {
    pub search_intent: String,
    /// Ordered, no duplicates.
    pub keywords: Vec<String>,
    pub must_include: BTreeSet<String>,
    pub must_avoid: BTreeSet<String>,
    pub metadata: BTreeMap<String, Value>,
}

// ── Retrieval ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedMemory {
    pub id: String,
    pub content: String,
    /// Relevance in `[0, 1]`.
    pub score: f32,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl RetrievedMemory {
    pub fn new(id: impl Into<String>, content: impl Into<String>, score: f32) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            score: score.clamp(0.0, 1.0),
            meta: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn source(&self) -> Option<&str> {
        self.meta
            .get("source_name")
            .or_else(|| self.meta.get("source_type"))
            .map(String::as_str)
    }
}

// ── Assembled context ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UsageSuggestion {
    HighRelevance,
    Contextual,
    Inspirational,
    Background,
}

impl UsageSuggestion {
    pub fn from_score(score: f32) -> Self {
        if score > 0.8 {
            Self::HighRelevance
        } else if score > 0.6 {
            Self::Contextual
        } else if score > 0.4 {
            Self::Inspirational
        } else {
            Self::Background
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormattedMemory {
    pub id: String,
    pub content: String,
    pub score: f32,
    pub usage_suggestion: UsageSuggestion,
    pub source: Option<String>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySummary {
    pub recent_turns: Vec<ConversationTurn>,
    pub earlier_turns: usize,
    pub earlier_summary: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldAnalysis {
    pub chars: usize,
    pub words: usize,
    pub detected_keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreativeContext {
    pub characters: Vec<String>,
    pub setting: Option<String>,
    pub plot_requirements: Option<String>,
    pub style: Option<String>,
    pub continuation: Option<String>,
    /// Free-form request hints, blank values removed.
    pub hints: BTreeMap<String, String>,
    pub analysis: BTreeMap<String, FieldAnalysis>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssemblyMetadata {
    /// Memories handed to the assembler before any capping.
    pub total_memories: usize,
    pub included_memories: usize,
    pub dropped_memories: usize,
    /// Serialized size in bytes of the context payload.
    pub context_length: usize,
    pub max_context_length: usize,
    pub trimmed: bool,
}

/// Derived convenience view; never authoritative.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub focus: String,
    pub available_memories: usize,
    pub recent_turns: usize,
    pub creative_fields: Vec<String>,
    pub must_include: Vec<String>,
    pub must_avoid: Vec<String>,
    pub goals: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledContext {
    pub user_query: String,
    pub query: QueryUnderstandingResult,
    pub memories: Vec<FormattedMemory>,
    pub history: HistorySummary,
    pub creative: CreativeContext,
    pub preferences: BTreeMap<String, Value>,
    pub metadata: AssemblyMetadata,
    pub summary: ContextSummary,
}

#[derive(Serialize)]
struct ContextPayload<'a> {
    user_query: &'a str,
    query: &'a QueryUnderstandingResult,
    memories: &'a [FormattedMemory],
    history: &'a HistorySummary,
    creative: &'a CreativeContext,
    preferences: &'a BTreeMap<String, Value>,
}

impl AssembledContext {
    /// Serialized byte size of everything the writer consumes. Metadata and
    /// the derived summary are bookkeeping and are not counted.
    pub fn serialized_len(&self) -> usize {
        payload_len(
            &self.user_query,
            &self.query,
            &self.memories,
            &self.history,
            &self.creative,
            &self.preferences,
        )
    }
}

pub(crate) fn payload_len(
    user_query: &str,
    query: &QueryUnderstandingResult,
    memories: &[FormattedMemory],
    history: &HistorySummary,
    creative: &CreativeContext,
    preferences: &BTreeMap<String, Value>,
) -> usize {
    let payload = ContextPayload {
        user_query,
        query,
        memories,
        history,
        creative,
        preferences,
    };
    serde_json::to_vec(&payload).map_or(usize::MAX, |bytes| bytes.len())
}

// ── Plan ─────────────────────────────────────────────────────

/// Director output. Opaque to everything except the writer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationPlan {
    pub directives: BTreeMap<String, Value>,
    /// Set when the director call failed and a fallback plan was used.
    #[serde(default)]
    pub fallback: bool,
}

// ── Consistency ──────────────────────────────────────────────

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum IssueKind {
    Worldview,
    Character,
    Event,
    Rule,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyIssue {
    #[serde(rename = "type")]
    pub kind: IssueKind,
    pub severity: Severity,
    pub description: String,
    pub related_memory_id: Option<String>,
}

// ── Response ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub stage: Option<Stage>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseDebug {
    pub request_id: String,
    pub tier: UserTier,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub timings_ms: BTreeMap<String, u64>,
    pub error: Option<ErrorInfo>,
    pub consistency_issues: Vec<ConsistencyIssue>,
    pub memory_ids: Vec<String>,
    pub assembly: Option<AssemblyMetadata>,
    pub plan: Option<GenerationPlan>,
    pub model: Option<String>,
}

impl ResponseDebug {
    pub fn new(request_id: String, tier: UserTier) -> Self {
        Self {
            request_id,
            tier,
            started_at: Utc::now(),
            finished_at: None,
            timings_ms: BTreeMap::new(),
            error: None,
            consistency_issues: Vec::new(),
            memory_ids: Vec::new(),
            assembly: None,
            plan: None,
            model: None,
        }
    }
}

/// Always carries `content`, including on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineResponse {
    pub content: String,
    pub debug: ResponseDebug,
}

impl EngineResponse {
    pub fn is_error(&self) -> bool {
        self.debug.error.is_some()
    }
}

// ── Health ───────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// One item of a streamed generation. The last item always has `done = true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub content: String,
    pub done: bool,
    pub error: Option<String>,
}

impl StreamChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            done: false,
            error: None,
        }
    }

    pub fn done() -> Self {
        Self {
            content: String::new(),
            done: true,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            done: true,
            error: Some(message.into()),
        }
    }
}
