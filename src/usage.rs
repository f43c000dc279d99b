//! Usage logging. Sinks are fire-and-forget: recording never blocks and
//! never fails the request that produced the record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::tier::UserTier;
use crate::types::EngineResponse;

const QUERY_PREVIEW_CHARS: usize = 200;
const SUMMARY_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub tier: UserTier,
    pub query: String,
    pub response_summary: String,
    pub success: bool,
    pub streamed: bool,
    pub model: Option<String>,
    pub latency_ms: u64,
    pub created_at: DateTime<Utc>,
}

fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

impl UsageRecord {
    pub fn from_response(
        tier: UserTier,
        query: &str,
        response: &EngineResponse,
        streamed: bool,
        latency_ms: u64,
    ) -> Self {
        let response_summary = match &response.debug.error {
            Some(error) => format!("{}: {}", error.kind, error.message),
            None => preview(&response.content, SUMMARY_PREVIEW_CHARS),
        };
        Self {
            request_id: response.debug.request_id.clone(),
            tier,
            query: preview(query, QUERY_PREVIEW_CHARS),
            response_summary: preview(&response_summary, SUMMARY_PREVIEW_CHARS),
            success: !response.is_error(),
            streamed,
            model: response.debug.model.clone(),
            latency_ms,
            created_at: Utc::now(),
        }
    }
}

pub trait UsageSink: Send + Sync {
    fn record(&self, record: UsageRecord);
}

/// Emits each record as an `info` event on the `storyloom::usage` target.
pub struct TracingUsageSink;

impl UsageSink for TracingUsageSink {
    fn record(&self, record: UsageRecord) {
        tracing::info!(
            target: "storyloom::usage",
            request_id = record.request_id.as_str(),
            tier = %record.tier,
            success = record.success,
            streamed = record.streamed,
            latency_ms = record.latency_ms,
            model = record.model.as_deref().unwrap_or("-"),
            query = record.query.as_str(),
            "{}",
            record.response_summary
        );
    }
}

/// Hands records to a consumer task over a bounded channel. When the
/// consumer falls behind or has gone away, records are dropped.
pub struct ChannelUsageSink {
    tx: mpsc::Sender<UsageRecord>,
}

impl ChannelUsageSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<UsageRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl UsageSink for ChannelUsageSink {
    fn record(&self, record: UsageRecord) {
        if let Err(e) = self.tx.try_send(record) {
            tracing::debug!("usage record dropped: {e}");
        }
    }
}

pub struct NullUsageSink;

impl UsageSink for NullUsageSink {
    fn record(&self, _record: UsageRecord) {}
}
