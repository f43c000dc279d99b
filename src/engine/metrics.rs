use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-lifetime request counters. Lock-free; each counter is updated
/// independently, so a snapshot taken mid-request may be off by one.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    requests: AtomicU64,
    failures: AtomicU64,
    streams: AtomicU64,
    total_latency_ms: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSnapshot {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub stream_requests: u64,
    pub average_latency_ms: f64,
    pub success_rate: f64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, latency_ms: u64, success: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        if !success {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_stream(&self) {
        self.streams.fetch_add(1, Ordering::Relaxed);
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> PerformanceSnapshot {
        let total = self.requests.load(Ordering::Relaxed);
        let failed = self.failures.load(Ordering::Relaxed);
        let latency = self.total_latency_ms.load(Ordering::Relaxed);
        let (average_latency_ms, success_rate) = if total == 0 {
            (0.0, 1.0)
        } else {
            (
                latency as f64 / total as f64,
                total.saturating_sub(failed) as f64 / total as f64,
            )
        };
        PerformanceSnapshot {
            total_requests: total,
            failed_requests: failed,
            stream_requests: self.streams.load(Ordering::Relaxed),
            average_latency_ms,
            success_rate,
        }
    }
}
