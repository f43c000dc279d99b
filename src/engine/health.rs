use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};

use super::metrics::PerformanceSnapshot;
use crate::config::{Component, ResolvedModel};
use crate::embedding::EmbeddingHealth;
use crate::llm::with_timeout;
use crate::types::HealthState;

const PROBE_PROMPT: &str = "Reply with the single word: ok";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelHealth {
    pub component: Component,
    pub backend: String,
    pub model_id: String,
    pub status: HealthState,
    pub latency_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentsHealth {
    pub embedding: EmbeddingHealth,
    pub config_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub overall: HealthState,
    pub components: ComponentsHealth,
    pub models: Vec<ModelHealth>,
    pub performance: PerformanceSnapshot,
    pub checked_at: DateTime<Utc>,
    /// Set when the health check itself failed.
    pub error: Option<String>,
}

/// One cheap completion against a component's current model.
pub async fn probe_model(model: &ResolvedModel, timeout: Duration) -> ModelHealth {
    let started = Instant::now();
    let result = with_timeout(
        "health_probe",
        timeout,
        model
            .backend
            .generate_text(None, PROBE_PROMPT, &model.model_id, 0.0),
    )
    .await;
    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let (status, error) = match result {
        Ok(_) => (HealthState::Healthy, None),
        Err(e) => (HealthState::Unhealthy, Some(e.to_string())),
    };
    ModelHealth {
        component: model.component,
        backend: model.backend.name().to_string(),
        model_id: model.model_id.clone(),
        status,
        latency_ms,
        error,
    }
}

/// Unhealthy when embedding or a load-bearing model is down; degraded when
/// only an optional model is.
pub fn overall_status(embedding: HealthState, models: &[ModelHealth]) -> HealthState {
    if embedding == HealthState::Unhealthy {
        return HealthState::Unhealthy;
    }
    let mut overall = embedding;
    for model in models.iter().filter(|m| m.status != HealthState::Healthy) {
        if model.component.is_load_bearing() {
            return HealthState::Unhealthy;
        }
        overall = overall.max(HealthState::Degraded);
    }
    overall
}
