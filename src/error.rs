use thiserror::Error;

use crate::types::Stage;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for the engine.
///
/// Stage boundaries convert adapter failures into one of these variants so the
/// orchestrator can decide between degrading and aborting. Adapters themselves
/// keep using `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum EngineError {
    // ── Request validation ──────────────────────────────────────────────
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),

    // ── Chat / embedding / vector store ─────────────────────────────────
    #[error("external service: {0}")]
    ExternalService(#[from] ExternalServiceError),

    // ── Anything else that escaped a stage ──────────────────────────────
    #[error("pipeline stage {stage} failed: {message}")]
    Pipeline { stage: Stage, message: String },

    // ── Model configuration ─────────────────────────────────────────────
    #[error("configuration: {0}")]
    Configuration(#[from] ConfigError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn pipeline(stage: Stage, message: impl Into<String>) -> Self {
        Self::Pipeline {
            stage,
            message: message.into(),
        }
    }

    /// Stable tag recorded in `EngineResponse.debug.error.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::ExternalService(_) => "external_service_error",
            Self::Configuration(_) => "configuration_error",
            Self::Pipeline { .. } | Self::Other(_) => "pipeline_error",
        }
    }
}

// ─── Validation errors ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("user query is empty")]
    EmptyQuery,

    #[error("user query is {length} characters, limit is {max}")]
    QueryTooLong { length: usize, max: usize },
}

// ─── External service errors ────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum ExternalServiceError {
    #[error("{service} request failed: {message}")]
    Failed { service: String, message: String },

    #[error("{service} timed out after {timeout_ms}ms")]
    Timeout { service: String, timeout_ms: u64 },
}

impl ExternalServiceError {
    pub fn failed(service: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Failed {
            service: service.into(),
            message: err.to_string(),
        }
    }

    pub fn service(&self) -> &str {
        match self {
            Self::Failed { service, .. } | Self::Timeout { service, .. } => service,
        }
    }
}

// ─── Config errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("model config for {component} is missing {field}")]
    MissingCredential {
        component: String,
        field: &'static str,
    },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
