#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::unnecessary_literal_bound,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod tier;
pub mod types;
pub mod usage;

pub use config::EngineConfig;
pub use engine::{HealthReport, OrchestratorBuilder, PipelineOrchestrator};
pub use error::{EngineError, ExternalServiceError, ValidationError};
pub use tier::{TierLimits, TierPolicy, UserTier};
pub use types::{EngineRequest, EngineResponse, RequestContext, StreamChunk};
