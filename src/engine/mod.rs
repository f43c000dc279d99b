pub mod health;
pub mod metrics;
pub mod orchestrator;

pub use health::{ComponentsHealth, HealthReport, ModelHealth};
pub use metrics::{EngineMetrics, PerformanceSnapshot};
pub use orchestrator::{OrchestratorBuilder, PipelineOrchestrator};
