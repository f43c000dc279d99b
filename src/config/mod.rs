pub mod loader;
pub mod registry;
pub mod schema;

pub use loader::default_config_path;
pub use registry::{ModelRegistry, ModelSnapshot, ResolvedModel};
pub use schema::{
    ChatConfig, Component, EmbeddingConfig, EngineConfig, EngineSettings, ModelConfig,
    PromptOverrides,
};
