use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::schema::{Component, ModelConfig};
use crate::error::ConfigError;
use crate::llm::{ChatBackend, ChatBackendFactory};
use crate::tier::TierLimits;

/// The chat model one component should use for one request.
#[derive(Clone)]
pub struct ResolvedModel {
    pub component: Component,
    pub backend: Arc<dyn ChatBackend>,
    pub model_id: String,
    pub temperature: f64,
}

impl std::fmt::Debug for ResolvedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedModel")
            .field("component", &self.component)
            .field("backend", &self.backend.name())
            .field("model_id", &self.model_id)
            .field("temperature", &self.temperature)
            .finish()
    }
}

#[derive(Clone)]
struct ComponentModel {
    backend: Arc<dyn ChatBackend>,
    model_id: String,
    temperature: Option<f64>,
}

/// Immutable view of every configured model. Requests load one snapshot at
/// their start and keep it until they finish.
#[derive(Clone)]
pub struct ModelSnapshot {
    version: u64,
    default_backend: Arc<dyn ChatBackend>,
    default_temperature: f64,
    overrides: BTreeMap<Component, ComponentModel>,
}

impl ModelSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_overridden(&self, component: Component) -> bool {
        self.overrides.contains_key(&component)
    }

    /// Component override if present, otherwise the default backend with
    /// the tier's default model.
    pub fn resolve(&self, component: Component, limits: &TierLimits) -> ResolvedModel {
        match self.overrides.get(&component) {
            Some(entry) => ResolvedModel {
                component,
                backend: Arc::clone(&entry.backend),
                model_id: entry.model_id.clone(),
                temperature: entry.temperature.unwrap_or(self.default_temperature),
            },
            None => ResolvedModel {
                component,
                backend: Arc::clone(&self.default_backend),
                model_id: limits.default_model.clone(),
                temperature: self.default_temperature,
            },
        }
    }
}

/// Process-wide model configuration, read on every request and written
/// rarely. Writers build the replacement snapshot off to the side and swap
/// it in whole.
pub struct ModelRegistry {
    inner: ArcSwap<ModelSnapshot>,
    factory: Arc<dyn ChatBackendFactory>,
}

impl ModelRegistry {
    pub fn new(
        default_backend: Arc<dyn ChatBackend>,
        default_temperature: f64,
        factory: Arc<dyn ChatBackendFactory>,
    ) -> Self {
        Self {
            inner: ArcSwap::from_pointee(ModelSnapshot {
                version: 0,
                default_backend,
                default_temperature,
                overrides: BTreeMap::new(),
            }),
            factory,
        }
    }

    /// Current snapshot. Lock-free.
    pub fn snapshot(&self) -> Arc<ModelSnapshot> {
        self.inner.load_full()
    }

    /// Validate `config`, build a backend for `component` only, and swap in a
    /// snapshot containing it. On error the active snapshot is untouched.
    pub fn set_model_config(
        &self,
        component: Component,
        model_id: &str,
        config: &ModelConfig,
    ) -> Result<u64, ConfigError> {
        let model_id = model_id.trim();
        if model_id.is_empty() {
            return Err(ConfigError::Validation(format!(
                "{component}: model id must not be empty"
            )));
        }
        config.validate(component)?;

        let backend = self
            .factory
            .create(&component.to_string(), config)
            .map_err(|e| ConfigError::Validation(format!("{component}: {e}")))?;
        let entry = ComponentModel {
            backend,
            model_id: model_id.to_string(),
            temperature: config.temperature,
        };

        let previous = self.inner.rcu(|current| {
            let mut next = ModelSnapshot::clone(current);
            next.version = current.version + 1;
            next.overrides.insert(component, entry.clone());
            next
        });
        let version = previous.version + 1;
        tracing::info!(%component, model = model_id, version, "model config swapped in");
        Ok(version)
    }
}
