//! Request lifecycle: validate, understand, retrieve, assemble, plan,
//! write, check, respond.
//!
//! Every public entry point returns a well-formed result. Stage errors and
//! panics are caught here and turned into error responses (or a failed
//! terminal chunk for streams), so one bad request never takes the engine
//! down with it.

use futures_util::{FutureExt, Stream, StreamExt, stream};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

use super::health::{ComponentsHealth, HealthReport, overall_status, probe_model};
use super::metrics::EngineMetrics;
use crate::config::{
    Component, EngineConfig, EngineSettings, ModelConfig, ModelRegistry, ModelSnapshot,
    PromptOverrides,
};
use crate::embedding::{
    EmbeddingBackend, EmbeddingHealth, KeywordSearch, VectorEmbeddingService, VectorStore,
};
use crate::error::{ConfigError, EngineError, ExternalServiceError, ValidationError};
use crate::llm::{ChatBackend, ChatBackendFactory, HttpChatFactory};
use crate::pipeline::{
    ConsistencyChecker, ContextAssembler, Planner, PromptSet, QueryUnderstander, Retriever,
    TextStream, Writer,
};
use crate::tier::{TierLimits, TierPolicy, UserTier};
use crate::types::{
    AssembledContext, ERROR_MARKER, EngineRequest, EngineResponse, ErrorInfo, GenerationPlan,
    HealthState, QueryUnderstandingResult, ResponseDebug, RetrievedMemory, Stage, StreamChunk,
};
use crate::usage::{TracingUsageSink, UsageRecord, UsageSink};

const STAGE_ORDER: [Stage; 8] = [
    Stage::Validate,
    Stage::Understand,
    Stage::Retrieve,
    Stage::Assemble,
    Stage::Plan,
    Stage::Write,
    Stage::Check,
    Stage::Respond,
];

type StageResult<T> = Result<T, (Stage, EngineError)>;

/// Everything produced before the writer runs.
struct Prepared {
    limits: TierLimits,
    snapshot: Arc<ModelSnapshot>,
    query: QueryUnderstandingResult,
    memories: Vec<RetrievedMemory>,
    context: AssembledContext,
    plan: GenerationPlan,
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn mark(debug: &mut ResponseDebug, stage: Stage, started: Instant) {
    let ms = elapsed_ms(started);
    debug.timings_ms.insert(stage.to_string(), ms);
    tracing::debug!(%stage, elapsed_ms = ms, "stage finished");
}

/// First stage without a recorded timing, i.e. the one that was running.
fn running_stage(debug: &ResponseDebug) -> Stage {
    STAGE_ORDER
        .into_iter()
        .find(|s| !debug.timings_ms.contains_key(&s.to_string()))
        .unwrap_or(Stage::Respond)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "stage panicked".to_string()
    }
}

fn validate(request: &EngineRequest, max_len: usize) -> Result<(), ValidationError> {
    let query = request.user_query();
    if query.trim().is_empty() {
        return Err(ValidationError::EmptyQuery);
    }
    let length = query.chars().count();
    if length > max_len {
        return Err(ValidationError::QueryTooLong {
            length,
            max: max_len,
        });
    }
    Ok(())
}

pub struct PipelineOrchestrator {
    settings: EngineSettings,
    tiers: TierPolicy,
    registry: ModelRegistry,
    embeddings: Arc<VectorEmbeddingService>,
    understander: QueryUnderstander,
    retriever: Retriever,
    assembler: ContextAssembler,
    planner: Planner,
    writer: Writer,
    checker: ConsistencyChecker,
    usage: Arc<dyn UsageSink>,
    metrics: EngineMetrics,
}

impl PipelineOrchestrator {
    pub fn builder(
        default_chat: Arc<dyn ChatBackend>,
        embedding: Arc<dyn EmbeddingBackend>,
        store: Arc<dyn VectorStore>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder::new(default_chat, embedding, store)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn limits_for(&self, tier: UserTier) -> &TierLimits {
        self.tiers.limits_for(tier)
    }

    pub fn embeddings(&self) -> &Arc<VectorEmbeddingService> {
        &self.embeddings
    }

    pub fn model_snapshot(&self) -> Arc<ModelSnapshot> {
        self.registry.snapshot()
    }

    // ── Batch ────────────────────────────────────────────────

    pub async fn generate(&self, request: &EngineRequest, tier: UserTier) -> EngineResponse {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();
        let mut debug = ResponseDebug::new(request_id.clone(), tier);
        let span = tracing::info_span!("generate", request_id = request_id.as_str(), %tier);

        let outcome = AssertUnwindSafe(self.run(request, tier, &mut debug))
            .catch_unwind()
            .instrument(span)
            .await;

        let response = match outcome {
            Ok(Ok(content)) => {
                debug.finished_at = Some(chrono::Utc::now());
                EngineResponse { content, debug }
            }
            Ok(Err((stage, err))) => error_response(debug, stage, &err),
            Err(payload) => {
                let stage = running_stage(&debug);
                let err = EngineError::pipeline(stage, panic_message(payload.as_ref()));
                tracing::error!(request_id = request_id.as_str(), %stage, "stage panicked");
                error_response(debug, stage, &err)
            }
        };

        self.finish(tier, request.user_query(), &response, false, started);
        response
    }

    async fn run(
        &self,
        request: &EngineRequest,
        tier: UserTier,
        debug: &mut ResponseDebug,
    ) -> StageResult<String> {
        let prepared = self.prepare(request, tier, debug).await?;

        let t = Instant::now();
        let writer_model = prepared.snapshot.resolve(Component::Writer, &prepared.limits);
        debug.model = Some(writer_model.model_id.clone());
        let content = self
            .writer
            .write(
                &prepared.context,
                &prepared.plan,
                &prepared.limits,
                &writer_model,
            )
            .await
            .map_err(|e| (Stage::Write, e))?;
        mark(debug, Stage::Write, t);

        let t = Instant::now();
        let checker_model = prepared
            .snapshot
            .resolve(Component::Consistency, &prepared.limits);
        debug.consistency_issues = self
            .checker
            .check(
                &content,
                &prepared.context,
                &prepared.memories,
                &prepared.limits,
                &checker_model,
            )
            .await;
        mark(debug, Stage::Check, t);

        debug.plan = Some(prepared.plan);
        mark(debug, Stage::Respond, Instant::now());
        Ok(content)
    }

    /// Validate through plan. Shared by batch and streaming generation.
    async fn prepare(
        &self,
        request: &EngineRequest,
        tier: UserTier,
        debug: &mut ResponseDebug,
    ) -> StageResult<Prepared> {
        let t = Instant::now();
        validate(request, self.settings.max_query_length)
            .map_err(|e| (Stage::Validate, e.into()))?;
        mark(debug, Stage::Validate, t);

        let limits = self.tiers.limits_for(tier).clone();
        let snapshot = self.registry.snapshot();

        let t = Instant::now();
        let model = snapshot.resolve(Component::Understanding, &limits);
        let query = self
            .understander
            .understand(request, &limits, &model)
            .await
            .map_err(|e| (Stage::Understand, e))?;
        mark(debug, Stage::Understand, t);

        let t = Instant::now();
        let memories = self.retriever.retrieve(&query, request, &limits).await;
        debug.memory_ids = memories.iter().map(|m| m.id.clone()).collect();
        mark(debug, Stage::Retrieve, t);

        let t = Instant::now();
        let context = self
            .assembler
            .assemble(request, &query, memories.clone(), &limits);
        debug.assembly = Some(context.metadata.clone());
        mark(debug, Stage::Assemble, t);

        let t = Instant::now();
        let model = snapshot.resolve(Component::Director, &limits);
        let plan = self
            .planner
            .plan(request, &query, &context.memories, &limits, &model)
            .await;
        mark(debug, Stage::Plan, t);

        Ok(Prepared {
            limits,
            snapshot,
            query,
            memories,
            context,
            plan,
        })
    }

    fn finish(
        &self,
        tier: UserTier,
        query: &str,
        response: &EngineResponse,
        streamed: bool,
        started: Instant,
    ) {
        let latency_ms = elapsed_ms(started);
        self.metrics.record_request(latency_ms, !response.is_error());
        let record = UsageRecord::from_response(tier, query, response, streamed, latency_ms);
        let recorded = std::panic::catch_unwind(AssertUnwindSafe(|| self.usage.record(record)));
        if let Err(payload) = recorded {
            tracing::error!(
                request_id = response.debug.request_id.as_str(),
                "usage sink panicked: {}",
                panic_message(payload.as_ref())
            );
        }
    }

    /// Independent requests, at most `batch_concurrency` in flight. Output
    /// order matches input order.
    pub async fn generate_batch(
        &self,
        requests: &[EngineRequest],
        tier: UserTier,
    ) -> Vec<EngineResponse> {
        stream::iter(requests)
            .map(|request| self.generate(request, tier))
            .buffered(self.settings.batch_concurrency.max(1))
            .collect()
            .await
    }

    // ── Streaming ────────────────────────────────────────────

    /// Prepares eagerly on first poll, then yields writer output as it
    /// arrives. The last item always has `done = true`; a failure is
    /// reported in that item's `error`. Dropping the stream stops the
    /// writer.
    pub fn generate_stream(
        &self,
        request: EngineRequest,
        tier: UserTier,
    ) -> impl Stream<Item = StreamChunk> + Send + '_ {
        async_stream::stream! {
            let started = Instant::now();
            self.metrics.record_stream();
            let request_id = Uuid::new_v4().to_string();
            let mut debug = ResponseDebug::new(request_id.clone(), tier);
            let span = tracing::info_span!("generate_stream", request_id = request_id.as_str(), %tier);

            let opened = AssertUnwindSafe(self.open_stream(&request, tier, &mut debug))
                .catch_unwind()
                .instrument(span)
                .await;
            let (mut text, prepared) = match opened {
                Ok(Ok(opened)) => opened,
                Ok(Err((stage, err))) => {
                    let response = error_response(debug, stage, &err);
                    self.finish(tier, request.user_query(), &response, true, started);
                    yield StreamChunk::failed(response.content);
                    return;
                }
                Err(payload) => {
                    let stage = running_stage(&debug);
                    let err = EngineError::pipeline(stage, panic_message(payload.as_ref()));
                    let response = error_response(debug, stage, &err);
                    self.finish(tier, request.user_query(), &response, true, started);
                    yield StreamChunk::failed(response.content);
                    return;
                }
            };

            let mut content = String::new();
            loop {
                match AssertUnwindSafe(text.next()).catch_unwind().await {
                    Ok(Some(Ok(chunk))) => {
                        content.push_str(&chunk);
                        yield StreamChunk::text(chunk);
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        let response = error_response(debug, Stage::Write, &e.into());
                        self.finish(tier, request.user_query(), &response, true, started);
                        yield StreamChunk::failed(response.content);
                        return;
                    }
                    Err(payload) => {
                        let err = EngineError::pipeline(Stage::Write, panic_message(payload.as_ref()));
                        let response = error_response(debug, Stage::Write, &err);
                        self.finish(tier, request.user_query(), &response, true, started);
                        yield StreamChunk::failed(response.content);
                        return;
                    }
                }
            }

            if content.trim().is_empty() {
                let err: EngineError =
                    ExternalServiceError::failed("writer", "model returned no content").into();
                let response = error_response(debug, Stage::Write, &err);
                self.finish(tier, request.user_query(), &response, true, started);
                yield StreamChunk::failed(response.content);
                return;
            }

            let issues = crate::pipeline::check_rules(&content, &prepared.query, &prepared.memories);
            if !issues.is_empty() {
                tracing::warn!(request_id = request_id.as_str(), issues = issues.len(), "streamed content breaks request constraints");
            }
            debug.consistency_issues = issues;
            debug.plan = Some(prepared.plan);
            debug.finished_at = Some(chrono::Utc::now());
            let response = EngineResponse { content, debug };
            self.finish(tier, request.user_query(), &response, true, started);
            yield StreamChunk::done();
        }
    }

    async fn open_stream(
        &self,
        request: &EngineRequest,
        tier: UserTier,
        debug: &mut ResponseDebug,
    ) -> StageResult<(TextStream, Prepared)> {
        let prepared = self.prepare(request, tier, debug).await?;
        let model = prepared.snapshot.resolve(Component::Writer, &prepared.limits);
        debug.model = Some(model.model_id.clone());
        let text = self
            .writer
            .stream_write(&prepared.context, &prepared.plan, &prepared.limits, &model)
            .await
            .map_err(|e| (Stage::Write, e))?;
        Ok((text, prepared))
    }

    // ── Configuration ────────────────────────────────────────

    /// Swap in a new model for one component. Invalid configs are rejected
    /// with `false` and leave the current configuration in effect.
    pub fn set_model_config(
        &self,
        component: Component,
        model_id: &str,
        config: &ModelConfig,
    ) -> bool {
        match self.registry.set_model_config(component, model_id, config) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(%component, "model config rejected: {e}");
                false
            }
        }
    }

    // ── Health ───────────────────────────────────────────────

    pub async fn get_health_status(&self) -> HealthReport {
        match AssertUnwindSafe(self.collect_health()).catch_unwind().await {
            Ok(report) => report,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!("health check panicked: {message}");
                HealthReport {
                    overall: HealthState::Unhealthy,
                    components: ComponentsHealth {
                        embedding: EmbeddingHealth {
                            status: HealthState::Unhealthy,
                            backend: self.embeddings.backend_name().to_string(),
                            dimension: None,
                            latency_ms: 0,
                            error: Some(message.clone()),
                        },
                        config_version: self.registry.snapshot().version(),
                    },
                    models: Vec::new(),
                    performance: self.metrics.snapshot(),
                    checked_at: chrono::Utc::now(),
                    error: Some(message),
                }
            }
        }
    }

    async fn collect_health(&self) -> HealthReport {
        let timeout = Duration::from_secs(self.settings.health_timeout_secs.max(1));
        let snapshot = self.registry.snapshot();
        let limits = self.tiers.limits_for(UserTier::Free);
        let resolved: Vec<_> = Component::ALL
            .into_iter()
            .map(|c| snapshot.resolve(c, limits))
            .collect();

        let probes = futures_util::future::join_all(resolved.iter().map(|m| probe_model(m, timeout)));
        let (embedding, models) = tokio::join!(self.embeddings.health_check(), probes);

        let overall = overall_status(embedding.status, &models);
        if overall != HealthState::Healthy {
            tracing::warn!(%overall, "engine health check");
        }
        HealthReport {
            overall,
            components: ComponentsHealth {
                embedding,
                config_version: snapshot.version(),
            },
            models,
            performance: self.metrics.snapshot(),
            checked_at: chrono::Utc::now(),
            error: None,
        }
    }
}

fn error_response(mut debug: ResponseDebug, stage: Stage, err: &EngineError) -> EngineResponse {
    let message = err.to_string();
    let request_id = debug.request_id.as_str();
    tracing::warn!(
        request_id,
        %stage,
        kind = err.kind(),
        "request failed: {message}"
    );
    debug.error = Some(ErrorInfo {
        kind: err.kind().to_string(),
        stage: Some(stage),
        message: message.clone(),
    });
    debug.finished_at = Some(chrono::Utc::now());
    EngineResponse {
        content: format!("{ERROR_MARKER} {message}"),
        debug,
    }
}

// ── Builder ──────────────────────────────────────────────────

/// Wires ports into a [`PipelineOrchestrator`]. Only the default chat
/// backend, embedding backend, and vector store are required.
pub struct OrchestratorBuilder {
    default_chat: Arc<dyn ChatBackend>,
    embedding: Arc<dyn EmbeddingBackend>,
    store: Arc<dyn VectorStore>,
    keyword_search: Option<Arc<dyn KeywordSearch>>,
    factory: Arc<dyn ChatBackendFactory>,
    usage: Arc<dyn UsageSink>,
    settings: EngineSettings,
    tiers: TierPolicy,
    prompts: PromptOverrides,
    default_temperature: f64,
    index_timeout: Duration,
    model_overrides: Vec<(Component, ModelConfig)>,
}

impl OrchestratorBuilder {
    pub fn new(
        default_chat: Arc<dyn ChatBackend>,
        embedding: Arc<dyn EmbeddingBackend>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            default_chat,
            embedding,
            store,
            keyword_search: None,
            factory: Arc::new(HttpChatFactory::default()),
            usage: Arc::new(TracingUsageSink),
            settings: EngineSettings::default(),
            tiers: TierPolicy::default(),
            prompts: PromptOverrides::default(),
            default_temperature: 0.8,
            index_timeout: Duration::from_secs(30),
            model_overrides: Vec::new(),
        }
    }

    /// Settings, tiers, prompts, retry policy and per-component models from
    /// a loaded config file.
    pub fn config(mut self, config: &EngineConfig) -> Self {
        self.settings = config.engine.clone();
        self.tiers = config.tiers.clone();
        self.prompts = config.prompts.clone();
        self.default_temperature = config.chat.temperature;
        self.factory = Arc::new(HttpChatFactory {
            max_retries: config.chat.max_retries,
            backoff_ms: config.chat.backoff_ms,
        });
        self.model_overrides = config
            .models
            .iter()
            .map(|(component, model)| (*component, model.clone()))
            .collect();
        self
    }

    pub fn keyword_search(mut self, index: Arc<dyn KeywordSearch>) -> Self {
        self.keyword_search = Some(index);
        self
    }

    pub fn backend_factory(mut self, factory: Arc<dyn ChatBackendFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage = sink;
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn tiers(mut self, tiers: TierPolicy) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn prompts(mut self, prompts: PromptOverrides) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn default_temperature(mut self, temperature: f64) -> Self {
        self.default_temperature = temperature;
        self
    }

    pub fn index_timeout(mut self, timeout: Duration) -> Self {
        self.index_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<PipelineOrchestrator, ConfigError> {
        self.tiers.validate()?;
        if self.settings.batch_concurrency == 0 {
            return Err(ConfigError::Validation(
                "engine.batch_concurrency must be at least 1".into(),
            ));
        }
        if self.settings.max_query_length == 0 {
            return Err(ConfigError::Validation(
                "engine.max_query_length must be at least 1".into(),
            ));
        }

        let prompts = Arc::new(PromptSet::with_overrides(&self.prompts)?);
        let registry = ModelRegistry::new(self.default_chat, self.default_temperature, self.factory);
        for (component, config) in &self.model_overrides {
            let model_id = config
                .model_id
                .as_deref()
                .ok_or_else(|| ConfigError::MissingCredential {
                    component: component.to_string(),
                    field: "model_id",
                })?;
            registry.set_model_config(*component, model_id, config)?;
        }

        let embeddings = Arc::new(
            VectorEmbeddingService::new(self.embedding, self.store).with_timeouts(
                self.index_timeout,
                Duration::from_secs(self.settings.health_timeout_secs.max(1)),
            ),
        );

        Ok(PipelineOrchestrator {
            understander: QueryUnderstander::new(Arc::clone(&prompts)),
            retriever: Retriever::new(Arc::clone(&embeddings), self.keyword_search),
            assembler: ContextAssembler::new(
                self.settings.memory_display_chars,
                self.settings.history_turns,
            ),
            planner: Planner::new(Arc::clone(&prompts)),
            writer: Writer::new(Arc::clone(&prompts)),
            checker: ConsistencyChecker::new(prompts),
            settings: self.settings,
            tiers: self.tiers,
            registry,
            embeddings,
            usage: self.usage,
            metrics: EngineMetrics::new(),
        })
    }
}
