use std::sync::Arc;

use storyloom::config::{Component, EngineConfig};
use storyloom::embedding::{
    InMemoryVectorStore, KnowledgeDocument, SearchFilters, VectorEmbeddingService, content_hash,
};
use storyloom::error::ConfigError;
use storyloom::pipeline::prompts::WRITER_SYSTEM;
use storyloom::{EngineRequest, PipelineOrchestrator, UserTier};

use super::engine_harness::{
    DeterministicEmbedding, RecordingFactory, RecordingUsageSink, ScriptedChat, seeded_store,
};

#[tokio::test]
async fn long_documents_are_stored_as_linked_chunks() {
    let store = Arc::new(InMemoryVectorStore::new());
    let service = VectorEmbeddingService::new(Arc::new(DeterministicEmbedding::new()), store.clone());
    let content = "The tide turns twice a day. ".repeat(12);
    let doc = KnowledgeDocument::new("tides", content.trim()).with_meta("category", "worldview");

    let chunks = service.index_document(&doc, 80).await.expect("indexed");

    assert!(chunks > 1);
    assert_eq!(store.len(), chunks);
    for index in 0..chunks {
        let stored = store.get(&format!("tides#{index}")).expect("chunk stored");
        assert!(stored.content.chars().count() <= 80);
        assert_eq!(stored.metadata["parent_id"], "tides");
        assert_eq!(stored.metadata["chunk_index"], index.to_string());
        assert_eq!(stored.metadata["category"], "worldview");
        assert_eq!(stored.metadata["hash"], content_hash(&stored.content));
    }
}

#[tokio::test]
async fn reindexing_a_shorter_document_drops_stale_chunks() {
    let store = Arc::new(InMemoryVectorStore::new());
    let service = VectorEmbeddingService::new(Arc::new(DeterministicEmbedding::new()), store.clone());

    let long = KnowledgeDocument::new("saga", "Alpha part.\n\nBeta part.\n\nGamma part.");
    assert_eq!(service.index_document(&long, 20).await.expect("indexed"), 3);
    assert_eq!(store.len(), 3);

    let short = KnowledgeDocument::new("saga", "Alpha only.");
    assert_eq!(service.index_document(&short, 20).await.expect("reindexed"), 1);

    assert_eq!(store.len(), 1);
    assert_eq!(store.get("saga#0").expect("chunk").content, "Alpha only.");
    assert!(store.get("saga#1").is_none());
    assert!(store.get("saga#2").is_none());
}

#[tokio::test]
async fn upserting_an_existing_id_replaces_it() {
    let embedding = Arc::new(DeterministicEmbedding::new());
    let store = seeded_store(embedding.clone()).await;
    let before = store.len();
    let service = VectorEmbeddingService::new(embedding, store.clone());

    service
        .upsert(KnowledgeDocument::new("market", "The market moved to the western quay."))
        .await
        .expect("upsert");

    assert_eq!(store.len(), before);
    let hits = service
        .search_text(
            "western quay",
            1,
            &SearchFilters::none(),
            std::time::Duration::from_secs(1),
        )
        .await;
    assert_eq!(hits[0].id, "market");
    assert!(hits[0].content.contains("western"));
}

#[tokio::test]
async fn config_file_drives_tiers_models_and_prompts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[engine]
batch_concurrency = 2

[tiers.free]
max_memories = 2
max_context_length = 3000
default_model = "small-model"
call_timeout_secs = 5
target_length = 400

[models.writer]
model_id = "prose-model"
api_key = "sk-writer"
base_url = "https://writer.example.com/v1"

[prompts]
writer = "Custom writer prompt for: {{ user_query }}"
"#,
    )
    .expect("write config");
    let config = EngineConfig::load_or_default(Some(&path)).expect("config loads");

    let chat = Arc::new(ScriptedChat::new());
    let embedding = Arc::new(DeterministicEmbedding::new());
    let store = seeded_store(embedding.clone()).await;
    let factory = Arc::new(RecordingFactory::new());
    let engine = PipelineOrchestrator::builder(chat.clone(), embedding, store.clone())
        .config(&config)
        .backend_factory(factory.clone())
        .keyword_search(store)
        .usage_sink(Arc::new(RecordingUsageSink::default()))
        .build()
        .expect("engine builds");

    assert_eq!(engine.settings().batch_concurrency, 2);
    assert_eq!(engine.limits_for(UserTier::Free).max_memories, 2);
    assert!(engine.model_snapshot().is_overridden(Component::Writer));
    assert_eq!(factory.created(), vec!["writer".to_string()]);

    let response = engine
        .generate(&EngineRequest::new("Mira at the harbour"), UserTier::Free)
        .await;

    assert!(!response.is_error());
    assert!(response.debug.memory_ids.len() <= 2);
    assert_eq!(response.debug.model.as_deref(), Some("prose-model"));
    // The writer override runs on the factory-built backend, not the default one.
    assert!(chat.prompt_for(WRITER_SYSTEM).is_none());
}

#[tokio::test]
async fn broken_prompt_override_fails_the_build() {
    let mut config = EngineConfig::default();
    config.prompts.director = Some("{% if %}".into());
    let embedding = Arc::new(DeterministicEmbedding::new());

    let result = PipelineOrchestrator::builder(
        Arc::new(ScriptedChat::new()),
        embedding,
        Arc::new(InMemoryVectorStore::new()),
    )
    .config(&config)
    .build();

    let Err(err) = result else {
        panic!("invalid template must be rejected");
    };
    assert!(matches!(err, ConfigError::Validation(_)));
    assert!(err.to_string().contains("prompts.director"));
}

#[tokio::test]
async fn inverted_tier_budgets_fail_the_build() {
    let mut config = EngineConfig::default();
    config.tiers.free.max_memories = 50;

    let result = PipelineOrchestrator::builder(
        Arc::new(ScriptedChat::new()),
        Arc::new(DeterministicEmbedding::new()),
        Arc::new(InMemoryVectorStore::new()),
    )
    .config(&config)
    .build();

    assert!(result.is_err());
}

#[test]
fn malformed_config_file_is_a_load_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[engine\nmax_query_length = ").expect("write config");

    let err = EngineConfig::load_or_default(Some(&path)).expect_err("malformed toml");

    assert!(matches!(err, ConfigError::Load(_)));
}
