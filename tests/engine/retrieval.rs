use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use storyloom::embedding::{
    InMemoryVectorStore, KnowledgeDocument, SearchFilters, VectorEmbeddingService,
};
use storyloom::pipeline::Retriever;
use storyloom::types::QueryUnderstandingResult;
use storyloom::{EngineRequest, TierPolicy, UserTier};

use super::engine_harness::{
    DeterministicEmbedding, FailingEmbedding, FailingKeywordSearch, FixedKeywordSearch,
    FixedVectorStore, memory, seeded_store,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn query(intent: &str, keywords: &[&str]) -> QueryUnderstandingResult {
    QueryUnderstandingResult {
        search_intent: intent.into(),
        keywords: keywords.iter().map(ToString::to_string).collect(),
        ..QueryUnderstandingResult::default()
    }
}

fn ids(hits: &[storyloom::types::RetrievedMemory]) -> Vec<&str> {
    hits.iter().map(|m| m.id.as_str()).collect()
}

#[tokio::test]
async fn regular_tier_keeps_the_ten_best_of_twenty() {
    let candidates: Vec<_> = (0..20u8)
        .map(|i| memory(&format!("m{i:02}"), f32::from((i * 7) % 20) / 20.0))
        .collect();
    let service = Arc::new(VectorEmbeddingService::new(
        Arc::new(DeterministicEmbedding::new()),
        Arc::new(FixedVectorStore { hits: candidates.clone() }),
    ));
    let retriever = Retriever::new(service, None);
    let limits = TierPolicy::default().limits_for(UserTier::Regular).clone();
    assert_eq!(limits.max_memories, 10);

    let hits = retriever
        .retrieve(&query("anything", &[]), &EngineRequest::new("anything"), &limits)
        .await;

    assert_eq!(hits.len(), 10);
    let mut expected = candidates;
    expected.sort_by(|a, b| b.score.total_cmp(&a.score));
    expected.truncate(10);
    assert_eq!(hits, expected);
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn embedding_outage_degrades_to_keyword_results() {
    let store = seeded_store(Arc::new(DeterministicEmbedding::new())).await;
    let failing = Arc::new(FailingEmbedding::new());
    let service = Arc::new(VectorEmbeddingService::new(failing.clone(), store.clone()));

    let vector = service
        .search_text("Mira lighthouse", 5, &SearchFilters::none(), TIMEOUT)
        .await;
    assert!(vector.is_empty());

    let retriever = Retriever::new(service, Some(store));
    let hybrid = retriever
        .hybrid_search(
            "Mira lighthouse",
            &["lighthouse".to_string()],
            5,
            &SearchFilters::none(),
            TIMEOUT,
        )
        .await;

    let found: HashSet<_> = ids(&hybrid).into_iter().collect();
    assert_eq!(found, HashSet::from(["harbour", "mira"]));
    assert!(failing.calls.load(std::sync::atomic::Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn keyword_outage_degrades_to_vector_results() {
    let embedding = Arc::new(DeterministicEmbedding::new());
    let store = seeded_store(embedding.clone()).await;
    let service = Arc::new(VectorEmbeddingService::new(embedding, store));
    let retriever = Retriever::new(service, Some(Arc::new(FailingKeywordSearch)));

    let hits = retriever
        .hybrid_search(
            "spice market at dawn",
            &["market".to_string()],
            3,
            &SearchFilters::none(),
            TIMEOUT,
        )
        .await;

    assert_eq!(hits.first().map(|m| m.id.as_str()), Some("market"));
}

#[tokio::test]
async fn hybrid_results_have_unique_ids() {
    let vector = FixedVectorStore {
        hits: vec![memory("a", 0.9), memory("b", 0.4), memory("c", 0.3)],
    };
    let keyword = FixedKeywordSearch {
        hits: vec![memory("b", 0.8), memory("d", 0.5), memory("a", 0.2)],
    };
    let service = Arc::new(VectorEmbeddingService::new(
        Arc::new(DeterministicEmbedding::new()),
        Arc::new(vector),
    ));
    let retriever = Retriever::new(service, Some(Arc::new(keyword)));

    let hits = retriever
        .hybrid_search("q", &["q".to_string()], 10, &SearchFilters::none(), TIMEOUT)
        .await;

    assert_eq!(ids(&hits), vec!["a", "d", "b", "c"]);
}

#[tokio::test]
async fn metadata_filters_apply_to_both_halves() {
    let embedding = Arc::new(DeterministicEmbedding::new());
    let store = seeded_store(embedding.clone()).await;
    let service = Arc::new(VectorEmbeddingService::new(embedding, store.clone()));
    let retriever = Retriever::new(service, Some(store));
    let filters = SearchFilters::none().with("category", "worldview");

    let hits = retriever
        .hybrid_search(
            "Mira harbour lighthouse",
            &["mira".to_string(), "harbour".to_string()],
            10,
            &filters,
            TIMEOUT,
        )
        .await;

    assert!(!hits.is_empty());
    assert!(hits.iter().all(|m| m.meta.get("category").map(String::as_str) == Some("worldview")));
    assert!(!ids(&hits).contains(&"mira"));
}

#[tokio::test]
async fn filtered_keyword_hits_survive_higher_ranked_outsiders() {
    let store = Arc::new(InMemoryVectorStore::new());
    let indexer = VectorEmbeddingService::new(Arc::new(DeterministicEmbedding::new()), store.clone());
    for doc in [
        KnowledgeDocument::new("c1", "The dragon circled the castle at dawn."),
        KnowledgeDocument::new("c2", "A dragon slept beneath the castle walls."),
        KnowledgeDocument::new("w", "Old dragon lore from the northern valleys.")
            .with_meta("source_type", "worldview"),
    ] {
        indexer.upsert(doc).await.expect("upsert");
    }
    // Vector half is down, so every hit comes from the keyword index.
    let service = Arc::new(VectorEmbeddingService::new(Arc::new(FailingEmbedding::new()), store.clone()));
    let retriever = Retriever::new(service, Some(store));

    let hits = retriever
        .hybrid_search(
            "dragon castle",
            &["dragon".to_string(), "castle".to_string()],
            2,
            &SearchFilters::none().with("source_type", "worldview"),
            TIMEOUT,
        )
        .await;

    assert_eq!(ids(&hits), vec!["w"]);
}
