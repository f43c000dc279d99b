use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::embedding::{KeywordSearch, SearchFilters, VectorEmbeddingService};
use crate::llm::with_timeout;
use crate::tier::TierLimits;
use crate::types::{EngineRequest, QueryUnderstandingResult, RetrievedMemory};

/// Hybrid retrieval: vector similarity plus optional keyword lookup.
///
/// Neither half can fail the request. A broken embedding backend or store
/// leaves only the keyword results, and the reverse.
pub struct Retriever {
    embeddings: Arc<VectorEmbeddingService>,
    keywords: Option<Arc<dyn KeywordSearch>>,
}

impl Retriever {
    pub fn new(
        embeddings: Arc<VectorEmbeddingService>,
        keywords: Option<Arc<dyn KeywordSearch>>,
    ) -> Self {
        Self {
            embeddings,
            keywords,
        }
    }

    /// At most `limits.max_memories` memories, highest score first.
    pub async fn retrieve(
        &self,
        query: &QueryUnderstandingResult,
        request: &EngineRequest,
        limits: &TierLimits,
    ) -> Vec<RetrievedMemory> {
        let filters = request_filters(request);
        self.hybrid_search(
            &query.search_intent,
            &query.keywords,
            limits.max_memories,
            &filters,
            limits.call_timeout(),
        )
        .await
    }

    pub async fn hybrid_search(
        &self,
        text: &str,
        keywords: &[String],
        k: usize,
        filters: &SearchFilters,
        timeout: Duration,
    ) -> Vec<RetrievedMemory> {
        if k == 0 {
            return Vec::new();
        }
        let started = Instant::now();

        let vector_search = self.embeddings.search_text(text, k, filters, timeout);
        let keyword_search = self.keyword_search(keywords, k, filters, timeout);
        let (vector_hits, keyword_hits) = tokio::join!(vector_search, keyword_search);

        let vector_count = vector_hits.len();
        let keyword_count = keyword_hits.len();
        let merged = merge_results(vector_hits, keyword_hits, k);
        tracing::debug!(
            vector = vector_count,
            keyword = keyword_count,
            merged = merged.len(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "hybrid search finished"
        );
        merged
    }

    async fn keyword_search(
        &self,
        keywords: &[String],
        k: usize,
        filters: &SearchFilters,
        timeout: Duration,
    ) -> Vec<RetrievedMemory> {
        let Some(index) = &self.keywords else {
            return Vec::new();
        };
        if keywords.is_empty() {
            return Vec::new();
        }
        let search = index.keyword_search(keywords, k, filters);
        match with_timeout("keyword_search", timeout, search).await {
            Ok(hits) => hits
                .into_iter()
                .filter(|m| filters.matches(&m.meta))
                .collect(),
            Err(e) => {
                tracing::warn!("keyword search failed: {e}");
                Vec::new()
            }
        }
    }
}

/// `filters` request option: an object of exact-match metadata values.
fn request_filters(request: &EngineRequest) -> SearchFilters {
    let mut filters = SearchFilters::none();
    if let Some(Value::Object(map)) = request.options().get("filters") {
        for (key, value) in map {
            if let Some(value) = value.as_str() {
                filters = filters.with(key.clone(), value);
            }
        }
    }
    filters
}

/// Union by id with the first occurrence kept, so vector hits win over
/// keyword hits for the same id. The sort is stable: equal scores keep the
/// vector-then-keyword order.
pub fn merge_results(
    vector: Vec<RetrievedMemory>,
    keyword: Vec<RetrievedMemory>,
    k: usize,
) -> Vec<RetrievedMemory> {
    let mut seen = HashSet::new();
    let mut merged: Vec<RetrievedMemory> = vector
        .into_iter()
        .chain(keyword)
        .filter(|m| seen.insert(m.id.clone()))
        .collect();
    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    merged.truncate(k);
    merged
}
