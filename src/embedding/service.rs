use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::chunker::chunk_text;
use super::store::{SearchFilters, StoredDocument, VectorStore};
use super::traits::EmbeddingBackend;
use crate::error::ExternalServiceError;
use crate::llm::with_timeout;
use crate::types::{HealthState, RetrievedMemory};

const HEALTH_PROBE_TEXT: &str = "health check";

/// A knowledge item as handed over by the knowledge store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeDocument {
    pub id: String,
    pub content: String,
    pub metadata: BTreeMap<String, String>,
}

impl KnowledgeDocument {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbeddingHealth {
    pub status: HealthState,
    pub backend: String,
    pub dimension: Option<usize>,
    pub latency_ms: u64,
    pub error: Option<String>,
}

pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Text → vector, vector storage, and similarity search behind one facade.
pub struct VectorEmbeddingService {
    backend: Arc<dyn EmbeddingBackend>,
    store: Arc<dyn VectorStore>,
    index_timeout: Duration,
    health_timeout: Duration,
}

impl VectorEmbeddingService {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            backend,
            store,
            index_timeout: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeouts(mut self, index_timeout: Duration, health_timeout: Duration) -> Self {
        self.index_timeout = index_timeout;
        self.health_timeout = health_timeout;
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn dimensions(&self) -> usize {
        self.backend.dimensions()
    }

    /// Embed one text. Callers treat a failure as losing this one item.
    pub async fn embed(
        &self,
        text: &str,
        timeout: Duration,
    ) -> Result<Vec<f32>, ExternalServiceError> {
        with_timeout("embedding", timeout, self.backend.embed_one(text)).await
    }

    /// Embed and store one item. Re-upserting the same id replaces it.
    pub async fn upsert(&self, doc: KnowledgeDocument) -> Result<(), ExternalServiceError> {
        let embedding = self.embed(&doc.content, self.index_timeout).await?;
        let mut metadata = doc.metadata;
        metadata
            .entry("hash".into())
            .or_insert_with(|| content_hash(&doc.content));

        with_timeout(
            "vector_store",
            self.index_timeout,
            self.store.add_document(StoredDocument {
                id: doc.id,
                content: doc.content,
                embedding,
                metadata,
            }),
        )
        .await
    }

    /// Chunk a long item and upsert each piece as `<id>#<n>`. Returns the
    /// number of chunks stored.
    pub async fn index_document(
        &self,
        doc: &KnowledgeDocument,
        max_chunk_size: usize,
    ) -> Result<usize, ExternalServiceError> {
        let chunks = self.chunk(&doc.content, max_chunk_size);
        let count = chunks.len();
        let stale = with_timeout(
            "vector_store",
            self.index_timeout,
            self.store.delete_by_parent(&doc.id),
        )
        .await?;
        if stale > 0 {
            tracing::debug!(id = doc.id.as_str(), stale, "removed previous chunks");
        }
        for (index, chunk) in chunks.into_iter().enumerate() {
            let mut piece = KnowledgeDocument {
                id: format!("{}#{index}", doc.id),
                content: chunk,
                metadata: doc.metadata.clone(),
            };
            piece.metadata.insert("parent_id".into(), doc.id.clone());
            piece.metadata.insert("chunk_index".into(), index.to_string());
            self.upsert(piece).await?;
        }
        tracing::debug!(id = doc.id.as_str(), chunks = count, "indexed document");
        Ok(count)
    }

    /// Ordered by descending score. An unreachable store is logged and
    /// reported as no matches so callers can carry on.
    pub async fn similarity_search(
        &self,
        query_vector: &[f32],
        k: usize,
        filters: &SearchFilters,
        timeout: Duration,
    ) -> Vec<RetrievedMemory> {
        match with_timeout(
            "vector_store",
            timeout,
            self.store.similarity_search(query_vector, k, filters),
        )
        .await
        {
            Ok(mut hits) => {
                hits.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                hits.truncate(k);
                hits
            }
            Err(e) => {
                tracing::warn!(store = self.store.name(), "similarity search failed: {e}");
                Vec::new()
            }
        }
    }

    /// Embed `text` and search. Embedding failures degrade to no matches.
    pub async fn search_text(
        &self,
        text: &str,
        k: usize,
        filters: &SearchFilters,
        timeout: Duration,
    ) -> Vec<RetrievedMemory> {
        match self.embed(text, timeout).await {
            Ok(vector) => self.similarity_search(&vector, k, filters, timeout).await,
            Err(e) => {
                tracing::warn!(backend = self.backend.name(), "query embedding failed: {e}");
                Vec::new()
            }
        }
    }

    pub fn chunk(&self, content: &str, max_chunk_size: usize) -> Vec<String> {
        chunk_text(content, max_chunk_size)
    }

    /// Trivial embed call under a fixed deadline. Never fails; problems are
    /// reported in the returned status.
    pub async fn health_check(&self) -> EmbeddingHealth {
        let started = Instant::now();
        let backend = self.backend.name().to_string();
        match self.embed(HEALTH_PROBE_TEXT, self.health_timeout).await {
            Ok(vector) if !vector.is_empty() => EmbeddingHealth {
                status: HealthState::Healthy,
                backend,
                dimension: Some(vector.len()),
                latency_ms: elapsed_ms(started),
                error: None,
            },
            Ok(_) => EmbeddingHealth {
                status: HealthState::Unhealthy,
                backend,
                dimension: None,
                latency_ms: elapsed_ms(started),
                error: Some("backend returned an empty vector".into()),
            },
            Err(e) => EmbeddingHealth {
                status: HealthState::Unhealthy,
                backend,
                dimension: None,
                latency_ms: elapsed_ms(started),
                error: Some(e.to_string()),
            },
        }
    }
}
