use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use super::vector::cosine_similarity;
use crate::llm::BoxFuture;
use crate::types::RetrievedMemory;

/// A knowledge item together with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: BTreeMap<String, String>,
}

impl StoredDocument {
    pub fn to_memory(&self, score: f32) -> RetrievedMemory {
        RetrievedMemory {
            id: self.id.clone(),
            content: self.content.clone(),
            score: score.clamp(0.0, 1.0),
            meta: self.metadata.clone(),
        }
    }
}

/// Exact-match metadata filters applied before scoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    pub metadata: BTreeMap<String, String>,
}

impl SearchFilters {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, metadata: &BTreeMap<String, String>) -> bool {
        self.metadata
            .iter()
            .all(|(k, v)| metadata.get(k).is_some_and(|actual| actual == v))
    }
}

/// Vector store port. Implementations must tolerate empty result sets.
pub trait VectorStore: Send + Sync {
    fn name(&self) -> &str;

    /// Insert or replace by document id.
    fn add_document(&self, doc: StoredDocument) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Remove every chunk whose `parent_id` metadata equals `parent_id`.
    /// Returns how many were removed.
    fn delete_by_parent<'a>(&'a self, parent_id: &'a str) -> BoxFuture<'a, anyhow::Result<usize>>;

    /// Up to `k` documents ordered by descending score.
    fn similarity_search<'a>(
        &'a self,
        vector: &'a [f32],
        k: usize,
        filters: &'a SearchFilters,
    ) -> BoxFuture<'a, anyhow::Result<Vec<RetrievedMemory>>>;
}

/// Keyword lookup used alongside vector search. Scores must lie in `[0, 1]`.
/// Filters apply before `limit` is taken.
pub trait KeywordSearch: Send + Sync {
    fn keyword_search<'a>(
        &'a self,
        keywords: &'a [String],
        limit: usize,
        filters: &'a SearchFilters,
    ) -> BoxFuture<'a, anyhow::Result<Vec<RetrievedMemory>>>;
}

/// Brute-force store held in process memory. Suitable for tests, the CLI,
/// and small knowledge bases.
#[derive(Default)]
pub struct InMemoryVectorStore {
    docs: RwLock<BTreeMap<String, StoredDocument>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<StoredDocument> {
        self.docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

fn sort_desc(results: &mut [RetrievedMemory]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

impl VectorStore for InMemoryVectorStore {
    fn name(&self) -> &str {
        "in-memory"
    }

    fn add_document(&self, doc: StoredDocument) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.docs
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(doc.id.clone(), doc);
            Ok(())
        })
    }

    fn delete_by_parent<'a>(&'a self, parent_id: &'a str) -> BoxFuture<'a, anyhow::Result<usize>> {
        Box::pin(async move {
            let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
            let before = docs.len();
            docs.retain(|_, doc| doc.metadata.get("parent_id").map(String::as_str) != Some(parent_id));
            Ok(before - docs.len())
        })
    }

    fn similarity_search<'a>(
        &'a self,
        vector: &'a [f32],
        k: usize,
        filters: &'a SearchFilters,
    ) -> BoxFuture<'a, anyhow::Result<Vec<RetrievedMemory>>> {
        Box::pin(async move {
            if k == 0 || vector.is_empty() {
                return Ok(Vec::new());
            }
            let mut results: Vec<RetrievedMemory> = {
                let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
                docs.values()
                    .filter(|doc| filters.matches(&doc.metadata))
                    .filter_map(|doc| {
                        let score = cosine_similarity(vector, &doc.embedding);
                        (score > 0.0).then(|| doc.to_memory(score))
                    })
                    .collect()
            };
            sort_desc(&mut results);
            results.truncate(k);
            Ok(results)
        })
    }
}

impl KeywordSearch for InMemoryVectorStore {
    fn keyword_search<'a>(
        &'a self,
        keywords: &'a [String],
        limit: usize,
        filters: &'a SearchFilters,
    ) -> BoxFuture<'a, anyhow::Result<Vec<RetrievedMemory>>> {
        Box::pin(async move {
            let terms: Vec<String> = keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect();
            if terms.is_empty() || limit == 0 {
                return Ok(Vec::new());
            }

            let mut results: Vec<RetrievedMemory> = {
                let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
                docs.values()
                    .filter(|doc| filters.matches(&doc.metadata))
                    .filter_map(|doc| {
                        let haystack = doc.content.to_lowercase();
                        let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                        if hits == 0 {
                            return None;
                        }
                        #[allow(clippy::cast_precision_loss)]
                        let score = hits as f32 / terms.len() as f32;
                        Some(doc.to_memory(score))
                    })
                    .collect()
            };
            sort_desc(&mut results);
            results.truncate(limit);
            Ok(results)
        })
    }
}
