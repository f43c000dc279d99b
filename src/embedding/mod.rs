// ── Ports ────────────────────────────────────────────────────────────────────
pub mod store;
pub mod traits;

// ── Infrastructure ───────────────────────────────────────────────────────────
pub mod chunker;
pub mod vector;

// ── Adapters and services ───────────────────────────────────────────────────
pub mod openai;
pub mod service;

pub use chunker::chunk_text;
pub use openai::OpenAiEmbedding;
pub use service::{EmbeddingHealth, KnowledgeDocument, VectorEmbeddingService, content_hash};
pub use store::{InMemoryVectorStore, KeywordSearch, SearchFilters, StoredDocument, VectorStore};
pub use traits::EmbeddingBackend;
pub use vector::cosine_similarity;
