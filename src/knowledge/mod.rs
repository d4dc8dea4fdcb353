//! 知识库与检索（RAG）

pub mod chunker;
pub mod retriever;
pub mod store;

pub use chunker::{Chunker, ChunkingConfig};
pub use retriever::{KnowledgeRetriever, NoopRetriever, Retriever};
pub use store::{cosine_similarity, KnowledgeChunk, KnowledgeError, KnowledgeStore, ScoredChunk};
