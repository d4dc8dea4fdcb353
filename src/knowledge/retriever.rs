//! 检索接口：query(text, k) → [(chunk, score)]，分数降序、同分按块 ID；存储不变时结果可复现

use std::sync::Arc;

use async_trait::async_trait;

use crate::knowledge::{KnowledgeStore, ScoredChunk};

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn query(&self, text: &str, k: usize) -> Vec<ScoredChunk>;
}

/// 基于 KnowledgeStore 的检索
pub struct KnowledgeRetriever {
    store: Arc<KnowledgeStore>,
    min_score: f32,
}

impl KnowledgeRetriever {
    pub fn new(store: Arc<KnowledgeStore>, min_score: f32) -> Self {
        Self { store, min_score }
    }

    pub fn store(&self) -> &Arc<KnowledgeStore> {
        &self.store
    }
}

#[async_trait]
impl Retriever for KnowledgeRetriever {
    async fn query(&self, text: &str, k: usize) -> Vec<ScoredChunk> {
        self.store.search(text, k, self.min_score).await
    }
}

/// 无知识库时使用
#[derive(Debug, Default)]
pub struct NoopRetriever;

#[async_trait]
impl Retriever for NoopRetriever {
    async fn query(&self, _text: &str, _k: usize) -> Vec<ScoredChunk> {
        Vec::new()
    }
}
