//! 知识库：分块、嵌入并保存文档；按余弦相似度检索
//!
//! 重新索引同一文档会整体替换其旧块。

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::knowledge::Chunker;
use crate::llm::EmbeddingProvider;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing)]
    pub embedding: Vec<f32>,
    pub source_id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl KnowledgeChunk {
    pub fn new(id: impl Into<String>, text: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            embedding: Vec::new(),
            source_id: source_id.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// 检索结果
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: KnowledgeChunk,
    pub score: f32,
}

#[derive(Error, Debug)]
pub enum KnowledgeError {
    #[error("Embedding failed for {doc_id}: {detail}")]
    Embedding { doc_id: String, detail: String },

    #[error("Failed to read documents: {0}")]
    Io(#[from] std::io::Error),
}

pub struct KnowledgeStore {
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Chunker,
    chunks: RwLock<Vec<KnowledgeChunk>>,
}

impl KnowledgeStore {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, chunker: Chunker) -> Self {
        Self {
            embedder,
            chunker,
            chunks: RwLock::new(Vec::new()),
        }
    }

    /// 索引文档，返回块数；任何块嵌入失败则整个文档不入库
    pub async fn index_document(&self, doc_id: &str, text: &str) -> Result<usize, KnowledgeError> {
        let mut fresh = self.chunker.chunk(doc_id, text);
        for chunk in fresh.iter_mut() {
            chunk.embedding =
                self.embedder
                    .embed(&chunk.text)
                    .await
                    .map_err(|detail| KnowledgeError::Embedding {
                        doc_id: doc_id.to_string(),
                        detail,
                    })?;
        }
        let count = fresh.len();
        let mut chunks = self.chunks.write().unwrap_or_else(|e| e.into_inner());
        chunks.retain(|c| c.source_id != doc_id);
        chunks.extend(fresh);
        tracing::debug!(doc = %doc_id, chunks = count, "document indexed");
        Ok(count)
    }

    pub fn remove_document(&self, doc_id: &str) {
        let mut chunks = self.chunks.write().unwrap_or_else(|e| e.into_inner());
        chunks.retain(|c| c.source_id != doc_id);
    }

    /// 索引目录下的 .md / .txt 文件（文件名排序，doc_id 为文件名去扩展名）
    pub async fn index_dir(&self, dir: &Path) -> Result<usize, KnowledgeError> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("md") | Some("txt")
                )
            })
            .collect();
        paths.sort();
        let mut total = 0;
        for path in paths {
            let Some(doc_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let text = std::fs::read_to_string(&path)?;
            total += self.index_document(doc_id, &text).await?;
        }
        tracing::info!(dir = %dir.display(), chunks = total, "knowledge directory indexed");
        Ok(total)
    }

    pub fn len(&self) -> usize {
        self.chunks.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 分数降序、同分按块 ID 升序；仅返回分数高于 min_score 的块
    pub async fn search(&self, query: &str, k: usize, min_score: f32) -> Vec<ScoredChunk> {
        if k == 0 {
            return Vec::new();
        }
        let q = match self.embedder.embed(query).await {
            Ok(v) if !v.is_empty() => v,
            Ok(_) => return Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed; skipping retrieval");
                return Vec::new();
            }
        };
        let chunks = self.chunks.read().unwrap_or_else(|e| e.into_inner());
        let mut scored: Vec<ScoredChunk> = chunks
            .iter()
            .map(|c| ScoredChunk {
                score: cosine_similarity(&q, &c.embedding),
                chunk: c.clone(),
            })
            .filter(|s| s.score > min_score)
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        scored.truncate(k);
        scored
    }
}

/// 余弦相似度
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
