//! 嵌入：供知识库检索使用
//!
//! - `HashingEmbedder`：词项特征哈希，离线、确定性（同一文本永远得到同一向量）
//! - `OpenAiEmbedder`：调用 OpenAI 兼容的 /embeddings 端点

use std::sync::Arc;

use async_trait::async_trait;
use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;

use crate::llm::openai::openai_config;

/// 嵌入提供方
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 将文本编码为向量；失败时返回错误字符串
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String>;
}

pub const DEFAULT_HASHING_DIM: usize = 256;

/// 特征哈希嵌入
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASHING_DIM)
    }
}

/// FNV-1a，跨平台、跨版本稳定
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// 小写字母数字词；CJK 字符逐字成词
fn tokens(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut word = String::new();
    for c in text.chars() {
        if c.is_alphanumeric() && c.is_ascii() {
            word.extend(c.to_lowercase());
            continue;
        }
        if !word.is_empty() {
            out.push(std::mem::take(&mut word));
        }
        if c.is_alphanumeric() {
            out.push(c.to_string());
        }
    }
    if !word.is_empty() {
        out.push(word);
    }
    out
}

impl HashingEmbedder {
    /// 纯计算，不涉及 IO
    pub fn encode(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dim];
        for tok in tokens(text) {
            let h = fnv1a(tok.as_bytes());
            let idx = (h % self.dim as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        Ok(self.encode(text))
    }
}

/// 使用 async-openai 调用 OpenAI 兼容的 embeddings API
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiEmbedder {
    /// 与模型客户端共用 OPENAI_API_KEY / base_url
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        Self {
            client: Client::with_config(openai_config(base_url, api_key)),
            model: model.to_string(),
        }
    }

}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(vec![]);
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::String(text.to_string()))
            .build()
            .map_err(|e| e.to_string())?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| e.to_string())?;
        Ok(response
            .data
            .first()
            .map(|e| e.embedding.clone())
            .unwrap_or_default())
    }
}

/// 按配置选择嵌入方：配置了 embedding_model 且有 OPENAI_API_KEY 时用远端，否则用哈希嵌入
pub fn create_embedder(
    base_url: Option<&str>,
    embedding_model: Option<&str>,
) -> Arc<dyn EmbeddingProvider> {
    let key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());
    match (embedding_model, key) {
        (Some(model), Some(key)) => {
            tracing::info!(model = %model, "using remote embeddings");
            Arc::new(OpenAiEmbedder::new(base_url, model, Some(&key)))
        }
        (Some(_), None) => {
            tracing::warn!("embedding_model set but OPENAI_API_KEY missing; using hashing embedder");
            Arc::new(HashingEmbedder::default())
        }
        _ => Arc::new(HashingEmbedder::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashing_is_deterministic_and_normalized() {
        let e = HashingEmbedder::new(64);
        let a = e.encode("Protein helps muscle repair");
        let b = e.encode("protein helps muscle repair");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_empty_text_is_zero_vector() {
        let v = HashingEmbedder::new(8).embed("  ").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_remote_embedder_does_not_block_current_thread_runtime() {
        // 空文本不发请求；在单线程运行时上调用不应 panic
        let e = OpenAiEmbedder::new(Some("http://127.0.0.1:9"), "text-embedding-3-small", Some("sk-test"));
        assert_eq!(e.embed("   ").await.unwrap(), Vec::<f32>::new());
    }

    #[test]
    fn test_tokens() {
        assert_eq!(tokens("Oats, 3g fiber"), vec!["oats", "3g", "fiber"]);
        assert_eq!(tokens("蛋白质"), vec!["蛋", "白", "质"]);
    }
}
