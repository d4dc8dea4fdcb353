//! 文档分块（UTF-8 安全）：在目标长度内尽量于分隔符处断开，相邻块保留重叠

use std::collections::BTreeMap;

use crate::knowledge::KnowledgeChunk;

#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// 目标块大小（字符数）
    pub chunk_size: usize,
    /// 块之间的重叠（字符数）
    pub chunk_overlap: usize,
    /// 分隔符优先级（从高到低）
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            separators: ["\n\n", "\n", "。", ". ", "！", "？", "! ", "? ", " "]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    /// 块 ID 为 `{doc_id}_{序号}`；metadata 记录字节偏移
    pub fn chunk(&self, doc_id: &str, text: &str) -> Vec<KnowledgeChunk> {
        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();
        let size = self.config.chunk_size.max(1);
        let mut chunks = Vec::new();
        let mut current = 0;

        while current < total {
            let target_end = (current + size).min(total);
            let mut end = target_end;

            if target_end < total {
                let slice: String = chars[current..target_end].iter().collect();
                for sep in &self.config.separators {
                    if let Some(pos) = slice.rfind(sep.as_str()) {
                        let upto = slice[..pos].chars().count() + sep.chars().count();
                        if upto > 0 {
                            end = current + upto;
                            break;
                        }
                    }
                }
            }
            if end <= current {
                end = (current + 1).min(total);
            }

            let piece: String = chars[current..end].iter().collect();
            let trimmed = piece.trim();
            if !trimmed.is_empty() {
                let byte_offset: usize = chars[..current].iter().map(|c| c.len_utf8()).sum();
                let mut metadata = BTreeMap::new();
                metadata.insert("offset".to_string(), byte_offset.to_string());
                chunks.push(KnowledgeChunk {
                    id: format!("{}_{}", doc_id, chunks.len()),
                    text: trimmed.to_string(),
                    embedding: Vec::new(),
                    source_id: doc_id.to_string(),
                    metadata,
                });
            }

            if end >= total {
                break;
            }
            let overlap = self.config.chunk_overlap.min(end - current);
            let next = end.saturating_sub(overlap);
            current = if next > current { next } else { end };
        }

        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunking_splits_on_separators() {
        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: 40,
            chunk_overlap: 5,
            ..Default::default()
        });
        let text = "Protein supports muscle repair.\n\nFiber supports digestion. Water matters too.";
        let chunks = chunker.chunk("guide", text);
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].id, "guide_0");
        assert_eq!(chunks[0].text, "Protein supports muscle repair.");
        assert!(chunks.iter().all(|c| c.source_id == "guide"));
        assert_eq!(chunks[0].metadata.get("offset").map(String::as_str), Some("0"));
    }

    #[test]
    fn test_multibyte_text() {
        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: 8,
            chunk_overlap: 2,
            ..Default::default()
        });
        let chunks = chunker.chunk("zh", "这是第一句话。这是第二句话。这是第三句话。");
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| !c.text.is_empty()));
    }

    #[test]
    fn test_empty_document() {
        assert!(Chunker::default().chunk("d", "").is_empty());
        assert!(Chunker::default().chunk("d", "   ").is_empty());
    }

    #[test]
    fn test_short_document_is_single_chunk() {
        let chunks = Chunker::default().chunk("d", "Eat vegetables.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Eat vegetables.");
    }
}
