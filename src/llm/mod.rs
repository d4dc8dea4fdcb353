//! 模型层：调用抽象、指令解析、OpenAI 兼容客户端、离线模型与嵌入

pub mod directive;
pub mod embedding;
pub mod mock;
pub mod openai;
pub mod traits;

pub use directive::{directive_schema_json, parse_model_output, ModelDirective};
pub use embedding::{create_embedder, EmbeddingProvider, HashingEmbedder, OpenAiEmbedder};
pub use mock::{EchoModel, RecordedCall, ScriptedModel};
pub use openai::{OpenAiModel, TokenUsage};
pub use traits::{ModelClient, ModelContext, ModelError, ModelOutput, ToolCallRequest};
