//! 模型调用抽象
//!
//! 模型对编排器是不透明函数：上下文 + 可用工具 → 最终文本 | 工具调用列表 | handoff。
//! 所有后端（OpenAI 兼容 / 脚本化 Mock / Echo）实现 ModelClient。

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::knowledge::ScoredChunk;
use crate::llm::directive::directive_instructions;
use crate::memory::{MemoryRecord, Message};
use crate::tools::ToolSchema;

/// 模型调用错误；均可重试，重试策略见 RecoveryEngine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Model call timed out")]
    Timeout,

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Invalid model output: {0}")]
    InvalidOutput(String),
}

/// 模型请求的一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolCallRequest {
    /// 工具名
    pub tool: String,
    /// 参数对象
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(tool: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool: tool.into(),
            arguments,
        }
    }
}

/// 模型输出：三选一
#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutput {
    FinalText(String),
    ToolCalls(Vec<ToolCallRequest>),
    Handoff {
        target: String,
        reason: Option<String>,
    },
}

impl ModelOutput {
    pub fn text(s: impl Into<String>) -> Self {
        Self::FinalText(s.into())
    }

    pub fn tool(tool: impl Into<String>, arguments: Value) -> Self {
        Self::ToolCalls(vec![ToolCallRequest::new(tool, arguments)])
    }

    pub fn handoff(target: impl Into<String>) -> Self {
        Self::Handoff {
            target: target.into(),
            reason: None,
        }
    }
}

/// 组装好的模型上下文
#[derive(Debug, Clone, Default)]
pub struct ModelContext {
    pub session_id: String,
    pub user_id: String,
    pub agent: String,
    /// 智能体 instructions
    pub instructions: String,
    /// 有界历史窗口 + 本回合草稿
    pub messages: Vec<Message>,
    /// (名称, 描述)
    pub handoff_targets: Vec<(String, String)>,
    /// 会话记录与长期记录
    pub records: Vec<MemoryRecord>,
    pub retrieved: Vec<ScoredChunk>,
}

impl ModelContext {
    /// 渲染 system prompt：instructions、会话信息、记录、检索片段、工具与 handoff 目标、输出格式
    pub fn render_system(&self, tools: &[ToolSchema]) -> String {
        let mut out = String::new();
        out.push_str(self.instructions.trim());
        out.push_str(&format!(
            "\n\n## Session\nsession_id: {}\nuser_id: {}\nagent: {}\n",
            self.session_id, self.user_id, self.agent
        ));

        if !self.records.is_empty() {
            out.push_str("\n## Known facts\n");
            for r in &self.records {
                out.push_str(&format!("- {}: {}\n", r.key, r.value));
            }
        }

        if !self.retrieved.is_empty() {
            out.push_str("\n## Reference material\n");
            for (i, sc) in self.retrieved.iter().enumerate() {
                out.push_str(&format!(
                    "[{}] ({}, score {:.2})\n{}\n",
                    i + 1,
                    sc.chunk.source_id,
                    sc.score,
                    sc.chunk.text
                ));
            }
        }

        if !tools.is_empty() {
            out.push_str("\n## Tools\n");
            for t in tools {
                out.push_str(&format!("{}\n", t.to_json()));
            }
        }

        if !self.handoff_targets.is_empty() {
            out.push_str("\n## Agents you can hand off to\n");
            for (name, desc) in &self.handoff_targets {
                out.push_str(&format!("- {}: {}\n", name, desc));
            }
        }

        out.push('\n');
        out.push_str(&directive_instructions());
        out
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        context: &ModelContext,
        tools: &[ToolSchema],
    ) -> Result<ModelOutput, ModelError>;

    /// 累计 token 使用：(prompt, completion, total)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
