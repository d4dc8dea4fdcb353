//! 会话消息
//!
//! 消息一经追加即不可变；序号（seq）由 MemoryStore 在落库时分配，每个会话从 1 开始严格递增且无空洞。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ErrorKind;
use crate::guardrails::GuardrailVerdict;
use crate::tools::{ToolCall, ToolResult};

/// 会话 ID
pub type SessionId = String;

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
    Tool,
    System,
}

/// 结构化负载：工具调用请求 / 工具结果 / handoff / 护栏裁决 / 错误
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    ToolCalls { calls: Vec<ToolCall> },
    ToolResult { result: ToolResult },
    Handoff { from: String, to: String },
    Guardrail { verdict: GuardrailVerdict },
    Error { kind: ErrorKind, detail: String },
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// 落库前为 0
    pub seq: u64,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<MessagePayload>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            seq: 0,
            role,
            content: content.into(),
            agent: None,
            payload: None,
            timestamp: Utc::now(),
        }
    }

    pub fn user(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(id, Role::User, content)
    }

    pub fn agent(id: impl Into<String>, agent: &str, content: impl Into<String>) -> Self {
        Self::new(id, Role::Agent, content).with_agent(agent)
    }

    pub fn tool(id: impl Into<String>, result: ToolResult) -> Self {
        Self::new(id, Role::Tool, result.observation())
            .with_payload(MessagePayload::ToolResult { result })
    }

    pub fn system(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(id, Role::System, content)
    }

    pub fn with_agent(mut self, agent: &str) -> Self {
        self.agent = Some(agent.to_string());
        self
    }

    pub fn with_payload(mut self, payload: MessagePayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn tool_result(&self) -> Option<&ToolResult> {
        match &self.payload {
            Some(MessagePayload::ToolResult { result }) => Some(result),
            _ => None,
        }
    }
}

/// 取最近 window 条（保持时间顺序）
pub fn recent_window(messages: &[Message], window: usize) -> &[Message] {
    let start = messages.len().saturating_sub(window);
    &messages[start..]
}
