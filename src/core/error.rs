//! 编排错误类型与错误分类
//!
//! 工具层错误（参数不合法、未知工具、执行失败、超时）作为数据写入 ToolResult，交给模型自我修正；
//! 编排层错误（循环上限、非法 handoff、模型不可用、回合超时）终止回合并以 TurnFailure 返回，附带已落库的审计轨迹。
//! 护栏拦截不是错误，而是正常的 Refused 结局，其错误分类为 GuardrailBlocked。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::events::TurnEvent;
use crate::core::state::{ToolInvocation, TurnOutcome, TurnResponse, TurnState};
use crate::guardrails::GuardrailVerdict;
use crate::memory::{MemoryError, Message, SessionId};

/// 错误分类（可序列化，写入审计消息与响应元数据）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArguments,
    UnknownTool,
    ToolNotPermitted,
    ToolExecutionFailed,
    ToolLoopExceeded,
    InvalidHandoff,
    HandoffLoopExceeded,
    ModelUnavailable,
    TurnTimeout,
    GuardrailBlocked,
    DuplicateAgentName,
    DanglingHandoffTarget,
    UnknownRootAgent,
    AgentNotFound,
    SessionNotFound,
    SessionClosed,
    EmptyMessage,
    Cancelled,
    Storage,
}

/// 回合级错误：出现即终止当前回合
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("User message is empty")]
    EmptyMessage,

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Session is closed: {0}")]
    SessionClosed(SessionId),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Tool loop exceeded ({limit} tool rounds)")]
    ToolLoopExceeded { limit: usize },

    #[error("Invalid handoff from '{from}' to '{to}'")]
    InvalidHandoff { from: String, to: String },

    #[error("Handoff loop exceeded ({limit} handoffs)")]
    HandoffLoopExceeded { limit: usize },

    #[error("Model unavailable after {attempts} attempts: {last_error}")]
    ModelUnavailable { attempts: u32, last_error: String },

    #[error("Turn timed out after {timeout_ms} ms")]
    TurnTimeout { timeout_ms: u64 },

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyMessage => ErrorKind::EmptyMessage,
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::SessionClosed(_) => ErrorKind::SessionClosed,
            Self::AgentNotFound(_) => ErrorKind::AgentNotFound,
            Self::ToolLoopExceeded { .. } => ErrorKind::ToolLoopExceeded,
            Self::InvalidHandoff { .. } => ErrorKind::InvalidHandoff,
            Self::HandoffLoopExceeded { .. } => ErrorKind::HandoffLoopExceeded,
            Self::ModelUnavailable { .. } => ErrorKind::ModelUnavailable,
            Self::TurnTimeout { .. } => ErrorKind::TurnTimeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }
}

impl From<MemoryError> for OrchestratorError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::SessionNotFound(id) => Self::SessionNotFound(id),
            MemoryError::SessionClosed(id) => Self::SessionClosed(id),
            MemoryError::Storage(msg) => Self::Storage(msg),
        }
    }
}

/// 失败回合：错误本身 + 部分审计轨迹（已落库的消息、状态迁移、事件）
#[derive(Error, Debug, Clone)]
#[error("{error}")]
pub struct TurnFailure {
    pub session_id: SessionId,
    pub error: OrchestratorError,
    /// 本回合写入历史的消息（含序号）；取消或早期失败时为未落库的草稿或空
    pub trail: Vec<Message>,
    pub states: Vec<TurnState>,
    pub events: Vec<TurnEvent>,
    /// 失败前已使用的智能体
    pub agent_used: Option<String>,
    pub tools_invoked: Vec<ToolInvocation>,
    pub guardrail_actions: Vec<GuardrailVerdict>,
}

impl TurnFailure {
    /// 尚未进入回合（参数校验 / 会话查找）即失败
    pub fn early(session_id: &str, error: OrchestratorError) -> Self {
        Self {
            session_id: session_id.to_string(),
            error,
            trail: Vec::new(),
            states: Vec::new(),
            events: Vec::new(),
            agent_used: None,
            tools_invoked: Vec::new(),
            guardrail_actions: Vec::new(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    /// 转为面向用户的响应（SystemError），与护栏拒答（Refused）区分
    pub fn into_response(self) -> TurnResponse {
        let kind = self.kind();
        TurnResponse {
            session_id: self.session_id,
            text: "Sorry, something went wrong while handling your request. Please try again."
                .to_string(),
            outcome: TurnOutcome::SystemError {
                kind,
                detail: self.error.to_string(),
            },
            agent_used: self.agent_used,
            tools_invoked: self.tools_invoked,
            guardrail_actions: self.guardrail_actions,
            states: self.states,
            events: self.events,
            messages: self.trail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_errors_map_to_turn_errors() {
        let err: OrchestratorError = MemoryError::SessionNotFound("s1".into()).into();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
        let err: OrchestratorError = MemoryError::Storage("disk full".into()).into();
        assert_eq!(err, OrchestratorError::Storage("disk full".into()));
    }

    #[test]
    fn test_failure_renders_as_system_error() {
        let failure = TurnFailure::early("s1", OrchestratorError::ToolLoopExceeded { limit: 6 });
        assert_eq!(failure.to_string(), "Tool loop exceeded (6 tool rounds)");
        let resp = failure.into_response();
        match resp.outcome {
            TurnOutcome::SystemError { kind, .. } => assert_eq!(kind, ErrorKind::ToolLoopExceeded),
            other => panic!("Expected SystemError, got {:?}", other),
        }
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::InvalidHandoff).unwrap();
        assert_eq!(json, "\"invalid_handoff\"");
    }
}
