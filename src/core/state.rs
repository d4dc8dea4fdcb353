//! 回合状态机与响应投影
//!
//! Received → InputGuarded → AgentSelected → ModelCalled → {ToolPending | HandoffPending | OutputGuarded}
//! → Complete | Blocked | Failed。每个回合记录完整的状态迁移轨迹，随响应一起返回供审计。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::error::ErrorKind;
use crate::core::events::TurnEvent;
use crate::guardrails::GuardrailVerdict;
use crate::memory::{Message, SessionId};
use crate::tools::ToolStatus;

/// 回合状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Received,
    InputGuarded,
    AgentSelected,
    ModelCalled,
    ToolPending,
    HandoffPending,
    OutputGuarded,
    Complete,
    Blocked,
    Failed,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Blocked | Self::Failed)
    }

    /// 合法迁移表（ToolPending → ModelCalled：工具结果回灌后再次调用模型）
    pub fn can_transition_to(self, next: TurnState) -> bool {
        use TurnState::*;
        match (self, next) {
            (_, Failed) => !self.is_terminal(),
            (Received, InputGuarded) | (Received, Blocked) => true,
            (InputGuarded, AgentSelected) => true,
            (AgentSelected, ModelCalled) => true,
            (ModelCalled, ToolPending)
            | (ModelCalled, HandoffPending)
            | (ModelCalled, OutputGuarded) => true,
            (ToolPending, ModelCalled) => true,
            (HandoffPending, AgentSelected) => true,
            (OutputGuarded, Complete) | (OutputGuarded, Blocked) => true,
            _ => false,
        }
    }
}

/// 回合结局：正常完成 / 护栏拒答 / 系统错误（供前端渲染不同 UX）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed,
    Refused { reason: String },
    SystemError { kind: ErrorKind, detail: String },
}

impl TurnOutcome {
    /// 非正常结局的错误分类：拒答为 GuardrailBlocked
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Completed => None,
            Self::Refused { .. } => Some(ErrorKind::GuardrailBlocked),
            Self::SystemError { kind, .. } => Some(*kind),
        }
    }
}

/// 本回合调用过的工具（按请求顺序）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub call_id: String,
    pub tool: String,
    pub status: ToolStatus,
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.tool, self.status)
    }
}

/// handle_turn 的最终响应
#[derive(Clone, Debug, Serialize)]
pub struct TurnResponse {
    pub session_id: SessionId,
    pub text: String,
    pub outcome: TurnOutcome,
    pub agent_used: Option<String>,
    pub tools_invoked: Vec<ToolInvocation>,
    /// 非 Allow 的护栏裁决（Rewrite 时保留原文）
    pub guardrail_actions: Vec<GuardrailVerdict>,
    pub states: Vec<TurnState>,
    pub events: Vec<TurnEvent>,
    /// 本回合落库的消息（含序号）
    pub messages: Vec<Message>,
}

impl TurnResponse {
    pub fn is_refusal(&self) -> bool {
        matches!(self.outcome, TurnOutcome::Refused { .. })
    }

    pub fn final_state(&self) -> Option<TurnState> {
        self.states.last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use TurnState::*;
        let path = [
            Received,
            InputGuarded,
            AgentSelected,
            ModelCalled,
            ToolPending,
            ModelCalled,
            HandoffPending,
            AgentSelected,
            ModelCalled,
            OutputGuarded,
            Complete,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        assert!(!TurnState::Complete.can_transition_to(TurnState::Failed));
        assert!(!TurnState::Blocked.can_transition_to(TurnState::ModelCalled));
        assert!(TurnState::ToolPending.can_transition_to(TurnState::Failed));
        assert!(!TurnState::Received.can_transition_to(TurnState::ModelCalled));
    }

    #[test]
    fn test_tool_invocation_display() {
        let inv = ToolInvocation {
            call_id: "call-1-1".into(),
            tool: "lookup_profile".into(),
            status: ToolStatus::Timeout,
        };
        assert_eq!(inv.to_string(), "lookup_profile(timeout)");
    }
}
