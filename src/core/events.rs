//! 回合审计事件：状态迁移、护栏裁决、模型调用与重试、工具调用、handoff
//!
//! 可序列化为 JSON，随 TurnResponse / TurnFailure 返回，也逐条写入 tracing 日志。

use serde::{Deserialize, Serialize};

use crate::core::error::ErrorKind;
use crate::core::state::TurnState;
use crate::guardrails::{GuardrailOutcome, GuardrailStage};
use crate::tools::ToolStatus;

/// 单步审计事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// 状态迁移
    StateChanged { from: TurnState, to: TurnState },
    /// 护栏裁决（仅记录非 Allow）
    Guardrail {
        stage: GuardrailStage,
        outcome: GuardrailOutcome,
        check: Option<String>,
        reason: Option<String>,
    },
    /// 选中智能体
    AgentSelected { agent: String },
    /// 拼装上下文（历史条数、记忆条数、检索块 id）
    ContextAssembled {
        agent: String,
        history: usize,
        records: usize,
        chunks: Vec<String>,
    },
    /// 调用模型（attempt 从 1 开始）
    ModelCalled { agent: String, attempt: u32 },
    /// 模型调用失败后退避重试
    ModelRetry {
        attempt: u32,
        error: String,
        backoff_ms: u64,
    },
    /// 分发工具调用
    ToolCall {
        call_id: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 工具结果
    ToolResult {
        call_id: String,
        tool: String,
        status: ToolStatus,
        duration_ms: u64,
    },
    /// 智能体交接
    Handoff { from: String, to: String },
    /// 写入长期记忆（仅 Complete 时落库）
    MemoryUpdate { key: String },
    /// 回合错误
    Error { kind: ErrorKind, detail: String },
}
