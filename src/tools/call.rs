//! 工具调用记录：ToolCall / ToolResult
//!
//! 每个 ToolCall 恰好产出一个 ToolResult（成功 / 错误 / 超时），工具层错误以数据形式回灌给模型。

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::ErrorKind;

/// 模型请求的一次工具调用（参数已按 schema 校验后才会执行）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool: String,
    pub arguments: Value,
    /// 发起该调用的 agent 消息 id
    pub origin_message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
    Timeout,
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// 工具层错误（不终止回合，写入 ToolResult.error）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("Invalid arguments for {tool}: {detail}")]
    InvalidArguments { tool: String, detail: String },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool {tool} is not permitted for agent {agent}")]
    NotPermitted { tool: String, agent: String },

    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArguments { .. } => ErrorKind::InvalidArguments,
            Self::UnknownTool(_) => ErrorKind::UnknownTool,
            Self::NotPermitted { .. } => ErrorKind::ToolNotPermitted,
            Self::ExecutionFailed(_) => ErrorKind::ToolExecutionFailed,
        }
    }
}

/// 工具结果：与 ToolCall 一一对应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool: String,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn success(call: &ToolCall, payload: Value, duration_ms: u64) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.tool.clone(),
            status: ToolStatus::Success,
            payload: Some(payload),
            error: None,
            error_kind: None,
            duration_ms,
        }
    }

    pub fn failed(call: &ToolCall, err: &ToolError, duration_ms: u64) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.tool.clone(),
            status: ToolStatus::Error,
            payload: None,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
            duration_ms,
        }
    }

    pub fn timeout(call: &ToolCall, duration_ms: u64) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.tool.clone(),
            status: ToolStatus::Timeout,
            payload: None,
            error: Some(format!("{} timed out after {} ms", call.tool, duration_ms)),
            error_kind: None,
            duration_ms,
        }
    }

    /// 回灌给模型的文本形式
    pub fn observation(&self) -> String {
        match self.status {
            ToolStatus::Success => format!(
                "Tool {} ({}) succeeded: {}",
                self.tool,
                self.call_id,
                self.payload
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_default()
            ),
            ToolStatus::Error | ToolStatus::Timeout => format!(
                "Tool {} ({}) {}: {}",
                self.tool,
                self.call_id,
                self.status,
                self.error.as_deref().unwrap_or("no detail")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call() -> ToolCall {
        ToolCall {
            id: "call-1-1".into(),
            tool: "nutrient_lookup".into(),
            arguments: json!({"food": "oats"}),
            origin_message: "msg-1-2".into(),
        }
    }

    #[test]
    fn test_failed_result_carries_kind() {
        let err = ToolError::UnknownTool("nutrient_lookup".into());
        let result = ToolResult::failed(&call(), &err, 0);
        assert_eq!(result.status, ToolStatus::Error);
        assert_eq!(result.error_kind, Some(ErrorKind::UnknownTool));
        assert!(result.observation().contains("error"));
    }

    #[test]
    fn test_timeout_observation() {
        let result = ToolResult::timeout(&call(), 1500);
        assert_eq!(result.status, ToolStatus::Timeout);
        assert!(result.observation().contains("timed out after 1500 ms"));
    }
}
