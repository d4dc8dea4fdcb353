//! 工具分发器
//!
//! invoke(tool_call) 的顺序：按名查找（UnknownTool）→ 按 schema 校验参数（InvalidArguments，不执行）
//! → 在超时内执行恰好一次（超时 → status=timeout，失败 → status=error）。
//! 任何情况下都返回一个 ToolResult，不向编排器抛错；每次调用输出结构化审计日志（JSON）。

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::time::timeout;

use crate::core::TaskScheduler;
use crate::tools::{ToolCall, ToolError, ToolRegistry, ToolResult, ToolStatus};

/// 工具分发器：持有注册表、默认超时与并发池
pub struct ToolDispatcher {
    registry: ToolRegistry,
    default_timeout: Duration,
    scheduler: TaskScheduler,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry, default_timeout_ms: u64) -> Self {
        Self {
            registry,
            default_timeout: Duration::from_millis(default_timeout_ms),
            scheduler: TaskScheduler::default(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: TaskScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 执行单个工具调用，恰好返回一个 ToolResult
    pub async fn invoke(&self, call: &ToolCall) -> ToolResult {
        let start = Instant::now();
        let result = self.invoke_inner(call, start).await;
        audit(call, &result);
        result
    }

    async fn invoke_inner(&self, call: &ToolCall, start: Instant) -> ToolResult {
        let Some(tool) = self.registry.get(&call.tool) else {
            return ToolResult::failed(call, &ToolError::UnknownTool(call.tool.clone()), 0);
        };

        if let Err(err) = tool.input_schema().validate(&call.tool, &call.arguments) {
            return ToolResult::failed(call, &err, 0);
        }

        let limit = tool
            .timeout_ms()
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let _permit = self.scheduler.acquire_tool().await;
        let outcome = timeout(limit, tool.execute(call.arguments.clone())).await;
        let elapsed = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(payload)) => ToolResult::success(call, payload, elapsed),
            Ok(Err(e)) => ToolResult::failed(call, &ToolError::ExecutionFailed(e), elapsed),
            Err(_) => ToolResult::timeout(call, limit.as_millis() as u64),
        }
    }

    /// 并发执行同一模型回复中的一批调用（fan-out），结果按请求顺序返回（fan-in）。
    /// 不在 allowed 集合中的工具不执行，直接得到 NotPermitted 错误结果。
    pub async fn invoke_batch(
        &self,
        agent: &str,
        calls: &[ToolCall],
        allowed: &BTreeSet<String>,
    ) -> Vec<ToolResult> {
        let futures = calls.iter().map(|call| async move {
            if !allowed.contains(&call.tool) {
                let err = ToolError::NotPermitted {
                    tool: call.tool.clone(),
                    agent: agent.to_string(),
                };
                let result = ToolResult::failed(call, &err, 0);
                audit(call, &result);
                return result;
            }
            self.invoke(call).await
        });
        join_all(futures).await
    }
}

fn audit(call: &ToolCall, result: &ToolResult) {
    let ok = result.status == ToolStatus::Success;
    let audit = serde_json::json!({
        "event": "tool_audit",
        "call_id": call.id,
        "tool": call.tool,
        "ok": ok,
        "outcome": result.status,
        "error_kind": result.error_kind,
        "duration_ms": result.duration_ms,
        "args_preview": args_preview(&call.arguments),
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
