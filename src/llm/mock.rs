//! 离线模型实现（无需 API）
//!
//! - `ScriptedModel`：按脚本依次返回输出/错误，可设置延迟；记录每次调用的上下文，供测试断言
//! - `EchoModel`：本地跑通流程用，先调用 echo 工具再把工具结果作为答案

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{ModelClient, ModelContext, ModelError, ModelOutput};
use crate::memory::Role;
use crate::tools::ToolSchema;

#[derive(Debug, Clone)]
enum Step {
    Output(ModelOutput),
    Error(ModelError),
}

/// 一次调用的记录
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub context: ModelContext,
    pub tools: Vec<String>,
}

/// 脚本化模型
#[derive(Default)]
pub struct ScriptedModel {
    steps: Mutex<VecDeque<(Step, Option<Duration>)>>,
    fallback: Option<Step>,
    calls: AtomicUsize,
    recorded: Mutex<Vec<RecordedCall>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, output: ModelOutput) -> Self {
        self.push(Step::Output(output), None)
    }

    pub fn then_error(self, err: ModelError) -> Self {
        self.push(Step::Error(err), None)
    }

    /// 延迟 delay 后返回
    pub fn then_delayed(self, output: ModelOutput, delay: Duration) -> Self {
        self.push(Step::Output(output), Some(delay))
    }

    /// 脚本耗尽后一直返回该输出
    pub fn repeat(mut self, output: ModelOutput) -> Self {
        self.fallback = Some(Step::Output(output));
        self
    }

    /// 脚本耗尽后一直返回该错误
    pub fn repeat_error(mut self, err: ModelError) -> Self {
        self.fallback = Some(Step::Error(err));
        self
    }

    fn push(self, step: Step, delay: Option<Duration>) -> Self {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push_back((step, delay));
        }
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.recorded.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn next_step(&self) -> (Option<Step>, Option<Duration>) {
        let queued = self.steps.lock().ok().and_then(|mut s| s.pop_front());
        match queued {
            Some((step, delay)) => (Some(step), delay),
            None => (self.fallback.clone(), None),
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(
        &self,
        context: &ModelContext,
        tools: &[ToolSchema],
    ) -> Result<ModelOutput, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut rec) = self.recorded.lock() {
            rec.push(RecordedCall {
                context: context.clone(),
                tools: tools.iter().map(|t| t.name.clone()).collect(),
            });
        }
        let (step, delay) = self.next_step();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match step {
            Some(Step::Output(out)) => Ok(out),
            Some(Step::Error(err)) => Err(err),
            None => Err(ModelError::Provider("script exhausted".into())),
        }
    }
}

/// 回显模型
#[derive(Debug, Default)]
pub struct EchoModel;

#[async_trait]
impl ModelClient for EchoModel {
    async fn complete(
        &self,
        context: &ModelContext,
        tools: &[ToolSchema],
    ) -> Result<ModelOutput, ModelError> {
        let last = context.messages.last();
        if let Some(result) = last.and_then(|m| m.tool_result()) {
            return Ok(ModelOutput::FinalText(format!(
                "[{}] {}",
                context.agent,
                result.observation()
            )));
        }
        let last_user = context
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        if tools.iter().any(|t| t.name == "echo") {
            return Ok(ModelOutput::tool("echo", json!({ "text": last_user })));
        }
        Ok(ModelOutput::FinalText(format!("[{}] {}", context.agent, last_user)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Message;

    #[tokio::test]
    async fn test_scripted_sequence_then_fallback() {
        let model = ScriptedModel::new()
            .then_error(ModelError::Timeout)
            .then(ModelOutput::text("a"))
            .repeat(ModelOutput::text("b"));
        let ctx = ModelContext::default();
        assert_eq!(model.complete(&ctx, &[]).await, Err(ModelError::Timeout));
        assert_eq!(model.complete(&ctx, &[]).await, Ok(ModelOutput::text("a")));
        assert_eq!(model.complete(&ctx, &[]).await, Ok(ModelOutput::text("b")));
        assert_eq!(model.complete(&ctx, &[]).await, Ok(ModelOutput::text("b")));
        assert_eq!(model.calls(), 4);
    }

    #[tokio::test]
    async fn test_exhausted_script_is_provider_error() {
        let model = ScriptedModel::new();
        let err = model.complete(&ModelContext::default(), &[]).await.unwrap_err();
        assert!(matches!(err, ModelError::Provider(_)));
    }

    #[tokio::test]
    async fn test_echo_model_without_tools() {
        let ctx = ModelContext {
            agent: "triage".into(),
            messages: vec![Message::user("m1", "hello")],
            ..Default::default()
        };
        assert_eq!(
            EchoModel.complete(&ctx, &[]).await.unwrap(),
            ModelOutput::text("[triage] hello")
        );
    }
}
