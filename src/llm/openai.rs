//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。上下文渲染为 system prompt + 历史，
//! 返回文本按 directive 格式解析为 ModelOutput。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::directive::parse_model_output;
use crate::llm::{ModelClient, ModelContext, ModelError, ModelOutput};
use crate::memory::{Message, MessagePayload, Role};
use crate::tools::ToolSchema;

/// 429 且无法得知服务端建议时的等待时间
const DEFAULT_RATE_LIMIT_WAIT_MS: u64 = 1_000;

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

pub(crate) fn openai_config(base_url: Option<&str>, api_key: Option<&str>) -> OpenAIConfig {
    let api_key = api_key
        .map(String::from)
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .unwrap_or_else(|| "sk-placeholder".to_string());
    match base_url {
        Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
        None => OpenAIConfig::new().with_api_key(api_key),
    }
}

pub struct OpenAiModel {
    client: Client<OpenAIConfig>,
    model: String,
    pub usage: TokenUsage,
}

impl OpenAiModel {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        Self {
            client: Client::with_config(openai_config(base_url, api_key)),
            model: model.to_string(),
            usage: TokenUsage::default(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn build_err(e: impl std::fmt::Display) -> ModelError {
    ModelError::Provider(format!("request build failed: {}", e))
}

fn system_msg(content: String) -> Result<ChatCompletionRequestMessage, ModelError> {
    Ok(ChatCompletionRequestMessage::System(
        ChatCompletionRequestSystemMessageArgs::default()
            .content(content)
            .build()
            .map_err(build_err)?,
    ))
}

fn user_msg(content: String) -> Result<ChatCompletionRequestMessage, ModelError> {
    Ok(ChatCompletionRequestMessage::User(
        ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()
            .map_err(build_err)?,
    ))
}

fn assistant_msg(content: String) -> Result<ChatCompletionRequestMessage, ModelError> {
    Ok(ChatCompletionRequestMessage::Assistant(
        ChatCompletionRequestAssistantMessageArgs::default()
            .content(content)
            .build()
            .map_err(build_err)?,
    ))
}

/// 历史消息转 API 格式：工具请求回放为 directive JSON，工具结果作为 observation 交给模型
fn to_openai_message(m: &Message) -> Result<ChatCompletionRequestMessage, ModelError> {
    match (&m.role, &m.payload) {
        (Role::User, _) => user_msg(m.content.clone()),
        (Role::Agent, Some(MessagePayload::ToolCalls { calls })) => {
            let requests: Vec<serde_json::Value> = calls
                .iter()
                .map(|c| serde_json::json!({"tool": c.tool, "arguments": c.arguments}))
                .collect();
            assistant_msg(serde_json::json!({ "tool_calls": requests }).to_string())
        }
        (Role::Agent, _) => assistant_msg(m.content.clone()),
        (Role::Tool, _) => user_msg(format!("Observation: {}", m.content)),
        (Role::System, _) => system_msg(m.content.clone()),
    }
}

fn classify(err: async_openai::error::OpenAIError) -> ModelError {
    let msg = err.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") {
        ModelError::RateLimited {
            retry_after_ms: DEFAULT_RATE_LIMIT_WAIT_MS,
        }
    } else {
        ModelError::Provider(msg)
    }
}

#[async_trait]
impl ModelClient for OpenAiModel {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(
        &self,
        context: &ModelContext,
        tools: &[ToolSchema],
    ) -> Result<ModelOutput, ModelError> {
        let mut messages = vec![system_msg(context.render_system(tools))?];
        for m in &context.messages {
            messages.push(to_openai_message(m)?);
        }

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .build()
            .map_err(build_err)?;

        let response = self.client.chat().create(request).await.map_err(classify)?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        tracing::debug!(agent = %context.agent, chars = content.len(), "model completion received");
        parse_model_output(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolCall;
    use serde_json::json;

    #[test]
    fn test_history_conversion() {
        let call = ToolCall {
            id: "call-1-1".into(),
            tool: "echo".into(),
            arguments: json!({"text": "hi"}),
            origin_message: "msg-1-2".into(),
        };
        let req = Message::agent("msg-1-2", "triage", "")
            .with_payload(MessagePayload::ToolCalls { calls: vec![call] });
        assert!(matches!(
            to_openai_message(&req).unwrap(),
            ChatCompletionRequestMessage::Assistant(_)
        ));
        assert!(matches!(
            to_openai_message(&Message::system("m", "handoff")).unwrap(),
            ChatCompletionRequestMessage::System(_)
        ));
        assert!(matches!(
            to_openai_message(&Message::user("m", "hi")).unwrap(),
            ChatCompletionRequestMessage::User(_)
        ));
    }
}
