//! 模型指令格式：要求模型以 JSON 指令请求工具或 handoff，否则直接输出纯文本答案
//!
//! ```json
//! {"tool_calls": [{"tool": "nutrient_lookup", "arguments": {"food": "oats"}}]}
//! {"handoff": "macro_specialist", "reason": "needs macro targets"}
//! ```
//!
//! 兼容单调用简写 `{"tool": "...", "args": {...}}`。

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::llm::{ModelError, ModelOutput, ToolCallRequest};

/// 模型可返回的 JSON 指令
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct ModelDirective {
    /// 本轮要调用的工具（可并发执行）
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    /// 转交的智能体名称
    #[serde(default)]
    pub handoff: Option<String>,
    /// 转交原因
    #[serde(default)]
    pub reason: Option<String>,
    /// 最终答案（也可以直接输出纯文本）
    #[serde(default)]
    pub answer: Option<String>,
    /// 单工具简写
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub args: Option<Value>,
}

/// 指令的 JSON Schema（美化输出）
pub fn directive_schema_json() -> String {
    let schema = schemars::schema_for!(ModelDirective);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 附加在 system prompt 末尾的输出格式说明
pub fn directive_instructions() -> String {
    format!(
        "## Output format\n\
         To call tools reply with only a JSON object: {{\"tool_calls\": [{{\"tool\": \"<name>\", \"arguments\": {{...}}}}]}}.\n\
         To transfer the conversation reply with only: {{\"handoff\": \"<agent name>\", \"reason\": \"...\"}}.\n\
         Otherwise reply with the final answer as plain text.\n\
         JSON Schema:\n{}",
        directive_schema_json()
    )
}

/// 从原始补全中提取 JSON（```json 代码块或首尾花括号）
fn extract_json(trimmed: &str) -> Option<&str> {
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 解析补全文本为 ModelOutput
pub fn parse_model_output(raw: &str) -> Result<ModelOutput, ModelError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ModelError::InvalidOutput("empty completion".into()));
    }

    let Some(json_str) = extract_json(trimmed) else {
        return Ok(ModelOutput::FinalText(trimmed.to_string()));
    };

    let directive: ModelDirective = match serde_json::from_str(json_str) {
        Ok(d) => d,
        // 整段都是 JSON 却解析失败：视为格式错误交给重试；否则是夹带花括号的普通答案
        Err(e) if trimmed.starts_with('{') || trimmed.starts_with("```") => {
            return Err(ModelError::InvalidOutput(format!("{}: {}", e, json_str)));
        }
        Err(_) => return Ok(ModelOutput::FinalText(trimmed.to_string())),
    };

    if let Some(calls) = directive.tool_calls {
        if calls.is_empty() {
            return Err(ModelError::InvalidOutput("empty tool_calls".into()));
        }
        return Ok(ModelOutput::ToolCalls(calls));
    }
    if let Some(tool) = directive.tool.filter(|t| !t.is_empty()) {
        let arguments = directive.args.unwrap_or(Value::Object(Default::default()));
        return Ok(ModelOutput::ToolCalls(vec![ToolCallRequest { tool, arguments }]));
    }
    if let Some(target) = directive.handoff.filter(|t| !t.is_empty()) {
        return Ok(ModelOutput::Handoff {
            target,
            reason: directive.reason,
        });
    }
    if let Some(answer) = directive.answer {
        return Ok(ModelOutput::FinalText(answer));
    }
    Ok(ModelOutput::FinalText(trimmed.to_string()))
}
