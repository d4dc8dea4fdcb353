//! Echo 工具（诊断用）

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::{FieldType, InputSchema, Tool};

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (diagnostics)."
    }

    fn input_schema(&self) -> InputSchema {
        InputSchema::new().required("text", FieldType::String, "text to echo")
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let text = args
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        Ok(json!({ "echo": text }))
    }
}
