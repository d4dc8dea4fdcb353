//! 工具输入 schema：字段名 -> 类型 + 是否必填
//!
//! Dispatcher 在执行前按 schema 校验参数；同一 schema 也导出为 JSON Schema 注入模型上下文。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::tools::ToolError;

/// 参数字段类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

/// 单个字段声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// 工具输入 schema（字段按名称有序，保证导出确定）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSchema {
    pub fields: BTreeMap<String, FieldSpec>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: BTreeMap<String, FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn required(mut self, name: &str, field_type: FieldType, description: &str) -> Self {
        self.fields.insert(
            name.to_string(),
            FieldSpec {
                field_type,
                required: true,
                description: Some(description.to_string()),
            },
        );
        self
    }

    pub fn optional(mut self, name: &str, field_type: FieldType, description: &str) -> Self {
        self.fields.insert(
            name.to_string(),
            FieldSpec {
                field_type,
                required: false,
                description: Some(description.to_string()),
            },
        );
        self
    }

    /// 校验参数：必须是对象；必填字段存在；类型匹配；不允许未声明字段
    pub fn validate(&self, tool: &str, args: &Value) -> Result<(), ToolError> {
        let invalid = |detail: String| ToolError::InvalidArguments {
            tool: tool.to_string(),
            detail,
        };
        let obj = match args {
            Value::Object(map) => map,
            Value::Null if self.fields.values().all(|f| !f.required) => return Ok(()),
            other => return Err(invalid(format!("expected an object, got {}", other))),
        };

        for (name, spec) in &self.fields {
            match obj.get(name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(invalid(format!("missing required field '{}'", name)));
                }
                Some(v) if !v.is_null() && !spec.field_type.matches(v) => {
                    return Err(invalid(format!(
                        "field '{}' must be {}",
                        name,
                        spec.field_type.as_str()
                    )));
                }
                _ => {}
            }
        }

        if let Some(extra) = obj.keys().find(|k| !self.fields.contains_key(*k)) {
            return Err(invalid(format!("unexpected field '{}'", extra)));
        }
        Ok(())
    }

    /// 导出为 JSON Schema（供模型生成正确参数）
    pub fn to_json_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .fields
            .iter()
            .map(|(name, spec)| {
                let mut prop = json!({ "type": spec.field_type.as_str() });
                if let Some(desc) = &spec.description {
                    prop["description"] = Value::String(desc.clone());
                }
                (name.clone(), prop)
            })
            .collect();
        let required: Vec<&String> = self
            .fields
            .iter()
            .filter(|(_, spec)| spec.required)
            .map(|(name, _)| name)
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false
        })
    }
}

/// 工具声明：名称、描述、输入 schema、超时
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ToolSchema {
    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.input_schema.to_json_schema(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> InputSchema {
        InputSchema::new()
            .required("food", FieldType::String, "food name")
            .optional("grams", FieldType::Number, "portion in grams")
    }

    #[test]
    fn test_valid_arguments() {
        assert!(schema().validate("t", &json!({"food": "oats"})).is_ok());
        assert!(schema().validate("t", &json!({"food": "oats", "grams": 40})).is_ok());
        assert!(schema().validate("t", &json!({"food": "oats", "grams": null})).is_ok());
    }

    #[test]
    fn test_missing_required_field() {
        let err = schema().validate("t", &json!({"grams": 40})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { ref detail, .. } if detail.contains("food")));
    }

    #[test]
    fn test_wrong_type_and_unexpected_field() {
        assert!(schema().validate("t", &json!({"food": 3})).is_err());
        assert!(schema().validate("t", &json!({"food": "oats", "brand": "x"})).is_err());
        assert!(schema().validate("t", &json!("oats")).is_err());
    }

    #[test]
    fn test_integer_rejects_float() {
        let s = InputSchema::new().required("n", FieldType::Integer, "count");
        assert!(s.validate("t", &json!({"n": 2})).is_ok());
        assert!(s.validate("t", &json!({"n": 2.5})).is_err());
    }

    #[test]
    fn test_json_schema_export() {
        let v = schema().to_json_schema();
        assert_eq!(v["required"], json!(["food"]));
        assert_eq!(v["properties"]["grams"]["type"], "number");
    }

    #[test]
    fn test_null_args_allowed_when_nothing_required() {
        let s = InputSchema::new().optional("x", FieldType::String, "x");
        assert!(s.validate("t", &Value::Null).is_ok());
    }
}
