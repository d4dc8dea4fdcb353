//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / input_schema / execute），由 ToolRegistry 按名注册与查找；
//! 新增工具 = 注册一对「schema + handler」，ToolDispatcher 负责校验、超时与审计。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{InputSchema, ToolSchema};

/// 工具 trait：名称、描述（供模型理解）、参数 schema、可选超时、异步执行（args 为已校验的 JSON 对象）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（模型 tool_calls 中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供模型理解功能）
    fn description(&self) -> &str;

    /// 输入 schema；默认无参数
    fn input_schema(&self) -> InputSchema {
        InputSchema::new()
    }

    /// 单次调用超时（毫秒）；None 时使用 Dispatcher 默认值
    fn timeout_ms(&self) -> Option<u64> {
        None
    }

    /// 执行工具；Err 表示工具自身失败（作为 status=error 回灌）
    async fn execute(&self, args: Value) -> Result<Value, String>;

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
            timeout_ms: self.timeout_ms(),
        }
    }
}

/// 工具注册表：按名称存储 Arc<dyn Tool>（BTreeMap 保证导出顺序确定）
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool re-registered, previous handler replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 指定集合中已注册工具的 schema（未注册的名字被忽略）
    pub fn schemas_for(&self, allowed: &BTreeSet<String>) -> Vec<ToolSchema> {
        allowed
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.schema())
            .collect()
    }

    /// 动态生成工具 schema JSON（与实际注册工具匹配）
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self.tools.values().map(|t| t.schema().to_json()).collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}
