//! 外部 HTTP 工具：将已校验的参数以 JSON POST 到配置的端点
//!
//! 具体营养数据 API 是外部协作者，这里只负责按名注册、声明 schema 与转发；
//! 非 2xx 响应与网络错误都作为工具失败（status=error）回灌给模型。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::HttpToolSection;
use crate::tools::{InputSchema, Tool};

pub struct HttpTool {
    name: String,
    description: String,
    endpoint: String,
    input_schema: InputSchema,
    timeout_ms: Option<u64>,
    client: reqwest::Client,
}

impl HttpTool {
    pub fn from_config(section: &HttpToolSection) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(section.timeout_ms.unwrap_or(30_000)))
            .build()
            .unwrap_or_default();
        Self {
            name: section.name.clone(),
            description: section.description.clone(),
            endpoint: section.endpoint.clone(),
            input_schema: InputSchema::from_fields(section.fields.clone()),
            timeout_ms: section.timeout_ms,
            client,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> InputSchema {
        self.input_schema.clone()
    }

    fn timeout_ms(&self) -> Option<u64> {
        self.timeout_ms
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&args)
            .send()
            .await
            .map_err(|e| format!("request to {} failed: {}", self.endpoint, e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let preview: String = body.chars().take(200).collect();
            return Err(format!("{} returned {}: {}", self.endpoint, status, preview));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| format!("invalid JSON from {}: {}", self.endpoint, e))
    }
}
