//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `NUTRI__*` 覆盖（双下划线表示嵌套，如 `NUTRI__LLM__PROVIDER=openai`）。
//! 编排核心中所有「未定常量」（循环上限、重试、窗口、top-k、TTL、护栏顺序）均在此处可调。

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::tools::FieldSpec;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub retrieval: RetrievalSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub guardrails: GuardrailsSection,
    #[serde(default)]
    pub memory: MemorySection,
}

/// [app] 段：应用名与智能体定义文件
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 智能体定义文件（TOML，`[[agents]]`），未设置时查找 config/agents.toml
    pub agents_file: Option<PathBuf>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 嵌入模型；未设置时使用本地 HashingEmbedder
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

fn default_provider() -> String {
    "mock".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            embedding_model: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次模型调用超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_secs: u64,
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request_secs: default_request_timeout(),
        }
    }
}

/// [orchestrator] 段：回合循环的上限、重试与窗口
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// 会话无活跃智能体时使用的根智能体
    #[serde(default = "default_root_agent")]
    pub root_agent: String,
    /// 单回合内最多执行的工具轮数
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    /// 单回合内最多 handoff 次数
    #[serde(default = "default_max_handoffs")]
    pub max_handoffs: usize,
    /// 模型调用失败后的重试次数（不含首次）
    #[serde(default = "default_model_retries")]
    pub model_retries: u32,
    /// 指数退避基数（毫秒）
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// 拼入上下文的最近消息条数
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// 整个回合的全局超时（秒），0 表示不限
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
}

fn default_root_agent() -> String {
    "nutrition_triage".to_string()
}

fn default_max_tool_iterations() -> usize {
    6
}

fn default_max_handoffs() -> usize {
    3
}

fn default_model_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_history_window() -> usize {
    20
}

fn default_turn_timeout_secs() -> u64 {
    180
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            root_agent: default_root_agent(),
            max_tool_iterations: default_max_tool_iterations(),
            max_handoffs: default_max_handoffs(),
            model_retries: default_model_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            history_window: default_history_window(),
            turn_timeout_secs: default_turn_timeout_secs(),
        }
    }
}

/// [retrieval] 段：知识库目录、分块与 top-k
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalSection {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// 启动时索引的文档目录（*.md / *.txt）
    pub docs_dir: Option<PathBuf>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// 低于该分数的检索结果丢弃
    #[serde(default)]
    pub min_score: f32,
}

fn default_top_k() -> usize {
    4
}

fn default_chunk_size() -> usize {
    500
}

fn default_chunk_overlap() -> usize {
    50
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            docs_dir: None,
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_score: 0.0,
        }
    }
}

/// [tools] 段：默认超时、并发上限与外部 HTTP 工具
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 工具 schema 未声明 timeout_ms 时的默认超时（毫秒）
    #[serde(default = "default_tool_timeout_ms")]
    pub default_timeout_ms: u64,
    /// 同一模型回复中并发执行的工具数上限
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub http: Vec<HttpToolSection>,
}

fn default_tool_timeout_ms() -> u64 {
    10_000
}

fn default_max_concurrent() -> usize {
    3
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_tool_timeout_ms(),
            max_concurrent: default_max_concurrent(),
            http: Vec::new(),
        }
    }
}

/// [[tools.http]]：以 POST JSON 调用的外部营养数据 API
#[derive(Debug, Clone, Deserialize)]
pub struct HttpToolSection {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub endpoint: String,
    pub timeout_ms: Option<u64>,
    /// 参数声明：字段名 -> { type, required }
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
}

/// [guardrails] 段：检查顺序即执行顺序
#[derive(Debug, Clone, Deserialize)]
pub struct GuardrailsSection {
    #[serde(default = "default_input_checks")]
    pub input_checks: Vec<String>,
    #[serde(default = "default_output_checks")]
    pub output_checks: Vec<String>,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_blocked_terms")]
    pub blocked_terms: Vec<String>,
    #[serde(default = "default_claim_patterns")]
    pub claim_patterns: Vec<String>,
    #[serde(default = "default_claim_notice")]
    pub claim_notice: String,
}

fn default_input_checks() -> Vec<String> {
    vec!["max_length".into(), "blocked_terms".into()]
}

fn default_output_checks() -> Vec<String> {
    vec!["medical_claims".into(), "redact_contact".into()]
}

fn default_max_input_chars() -> usize {
    4_000
}

fn default_blocked_terms() -> Vec<String> {
    vec![
        "ignore previous instructions".into(),
        "ignore all previous instructions".into(),
        "reveal your system prompt".into(),
        "how to purge".into(),
        "stop eating completely".into(),
    ]
}

fn default_claim_patterns() -> Vec<String> {
    vec![
        r"\bcures?\b".into(),
        r"\bguaranteed to\b".into(),
        r"\bprevents? cancer\b".into(),
        r"\breverses? (?:diabetes|heart disease)\b".into(),
        r"\breplaces? (?:your )?medication\b".into(),
        r"\bdetox(?:es|ifies)? your (?:liver|body)\b".into(),
    ]
}

fn default_claim_notice() -> String {
    "Note: I can't make medical treatment claims. Please consult a registered dietitian or physician for medical advice.".to_string()
}

impl Default for GuardrailsSection {
    fn default() -> Self {
        Self {
            input_checks: default_input_checks(),
            output_checks: default_output_checks(),
            max_input_chars: default_max_input_chars(),
            blocked_terms: default_blocked_terms(),
            claim_patterns: default_claim_patterns(),
            claim_notice: default_claim_notice(),
        }
    }
}

/// [memory] 段：会话过期与持久化目录
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    /// 会话空闲多久后归档（秒）
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// 会话 JSON 持久化目录；未设置时仅内存
    pub persist_dir: Option<PathBuf>,
}

fn default_session_ttl_secs() -> u64 {
    3600
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl_secs(),
            persist_dir: None,
        }
    }
}

/// 从 config 目录加载配置，环境变量 NUTRI__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 NUTRI__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("NUTRI")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
