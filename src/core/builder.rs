//! 编排器构建器：从 AppConfig 统一组装模型、智能体、工具、护栏、记忆与知识库
//!
//! REPL 与集成测试共用同一套初始化逻辑。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::agents::{AgentDefinition, AgentRegistry};
use crate::config::AppConfig;
use crate::core::{Orchestrator, RecoveryEngine, TaskScheduler, TurnSettings};
use crate::guardrails::GuardrailPipeline;
use crate::knowledge::{Chunker, ChunkingConfig, KnowledgeRetriever, KnowledgeStore, Retriever};
use crate::llm::{create_embedder, EchoModel, ModelClient, OpenAiModel};
use crate::memory::{InMemoryStore, MemoryStore};
use crate::tools::{
    EchoTool, HttpTool, NutrientLookupTool, ProfileLookupTool, ToolDispatcher, ToolRegistry,
};

const AGENTS_FILE_CANDIDATES: [&str; 2] = ["config/agents.toml", "../config/agents.toml"];

/// 编排器构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    model: Option<Arc<dyn ModelClient>>,
    memory: Option<Arc<dyn MemoryStore>>,
    agents: Option<AgentRegistry>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            model: None,
            memory: None,
            agents: None,
        }
    }

    /// 指定模型（测试注入 ScriptedModel）；未指定时按 [llm].provider 创建
    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_agents(mut self, agents: AgentRegistry) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 按 provider 创建模型客户端：openai 需要 OPENAI_API_KEY，否则回退到 EchoModel
    pub fn build_model(&self) -> Arc<dyn ModelClient> {
        let llm = &self.config.llm;
        match llm.provider.as_str() {
            "openai" => {
                let key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());
                match key {
                    Some(key) => {
                        tracing::info!(model = %llm.model, "using OpenAI-compatible model");
                        Arc::new(OpenAiModel::new(llm.base_url.as_deref(), &llm.model, Some(&key)))
                    }
                    None => {
                        tracing::warn!("OPENAI_API_KEY not set; falling back to echo model");
                        Arc::new(EchoModel)
                    }
                }
            }
            "mock" => Arc::new(EchoModel),
            other => {
                tracing::warn!(provider = %other, "unknown llm provider; falling back to echo model");
                Arc::new(EchoModel)
            }
        }
    }

    pub fn build_memory(&self) -> anyhow::Result<Arc<dyn MemoryStore>> {
        match &self.config.memory.persist_dir {
            Some(dir) => {
                let store = InMemoryStore::persistent(dir)
                    .with_context(|| format!("open session store at {}", dir.display()))?;
                tracing::info!(dir = %dir.display(), "session persistence enabled");
                Ok(Arc::new(store))
            }
            None => Ok(Arc::new(InMemoryStore::new())),
        }
    }

    /// 内置工具 + [[tools.http]] 声明的外部工具
    pub fn build_tool_registry(&self, memory: Arc<dyn MemoryStore>) -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        tools.register(NutrientLookupTool);
        tools.register(ProfileLookupTool::new(memory));
        for section in &self.config.tools.http {
            tools.register(HttpTool::from_config(section));
        }
        tools
    }

    pub fn build_dispatcher(&self, memory: Arc<dyn MemoryStore>) -> ToolDispatcher {
        ToolDispatcher::new(
            self.build_tool_registry(memory),
            self.config.tools.default_timeout_ms,
        )
        .with_scheduler(TaskScheduler::new(self.config.tools.max_concurrent))
    }

    pub fn build_guardrails(&self) -> anyhow::Result<GuardrailPipeline> {
        GuardrailPipeline::from_config(&self.config.guardrails).context("build guardrail pipeline")
    }

    /// 知识库：索引 [retrieval].docs_dir 下的文档；目录不存在时为空库
    pub async fn build_retriever(&self) -> anyhow::Result<Arc<dyn Retriever>> {
        let r = &self.config.retrieval;
        let embedder = create_embedder(
            self.config.llm.base_url.as_deref(),
            self.config.llm.embedding_model.as_deref(),
        );
        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: r.chunk_size,
            chunk_overlap: r.chunk_overlap,
            ..Default::default()
        });
        let store = Arc::new(KnowledgeStore::new(embedder, chunker));
        if let Some(dir) = &r.docs_dir {
            if dir.is_dir() {
                let chunks = store
                    .index_dir(dir)
                    .await
                    .with_context(|| format!("index knowledge dir {}", dir.display()))?;
                tracing::info!(dir = %dir.display(), chunks, "knowledge base indexed");
            } else {
                tracing::warn!(dir = %dir.display(), "knowledge dir not found; retrieval disabled");
            }
        }
        Ok(Arc::new(KnowledgeRetriever::new(store, r.min_score)))
    }

    /// 智能体定义：[app].agents_file → config/agents.toml → 内置默认
    pub fn build_agents(&self) -> anyhow::Result<AgentRegistry> {
        let root = &self.config.orchestrator.root_agent;
        let path: Option<PathBuf> = self.config.app.agents_file.clone().or_else(|| {
            AGENTS_FILE_CANDIDATES
                .iter()
                .map(PathBuf::from)
                .find(|p| p.exists())
        });
        match path {
            Some(path) => AgentRegistry::from_file(&path, root)
                .with_context(|| format!("load agents from {}", path.display())),
            None => {
                tracing::info!("no agents file found; using built-in agents");
                default_agents(root)
            }
        }
    }

    pub fn recovery(&self) -> RecoveryEngine {
        let o = &self.config.orchestrator;
        RecoveryEngine::new(
            o.model_retries,
            Duration::from_millis(o.retry_backoff_ms),
            Duration::from_millis(o.max_backoff_ms),
        )
    }

    pub async fn build(mut self) -> anyhow::Result<Orchestrator> {
        let memory = match &self.memory {
            Some(m) => m.clone(),
            None => self.build_memory()?,
        };
        let model = match &self.model {
            Some(m) => m.clone(),
            None => self.build_model(),
        };
        let dispatcher = self.build_dispatcher(memory.clone());
        let guardrails = self.build_guardrails()?;
        let retriever = self.build_retriever().await?;
        let recovery = self.recovery();
        let settings = TurnSettings::from_config(&self.config);
        let agents = match self.agents.take() {
            Some(a) => a,
            None => self.build_agents()?,
        };

        tracing::info!(
            agents = agents.len(),
            root = %agents.root_name(),
            tools = dispatcher.registry().tool_names().len(),
            "orchestrator ready"
        );

        Ok(Orchestrator::new(model, agents, dispatcher, memory)
            .with_guardrails(guardrails)
            .with_retriever(retriever)
            .with_recovery(recovery)
            .with_settings(settings))
    }
}

/// 内置智能体：分诊 + 宏量营养专家
fn default_agents(root: &str) -> anyhow::Result<AgentRegistry> {
    let triage = AgentDefinition::new(
        root,
        "You are a friendly nutrition assistant. Answer general questions directly. \
         Hand off to macro_specialist for protein, carbohydrate, fat or calorie targets.",
    )
    .with_description("General nutrition questions and routing")
    .with_tools(["nutrient_lookup", "echo"])
    .with_handoffs(["macro_specialist"]);

    let macros = AgentDefinition::new(
        "macro_specialist",
        "You compute macronutrient targets. Look up the user's profile first; \
         if it is unavailable, give a general range and say so.",
    )
    .with_description("Protein, carbohydrate, fat and calorie targets")
    .with_tools(["lookup_profile", "nutrient_lookup"])
    .with_handoffs([root]);

    AgentRegistry::load(vec![triage, macros], root).context("build default agents")
}

/// 便捷函数：从默认路径加载配置并创建构建器
pub fn create_builder(config_path: Option<PathBuf>) -> OrchestratorBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    OrchestratorBuilder::new(config)
}

/// 会话定期清理：每 interval 淘汰一次空闲超过 ttl 的会话
pub fn spawn_session_reaper(
    orchestrator: Arc<Orchestrator>,
    ttl: Duration,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = orchestrator.cleanup_expired(ttl).await;
            if evicted > 0 {
                tracing::info!(evicted, "expired sessions archived");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_agents_are_valid() {
        let reg = default_agents("nutrition_triage").unwrap();
        assert_eq!(reg.root_name(), "nutrition_triage");
        assert!(reg
            .lookup("nutrition_triage")
            .unwrap()
            .can_hand_off_to("macro_specialist"));
        assert!(reg.lookup("macro_specialist").unwrap().can_use_tool("lookup_profile"));
    }

    #[tokio::test]
    async fn test_build_with_defaults() {
        let mut config = AppConfig::default();
        config.app.agents_file = None;
        let builder = OrchestratorBuilder::new(config)
            .with_agents(default_agents("nutrition_triage").unwrap());
        let orch = builder.build().await.unwrap();
        assert_eq!(orch.agents().root_name(), "nutrition_triage");
        assert!(orch.dispatcher().registry().contains("lookup_profile"));
        assert_eq!(orch.settings().max_handoffs, 3);
    }

    #[test]
    fn test_unknown_guardrail_check_fails_build() {
        let mut config = AppConfig::default();
        config.guardrails.output_checks = vec!["nope".into()];
        assert!(OrchestratorBuilder::new(config).build_guardrails().is_err());
    }
}
