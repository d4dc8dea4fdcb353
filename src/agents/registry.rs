//! 智能体注册表
//!
//! 从 agents.toml 加载：
//!
//! ```toml
//! root = "nutrition_triage"
//!
//! [[agents]]
//! name = "nutrition_triage"
//! description = "Routes nutrition questions"
//! instructions = "..."
//! allowed_tools = ["nutrient_lookup"]
//! allowed_handoffs = ["macro_specialist"]
//! ```
//!
//! 加载时校验名称唯一、handoff 目标存在、根智能体存在；加载后不可变，
//! 热更新通过构造新注册表整体替换完成。

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    /// 能力描述，供其它智能体决定是否 handoff
    #[serde(default)]
    pub description: String,
    pub instructions: String,
    #[serde(default)]
    pub allowed_tools: BTreeSet<String>,
    #[serde(default)]
    pub allowed_handoffs: BTreeSet<String>,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instructions: instructions.into(),
            allowed_tools: BTreeSet::new(),
            allowed_handoffs: BTreeSet::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools.extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn with_handoffs<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_handoffs
            .extend(targets.into_iter().map(Into::into));
        self
    }

    pub fn can_use_tool(&self, tool: &str) -> bool {
        self.allowed_tools.contains(tool)
    }

    pub fn can_hand_off_to(&self, target: &str) -> bool {
        self.allowed_handoffs.contains(target)
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Duplicate agent name: {0}")]
    DuplicateAgentName(String),

    #[error("Agent '{agent}' hands off to unknown agent '{target}'")]
    DanglingHandoffTarget { agent: String, target: String },

    #[error("Root agent '{0}' is not defined")]
    UnknownRootAgent(String),

    #[error("Agent not found: {0}")]
    NotFound(String),

    #[error("Failed to parse agent definitions: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to read agent definitions: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateAgentName(_) => ErrorKind::DuplicateAgentName,
            Self::DanglingHandoffTarget { .. } => ErrorKind::DanglingHandoffTarget,
            Self::UnknownRootAgent(_) => ErrorKind::UnknownRootAgent,
            Self::NotFound(_) => ErrorKind::AgentNotFound,
            Self::Parse(_) | Self::Io(_) => ErrorKind::Storage,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AgentsFile {
    root: Option<String>,
    #[serde(default)]
    agents: Vec<AgentDefinition>,
}

#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: BTreeMap<String, AgentDefinition>,
    root: String,
}

impl AgentRegistry {
    pub fn load(
        definitions: Vec<AgentDefinition>,
        root: &str,
    ) -> Result<Self, RegistryError> {
        let mut agents = BTreeMap::new();
        for def in definitions {
            if agents.contains_key(&def.name) {
                return Err(RegistryError::DuplicateAgentName(def.name));
            }
            agents.insert(def.name.clone(), def);
        }
        for def in agents.values() {
            if let Some(target) = def
                .allowed_handoffs
                .iter()
                .find(|t| !agents.contains_key(t.as_str()))
            {
                return Err(RegistryError::DanglingHandoffTarget {
                    agent: def.name.clone(),
                    target: target.clone(),
                });
            }
        }
        if !agents.contains_key(root) {
            return Err(RegistryError::UnknownRootAgent(root.to_string()));
        }
        tracing::debug!(agents = agents.len(), root = %root, "agent registry loaded");
        Ok(Self {
            agents,
            root: root.to_string(),
        })
    }

    /// 解析 TOML；文件未声明 root 时使用 default_root
    pub fn from_toml_str(content: &str, default_root: &str) -> Result<Self, RegistryError> {
        let file: AgentsFile = toml::from_str(content)?;
        let root = file.root.unwrap_or_else(|| default_root.to_string());
        Self::load(file.agents, &root)
    }

    pub fn from_file(path: impl AsRef<Path>, default_root: &str) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content, default_root)
    }

    pub fn lookup(&self, name: &str) -> Result<&AgentDefinition, RegistryError> {
        self.agents
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn root(&self) -> &AgentDefinition {
        // load 已校验 root 存在
        &self.agents[&self.root]
    }

    pub fn root_name(&self) -> &str {
        &self.root
    }

    pub fn names(&self) -> Vec<&str> {
        self.agents.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// handoff 目标的 (名称, 描述)，供上下文组装
    pub fn handoff_targets(&self, agent: &AgentDefinition) -> Vec<(String, String)> {
        agent
            .allowed_handoffs
            .iter()
            .filter_map(|t| self.agents.get(t))
            .map(|a| (a.name.clone(), a.description.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triage() -> AgentDefinition {
        AgentDefinition::new("triage", "Route the question.")
            .with_tools(["nutrient_lookup"])
            .with_handoffs(["macro_specialist"])
    }

    fn macro_specialist() -> AgentDefinition {
        AgentDefinition::new("macro_specialist", "Compute macros.")
            .with_description("protein, carbs and fat targets")
            .with_tools(["lookup_profile"])
    }

    #[test]
    fn test_load_and_lookup() {
        let reg = AgentRegistry::load(vec![triage(), macro_specialist()], "triage").unwrap();
        assert_eq!(reg.root().name, "triage");
        assert!(reg.lookup("macro_specialist").unwrap().can_use_tool("lookup_profile"));
        assert_eq!(reg.lookup("ghost").unwrap_err().kind(), ErrorKind::AgentNotFound);
        assert_eq!(reg.names(), vec!["macro_specialist", "triage"]);
        assert_eq!(
            reg.handoff_targets(reg.root()),
            vec![(
                "macro_specialist".to_string(),
                "protein, carbs and fat targets".to_string()
            )]
        );
    }

    #[test]
    fn test_duplicate_name() {
        let err = AgentRegistry::load(vec![triage(), triage(), macro_specialist()], "triage")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateAgentName);
    }

    #[test]
    fn test_dangling_handoff() {
        let err = AgentRegistry::load(vec![triage()], "triage").unwrap_err();
        match err {
            RegistryError::DanglingHandoffTarget { agent, target } => {
                assert_eq!(agent, "triage");
                assert_eq!(target, "macro_specialist");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_root() {
        let err = AgentRegistry::load(vec![macro_specialist()], "triage").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownRootAgent);
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
root = "triage"

[[agents]]
name = "triage"
instructions = "Route."
allowed_handoffs = ["macro_specialist"]

[[agents]]
name = "macro_specialist"
description = "macros"
instructions = "Compute."
allowed_tools = ["lookup_profile", "nutrient_lookup"]
"#;
        let reg = AgentRegistry::from_toml_str(toml, "unused").unwrap();
        assert_eq!(reg.root_name(), "triage");
        assert_eq!(reg.lookup("macro_specialist").unwrap().allowed_tools.len(), 2);

        let err = AgentRegistry::from_toml_str("[[agents]]\nname = 1", "x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_from_file_uses_default_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.toml");
        std::fs::write(&path, "[[agents]]\nname = \"solo\"\ninstructions = \"Hi.\"\n").unwrap();
        let reg = AgentRegistry::from_file(&path, "solo").unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.root().instructions, "Hi.");
    }
}
