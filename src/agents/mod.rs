//! 智能体定义与注册表

pub mod registry;

pub use registry::{AgentDefinition, AgentRegistry, RegistryError};
