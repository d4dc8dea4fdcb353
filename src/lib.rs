//! Nutri - 营养助手多智能体编排核心
//!
//! 模块划分：
//! - **agents**: 智能体定义与注册表（工具白名单、handoff 白名单）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 回合状态机、编排主循环、错误与恢复、会话监管
//! - **guardrails**: 输入 / 输出护栏流水线
//! - **knowledge**: 文档分块、嵌入索引与检索
//! - **llm**: 模型接口抽象与实现（OpenAI 兼容 / 脚本化 / 回显）
//! - **memory**: 会话消息、会话 / 长期记录与持久化
//! - **observability**: 日志初始化
//! - **tools**: 工具 schema、注册表、分发器与内置工具

pub mod agents;
pub mod config;
pub mod core;
pub mod guardrails;
pub mod knowledge;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;

pub use crate::core::{Orchestrator, OrchestratorBuilder, TurnFailure, TurnResponse};
