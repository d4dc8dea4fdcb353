//! 核心编排层：回合状态机、错误与恢复、审计事件、会话监管、任务调度、构建器

pub mod builder;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod state;
pub mod task_scheduler;

pub use builder::{create_builder, spawn_session_reaper, OrchestratorBuilder};
pub use error::{ErrorKind, OrchestratorError, TurnFailure};
pub use events::TurnEvent;
pub use orchestrator::{parse_remember, Orchestrator, TurnSettings};
pub use recovery::{RecoveryAction, RecoveryEngine};
pub use session_supervisor::SessionSupervisor;
pub use state::{ToolInvocation, TurnOutcome, TurnResponse, TurnState};
pub use task_scheduler::TaskScheduler;
