//! 记忆层：会话历史（追加、带序号）、会话/长期记录、JSON 持久化

pub mod conversation;
pub mod persistence;
pub mod store;

pub use conversation::{recent_window, Message, MessagePayload, Role, SessionId};
pub use persistence::{SessionPersistence, SessionSnapshot};
pub use store::{
    InMemoryStore, MemoryError, MemoryRecord, MemoryStore, RecordScope, SessionStatus, SessionView,
    TurnCommit,
};
