//! 记忆存储
//!
//! - 会话：追加式历史 + 活跃智能体 + 回合计数 + 会话级 key/value 记录
//! - 长期：按用户的 key/value 记录，跨会话，后写覆盖（LWW）
//!
//! 每个回合的全部变更经 `commit_turn` 一次性落库：先在副本上完成修改并持久化，成功后再替换，
//! 因此任何错误都不会留下部分写入。序号在提交时于会话锁内分配，保证无空洞。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::memory::persistence::{LongTermMap, SessionPersistence, SessionSnapshot};
use crate::memory::{Message, SessionId};

/// 记录作用域
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum RecordScope {
    Session(SessionId),
    User(String),
}

/// 一条 key/value 记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub scope: RecordScope,
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Closed,
    Error,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MemoryError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Session closed: {0}")]
    SessionClosed(SessionId),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for MemoryError {
    fn from(e: anyhow::Error) -> Self {
        MemoryError::Storage(format!("{:#}", e))
    }
}

/// 会话只读视图
#[derive(Clone, Debug, PartialEq)]
pub struct SessionView {
    pub id: SessionId,
    pub user_id: String,
    pub status: SessionStatus,
    pub active_agent: Option<String>,
    pub turn_counter: u64,
    pub messages: Vec<Message>,
    pub records: Vec<MemoryRecord>,
}

impl SessionView {
    pub fn record(&self, key: &str) -> Option<&str> {
        self.records
            .iter()
            .find(|r| r.key == key)
            .map(|r| r.value.as_str())
    }
}

impl From<&SessionSnapshot> for SessionView {
    fn from(s: &SessionSnapshot) -> Self {
        Self {
            id: s.id.clone(),
            user_id: s.user_id.clone(),
            status: s.status,
            active_agent: s.active_agent.clone(),
            turn_counter: s.turn_counter,
            messages: s.messages.clone(),
            records: s.records.values().cloned().collect(),
        }
    }
}

/// 一个回合的全部待提交变更
#[derive(Clone, Debug, Default)]
pub struct TurnCommit {
    /// 按产生顺序；seq 在提交时分配
    pub messages: Vec<Message>,
    /// Some 时替换活跃智能体
    pub active_agent: Option<String>,
    pub session_records: Vec<(String, String)>,
    pub long_term_records: Vec<(String, String)>,
    pub status: SessionStatus,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// 创建会话；已存在时不做修改
    async fn create_session(&self, session_id: &str, user_id: &str) -> Result<(), MemoryError>;

    async fn get(&self, session_id: &str) -> Result<SessionView, MemoryError>;

    /// 用户长期记录（按 key 排序）
    async fn get_long_term(&self, user_id: &str) -> Vec<MemoryRecord>;

    /// 追加单条消息，返回带序号的副本
    async fn append(&self, session_id: &str, message: Message) -> Result<Message, MemoryError>;

    async fn set_record(
        &self,
        scope: RecordScope,
        key: &str,
        value: &str,
    ) -> Result<(), MemoryError>;

    /// 原子提交一个回合，返回带序号的消息
    async fn commit_turn(
        &self,
        session_id: &str,
        commit: TurnCommit,
    ) -> Result<Vec<Message>, MemoryError>;

    /// 最近 limit 条（时间顺序）；None 为全部
    async fn history(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, MemoryError>;

    /// 移除并返回最后一条消息
    async fn pop_message(&self, session_id: &str) -> Result<Option<Message>, MemoryError>;

    /// 清空历史（记录与活跃智能体保留）
    async fn clear(&self, session_id: &str) -> Result<(), MemoryError>;

    /// 关闭会话：会话级记录随之销毁
    async fn close(&self, session_id: &str) -> Result<(), MemoryError>;

    /// 淘汰空闲超过 ttl 的会话，返回被淘汰的会话 ID；busy 中的会话（回合进行中）跳过
    async fn cleanup_expired(&self, ttl: Duration, busy: &[SessionId]) -> Vec<SessionId>;
}

struct SessionSlot {
    snapshot: SessionSnapshot,
    last_active: Instant,
}

/// 内存实现，可选 JSON 持久化（write-through + 懒加载）
pub struct InMemoryStore {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<SessionSlot>>>>,
    long_term: Mutex<LongTermMap>,
    persistence: Option<SessionPersistence>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            long_term: Mutex::new(LongTermMap::new()),
            persistence: None,
        }
    }

    /// 以 dir 为持久化目录；长期记录立即加载，会话按需加载
    pub fn persistent(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let persistence = SessionPersistence::new(dir);
        let long_term = persistence.load_long_term()?;
        Ok(Self {
            sessions: RwLock::new(HashMap::new()),
            long_term: Mutex::new(long_term),
            persistence: Some(persistence),
        })
    }

    async fn slot(&self, session_id: &str) -> Result<Arc<Mutex<SessionSlot>>, MemoryError> {
        if let Some(slot) = self.sessions.read().await.get(session_id) {
            return Ok(slot.clone());
        }
        let Some(persistence) = &self.persistence else {
            return Err(MemoryError::SessionNotFound(session_id.to_string()));
        };
        let snapshot = persistence
            .load_session(session_id)?
            .ok_or_else(|| MemoryError::SessionNotFound(session_id.to_string()))?;
        tracing::debug!(session = %session_id, messages = snapshot.messages.len(), "session reloaded");
        let mut sessions = self.sessions.write().await;
        let slot = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SessionSlot {
                    snapshot,
                    last_active: Instant::now(),
                }))
            })
            .clone();
        Ok(slot)
    }

    fn save(&self, snapshot: &SessionSnapshot) -> Result<(), MemoryError> {
        if let Some(p) = &self.persistence {
            p.save_session(snapshot)?;
        }
        Ok(())
    }

    fn save_long_term(&self, map: &LongTermMap) -> Result<(), MemoryError> {
        if let Some(p) = &self.persistence {
            p.save_long_term(map)?;
        }
        Ok(())
    }

    /// 在副本上修改并持久化，成功后替换；闭包返回值透传
    async fn mutate<T: Send>(
        &self,
        session_id: &str,
        allow_closed: bool,
        f: impl FnOnce(&mut SessionSnapshot) -> T + Send,
    ) -> Result<T, MemoryError> {
        let slot = self.slot(session_id).await?;
        let mut guard = slot.lock().await;
        if !allow_closed && guard.snapshot.status == SessionStatus::Closed {
            return Err(MemoryError::SessionClosed(session_id.to_string()));
        }
        let mut next = guard.snapshot.clone();
        let out = f(&mut next);
        self.save(&next)?;
        guard.snapshot = next;
        guard.last_active = Instant::now();
        Ok(out)
    }
}

fn upsert(
    records: &mut std::collections::BTreeMap<String, MemoryRecord>,
    scope: RecordScope,
    key: &str,
    value: &str,
    now: DateTime<Utc>,
) {
    records.insert(
        key.to_string(),
        MemoryRecord {
            scope,
            key: key.to_string(),
            value: value.to_string(),
            updated_at: now,
        },
    );
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn create_session(&self, session_id: &str, user_id: &str) -> Result<(), MemoryError> {
        if self.slot(session_id).await.is_ok() {
            return Ok(());
        }
        let snapshot = SessionSnapshot::new(session_id, user_id);
        self.save(&snapshot)?;
        let mut sessions = self.sessions.write().await;
        sessions.entry(session_id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(SessionSlot {
                snapshot,
                last_active: Instant::now(),
            }))
        });
        tracing::info!(session = %session_id, user = %user_id, "session created");
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<SessionView, MemoryError> {
        let slot = self.slot(session_id).await?;
        let mut guard = slot.lock().await;
        guard.last_active = Instant::now();
        Ok(SessionView::from(&guard.snapshot))
    }

    async fn get_long_term(&self, user_id: &str) -> Vec<MemoryRecord> {
        self.long_term
            .lock()
            .await
            .get(user_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn append(&self, session_id: &str, mut message: Message) -> Result<Message, MemoryError> {
        self.mutate(session_id, false, move |s| {
            message.seq = s.next_seq();
            s.messages.push(message.clone());
            message
        })
        .await
    }

    async fn set_record(
        &self,
        scope: RecordScope,
        key: &str,
        value: &str,
    ) -> Result<(), MemoryError> {
        let now = Utc::now();
        match scope.clone() {
            RecordScope::Session(id) => {
                self.mutate(&id, false, |s| upsert(&mut s.records, scope, key, value, now))
                    .await
            }
            RecordScope::User(user) => {
                let mut long_term = self.long_term.lock().await;
                let mut next = long_term.clone();
                upsert(next.entry(user).or_default(), scope, key, value, now);
                self.save_long_term(&next)?;
                *long_term = next;
                Ok(())
            }
        }
    }

    async fn commit_turn(
        &self,
        session_id: &str,
        commit: TurnCommit,
    ) -> Result<Vec<Message>, MemoryError> {
        let slot = self.slot(session_id).await?;
        let mut guard = slot.lock().await;
        if guard.snapshot.status == SessionStatus::Closed {
            return Err(MemoryError::SessionClosed(session_id.to_string()));
        }
        // 两把锁都在修改前取得；以下不再 await
        let mut long_term = self.long_term.lock().await;

        let now = Utc::now();
        let mut next = guard.snapshot.clone();
        let mut seq = next.next_seq();
        let mut committed = Vec::with_capacity(commit.messages.len());
        for mut msg in commit.messages {
            msg.seq = seq;
            seq += 1;
            committed.push(msg.clone());
            next.messages.push(msg);
        }
        if let Some(agent) = commit.active_agent {
            next.active_agent = Some(agent);
        }
        for (key, value) in &commit.session_records {
            let scope = RecordScope::Session(session_id.to_string());
            upsert(&mut next.records, scope, key, value, now);
        }
        next.turn_counter += 1;
        next.status = commit.status;

        let next_long_term = if commit.long_term_records.is_empty() {
            None
        } else {
            let mut lt = long_term.clone();
            let user = next.user_id.clone();
            let entry = lt.entry(user.clone()).or_default();
            for (key, value) in &commit.long_term_records {
                upsert(entry, RecordScope::User(user.clone()), key, value, now);
            }
            Some(lt)
        };

        self.save(&next)?;
        if let Some(lt) = next_long_term {
            self.save_long_term(&lt)?;
            *long_term = lt;
        }
        tracing::debug!(
            session = %session_id,
            turn = next.turn_counter,
            messages = committed.len(),
            "turn committed"
        );
        guard.snapshot = next;
        guard.last_active = Instant::now();
        Ok(committed)
    }

    async fn history(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, MemoryError> {
        let slot = self.slot(session_id).await?;
        let guard = slot.lock().await;
        let msgs = &guard.snapshot.messages;
        let start = limit.map(|n| msgs.len().saturating_sub(n)).unwrap_or(0);
        Ok(msgs[start..].to_vec())
    }

    async fn pop_message(&self, session_id: &str) -> Result<Option<Message>, MemoryError> {
        self.mutate(session_id, false, |s| s.messages.pop()).await
    }

    async fn clear(&self, session_id: &str) -> Result<(), MemoryError> {
        self.mutate(session_id, false, |s| s.messages.clear()).await
    }

    async fn close(&self, session_id: &str) -> Result<(), MemoryError> {
        self.mutate(session_id, true, |s| {
            s.status = SessionStatus::Closed;
            s.records.clear();
        })
        .await?;
        tracing::info!(session = %session_id, "session closed");
        Ok(())
    }

    async fn cleanup_expired(&self, ttl: Duration, busy: &[SessionId]) -> Vec<SessionId> {
        let mut sessions = self.sessions.write().await;
        let mut expired = Vec::new();
        for (id, slot) in sessions.iter() {
            if busy.contains(id) {
                continue;
            }
            // 加锁失败说明正在写入
            let Ok(mut guard) = slot.try_lock() else {
                continue;
            };
            if guard.last_active.elapsed() < ttl {
                continue;
            }
            if guard.snapshot.status != SessionStatus::Closed {
                guard.snapshot.status = SessionStatus::Closed;
                guard.snapshot.records.clear();
                if let Err(e) = self.save(&guard.snapshot) {
                    tracing::warn!(session = %id, error = %e, "failed to archive expired session");
                    continue;
                }
            }
            expired.push(id.clone());
        }
        for id in &expired {
            sessions.remove(id);
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired sessions evicted");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Role;

    async fn store_with_session() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.create_session("s1", "u1").await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_append_assigns_gap_free_seq() {
        let store = store_with_session().await;
        let a = store.append("s1", Message::user("a", "one")).await.unwrap();
        let b = store.append("s1", Message::user("b", "two")).await.unwrap();
        assert_eq!((a.seq, b.seq), (1, 2));
        let popped = store.pop_message("s1").await.unwrap().unwrap();
        assert_eq!(popped.id, "b");
        let c = store.append("s1", Message::user("c", "three")).await.unwrap();
        assert_eq!(c.seq, 2);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let store = InMemoryStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert_eq!(err, MemoryError::SessionNotFound("nope".into()));
    }

    #[tokio::test]
    async fn test_commit_turn_is_atomic_and_ordered() {
        let store = store_with_session().await;
        let commit = TurnCommit {
            messages: vec![
                Message::user("msg-1-1", "hi"),
                Message::agent("msg-1-2", "triage", "hello"),
            ],
            active_agent: Some("triage".into()),
            session_records: vec![("last_tools".into(), "".into())],
            long_term_records: vec![("goal".into(), "cut".into())],
            status: SessionStatus::Active,
        };
        let committed = store.commit_turn("s1", commit).await.unwrap();
        assert_eq!(committed.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2]);

        let view = store.get("s1").await.unwrap();
        assert_eq!(view.turn_counter, 1);
        assert_eq!(view.active_agent.as_deref(), Some("triage"));
        assert_eq!(view.record("last_tools"), Some(""));
        assert_eq!(view.messages[1].role, Role::Agent);

        let lt = store.get_long_term("u1").await;
        assert_eq!(lt.len(), 1);
        assert_eq!(lt[0].value, "cut");
    }

    #[tokio::test]
    async fn test_long_term_last_writer_wins() {
        let store = InMemoryStore::new();
        let scope = RecordScope::User("u1".into());
        store.set_record(scope.clone(), "diet", "omnivore").await.unwrap();
        store.set_record(scope, "diet", "vegetarian").await.unwrap();
        let lt = store.get_long_term("u1").await;
        assert_eq!(lt.len(), 1);
        assert_eq!(lt[0].value, "vegetarian");
    }

    #[tokio::test]
    async fn test_history_limit_and_clear() {
        let store = store_with_session().await;
        for i in 0..5 {
            store.append("s1", Message::user(format!("m{i}"), "x")).await.unwrap();
        }
        let last_two = store.history("s1", Some(2)).await.unwrap();
        assert_eq!(last_two.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![4, 5]);
        store.clear("s1").await.unwrap();
        assert!(store.history("s1", None).await.unwrap().is_empty());
        let next = store.append("s1", Message::user("n", "x")).await.unwrap();
        assert_eq!(next.seq, 1);
    }

    #[tokio::test]
    async fn test_close_destroys_session_records() {
        let store = store_with_session().await;
        store
            .set_record(RecordScope::Session("s1".into()), "scratch", "1")
            .await
            .unwrap();
        store.close("s1").await.unwrap();
        let view = store.get("s1").await.unwrap();
        assert_eq!(view.status, SessionStatus::Closed);
        assert!(view.records.is_empty());
        let err = store.append("s1", Message::user("x", "y")).await.unwrap_err();
        assert_eq!(err, MemoryError::SessionClosed("s1".into()));
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let store = store_with_session().await;
        store.create_session("s2", "u2").await.unwrap();
        assert!(store.cleanup_expired(Duration::from_secs(3600), &[]).await.is_empty());
        let evicted = store.cleanup_expired(Duration::ZERO, &["s2".to_string()]).await;
        assert_eq!(evicted, vec!["s1".to_string()]);
        assert!(store.get("s1").await.is_err());
        let mut evicted = store.cleanup_expired(Duration::ZERO, &[]).await;
        evicted.sort();
        assert_eq!(evicted, vec!["s2".to_string()]);
    }

    #[tokio::test]
    async fn test_read_refreshes_last_active() {
        let store = store_with_session().await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        store.get("s1").await.unwrap();
        assert!(store
            .cleanup_expired(Duration::from_millis(30), &[])
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_persistent_store_reloads_lazily() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = InMemoryStore::persistent(dir.path()).unwrap();
            store.create_session("s1", "u1").await.unwrap();
            store.append("s1", Message::user("a", "hello")).await.unwrap();
            store
                .set_record(RecordScope::User("u1".into()), "weight_kg", "70")
                .await
                .unwrap();
        }
        let store = InMemoryStore::persistent(dir.path()).unwrap();
        let view = store.get("s1").await.unwrap();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].seq, 1);
        assert_eq!(store.get_long_term("u1").await[0].value, "70");
    }
}
