//! 会话持久化
//!
//! 目录布局：`{dir}/sessions/{session_id}.json`（历史、活跃智能体、回合计数、状态、会话记录）
//! 与 `{dir}/long_term.json`（按用户的长期记录）。写入先落临时文件再 rename，避免半写文件。

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::memory::{MemoryRecord, Message, SessionId, SessionStatus};

/// 会话快照（即持久化格式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub user_id: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub active_agent: Option<String>,
    #[serde(default)]
    pub turn_counter: u64,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub records: BTreeMap<String, MemoryRecord>,
}

impl SessionSnapshot {
    pub fn new(id: &str, user_id: &str) -> Self {
        Self {
            id: id.to_string(),
            user_id: user_id.to_string(),
            status: SessionStatus::Active,
            active_agent: None,
            turn_counter: 0,
            messages: Vec::new(),
            records: BTreeMap::new(),
        }
    }

    /// 下一条消息的序号
    pub fn next_seq(&self) -> u64 {
        self.messages.last().map(|m| m.seq + 1).unwrap_or(1)
    }
}

/// 长期记录：user_id -> key -> record
pub type LongTermMap = HashMap<String, BTreeMap<String, MemoryRecord>>;

/// JSON 文件持久化
#[derive(Debug, Clone)]
pub struct SessionPersistence {
    dir: PathBuf,
}

impl SessionPersistence {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join("sessions").join(format!("{}.json", safe))
    }

    fn long_term_path(&self) -> PathBuf {
        self.dir.join("long_term.json")
    }

    /// 加载会话快照；文件不存在时返回 None
    pub fn load_session(&self, session_id: &str) -> anyhow::Result<Option<SessionSnapshot>> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        let snapshot = serde_json::from_str(&data)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(snapshot))
    }

    pub fn save_session(&self, snapshot: &SessionSnapshot) -> anyhow::Result<()> {
        write_atomic(&self.session_path(&snapshot.id), &serde_json::to_string_pretty(snapshot)?)
    }

    pub fn remove_session(&self, session_id: &str) -> anyhow::Result<()> {
        let path = self.session_path(session_id);
        if path.exists() {
            std::fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        }
        Ok(())
    }

    pub fn load_long_term(&self) -> anyhow::Result<LongTermMap> {
        let path = self.long_term_path();
        if !path.exists() {
            return Ok(LongTermMap::new());
        }
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        Ok(serde_json::from_str(&data).with_context(|| format!("parse {}", path.display()))?)
    }

    pub fn save_long_term(&self, records: &LongTermMap) -> anyhow::Result<()> {
        write_atomic(&self.long_term_path(), &serde_json::to_string_pretty(records)?)
    }
}

/// 写临时文件后 rename；父目录不存在时自动创建
fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Message, RecordScope};
    use chrono::Utc;

    #[test]
    fn test_session_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let p = SessionPersistence::new(dir.path());
        let mut snap = SessionSnapshot::new("session_1", "u1");
        let mut msg = Message::user("msg-1-1", "hello");
        msg.seq = 1;
        snap.messages.push(msg);
        snap.active_agent = Some("macro_specialist".into());
        snap.turn_counter = 1;
        p.save_session(&snap).unwrap();

        let loaded = p.load_session("session_1").unwrap().unwrap();
        assert_eq!(loaded, snap);
        assert_eq!(loaded.next_seq(), 2);
        assert!(p.load_session("missing").unwrap().is_none());

        p.remove_session("session_1").unwrap();
        assert!(p.load_session("session_1").unwrap().is_none());
    }

    #[test]
    fn test_unsafe_ids_stay_inside_dir() {
        let dir = tempfile::tempdir().unwrap();
        let p = SessionPersistence::new(dir.path());
        let snap = SessionSnapshot::new("../escape", "u1");
        p.save_session(&snap).unwrap();
        assert!(dir.path().join("sessions").join("___escape.json").exists());
    }

    #[test]
    fn test_long_term_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let p = SessionPersistence::new(dir.path());
        let mut map = LongTermMap::new();
        map.entry("u1".into()).or_default().insert(
            "diet".into(),
            MemoryRecord {
                scope: RecordScope::User("u1".into()),
                key: "diet".into(),
                value: "vegetarian".into(),
                updated_at: Utc::now(),
            },
        );
        p.save_long_term(&map).unwrap();
        assert_eq!(p.load_long_term().unwrap(), map);
    }
}
