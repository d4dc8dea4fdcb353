//! 会话监管：回合串行化与取消
//!
//! 每个会话持有一把回合锁（同一会话同一时刻只跑一个回合）与当前回合的 CancellationToken；
//! 不同会话互不阻塞。取消只作用于正在进行的回合，回合结束后旧 token 失效。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct SessionSlot {
    turn_lock: Arc<tokio::sync::Mutex<()>>,
    cancel_token: Option<CancellationToken>,
}

/// 会话级生命周期管理：回合锁与取消令牌
#[derive(Debug, Default)]
pub struct SessionSupervisor {
    slots: Mutex<HashMap<String, SessionSlot>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_slot<R>(&self, session_id: &str, f: impl FnOnce(&mut SessionSlot) -> R) -> R {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        f(slots.entry(session_id.to_string()).or_default())
    }

    /// 会话的回合锁（同一会话的回合依次执行）
    pub fn turn_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.with_slot(session_id, |slot| slot.turn_lock.clone())
    }

    /// 开始新回合：创建新的取消令牌
    pub fn begin_turn(&self, session_id: &str) -> CancellationToken {
        self.with_slot(session_id, |slot| {
            let token = CancellationToken::new();
            slot.cancel_token = Some(token.clone());
            token
        })
    }

    /// 回合结束：丢弃令牌，之后的 cancel 不影响下一回合
    pub fn finish_turn(&self, session_id: &str) {
        self.with_slot(session_id, |slot| {
            slot.cancel_token = None;
        });
    }

    /// 取消会话中正在进行的回合；无进行中回合时返回 false
    pub fn cancel(&self, session_id: &str) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.get(session_id).and_then(|s| s.cancel_token.as_ref()) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 锁住所有空闲会话的回合锁，返回（守卫, 忙碌会话）；持有守卫期间这些会话不会开始新回合
    pub fn lock_idle(&self) -> (Vec<OwnedMutexGuard<()>>, Vec<String>) {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut guards = Vec::new();
        let mut busy = Vec::new();
        for (id, slot) in slots.iter() {
            match slot.turn_lock.clone().try_lock_owned() {
                Ok(guard) => guards.push(guard),
                Err(_) => busy.push(id.clone()),
            }
        }
        (guards, busy)
    }

    /// 会话归档后释放其槽位
    pub fn forget(&self, session_id: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_only_hits_running_turn() {
        let sup = SessionSupervisor::new();
        assert!(!sup.cancel("s1"));
        let token = sup.begin_turn("s1");
        assert!(sup.cancel("s1"));
        assert!(token.is_cancelled());
        sup.finish_turn("s1");
        let next = sup.begin_turn("s1");
        assert!(!next.is_cancelled());
    }

    #[tokio::test]
    async fn test_turn_lock_is_per_session() {
        let sup = SessionSupervisor::new();
        let a = sup.turn_lock("a");
        let b = sup.turn_lock("b");
        let _ga = a.lock().await;
        assert!(b.try_lock().is_ok());
        assert!(sup.turn_lock("a").try_lock().is_err());
    }

    #[tokio::test]
    async fn test_lock_idle_reports_running_turns() {
        let sup = SessionSupervisor::new();
        let a = sup.turn_lock("a");
        let _b = sup.turn_lock("b");
        let _ga = a.lock().await;
        let (guards, busy) = sup.lock_idle();
        assert_eq!(busy, vec!["a".to_string()]);
        assert_eq!(guards.len(), 1);
        assert!(sup.turn_lock("b").try_lock().is_err());
        drop(guards);
        assert!(sup.turn_lock("b").try_lock().is_ok());
    }
}
