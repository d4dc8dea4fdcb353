//! 模型调用恢复策略
//!
//! 根据 ModelError 与已尝试次数返回 RecoveryAction：在重试预算内按指数退避重试，否则终止（ModelUnavailable）。

use std::time::Duration;

use crate::llm::ModelError;

/// 恢复引擎给出的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 等待后重新调用模型
    RetryAfter(Duration),
    /// 终止当前回合
    Abort,
}

/// 退避重试：第 n 次重试等待 base * 2^n，封顶 max_backoff；限流时至少等待服务端建议的时长
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_retries: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl RecoveryEngine {
    pub fn new(max_retries: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
            max_backoff,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// retries_done：已经执行过的重试次数（首次调用失败时为 0）
    pub fn handle(&self, err: &ModelError, retries_done: u32) -> RecoveryAction {
        if retries_done >= self.max_retries {
            return RecoveryAction::Abort;
        }
        let exp = self
            .base_backoff
            .saturating_mul(1u32.checked_shl(retries_done).unwrap_or(u32::MAX));
        let backoff = exp.min(self.max_backoff);
        match err {
            ModelError::RateLimited { retry_after_ms } => {
                RecoveryAction::RetryAfter(backoff.max(Duration::from_millis(*retry_after_ms)))
            }
            ModelError::Timeout | ModelError::Provider(_) | ModelError::InvalidOutput(_) => {
                RecoveryAction::RetryAfter(backoff)
            }
        }
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(2, Duration::from_millis(200), Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_exponential_backoff() {
        let engine = RecoveryEngine::new(3, Duration::from_millis(100), Duration::from_secs(10));
        let err = ModelError::Timeout;
        assert_eq!(engine.handle(&err, 0), RecoveryAction::RetryAfter(Duration::from_millis(100)));
        assert_eq!(engine.handle(&err, 1), RecoveryAction::RetryAfter(Duration::from_millis(200)));
        assert_eq!(engine.handle(&err, 2), RecoveryAction::RetryAfter(Duration::from_millis(400)));
        assert_eq!(engine.handle(&err, 3), RecoveryAction::Abort);
    }

    #[test]
    fn test_recovery_backoff_capped() {
        let engine = RecoveryEngine::new(10, Duration::from_millis(1000), Duration::from_millis(1500));
        let err = ModelError::Provider("502".into());
        assert_eq!(engine.handle(&err, 4), RecoveryAction::RetryAfter(Duration::from_millis(1500)));
    }

    #[test]
    fn test_recovery_rate_limited_respects_retry_after() {
        let engine = RecoveryEngine::default();
        let err = ModelError::RateLimited { retry_after_ms: 1000 };
        assert_eq!(engine.handle(&err, 0), RecoveryAction::RetryAfter(Duration::from_millis(1000)));
    }

    #[test]
    fn test_recovery_zero_retries_aborts_immediately() {
        let engine = RecoveryEngine::new(0, Duration::from_millis(10), Duration::from_millis(10));
        assert_eq!(engine.handle(&ModelError::Timeout, 0), RecoveryAction::Abort);
    }
}
