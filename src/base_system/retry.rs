//! 退避重试策略：等待时间从 `min_wait` 开始按 2 的幂增长，封顶 `max_wait`。

use std::time::Duration;

use crate::download::models::DEFAULT_MAX_RETRIES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 总尝试次数（含第一次）。
    pub max_attempts: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            min_wait: Duration::from_millis(200),
            max_wait: Duration::from_millis(3000),
        }
    }
}

impl RetryPolicy {
    pub fn from_millis(max_attempts: u32, min_wait_ms: u64, max_wait_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_wait: Duration::from_millis(min_wait_ms),
            max_wait: Duration::from_millis(max_wait_ms),
        }
    }

    /// 第 `attempt` 次失败（从 0 计）之后的等待时间。
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let min_ms = self.min_wait.as_millis() as u64;
        let max_ms = (self.max_wait.as_millis() as u64).max(min_ms);
        let shift = attempt.min(10);
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        Duration::from_millis(min_ms.saturating_mul(factor).min(max_ms))
    }

    pub fn sleep(&self, attempt: u32) {
        let wait = self.delay_for(attempt);
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }
}
