use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 重试策略：有界指数退避 + 抖动
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 最多尝试次数（包括第一次）
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 抖动比例 0.0..=1.0
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// 第 `attempt` 次失败后（从 1 开始）的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base == 0 {
            return Duration::from_millis(base);
        }

        let spread = base as f64 * jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let delayed = (base as f64 + offset).clamp(0.0, self.max_delay_ms as f64);
        Duration::from_millis(delayed as u64)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}
