use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// 正常投递
    Closed,
    /// 连续失败达到阈值，直接短路
    Open,
    /// 冷却结束，放行一次试探投递
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    state: CircuitState,
}

/// 投递许可
///
/// HalfOpen 状态下持有唯一的试探名额；许可未交还（调用方被取消）就被丢弃时，
/// 名额自动释放，下一次投递可以重新试探。
#[derive(Debug)]
pub struct BreakerPermit {
    trial: Option<Arc<AtomicBool>>,
}

impl BreakerPermit {
    fn release(&mut self) {
        if let Some(slot) = self.trial.take() {
            slot.store(false, Ordering::SeqCst);
        }
    }

    /// 是否为 HalfOpen 状态下的试探投递
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if self.trial.is_some() {
            debug!("Half-open trial delivery abandoned, releasing slot");
            self.release();
        }
    }
}

/// 单个通知渠道的熔断器
///
/// 状态转换在同一把锁内完成；试探名额由许可持有。
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: RwLock<BreakerInner>,
    trial_in_flight: Arc<AtomicBool>,
    threshold: u32,
    open_cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_cooldown: Duration) -> Self {
        Self {
            inner: RwLock::new(BreakerInner {
                consecutive_failures: 0,
                opened_at: None,
                state: CircuitState::Closed,
            }),
            trial_in_flight: Arc::new(AtomicBool::new(false)),
            threshold: threshold.max(1),
            open_cooldown,
        }
    }

    fn permit(&self) -> BreakerPermit {
        BreakerPermit { trial: None }
    }

    /// 占用试探名额；已被占用时返回 `None`
    fn trial_permit(&self) -> Option<BreakerPermit> {
        self.trial_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| BreakerPermit {
                trial: Some(Arc::clone(&self.trial_in_flight)),
            })
    }

    /// 申请一次投递许可
    ///
    /// Open 状态冷却结束后转入 HalfOpen，只放行一次试探投递。
    pub async fn try_acquire(&self) -> Option<BreakerPermit> {
        {
            let inner = self.inner.read().await;
            match inner.state {
                CircuitState::Closed => return Some(self.permit()),
                CircuitState::HalfOpen if self.trial_in_flight.load(Ordering::SeqCst) => {
                    return None
                }
                CircuitState::Open => {
                    let cooling = inner
                        .opened_at
                        .map(|t| t.elapsed() < self.open_cooldown)
                        .unwrap_or(true);
                    if cooling {
                        return None;
                    }
                }
                CircuitState::HalfOpen => {}
            }
        }

        // 双重检查：获取写锁后状态可能已被其他任务改变
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed => Some(self.permit()),
            CircuitState::HalfOpen => self.trial_permit(),
            CircuitState::Open => {
                let expired = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.open_cooldown)
                    .unwrap_or(false);
                if !expired {
                    return None;
                }
                let permit = self.trial_permit()?;
                inner.state = CircuitState::HalfOpen;
                info!("Circuit breaker half-open, letting one delivery through");
                Some(permit)
            }
        }
    }

    pub async fn on_success(&self, mut permit: BreakerPermit) {
        let mut inner = self.inner.write().await;
        if inner.state != CircuitState::Closed {
            info!("Circuit breaker closed after successful delivery");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        permit.release();
    }

    /// 记录一次失败的投递（重试全部用尽后调用一次）
    pub async fn on_failure(&self, mut permit: BreakerPermit) {
        let mut inner = self.inner.write().await;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let reopen = inner.state == CircuitState::HalfOpen;
        if reopen || inner.consecutive_failures >= self.threshold {
            if inner.state != CircuitState::Open {
                warn!(
                    failures = inner.consecutive_failures,
                    threshold = self.threshold,
                    "Circuit breaker opened"
                );
            }
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
        permit.release();
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.inner.read().await.consecutive_failures
    }
}
