use std::future::Future;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// 后台任务句柄
pub struct TaskHandle {
    shutdown_tx: watch::Sender<bool>,
    join_handle: JoinHandle<()>,
}

impl TaskHandle {
    /// 发送停止信号并在 `grace` 内等待任务退出，超时则中止。
    ///
    /// 返回 `true` 表示任务在宽限期内正常退出。
    pub async fn shutdown(self, grace: Duration) -> bool {
        let _ = self.shutdown_tx.send(true);
        let mut join_handle = self.join_handle;

        match timeout(grace, &mut join_handle).await {
            Ok(_) => true,
            Err(_) => {
                join_handle.abort();
                false
            }
        }
    }

    pub fn abort(self) {
        self.join_handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }
}

/// 周期任务
///
/// `start`/`stop` 都是幂等的，并且可以在一次 tick 执行期间调用。
pub struct PeriodicTask {
    name: String,
    period: Duration,
    handle: Mutex<Option<TaskHandle>>,
}

impl PeriodicTask {
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        Self {
            name: name.into(),
            period: period.max(Duration::from_millis(1)),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// 启动周期任务；已在运行时返回 `false`
    pub async fn start<F, Fut>(&self, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut guard = self.handle.lock().await;
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                warn!(task = %self.name, "Periodic task is already running");
                return false;
            }
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let name = self.name.clone();
        let period = self.period;

        let join_handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tick().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!(task = %name, "Periodic task exited");
        });

        *guard = Some(TaskHandle {
            shutdown_tx,
            join_handle,
        });

        info!(task = %self.name, period = ?self.period, "Periodic task started");
        true
    }

    /// 停止周期任务；未运行时返回 `false`
    pub async fn stop(&self, grace: Duration) -> bool {
        let handle = self.handle.lock().await.take();

        match handle {
            Some(handle) => {
                if handle.shutdown(grace).await {
                    info!(task = %self.name, "Periodic task stopped");
                } else {
                    warn!(
                        task = %self.name,
                        grace = ?grace,
                        "Periodic task did not finish in time, in-flight tick abandoned"
                    );
                }
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let task = PeriodicTask::new("test", Duration::from_millis(10));
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = ticks.clone();
        assert!(
            task.start(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
        );

        // 第二次启动不会生成新的任务
        assert!(!task.start(|| async {}).await);
        assert!(task.is_running().await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 1);

        assert!(task.stop(Duration::from_secs(1)).await);
        assert!(!task.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let task = PeriodicTask::new("idle", Duration::from_millis(10));
        assert!(!task.stop(Duration::from_millis(10)).await);

        task.start(|| async {}).await;
        assert!(task.stop(Duration::from_secs(1)).await);
        assert!(!task.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_stop_abandons_slow_tick() {
        let task = PeriodicTask::new("slow", Duration::from_millis(10));
        let finished = Arc::new(AtomicUsize::new(0));

        let flag = finished.clone();
        task.start(move || {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                flag.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;

        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        assert!(task.stop(Duration::from_millis(50)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert!(!task.is_running().await);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let task = PeriodicTask::new("restart", Duration::from_millis(10));
        task.start(|| async {}).await;
        task.stop(Duration::from_secs(1)).await;
        assert!(task.start(|| async {}).await);
        task.stop(Duration::from_secs(1)).await;
    }
}
