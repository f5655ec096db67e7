use crate::probe::HealthProbe;
use crate::status::{HealthCheckResult, HealthStatus, OverallHealth};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use vigil_core::{PeriodicTask, Result, VigilError};
use vigil_metrics::{InternalMetrics, Labels, MetricsCollector};

/// 健康检查配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// 检查周期（秒）
    pub interval_secs: u64,
    /// 未指定超时时的默认超时（毫秒）
    pub default_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            default_timeout_ms: 5_000,
        }
    }
}

#[derive(Clone)]
struct RegisteredCheck {
    name: String,
    probe: Arc<dyn HealthProbe>,
    timeout: Duration,
    critical: bool,
}

/// 健康检查编排器
///
/// 所有探针并发执行，每个探针受各自超时约束；单个探针的超时、错误或
/// panic 被记录为 Unhealthy，不影响其他探针。
pub struct HealthCheckOrchestrator {
    config: HealthConfig,
    checks: RwLock<BTreeMap<String, RegisteredCheck>>,
    results: RwLock<BTreeMap<String, HealthCheckResult>>,
    collector: Option<Arc<MetricsCollector>>,
    internal: Arc<InternalMetrics>,
    task: PeriodicTask,
}

impl HealthCheckOrchestrator {
    pub fn new(config: HealthConfig, internal: Arc<InternalMetrics>) -> Self {
        let task = PeriodicTask::new(
            "health-orchestrator",
            Duration::from_secs(config.interval_secs),
        );
        Self {
            config,
            checks: RwLock::new(BTreeMap::new()),
            results: RwLock::new(BTreeMap::new()),
            collector: None,
            internal,
            task,
        }
    }

    /// 将检查结果镜像到采集器（`health_status` / `health_latency_ms`）
    pub fn with_collector(mut self, collector: Arc<MetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.config.default_timeout_ms)
    }

    pub async fn register_check(
        &self,
        name: &str,
        probe: Arc<dyn HealthProbe>,
        timeout: Duration,
        critical: bool,
    ) -> Result<()> {
        let mut checks = self.checks.write().await;
        if checks.contains_key(name) {
            return Err(VigilError::DuplicateCheck(name.to_string()));
        }

        info!(
            component = %name,
            kind = probe.kind(),
            timeout = ?timeout,
            critical,
            "Health check registered"
        );

        checks.insert(
            name.to_string(),
            RegisteredCheck {
                name: name.to_string(),
                probe,
                timeout,
                critical,
            },
        );
        Ok(())
    }

    pub async fn remove_check(&self, name: &str) -> Result<()> {
        if self.checks.write().await.remove(name).is_none() {
            return Err(VigilError::NotFound(format!("health check '{}'", name)));
        }
        self.results.write().await.remove(name);
        info!(component = %name, "Health check removed");
        Ok(())
    }

    pub async fn check_names(&self) -> Vec<String> {
        self.checks.read().await.keys().cloned().collect()
    }

    /// 并发执行所有探针，结果整体替换上一轮
    pub async fn run_all(&self) -> Vec<HealthCheckResult> {
        let checks: Vec<RegisteredCheck> = self.checks.read().await.values().cloned().collect();

        let mut runs = JoinSet::new();
        for check in checks {
            let internal = Arc::clone(&self.internal);
            runs.spawn(async move { execute(check, internal).await });
        }

        let mut fresh = BTreeMap::new();
        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok(result) => {
                    fresh.insert(result.component.clone(), result);
                }
                Err(e) => {
                    warn!(error = %e, "Health check task failed");
                    self.internal.record_suppressed("health", "join");
                }
            }
        }

        // 执行期间被移除的检查不再写回
        let results: Vec<HealthCheckResult> = {
            let checks = self.checks.read().await;
            fresh.retain(|name, _| checks.contains_key(name));
            let results = fresh.values().cloned().collect();
            *self.results.write().await = fresh;
            results
        };
        self.mirror(&results).await;

        debug!(checks = results.len(), "Health checks completed");
        results
    }

    /// 单独执行一个探针
    pub async fn run_check(&self, name: &str) -> Result<HealthCheckResult> {
        let check = self
            .checks
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| VigilError::NotFound(format!("health check '{}'", name)))?;

        let result = execute(check, Arc::clone(&self.internal)).await;
        {
            let checks = self.checks.read().await;
            if !checks.contains_key(name) {
                debug!(component = %name, "Health check removed during run, result discarded");
                return Ok(result);
            }
            self.results
                .write()
                .await
                .insert(result.component.clone(), result.clone());
        }
        self.mirror(std::slice::from_ref(&result)).await;
        Ok(result)
    }

    /// 当前结果集（按组件名排序）
    pub async fn latest(&self) -> Vec<HealthCheckResult> {
        self.results.read().await.values().cloned().collect()
    }

    pub async fn get_overall(&self) -> OverallHealth {
        OverallHealth::aggregate(self.latest().await, Utc::now())
    }

    async fn mirror(&self, results: &[HealthCheckResult]) {
        let Some(collector) = &self.collector else {
            return;
        };

        for result in results {
            let mut labels = Labels::new();
            labels.insert("component".to_string(), result.component.clone());

            collector
                .record_at(
                    "health_status",
                    result.status.as_metric(),
                    labels.clone(),
                    result.timestamp,
                )
                .await;
            collector
                .record_at(
                    "health_latency_ms",
                    result.latency_ms as f64,
                    labels,
                    result.timestamp,
                )
                .await;
        }
    }

    pub async fn start(self: &Arc<Self>) -> bool {
        let orchestrator = Arc::clone(self);
        self.task
            .start(move || {
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    orchestrator.run_all().await;
                }
            })
            .await
    }

    pub async fn stop(&self, grace: Duration) -> bool {
        self.task.stop(grace).await
    }

    pub async fn is_running(&self) -> bool {
        self.task.is_running().await
    }
}

/// 执行单个探针；超时在派生任务内部施加，调用方被取消时探针也不会无限运行
async fn execute(check: RegisteredCheck, internal: Arc<InternalMetrics>) -> HealthCheckResult {
    let started = Instant::now();
    let probe = Arc::clone(&check.probe);
    let timeout = check.timeout;

    let handle = tokio::spawn(async move { tokio::time::timeout(timeout, probe.run()).await });

    let (status, message, failure) = match handle.await {
        Ok(Ok(Ok(outcome))) => (outcome.status, outcome.message, None),
        Ok(Ok(Err(e))) => (HealthStatus::Unhealthy, e.to_string(), Some("error")),
        Ok(Err(_)) => (
            HealthStatus::Unhealthy,
            format!("probe timed out after {}ms", timeout.as_millis()),
            Some("timeout"),
        ),
        Err(e) => (
            HealthStatus::Unhealthy,
            format!("probe panicked: {}", e),
            Some("panic"),
        ),
    };

    let elapsed = started.elapsed();
    internal.observe_probe_duration(&check.name, elapsed.as_secs_f64());

    if let Some(kind) = failure {
        internal.record_suppressed("health", kind);
        warn!(component = %check.name, kind, message = %message, "Health probe failed");
    }

    HealthCheckResult {
        component: check.name,
        status,
        message,
        latency_ms: elapsed.as_millis() as u64,
        timestamp: Utc::now(),
        critical: check.critical,
    }
}
