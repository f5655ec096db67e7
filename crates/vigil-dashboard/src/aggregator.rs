use crate::history::{DownsampledHistory, SeriesHistory, TierSpec};
use crate::snapshot::DashboardSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};
use vigil_alert::{AlertEvent, AlertStateManager, AlertStatus};
use vigil_core::PeriodicTask;
use vigil_health::{HealthCheckOrchestrator, OverallHealth};
use vigil_metrics::{InternalMetrics, MetricSummary, MetricsCollector};

/// 仪表盘配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// 聚合周期（秒）
    pub interval_secs: u64,
    /// 单次聚合超时（毫秒），超时保留上一份快照
    pub tick_timeout_ms: u64,
    /// 快照中附带的最近解决告警数量
    pub recent_resolved_limit: usize,
    /// 历史保存的序列数量上限
    pub history_max_series: usize,
    pub history_tiers: Vec<TierSpec>,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            tick_timeout_ms: 2_000,
            recent_resolved_limit: 20,
            history_max_series: 1_000,
            history_tiers: TierSpec::defaults(),
        }
    }
}

/// 仪表盘的数据来源（只读）
#[async_trait]
pub trait DashboardSource: Send + Sync {
    async fn metric_summaries(&self) -> Vec<MetricSummary>;

    async fn overall_health(&self) -> OverallHealth;

    async fn active_alerts(&self) -> Vec<AlertEvent>;

    async fn resolved_alerts(&self, limit: usize) -> Vec<AlertEvent>;
}

/// 从采集器、健康检查编排器和告警状态管理器读取数据
pub struct ComponentSources {
    collector: Arc<MetricsCollector>,
    health: Arc<HealthCheckOrchestrator>,
    alerts: Arc<AlertStateManager>,
}

impl ComponentSources {
    pub fn new(
        collector: Arc<MetricsCollector>,
        health: Arc<HealthCheckOrchestrator>,
        alerts: Arc<AlertStateManager>,
    ) -> Self {
        Self {
            collector,
            health,
            alerts,
        }
    }
}

#[async_trait]
impl DashboardSource for ComponentSources {
    async fn metric_summaries(&self) -> Vec<MetricSummary> {
        self.collector.summaries().await
    }

    async fn overall_health(&self) -> OverallHealth {
        self.health.get_overall().await
    }

    async fn active_alerts(&self) -> Vec<AlertEvent> {
        self.alerts.get_active().await
    }

    async fn resolved_alerts(&self, limit: usize) -> Vec<AlertEvent> {
        self.alerts
            .recent(true)
            .await
            .into_iter()
            .filter(|e| e.status == AlertStatus::Resolved)
            .take(limit)
            .collect()
    }
}

/// 仪表盘聚合器
///
/// 每个周期组装一份不可变快照并原子替换；组装超时则保留上一份快照，
/// 过期程度可以从 `as_of` 看出。
pub struct DashboardAggregator {
    config: DashboardConfig,
    source: Arc<dyn DashboardSource>,
    history: RwLock<DownsampledHistory>,
    snapshot_tx: watch::Sender<Arc<DashboardSnapshot>>,
    internal: Arc<InternalMetrics>,
    task: PeriodicTask,
}

impl DashboardAggregator {
    pub fn new(
        config: DashboardConfig,
        source: Arc<dyn DashboardSource>,
        internal: Arc<InternalMetrics>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(DashboardSnapshot::empty(Utc::now())));
        let history = DownsampledHistory::new(
            config.history_tiers.clone(),
            config.history_max_series,
        );
        let task = PeriodicTask::new(
            "dashboard-aggregator",
            Duration::from_secs(config.interval_secs),
        );

        Self {
            config,
            source,
            history: RwLock::new(history),
            snapshot_tx,
            internal,
            task,
        }
    }

    pub async fn tick(&self) -> bool {
        self.tick_at(Utc::now()).await
    }

    /// 组装并替换快照；超时返回 `false` 并保留旧快照
    pub async fn tick_at(&self, now: DateTime<Utc>) -> bool {
        let timeout = Duration::from_millis(self.config.tick_timeout_ms);

        match tokio::time::timeout(timeout, self.assemble(now)).await {
            Ok(snapshot) => {
                self.record_history(&snapshot.metrics, now).await;
                debug!(
                    metrics = snapshot.metrics.len(),
                    active_alerts = snapshot.active_alerts.len(),
                    health = %snapshot.health.status,
                    "Dashboard snapshot refreshed"
                );
                self.snapshot_tx.send_replace(Arc::new(snapshot));
                true
            }
            Err(_) => {
                self.internal.record_suppressed("dashboard", "timeout");
                warn!(
                    timeout_ms = self.config.tick_timeout_ms,
                    as_of = %self.current().as_of,
                    "Dashboard assembly timed out, keeping last snapshot"
                );
                false
            }
        }
    }

    async fn assemble(&self, now: DateTime<Utc>) -> DashboardSnapshot {
        let metrics = self.source.metric_summaries().await;
        let health = self.source.overall_health().await;
        let active = self.source.active_alerts().await;
        let resolved = self
            .source
            .resolved_alerts(self.config.recent_resolved_limit)
            .await;

        DashboardSnapshot::new(now, metrics, health, active, resolved)
    }

    async fn record_history(&self, summaries: &[MetricSummary], now: DateTime<Utc>) {
        let refused = self.history.write().await.record_summaries(summaries, now);
        if refused > 0 {
            warn!(
                refused,
                max_series = self.config.history_max_series,
                "History series limit reached"
            );
            for _ in 0..refused {
                self.internal.record_suppressed("dashboard", "history_limit");
            }
        }
    }

    /// 当前快照
    pub fn current(&self) -> Arc<DashboardSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<DashboardSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// 名为 `name` 的序列自 `since` 起的降采样历史
    pub async fn history(&self, name: &str, since: DateTime<Utc>) -> Vec<SeriesHistory> {
        self.history.read().await.history(name, since)
    }

    pub async fn start(self: &Arc<Self>) -> bool {
        let aggregator = Arc::clone(self);
        self.task
            .start(move || {
                let aggregator = Arc::clone(&aggregator);
                async move {
                    aggregator.tick().await;
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use vigil_alert::{AlertThreshold, Comparison, Severity};
    use vigil_health::{HealthConfig, HealthStatus};
    use vigil_metrics::{CollectorConfig, Labels};

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    struct Components {
        collector: Arc<MetricsCollector>,
        alerts: Arc<AlertStateManager>,
        aggregator: DashboardAggregator,
    }

    fn components() -> Components {
        let internal = Arc::new(InternalMetrics::new().unwrap());
        let collector = Arc::new(MetricsCollector::new(
            CollectorConfig::default(),
            Arc::clone(&internal),
        ));
        let health = Arc::new(HealthCheckOrchestrator::new(
            HealthConfig::default(),
            Arc::clone(&internal),
        ));
        let alerts = Arc::new(AlertStateManager::default());
        let source = Arc::new(ComponentSources::new(
            Arc::clone(&collector),
            health,
            Arc::clone(&alerts),
        ));
        let aggregator = DashboardAggregator::new(DashboardConfig::default(), source, internal);
        Components {
            collector,
            alerts,
            aggregator,
        }
    }

    #[tokio::test]
    async fn test_tick_assembles_snapshot() {
        let c = components();
        c.collector
            .record_at("cpu_percent", 91.0, Labels::new(), ts(0))
            .await;
        let rule = AlertThreshold::new("high_cpu", "cpu_percent", Comparison::Gt, 80.0, Severity::Warning);
        c.alerts.raise_or_update(&rule, 91.0, ts(0)).await;

        let mut rx = c.aggregator.subscribe();
        assert!(c.aggregator.tick_at(ts(5)).await);
        assert!(rx.has_changed().unwrap());

        let snapshot = c.aggregator.current();
        assert_eq!(snapshot.as_of, ts(5));
        assert_eq!(snapshot.metrics.len(), 1);
        assert_eq!(snapshot.active_alerts.len(), 1);
        assert_eq!(snapshot.health.status, HealthStatus::Unknown);

        let history = c.aggregator.history("cpu_percent", ts(-60)).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].points[0].avg, 91.0);
    }

    #[tokio::test]
    async fn test_resolved_alerts_in_snapshot() {
        let c = components();
        let rule = AlertThreshold::new("high_cpu", "cpu_percent", Comparison::Gt, 80.0, Severity::Warning);
        c.alerts.raise_or_update(&rule, 91.0, ts(0)).await;
        c.alerts.retire("high_cpu", ts(1)).await;

        c.aggregator.tick_at(ts(2)).await;
        let snapshot = c.aggregator.current();
        assert!(snapshot.active_alerts.is_empty());
        assert_eq!(snapshot.recently_resolved.len(), 1);
    }

    struct SlowSource {
        slow: AtomicBool,
    }

    #[async_trait]
    impl DashboardSource for SlowSource {
        async fn metric_summaries(&self) -> Vec<MetricSummary> {
            if self.slow.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Vec::new()
        }

        async fn overall_health(&self) -> OverallHealth {
            OverallHealth::aggregate(Vec::new(), Utc::now())
        }

        async fn active_alerts(&self) -> Vec<AlertEvent> {
            Vec::new()
        }

        async fn resolved_alerts(&self, _limit: usize) -> Vec<AlertEvent> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_timeout_keeps_last_good_snapshot() {
        let internal = Arc::new(InternalMetrics::new().unwrap());
        let source = Arc::new(SlowSource {
            slow: AtomicBool::new(false),
        });
        let aggregator = DashboardAggregator::new(
            DashboardConfig {
                tick_timeout_ms: 50,
                ..Default::default()
            },
            source.clone(),
            Arc::clone(&internal),
        );

        assert!(aggregator.tick_at(ts(0)).await);
        source.slow.store(true, Ordering::SeqCst);
        assert!(!aggregator.tick_at(ts(10)).await);

        // 旧快照仍然可用，as_of 显示其陈旧程度
        assert_eq!(aggregator.current().as_of, ts(0));
        assert_eq!(internal.suppressed_count("dashboard", "timeout"), 1);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let c = components();
        let aggregator = Arc::new(c.aggregator);
        assert!(aggregator.start().await);
        assert!(!aggregator.start().await);
        assert!(aggregator.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_history_follows_metric_churn() {
        let internal = Arc::new(InternalMetrics::new().unwrap());
        let collector = Arc::new(MetricsCollector::new(
            CollectorConfig {
                retention_secs: 60,
                ..Default::default()
            },
            Arc::clone(&internal),
        ));
        let health = Arc::new(HealthCheckOrchestrator::new(
            HealthConfig::default(),
            Arc::clone(&internal),
        ));
        let source = Arc::new(ComponentSources::new(
            Arc::clone(&collector),
            health,
            Arc::new(AlertStateManager::default()),
        ));
        let aggregator = DashboardAggregator::new(
            DashboardConfig {
                history_max_series: 2,
                ..Default::default()
            },
            source,
            Arc::clone(&internal),
        );

        collector.record_at("old_a", 1.0, Labels::new(), ts(0)).await;
        collector.record_at("old_b", 2.0, Labels::new(), ts(0)).await;
        aggregator.tick_at(ts(1)).await;

        collector.evict_expired_at(ts(120)).await;
        collector.record_at("new_metric", 3.0, Labels::new(), ts(120)).await;
        aggregator.tick_at(ts(121)).await;

        let history = aggregator.history("new_metric", ts(60)).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].points[0].avg, 3.0);
        assert_eq!(internal.suppressed_count("dashboard", "history_limit"), 0);

        // 三个序列同时上报时，超出上限的被拒绝并计数
        collector.record_at("extra_a", 1.0, Labels::new(), ts(130)).await;
        collector.record_at("extra_b", 1.0, Labels::new(), ts(130)).await;
        aggregator.tick_at(ts(131)).await;
        assert_eq!(internal.suppressed_count("dashboard", "history_limit"), 1);
    }
}
