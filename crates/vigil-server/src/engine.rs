use crate::worker::run_notification_worker;
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use vigil_alert::{AlertEvaluator, AlertStateManager, AlertTransition};
use vigil_config::{EngineConfig, HttpCheckConfig};
use vigil_core::{EventBus, SharedEventBus};
use vigil_dashboard::{ComponentSources, DashboardAggregator};
use vigil_health::{HealthCheckOrchestrator, HttpProbe};
use vigil_metrics::{InternalMetrics, InternalMetricsSource, MetricsCollector, SystemSource};
use vigil_notify::NotificationDispatcher;

/// 周期任务的运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub collector: bool,
    pub health: bool,
    pub evaluator: bool,
    pub dashboard: bool,
}

/// 引擎上下文
///
/// 在 `main` 中构建一次，以 `Arc<Engine>` 共享给 HTTP 层、通知 worker 和测试。
pub struct Engine {
    pub config: EngineConfig,
    pub internal: Arc<InternalMetrics>,
    pub collector: Arc<MetricsCollector>,
    pub health: Arc<HealthCheckOrchestrator>,
    pub alerts: Arc<AlertStateManager>,
    pub evaluator: Arc<AlertEvaluator>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub dashboard: Arc<DashboardAggregator>,
    pub bus: SharedEventBus<AlertTransition>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// 按配置组装所有组件，注册配置中的规则、检查和渠道，并启动通知 worker
    ///
    /// 周期任务不会自动启动，见 [`Engine::start_all`]。
    pub async fn build(config: EngineConfig) -> Result<Arc<Self>> {
        let internal = Arc::new(InternalMetrics::new()?);

        let collector = Arc::new(MetricsCollector::new(
            config.collector.clone(),
            Arc::clone(&internal),
        ));
        collector
            .register_source(Arc::new(SystemSource::new()))
            .await;
        collector
            .register_source(Arc::new(InternalMetricsSource::new(Arc::clone(&internal))))
            .await;

        let health = Arc::new(
            HealthCheckOrchestrator::new(config.health.clone(), Arc::clone(&internal))
                .with_collector(Arc::clone(&collector)),
        );

        let alerts = Arc::new(AlertStateManager::new(config.alerts.clone()));
        let bus: SharedEventBus<AlertTransition> =
            Arc::new(EventBus::new(config.server.bus_capacity.max(1)));

        let evaluator = Arc::new(AlertEvaluator::new(
            config.evaluator.clone(),
            Arc::clone(&collector),
            Arc::clone(&alerts),
            Arc::clone(&bus),
        ));

        let dispatcher = Arc::new(NotificationDispatcher::new(
            config.dispatcher.clone(),
            Arc::clone(&internal),
        ));

        let sources = Arc::new(ComponentSources::new(
            Arc::clone(&collector),
            Arc::clone(&health),
            Arc::clone(&alerts),
        ));
        let dashboard = Arc::new(DashboardAggregator::new(
            config.dashboard.clone(),
            sources,
            Arc::clone(&internal),
        ));

        for channel in &config.channels {
            let notifier = channel
                .settings
                .build()
                .map_err(|e| anyhow!("Failed to build channel '{}': {}", channel.name, e))?;
            dispatcher.register_channel(&channel.name, notifier).await?;
        }

        for check in &config.checks {
            register_http_check(&health, check).await?;
        }

        for rule in &config.rules {
            evaluator.register_threshold(rule.clone()).await?;
        }

        // 先订阅再返回，保证不漏掉任何状态变化
        let worker = tokio::spawn(run_notification_worker(
            bus.subscribe(),
            Arc::clone(&dispatcher),
            Arc::clone(&internal),
        ));

        info!(
            rules = config.rules.len(),
            checks = config.checks.len(),
            channels = config.channels.len(),
            "Engine built"
        );

        Ok(Arc::new(Self {
            config,
            internal,
            collector,
            health,
            alerts,
            evaluator,
            dispatcher,
            dashboard,
            bus,
            worker: Mutex::new(Some(worker)),
        }))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.config.server.shutdown_grace_ms)
    }

    /// 启动所有周期任务；已在运行的任务保持不变
    pub async fn start_all(&self) -> SchedulerStatus {
        let collector = self.collector.start().await;
        let health = self.health.start().await;
        let evaluator = self.evaluator.start().await;
        let dashboard = self.dashboard.start().await;
        info!(collector, health, evaluator, dashboard, "Scheduler started");
        self.scheduler_status().await
    }

    /// 停止所有周期任务，每个任务最多等待 `grace`
    pub async fn stop_all(&self, grace: Duration) -> SchedulerStatus {
        let collector = self.collector.stop(grace).await;
        let health = self.health.stop(grace).await;
        let evaluator = self.evaluator.stop(grace).await;
        let dashboard = self.dashboard.stop(grace).await;
        info!(collector, health, evaluator, dashboard, "Scheduler stopped");
        self.scheduler_status().await
    }

    pub async fn scheduler_status(&self) -> SchedulerStatus {
        SchedulerStatus {
            collector: self.collector.is_running().await,
            health: self.health.is_running().await,
            evaluator: self.evaluator.is_running().await,
            dashboard: self.dashboard.is_running().await,
        }
    }

    /// 停止周期任务和通知 worker
    pub async fn shutdown(&self) {
        self.stop_all(self.shutdown_grace()).await;

        if let Some(worker) = self.worker.lock().await.take() {
            worker.abort();
            if let Err(e) = worker.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Notification worker exited abnormally");
                }
            }
        }
        info!("Engine shut down");
    }
}

/// 注册一个 HTTP 健康检查
pub async fn register_http_check(
    health: &HealthCheckOrchestrator,
    check: &HttpCheckConfig,
) -> vigil_core::Result<()> {
    let probe = Arc::new(HttpProbe::new(
        check.url.clone(),
        Duration::from_millis(check.degraded_after_ms),
    ));
    let timeout = check
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| health.default_timeout());

    health
        .register_check(&check.name, probe, timeout, check.critical)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_alert::{AlertThreshold, Comparison, Severity};
    use vigil_config::ChannelConfig;
    use vigil_notify::{ChannelSettings, WebhookConfig};

    #[tokio::test]
    async fn test_build_registers_configured_items() {
        let mut config = EngineConfig::default();
        config.channels = vec![ChannelConfig {
            name: "hook".to_string(),
            settings: ChannelSettings::Webhook(WebhookConfig {
                url: "http://127.0.0.1:1/hook".to_string(),
                headers: Default::default(),
            }),
        }];
        config.checks = vec![HttpCheckConfig {
            name: "api".to_string(),
            url: "http://127.0.0.1:1/health".to_string(),
            timeout_ms: Some(500),
            critical: false,
            degraded_after_ms: 1_000,
        }];
        config.rules = vec![AlertThreshold::new(
            "high_cpu",
            "system_cpu_percent",
            Comparison::Gt,
            90.0,
            Severity::Warning,
        )];

        let engine = Engine::build(config).await.unwrap();
        assert_eq!(engine.dispatcher.channel_states().await.len(), 1);
        assert_eq!(engine.health.check_names().await, vec!["api".to_string()]);
        assert!(engine.evaluator.get_rule("high_cpu").await.is_some());
        assert_eq!(engine.bus.subscriber_count(), 1);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_stop_all() {
        let engine = Engine::build(EngineConfig::default()).await.unwrap();

        let status = engine.start_all().await;
        assert!(status.collector && status.health && status.evaluator && status.dashboard);

        let status = engine.stop_all(Duration::from_secs(1)).await;
        assert!(!status.collector && !status.health && !status.evaluator && !status.dashboard);
    }
}
