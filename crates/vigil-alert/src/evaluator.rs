use crate::event::{AlertTransition, TransitionKind};
use crate::rule::AlertThreshold;
use crate::state::{AlertStateManager, RaiseOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use vigil_core::{PeriodicTask, Result, SharedEventBus, VigilError};
use vigil_metrics::{InternalMetrics, MetricsCollector};

/// 评估器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// 评估周期（秒）
    pub interval_secs: u64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self { interval_secs: 10 }
    }
}

/// 一次评估的统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub rules_evaluated: usize,
    pub raised: usize,
    pub renotified: usize,
    pub escalated: usize,
    pub resolved: usize,
    pub purged: usize,
}

/// 告警评估器
///
/// 每个周期用同一个 `now` 评估所有规则，状态变化发布到告警总线。
/// 同一指标上的多条规则相互独立。
pub struct AlertEvaluator {
    config: EvaluatorConfig,
    rules: RwLock<BTreeMap<String, AlertThreshold>>,
    collector: Arc<MetricsCollector>,
    state: Arc<AlertStateManager>,
    bus: SharedEventBus<AlertTransition>,
    internal: Arc<InternalMetrics>,
    task: PeriodicTask,
}

impl AlertEvaluator {
    pub fn new(
        config: EvaluatorConfig,
        collector: Arc<MetricsCollector>,
        state: Arc<AlertStateManager>,
        bus: SharedEventBus<AlertTransition>,
    ) -> Self {
        let internal = Arc::clone(collector.internal());
        let task = PeriodicTask::new(
            "alert-evaluator",
            Duration::from_secs(config.interval_secs),
        );
        Self {
            config,
            rules: RwLock::new(BTreeMap::new()),
            collector,
            state,
            bus,
            internal,
            task,
        }
    }

    pub fn state(&self) -> &Arc<AlertStateManager> {
        &self.state
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    pub async fn register_threshold(&self, rule: AlertThreshold) -> Result<()> {
        rule.validate()?;

        let mut rules = self.rules.write().await;
        if rules.contains_key(&rule.name) {
            return Err(VigilError::DuplicateRule(rule.name));
        }

        info!(
            rule = %rule.name,
            metric = %rule.metric,
            comparison = rule.comparison.symbol(),
            threshold = rule.threshold,
            severity = %rule.severity,
            "Alert rule registered"
        );
        rules.insert(rule.name.clone(), rule);
        Ok(())
    }

    /// 显式替换已有规则；活跃告警保留，下一周期按新规则评估
    pub async fn replace_threshold(&self, rule: AlertThreshold) -> Result<()> {
        rule.validate()?;

        let mut rules = self.rules.write().await;
        if !rules.contains_key(&rule.name) {
            return Err(VigilError::NotFound(format!("rule '{}'", rule.name)));
        }

        info!(rule = %rule.name, "Alert rule replaced");
        rules.insert(rule.name.clone(), rule);
        Ok(())
    }

    /// 删除规则，并结束其活跃告警
    pub async fn remove_threshold(&self, name: &str) -> Result<()> {
        if self.rules.write().await.remove(name).is_none() {
            return Err(VigilError::NotFound(format!("rule '{}'", name)));
        }
        info!(rule = %name, "Alert rule removed");

        if let Some(event) = self.state.retire(name, Utc::now()).await {
            self.publish(TransitionKind::Resolved, event);
            self.internal.set_active_alerts(self.state.active_count().await);
        }
        Ok(())
    }

    pub async fn rules(&self) -> Vec<AlertThreshold> {
        self.rules.read().await.values().cloned().collect()
    }

    pub async fn get_rule(&self, name: &str) -> Option<AlertThreshold> {
        self.rules.read().await.get(name).cloned()
    }

    pub async fn evaluate_all(&self) -> EvaluationReport {
        self.evaluate_all_at(Utc::now()).await
    }

    /// 用同一个 `now` 评估所有规则
    pub async fn evaluate_all_at(&self, now: DateTime<Utc>) -> EvaluationReport {
        let rules: Vec<AlertThreshold> = self.rules.read().await.values().cloned().collect();
        let mut report = EvaluationReport {
            rules_evaluated: rules.len(),
            ..Default::default()
        };

        for rule in &rules {
            self.evaluate_rule(rule, now, &mut report).await;
        }

        let escalation: HashMap<String, chrono::Duration> = rules
            .iter()
            .filter_map(|r| r.escalation_after().map(|after| (r.name.clone(), after)))
            .collect();

        for event in self.state.escalate_due(&escalation, now).await {
            report.escalated += 1;
            let interval = rules
                .iter()
                .find(|r| r.name == event.rule_name)
                .map(|r| r.renotify_interval())
                .unwrap_or_else(chrono::Duration::zero);

            // 级别升高总是允许通知
            if let Some(marked) = self.state.try_notify(&event.rule_name, interval, now).await {
                self.publish(TransitionKind::Escalated, marked);
            }
        }

        report.purged = self.state.purge_resolved(now).await;
        self.internal.set_active_alerts(self.state.active_count().await);

        debug!(
            rules = report.rules_evaluated,
            raised = report.raised,
            resolved = report.resolved,
            escalated = report.escalated,
            "Alert evaluation completed"
        );
        report
    }

    async fn evaluate_rule(
        &self,
        rule: &AlertThreshold,
        now: DateTime<Utc>,
        report: &mut EvaluationReport,
    ) {
        let samples = self
            .collector
            .query_matching_at(&rule.metric, &rule.labels, rule.window(), now)
            .await;

        // 来源出错的陈旧样本不参与评估
        let breaching: Vec<f64> = samples
            .iter()
            .filter(|s| !s.source_error && rule.matches(s.value))
            .map(|s| s.value)
            .collect();

        let met = breaching.len() >= rule.min_occurrences;

        if met {
            let current = breaching.last().copied().unwrap_or(rule.threshold);
            match self.state.raise_or_update(rule, current, now).await {
                RaiseOutcome::Raised(_) => {
                    report.raised += 1;
                    if let Some(marked) = self
                        .state
                        .try_notify(&rule.name, rule.renotify_interval(), now)
                        .await
                    {
                        self.publish(TransitionKind::Raised, marked);
                    }
                }
                RaiseOutcome::Updated(_) => {
                    if let Some(marked) = self
                        .state
                        .try_notify(&rule.name, rule.renotify_interval(), now)
                        .await
                    {
                        report.renotified += 1;
                        self.publish(TransitionKind::Renotify, marked);
                    }
                }
            }
        } else if let Some(resolved) = self
            .state
            .observe_clear(&rule.name, rule.cooldown(), now)
            .await
        {
            report.resolved += 1;
            self.publish(TransitionKind::Resolved, resolved);
        }
    }

    fn publish(&self, kind: TransitionKind, event: crate::event::AlertEvent) {
        self.internal.record_transition(kind.as_str());
        let receivers = self.bus.publish(AlertTransition::new(kind, event));
        debug!(kind = kind.as_str(), receivers, "Alert transition published");
    }

    pub async fn start(self: &Arc<Self>) -> bool {
        let evaluator = Arc::clone(self);
        self.task
            .start(move || {
                let evaluator = Arc::clone(&evaluator);
                async move {
                    evaluator.evaluate_all().await;
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
