use crate::event::{AlertEvent, AlertStatus};
use crate::rule::AlertThreshold;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 告警状态管理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// 已解决告警的保留数量
    pub history_capacity: usize,
    /// 已解决告警的保留时长（秒）
    pub history_retention_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            history_retention_secs: 86_400,
        }
    }
}

/// `raise_or_update` 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum RaiseOutcome {
    /// 新建了告警
    Raised(AlertEvent),
    /// 已有告警被更新
    Updated(AlertEvent),
}

impl RaiseOutcome {
    pub fn event(&self) -> &AlertEvent {
        match self {
            RaiseOutcome::Raised(event) | RaiseOutcome::Updated(event) => event,
        }
    }
}

/// 告警状态管理器
///
/// 每条规则同时最多只有一个 Active 告警；解决后的告警移入有界历史。
pub struct AlertStateManager {
    // 规则名 -> 活跃告警
    active: RwLock<HashMap<String, AlertEvent>>,
    // 已解决告警，最新的在尾部
    history: RwLock<VecDeque<AlertEvent>>,
    config: StateConfig,
}

impl AlertStateManager {
    pub fn new(config: StateConfig) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            config,
        }
    }

    /// 条件满足：新建告警，或更新已有告警并清除冷却计时
    pub async fn raise_or_update(
        &self,
        rule: &AlertThreshold,
        value: f64,
        now: DateTime<Utc>,
    ) -> RaiseOutcome {
        let mut active = self.active.write().await;

        if let Some(event) = active.get_mut(&rule.name) {
            event.occurrence_count += 1;
            event.current_value = value;
            event.message = rule.describe(value);
            if event.clear_since.take().is_some() {
                debug!(rule = %rule.name, "Breach returned, cool-down reset");
            }
            return RaiseOutcome::Updated(event.clone());
        }

        let event = AlertEvent::raise(rule, value, now);
        info!(
            rule = %rule.name,
            alert_id = %event.id,
            severity = %event.severity,
            value,
            "Alert raised"
        );
        active.insert(rule.name.clone(), event.clone());
        RaiseOutcome::Raised(event)
    }

    /// 条件不再满足：第一次静默时开始冷却计时，静默持续满冷却期后解决
    ///
    /// 返回本次被解决的告警；每个告警只会返回一次。
    pub async fn observe_clear(
        &self,
        rule_name: &str,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> Option<AlertEvent> {
        let mut active = self.active.write().await;
        let event = active.get_mut(rule_name)?;

        let clear_since = *event.clear_since.get_or_insert(now);
        if now - clear_since < cooldown {
            return None;
        }

        let mut event = active.remove(rule_name)?;
        drop(active);

        event.resolve(now);
        info!(
            rule = %rule_name,
            alert_id = %event.id,
            occurrences = event.occurrence_count,
            "Alert resolved after cool-down"
        );
        self.push_history(event.clone()).await;
        Some(event)
    }

    /// 按 id 解决告警；已解决或不存在时返回 `false`
    pub async fn resolve(&self, id: Uuid, now: DateTime<Utc>) -> bool {
        let mut active = self.active.write().await;
        let rule_name = match active.values().find(|e| e.id == id) {
            Some(event) => event.rule_name.clone(),
            None => return false,
        };

        let Some(mut event) = active.remove(&rule_name) else {
            return false;
        };
        drop(active);

        event.resolve(now);
        info!(rule = %rule_name, alert_id = %id, "Alert resolved manually");
        self.push_history(event).await;
        true
    }

    /// 规则被删除时结束其活跃告警
    pub async fn retire(&self, rule_name: &str, now: DateTime<Utc>) -> Option<AlertEvent> {
        let mut event = self.active.write().await.remove(rule_name)?;
        event.resolve(now);
        info!(rule = %rule_name, alert_id = %event.id, "Alert retired with its rule");
        self.push_history(event.clone()).await;
        Some(event)
    }

    async fn push_history(&self, event: AlertEvent) {
        let mut history = self.history.write().await;
        history.push_back(event);
        while history.len() > self.config.history_capacity {
            history.pop_front();
        }
    }

    /// 通知节流
    ///
    /// 首次通知、级别在上次通知后升级、或距离上次通知已超过 `renotify_interval`
    /// 时允许发送，并在同一把锁内标记为已通知。返回被标记后的告警快照。
    pub async fn try_notify(
        &self,
        rule_name: &str,
        renotify_interval: Duration,
        now: DateTime<Utc>,
    ) -> Option<AlertEvent> {
        let mut active = self.active.write().await;
        let event = active.get_mut(rule_name)?;

        let permitted = match (event.last_notified_at, event.notified_severity) {
            (None, _) => true,
            (Some(_), Some(notified)) if event.severity > notified => true,
            (Some(last), _) => now - last >= renotify_interval,
        };

        if !permitted {
            debug!(rule = %rule_name, "Notification throttled");
            return None;
        }

        event.last_notified_at = Some(now);
        event.notified_severity = Some(event.severity);
        Some(event.clone())
    }

    /// 升级超时未解决的告警，每次调用最多升级一级
    ///
    /// `escalation` 为规则名 -> 升级间隔；没有配置升级的规则不在其中。
    pub async fn escalate_due(
        &self,
        escalation: &HashMap<String, Duration>,
        now: DateTime<Utc>,
    ) -> Vec<AlertEvent> {
        let mut active = self.active.write().await;
        let mut escalated = Vec::new();

        for event in active.values_mut() {
            let Some(after) = escalation.get(&event.rule_name) else {
                continue;
            };

            let since = event.escalated_at.unwrap_or(event.created_at);
            if now - since < *after {
                continue;
            }

            let next = event.severity.escalate();
            if next == event.severity {
                continue;
            }

            warn!(
                rule = %event.rule_name,
                alert_id = %event.id,
                from = %event.severity,
                to = %next,
                "Alert escalated"
            );
            event.severity = next;
            event.escalated_at = Some(now);
            escalated.push(event.clone());
        }

        escalated
    }

    /// 清除超过保留时长的已解决告警
    pub async fn purge_resolved(&self, now: DateTime<Utc>) -> usize {
        let retention = Duration::seconds(self.config.history_retention_secs.min(i64::MAX as u64 / 1000) as i64);
        let mut history = self.history.write().await;
        let before = history.len();
        history.retain(|e| {
            e.resolved_at
                .map(|resolved| now - resolved < retention)
                .unwrap_or(false)
        });
        let purged = before - history.len();
        if purged > 0 {
            debug!(purged, "Purged resolved alerts");
        }
        purged
    }

    pub async fn get(&self, rule_name: &str) -> Option<AlertEvent> {
        self.active.read().await.get(rule_name).cloned()
    }

    /// 活跃告警：级别降序，同级别按创建时间升序
    pub async fn get_active(&self) -> Vec<AlertEvent> {
        let mut events: Vec<AlertEvent> = self.active.read().await.values().cloned().collect();
        events.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(a.created_at.cmp(&b.created_at))
        });
        events
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// 活跃告警，可选附带最近解决的告警（最新的在前）
    pub async fn recent(&self, include_resolved: bool) -> Vec<AlertEvent> {
        let mut events = self.get_active().await;
        if include_resolved {
            let history = self.history.read().await;
            events.extend(
                history
                    .iter()
                    .rev()
                    .filter(|e| e.status == AlertStatus::Resolved)
                    .cloned(),
            );
        }
        events
    }
}

impl Default for AlertStateManager {
    fn default() -> Self {
        Self::new(StateConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Comparison, Severity};

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn rule(name: &str, severity: Severity) -> AlertThreshold {
        AlertThreshold::new(name, "cpu_percent", Comparison::Gt, 80.0, severity)
    }

    #[tokio::test]
    async fn test_raise_is_deduplicated() {
        let state = AlertStateManager::default();
        let r = rule("high_cpu", Severity::Warning);

        let first = state.raise_or_update(&r, 90.0, ts(0)).await;
        assert!(matches!(first, RaiseOutcome::Raised(_)));

        for i in 1..5 {
            let outcome = state.raise_or_update(&r, 90.0 + i as f64, ts(i)).await;
            assert!(matches!(outcome, RaiseOutcome::Updated(_)));
        }

        let active = state.get_active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, first.event().id);
        assert_eq!(active[0].occurrence_count, 5);
        assert_eq!(active[0].current_value, 94.0);
    }

    #[tokio::test]
    async fn test_resolution_requires_full_cooldown() {
        let state = AlertStateManager::default();
        let r = rule("high_cpu", Severity::Warning);
        let cooldown = Duration::seconds(30);

        state.raise_or_update(&r, 90.0, ts(0)).await;
        assert!(state.observe_clear("high_cpu", cooldown, ts(10)).await.is_none());
        assert!(state.observe_clear("high_cpu", cooldown, ts(30)).await.is_none());

        // 条件再次满足，冷却计时清零
        state.raise_or_update(&r, 91.0, ts(35)).await;
        assert!(state.observe_clear("high_cpu", cooldown, ts(45)).await.is_none());
        assert!(state.observe_clear("high_cpu", cooldown, ts(60)).await.is_none());

        let resolved = state.observe_clear("high_cpu", cooldown, ts(75)).await.unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert_eq!(resolved.resolved_at, Some(ts(75)));

        // 只解决一次
        assert!(state.observe_clear("high_cpu", cooldown, ts(80)).await.is_none());
        assert!(state.get("high_cpu").await.is_none());
        assert_eq!(state.recent(true).await.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let state = AlertStateManager::default();
        let raised = state
            .raise_or_update(&rule("high_cpu", Severity::Warning), 90.0, ts(0))
            .await;
        let id = raised.event().id;

        assert!(state.resolve(id, ts(5)).await);
        assert!(!state.resolve(id, ts(6)).await);
        assert!(!state.resolve(Uuid::new_v4(), ts(6)).await);
        assert_eq!(state.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_notification_throttling() {
        let state = AlertStateManager::default();
        let r = rule("high_cpu", Severity::Warning);
        let interval = Duration::seconds(300);

        state.raise_or_update(&r, 90.0, ts(0)).await;
        assert!(state.try_notify("high_cpu", interval, ts(0)).await.is_some());

        // 节流窗口内的重复满足不会再次通知
        for i in 1..10 {
            state.raise_or_update(&r, 90.0, ts(i * 10)).await;
            assert!(state.try_notify("high_cpu", interval, ts(i * 10)).await.is_none());
        }

        assert!(state.try_notify("high_cpu", interval, ts(300)).await.is_some());
        assert!(state.try_notify("high_cpu", interval, ts(301)).await.is_none());
        assert!(state.try_notify("missing", interval, ts(301)).await.is_none());
    }

    #[tokio::test]
    async fn test_escalation_bypasses_throttle() {
        let state = AlertStateManager::default();
        let r = rule("high_cpu", Severity::Warning);
        let interval = Duration::seconds(3600);
        let mut escalation = HashMap::new();
        escalation.insert("high_cpu".to_string(), Duration::seconds(60));

        state.raise_or_update(&r, 90.0, ts(0)).await;
        state.try_notify("high_cpu", interval, ts(0)).await;

        assert!(state.escalate_due(&escalation, ts(30)).await.is_empty());

        let escalated = state.escalate_due(&escalation, ts(60)).await;
        assert_eq!(escalated.len(), 1);
        assert_eq!(escalated[0].severity, Severity::Error);
        assert_eq!(escalated[0].base_severity, Severity::Warning);

        // 同一级别只升级一次
        assert!(state.escalate_due(&escalation, ts(90)).await.is_empty());
        assert!(state.try_notify("high_cpu", interval, ts(61)).await.is_some());

        let escalated = state.escalate_due(&escalation, ts(120)).await;
        assert_eq!(escalated[0].severity, Severity::Critical);
        assert!(state.escalate_due(&escalation, ts(500)).await.is_empty());
    }

    #[tokio::test]
    async fn test_get_active_ordering() {
        let state = AlertStateManager::default();
        state.raise_or_update(&rule("a", Severity::Warning), 90.0, ts(0)).await;
        state.raise_or_update(&rule("b", Severity::Critical), 90.0, ts(5)).await;
        state.raise_or_update(&rule("c", Severity::Warning), 90.0, ts(-5)).await;

        let names: Vec<String> = state
            .get_active()
            .await
            .into_iter()
            .map(|e| e.rule_name)
            .collect();
        assert_eq!(names, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn test_history_bounded_and_purged() {
        let state = AlertStateManager::new(StateConfig {
            history_capacity: 2,
            history_retention_secs: 100,
        });

        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            state.raise_or_update(&rule(name, Severity::Info), 90.0, ts(0)).await;
            state.retire(name, ts(i as i64 * 50)).await;
        }

        let recent = state.recent(true).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].rule_name, "c");

        // b 在 50 解决，c 在 100 解决
        assert_eq!(state.purge_resolved(ts(160)).await, 1);
        assert_eq!(state.recent(true).await.len(), 1);
        assert!(state.recent(false).await.is_empty());
    }
}
