use crate::rule::{AlertThreshold, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 告警状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Resolved,
}

/// 告警事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub rule_name: String,
    pub metric: String,
    /// 当前级别（可能已升级）
    pub severity: Severity,
    /// 规则配置的原始级别
    pub base_severity: Severity,
    pub current_value: f64,
    pub threshold_value: f64,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub last_notified_at: Option<DateTime<Utc>>,
    /// 上次通知时的级别
    pub notified_severity: Option<Severity>,
    pub occurrence_count: u64,
    /// 条件首次不再满足的时间（冷却计时起点）
    pub clear_since: Option<DateTime<Utc>>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub message: String,
    #[serde(default)]
    pub channels: Vec<String>,
}

impl AlertEvent {
    pub fn raise(rule: &AlertThreshold, value: f64, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_name: rule.name.clone(),
            metric: rule.metric.clone(),
            severity: rule.severity,
            base_severity: rule.severity,
            current_value: value,
            threshold_value: rule.threshold,
            status: AlertStatus::Active,
            created_at: now,
            last_notified_at: None,
            notified_severity: None,
            occurrence_count: 1,
            clear_since: None,
            escalated_at: None,
            resolved_at: None,
            message: rule.describe(value),
            channels: rule.channels.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AlertStatus::Active
    }

    pub(crate) fn resolve(&mut self, now: DateTime<Utc>) {
        self.status = AlertStatus::Resolved;
        self.resolved_at = Some(now);
    }
}

/// 状态变化类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Raised,
    Renotify,
    Escalated,
    Resolved,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Raised => "raised",
            TransitionKind::Renotify => "renotify",
            TransitionKind::Escalated => "escalated",
            TransitionKind::Resolved => "resolved",
        }
    }
}

/// 发布到告警总线上的状态变化
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertTransition {
    pub kind: TransitionKind,
    pub event: AlertEvent,
}

impl AlertTransition {
    pub fn new(kind: TransitionKind, event: AlertEvent) -> Self {
        Self { kind, event }
    }
}
