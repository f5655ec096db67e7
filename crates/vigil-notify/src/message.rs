use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vigil_alert::{AlertTransition, Severity, TransitionKind};

/// 通知类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyKind {
    /// 告警（新建、重复提醒、升级）
    Alert,
    /// 告警已解决
    Resolved,
    /// 测试消息
    Test,
}

/// 通知消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyMessage {
    pub kind: NotifyKind,
    pub severity: Severity,
    pub rule_name: String,
    /// 标题
    pub title: String,
    /// 内容
    pub message: String,
    pub current_value: Option<f64>,
    pub threshold_value: Option<f64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
}

impl NotifyMessage {
    pub fn from_transition(transition: &AlertTransition) -> Self {
        let event = &transition.event;
        let (kind, title) = match transition.kind {
            TransitionKind::Raised => (
                NotifyKind::Alert,
                format!("[{}] {} raised", event.severity, event.rule_name),
            ),
            TransitionKind::Renotify => (
                NotifyKind::Alert,
                format!(
                    "[{}] {} still active ({} occurrences)",
                    event.severity, event.rule_name, event.occurrence_count
                ),
            ),
            TransitionKind::Escalated => (
                NotifyKind::Alert,
                format!(
                    "[{}] {} escalated from {}",
                    event.severity, event.rule_name, event.base_severity
                ),
            ),
            TransitionKind::Resolved => (
                NotifyKind::Resolved,
                format!("[resolved] {}", event.rule_name),
            ),
        };

        Self {
            kind,
            severity: event.severity,
            rule_name: event.rule_name.clone(),
            title,
            message: event.message.clone(),
            current_value: Some(event.current_value),
            threshold_value: Some(event.threshold_value),
            timestamp: event.resolved_at.unwrap_or_else(Utc::now),
            event_id: Some(event.id),
        }
    }

    pub fn test(channel: &str) -> Self {
        Self {
            kind: NotifyKind::Test,
            severity: Severity::Info,
            rule_name: "vigil-test".to_string(),
            title: format!("Test notification for {}", channel),
            message: "This is a test notification from vigil".to_string(),
            current_value: None,
            threshold_value: None,
            timestamp: Utc::now(),
            event_id: None,
        }
    }

    /// 纯文本正文（邮件使用）
    pub fn render_text(&self) -> String {
        let mut body = format!(
            "{}\n\nRule: {}\nSeverity: {}\n",
            self.message, self.rule_name, self.severity
        );
        if let Some(value) = self.current_value {
            body.push_str(&format!("Current value: {}\n", value));
        }
        if let Some(threshold) = self.threshold_value {
            body.push_str(&format!("Threshold: {}\n", threshold));
        }
        body.push_str(&format!("Time: {}\n", self.timestamp.to_rfc3339()));
        body
    }

    /// Markdown 正文（聊天渠道使用）
    pub fn render_markdown(&self) -> String {
        let mut text = format!(
            "## {}\n\n{}\n\n**Rule**: {}\n\n**Severity**: {}",
            self.title, self.message, self.rule_name, self.severity
        );
        if let Some(value) = self.current_value {
            text.push_str(&format!("\n\n**Current value**: {}", value));
        }
        if let Some(threshold) = self.threshold_value {
            text.push_str(&format!("\n\n**Threshold**: {}", threshold));
        }
        text.push_str(&format!("\n\n**Time**: {}", self.timestamp.to_rfc3339()));
        text
    }
}
