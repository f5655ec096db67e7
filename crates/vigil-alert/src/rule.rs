use serde::{Deserialize, Serialize};
use std::fmt;
use vigil_core::{Result, VigilError};
use vigil_metrics::Labels;

/// 告警级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// 升级一级；Critical 不再升级
    pub fn escalate(self) -> Self {
        match self {
            Severity::Info => Severity::Warning,
            Severity::Warning => Severity::Error,
            Severity::Error | Severity::Critical => Severity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 比较方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
}

impl Comparison {
    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Gt => value > threshold,
            Comparison::Lt => value < threshold,
            Comparison::Ge => value >= threshold,
            Comparison::Le => value <= threshold,
            Comparison::Eq => {
                let scale = 1.0_f64.max(value.abs()).max(threshold.abs());
                (value - threshold).abs() <= 1e-9 * scale
            }
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparison::Gt => ">",
            Comparison::Lt => "<",
            Comparison::Ge => ">=",
            Comparison::Le => "<=",
            Comparison::Eq => "==",
        }
    }
}

/// 阈值告警规则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThreshold {
    pub name: String,
    pub metric: String,
    /// 只评估标签包含这些键值对的序列
    #[serde(default)]
    pub labels: Labels,
    pub comparison: Comparison,
    pub threshold: f64,
    pub severity: Severity,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_min_occurrences")]
    pub min_occurrences: usize,
    #[serde(default = "default_renotify_interval_secs")]
    pub renotify_interval_secs: u64,
    #[serde(default)]
    pub escalation_after_secs: Option<u64>,
    #[serde(default)]
    pub cooldown_secs: u64,
    /// 通知渠道，为空时发送到所有渠道
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_window_secs() -> u64 {
    60
}

fn default_min_occurrences() -> usize {
    1
}

fn default_renotify_interval_secs() -> u64 {
    3600
}

impl AlertThreshold {
    pub fn new(
        name: impl Into<String>,
        metric: impl Into<String>,
        comparison: Comparison,
        threshold: f64,
        severity: Severity,
    ) -> Self {
        Self {
            name: name.into(),
            metric: metric.into(),
            labels: Labels::new(),
            comparison,
            threshold,
            severity,
            window_secs: default_window_secs(),
            min_occurrences: default_min_occurrences(),
            renotify_interval_secs: default_renotify_interval_secs(),
            escalation_after_secs: None,
            cooldown_secs: 0,
            channels: Vec::new(),
            description: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_window(mut self, window_secs: u64, min_occurrences: usize) -> Self {
        self.window_secs = window_secs;
        self.min_occurrences = min_occurrences;
        self
    }

    pub fn with_renotify_interval(mut self, secs: u64) -> Self {
        self.renotify_interval_secs = secs;
        self
    }

    pub fn with_escalation_after(mut self, secs: u64) -> Self {
        self.escalation_after_secs = Some(secs);
        self
    }

    pub fn with_cooldown(mut self, secs: u64) -> Self {
        self.cooldown_secs = secs;
        self
    }

    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(VigilError::invalid_rule(&self.name, "name must not be empty"));
        }
        if self.metric.trim().is_empty() {
            return Err(VigilError::invalid_rule(&self.name, "metric must not be empty"));
        }
        if !self.threshold.is_finite() {
            return Err(VigilError::invalid_rule(&self.name, "threshold must be finite"));
        }
        if self.window_secs == 0 {
            return Err(VigilError::invalid_rule(&self.name, "window_secs must be > 0"));
        }
        if self.min_occurrences == 0 {
            return Err(VigilError::invalid_rule(&self.name, "min_occurrences must be >= 1"));
        }
        if self.escalation_after_secs == Some(0) {
            return Err(VigilError::invalid_rule(
                &self.name,
                "escalation_after_secs must be > 0",
            ));
        }
        Ok(())
    }

    pub fn matches(&self, value: f64) -> bool {
        self.comparison.evaluate(value, self.threshold)
    }

    pub fn window(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.window_secs)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        secs(self.cooldown_secs)
    }

    pub fn renotify_interval(&self) -> chrono::Duration {
        secs(self.renotify_interval_secs)
    }

    pub fn escalation_after(&self) -> Option<chrono::Duration> {
        self.escalation_after_secs.map(secs)
    }

    pub fn describe(&self, value: f64) -> String {
        let base = format!(
            "{} {} {} (current {:.2})",
            self.metric,
            self.comparison.symbol(),
            self.threshold,
            value
        );
        match &self.description {
            Some(description) => format!("{}: {}", description, base),
            None => base,
        }
    }
}

fn secs(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(value.min(i64::MAX as u64 / 1000) as i64)
}
