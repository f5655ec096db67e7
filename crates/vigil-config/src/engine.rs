use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use vigil_alert::{AlertThreshold, EvaluatorConfig, StateConfig};
use vigil_core::{Result, VigilError};
use vigil_dashboard::DashboardConfig;
use vigil_health::HealthConfig;
use vigil_metrics::CollectorConfig;
use vigil_notify::{ChannelSettings, DispatcherConfig};

/// 引擎配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub collector: CollectorConfig,
    pub health: HealthConfig,
    pub evaluator: EvaluatorConfig,
    pub alerts: StateConfig,
    pub dispatcher: DispatcherConfig,
    pub dashboard: DashboardConfig,
    pub rules: Vec<AlertThreshold>,
    pub checks: Vec<HttpCheckConfig>,
    pub channels: Vec<ChannelConfig>,
}

/// HTTP 服务配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 告警总线容量
    pub bus_capacity: usize,
    /// 停止时等待进行中任务的时间（毫秒）
    pub shutdown_grace_ms: u64,
    /// 启动后立即开始周期任务
    pub autostart: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9090,
            bus_capacity: 1024,
            shutdown_grace_ms: 5_000,
            autostart: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// 日志配置（`RUST_LOG` 优先）
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// 配置文件中声明的 HTTP 健康检查
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HttpCheckConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub critical: bool,
    /// 响应慢于该值视为 Degraded（毫秒）
    #[serde(default = "default_degraded_after_ms")]
    pub degraded_after_ms: u64,
}

fn default_degraded_after_ms() -> u64 {
    1_000
}

/// 配置文件中声明的通知渠道
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(flatten)]
    pub settings: ChannelSettings,
}

impl EngineConfig {
    /// 校验配置：周期不能为 0，规则合法，名称不重复
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("collector.interval_secs", self.collector.interval_secs),
            ("health.interval_secs", self.health.interval_secs),
            ("evaluator.interval_secs", self.evaluator.interval_secs),
            ("dashboard.interval_secs", self.dashboard.interval_secs),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(VigilError::Config(format!("{} must be greater than 0", field)));
            }
        }

        if self.collector.max_series == 0 || self.collector.max_samples_per_series == 0 {
            return Err(VigilError::Config(
                "collector bounds must be greater than 0".to_string(),
            ));
        }

        let mut rule_names = HashSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !rule_names.insert(rule.name.as_str()) {
                return Err(VigilError::DuplicateRule(rule.name.clone()));
            }
        }

        let mut check_names = HashSet::new();
        for check in &self.checks {
            if check.url.trim().is_empty() {
                return Err(VigilError::Config(format!(
                    "health check '{}' has an empty url",
                    check.name
                )));
            }
            if !check_names.insert(check.name.as_str()) {
                return Err(VigilError::DuplicateCheck(check.name.clone()));
            }
        }

        let mut channel_names = HashSet::new();
        for channel in &self.channels {
            if !channel_names.insert(channel.name.as_str()) {
                return Err(VigilError::DuplicateChannel(channel.name.clone()));
            }
        }

        for rule in &self.rules {
            if let Some(unknown) = rule
                .channels
                .iter()
                .find(|c| !channel_names.contains(c.as_str()))
            {
                return Err(VigilError::invalid_rule(
                    &rule.name,
                    format!("unknown channel '{}'", unknown),
                ));
            }
        }

        Ok(())
    }

    /// 序列化为 TOML（用于检查生效的配置）
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_alert::{Comparison, Severity};
    use vigil_notify::ChatConfig;

    fn rule(name: &str) -> AlertThreshold {
        AlertThreshold::new(name, "cpu_percent", Comparison::Gt, 80.0, Severity::Warning)
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = EngineConfig::default();
        config.evaluator.interval_secs = 0;
        assert!(matches!(config.validate(), Err(VigilError::Config(_))));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut config = EngineConfig::default();
        config.rules = vec![rule("high_cpu"), rule("high_cpu")];
        assert!(matches!(config.validate(), Err(VigilError::DuplicateRule(_))));

        let mut config = EngineConfig::default();
        let chat = ChannelConfig {
            name: "ops".to_string(),
            settings: ChannelSettings::Chat(ChatConfig {
                webhook_url: "http://chat.local/hook".to_string(),
            }),
        };
        config.channels = vec![chat.clone(), chat];
        assert!(matches!(config.validate(), Err(VigilError::DuplicateChannel(_))));
    }

    #[test]
    fn test_rule_routing_to_unknown_channel_rejected() {
        let mut config = EngineConfig::default();
        config.rules = vec![rule("high_cpu").with_channels(vec!["pager".to_string()])];
        assert!(matches!(config.validate(), Err(VigilError::InvalidRule { .. })));
    }
}
