use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// 镜像到采集器时使用的数值
    pub fn as_metric(&self) -> f64 {
        match self {
            HealthStatus::Healthy => 0.0,
            HealthStatus::Degraded => 1.0,
            HealthStatus::Unhealthy => 2.0,
            HealthStatus::Unknown => 3.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个组件的检查结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub component: String,
    pub status: HealthStatus,
    pub message: String,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub critical: bool,
}

/// 整体健康状况
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverallHealth {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
    pub as_of: DateTime<Utc>,
}

impl OverallHealth {
    /// 汇总检查结果
    ///
    /// 任一关键组件 Unhealthy 则整体 Unhealthy；否则任一组件 Degraded 或
    /// Unhealthy 则整体 Degraded；否则 Healthy。没有任何结果时为 Unknown，
    /// 单个 Unknown 结果不影响汇总。
    pub fn aggregate(checks: Vec<HealthCheckResult>, as_of: DateTime<Utc>) -> Self {
        let status = Self::aggregate_status(&checks);
        Self {
            status,
            checks,
            as_of,
        }
    }

    pub fn aggregate_status(checks: &[HealthCheckResult]) -> HealthStatus {
        if checks.is_empty() {
            return HealthStatus::Unknown;
        }

        let critical_down = checks
            .iter()
            .any(|c| c.critical && c.status == HealthStatus::Unhealthy);
        if critical_down {
            return HealthStatus::Unhealthy;
        }

        let impaired = checks
            .iter()
            .any(|c| matches!(c.status, HealthStatus::Degraded | HealthStatus::Unhealthy));
        if impaired {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}
