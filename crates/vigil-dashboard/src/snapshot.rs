use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use vigil_alert::{AlertEvent, Severity};
use vigil_core::Result;
use vigil_health::OverallHealth;
use vigil_metrics::MetricSummary;

/// 仪表盘快照
///
/// 某一时刻指标摘要、整体健康状况和告警的不可变组合。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub as_of: DateTime<Utc>,
    pub metrics: Vec<MetricSummary>,
    pub health: OverallHealth,
    pub active_alerts: Vec<AlertEvent>,
    #[serde(default)]
    pub recently_resolved: Vec<AlertEvent>,
    /// 各级别的活跃告警数量
    #[serde(default)]
    pub alert_counts: BTreeMap<Severity, usize>,
}

impl DashboardSnapshot {
    pub fn new(
        as_of: DateTime<Utc>,
        metrics: Vec<MetricSummary>,
        health: OverallHealth,
        active_alerts: Vec<AlertEvent>,
        recently_resolved: Vec<AlertEvent>,
    ) -> Self {
        let mut alert_counts = BTreeMap::new();
        for event in &active_alerts {
            *alert_counts.entry(event.severity).or_insert(0) += 1;
        }

        Self {
            as_of,
            metrics,
            health,
            active_alerts,
            recently_resolved,
            alert_counts,
        }
    }

    /// 启动时尚未聚合过的空快照
    pub fn empty(as_of: DateTime<Utc>) -> Self {
        Self::new(
            as_of,
            Vec::new(),
            OverallHealth::aggregate(Vec::new(), as_of),
            Vec::new(),
            Vec::new(),
        )
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_alert::{AlertThreshold, Comparison};
    use vigil_health::{HealthCheckResult, HealthStatus};
    use vigil_metrics::Labels;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn populated() -> DashboardSnapshot {
        let mut labels = Labels::new();
        labels.insert("host".to_string(), "web-1".to_string());

        let summary = MetricSummary {
            name: "cpu_percent".to_string(),
            labels,
            count: 3,
            latest: 91.5,
            min: 70.25,
            max: 91.5,
            mean: 80.125,
            p50: 78.0,
            p95: 91.5,
            p99: 91.5,
            rate_per_sec: 0.1,
            last_timestamp: ts(30),
        };

        let health = OverallHealth::aggregate(
            vec![HealthCheckResult {
                component: "db".to_string(),
                status: HealthStatus::Degraded,
                message: "slow".to_string(),
                latency_ms: 250,
                timestamp: ts(29),
                critical: true,
            }],
            ts(30),
        );

        let rule = AlertThreshold::new("high_cpu", "cpu_percent", Comparison::Gt, 80.0, Severity::Error)
            .with_channels(vec!["ops".to_string()]);
        let mut event = AlertEvent::raise(&rule, 91.5, ts(10));
        event.last_notified_at = Some(ts(10));
        event.notified_severity = Some(Severity::Error);

        DashboardSnapshot::new(ts(30), vec![summary], health, vec![event], Vec::new())
    }

    #[test]
    fn test_snapshot_json_round_trip() {
        let snapshot = populated();
        let json = snapshot.to_json().unwrap();
        let restored = DashboardSnapshot::from_json(&json).unwrap();
        assert_eq!(snapshot, restored);
    }

    #[test]
    fn test_arbitrary_floats_reload_exactly() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(20231114);
        let mut snapshot = populated();
        for _ in 0..2_000 {
            let summary = &mut snapshot.metrics[0];
            summary.latest = rng.gen::<f64>() * 100.0;
            summary.min = rng.gen::<f64>();
            summary.max = rng.gen::<f64>() * 1e6;
            summary.mean = rng.gen_range(-1e3..1e3);
            summary.p50 = rng.gen::<f64>() * 100.0;
            summary.p95 = rng.gen::<f64>() * 100.0;
            summary.p99 = rng.gen::<f64>() * 100.0;
            summary.rate_per_sec = rng.gen::<f64>() / 3.0;
            snapshot.active_alerts[0].current_value = rng.gen::<f64>() * 100.0;

            let restored = DashboardSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
            assert_eq!(snapshot, restored);
        }
    }

    #[test]
    fn test_empty_snapshot_round_trip() {
        let snapshot = DashboardSnapshot::empty(ts(0));
        assert_eq!(snapshot.health.status, HealthStatus::Unknown);
        let restored = DashboardSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(snapshot, restored);
    }

    #[test]
    fn test_alert_counts() {
        let snapshot = populated();
        assert_eq!(snapshot.alert_counts.get(&Severity::Error), Some(&1));
        assert_eq!(snapshot.alert_counts.get(&Severity::Critical), None);
    }

    #[test]
    fn test_invalid_json_is_serialization_error() {
        let err = DashboardSnapshot::from_json("{not json").unwrap_err();
        assert!(matches!(err, vigil_core::VigilError::Serialization(_)));
    }
}
