use crate::series::Labels;
use crate::source::{MetricSource, Observation, SourceError};
use prometheus::proto::MetricType;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// 引擎自身的运行指标
///
/// 每个被吞掉的单点错误（探针失败、渠道投递失败、来源采样失败）都会在这里计数。
pub struct InternalMetrics {
    // 被吞掉的错误
    suppressed_errors: IntCounterVec,

    // 通知投递
    notifications_total: IntCounterVec,

    // 告警状态变化
    alert_transitions_total: IntCounterVec,

    active_alerts: IntGauge,
    series_count: IntGauge,

    probe_duration: HistogramVec,

    registry: Registry,
}

impl InternalMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let suppressed_errors = IntCounterVec::new(
            Opts::new(
                "vigil_suppressed_errors_total",
                "Single-item failures captured instead of propagated",
            ),
            &["component", "kind"],
        )?;
        registry.register(Box::new(suppressed_errors.clone()))?;

        let notifications_total = IntCounterVec::new(
            Opts::new("vigil_notifications_total", "Notification delivery outcomes"),
            &["channel", "outcome"],
        )?;
        registry.register(Box::new(notifications_total.clone()))?;

        let alert_transitions_total = IntCounterVec::new(
            Opts::new("vigil_alert_transitions_total", "Alert lifecycle transitions"),
            &["kind"],
        )?;
        registry.register(Box::new(alert_transitions_total.clone()))?;

        let active_alerts = IntGauge::new("vigil_active_alerts", "Number of active alerts")?;
        registry.register(Box::new(active_alerts.clone()))?;

        let series_count = IntGauge::new("vigil_metric_series", "Number of metric series held")?;
        registry.register(Box::new(series_count.clone()))?;

        let probe_duration = HistogramVec::new(
            HistogramOpts::new("vigil_probe_duration_seconds", "Health probe duration")
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["component"],
        )?;
        registry.register(Box::new(probe_duration.clone()))?;

        Ok(Self {
            suppressed_errors,
            notifications_total,
            alert_transitions_total,
            active_alerts,
            series_count,
            probe_duration,
            registry,
        })
    }

    pub fn record_suppressed(&self, component: &str, kind: &str) {
        self.suppressed_errors
            .with_label_values(&[component, kind])
            .inc();
    }

    pub fn suppressed_count(&self, component: &str, kind: &str) -> u64 {
        self.suppressed_errors
            .with_label_values(&[component, kind])
            .get()
    }

    /// 所有组件被吞掉的错误总数
    pub fn suppressed_total(&self) -> u64 {
        self.sum_counter("vigil_suppressed_errors_total", None)
    }

    /// 某个组件被吞掉的错误总数
    pub fn suppressed_for(&self, component: &str) -> u64 {
        self.sum_counter("vigil_suppressed_errors_total", Some(("component", component)))
    }

    pub fn record_notification(&self, channel: &str, outcome: &str) {
        self.notifications_total
            .with_label_values(&[channel, outcome])
            .inc();
    }

    pub fn notification_count(&self, channel: &str, outcome: &str) -> u64 {
        self.notifications_total
            .with_label_values(&[channel, outcome])
            .get()
    }

    pub fn record_transition(&self, kind: &str) {
        self.alert_transitions_total.with_label_values(&[kind]).inc();
    }

    pub fn transition_count(&self, kind: &str) -> u64 {
        self.alert_transitions_total.with_label_values(&[kind]).get()
    }

    pub fn set_active_alerts(&self, count: usize) {
        self.active_alerts.set(count as i64);
    }

    pub fn set_series_count(&self, count: usize) {
        self.series_count.set(count as i64);
    }

    pub fn observe_probe_duration(&self, component: &str, seconds: f64) {
        self.probe_duration
            .with_label_values(&[component])
            .observe(seconds);
    }

    fn sum_counter(&self, family: &str, filter: Option<(&str, &str)>) -> u64 {
        self.registry
            .gather()
            .iter()
            .filter(|mf| mf.get_name() == family)
            .flat_map(|mf| mf.get_metric().iter())
            .filter(|m| match filter {
                Some((key, value)) => m
                    .get_label()
                    .iter()
                    .any(|l| l.get_name() == key && l.get_value() == value),
                None => true,
            })
            .map(|m| m.get_counter().get_value() as u64)
            .sum()
    }

    /// 计数器与仪表盘值，转换为采集器可记录的读数
    pub fn observations(&self) -> Vec<Observation> {
        let mut readings = Vec::new();

        for family in self.registry.gather() {
            let field_type = family.get_field_type();
            if field_type != MetricType::COUNTER && field_type != MetricType::GAUGE {
                continue;
            }

            for metric in family.get_metric() {
                let labels: Labels = metric
                    .get_label()
                    .iter()
                    .map(|l| (l.get_name().to_string(), l.get_value().to_string()))
                    .collect();

                let value = if field_type == MetricType::COUNTER {
                    metric.get_counter().get_value()
                } else {
                    metric.get_gauge().get_value()
                };

                readings.push(Observation {
                    metric: family.get_name().to_string(),
                    value,
                    labels,
                });
            }
        }

        readings
    }

    // 导出指标
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// 将引擎自身指标作为一个普通来源接入采集器，规则可以针对引擎自身告警
pub struct InternalMetricsSource {
    metrics: Arc<InternalMetrics>,
}

impl InternalMetricsSource {
    pub fn new(metrics: Arc<InternalMetrics>) -> Self {
        Self { metrics }
    }
}

impl MetricSource for InternalMetricsSource {
    fn name(&self) -> &str {
        "vigil-internal"
    }

    fn sample(&self) -> Result<Vec<Observation>, SourceError> {
        Ok(self.metrics.observations())
    }
}
