use crate::internal::InternalMetrics;
use crate::series::{labels_match, series_key, Labels, MetricSample, MetricSeries, MetricSummary};
use crate::source::{MetricSource, Observation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use vigil_core::PeriodicTask;

/// 采集器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// 每个序列最多保留的样本数
    pub max_samples_per_series: usize,
    /// 样本保留时长（秒）
    pub retention_secs: u64,
    /// 序列数量上限
    pub max_series: usize,
    /// 采集周期（秒）
    pub interval_secs: u64,
    /// 单个来源的采样超时（毫秒）
    pub source_timeout_ms: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_samples_per_series: 3600,
            retention_secs: 3600,
            max_series: 10_000,
            interval_secs: 10,
            source_timeout_ms: 2_000,
        }
    }
}

impl CollectorConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs.min(i64::MAX as u64) as i64)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }
}

/// 一次采集的结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionReport {
    pub sources_polled: usize,
    pub samples_recorded: usize,
    pub stale_samples: usize,
    pub failed_sources: Vec<String>,
}

#[derive(Default)]
struct SeriesStore {
    series: HashMap<String, MetricSeries>,
    // 指标名 -> 序列键
    by_name: HashMap<String, Vec<String>>,
}

impl SeriesStore {
    fn remove_empty(&mut self) {
        let empty: Vec<String> = self
            .series
            .iter()
            .filter(|(_, s)| s.is_empty())
            .map(|(k, _)| k.clone())
            .collect();

        for key in empty {
            if let Some(series) = self.series.remove(&key) {
                if let Some(keys) = self.by_name.get_mut(series.name()) {
                    keys.retain(|k| k != &key);
                    if keys.is_empty() {
                        self.by_name.remove(series.name());
                    }
                }
            }
        }
    }

    fn named(&self, name: &str) -> impl Iterator<Item = &MetricSeries> {
        self.by_name
            .get(name)
            .into_iter()
            .flat_map(|keys| keys.iter())
            .filter_map(|k| self.series.get(k))
    }
}

/// 指标采集器
///
/// 持有所有指标序列，并周期性地轮询已注册的来源。
pub struct MetricsCollector {
    config: CollectorConfig,
    store: RwLock<SeriesStore>,
    sources: RwLock<HashMap<String, Arc<dyn MetricSource>>>,
    // 来源名 -> 该来源上次产生的序列 (name, labels)
    source_series: RwLock<HashMap<String, Vec<(String, Labels)>>>,
    internal: Arc<InternalMetrics>,
    task: PeriodicTask,
}

impl MetricsCollector {
    pub fn new(config: CollectorConfig, internal: Arc<InternalMetrics>) -> Self {
        let task = PeriodicTask::new("metrics-collector", config.interval());
        Self {
            config,
            store: RwLock::new(SeriesStore::default()),
            sources: RwLock::new(HashMap::new()),
            source_series: RwLock::new(HashMap::new()),
            internal,
            task,
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn internal(&self) -> &Arc<InternalMetrics> {
        &self.internal
    }

    /// 记录一个样本（当前时间）
    pub async fn record(&self, name: &str, value: f64, labels: Labels) -> bool {
        self.record_at(name, value, labels, Utc::now()).await
    }

    /// 以指定时间戳记录样本；超过序列数量上限的新序列被丢弃并返回 `false`
    pub async fn record_at(
        &self,
        name: &str,
        value: f64,
        labels: Labels,
        timestamp: DateTime<Utc>,
    ) -> bool {
        self.insert(name, value, labels, timestamp, false).await
    }

    pub async fn record_sample(&self, sample: MetricSample) -> bool {
        self.insert(
            &sample.name,
            sample.value,
            sample.labels,
            sample.timestamp,
            sample.source_error,
        )
        .await
    }

    async fn insert(
        &self,
        name: &str,
        value: f64,
        labels: Labels,
        timestamp: DateTime<Utc>,
        source_error: bool,
    ) -> bool {
        if !value.is_finite() {
            self.internal.record_suppressed("collector", "non_finite");
            debug!(metric = %name, value, "Dropping non-finite sample");
            return false;
        }

        let key = series_key(name, &labels);
        let mut store = self.store.write().await;

        if let Some(series) = store.series.get_mut(&key) {
            series.push(value, timestamp, source_error);
            return true;
        }

        if store.series.len() >= self.config.max_series {
            drop(store);
            self.internal.record_suppressed("collector", "series_limit");
            warn!(
                series = %key,
                max_series = self.config.max_series,
                "Series limit reached, dropping new series"
            );
            return false;
        }

        let mut series = MetricSeries::new(
            name,
            labels,
            self.config.max_samples_per_series,
            self.config.retention(),
        );
        series.push(value, timestamp, source_error);
        store.series.insert(key.clone(), series);
        store
            .by_name
            .entry(name.to_string())
            .or_default()
            .push(key);

        let count = store.series.len();
        drop(store);
        self.internal.set_series_count(count);
        true
    }

    /// 名为 `name` 的所有序列在时间窗口内的样本，按时间升序
    pub async fn query_window(&self, name: &str, duration: Duration) -> Vec<MetricSample> {
        self.query_window_at(name, duration, Utc::now()).await
    }

    pub async fn query_window_at(
        &self,
        name: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Vec<MetricSample> {
        self.query_matching_at(name, &Labels::new(), duration, now)
            .await
    }

    /// 标签包含 `matcher` 的序列在时间窗口内的样本，按时间升序
    pub async fn query_matching_at(
        &self,
        name: &str,
        matcher: &Labels,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Vec<MetricSample> {
        let window = to_chrono(duration);
        let store = self.store.read().await;

        let mut samples: Vec<MetricSample> = store
            .named(name)
            .filter(|s| labels_match(s.labels(), matcher))
            .flat_map(|s| s.window(window, now))
            .collect();

        // 每个序列内部已有序，稳定排序合并
        samples.sort_by_key(|s| s.timestamp);
        samples
    }

    /// 单个序列（标签完全相同）在时间窗口内的样本
    pub async fn query_series(
        &self,
        name: &str,
        labels: &Labels,
        duration: Duration,
    ) -> Vec<MetricSample> {
        let store = self.store.read().await;
        store
            .series
            .get(&series_key(name, labels))
            .map(|s| s.window(to_chrono(duration), Utc::now()))
            .unwrap_or_default()
    }

    /// 单个序列的计数器增长率（每秒）
    pub async fn rate(&self, name: &str, labels: &Labels, duration: Duration) -> Option<f64> {
        self.rate_at(name, labels, duration, Utc::now()).await
    }

    pub async fn rate_at(
        &self,
        name: &str,
        labels: &Labels,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let store = self.store.read().await;
        store
            .series
            .get(&series_key(name, labels))?
            .rate(to_chrono(duration), now)
    }

    /// 单个序列的分位数，`q` 取值 0.0..=1.0
    pub async fn percentile(&self, name: &str, labels: &Labels, q: f64) -> Option<f64> {
        let store = self.store.read().await;
        store.series.get(&series_key(name, labels))?.percentile(q)
    }

    /// 单个序列最近一个有效样本
    pub async fn latest(&self, name: &str, labels: &Labels) -> Option<MetricSample> {
        let store = self.store.read().await;
        store.series.get(&series_key(name, labels))?.latest()
    }

    /// 每个序列的摘要，按序列键排序
    pub async fn summaries(&self) -> Vec<MetricSummary> {
        let store = self.store.read().await;
        let mut keys: Vec<&String> = store.series.keys().collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|k| store.series.get(k))
            .filter_map(|s| s.summary())
            .collect()
    }

    pub async fn series_count(&self) -> usize {
        self.store.read().await.series.len()
    }

    pub async fn metric_names(&self) -> Vec<String> {
        let store = self.store.read().await;
        let mut names: Vec<String> = store.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// 淘汰超过保留时长的样本，并删除空序列
    pub async fn evict_expired(&self) -> usize {
        self.evict_expired_at(Utc::now()).await
    }

    pub async fn evict_expired_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.config.retention();
        let mut store = self.store.write().await;

        let evicted: usize = store
            .series
            .values_mut()
            .map(|s| s.evict_before(cutoff))
            .sum();
        store.remove_empty();

        let count = store.series.len();
        drop(store);
        self.internal.set_series_count(count);

        if evicted > 0 {
            debug!(evicted, series = count, "Evicted expired samples");
        }
        evicted
    }

    /// 注册指标来源；同名来源被替换时返回 `false`
    pub async fn register_source(&self, source: Arc<dyn MetricSource>) -> bool {
        let name = source.name().to_string();
        let replaced = self
            .sources
            .write()
            .await
            .insert(name.clone(), source)
            .is_some();

        if replaced {
            info!(source = %name, "Metric source replaced");
        } else {
            info!(source = %name, "Metric source registered");
        }
        !replaced
    }

    pub async fn remove_source(&self, name: &str) -> bool {
        let removed = self.sources.write().await.remove(name).is_some();
        self.source_series.write().await.remove(name);
        if removed {
            info!(source = %name, "Metric source removed");
        }
        removed
    }

    pub async fn source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// 轮询所有来源
    pub async fn collect_all(&self) -> CollectionReport {
        self.collect_all_at(Utc::now()).await
    }

    /// 轮询所有来源，本次采集的样本统一使用 `now` 作为时间戳
    ///
    /// 每个来源在阻塞线程池中执行并受超时约束；出错、panic 或超时的来源
    /// 生成带 `source_error` 标记的陈旧样本，不影响其他来源。
    pub async fn collect_all_at(&self, now: DateTime<Utc>) -> CollectionReport {
        let sources: Vec<Arc<dyn MetricSource>> =
            self.sources.read().await.values().cloned().collect();
        let source_timeout = self.config.source_timeout();

        let mut polls = JoinSet::new();
        for source in sources {
            polls.spawn(async move {
                let name = source.name().to_string();
                let blocking = tokio::task::spawn_blocking(move || source.sample());

                let outcome = match tokio::time::timeout(source_timeout, blocking).await {
                    Ok(Ok(Ok(observations))) => Ok(observations),
                    Ok(Ok(Err(e))) => Err(("error", e.to_string())),
                    Ok(Err(join_err)) => Err(("panic", join_err.to_string())),
                    Err(_) => Err((
                        "timeout",
                        format!("sample exceeded {}ms", source_timeout.as_millis()),
                    )),
                };
                (name, outcome)
            });
        }

        let mut report = CollectionReport::default();

        while let Some(joined) = polls.join_next().await {
            let (source_name, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "Source poll task failed");
                    self.internal.record_suppressed("collector", "join");
                    continue;
                }
            };
            report.sources_polled += 1;

            match outcome {
                Ok(observations) => {
                    report.samples_recorded += self
                        .record_observations(&source_name, observations, now)
                        .await;
                }
                Err((kind, reason)) => {
                    warn!(source = %source_name, kind, reason = %reason, "Metric source failed");
                    self.internal.record_suppressed("collector", kind);
                    report.stale_samples += self.record_stale(&source_name, now).await;
                    report.failed_sources.push(source_name);
                }
            }
        }

        report.failed_sources.sort();
        debug!(
            sources = report.sources_polled,
            samples = report.samples_recorded,
            failed = report.failed_sources.len(),
            "Collection completed"
        );
        report
    }

    async fn record_observations(
        &self,
        source_name: &str,
        observations: Vec<Observation>,
        now: DateTime<Utc>,
    ) -> usize {
        let mut produced = Vec::with_capacity(observations.len());
        let mut recorded = 0;

        for obs in observations {
            if self
                .insert(&obs.metric, obs.value, obs.labels.clone(), now, false)
                .await
            {
                recorded += 1;
            }
            produced.push((obs.metric, obs.labels));
        }

        self.source_series
            .write()
            .await
            .insert(source_name.to_string(), produced);
        recorded
    }

    /// 为失败的来源生成陈旧样本：沿用上次的有效值，没有则为 0
    ///
    /// 从未成功过的来源没有已知序列，记录在以来源命名、带 `source` 标签的序列上。
    async fn record_stale(&self, source_name: &str, now: DateTime<Utc>) -> usize {
        let known = {
            let mut source_series = self.source_series.write().await;
            source_series
                .entry(source_name.to_string())
                .or_insert_with(|| {
                    let mut labels = Labels::new();
                    labels.insert("source".to_string(), source_name.to_string());
                    vec![(source_name.to_string(), labels)]
                })
                .clone()
        };

        let mut recorded = 0;
        for (name, labels) in known {
            let value = self
                .latest(&name, &labels)
                .await
                .map(|s| s.value)
                .unwrap_or(0.0);

            if self.insert(&name, value, labels, now, true).await {
                recorded += 1;
            }
        }
        recorded
    }

    /// 单次采集周期：轮询来源、淘汰过期样本
    pub async fn tick(&self) -> CollectionReport {
        let report = self.collect_all().await;
        self.evict_expired().await;
        report
    }

    /// 启动周期采集；已在运行时返回 `false`
    pub async fn start(self: &Arc<Self>) -> bool {
        let collector = Arc::clone(self);
        self.task
            .start(move || {
                let collector = Arc::clone(&collector);
                async move {
                    collector.tick().await;
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

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FnSource, SourceError};

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn collector(config: CollectorConfig) -> MetricsCollector {
        MetricsCollector::new(config, Arc::new(InternalMetrics::new().unwrap()))
    }

    fn host(name: &str) -> Labels {
        let mut labels = Labels::new();
        labels.insert("host".to_string(), name.to_string());
        labels
    }

    #[tokio::test]
    async fn test_record_and_query_window() {
        let c = collector(CollectorConfig::default());
        for i in 0..5 {
            c.record_at("cpu_percent", 70.0 + i as f64, Labels::new(), ts(i * 10))
                .await;
        }

        let samples = c
            .query_window_at("cpu_percent", Duration::from_secs(20), ts(40))
            .await;
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![72.0, 73.0, 74.0]);
        assert!(c.query_window_at("missing", Duration::from_secs(60), ts(40)).await.is_empty());
    }

    #[tokio::test]
    async fn test_query_merges_label_sets_in_time_order() {
        let c = collector(CollectorConfig::default());
        c.record_at("cpu_percent", 1.0, host("a"), ts(0)).await;
        c.record_at("cpu_percent", 2.0, host("b"), ts(5)).await;
        c.record_at("cpu_percent", 3.0, host("a"), ts(10)).await;

        let all = c
            .query_window_at("cpu_percent", Duration::from_secs(60), ts(10))
            .await;
        let values: Vec<f64> = all.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);

        let only_b = c
            .query_matching_at("cpu_percent", &host("b"), Duration::from_secs(60), ts(10))
            .await;
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].value, 2.0);
        assert_eq!(c.series_count().await, 2);
    }

    #[tokio::test]
    async fn test_rate_and_percentile() {
        let c = collector(CollectorConfig::default());
        for i in 0..=10 {
            c.record_at("requests_total", (i * 100) as f64, Labels::new(), ts(i))
                .await;
        }

        let rate = c
            .rate_at("requests_total", &Labels::new(), Duration::from_secs(60), ts(10))
            .await
            .unwrap();
        assert_eq!(rate, 100.0);

        let p50 = c.percentile("requests_total", &Labels::new(), 0.5).await.unwrap();
        assert_eq!(p50, 500.0);
    }

    #[tokio::test]
    async fn test_max_series_bound() {
        let c = collector(CollectorConfig {
            max_series: 2,
            ..Default::default()
        });

        assert!(c.record_at("m", 1.0, host("a"), ts(0)).await);
        assert!(c.record_at("m", 1.0, host("b"), ts(0)).await);
        assert!(!c.record_at("m", 1.0, host("c"), ts(0)).await);
        // 已存在的序列仍可写入
        assert!(c.record_at("m", 2.0, host("a"), ts(1)).await);

        assert_eq!(c.series_count().await, 2);
        assert_eq!(c.internal().suppressed_count("collector", "series_limit"), 1);
    }

    #[tokio::test]
    async fn test_evict_expired_removes_empty_series() {
        let c = collector(CollectorConfig {
            retention_secs: 60,
            ..Default::default()
        });
        c.record_at("old", 1.0, Labels::new(), ts(0)).await;
        c.record_at("fresh", 1.0, Labels::new(), ts(100)).await;

        let evicted = c.evict_expired_at(ts(120)).await;
        assert_eq!(evicted, 1);
        assert_eq!(c.metric_names().await, vec!["fresh".to_string()]);
    }

    #[tokio::test]
    async fn test_collect_all_records_source_observations() {
        let c = collector(CollectorConfig::default());
        c.register_source(Arc::new(FnSource::new("queue", || {
            Ok(vec![Observation::new("queue_depth", 12.0).with_label("queue", "orders")])
        })))
        .await;

        let report = c.collect_all_at(ts(0)).await;
        assert_eq!(report.sources_polled, 1);
        assert_eq!(report.samples_recorded, 1);
        assert!(report.failed_sources.is_empty());

        let mut labels = Labels::new();
        labels.insert("queue".to_string(), "orders".to_string());
        assert_eq!(c.latest("queue_depth", &labels).await.unwrap().value, 12.0);
    }

    #[tokio::test]
    async fn test_failing_source_produces_stale_samples() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let c = collector(CollectorConfig::default());
        let healthy = Arc::new(AtomicBool::new(true));

        let flag = healthy.clone();
        c.register_source(Arc::new(FnSource::new("flaky", move || {
            if flag.load(Ordering::SeqCst) {
                Ok(vec![Observation::new("flaky_value", 42.0)])
            } else {
                Err(SourceError::Unavailable("backend down".to_string()))
            }
        })))
        .await;
        c.register_source(Arc::new(FnSource::new("steady", || {
            Ok(vec![Observation::new("steady_value", 1.0)])
        })))
        .await;

        c.collect_all_at(ts(0)).await;
        healthy.store(false, Ordering::SeqCst);
        let report = c.collect_all_at(ts(10)).await;

        assert_eq!(report.failed_sources, vec!["flaky".to_string()]);
        assert_eq!(report.stale_samples, 1);
        assert_eq!(c.internal().suppressed_count("collector", "error"), 1);

        let samples = c
            .query_window_at("flaky_value", Duration::from_secs(60), ts(10))
            .await;
        assert_eq!(samples.len(), 2);
        assert!(samples[1].source_error);
        assert_eq!(samples[1].value, 42.0);

        // 其他来源不受影响
        let steady = c
            .query_window_at("steady_value", Duration::from_secs(60), ts(10))
            .await;
        assert_eq!(steady.len(), 2);
    }

    #[tokio::test]
    async fn test_source_failing_on_first_collection_records_zero() {
        let c = collector(CollectorConfig::default());
        c.register_source(Arc::new(FnSource::new("backend", || -> Result<Vec<Observation>, SourceError> {
            Err(SourceError::Unavailable("connection refused".to_string()))
        })))
        .await;

        let report = c.collect_all_at(ts(0)).await;
        assert_eq!(report.failed_sources, vec!["backend".to_string()]);
        assert_eq!(report.stale_samples, 1);

        let mut labels = Labels::new();
        labels.insert("source".to_string(), "backend".to_string());
        let sample = c.latest("backend", &labels).await.unwrap();
        assert_eq!(sample.value, 0.0);
        assert!(sample.source_error);

        // 持续失败时继续产生陈旧样本
        let report = c.collect_all_at(ts(10)).await;
        assert_eq!(report.stale_samples, 1);
        assert_eq!(
            c.query_window_at("backend", Duration::from_secs(60), ts(10))
                .await
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_panicking_and_slow_sources_are_isolated() {
        let c = collector(CollectorConfig {
            source_timeout_ms: 50,
            ..Default::default()
        });

        c.register_source(Arc::new(FnSource::new("panics", || -> Result<Vec<Observation>, SourceError> {
            panic!("sampler bug")
        })))
        .await;
        c.register_source(Arc::new(FnSource::new("slow", || {
            std::thread::sleep(std::time::Duration::from_millis(500));
            Ok(vec![Observation::new("slow_value", 1.0)])
        })))
        .await;
        c.register_source(Arc::new(FnSource::new("ok", || {
            Ok(vec![Observation::new("ok_value", 1.0)])
        })))
        .await;

        let report = c.collect_all_at(ts(0)).await;
        assert_eq!(report.sources_polled, 3);
        assert_eq!(
            report.failed_sources,
            vec!["panics".to_string(), "slow".to_string()]
        );
        assert_eq!(report.samples_recorded, 1);
        assert_eq!(c.internal().suppressed_count("collector", "panic"), 1);
        assert_eq!(c.internal().suppressed_count("collector", "timeout"), 1);
    }

    #[tokio::test]
    async fn test_remove_source() {
        let c = collector(CollectorConfig::default());
        c.register_source(Arc::new(FnSource::new("queue", || Ok(vec![]))))
            .await;
        assert!(c.remove_source("queue").await);
        assert!(!c.remove_source("queue").await);
        assert!(c.source_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let c = Arc::new(collector(CollectorConfig {
            interval_secs: 1,
            ..Default::default()
        }));
        assert!(c.start().await);
        assert!(!c.start().await);
        assert!(c.is_running().await);
        assert!(c.stop(Duration::from_secs(1)).await);
        assert!(!c.is_running().await);
    }
}
