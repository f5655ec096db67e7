use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// 标签集合（有序，保证序列键稳定）
pub type Labels = BTreeMap<String, String>;

/// 单个指标采样
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,
    /// 采样来源出错时生成的陈旧/零值采样
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub source_error: bool,
}

/// 序列摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,
    pub count: usize,
    pub latest: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub rate_per_sec: f64,
    pub last_timestamp: DateTime<Utc>,
}

/// 生成序列键，例如 `cpu_percent{host=a,zone=b}`
pub fn series_key(name: &str, labels: &Labels) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let pairs = labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>();
    format!("{}{{{}}}", name, pairs.join(","))
}

/// `labels` 是否包含 `matcher` 中的全部键值对
pub fn labels_match(labels: &Labels, matcher: &Labels) -> bool {
    matcher
        .iter()
        .all(|(k, v)| labels.get(k).map(|actual| actual == v).unwrap_or(false))
}

#[derive(Debug, Clone, Copy)]
struct Point {
    value: f64,
    timestamp: DateTime<Utc>,
    source_error: bool,
}

/// 有界指标序列
///
/// 样本按时间有序保存，超出数量上限或保留时长的旧样本从头部淘汰。
/// 另外维护一个升序的值索引：写入时二分定位后移动元素（O(n)），分位数查询为 O(1)。
#[derive(Debug)]
pub struct MetricSeries {
    name: String,
    labels: Labels,
    points: VecDeque<Point>,
    sorted: Vec<f64>,
    sum: f64,
    max_samples: usize,
    retention: Duration,
}

impl MetricSeries {
    pub fn new(name: impl Into<String>, labels: Labels, max_samples: usize, retention: Duration) -> Self {
        let max_samples = max_samples.max(1);
        Self {
            name: name.into(),
            labels,
            points: VecDeque::with_capacity(max_samples.min(1024)),
            sorted: Vec::with_capacity(max_samples.min(1024)),
            sum: 0.0,
            max_samples,
            retention,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// 追加样本
    ///
    /// 正常情况下样本时间单调递增，直接追加到尾部；迟到样本插入到其时间位置。
    pub fn push(&mut self, value: f64, timestamp: DateTime<Utc>, source_error: bool) {
        let point = Point {
            value,
            timestamp,
            source_error,
        };

        match self.points.back() {
            Some(last) if last.timestamp > timestamp => {
                let idx = self.points.partition_point(|p| p.timestamp <= timestamp);
                self.points.insert(idx, point);
            }
            _ => self.points.push_back(point),
        }

        if !source_error {
            let idx = self.sorted.partition_point(|v| *v < value);
            self.sorted.insert(idx, value);
            self.sum += value;
        }

        while self.points.len() > self.max_samples {
            self.pop_front();
        }

        if let Some(newest) = self.points.back().map(|p| p.timestamp) {
            self.evict_before(newest - self.retention);
        }
    }

    /// 淘汰早于 `cutoff` 的样本，返回淘汰数量
    pub fn evict_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        while self
            .points
            .front()
            .map(|p| p.timestamp < cutoff)
            .unwrap_or(false)
        {
            self.pop_front();
            evicted += 1;
        }
        evicted
    }

    fn pop_front(&mut self) {
        if let Some(point) = self.points.pop_front() {
            if !point.source_error {
                let idx = self.sorted.partition_point(|v| *v < point.value);
                if idx < self.sorted.len() {
                    self.sorted.remove(idx);
                    self.sum -= point.value;
                }
            }
        }
    }

    fn to_sample(&self, point: &Point) -> MetricSample {
        MetricSample {
            name: self.name.clone(),
            value: point.value,
            timestamp: point.timestamp,
            labels: self.labels.clone(),
            source_error: point.source_error,
        }
    }

    /// `[now - duration, now]` 区间内样本的下标范围（二分查找）
    fn window_bounds(&self, duration: Duration, now: DateTime<Utc>) -> (usize, usize) {
        let since = now - duration;
        let start = self.points.partition_point(|p| p.timestamp < since);
        let end = self.points.partition_point(|p| p.timestamp <= now);
        (start, end.max(start))
    }

    /// 时间窗口内的样本（按时间升序）
    pub fn window(&self, duration: Duration, now: DateTime<Utc>) -> Vec<MetricSample> {
        let (start, end) = self.window_bounds(duration, now);
        self.points
            .range(start..end)
            .map(|p| self.to_sample(p))
            .collect()
    }

    /// 最近一个有效样本
    pub fn latest(&self) -> Option<MetricSample> {
        self.points
            .iter()
            .rev()
            .find(|p| !p.source_error)
            .map(|p| self.to_sample(p))
    }

    /// 最近一个样本（包括来源出错的样本）
    pub fn last(&self) -> Option<MetricSample> {
        self.points.back().map(|p| self.to_sample(p))
    }

    /// 分位数（最近秩法），`q` 取值 0.0..=1.0
    pub fn percentile(&self, q: f64) -> Option<f64> {
        if self.sorted.is_empty() {
            return None;
        }
        let q = q.clamp(0.0, 1.0);
        let n = self.sorted.len();
        let rank = (q * n as f64).ceil() as usize;
        let idx = rank.saturating_sub(1).min(n - 1);
        Some(self.sorted[idx])
    }

    /// 计数器语义的每秒增长率
    ///
    /// 取窗口首尾两个有效样本；尾值小于首值视为计数器重置，从零开始计算。
    pub fn rate(&self, duration: Duration, now: DateTime<Utc>) -> Option<f64> {
        let (start, end) = self.window_bounds(duration, now);
        let first = self.points.range(start..end).find(|p| !p.source_error)?;
        let last = self.points.range(start..end).rev().find(|p| !p.source_error)?;
        Some(Self::rate_between(first, last))
    }

    fn rate_between(first: &Point, last: &Point) -> f64 {
        let elapsed = (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0;
        if elapsed <= 0.0 {
            return 0.0;
        }
        let delta = if last.value >= first.value {
            last.value - first.value
        } else {
            last.value
        };
        delta / elapsed
    }

    pub fn summary(&self) -> Option<MetricSummary> {
        let latest = self.points.iter().rev().find(|p| !p.source_error)?;
        let first = self.points.iter().find(|p| !p.source_error)?;
        let count = self.sorted.len();

        Some(MetricSummary {
            name: self.name.clone(),
            labels: self.labels.clone(),
            count,
            latest: latest.value,
            min: self.sorted[0],
            max: self.sorted[count - 1],
            mean: self.sum / count as f64,
            p50: self.percentile(0.50).unwrap_or(latest.value),
            p95: self.percentile(0.95).unwrap_or(latest.value),
            p99: self.percentile(0.99).unwrap_or(latest.value),
            rate_per_sec: Self::rate_between(first, latest),
            last_timestamp: latest.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn series(max: usize, retention_secs: i64) -> MetricSeries {
        MetricSeries::new("cpu", Labels::new(), max, Duration::seconds(retention_secs))
    }

    #[test]
    fn test_series_key() {
        let mut labels = Labels::new();
        labels.insert("zone".to_string(), "b".to_string());
        labels.insert("host".to_string(), "a".to_string());
        assert_eq!(series_key("cpu", &labels), "cpu{host=a,zone=b}");
        assert_eq!(series_key("cpu", &Labels::new()), "cpu");
    }

    #[test]
    fn test_count_bound_evicts_oldest() {
        let mut s = series(3, 3600);
        for i in 0..5 {
            s.push(i as f64, ts(i), false);
        }
        assert_eq!(s.len(), 3);
        let values: Vec<f64> = s.window(Duration::hours(1), ts(10)).iter().map(|x| x.value).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
        assert_eq!(s.percentile(0.0), Some(2.0));
    }

    #[test]
    fn test_retention_bound_evicts_old_samples() {
        let mut s = series(100, 60);
        s.push(1.0, ts(0), false);
        s.push(2.0, ts(30), false);
        s.push(3.0, ts(100), false);
        // ts(0) 与 ts(30) 都早于 100 - 60
        assert_eq!(s.len(), 1);
        assert_eq!(s.latest().unwrap().value, 3.0);
    }

    #[test]
    fn test_late_sample_keeps_time_order() {
        let mut s = series(10, 3600);
        s.push(1.0, ts(0), false);
        s.push(3.0, ts(20), false);
        s.push(2.0, ts(10), false);
        let values: Vec<f64> = s.window(Duration::hours(1), ts(30)).iter().map(|x| x.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_window_bounds() {
        let mut s = series(100, 3600);
        for i in 0..10 {
            s.push(i as f64, ts(i * 10), false);
        }
        let window = s.window(Duration::seconds(30), ts(90));
        let values: Vec<f64> = window.iter().map(|x| x.value).collect();
        assert_eq!(values, vec![6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_percentiles() {
        let mut s = series(1000, 3600);
        for i in 1..=100 {
            s.push(i as f64, ts(i), false);
        }
        assert_eq!(s.percentile(0.50), Some(50.0));
        assert_eq!(s.percentile(0.95), Some(95.0));
        assert_eq!(s.percentile(0.99), Some(99.0));
        assert_eq!(s.percentile(1.0), Some(100.0));
    }

    #[test]
    fn test_rate_with_counter_reset() {
        let mut s = series(100, 3600);
        s.push(100.0, ts(0), false);
        s.push(200.0, ts(10), false);
        assert_eq!(s.rate(Duration::minutes(1), ts(10)), Some(10.0));

        s.push(50.0, ts(20), false);
        assert_eq!(s.rate(Duration::minutes(1), ts(20)), Some(2.5));
    }

    #[test]
    fn test_source_error_samples_excluded_from_statistics() {
        let mut s = series(100, 3600);
        s.push(10.0, ts(0), false);
        s.push(0.0, ts(10), true);

        let summary = s.summary().unwrap();
        assert_eq!(summary.count, 1);
        assert_eq!(summary.latest, 10.0);
        assert_eq!(summary.min, 10.0);
        assert!(s.last().unwrap().source_error);
    }

    #[test]
    fn test_summary() {
        let mut s = series(100, 3600);
        for (i, v) in [4.0, 2.0, 6.0, 8.0].iter().enumerate() {
            s.push(*v, ts(i as i64), false);
        }
        let summary = s.summary().unwrap();
        assert_eq!(summary.count, 4);
        assert_eq!(summary.latest, 8.0);
        assert_eq!(summary.min, 2.0);
        assert_eq!(summary.max, 8.0);
        assert_eq!(summary.mean, 5.0);
        assert_eq!(summary.last_timestamp, ts(3));
    }
}
