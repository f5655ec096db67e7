use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use vigil_metrics::{series_key, Labels, MetricSummary};

/// 降采样层级：桶宽与桶数量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSpec {
    pub bucket_secs: u64,
    pub capacity: usize,
}

impl TierSpec {
    pub fn new(bucket_secs: u64, capacity: usize) -> Self {
        Self {
            bucket_secs: bucket_secs.max(1),
            capacity: capacity.max(1),
        }
    }

    /// 默认层级：10 秒 x 1 小时，1 分钟 x 1 天，10 分钟 x 7 天
    pub fn defaults() -> Vec<TierSpec> {
        vec![
            TierSpec::new(10, 360),
            TierSpec::new(60, 1440),
            TierSpec::new(600, 1008),
        ]
    }

    /// 本层覆盖的时长
    fn span(&self) -> chrono::Duration {
        let secs = self.bucket_secs.saturating_mul(self.capacity as u64);
        chrono::Duration::seconds(secs.min(i64::MAX as u64 / 1_000) as i64)
    }

    fn bucket_start(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.bucket_secs as i64;
        let secs = timestamp.timestamp().div_euclid(width) * width;
        DateTime::from_timestamp(secs, 0).unwrap_or(timestamp)
    }
}

/// 降采样后的一个桶
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    /// 桶起始时间
    pub timestamp: DateTime<Utc>,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
}

impl HistoryPoint {
    fn merge(&mut self, other: &HistoryPoint) {
        let total = self.count + other.count;
        if total > 0 {
            self.avg = (self.avg * self.count as f64 + other.avg * other.count as f64) / total as f64;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count = total;
    }
}

#[derive(Debug)]
struct Tier {
    spec: TierSpec,
    buckets: VecDeque<HistoryPoint>,
}

impl Tier {
    /// 合并一个点，返回被挤出的最旧桶
    fn absorb(&mut self, point: HistoryPoint) -> Option<HistoryPoint> {
        let start = self.spec.bucket_start(point.timestamp);
        let point = HistoryPoint {
            timestamp: start,
            ..point
        };

        match self.buckets.iter_mut().rev().find(|b| b.timestamp <= start) {
            Some(bucket) if bucket.timestamp == start => bucket.merge(&point),
            _ => {
                let idx = self.buckets.partition_point(|b| b.timestamp < start);
                self.buckets.insert(idx, point);
            }
        }

        if self.buckets.len() > self.spec.capacity {
            self.buckets.pop_front()
        } else {
            None
        }
    }
}

/// 单个序列的分层环形缓冲
///
/// 细粒度层淘汰的桶按平均值合并进下一层粗粒度桶，最粗一层直接丢弃。
#[derive(Debug)]
pub struct TieredHistory {
    tiers: Vec<Tier>,
}

impl TieredHistory {
    pub fn new(specs: &[TierSpec]) -> Self {
        Self {
            tiers: specs
                .iter()
                .map(|spec| Tier {
                    spec: *spec,
                    buckets: VecDeque::new(),
                })
                .collect(),
        }
    }

    pub fn record(&mut self, value: f64, timestamp: DateTime<Utc>) {
        let mut carry = Some(HistoryPoint {
            timestamp,
            avg: value,
            min: value,
            max: value,
            count: 1,
        });

        for tier in &mut self.tiers {
            match carry.take() {
                Some(point) => carry = tier.absorb(point),
                None => break,
            }
        }
    }

    /// `since` 之后的点，按时间升序
    ///
    /// 越新的数据越在细粒度层；每一层只取早于更细一层起点的桶，避免重叠。
    pub fn points_since(&self, since: DateTime<Utc>) -> Vec<HistoryPoint> {
        let mut points = Vec::new();
        let mut finer_start: Option<DateTime<Utc>> = None;

        for tier in &self.tiers {
            let cutoff = finer_start;
            points.extend(
                tier.buckets
                    .iter()
                    .filter(|b| cutoff.map(|c| b.timestamp < c).unwrap_or(true))
                    .cloned(),
            );
            if let Some(first) = tier.buckets.front() {
                finer_start = Some(match finer_start {
                    Some(current) => current.min(first.timestamp),
                    None => first.timestamp,
                });
            }
        }

        // 包含 `since` 所在的桶
        points.retain(|p| p.timestamp >= since || self.covers(p, since));
        points.sort_by_key(|p| p.timestamp);
        points
    }

    fn covers(&self, point: &HistoryPoint, since: DateTime<Utc>) -> bool {
        self.tiers
            .iter()
            .any(|t| t.spec.bucket_start(since) == point.timestamp)
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(|t| t.buckets.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 序列的降采样历史
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesHistory {
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
    pub points: Vec<HistoryPoint>,
}

struct Entry {
    name: String,
    labels: Labels,
    last_recorded: Option<DateTime<Utc>>,
    history: TieredHistory,
}

/// 所有序列的降采样历史
pub struct DownsampledHistory {
    tiers: Vec<TierSpec>,
    max_series: usize,
    series: HashMap<String, Entry>,
}

impl DownsampledHistory {
    pub fn new(tiers: Vec<TierSpec>, max_series: usize) -> Self {
        let tiers = if tiers.is_empty() {
            TierSpec::defaults()
        } else {
            tiers
        };
        Self {
            tiers,
            max_series,
            series: HashMap::new(),
        }
    }

    /// 记录一个序列的最新值；时间戳不比上次新的值被忽略
    pub fn record(&mut self, name: &str, labels: &Labels, value: f64, timestamp: DateTime<Utc>) -> bool {
        let key = series_key(name, labels);

        if !self.series.contains_key(&key) {
            if self.series.len() >= self.max_series {
                return false;
            }
            self.series.insert(
                key.clone(),
                Entry {
                    name: name.to_string(),
                    labels: labels.clone(),
                    last_recorded: None,
                    history: TieredHistory::new(&self.tiers),
                },
            );
        }

        let Some(entry) = self.series.get_mut(&key) else {
            return false;
        };
        if entry.last_recorded.map(|t| timestamp <= t).unwrap_or(false) {
            return false;
        }

        entry.history.record(value, timestamp);
        entry.last_recorded = Some(timestamp);
        true
    }

    /// 记录一轮摘要，返回因序列数量上限被拒绝的数量
    ///
    /// 最后一次记录早于最长保留期的序列先被清理；新序列遇到上限时，
    /// 淘汰本轮摘要中不存在且最久未记录的序列。
    pub fn record_summaries(&mut self, summaries: &[MetricSummary], now: DateTime<Utc>) -> usize {
        self.prune(now);

        let live: HashSet<String> = summaries
            .iter()
            .map(|s| series_key(&s.name, &s.labels))
            .collect();

        let mut refused = 0;
        for summary in summaries {
            let key = series_key(&summary.name, &summary.labels);
            let admitted = self.series.contains_key(&key)
                || self.series.len() < self.max_series
                || self.evict_idle(&live);
            if !admitted {
                refused += 1;
                continue;
            }
            self.record(
                &summary.name,
                &summary.labels,
                summary.latest,
                summary.last_timestamp,
            );
        }
        refused
    }

    /// 清理所有层都已过期的序列
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let retention = self
            .tiers
            .iter()
            .map(TierSpec::span)
            .max()
            .unwrap_or_else(chrono::Duration::zero);
        let cutoff = now - retention;

        let before = self.series.len();
        self.series
            .retain(|_, e| e.last_recorded.map(|t| t >= cutoff).unwrap_or(true));
        before - self.series.len()
    }

    fn evict_idle(&mut self, live: &HashSet<String>) -> bool {
        let victim = self
            .series
            .iter()
            .filter(|(key, _)| !live.contains(*key))
            .min_by_key(|(_, e)| e.last_recorded)
            .map(|(key, _)| key.clone());

        match victim {
            Some(key) => {
                self.series.remove(&key);
                true
            }
            None => false,
        }
    }

    /// 名为 `name` 的所有序列自 `since` 起的历史
    pub fn history(&self, name: &str, since: DateTime<Utc>) -> Vec<SeriesHistory> {
        let mut result: Vec<SeriesHistory> = self
            .series
            .values()
            .filter(|e| e.name == name)
            .map(|e| SeriesHistory {
                name: e.name.clone(),
                labels: e.labels.clone(),
                points: e.history.points_since(since),
            })
            .collect();
        result.sort_by(|a, b| a.labels.cmp(&b.labels));
        result
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }
}
