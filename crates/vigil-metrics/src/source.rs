use crate::series::Labels;
use serde::{Deserialize, Serialize};

/// 来源读数（由采集器补上时间戳）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub metric: String,
    pub value: f64,
    #[serde(default)]
    pub labels: Labels,
}

impl Observation {
    pub fn new(metric: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            value,
            labels: Labels::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// 采样错误
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("invalid reading: {0}")]
    InvalidReading(String),
}

/// 指标来源
///
/// 采样是同步调用，采集器在阻塞线程池中执行并施加超时。
pub trait MetricSource: Send + Sync {
    fn name(&self) -> &str;

    fn sample(&self) -> Result<Vec<Observation>, SourceError>;
}

/// 基于闭包的指标来源
pub struct FnSource<F> {
    name: String,
    sample_fn: F,
}

impl<F> FnSource<F>
where
    F: Fn() -> Result<Vec<Observation>, SourceError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, sample_fn: F) -> Self {
        Self {
            name: name.into(),
            sample_fn,
        }
    }
}

impl<F> MetricSource for FnSource<F>
where
    F: Fn() -> Result<Vec<Observation>, SourceError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn sample(&self) -> Result<Vec<Observation>, SourceError> {
        (self.sample_fn)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_source() {
        let source = FnSource::new("queue", || {
            Ok(vec![Observation::new("queue_depth", 12.0).with_label("queue", "orders")])
        });

        assert_eq!(source.name(), "queue");
        let readings = source.sample().unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].labels.get("queue").unwrap(), "orders");
    }
}
