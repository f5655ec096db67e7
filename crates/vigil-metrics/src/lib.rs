pub mod collector;
pub mod internal;
pub mod series;
pub mod source;
pub mod system;

pub use collector::{CollectionReport, CollectorConfig, MetricsCollector};
pub use internal::{InternalMetrics, InternalMetricsSource};
pub use series::{labels_match, series_key, Labels, MetricSample, MetricSeries, MetricSummary};
pub use source::{FnSource, MetricSource, Observation, SourceError};
pub use system::SystemSource;
