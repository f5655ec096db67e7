pub mod aggregator;
pub mod history;
pub mod snapshot;

pub use aggregator::{ComponentSources, DashboardAggregator, DashboardConfig, DashboardSource};
pub use history::{DownsampledHistory, HistoryPoint, SeriesHistory, TierSpec};
pub use snapshot::DashboardSnapshot;
