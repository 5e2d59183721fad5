//! Statistics aggregation for logprof
//!
//! - **Aggregator**: groups records by (method, uri) into [`HttpStat`]s
//! - **Filter**: boolean expressions evaluated per record before aggregation
//! - **Sort / Diff**: ordering of aggregated groups and snapshot deltas
//! - **Snapshot**: YAML dump/load of aggregated groups

pub mod aggregator;
pub mod diff;
pub mod error;
pub mod filter;
pub mod metric;
pub mod snapshot;
pub mod sort;
pub mod timeparse;

pub use aggregator::{Aggregator, HttpStat, StatsOptions};
pub use diff::{diff, format_count_delta, format_delta, DiffEntry, MetricDelta, Presence};
pub use error::{StatsError, StatsResult};
pub use filter::{Filter, FilterError};
pub use metric::MetricBlock;
pub use sort::{sort_stats, SortKey, SortMetric, SortOptions, SortTarget};
