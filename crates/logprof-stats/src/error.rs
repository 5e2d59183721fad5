use crate::filter::FilterError;
use thiserror::Error;

/// Aggregation error type
#[derive(Error, Debug)]
pub enum StatsError {
    #[error("Too many URIs ({0} or less)")]
    TooManyUris(usize),

    #[error("Invalid matching group {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid percentile {0}: must be between 0 and 100")]
    InvalidPercentile(String),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StatsResult<T> = Result<T, StatsError>;
