//! Grouping of records by (method, uri)

use crate::error::{StatsError, StatsResult};
use crate::filter::Filter;
use crate::metric::MetricBlock;
use crate::sort::{sort_stats, SortOptions};
use logprof_core::Record;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Accumulated statistics for one (method, uri) group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpStat {
    pub uri: String,
    pub count: i64,
    pub status1xx: i64,
    pub status2xx: i64,
    pub status3xx: i64,
    pub status4xx: i64,
    pub status5xx: i64,
    pub method: String,
    pub response_time: MetricBlock,
    pub request_body_bytes: MetricBlock,
    pub response_body_bytes: MetricBlock,
    /// Time text of the most recent record in the group
    #[serde(default)]
    pub time: String,
}

impl HttpStat {
    pub fn new(uri: impl Into<String>, method: impl Into<String>, options: &StatsOptions) -> Self {
        Self {
            uri: uri.into(),
            count: 0,
            status1xx: 0,
            status2xx: 0,
            status3xx: 0,
            status4xx: 0,
            status5xx: 0,
            method: method.into(),
            response_time: MetricBlock::new(options.response_time_percentile),
            request_body_bytes: MetricBlock::new(options.request_body_percentile),
            response_body_bytes: MetricBlock::new(options.response_body_percentile),
            time: String::new(),
        }
    }

    /// Feed one record into the group
    pub fn set(&mut self, record: &Record) {
        self.count += 1;
        match record.status {
            100..=199 => self.status1xx += 1,
            200..=299 => self.status2xx += 1,
            300..=399 => self.status3xx += 1,
            400..=499 => self.status4xx += 1,
            500..=599 => self.status5xx += 1,
            _ => {}
        }
        self.response_time.set(record.response_time);
        self.request_body_bytes.set(record.request_body_bytes);
        self.response_body_bytes.set(record.body_bytes);
        if !record.time.is_empty() {
            self.time = record.time.clone();
        }
    }
}

/// Aggregation settings
#[derive(Debug, Clone)]
pub struct StatsOptions {
    /// URI collapsing patterns, checked in order
    pub matching_groups: Vec<String>,
    /// Filter expression applied before aggregation
    pub filter: Option<String>,
    /// Maximum number of distinct groups
    pub limit: usize,
    pub response_time_percentile: bool,
    pub request_body_percentile: bool,
    pub response_body_percentile: bool,
}

impl Default for StatsOptions {
    fn default() -> Self {
        Self {
            matching_groups: Vec::new(),
            filter: None,
            limit: 5000,
            response_time_percentile: true,
            request_body_percentile: true,
            response_body_percentile: true,
        }
    }
}

/// Groups records into [`HttpStat`]s, preserving first-seen order
pub struct Aggregator {
    options: StatsOptions,
    patterns: Vec<Regex>,
    filter: Option<Filter>,
    hints: HashMap<(String, String), usize>,
    stats: Vec<HttpStat>,
    filtered: u64,
}

impl Aggregator {
    /// Compile patterns and filter up front so bad input fails before any
    /// record is read.
    pub fn new(options: StatsOptions) -> StatsResult<Self> {
        let patterns = options
            .matching_groups
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| StatsError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<StatsResult<Vec<_>>>()?;

        let filter = match options.filter.as_deref().map(str::trim) {
            Some(expr) if !expr.is_empty() => Some(Filter::compile(expr)?),
            _ => None,
        };

        Ok(Self {
            options,
            patterns,
            filter,
            hints: HashMap::new(),
            stats: Vec::new(),
            filtered: 0,
        })
    }

    /// Rebuild an aggregator from previously dumped groups
    pub fn from_stats(options: StatsOptions, stats: Vec<HttpStat>) -> StatsResult<Self> {
        let mut aggregator = Self::new(options)?;
        for stat in stats {
            let key = (stat.method.clone(), stat.uri.clone());
            if aggregator.hints.contains_key(&key) {
                debug!("Duplicate group {} {} in snapshot", key.0, key.1);
                continue;
            }
            aggregator.hints.insert(key, aggregator.stats.len());
            aggregator.stats.push(stat);
        }
        Ok(aggregator)
    }

    /// Run the filter, then aggregate. Returns whether the record was kept.
    pub fn observe(&mut self, record: &Record) -> StatsResult<bool> {
        if let Some(filter) = &self.filter {
            if !filter.matches(record)? {
                self.filtered += 1;
                return Ok(false);
            }
        }
        self.set(record)?;
        Ok(true)
    }

    /// Aggregate a record without filtering
    pub fn set(&mut self, record: &Record) -> StatsResult<()> {
        let uri = self
            .patterns
            .iter()
            .find(|re| re.is_match(&record.uri))
            .map(|re| re.as_str().to_string())
            .unwrap_or_else(|| record.uri.clone());

        let key = (record.method.clone(), uri);
        let idx = match self.hints.get(&key) {
            Some(idx) => *idx,
            None => {
                if self.stats.len() >= self.options.limit {
                    return Err(StatsError::TooManyUris(self.options.limit));
                }
                let idx = self.stats.len();
                self.stats
                    .push(HttpStat::new(key.1.clone(), key.0.clone(), &self.options));
                self.hints.insert(key, idx);
                idx
            }
        };

        self.stats[idx].set(record);
        Ok(())
    }

    /// Number of distinct groups
    pub fn count_uris(&self) -> usize {
        self.stats.len()
    }

    /// Number of records rejected by the filter
    pub fn filtered_count(&self) -> u64 {
        self.filtered
    }

    pub fn options(&self) -> &StatsOptions {
        &self.options
    }

    pub fn stats(&self) -> &[HttpStat] {
        &self.stats
    }

    pub fn into_stats(self) -> Vec<HttpStat> {
        self.stats
    }

    /// Reorder the groups. Lookup hints are rebuilt for the new order.
    pub fn sort(&mut self, options: &SortOptions) {
        sort_stats(&mut self.stats, options);
        self.hints = self
            .stats
            .iter()
            .enumerate()
            .map(|(idx, stat)| ((stat.method.clone(), stat.uri.clone()), idx))
            .collect();
    }
}
