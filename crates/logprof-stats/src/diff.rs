//! Deltas between two aggregated snapshots

use crate::aggregator::{HttpStat, StatsOptions};
use crate::metric::MetricBlock;
use std::collections::{HashMap, HashSet};

/// Which snapshots a group appears in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Both,
    /// Only in the newer snapshot
    Added,
    /// Only in the older snapshot
    Removed,
}

/// `to - from` for each derived value of one metric block
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetricDelta {
    pub max: f64,
    pub min: f64,
    pub sum: f64,
    pub avg: f64,
    pub stddev: f64,
    /// (percentile, delta) in the requested order
    pub percentiles: Vec<(u8, f64)>,
}

impl MetricDelta {
    fn between(
        from: &MetricBlock,
        from_count: i64,
        to: &MetricBlock,
        to_count: i64,
        percentiles: &[u8],
    ) -> Self {
        Self {
            max: to.max - from.max,
            min: to.min - from.min,
            sum: to.sum - from.sum,
            avg: to.avg(to_count) - from.avg(from_count),
            stddev: to.stddev(to_count) - from.stddev(from_count),
            percentiles: percentiles
                .iter()
                .map(|p| (*p, to.percentile(to_count, *p) - from.percentile(from_count, *p)))
                .collect(),
        }
    }

    fn is_zero(&self) -> bool {
        [self.max, self.min, self.sum, self.avg, self.stddev]
            .into_iter()
            .chain(self.percentiles.iter().map(|(_, d)| *d))
            .all(|d| d == 0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffEntry {
    pub method: String,
    pub uri: String,
    pub presence: Presence,
    pub count: i64,
    pub status1xx: i64,
    pub status2xx: i64,
    pub status3xx: i64,
    pub status4xx: i64,
    pub status5xx: i64,
    pub response_time: MetricDelta,
    pub request_body_bytes: MetricDelta,
    pub response_body_bytes: MetricDelta,
}

impl DiffEntry {
    fn between(from: &HttpStat, to: &HttpStat, presence: Presence, percentiles: &[u8]) -> Self {
        Self {
            method: to.method.clone(),
            uri: to.uri.clone(),
            presence,
            count: to.count - from.count,
            status1xx: to.status1xx - from.status1xx,
            status2xx: to.status2xx - from.status2xx,
            status3xx: to.status3xx - from.status3xx,
            status4xx: to.status4xx - from.status4xx,
            status5xx: to.status5xx - from.status5xx,
            response_time: MetricDelta::between(
                &from.response_time,
                from.count,
                &to.response_time,
                to.count,
                percentiles,
            ),
            request_body_bytes: MetricDelta::between(
                &from.request_body_bytes,
                from.count,
                &to.request_body_bytes,
                to.count,
                percentiles,
            ),
            response_body_bytes: MetricDelta::between(
                &from.response_body_bytes,
                from.count,
                &to.response_body_bytes,
                to.count,
                percentiles,
            ),
        }
    }

    /// True when every delta is zero
    pub fn is_unchanged(&self) -> bool {
        self.count == 0
            && [
                self.status1xx,
                self.status2xx,
                self.status3xx,
                self.status4xx,
                self.status5xx,
            ]
            .iter()
            .all(|d| *d == 0)
            && self.response_time.is_zero()
            && self.request_body_bytes.is_zero()
            && self.response_body_bytes.is_zero()
    }
}

/// An empty group standing in for the missing side of a one-sided pair
fn zero_counterpart(stat: &HttpStat) -> HttpStat {
    let options = StatsOptions {
        response_time_percentile: false,
        request_body_percentile: false,
        response_body_percentile: false,
        ..Default::default()
    };
    HttpStat::new(stat.uri.clone(), stat.method.clone(), &options)
}

/// Pair groups by (method, uri) and compute `to - from`.
///
/// Entries follow the order of `to`; groups only present in `from` are
/// appended in their `from` order.
pub fn diff(from: &[HttpStat], to: &[HttpStat], percentiles: &[u8]) -> Vec<DiffEntry> {
    let from_index: HashMap<(&str, &str), &HttpStat> = from
        .iter()
        .map(|stat| ((stat.method.as_str(), stat.uri.as_str()), stat))
        .collect();

    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(to.len());

    for stat in to {
        let key = (stat.method.as_str(), stat.uri.as_str());
        seen.insert(key);
        let entry = match from_index.get(&key) {
            Some(old) => DiffEntry::between(old, stat, Presence::Both, percentiles),
            None => DiffEntry::between(&zero_counterpart(stat), stat, Presence::Added, percentiles),
        };
        entries.push(entry);
    }

    for stat in from {
        let key = (stat.method.as_str(), stat.uri.as_str());
        if seen.insert(key) {
            entries.push(DiffEntry::between(
                stat,
                &zero_counterpart(stat),
                Presence::Removed,
                percentiles,
            ));
        }
    }

    entries
}

/// Signed decimal with `precision` digits. Zero is always rendered `+`.
pub fn format_delta(delta: f64, precision: usize) -> String {
    let text = format!("{:+.*}", precision, delta);
    match text.strip_prefix('-') {
        Some(digits) if digits.bytes().all(|b| b == b'0' || b == b'.') => format!("+{digits}"),
        _ => text,
    }
}

/// Signed integer delta
pub fn format_count_delta(delta: i64) -> String {
    format!("{delta:+}")
}
