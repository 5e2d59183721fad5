//! Ordering of aggregated groups

use crate::aggregator::HttpStat;
use crate::error::StatsError;
use crate::metric::MetricBlock;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Which metric block a sort key reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortTarget {
    ResponseTime,
    /// `-body` suffix
    ResponseBody,
    /// `-reqbody` suffix
    RequestBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMetric {
    Max,
    Min,
    Sum,
    Avg,
    Percentile(u8),
    Stddev,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    Count,
    Uri,
    Method,
    Metric {
        metric: SortMetric,
        target: SortTarget,
    },
}

impl FromStr for SortKey {
    type Err = StatsError;

    /// Unknown names fall back to [`SortKey::Count`]; only an out of range
    /// `pNN` is an error.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        match name.as_str() {
            "count" => return Ok(SortKey::Count),
            "uri" => return Ok(SortKey::Uri),
            "method" => return Ok(SortKey::Method),
            _ => {}
        }

        let (base, target) = if let Some(base) = name.strip_suffix("-reqbody") {
            (base, SortTarget::RequestBody)
        } else if let Some(base) = name.strip_suffix("-body") {
            (base, SortTarget::ResponseBody)
        } else {
            (name.as_str(), SortTarget::ResponseTime)
        };

        let metric = match base {
            "max" => SortMetric::Max,
            "min" => SortMetric::Min,
            "sum" => SortMetric::Sum,
            "avg" => SortMetric::Avg,
            "stddev" => SortMetric::Stddev,
            p if p.len() > 1 && p.starts_with('p') && p[1..].bytes().all(|b| b.is_ascii_digit()) => {
                match p[1..].parse::<u8>() {
                    Ok(n) if n <= 100 => SortMetric::Percentile(n),
                    _ => return Err(StatsError::InvalidPercentile(s.to_string())),
                }
            }
            _ => {
                warn!("Unknown sort key {:?}, sorting by count", s);
                return Ok(SortKey::Count);
            }
        };

        Ok(SortKey::Metric { metric, target })
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (metric, target) = match self {
            SortKey::Count => return f.write_str("count"),
            SortKey::Uri => return f.write_str("uri"),
            SortKey::Method => return f.write_str("method"),
            SortKey::Metric { metric, target } => (metric, target),
        };
        match metric {
            SortMetric::Max => f.write_str("max")?,
            SortMetric::Min => f.write_str("min")?,
            SortMetric::Sum => f.write_str("sum")?,
            SortMetric::Avg => f.write_str("avg")?,
            SortMetric::Percentile(n) => write!(f, "p{n}")?,
            SortMetric::Stddev => f.write_str("stddev")?,
        }
        match target {
            SortTarget::ResponseTime => Ok(()),
            SortTarget::ResponseBody => f.write_str("-body"),
            SortTarget::RequestBody => f.write_str("-reqbody"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SortOptions {
    pub key: SortKey,
    pub reverse: bool,
}

impl HttpStat {
    pub fn block(&self, target: SortTarget) -> &MetricBlock {
        match target {
            SortTarget::ResponseTime => &self.response_time,
            SortTarget::ResponseBody => &self.response_body_bytes,
            SortTarget::RequestBody => &self.request_body_bytes,
        }
    }

    /// Value of one derived metric of this group
    pub fn metric(&self, metric: SortMetric, target: SortTarget) -> f64 {
        let block = self.block(target);
        match metric {
            SortMetric::Max => block.max,
            SortMetric::Min => block.min,
            SortMetric::Sum => block.sum,
            SortMetric::Avg => block.avg(self.count),
            SortMetric::Percentile(p) => block.percentile(self.count, p),
            SortMetric::Stddev => block.stddev(self.count),
        }
    }
}

fn directed(ordering: Ordering, reverse: bool) -> Ordering {
    if reverse {
        ordering.reverse()
    } else {
        ordering
    }
}

/// Stable sort of groups by the selected key
pub fn sort_stats(stats: &mut Vec<HttpStat>, options: &SortOptions) {
    let reverse = options.reverse;
    match options.key {
        SortKey::Count => stats.sort_by(|a, b| directed(a.count.cmp(&b.count), reverse)),
        SortKey::Uri => stats.sort_by(|a, b| directed(a.uri.cmp(&b.uri), reverse)),
        SortKey::Method => stats.sort_by(|a, b| directed(a.method.cmp(&b.method), reverse)),
        SortKey::Metric { metric, target } => {
            // Percentiles and stddev are costly, compute each once
            let mut keyed: Vec<(f64, HttpStat)> = stats
                .drain(..)
                .map(|stat| (stat.metric(metric, target), stat))
                .collect();
            keyed.sort_by(|a, b| directed(a.0.total_cmp(&b.0), reverse));
            stats.extend(keyed.into_iter().map(|(_, stat)| stat));
        }
    }
}
