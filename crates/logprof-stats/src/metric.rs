//! Running statistics for one metric of one group

use serde::{Deserialize, Serialize};

/// Max/min/sum of a metric plus, when enabled, every observed value in
/// insertion order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricBlock {
    pub max: f64,
    pub min: f64,
    pub sum: f64,
    #[serde(rename = "usepercentile")]
    pub use_percentile: bool,
    #[serde(default)]
    pub percentiles: Vec<f64>,
}

/// Index of percentile `p` among `count` observations: `floor(count * p / 100) - 1`,
/// clamped at 0.
pub fn percent_rank(count: usize, p: u8) -> usize {
    (count * p as usize / 100).saturating_sub(1)
}

impl MetricBlock {
    pub fn new(use_percentile: bool) -> Self {
        Self {
            use_percentile,
            ..Default::default()
        }
    }

    /// Record one observation.
    ///
    /// `min` is replaced while it still holds its zero initial value, so a
    /// real observation of 0 cannot be told apart from "unset".
    pub fn set(&mut self, value: f64) {
        if self.max < value {
            self.max = value;
        }
        if self.min >= value || self.min == 0.0 {
            self.min = value;
        }
        self.sum += value;
        if self.use_percentile {
            self.percentiles.push(value);
        }
    }

    /// Mean over `count` observations
    pub fn avg(&self, count: i64) -> f64 {
        if count <= 0 {
            return 0.0;
        }
        self.sum / count as f64
    }

    /// Value at percentile `p` of the observations. 0 when samples are not kept.
    ///
    /// Samples are stored in insertion order; the rank is taken over a sorted
    /// copy.
    pub fn percentile(&self, count: i64, p: u8) -> f64 {
        if !self.use_percentile || self.percentiles.is_empty() {
            return 0.0;
        }
        let count = usize::try_from(count).unwrap_or(0);
        let idx = percent_rank(count, p).min(self.percentiles.len() - 1);

        let mut samples = self.percentiles.clone();
        let (_, value, _) = samples.select_nth_unstable_by(idx, f64::total_cmp);
        *value
    }

    /// Population standard deviation. 0 when samples are not kept.
    pub fn stddev(&self, count: i64) -> f64 {
        if !self.use_percentile || self.percentiles.is_empty() || count <= 0 {
            return 0.0;
        }
        // Shifted by the first sample so constant sequences come out exactly 0
        let shift = self.percentiles[0];
        let n = count as f64;
        let (sum, sum_sq) = self
            .percentiles
            .iter()
            .map(|v| v - shift)
            .fold((0.0, 0.0), |(s, sq), d| (s + d, sq + d * d));
        let variance = (sum_sq - sum * sum / n) / n;
        variance.max(0.0).sqrt()
    }
}
