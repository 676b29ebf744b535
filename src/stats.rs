//! Score statistics and histograms
//!
//! Only finite values count as valid. Null, NaN and infinite scores are
//! excluded from every numeric aggregate and from histogram bins.

use crate::config::HistogramBins;
use serde::{Deserialize, Serialize};

/// Summary statistics over one score column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreStatistics {
    /// Number of valid values
    pub count: usize,
    /// Number of values including invalid ones
    pub total_count: usize,
    /// `count / total_count × 100`, two decimals
    pub valid_percentage: f64,
    /// Minimum valid value
    pub min: Option<f64>,
    /// Maximum valid value
    pub max: Option<f64>,
    /// Mean of valid values
    pub mean: Option<f64>,
    /// Median of valid values
    pub median: Option<f64>,
    /// Sample standard deviation (n - 1); 0 for a single value
    pub std: Option<f64>,
    /// Number of invalid values
    pub null_count: usize,
    /// `null_count / total_count × 100`, two decimals
    pub null_percentage: f64,
}

impl ScoreStatistics {
    /// Compute statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compute<I: IntoIterator<Item = Option<f64>>>(values: I) -> Self {
        let mut total_count = 0;
        let mut valid: Vec<f64> = Vec::new();
        for v in values {
            total_count += 1;
            if let Some(v) = v.filter(|v| v.is_finite()) {
                valid.push(v);
            }
        }

        let count = valid.len();
        let null_count = total_count - count;
        let pct = |n: usize| {
            if total_count == 0 {
                0.0
            } else {
                round2(n as f64 / total_count as f64 * 100.0)
            }
        };
        let valid_percentage = pct(count);
        let null_percentage = if total_count == 0 { 100.0 } else { pct(null_count) };

        if count == 0 {
            return Self {
                count,
                total_count,
                valid_percentage,
                min: None,
                max: None,
                mean: None,
                median: None,
                std: None,
                null_count,
                null_percentage,
            };
        }

        valid.sort_by(f64::total_cmp);
        let n = count as f64;
        let mean = valid.iter().sum::<f64>() / n;
        let median = if count % 2 == 1 {
            valid[count / 2]
        } else {
            (valid[count / 2 - 1] + valid[count / 2]) / 2.0
        };
        let std = if count > 1 {
            (valid.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
        } else {
            0.0
        };

        Self {
            count,
            total_count,
            valid_percentage,
            min: valid.first().copied(),
            max: valid.last().copied(),
            mean: Some(mean),
            median: Some(median),
            std: Some(std),
            null_count,
            null_percentage,
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Equal-width histogram over one score column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    /// Left edge of each bin
    pub bins: Vec<f64>,
    /// Values per bin
    pub counts: Vec<usize>,
    /// All bin edges (`bins.len() + 1` entries)
    pub bin_edges: Vec<f64>,
    /// Number of valid values binned
    pub valid_count: usize,
    /// Number of values including invalid ones
    pub total_count: usize,
    /// Width of each bin
    pub bin_width: f64,
}

impl Histogram {
    /// Build a histogram; the bin count is `ceil(log2(n)) + 1` clamped to `bounds`.
    ///
    /// Bins are half-open except the last, which includes the maximum.
    /// A constant column is binned over `[v - 0.5, v + 0.5]`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn compute<I: IntoIterator<Item = Option<f64>>>(values: I, bounds: HistogramBins) -> Self {
        let mut total_count = 0;
        let mut valid: Vec<f64> = Vec::new();
        for v in values {
            total_count += 1;
            if let Some(v) = v.filter(|v| v.is_finite()) {
                valid.push(v);
            }
        }

        if valid.is_empty() {
            return Self {
                bins: Vec::new(),
                counts: Vec::new(),
                bin_edges: Vec::new(),
                valid_count: 0,
                total_count,
                bin_width: 0.0,
            };
        }

        let n_bins = bin_count(valid.len(), bounds);
        let (mut lo, mut hi) = valid
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if lo == hi {
            lo -= 0.5;
            hi += 0.5;
        }

        let bins = n_bins as f64;
        let span = hi - lo;
        let (width, bin_edges, position): (f64, Vec<f64>, Box<dyn Fn(f64) -> f64>) =
            if span.is_finite() {
                let width = span / bins;
                let edges = (0..=n_bins)
                    .map(|i| if i == n_bins { hi } else { lo + width * i as f64 })
                    .collect();
                (width, edges, Box::new(move |v: f64| (v - lo) / span))
            } else {
                // The range exceeds f64::MAX; interpolate between the bounds instead.
                let half = hi / 2.0 - lo / 2.0;
                let width = (hi / bins - lo / bins).min(f64::MAX);
                let edges = (0..=n_bins)
                    .map(|i| {
                        let t = i as f64 / bins;
                        if i == n_bins { hi } else { lo * (1.0 - t) + hi * t }
                    })
                    .collect();
                (width, edges, Box::new(move |v: f64| (v / 2.0 - lo / 2.0) / half))
            };

        let mut counts = vec![0usize; n_bins];
        for &v in &valid {
            let idx = (position(v) * bins).floor() as usize;
            counts[idx.min(n_bins - 1)] += 1;
        }

        Self {
            bins: bin_edges[..n_bins].to_vec(),
            counts,
            bin_edges,
            valid_count: valid.len(),
            total_count,
            bin_width: width,
        }
    }
}

/// `clamp(ceil(log2(n)) + 1, min, max)`
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn bin_count(valid: usize, bounds: HistogramBins) -> usize {
    let raw = if valid <= 1 {
        1
    } else {
        (valid as f64).log2().ceil() as usize + 1
    };
    raw.clamp(bounds.min.max(1), bounds.max.max(bounds.min.max(1)))
}
