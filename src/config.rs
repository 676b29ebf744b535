//! Engine configuration
//!
//! ```
//! use rubric_engine::config::EngineConfig;
//! use rubric_engine::rubric::AggregationMode;
//!
//! let config = EngineConfig::default()
//!     .with_key_column("gene_symbol")
//!     .with_secondary_key_column("transcript_id")
//!     .with_aggregation_mode(AggregationMode::Unweighted)
//!     .with_top_records(25);
//! assert!(config.validate().is_ok());
//! ```

use crate::rubric::AggregationMode;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default primary key column
pub const DEFAULT_KEY_COLUMN: &str = "gene_symbol";

/// Key column(s) identifying a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyColumns {
    /// Primary key column
    pub primary: String,
    /// Optional secondary key column
    #[serde(default)]
    pub secondary: Option<String>,
}

impl Default for KeyColumns {
    fn default() -> Self {
        Self {
            primary: DEFAULT_KEY_COLUMN.to_string(),
            secondary: None,
        }
    }
}

impl KeyColumns {
    /// Primary key only.
    #[must_use]
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            secondary: None,
        }
    }

    /// Add a secondary key.
    #[must_use]
    pub fn with_secondary(mut self, secondary: impl Into<String>) -> Self {
        self.secondary = Some(secondary.into());
        self
    }
}

/// Histogram bin-count bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramBins {
    /// Lower bound on the bin count
    pub min: usize,
    /// Upper bound on the bin count
    pub max: usize,
}

impl Default for HistogramBins {
    fn default() -> Self {
        Self { min: 10, max: 50 }
    }
}

/// Configuration for the scoring engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Key column(s) carried into results
    pub keys: KeyColumns,

    /// Rubric aggregation mode used when a request does not pick one
    pub aggregation_mode: AggregationMode,

    /// Keep per-rule score/weight/weighted-score columns for rubric members
    pub retain_rubric_members: bool,

    /// Histogram bin-count bounds
    pub histogram_bins: HistogramBins,

    /// Number of top records in summaries
    pub top_records: usize,

    /// Page size when a request does not give one
    pub default_page_limit: usize,

    /// Root directory for persisted results, analysis records and cache.
    /// `None` keeps everything in memory.
    pub storage_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            keys: KeyColumns::default(),
            aggregation_mode: AggregationMode::Weighted,
            retain_rubric_members: true,
            histogram_bins: HistogramBins::default(),
            top_records: 10,
            default_page_limit: 1000,
            storage_dir: None,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, is not valid JSON, or fails
    /// [`EngineConfig::validate`].
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] describing the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.keys.primary.trim().is_empty() {
            return Err(Error::InvalidInput("key column is empty".to_string()));
        }
        if self.histogram_bins.min == 0 || self.histogram_bins.min > self.histogram_bins.max {
            return Err(Error::InvalidInput(format!(
                "histogram bins must satisfy 0 < min <= max, got {}..{}",
                self.histogram_bins.min, self.histogram_bins.max
            )));
        }
        if self.default_page_limit == 0 {
            return Err(Error::InvalidInput(
                "default page limit must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the primary key column.
    #[must_use]
    pub fn with_key_column(mut self, column: impl Into<String>) -> Self {
        self.keys.primary = column.into();
        self
    }

    /// Set the secondary key column.
    #[must_use]
    pub fn with_secondary_key_column(mut self, column: impl Into<String>) -> Self {
        self.keys.secondary = Some(column.into());
        self
    }

    /// Set the default aggregation mode.
    #[must_use]
    pub const fn with_aggregation_mode(mut self, mode: AggregationMode) -> Self {
        self.aggregation_mode = mode;
        self
    }

    /// Keep or drop rubric member columns.
    #[must_use]
    pub const fn with_retain_rubric_members(mut self, retain: bool) -> Self {
        self.retain_rubric_members = retain;
        self
    }

    /// Set histogram bin bounds.
    #[must_use]
    pub const fn with_histogram_bins(mut self, min: usize, max: usize) -> Self {
        self.histogram_bins = HistogramBins { min, max };
        self
    }

    /// Set the summary top-record count.
    #[must_use]
    pub const fn with_top_records(mut self, n: usize) -> Self {
        self.top_records = n;
        self
    }

    /// Set the default page size.
    #[must_use]
    pub const fn with_default_page_limit(mut self, n: usize) -> Self {
        self.default_page_limit = n;
        self
    }

    /// Persist under `dir`.
    #[must_use]
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }

    /// Directory for result tables, if persistent.
    #[must_use]
    pub fn results_dir(&self) -> Option<PathBuf> {
        self.storage_dir.as_ref().map(|d| d.join("results"))
    }

    /// Directory for analysis records, if persistent.
    #[must_use]
    pub fn analyses_dir(&self) -> Option<PathBuf> {
        self.storage_dir.as_ref().map(|d| d.join("analyses"))
    }

    /// Directory for cache artifacts, if persistent.
    #[must_use]
    pub fn cache_dir(&self) -> Option<PathBuf> {
        self.storage_dir.as_ref().map(|d| d.join("cache"))
    }
}
