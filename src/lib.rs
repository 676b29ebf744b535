//! # Rubric Engine: rule and rubric scoring for genomic datasets
//!
//! Scores tabular records (one row per gene) against user-authored rules,
//! ordered `predicate ~ score` clauses where the first match wins, and
//! rubrics, weighted bundles of rules. Batch runs produce a ranked wide
//! table that is persisted to Parquet and summarised into a rebuildable
//! cache of statistics and histograms.
//!
//! ## Pipeline
//!
//! ```text
//! Dataset + Rules/Rubrics → BatchScorer → WideResultTable → ResultStore → ResultCache
//! ```
//!
//! ## Example
//!
//! ```rust
//! use rubric_engine::rule::Rule;
//! use rubric_engine::value::Value;
//! use std::collections::HashMap;
//!
//! # fn main() -> rubric_engine::Result<()> {
//! let rule = Rule::builder("expr", "EXPRESSION")
//!     .condition("x > 0.5 ~ 6")
//!     .condition("x > 0.1 ~ 2")
//!     .condition("TRUE ~ 0")
//!     .map("x", "expression.tpm_ratio")
//!     .build()?;
//!
//! let record = HashMap::from([("tpm_ratio".to_string(), Value::from(0.7))]);
//! assert_eq!(rule.score(&record), Some(6.0));
//!
//! let missing = HashMap::from([("tpm_ratio".to_string(), Value::Null)]);
//! assert_eq!(rule.score(&missing), Some(0.0));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod analysis;
pub mod batch;
pub mod cache;
pub mod config;
pub mod dataset;
pub mod error;
pub mod expr;
pub mod kv;
pub mod rubric;
pub mod rule;
pub mod stats;
pub mod store;
pub mod topk;
pub mod value;

pub use error::{Error, Result};

use analysis::{
    AnalysisHandle, AnalysisRecord, AnalysisRequest, AnalysisRunner, AnalysisStatus,
    AnalysisTracker, DatasetSource,
};
use batch::{BatchOptions, BatchOutput, BatchScorer, ColumnRole, ScoredRecord};
use cache::{CacheArtifact, ResultCache};
use config::EngineConfig;
use dataset::{Dataset, Record};
use kv::CacheBackend;
use rubric::{AggregationMode, Rubric};
use rule::Rule;
use serde::{Deserialize, Serialize};
use stats::ScoreStatistics;
use store::{ColumnStatistics, PageRequest, ResultPage, ResultStore};
use std::path::PathBuf;
use std::sync::Arc;
use topk::{top_k_indices, SortOrder};

/// Summary of a completed analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    /// Analysis identifier
    pub analysis_id: String,
    /// Rows in the result
    pub total_records: usize,
    /// Rules evaluated per record
    pub total_rules: usize,
    /// Statistics of the grand total
    pub score_statistics: ScoreStatistics,
    /// Best records by total score
    pub top_records: Vec<ScoredRecord>,
    /// Statistics per score column
    pub rule_statistics: Vec<ColumnStatistics>,
}

/// Scoring engine: ad-hoc scoring, batch runs and analysis management
#[derive(Debug)]
pub struct ScoringEngine {
    config: EngineConfig,
    tracker: Arc<AnalysisTracker>,
    store: Arc<ResultStore>,
    cache: Arc<ResultCache>,
    runner: AnalysisRunner,
}

impl ScoringEngine {
    /// Create a new engine builder
    #[must_use]
    pub fn builder() -> ScoringEngineBuilder {
        ScoringEngineBuilder::default()
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Score one record with one rule; `None` is the null sentinel.
    #[must_use]
    pub fn score_rule<R: Record + ?Sized>(&self, rule: &Rule, record: &R) -> Option<f64> {
        rule.score(record)
    }

    /// Score one record with one rubric.
    #[must_use]
    pub fn score_rubric<R: Record + ?Sized>(
        &self,
        rubric: &Rubric,
        record: &R,
        mode: AggregationMode,
    ) -> f64 {
        rubric.score(record, mode)
    }

    /// Score a dataset synchronously with the configured options.
    ///
    /// # Errors
    ///
    /// See [`BatchScorer::run`].
    pub fn run_batch(
        &self,
        dataset: &Dataset,
        rules: &[Arc<Rule>],
        rubrics: &[Arc<Rubric>],
    ) -> Result<BatchOutput> {
        BatchScorer::new(BatchOptions::from(&self.config)).run(dataset, rules, rubrics)
    }

    /// New job request carrying the configured options.
    #[must_use]
    pub fn request(&self, name: impl Into<String>, dataset: DatasetSource) -> AnalysisRequest {
        AnalysisRequest::new(name, dataset).with_options(BatchOptions::from(&self.config))
    }

    /// Start an analysis in the background.
    ///
    /// # Errors
    ///
    /// See [`AnalysisRunner::submit`].
    pub fn submit(&self, request: AnalysisRequest) -> Result<AnalysisHandle> {
        self.runner.submit(request)
    }

    /// Current record of an analysis.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AnalysisNotFound`] for an unknown id.
    pub fn status(&self, analysis_id: &str) -> Result<AnalysisRecord> {
        self.tracker.get(analysis_id)
    }

    /// Analyses, optionally filtered by status, newest first.
    #[must_use]
    pub fn list_analyses(&self, status: Option<AnalysisStatus>) -> Vec<AnalysisRecord> {
        self.tracker.list(status)
    }

    /// Page of ranked results.
    ///
    /// # Errors
    ///
    /// Returns error if the analysis has not completed or is unknown.
    pub fn get_results(&self, analysis_id: &str, request: &PageRequest) -> Result<ResultPage> {
        self.ensure_completed(analysis_id)?;
        self.store.page(analysis_id, request)
    }

    /// Rows with the given key values.
    ///
    /// # Errors
    ///
    /// Returns error if the analysis has not completed or is unknown.
    pub fn lookup<S: AsRef<str>>(&self, analysis_id: &str, keys: &[S]) -> Result<Vec<ScoredRecord>> {
        self.ensure_completed(analysis_id)?;
        self.store.lookup(analysis_id, keys)
    }

    /// Statistics, top records and per-column statistics of an analysis.
    ///
    /// # Errors
    ///
    /// Returns error if the analysis has not completed or is unknown.
    pub fn get_summary(&self, analysis_id: &str) -> Result<AnalysisSummary> {
        self.ensure_completed(analysis_id)?;
        let table = self.store.get(analysis_id)?;
        let stats = self.store.statistics(analysis_id)?;

        let top_records = if self.config.top_records == 0 {
            Vec::new()
        } else {
            top_k_indices(
                table.rows().iter().map(|r| r.total_score).enumerate(),
                self.config.top_records,
                SortOrder::Descending,
            )?
            .into_iter()
            .map(|i| table.rows()[i].clone())
            .collect()
        };

        let total_rules = match self.tracker.get(analysis_id) {
            Ok(record) => record.rules_executed(),
            Err(_) => table
                .columns()
                .iter()
                .filter(|c| !matches!(c.role, ColumnRole::Rubric { .. }))
                .count(),
        };

        Ok(AnalysisSummary {
            analysis_id: analysis_id.to_string(),
            total_records: table.len(),
            total_rules,
            score_statistics: stats.total_score,
            top_records,
            rule_statistics: stats.columns,
        })
    }

    /// Cached artifact of an analysis, built on first request.
    ///
    /// # Errors
    ///
    /// Returns error if the analysis has not completed or the cache cannot
    /// be built.
    pub async fn get_or_build_cache(&self, analysis_id: &str) -> Result<CacheArtifact> {
        self.ensure_completed(analysis_id)?;
        self.cache.get_or_build(analysis_id, &self.store).await
    }

    /// Remove an analysis with its results and cache. Returns whether
    /// anything existed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a running analysis, or a storage
    /// error.
    pub async fn delete_analysis(&self, analysis_id: &str) -> Result<bool> {
        if let Ok(record) = self.tracker.get(analysis_id) {
            if record.status() == AnalysisStatus::Running {
                return Err(Error::InvalidInput(format!(
                    "analysis {analysis_id} is still running"
                )));
            }
        }
        self.cache.delete(analysis_id).await?;
        let stored = self.store.delete(analysis_id)?;
        let tracked = self.tracker.remove(analysis_id)?;
        tracing::info!(analysis_id, "analysis deleted");
        Ok(stored || tracked)
    }

    // Results written by another process may exist without a tracker record.
    fn ensure_completed(&self, analysis_id: &str) -> Result<()> {
        match self.tracker.get(analysis_id) {
            Ok(record) if record.status() != AnalysisStatus::Completed => {
                Err(Error::InvalidInput(format!(
                    "analysis {analysis_id} is {}",
                    record.status()
                )))
            }
            Ok(_) => Ok(()),
            Err(_) if self.store.contains(analysis_id) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Engine builder
#[derive(Debug, Default)]
pub struct ScoringEngineBuilder {
    config: EngineConfig,
}

impl ScoringEngineBuilder {
    /// Replace the whole configuration
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist results, analysis records and cache under `dir`
    #[must_use]
    pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.storage_dir = Some(dir.into());
        self
    }

    /// Set the default rubric aggregation mode
    #[must_use]
    pub const fn aggregation_mode(mut self, mode: AggregationMode) -> Self {
        self.config.aggregation_mode = mode;
        self
    }

    /// Build the engine
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or a storage directory
    /// cannot be opened.
    pub fn build(self) -> Result<ScoringEngine> {
        let config = self.config;
        config.validate()?;

        let store = match config.results_dir() {
            Some(dir) => ResultStore::persistent(dir)?,
            None => ResultStore::in_memory(),
        }
        .with_default_limit(config.default_page_limit);
        let tracker = match config.analyses_dir() {
            Some(dir) => AnalysisTracker::open(dir)?,
            None => AnalysisTracker::in_memory(),
        };
        let cache = ResultCache::new(CacheBackend::from_config(&config)?, config.histogram_bins);

        let tracker = Arc::new(tracker);
        let store = Arc::new(store);
        let cache = Arc::new(cache);
        let runner = AnalysisRunner::new(
            Arc::clone(&tracker),
            Arc::clone(&store),
            Arc::clone(&cache),
        );

        tracing::debug!(
            persistent = config.storage_dir.is_some(),
            analyses = tracker.len(),
            "scoring engine ready"
        );
        Ok(ScoringEngine {
            config,
            tracker,
            store,
            cache,
            runner,
        })
    }
}
