//! Analysis Record - durable execution record of one batch run

use crate::batch::BatchSummary;
use crate::config::KeyColumns;
use crate::rubric::AggregationMode;
use crate::store::StorageLocation;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of an analysis.
///
/// `Pending → Running → Completed | Failed`, and `Pending → Failed` when a
/// run is rejected before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    /// Created, not yet started.
    Pending,
    /// Scoring in progress.
    Running,
    /// Results stored.
    Completed,
    /// Run failed; see the error message.
    Failed,
}

impl AnalysisStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Analysis Record identifies what produced a result set and where it lives.
///
/// Status changes only through [`start`](Self::start),
/// [`complete`](Self::complete) and [`fail`](Self::fail).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisRecord {
    id: String,
    name: String,
    rubric_ids: Vec<String>,
    rule_ids: Vec<String>,
    dataset_id: Option<String>,
    keys: KeyColumns,
    mode: AggregationMode,
    status: AnalysisStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    records_processed: usize,
    rules_executed: usize,
    execution_seconds: Option<f64>,
    storage_location: Option<String>,
    error_message: Option<String>,
}

impl AnalysisRecord {
    /// Create a new record in Pending status.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rubric_ids: Vec::new(),
            rule_ids: Vec::new(),
            dataset_id: None,
            keys: KeyColumns::default(),
            mode: AggregationMode::default(),
            status: AnalysisStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            records_processed: 0,
            rules_executed: 0,
            execution_seconds: None,
            storage_location: None,
            error_message: None,
        }
    }

    /// Set the rubric ids.
    #[must_use]
    pub fn with_rubrics(mut self, ids: Vec<String>) -> Self {
        self.rubric_ids = ids;
        self
    }

    /// Set the standalone rule ids.
    #[must_use]
    pub fn with_rules(mut self, ids: Vec<String>) -> Self {
        self.rule_ids = ids;
        self
    }

    /// Set the dataset identifier.
    #[must_use]
    pub fn with_dataset(mut self, id: impl Into<String>) -> Self {
        self.dataset_id = Some(id.into());
        self
    }

    /// Set the key columns.
    #[must_use]
    pub fn with_keys(mut self, keys: KeyColumns) -> Self {
        self.keys = keys;
        self
    }

    /// Set the aggregation mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: AggregationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Get the analysis ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the analysis name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rubrics scored.
    #[must_use]
    pub fn rubric_ids(&self) -> &[String] {
        &self.rubric_ids
    }

    /// Standalone rules scored.
    #[must_use]
    pub fn rule_ids(&self) -> &[String] {
        &self.rule_ids
    }

    /// Dataset identifier, if known.
    #[must_use]
    pub fn dataset_id(&self) -> Option<&str> {
        self.dataset_id.as_deref()
    }

    /// Key columns.
    #[must_use]
    pub const fn keys(&self) -> &KeyColumns {
        &self.keys
    }

    /// Aggregation mode.
    #[must_use]
    pub const fn mode(&self) -> AggregationMode {
        self.mode
    }

    /// Get the current status.
    #[must_use]
    pub const fn status(&self) -> AnalysisStatus {
        self.status
    }

    /// Get the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Get the start timestamp, if started.
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Get the end timestamp, if terminal.
    #[must_use]
    pub const fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Records scored.
    #[must_use]
    pub const fn records_processed(&self) -> usize {
        self.records_processed
    }

    /// Rules evaluated per record.
    #[must_use]
    pub const fn rules_executed(&self) -> usize {
        self.rules_executed
    }

    /// Scoring time in seconds, once completed.
    #[must_use]
    pub const fn execution_seconds(&self) -> Option<f64> {
        self.execution_seconds
    }

    /// Where the wide table lives, once completed.
    #[must_use]
    pub fn storage_location(&self) -> Option<&str> {
        self.storage_location.as_deref()
    }

    /// Failure message, if failed.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Pending → Running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] from any other status.
    pub fn start(&mut self) -> Result<()> {
        self.transition(AnalysisStatus::Running, |s| s == AnalysisStatus::Pending)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Running → Completed, recording counts and the storage location.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] from any other status.
    pub fn complete(&mut self, summary: &BatchSummary, location: &StorageLocation) -> Result<()> {
        self.transition(AnalysisStatus::Completed, |s| s == AnalysisStatus::Running)?;
        self.ended_at = Some(Utc::now());
        self.records_processed = summary.records_processed;
        self.rules_executed = summary.rules_executed;
        self.execution_seconds = Some(summary.elapsed_seconds);
        self.storage_location = Some(location.to_string());
        Ok(())
    }

    /// Pending | Running → Failed. On an already failed record only the
    /// message is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] on a completed record.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        if self.status != AnalysisStatus::Failed {
            self.transition(AnalysisStatus::Failed, |s| !s.is_terminal())?;
            self.ended_at = Some(Utc::now());
        }
        self.error_message = Some(message.into());
        Ok(())
    }

    fn transition(
        &mut self,
        to: AnalysisStatus,
        allowed: impl Fn(AnalysisStatus) -> bool,
    ) -> Result<()> {
        if !allowed(self.status) {
            return Err(Error::InvalidTransition {
                analysis_id: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> BatchSummary {
        BatchSummary {
            records_processed: 3,
            rules_executed: 2,
            elapsed_seconds: 0.25,
        }
    }

    #[test]
    fn test_new_is_pending() {
        let record = AnalysisRecord::new("a-1", "panel run");
        assert_eq!(record.status(), AnalysisStatus::Pending);
        assert!(record.started_at().is_none());
        assert_eq!(record.keys().primary, "gene_symbol");
    }

    #[test]
    fn test_lifecycle_completed() {
        let mut record = AnalysisRecord::new("a-1", "run");
        record.start().unwrap();
        assert_eq!(record.status(), AnalysisStatus::Running);
        record
            .complete(&summary(), &StorageLocation::Memory("a-1".to_string()))
            .unwrap();
        assert_eq!(record.status(), AnalysisStatus::Completed);
        assert_eq!(record.records_processed(), 3);
        assert_eq!(record.storage_location(), Some("memory://a-1"));
        assert!(record.ended_at().is_some());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut record = AnalysisRecord::new("a-1", "run");
        let err = record
            .complete(&summary(), &StorageLocation::Memory("a-1".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("pending -> completed"));

        record.start().unwrap();
        assert!(record.start().is_err());
        record
            .complete(&summary(), &StorageLocation::Memory("a-1".to_string()))
            .unwrap();
        assert!(record.fail("late").is_err());
        assert_eq!(record.status(), AnalysisStatus::Completed);
    }

    #[test]
    fn test_fail_updates_message_only() {
        let mut record = AnalysisRecord::new("a-1", "run");
        record.fail("dataset unreadable").unwrap();
        let ended = record.ended_at();
        record.fail("dataset unreadable: permission denied").unwrap();
        assert_eq!(record.status(), AnalysisStatus::Failed);
        assert_eq!(
            record.error_message(),
            Some("dataset unreadable: permission denied")
        );
        assert_eq!(record.ended_at(), ended);
        assert!(record.start().is_err());
    }

    #[test]
    fn test_serde_roundtrip_status() {
        let json = serde_json::to_string(&AnalysisStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }
}
