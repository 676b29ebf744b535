//! Durable analysis status store
//!
//! The tracker is the only place analysis status lives. Every transition is
//! applied to a copy, written to disk (when a directory is configured), and
//! only then made visible to readers. Writers of one id are serialised by a
//! per-id mutex; no map guard is held across file IO. Writes block, so async
//! callers run them on the blocking pool.

use super::record::{AnalysisRecord, AnalysisStatus};
use crate::batch::BatchSummary;
use crate::store::StorageLocation;
use crate::{Error, Result};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Analysis records keyed by id, optionally persisted as one JSON file each.
#[derive(Debug, Default)]
pub struct AnalysisTracker {
    records: DashMap<String, AnalysisRecord>,
    writers: DashMap<String, Arc<Mutex<()>>>,
    dir: Option<PathBuf>,
}

impl AnalysisTracker {
    /// Tracker without persistence.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Tracker persisting under `dir`, reloading any records already there.
    ///
    /// Unreadable files are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created or listed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let records = DashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path) {
                Ok(record) => {
                    records.insert(record.id().to_string(), record);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable analysis record");
                }
            }
        }

        tracing::debug!(dir = %dir.display(), records = records.len(), "analysis tracker opened");
        Ok(Self {
            records,
            writers: DashMap::new(),
            dir: Some(dir),
        })
    }

    /// Register a new record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the id is already tracked, or an
    /// IO error if it cannot be persisted.
    pub fn insert(&self, record: AnalysisRecord) -> Result<()> {
        let writer = self.writer(record.id());
        let _guard = writer.lock().unwrap_or_else(PoisonError::into_inner);

        if self.records.contains_key(record.id()) {
            return Err(Error::InvalidInput(format!(
                "analysis {} already exists",
                record.id()
            )));
        }
        self.persist(&record)?;
        self.records.insert(record.id().to_string(), record);
        Ok(())
    }

    /// Snapshot of one record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AnalysisNotFound`] for an unknown id.
    pub fn get(&self, id: &str) -> Result<AnalysisRecord> {
        self.records
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::AnalysisNotFound(id.to_string()))
    }

    /// Status of one record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AnalysisNotFound`] for an unknown id.
    pub fn status(&self, id: &str) -> Result<AnalysisStatus> {
        self.records
            .get(id)
            .map(|r| r.status())
            .ok_or_else(|| Error::AnalysisNotFound(id.to_string()))
    }

    /// Records, optionally filtered by status, newest first.
    #[must_use]
    pub fn list(&self, status: Option<AnalysisStatus>) -> Vec<AnalysisRecord> {
        let mut records: Vec<AnalysisRecord> = self
            .records
            .iter()
            .filter(|r| status.map_or(true, |s| r.status() == s))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        records
    }

    /// Number of tracked analyses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Mark an analysis as running.
    ///
    /// # Errors
    ///
    /// Returns error on an unknown id or an invalid transition.
    pub fn start(&self, id: &str) -> Result<AnalysisRecord> {
        let record = self.update(id, AnalysisRecord::start)?;
        tracing::info!(analysis_id = id, "analysis running");
        Ok(record)
    }

    /// Mark an analysis as completed.
    ///
    /// # Errors
    ///
    /// Returns error on an unknown id or an invalid transition.
    pub fn complete(
        &self,
        id: &str,
        summary: &BatchSummary,
        location: &StorageLocation,
    ) -> Result<AnalysisRecord> {
        let record = self.update(id, |r| r.complete(summary, location))?;
        tracing::info!(
            analysis_id = id,
            records = summary.records_processed,
            location = %location,
            "analysis completed"
        );
        Ok(record)
    }

    /// Mark an analysis as failed.
    ///
    /// # Errors
    ///
    /// Returns error on an unknown id or an invalid transition.
    pub fn fail(&self, id: &str, message: &str) -> Result<AnalysisRecord> {
        let record = self.update(id, |r| r.fail(message))?;
        tracing::info!(analysis_id = id, error = message, "analysis failed");
        Ok(record)
    }

    /// Forget an analysis and delete its file. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be removed.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let writer = self.writer(id);
        let _guard = writer.lock().unwrap_or_else(PoisonError::into_inner);

        let removed = self.records.remove(id).is_some();
        if let Some(dir) = &self.dir {
            let path = record_path(dir, id)?;
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(removed)
    }

    fn update(
        &self,
        id: &str,
        apply: impl FnOnce(&mut AnalysisRecord) -> Result<()>,
    ) -> Result<AnalysisRecord> {
        let writer = self.writer(id);
        let _guard = writer.lock().unwrap_or_else(PoisonError::into_inner);

        let mut next = self.get(id)?;
        apply(&mut next)?;
        self.persist(&next)?;
        self.records.insert(id.to_string(), next.clone());
        Ok(next)
    }

    // Entries are never dropped, so every writer of an id shares one mutex.
    fn writer(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.writers.entry(id.to_string()).or_default().value())
    }

    fn persist(&self, record: &AnalysisRecord) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let path = record_path(dir, record.id())?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn record_path(dir: &Path, id: &str) -> Result<PathBuf> {
    if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
        return Err(Error::InvalidInput(format!("invalid analysis id {id}")));
    }
    Ok(dir.join(format!("{id}.json")))
}

fn read_record(path: &Path) -> Result<AnalysisRecord> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}
