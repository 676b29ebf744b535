//! Derived result cache
//!
//! A disposable, rebuildable read model of one analysis: a minimal-column
//! snapshot, per-column statistics, per-column histograms and metadata,
//! stored as four JSON entries in a [`KvStore`]:
//!
//! | key | content |
//! |-----|---------|
//! | `res_<id>` | [`CacheSnapshot`] |
//! | `stats_<id>` | column label → [`ScoreStatistics`] |
//! | `histograms_<id>` | column label → [`Histogram`] |
//! | `meta_<id>` | [`CacheMetadata`] |
//!
//! Metadata is written last, so a partially written set is treated as absent.

use crate::batch::{WideResultTable, TOTAL_SCORE_COLUMN};
use crate::config::{HistogramBins, KeyColumns};
use crate::kv::{CacheBackend, KvStore};
use crate::stats::{Histogram, ScoreStatistics};
use crate::store::ResultStore;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const SNAPSHOT_PREFIX: &str = "res_";
const STATS_PREFIX: &str = "stats_";
const HISTOGRAMS_PREFIX: &str = "histograms_";
const META_PREFIX: &str = "meta_";

/// One snapshot row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    /// Primary key value
    pub key: Option<String>,
    /// Secondary key value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_2: Option<String>,
    /// Scores aligned with [`CacheSnapshot::columns`]
    pub scores: Vec<Option<f64>>,
    /// Grand total
    pub total_score: f64,
}

/// Minimal-column copy of the ranked result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Key column names
    pub keys: KeyColumns,
    /// Labels of the primary score columns
    pub columns: Vec<String>,
    /// Rows in ranked order
    pub rows: Vec<SnapshotRow>,
}

impl CacheSnapshot {
    fn from_table(table: &WideResultTable) -> Self {
        let primary: Vec<_> = table.columns().iter().filter(|c| c.is_primary()).collect();
        Self {
            keys: table.keys().clone(),
            columns: primary.iter().map(|c| c.label.clone()).collect(),
            rows: table
                .rows()
                .iter()
                .map(|r| SnapshotRow {
                    key: r.key.clone(),
                    key_2: r.key_2.clone(),
                    scores: primary.iter().map(|c| r.score(&c.key)).collect(),
                    total_score: r.total_score,
                })
                .collect(),
        }
    }
}

/// Inventory of a cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// Analysis identifier
    pub analysis_id: String,
    /// Rows in the snapshot
    pub row_count: usize,
    /// Score columns with statistics
    pub column_count: usize,
    /// Encoded size of all four entries in bytes
    pub size_bytes: usize,
    /// Labels of the score columns with statistics
    pub columns: Vec<String>,
    /// When the entry was built
    pub created_at: DateTime<Utc>,
}

/// Full cache entry of one analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheArtifact {
    /// Minimal-column snapshot
    pub snapshot: CacheSnapshot,
    /// Column label → statistics
    pub statistics: BTreeMap<String, ScoreStatistics>,
    /// Column label → histogram
    pub histograms: BTreeMap<String, Histogram>,
    /// Inventory
    pub metadata: CacheMetadata,
}

/// Builds and serves [`CacheArtifact`]s.
///
/// Builds of the same analysis are serialised; different analyses build
/// concurrently.
#[derive(Debug, Default)]
pub struct ResultCache {
    backend: CacheBackend,
    bins: HistogramBins,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ResultCache {
    /// Create a cache over `backend`.
    #[must_use]
    pub fn new(backend: CacheBackend, bins: HistogramBins) -> Self {
        Self {
            backend,
            bins,
            locks: DashMap::new(),
        }
    }

    /// Underlying store.
    #[must_use]
    pub const fn backend(&self) -> &CacheBackend {
        &self.backend
    }

    /// Compute and write the artifact for `table`, replacing any earlier one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheError`] if encoding or writing fails.
    pub async fn build(&self, analysis_id: &str, table: &WideResultTable) -> Result<CacheArtifact> {
        let lock = self.lock_for(analysis_id);
        let _guard = lock.lock().await;
        self.write(analysis_id, table).await
    }

    /// Read a complete artifact, or `None` if any part is missing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheError`] if a stored entry cannot be decoded.
    pub async fn load(&self, analysis_id: &str) -> Result<Option<CacheArtifact>> {
        let keys = entry_keys(analysis_id);
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let values = self.backend.batch_get(&refs).await?;

        let [Some(snapshot), Some(statistics), Some(histograms), Some(metadata)] =
            <[Option<Vec<u8>>; 4]>::try_from(values)
                .map_err(|_| Error::CacheError("unexpected cache batch size".to_string()))?
        else {
            return Ok(None);
        };

        Ok(Some(CacheArtifact {
            snapshot: decode(&snapshot)?,
            statistics: decode(&statistics)?,
            histograms: decode(&histograms)?,
            metadata: decode(&metadata)?,
        }))
    }

    /// Cached artifact, rebuilding it from the result store when absent or
    /// incomplete.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AnalysisNotFound`] if the store has no table either,
    /// or a cache error if rebuilding fails.
    pub async fn get_or_build(
        &self,
        analysis_id: &str,
        store: &Arc<ResultStore>,
    ) -> Result<CacheArtifact> {
        let lock = self.lock_for(analysis_id);
        let _guard = lock.lock().await;

        match self.load(analysis_id).await {
            Ok(Some(artifact)) => return Ok(artifact),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(analysis_id, error = %e, "discarding unreadable cache entry");
            }
        }

        tracing::debug!(analysis_id, "cache miss, rebuilding from result store");
        let table = {
            let store = Arc::clone(store);
            let id = analysis_id.to_string();
            tokio::task::spawn_blocking(move || store.get(&id))
                .await
                .map_err(|e| Error::Other(format!("result load task failed: {e}")))??
        };
        self.write(analysis_id, &table).await
    }

    /// Remove all entries of an analysis.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    pub async fn delete(&self, analysis_id: &str) -> Result<()> {
        let lock = self.lock_for(analysis_id);
        let guard = lock.lock().await;
        // metadata first, so readers never see a complete-looking partial set
        for key in entry_keys(analysis_id).iter().rev() {
            self.backend.delete(key).await?;
        }
        drop(guard);
        Ok(())
    }

    /// Metadata of every cached analysis, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails. Undecodable entries are skipped.
    pub async fn list(&self) -> Result<Vec<CacheMetadata>> {
        let mut out = Vec::new();
        for key in self.backend.keys(META_PREFIX).await? {
            let Some(bytes) = self.backend.get(&key).await? else {
                continue;
            };
            match decode::<CacheMetadata>(&bytes) {
                Ok(meta) => out.push(meta),
                Err(e) => tracing::warn!(key = %key, error = %e, "skipping unreadable cache metadata"),
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    // Entries survive delete, so every caller for an id shares one mutex.
    fn lock_for(&self, analysis_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(analysis_id.to_string())
                .or_default()
                .value(),
        )
    }

    async fn write(&self, analysis_id: &str, table: &WideResultTable) -> Result<CacheArtifact> {
        let snapshot = CacheSnapshot::from_table(table);

        let mut statistics = BTreeMap::new();
        let mut histograms = BTreeMap::new();
        for column in table.columns() {
            let values = table.column_values(&column.key);
            histograms.insert(
                column.label.clone(),
                Histogram::compute(values.iter().copied(), self.bins),
            );
            statistics.insert(column.label.clone(), ScoreStatistics::compute(values));
        }
        let totals: Vec<Option<f64>> = table.totals().into_iter().map(Some).collect();
        histograms.insert(
            TOTAL_SCORE_COLUMN.to_string(),
            Histogram::compute(totals.iter().copied(), self.bins),
        );
        statistics.insert(TOTAL_SCORE_COLUMN.to_string(), ScoreStatistics::compute(totals));

        let snapshot_bytes = encode(&snapshot)?;
        let stats_bytes = encode(&statistics)?;
        let hist_bytes = encode(&histograms)?;

        let mut metadata = CacheMetadata {
            analysis_id: analysis_id.to_string(),
            row_count: snapshot.rows.len(),
            column_count: statistics.len(),
            size_bytes: snapshot_bytes.len() + stats_bytes.len() + hist_bytes.len(),
            columns: statistics.keys().cloned().collect(),
            created_at: Utc::now(),
        };
        let meta_bytes = encode(&metadata)?;
        metadata.size_bytes += meta_bytes.len();
        let meta_bytes = encode(&metadata)?;

        let [res_key, stats_key, hist_key, meta_key] = entry_keys(analysis_id);
        self.backend
            .batch_set(vec![
                (res_key.as_str(), snapshot_bytes),
                (stats_key.as_str(), stats_bytes),
                (hist_key.as_str(), hist_bytes),
                (meta_key.as_str(), meta_bytes),
            ])
            .await
            .map_err(|e| Error::CacheError(format!("failed to write cache for {analysis_id}: {e}")))?;

        tracing::debug!(
            analysis_id,
            rows = metadata.row_count,
            columns = metadata.column_count,
            bytes = metadata.size_bytes,
            "cache built"
        );
        Ok(CacheArtifact {
            snapshot,
            statistics,
            histograms,
            metadata,
        })
    }
}

fn entry_keys(analysis_id: &str) -> [String; 4] {
    [
        format!("{SNAPSHOT_PREFIX}{analysis_id}"),
        format!("{STATS_PREFIX}{analysis_id}"),
        format!("{HISTOGRAMS_PREFIX}{analysis_id}"),
        format!("{META_PREFIX}{analysis_id}"),
    ]
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::CacheError(format!("encode failed: {e}")))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::CacheError(format!("decode failed: {e}")))
}
