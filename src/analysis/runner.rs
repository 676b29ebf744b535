//! Asynchronous analysis jobs
//!
//! `submit` registers a Pending record and returns at once; the job then
//! runs on the Tokio runtime. Dataset loading, scoring and Parquet writes
//! are blocking work and run on the blocking pool. Job state lives only in
//! the [`AnalysisTracker`] and in the [`RunContext`] handed to the task.

use super::record::AnalysisRecord;
use super::tracker::AnalysisTracker;
use crate::batch::{BatchOptions, BatchScorer, BatchSummary, WideResultTable};
use crate::cache::ResultCache;
use crate::dataset::Dataset;
use crate::rubric::Rubric;
use crate::rule::Rule;
use crate::store::{ResultStore, StorageLocation};
use crate::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

/// Where a job reads its records from
#[derive(Debug, Clone)]
pub enum DatasetSource {
    /// Parquet file, loaded when the job starts
    Parquet(PathBuf),
    /// Dataset already in memory
    InMemory {
        /// Identifier recorded on the analysis
        id: String,
        /// The records
        dataset: Arc<Dataset>,
    },
}

impl DatasetSource {
    /// Identifier recorded on the analysis.
    #[must_use]
    pub fn id(&self) -> String {
        match self {
            Self::Parquet(path) => path.display().to_string(),
            Self::InMemory { id, .. } => id.clone(),
        }
    }

    fn load(&self) -> Result<Arc<Dataset>> {
        match self {
            Self::Parquet(path) => Ok(Arc::new(Dataset::load_parquet(path)?)),
            Self::InMemory { dataset, .. } => Ok(Arc::clone(dataset)),
        }
    }
}

/// What to score
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    /// Display name
    pub name: String,
    /// Input records
    pub dataset: DatasetSource,
    /// Standalone rules
    pub rules: Vec<Arc<Rule>>,
    /// Rubrics
    pub rubrics: Vec<Arc<Rubric>>,
    /// Scoring options
    pub options: BatchOptions,
}

impl AnalysisRequest {
    /// Request with no rules or rubrics yet.
    #[must_use]
    pub fn new(name: impl Into<String>, dataset: DatasetSource) -> Self {
        Self {
            name: name.into(),
            dataset,
            rules: Vec::new(),
            rubrics: Vec::new(),
            options: BatchOptions::default(),
        }
    }

    /// Add a standalone rule.
    #[must_use]
    pub fn with_rule(mut self, rule: Arc<Rule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Add a rubric.
    #[must_use]
    pub fn with_rubric(mut self, rubric: Arc<Rubric>) -> Self {
        self.rubrics.push(rubric);
        self
    }

    /// Replace the scoring options.
    #[must_use]
    pub fn with_options(mut self, options: BatchOptions) -> Self {
        self.options = options;
        self
    }
}

/// Per-run state carried by one job
#[derive(Debug, Clone)]
pub struct RunContext {
    analysis_id: String,
    tracker: Arc<AnalysisTracker>,
    store: Arc<ResultStore>,
    cache: Arc<ResultCache>,
}

impl RunContext {
    /// Analysis this job runs.
    #[must_use]
    pub fn analysis_id(&self) -> &str {
        &self.analysis_id
    }
}

/// Handle to a submitted job
#[derive(Debug)]
pub struct AnalysisHandle {
    id: String,
    task: JoinHandle<Result<AnalysisRecord>>,
}

impl AnalysisHandle {
    /// Analysis identifier, usable for polling.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the terminal record.
    ///
    /// # Errors
    ///
    /// Returns error if the job task panicked or the tracker could not record
    /// the outcome. A failed analysis is not an error here; check its status.
    pub async fn wait(self) -> Result<AnalysisRecord> {
        self.task
            .await
            .map_err(|e| Error::Other(format!("analysis task failed: {e}")))?
    }
}

/// Submits and executes analysis jobs.
#[derive(Debug, Clone)]
pub struct AnalysisRunner {
    tracker: Arc<AnalysisTracker>,
    store: Arc<ResultStore>,
    cache: Arc<ResultCache>,
}

impl AnalysisRunner {
    /// Create a runner over shared stores.
    #[must_use]
    pub const fn new(
        tracker: Arc<AnalysisTracker>,
        store: Arc<ResultStore>,
        cache: Arc<ResultCache>,
    ) -> Self {
        Self {
            tracker,
            store,
            cache,
        }
    }

    /// Register a Pending analysis and start it in the background.
    ///
    /// # Errors
    ///
    /// Returns error if called outside a Tokio runtime or the record cannot
    /// be persisted.
    pub fn submit(&self, request: AnalysisRequest) -> Result<AnalysisHandle> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Other(format!("analysis jobs need a Tokio runtime: {e}")))?;

        let id = Uuid::new_v4().to_string();
        let record = AnalysisRecord::new(&id, &request.name)
            .with_rules(request.rules.iter().map(|r| r.id().to_string()).collect())
            .with_rubrics(request.rubrics.iter().map(|r| r.id().to_string()).collect())
            .with_dataset(request.dataset.id())
            .with_keys(request.options.keys.clone())
            .with_mode(request.options.mode);
        self.tracker.insert(record)?;
        tracing::info!(analysis_id = %id, name = %request.name, "analysis submitted");

        let ctx = RunContext {
            analysis_id: id.clone(),
            tracker: Arc::clone(&self.tracker),
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
        };
        let span = tracing::info_span!("analysis", analysis_id = %id);
        let task = runtime.spawn(execute(ctx, request).instrument(span));
        Ok(AnalysisHandle { id, task })
    }
}

async fn execute(ctx: RunContext, request: AnalysisRequest) -> Result<AnalysisRecord> {
    match run_job(&ctx, request).await {
        Ok((record, table)) => {
            if let Err(e) = ctx.cache.build(&ctx.analysis_id, &table).await {
                tracing::warn!(error = %e, "cache build failed; results remain available");
            }
            Ok(record)
        }
        Err(e) => {
            tracing::warn!(error = %e, "analysis failed");
            let message = e.to_string();
            let tracker = Arc::clone(&ctx.tracker);
            let id = ctx.analysis_id.clone();
            blocking(move || tracker.fail(&id, &message)).await
        }
    }
}

async fn run_job(
    ctx: &RunContext,
    request: AnalysisRequest,
) -> Result<(AnalysisRecord, Arc<WideResultTable>)> {
    let tracker = Arc::clone(&ctx.tracker);
    let id = ctx.analysis_id.clone();
    blocking(move || tracker.start(&id)).await?;

    let store = Arc::clone(&ctx.store);
    let id = ctx.analysis_id.clone();
    let (summary, location, table) = blocking(move || {
        let dataset = request.dataset.load()?;
        let output = BatchScorer::new(request.options).run(&dataset, &request.rules, &request.rubrics)?;
        let summary = output.summary;
        let location = store.put(&id, output.table)?;
        let table = store.get(&id)?;
        Ok((summary, location, table))
    })
    .await?;

    let ctx = ctx.clone();
    let record = blocking(move || commit(&ctx, &summary, &location)).await?;
    Ok((record, table))
}

// A table is only kept once its analysis is recorded as Completed.
fn commit(
    ctx: &RunContext,
    summary: &BatchSummary,
    location: &StorageLocation,
) -> Result<AnalysisRecord> {
    ctx.tracker
        .complete(&ctx.analysis_id, summary, location)
        .map_err(|e| {
            if let Err(cleanup) = ctx.store.delete(&ctx.analysis_id) {
                tracing::warn!(error = %cleanup, "could not discard uncommitted result table");
            }
            e
        })
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Other(format!("blocking task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisStatus;
    use arrow::array::{Float64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;

    fn runner() -> AnalysisRunner {
        AnalysisRunner::new(
            Arc::new(AnalysisTracker::in_memory()),
            Arc::new(ResultStore::in_memory()),
            Arc::new(ResultCache::default()),
        )
    }

    fn source() -> DatasetSource {
        let schema = Schema::new(vec![
            Field::new("gene_symbol", DataType::Utf8, false),
            Field::new("x", DataType::Float64, true),
        ]);
        let batch = RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(StringArray::from(vec!["A", "B"])),
                Arc::new(Float64Array::from(vec![Some(0.7), None])),
            ],
        )
        .unwrap();
        DatasetSource::InMemory {
            id: "ds-1".to_string(),
            dataset: Arc::new(Dataset::from_batch(batch).unwrap()),
        }
    }

    fn rule() -> Arc<Rule> {
        Arc::new(
            Rule::builder("r1", "R1")
                .condition("x > 0.5 ~ 6")
                .condition("TRUE ~ 0")
                .map("x", "x")
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_submit_completes_and_caches() {
        let runner = runner();
        let handle = runner
            .submit(AnalysisRequest::new("run", source()).with_rule(rule()))
            .unwrap();
        let id = handle.id().to_string();
        let record = handle.wait().await.unwrap();

        assert_eq!(record.status(), AnalysisStatus::Completed);
        assert_eq!(record.records_processed(), 2);
        assert_eq!(record.dataset_id(), Some("ds-1"));
        assert_eq!(record.storage_location(), Some(format!("memory://{id}").as_str()));
        assert!(runner.cache.load(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failure_recorded() {
        let runner = runner();
        let handle = runner
            .submit(AnalysisRequest::new("empty", source()))
            .unwrap();
        let id = handle.id().to_string();
        let record = handle.wait().await.unwrap();

        assert_eq!(record.status(), AnalysisStatus::Failed);
        assert!(record.error_message().unwrap().contains("no rules or rubrics"));
        assert!(!runner.store.contains(&id));
    }

    #[tokio::test]
    async fn test_unreadable_dataset_fails() {
        let runner = runner();
        let request = AnalysisRequest::new(
            "missing",
            DatasetSource::Parquet(PathBuf::from("/nonexistent/data.parquet")),
        )
        .with_rule(rule());
        let record = runner.submit(request).unwrap().wait().await.unwrap();
        assert_eq!(record.status(), AnalysisStatus::Failed);
    }

    #[test]
    fn test_uncommitted_table_discarded() {
        let runner = runner();
        let ctx = RunContext {
            analysis_id: "a-1".to_string(),
            tracker: Arc::clone(&runner.tracker),
            store: Arc::clone(&runner.store),
            cache: Arc::clone(&runner.cache),
        };
        // Still Pending, so completing it is rejected.
        runner.tracker.insert(AnalysisRecord::new("a-1", "run")).unwrap();
        let DatasetSource::InMemory { dataset, .. } = source() else {
            unreachable!()
        };
        let output = BatchScorer::default().run(&dataset, &[rule()], &[]).unwrap();
        let location = runner.store.put("a-1", output.table).unwrap();

        let err = commit(&ctx, &output.summary, &location).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert!(!runner.store.contains("a-1"));
        assert_eq!(runner.tracker.status("a-1").unwrap(), AnalysisStatus::Pending);
    }

    #[test]
    fn test_submit_outside_runtime() {
        assert!(runner()
            .submit(AnalysisRequest::new("x", source()).with_rule(rule()))
            .is_err());
    }
}
