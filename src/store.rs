//! Result store: canonical wide tables keyed by analysis id
//!
//! Every analysis uses the same uniform Parquet layout, one row per
//! (record, score column) cell:
//!
//! | row_index | key_value | key_value_2 | total_score | column_key | score | weight | weighted_score |
//!
//! The column inventory and key column names travel in the file's key/value
//! metadata, so no per-rubric schema is ever generated. Tables are cached in
//! memory and reloaded lazily from Parquet after a restart.

use crate::batch::{ScoreCell, ScoreColumn, ScoredRecord, WideResultTable};
use crate::config::KeyColumns;
use crate::stats::ScoreStatistics;
use crate::topk::SortOrder;
use crate::{Error, Result};
use arrow::array::{Array, ArrayRef, Float64Array, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Parquet key/value metadata entry holding the [`TableLayout`]
pub const LAYOUT_METADATA_KEY: &str = "rubric_engine.layout";

/// Where a wide table lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    /// Held in process memory only
    Memory(String),
    /// Parquet file on disk
    Parquet(PathBuf),
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory(id) => write!(f, "memory://{id}"),
            Self::Parquet(path) => write!(f, "parquet://{}", path.display()),
        }
    }
}

impl FromStr for StorageLocation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(id) = s.strip_prefix("memory://") {
            Ok(Self::Memory(id.to_string()))
        } else if let Some(path) = s.strip_prefix("parquet://") {
            Ok(Self::Parquet(PathBuf::from(path)))
        } else {
            Err(Error::InvalidInput(format!("unknown storage location {s}")))
        }
    }
}

/// Column inventory persisted alongside the cells
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TableLayout {
    keys: KeyColumns,
    columns: Vec<ScoreColumn>,
}

/// Paginated retrieval request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Maximum rows; `None` uses the store default
    #[serde(default)]
    pub limit: Option<usize>,
    /// Rows to skip
    #[serde(default)]
    pub offset: usize,
    /// Column key or label to sort by; `None` sorts by total score
    #[serde(default)]
    pub sort_by: Option<String>,
    /// Sort direction; nulls always last
    #[serde(default)]
    pub order: SortOrder,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: None,
            offset: 0,
            sort_by: None,
            order: SortOrder::Descending,
        }
    }
}

impl PageRequest {
    /// Page of `limit` rows starting at `offset`, by total score descending.
    #[must_use]
    pub const fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit: Some(limit),
            offset,
            sort_by: None,
            order: SortOrder::Descending,
        }
    }

    /// Sort by a score column.
    #[must_use]
    pub fn sort_by(mut self, column: impl Into<String>, order: SortOrder) -> Self {
        self.sort_by = Some(column.into());
        self.order = order;
        self
    }
}

/// One page of results
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultPage {
    /// Analysis identifier
    pub analysis_id: String,
    /// Score columns of the table
    pub columns: Vec<ScoreColumn>,
    /// Rows on this page
    pub rows: Vec<ScoredRecord>,
    /// Rows in the whole table
    pub total: usize,
    /// Effective limit
    pub limit: usize,
    /// Effective offset
    pub offset: usize,
    /// Whether rows remain after this page
    pub has_more: bool,
}

/// Statistics of one stored score column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStatistics {
    /// Column descriptor
    pub column: ScoreColumn,
    /// Statistics over its scores
    pub statistics: ScoreStatistics,
}

/// Aggregate statistics of a stored table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultStatistics {
    /// Statistics of the grand total
    pub total_score: ScoreStatistics,
    /// Statistics per score column
    pub columns: Vec<ColumnStatistics>,
}

/// Canonical storage of wide result tables
#[derive(Debug)]
pub struct ResultStore {
    tables: DashMap<String, Arc<WideResultTable>>,
    dir: Option<PathBuf>,
    default_limit: usize,
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl ResultStore {
    /// In-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            tables: DashMap::new(),
            dir: None,
            default_limit: 1000,
        }
    }

    /// Store persisting one Parquet file per analysis under `dir`.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created.
    pub fn persistent(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            tables: DashMap::new(),
            dir: Some(dir),
            default_limit: 1000,
        })
    }

    /// Set the page size used when a request has none.
    #[must_use]
    pub const fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit;
        self
    }

    /// Persist a table, replacing any earlier one for the analysis.
    ///
    /// # Errors
    ///
    /// Returns error if the Parquet file cannot be written.
    pub fn put(&self, analysis_id: &str, table: WideResultTable) -> Result<StorageLocation> {
        let location = match &self.dir {
            Some(dir) => {
                let path = table_path(dir, analysis_id)?;
                write_table(&path, &table)?;
                StorageLocation::Parquet(path)
            }
            None => StorageLocation::Memory(analysis_id.to_string()),
        };

        tracing::debug!(
            analysis_id,
            rows = table.len(),
            columns = table.columns().len(),
            location = %location,
            "result table stored"
        );
        self.tables.insert(analysis_id.to_string(), Arc::new(table));
        Ok(location)
    }

    /// Table for an analysis, loading it from disk if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AnalysisNotFound`] if no table exists.
    pub fn get(&self, analysis_id: &str) -> Result<Arc<WideResultTable>> {
        if let Some(table) = self.tables.get(analysis_id) {
            return Ok(Arc::clone(table.value()));
        }

        let Some(dir) = &self.dir else {
            return Err(Error::AnalysisNotFound(analysis_id.to_string()));
        };
        let path = table_path(dir, analysis_id)?;
        if !path.exists() {
            return Err(Error::AnalysisNotFound(analysis_id.to_string()));
        }

        let table = Arc::new(read_table(&path)?);
        self.tables
            .insert(analysis_id.to_string(), Arc::clone(&table));
        Ok(table)
    }

    /// Whether a table exists for the analysis.
    #[must_use]
    pub fn contains(&self, analysis_id: &str) -> bool {
        self.tables.contains_key(analysis_id)
            || self
                .dir
                .as_ref()
                .and_then(|d| table_path(d, analysis_id).ok())
                .is_some_and(|p| p.exists())
    }

    /// Remove a table. Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns error if the Parquet file cannot be deleted.
    pub fn delete(&self, analysis_id: &str) -> Result<bool> {
        let mut removed = self.tables.remove(analysis_id).is_some();
        if let Some(dir) = &self.dir {
            let path = table_path(dir, analysis_id)?;
            if path.exists() {
                std::fs::remove_file(&path)?;
                removed = true;
            }
        }
        Ok(removed)
    }

    /// Paginated retrieval.
    ///
    /// # Errors
    ///
    /// Returns error if the analysis is unknown or `sort_by` names no column.
    pub fn page(&self, analysis_id: &str, request: &PageRequest) -> Result<ResultPage> {
        let table = self.get(analysis_id)?;
        let limit = request.limit.unwrap_or(self.default_limit);
        let total = table.len();

        let order: Vec<usize> = match (&request.sort_by, request.order) {
            (None, SortOrder::Descending) => (0..total).collect(),
            (None, order) => ranked(table.rows(), order, |r| Some(r.total_score)),
            (Some(name), order) => {
                let column = table.find_column(name).ok_or_else(|| {
                    Error::InvalidInput(format!("unknown score column {name}"))
                })?;
                let key = column.key.clone();
                ranked(table.rows(), order, |r| r.score(&key))
            }
        };

        let rows: Vec<ScoredRecord> = order
            .into_iter()
            .skip(request.offset)
            .take(limit)
            .map(|i| table.rows()[i].clone())
            .collect();

        Ok(ResultPage {
            analysis_id: analysis_id.to_string(),
            columns: table.columns().to_vec(),
            has_more: request.offset.saturating_add(rows.len()) < total,
            rows,
            total,
            limit,
            offset: request.offset,
        })
    }

    /// Rows whose primary or secondary key is in `keys`, in ranked order.
    ///
    /// # Errors
    ///
    /// Returns error if the analysis is unknown.
    pub fn lookup<S: AsRef<str>>(&self, analysis_id: &str, keys: &[S]) -> Result<Vec<ScoredRecord>> {
        let table = self.get(analysis_id)?;
        let wanted: std::collections::HashSet<&str> = keys.iter().map(AsRef::as_ref).collect();
        Ok(table
            .rows()
            .iter()
            .filter(|r| {
                r.key.as_deref().is_some_and(|k| wanted.contains(k))
                    || r.key_2.as_deref().is_some_and(|k| wanted.contains(k))
            })
            .cloned()
            .collect())
    }

    /// Aggregate statistics over the stored columns.
    ///
    /// # Errors
    ///
    /// Returns error if the analysis is unknown.
    pub fn statistics(&self, analysis_id: &str) -> Result<ResultStatistics> {
        let table = self.get(analysis_id)?;
        Ok(ResultStatistics {
            total_score: ScoreStatistics::compute(table.rows().iter().map(|r| Some(r.total_score))),
            columns: table
                .columns()
                .iter()
                .map(|c| ColumnStatistics {
                    column: c.clone(),
                    statistics: ScoreStatistics::compute(table.column_values(&c.key)),
                })
                .collect(),
        })
    }
}

fn ranked(
    rows: &[ScoredRecord],
    order: SortOrder,
    value: impl Fn(&ScoredRecord) -> Option<f64>,
) -> Vec<usize> {
    let values: Vec<f64> = rows.iter().map(|r| value(r).unwrap_or(f64::NAN)).collect();
    let mut idx: Vec<usize> = (0..rows.len()).collect();
    idx.sort_by(|&a, &b| order.compare(values[a], values[b]));
    idx
}

fn table_path(dir: &Path, analysis_id: &str) -> Result<PathBuf> {
    if analysis_id.is_empty()
        || analysis_id.contains(['/', '\\'])
        || analysis_id.contains("..")
    {
        return Err(Error::InvalidInput(format!(
            "invalid analysis id {analysis_id}"
        )));
    }
    Ok(dir.join(format!("{analysis_id}.parquet")))
}

fn cell_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("row_index", DataType::UInt64, false),
        Field::new("key_value", DataType::Utf8, true),
        Field::new("key_value_2", DataType::Utf8, true),
        Field::new("total_score", DataType::Float64, false),
        Field::new("column_key", DataType::Utf8, true),
        Field::new("score", DataType::Float64, true),
        Field::new("weight", DataType::Float64, true),
        Field::new("weighted_score", DataType::Float64, true),
    ]))
}

fn to_cell_batch(table: &WideResultTable) -> Result<RecordBatch> {
    let mut row_index = Vec::new();
    let mut key_value = Vec::new();
    let mut key_value_2 = Vec::new();
    let mut total_score = Vec::new();
    let mut column_key = Vec::new();
    let mut score = Vec::new();
    let mut weight = Vec::new();
    let mut weighted_score = Vec::new();

    for row in table.rows() {
        let mut emit = |col: Option<&str>, cell: ScoreCell| {
            row_index.push(row.row_index as u64);
            key_value.push(row.key.clone());
            key_value_2.push(row.key_2.clone());
            total_score.push(row.total_score);
            column_key.push(col.map(str::to_string));
            score.push(cell.score);
            weight.push(cell.weight);
            weighted_score.push(cell.weighted_score);
        };
        if row.scores.is_empty() {
            emit(None, ScoreCell::default());
        }
        for (col, cell) in &row.scores {
            emit(Some(col.as_str()), *cell);
        }
    }

    let arrays: Vec<ArrayRef> = vec![
        Arc::new(UInt64Array::from(row_index)),
        Arc::new(StringArray::from(key_value)),
        Arc::new(StringArray::from(key_value_2)),
        Arc::new(Float64Array::from(total_score)),
        Arc::new(StringArray::from(column_key)),
        Arc::new(Float64Array::from(score)),
        Arc::new(Float64Array::from(weight)),
        Arc::new(Float64Array::from(weighted_score)),
    ];
    Ok(RecordBatch::try_new(cell_schema(), arrays)?)
}

fn write_table(path: &Path, table: &WideResultTable) -> Result<()> {
    use parquet::arrow::ArrowWriter;
    use parquet::file::metadata::KeyValue;
    use parquet::file::properties::WriterProperties;

    let layout = TableLayout {
        keys: table.keys().clone(),
        columns: table.columns().to_vec(),
    };
    let props = WriterProperties::builder()
        .set_key_value_metadata(Some(vec![KeyValue::new(
            LAYOUT_METADATA_KEY.to_string(),
            serde_json::to_string(&layout)?,
        )]))
        .build();

    let batch = to_cell_batch(table)?;
    let tmp = path.with_extension("parquet.tmp");
    let file = std::fs::File::create(&tmp)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
        .map_err(|e| Error::StorageError(format!("Failed to create Parquet writer: {e}")))?;
    writer
        .write(&batch)
        .map_err(|e| Error::StorageError(format!("Failed to write result table: {e}")))?;
    writer
        .close()
        .map_err(|e| Error::StorageError(format!("Failed to finish result table: {e}")))?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_table(path: &Path) -> Result<WideResultTable> {
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::fs::File;

    let file = File::open(path)
        .map_err(|e| Error::StorageError(format!("Failed to open result table: {e}")))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| Error::StorageError(format!("Failed to parse Parquet file: {e}")))?;

    let layout_json = builder
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .and_then(|kvs| kvs.iter().find(|kv| kv.key == LAYOUT_METADATA_KEY))
        .and_then(|kv| kv.value.clone())
        .ok_or_else(|| {
            Error::StorageError(format!("{} has no result layout metadata", path.display()))
        })?;
    let layout: TableLayout = serde_json::from_str(&layout_json)?;

    let reader = builder
        .build()
        .map_err(|e| Error::StorageError(format!("Failed to create Parquet reader: {e}")))?;

    let mut rows: BTreeMap<u64, ScoredRecord> = BTreeMap::new();
    let mut order: Vec<u64> = Vec::new();
    for batch in reader {
        let batch = batch
            .map_err(|e| Error::StorageError(format!("Failed to read record batch: {e}")))?;
        let row_index = column::<UInt64Array>(&batch, 0)?;
        let key_value = column::<StringArray>(&batch, 1)?;
        let key_value_2 = column::<StringArray>(&batch, 2)?;
        let total_score = column::<Float64Array>(&batch, 3)?;
        let column_key = column::<StringArray>(&batch, 4)?;
        let score = column::<Float64Array>(&batch, 5)?;
        let weight = column::<Float64Array>(&batch, 6)?;
        let weighted_score = column::<Float64Array>(&batch, 7)?;

        for i in 0..batch.num_rows() {
            let idx = row_index.value(i);
            let record = rows.entry(idx).or_insert_with(|| {
                order.push(idx);
                ScoredRecord {
                    row_index: usize::try_from(idx).unwrap_or(usize::MAX),
                    key: opt_str(key_value, i),
                    key_2: opt_str(key_value_2, i),
                    scores: BTreeMap::new(),
                    total_score: total_score.value(i),
                }
            });
            if let Some(col) = opt_str(column_key, i) {
                record.scores.insert(
                    col,
                    ScoreCell {
                        score: opt_f64(score, i),
                        weight: opt_f64(weight, i),
                        weighted_score: opt_f64(weighted_score, i),
                    },
                );
            }
        }
    }

    let rows = order
        .into_iter()
        .filter_map(|idx| rows.remove(&idx))
        .collect();
    Ok(WideResultTable::new(layout.keys, layout.columns, rows))
}

fn column<T: Array + 'static>(batch: &RecordBatch, index: usize) -> Result<&T> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| {
            Error::StorageError(format!(
                "Unexpected type for result column {}",
                batch.schema().field(index).name()
            ))
        })
}

fn opt_str(array: &StringArray, i: usize) -> Option<String> {
    (!array.is_null(i)).then(|| array.value(i).to_string())
}

fn opt_f64(array: &Float64Array, i: usize) -> Option<f64> {
    (!array.is_null(i)).then(|| array.value(i))
}
