//! Dataset access (Arrow/Parquet)
//!
//! Datasets are immutable, columnar collections of records loaded in full
//! before scoring. Records are read row-wise through [`RowView`], which
//! resolves a column name to a cell without materializing the row.

use crate::value::Value;
use crate::{Error, Result};
use arrow::array::{
    Array, ArrayRef, BooleanArray, Float32Array, Float64Array, Int32Array, Int64Array,
    LargeStringArray, StringArray, UInt32Array, UInt64Array,
};
use arrow::datatypes::{DataType, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasher;
use std::path::Path;
use std::sync::Arc;

/// Anything that can look up a cell by column name.
pub trait Record {
    /// Cell value for `column`, or `None` if the column does not exist.
    fn get(&self, column: &str) -> Option<Value>;
}

impl<S: BuildHasher> Record for HashMap<String, Value, S> {
    fn get(&self, column: &str) -> Option<Value> {
        HashMap::get(self, column).cloned()
    }
}

impl Record for BTreeMap<String, Value> {
    fn get(&self, column: &str) -> Option<Value> {
        BTreeMap::get(self, column).cloned()
    }
}

/// Immutable columnar dataset
#[derive(Debug, Clone)]
pub struct Dataset {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    /// Cumulative row count at the start of each batch
    offsets: Vec<usize>,
    columns: FxHashMap<String, usize>,
    num_rows: usize,
}

impl Dataset {
    /// Create a dataset from existing batches.
    ///
    /// # Errors
    ///
    /// Returns error if the batches do not share one schema.
    pub fn new(batches: Vec<RecordBatch>) -> Result<Self> {
        let schema = batches
            .first()
            .map_or_else(|| Arc::new(Schema::empty()), RecordBatch::schema);

        for batch in &batches {
            if batch.schema() != schema {
                return Err(Error::StorageError(format!(
                    "Schema mismatch: expected {:?}, got {:?}",
                    schema,
                    batch.schema()
                )));
            }
        }

        let mut columns = FxHashMap::default();
        for (idx, field) in schema.fields().iter().enumerate() {
            if !is_supported(field.data_type()) {
                tracing::warn!(
                    column = %field.name(),
                    data_type = ?field.data_type(),
                    "unsupported column type, cells read as null"
                );
            }
            columns.insert(field.name().clone(), idx);
        }

        let mut offsets = Vec::with_capacity(batches.len());
        let mut num_rows = 0;
        for batch in &batches {
            offsets.push(num_rows);
            num_rows += batch.num_rows();
        }

        Ok(Self {
            schema,
            batches,
            offsets,
            columns,
            num_rows,
        })
    }

    /// Create a dataset from a single batch.
    ///
    /// # Errors
    ///
    /// Never fails for a single batch; kept fallible for symmetry with [`Dataset::new`].
    pub fn from_batch(batch: RecordBatch) -> Result<Self> {
        Self::new(vec![batch])
    }

    /// Load a dataset from a Parquet file.
    ///
    /// This is blocking I/O; async callers should run it on a blocking thread.
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load_parquet<P: AsRef<Path>>(path: P) -> Result<Self> {
        use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
        use std::fs::File;

        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::StorageError(format!("Failed to open dataset {}: {e}", path.display()))
        })?;

        let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| {
            Error::StorageError(format!("Failed to parse Parquet file: {e}"))
        })?;

        let reader = builder.build().map_err(|e| {
            Error::StorageError(format!("Failed to create Parquet reader: {e}"))
        })?;

        let mut batches = Vec::new();
        for batch in reader {
            let batch = batch.map_err(|e| {
                Error::StorageError(format!("Failed to read record batch: {e}"))
            })?;
            batches.push(batch);
        }

        let dataset = Self::new(batches)?;
        tracing::debug!(
            path = %path.display(),
            rows = dataset.num_rows(),
            columns = dataset.schema.fields().len(),
            "dataset loaded"
        );
        Ok(dataset)
    }

    /// Number of records.
    #[must_use]
    pub const fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Whether the dataset has no records.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    /// Arrow schema.
    #[must_use]
    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    /// Column names in schema order.
    #[must_use]
    pub fn column_names(&self) -> Vec<String> {
        self.schema
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    }

    /// Whether a column exists.
    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Underlying batches.
    #[must_use]
    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    /// Record at a global row index.
    #[must_use]
    pub fn row(&self, index: usize) -> Option<RowView<'_>> {
        if index >= self.num_rows {
            return None;
        }
        let batch = self.offsets.partition_point(|&start| start <= index) - 1;
        Some(RowView {
            dataset: self,
            batch,
            offset: index - self.offsets[batch],
            index,
        })
    }

    /// Iterate records in order.
    pub fn rows(&self) -> impl Iterator<Item = RowView<'_>> + '_ {
        self.batches.iter().enumerate().flat_map(move |(b, batch)| {
            let start = self.offsets[b];
            (0..batch.num_rows()).map(move |offset| RowView {
                dataset: self,
                batch: b,
                offset,
                index: start + offset,
            })
        })
    }
}

/// Borrowed view of one dataset record
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    dataset: &'a Dataset,
    batch: usize,
    offset: usize,
    index: usize,
}

impl RowView<'_> {
    /// Global row index (original record order).
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }
}

impl Record for RowView<'_> {
    fn get(&self, column: &str) -> Option<Value> {
        let idx = *self.dataset.columns.get(column)?;
        let array = self.dataset.batches[self.batch].column(idx);
        Some(cell(array, self.offset))
    }
}

const fn is_supported(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Int32
            | DataType::Int64
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
            | DataType::Boolean
            | DataType::Utf8
            | DataType::LargeUtf8
    )
}

#[allow(clippy::cast_precision_loss)]
fn cell(array: &ArrayRef, row: usize) -> Value {
    if array.is_null(row) {
        return Value::Null;
    }

    macro_rules! number {
        ($ty:ty) => {
            array
                .as_any()
                .downcast_ref::<$ty>()
                .map_or(Value::Null, |a| Value::Number(a.value(row) as f64))
        };
    }

    match array.data_type() {
        DataType::Int32 => number!(Int32Array),
        DataType::Int64 => number!(Int64Array),
        DataType::UInt32 => number!(UInt32Array),
        DataType::UInt64 => number!(UInt64Array),
        DataType::Float32 => number!(Float32Array),
        DataType::Float64 => number!(Float64Array),
        DataType::Boolean => array
            .as_any()
            .downcast_ref::<BooleanArray>()
            .map_or(Value::Null, |a| Value::Bool(a.value(row))),
        DataType::Utf8 => array
            .as_any()
            .downcast_ref::<StringArray>()
            .map_or(Value::Null, |a| Value::Text(a.value(row).to_string())),
        DataType::LargeUtf8 => array
            .as_any()
            .downcast_ref::<LargeStringArray>()
            .map_or(Value::Null, |a| Value::Text(a.value(row).to_string())),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Date32Array;
    use arrow::datatypes::Field;

    fn gene_batch(genes: &[&str], scores: &[Option<f64>]) -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new("gene_symbol", DataType::Utf8, false),
            Field::new("cadd", DataType::Float64, true),
        ]);
        RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(StringArray::from(genes.to_vec())),
                Arc::new(Float64Array::from(scores.to_vec())),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_rows_span_batches() {
        let ds = Dataset::new(vec![
            gene_batch(&["A", "B"], &[Some(1.0), None]),
            gene_batch(&["C"], &[Some(3.0)]),
        ])
        .unwrap();

        assert_eq!(ds.num_rows(), 3);
        let genes: Vec<_> = ds
            .rows()
            .map(|r| (r.index(), r.get("gene_symbol").unwrap()))
            .collect();
        assert_eq!(
            genes,
            vec![
                (0, Value::from("A")),
                (1, Value::from("B")),
                (2, Value::from("C"))
            ]
        );
        assert_eq!(ds.row(1).unwrap().get("cadd"), Some(Value::Null));
        assert_eq!(ds.row(2).unwrap().get("cadd"), Some(Value::Number(3.0)));
        assert!(ds.row(3).is_none());
    }

    #[test]
    fn test_missing_column_is_none() {
        let ds = Dataset::from_batch(gene_batch(&["A"], &[Some(1.0)])).unwrap();
        assert!(ds.row(0).unwrap().get("nope").is_none());
        assert!(ds.has_column("cadd"));
        assert_eq!(ds.column_names(), vec!["gene_symbol", "cadd"]);
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let other = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("x", DataType::Int32, false)])),
            vec![Arc::new(Int32Array::from(vec![1]))],
        )
        .unwrap();
        let err = Dataset::new(vec![gene_batch(&["A"], &[None]), other]).unwrap_err();
        assert!(err.to_string().contains("Schema mismatch"));
    }

    #[test]
    fn test_unsupported_type_reads_null() {
        let batch = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("d", DataType::Date32, false)])),
            vec![Arc::new(Date32Array::from(vec![19_000]))],
        )
        .unwrap();
        let ds = Dataset::from_batch(batch).unwrap();
        assert_eq!(ds.row(0).unwrap().get("d"), Some(Value::Null));
    }

    #[test]
    fn test_empty_dataset() {
        let ds = Dataset::new(vec![]).unwrap();
        assert!(ds.is_empty());
        assert_eq!(ds.rows().count(), 0);
    }

    #[test]
    fn test_load_parquet_roundtrip() {
        use parquet::arrow::ArrowWriter;
        use parquet::file::properties::WriterProperties;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genes.parquet");
        let batch = gene_batch(&["TP53", "BRCA1"], &[Some(25.0), Some(12.5)]);

        let file = std::fs::File::create(&path).unwrap();
        let props = WriterProperties::builder().build();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props)).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let ds = Dataset::load_parquet(&path).unwrap();
        assert_eq!(ds.num_rows(), 2);
        assert_eq!(ds.row(1).unwrap().get("cadd"), Some(Value::Number(12.5)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Dataset::load_parquet("/nonexistent/genes.parquet").unwrap_err();
        assert!(matches!(err, Error::StorageError(_)));
    }
}
