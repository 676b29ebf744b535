//! Batch scoring: rules and rubrics across a whole dataset
//!
//! Produces a wide result table: one row per record, one score column per
//! standalone rule and per rubric (plus optional rubric member columns),
//! and a grand total used for ranking. Rows are sorted by total descending;
//! ties keep original record order.

use crate::config::{EngineConfig, KeyColumns};
use crate::dataset::{Dataset, Record};
use crate::rubric::{AggregationMode, Rubric};
use crate::rule::Rule;
use crate::value::Value;
use crate::{Error, Result};
use arrow::array::{ArrayRef, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Label of the grand total column
pub const TOTAL_SCORE_COLUMN: &str = "TOTAL_SCORE";

/// What a score column holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnRole {
    /// Standalone rule score
    Rule {
        /// Rule identifier
        rule_id: String,
    },
    /// Rubric total
    Rubric {
        /// Rubric identifier
        rubric_id: String,
    },
    /// Rule score inside a rubric (not counted in the grand total)
    RubricMember {
        /// Owning rubric
        rubric_id: String,
        /// Rule identifier
        rule_id: String,
    },
}

/// Score column descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreColumn {
    /// Stable key used in sparse rows
    pub key: String,
    /// Display label
    pub label: String,
    /// Column role
    pub role: ColumnRole,
}

impl ScoreColumn {
    fn rule(rule: &Rule) -> Self {
        Self {
            key: format!("rule:{}", rule.id()),
            label: format!("{}_SCORE", rule.name()),
            role: ColumnRole::Rule {
                rule_id: rule.id().to_string(),
            },
        }
    }

    fn rubric(rubric: &Rubric) -> Self {
        Self {
            key: format!("rubric:{}", rubric.id()),
            label: format!("{}_RUBRIC_SCORE", rubric.name()),
            role: ColumnRole::Rubric {
                rubric_id: rubric.id().to_string(),
            },
        }
    }

    fn member(rubric: &Rubric, rule: &Rule) -> Self {
        Self {
            key: format!("rubric:{}/rule:{}", rubric.id(), rule.id()),
            label: format!("{}.{}", rubric.name(), rule.name()),
            role: ColumnRole::RubricMember {
                rubric_id: rubric.id().to_string(),
                rule_id: rule.id().to_string(),
            },
        }
    }

    /// Whether the column contributes to the grand total.
    #[must_use]
    pub const fn is_primary(&self) -> bool {
        !matches!(self.role, ColumnRole::RubricMember { .. })
    }
}

/// One cell of the sparse score map
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreCell {
    /// Raw score (`None` = null)
    pub score: Option<f64>,
    /// Weight applied, for rubric members
    pub weight: Option<f64>,
    /// Weighted score, for rubric members
    pub weighted_score: Option<f64>,
}

impl ScoreCell {
    /// Cell holding only a score.
    #[must_use]
    pub const fn score(score: Option<f64>) -> Self {
        Self {
            score,
            weight: None,
            weighted_score: None,
        }
    }
}

/// One row of the wide result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    /// Position in the source dataset
    pub row_index: usize,
    /// Primary key value
    pub key: Option<String>,
    /// Secondary key value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_2: Option<String>,
    /// Column key → cell
    pub scores: BTreeMap<String, ScoreCell>,
    /// Grand total
    pub total_score: f64,
}

impl ScoredRecord {
    /// Score in a column, if present and non-null.
    #[must_use]
    pub fn score(&self, column_key: &str) -> Option<f64> {
        self.scores.get(column_key).and_then(|c| c.score)
    }
}

/// Wide result table, sorted by total score descending
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WideResultTable {
    keys: KeyColumns,
    columns: Vec<ScoreColumn>,
    rows: Vec<ScoredRecord>,
}

impl WideResultTable {
    /// Assemble a table; rows are sorted by total score descending (stable).
    #[must_use]
    pub fn new(keys: KeyColumns, columns: Vec<ScoreColumn>, mut rows: Vec<ScoredRecord>) -> Self {
        sort_by_total(&mut rows);
        Self {
            keys,
            columns,
            rows,
        }
    }

    /// Key columns.
    #[must_use]
    pub const fn keys(&self) -> &KeyColumns {
        &self.keys
    }

    /// Score columns in output order.
    #[must_use]
    pub fn columns(&self) -> &[ScoreColumn] {
        &self.columns
    }

    /// Column descriptor by key.
    #[must_use]
    pub fn column(&self, key: &str) -> Option<&ScoreColumn> {
        self.columns.iter().find(|c| c.key == key)
    }

    /// Column descriptor by key or label.
    #[must_use]
    pub fn find_column(&self, name: &str) -> Option<&ScoreColumn> {
        self.column(name)
            .or_else(|| self.columns.iter().find(|c| c.label == name))
    }

    /// Rows in ranked order.
    #[must_use]
    pub fn rows(&self) -> &[ScoredRecord] {
        &self.rows
    }

    /// Consume into rows.
    #[must_use]
    pub fn into_rows(self) -> Vec<ScoredRecord> {
        self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Scores of one column in row order.
    #[must_use]
    pub fn column_values(&self, key: &str) -> Vec<Option<f64>> {
        self.rows.iter().map(|r| r.score(key)).collect()
    }

    /// Grand totals in row order.
    #[must_use]
    pub fn totals(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.total_score).collect()
    }

    /// Export as an Arrow batch: key column(s), one Float64 column per
    /// primary score column, a score/weight/weighted-score triple per rubric
    /// member, then `TOTAL_SCORE`.
    ///
    /// # Errors
    ///
    /// Returns error if Arrow rejects the assembled columns.
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let mut fields = vec![Field::new(&self.keys.primary, DataType::Utf8, true)];
        let mut arrays: Vec<ArrayRef> = vec![Arc::new(StringArray::from(
            self.rows.iter().map(|r| r.key.as_deref()).collect::<Vec<_>>(),
        ))];

        if let Some(secondary) = &self.keys.secondary {
            fields.push(Field::new(secondary, DataType::Utf8, true));
            arrays.push(Arc::new(StringArray::from(
                self.rows
                    .iter()
                    .map(|r| r.key_2.as_deref())
                    .collect::<Vec<_>>(),
            )));
        }

        let mut push = |name: String, values: Vec<Option<f64>>| {
            fields.push(Field::new(name, DataType::Float64, true));
            arrays.push(Arc::new(Float64Array::from(values)));
        };

        for column in &self.columns {
            let key = column.key.as_str();
            if column.is_primary() {
                push(column.label.clone(), cells(&self.rows, key, |c| c.score));
            } else {
                push(
                    format!("{}_score", column.label),
                    cells(&self.rows, key, |c| c.score),
                );
                push(
                    format!("{}_weight", column.label),
                    cells(&self.rows, key, |c| c.weight),
                );
                push(
                    format!("{}_weighted_score", column.label),
                    cells(&self.rows, key, |c| c.weighted_score),
                );
            }
        }
        push(
            TOTAL_SCORE_COLUMN.to_string(),
            self.rows.iter().map(|r| Some(r.total_score)).collect(),
        );

        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
    }
}

fn cells(
    rows: &[ScoredRecord],
    key: &str,
    field: impl Fn(&ScoreCell) -> Option<f64>,
) -> Vec<Option<f64>> {
    rows.iter()
        .map(|r| r.scores.get(key).and_then(&field))
        .collect()
}

/// Stable sort by total descending; NaN totals last.
pub(crate) fn sort_by_total(rows: &mut [ScoredRecord]) {
    rows.sort_by(|a, b| match (a.total_score.is_nan(), b.total_score.is_nan()) {
        (false, false) => b.total_score.total_cmp(&a.total_score),
        (a_nan, b_nan) => a_nan.cmp(&b_nan),
    });
}

/// Counts and timing for one batch run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Records scored
    pub records_processed: usize,
    /// Rules evaluated per record (standalone + active rubric members)
    pub rules_executed: usize,
    /// Wall-clock scoring time in seconds
    pub elapsed_seconds: f64,
}

impl BatchSummary {
    /// Elapsed time as a duration.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.elapsed_seconds.max(0.0))
    }
}

/// Result of a batch run
#[derive(Debug, Clone)]
pub struct BatchOutput {
    /// Ranked wide table
    pub table: WideResultTable,
    /// Counts and timing
    pub summary: BatchSummary,
}

/// Per-run scoring options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Rubric aggregation mode
    pub mode: AggregationMode,
    /// Keep rubric member columns
    pub retain_rubric_members: bool,
    /// Key column(s)
    pub keys: KeyColumns,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for BatchOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            mode: config.aggregation_mode,
            retain_rubric_members: config.retain_rubric_members,
            keys: config.keys.clone(),
        }
    }
}

impl BatchOptions {
    /// Override the aggregation mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: AggregationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Keep or drop rubric member columns.
    #[must_use]
    pub const fn with_retain_rubric_members(mut self, retain: bool) -> Self {
        self.retain_rubric_members = retain;
        self
    }

    /// Override the key columns.
    #[must_use]
    pub fn with_keys(mut self, keys: KeyColumns) -> Self {
        self.keys = keys;
        self
    }
}

/// Drives rules and rubrics across a dataset.
#[derive(Debug, Clone, Default)]
pub struct BatchScorer {
    options: BatchOptions,
}

impl BatchScorer {
    /// Create a scorer.
    #[must_use]
    pub const fn new(options: BatchOptions) -> Self {
        Self { options }
    }

    /// Options in use.
    #[must_use]
    pub const fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Score every record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when there is nothing to run, a rubric
    /// has no active rules, a score column is duplicated, or a key column is
    /// missing from the dataset. No partial table is produced.
    pub fn run(
        &self,
        dataset: &Dataset,
        rules: &[Arc<Rule>],
        rubrics: &[Arc<Rubric>],
    ) -> Result<BatchOutput> {
        let started = Instant::now();
        let span = tracing::info_span!(
            "batch",
            records = dataset.num_rows(),
            rules = rules.len(),
            rubrics = rubrics.len()
        );
        let _guard = span.enter();

        self.validate(dataset, rules, rubrics)?;
        let columns = self.layout(rules, rubrics)?;
        let rules_executed =
            rules.len() + rubrics.iter().map(|r| r.active_rule_count()).sum::<usize>();

        let rows: Vec<ScoredRecord> = dataset
            .rows()
            .map(|row| self.score_row(row.index(), &row, rules, rubrics))
            .collect();

        let table = WideResultTable::new(self.options.keys.clone(), columns, rows);
        let summary = BatchSummary {
            records_processed: table.len(),
            rules_executed,
            elapsed_seconds: started.elapsed().as_secs_f64(),
        };

        tracing::info!(
            records = summary.records_processed,
            rules = summary.rules_executed,
            elapsed_s = summary.elapsed_seconds,
            "batch scoring complete"
        );
        Ok(BatchOutput { table, summary })
    }

    fn validate(&self, dataset: &Dataset, rules: &[Arc<Rule>], rubrics: &[Arc<Rubric>]) -> Result<()> {
        if rules.is_empty() && rubrics.is_empty() {
            return Err(Error::InvalidInput(
                "no rules or rubrics to run".to_string(),
            ));
        }
        if let Some(empty) = rubrics.iter().find(|r| r.active_rule_count() == 0) {
            return Err(Error::InvalidInput(format!(
                "rubric {} has no active rules",
                empty.id()
            )));
        }

        let keys = &self.options.keys;
        for key in std::iter::once(&keys.primary).chain(keys.secondary.as_ref()) {
            if !dataset.has_column(key) {
                return Err(Error::InvalidInput(format!(
                    "key column {key} not found in dataset"
                )));
            }
        }

        for rule in rules
            .iter()
            .map(Arc::as_ref)
            .chain(rubrics.iter().flat_map(|r| r.active_rules().map(|l| l.rule().as_ref())))
        {
            let missing: Vec<&str> = rule
                .required_columns()
                .into_iter()
                .filter(|c| !dataset.has_column(c))
                .collect();
            if !missing.is_empty() {
                tracing::warn!(
                    rule = %rule.id(),
                    columns = ?missing,
                    "mapped columns missing from dataset, variables bind to null"
                );
            }
        }
        Ok(())
    }

    fn layout(&self, rules: &[Arc<Rule>], rubrics: &[Arc<Rubric>]) -> Result<Vec<ScoreColumn>> {
        let mut columns: Vec<ScoreColumn> = rules.iter().map(|r| ScoreColumn::rule(r)).collect();
        for rubric in rubrics {
            columns.push(ScoreColumn::rubric(rubric));
            if self.options.retain_rubric_members {
                columns.extend(
                    rubric
                        .active_rules()
                        .map(|l| ScoreColumn::member(rubric, l.rule())),
                );
            }
        }

        let duplicate = {
            let mut seen = FxHashSet::default();
            columns
                .iter()
                .find(|c| !seen.insert(c.key.as_str()))
                .map(|c| c.key.clone())
        };
        if let Some(dup) = duplicate {
            return Err(Error::InvalidInput(format!("duplicate score column {dup}")));
        }

        // Labels name the exported fields and the cache statistics.
        let keys = &self.options.keys;
        let mut labels: FxHashSet<&str> = FxHashSet::default();
        labels.insert(TOTAL_SCORE_COLUMN);
        labels.insert(keys.primary.as_str());
        if let Some(secondary) = &keys.secondary {
            labels.insert(secondary.as_str());
        }
        if let Some(clash) = columns.iter().find(|c| !labels.insert(c.label.as_str())) {
            return Err(Error::InvalidInput(format!(
                "score column label {} of {} is already in use; rename the rule or rubric",
                clash.label, clash.key
            )));
        }
        Ok(columns)
    }

    fn score_row<R: Record + ?Sized>(
        &self,
        row_index: usize,
        record: &R,
        rules: &[Arc<Rule>],
        rubrics: &[Arc<Rubric>],
    ) -> ScoredRecord {
        let mut scores = BTreeMap::new();
        let mut total = 0.0;

        for rule in rules {
            let score = rule.score(record).filter(|s| !s.is_nan());
            total += score.unwrap_or(0.0);
            scores.insert(format!("rule:{}", rule.id()), ScoreCell::score(score));
        }

        for rubric in rubrics {
            let detail = rubric.score_detailed(record, self.options.mode);
            total += detail.total;
            scores.insert(
                format!("rubric:{}", rubric.id()),
                ScoreCell::score(Some(detail.total)),
            );
            if self.options.retain_rubric_members {
                for m in detail.members {
                    scores.insert(
                        format!("rubric:{}/rule:{}", rubric.id(), m.rule_id),
                        ScoreCell {
                            score: m.score,
                            weight: Some(m.weight),
                            weighted_score: m.weighted_score,
                        },
                    );
                }
            }
        }

        let keys = &self.options.keys;
        ScoredRecord {
            row_index,
            key: key_value(record, &keys.primary),
            key_2: keys.secondary.as_ref().and_then(|k| key_value(record, k)),
            scores,
            total_score: total,
        }
    }
}

fn key_value<R: Record + ?Sized>(record: &R, column: &str) -> Option<String> {
    match record.get(column)? {
        Value::Null => None,
        Value::Number(n) if n.is_nan() => None,
        v => Some(v.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Float64Array;

    fn dataset() -> Dataset {
        let schema = Schema::new(vec![
            Field::new("gene_symbol", DataType::Utf8, false),
            Field::new("x", DataType::Float64, true),
        ]);
        let batch = RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(StringArray::from(vec!["A", "B", "C", "D"])),
                Arc::new(Float64Array::from(vec![Some(0.3), Some(0.7), None, Some(0.7)])),
            ],
        )
        .unwrap();
        Dataset::from_batch(batch).unwrap()
    }

    fn tiered() -> Arc<Rule> {
        Arc::new(
            Rule::builder("tier", "TIER")
                .condition("x > 0.5 ~ 6")
                .condition("x > 0.1 ~ 2")
                .condition("TRUE ~ 0")
                .map("x", "x")
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_rule_batch_sorted_stable() {
        let out = BatchScorer::default()
            .run(&dataset(), &[tiered()], &[])
            .unwrap();
        let keys: Vec<_> = out
            .table
            .rows()
            .iter()
            .map(|r| r.key.clone().unwrap())
            .collect();
        assert_eq!(keys, vec!["B", "D", "A", "C"]);
        assert_eq!(out.table.totals(), vec![6.0, 6.0, 2.0, 0.0]);
        assert_eq!(out.summary.records_processed, 4);
        assert_eq!(out.summary.rules_executed, 1);
    }

    #[test]
    fn test_rubric_members_retained() {
        let rubric = Arc::new(
            Rubric::builder("rb", "PANEL")
                .rule(tiered(), 2.0, 0)
                .build()
                .unwrap(),
        );
        let out = BatchScorer::default()
            .run(&dataset(), &[], &[rubric])
            .unwrap();
        let labels: Vec<_> = out.table.columns().iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["PANEL_RUBRIC_SCORE", "PANEL.TIER"]);

        let top = &out.table.rows()[0];
        assert!((top.total_score - 12.0).abs() < 1e-12);
        let cell = top.scores["rubric:rb/rule:tier"];
        assert_eq!(cell.weight, Some(2.0));
        assert_eq!(cell.weighted_score, Some(12.0));
    }

    #[test]
    fn test_members_dropped_when_disabled() {
        let rubric = Arc::new(Rubric::builder("rb", "P").rule(tiered(), 1.0, 0).build().unwrap());
        let scorer = BatchScorer::new(BatchOptions::default().with_retain_rubric_members(false));
        let out = scorer.run(&dataset(), &[], &[rubric]).unwrap();
        assert_eq!(out.table.columns().len(), 1);
        assert_eq!(out.table.rows()[0].scores.len(), 1);
    }

    #[test]
    fn test_errors() {
        let scorer = BatchScorer::default();
        assert!(scorer.run(&dataset(), &[], &[]).is_err());

        let empty = Arc::new(Rubric::builder("rb", "E").build().unwrap());
        let err = scorer.run(&dataset(), &[], &[empty]).unwrap_err();
        assert!(err.to_string().contains("no active rules"));

        let keyed = BatchScorer::new(
            BatchOptions::default().with_keys(KeyColumns::new("ensembl_id")),
        );
        assert!(keyed.run(&dataset(), &[tiered()], &[]).is_err());

        assert!(scorer.run(&dataset(), &[tiered(), tiered()], &[]).is_err());
    }

    #[test]
    fn test_record_batch_export() {
        let rubric = Arc::new(Rubric::builder("rb", "P").rule(tiered(), 1.0, 0).build().unwrap());
        let out = BatchScorer::default()
            .run(&dataset(), &[tiered()], &[rubric])
            .unwrap();
        let batch = out.table.to_record_batch().unwrap();
        let names: Vec<_> = batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(
            names,
            vec![
                "gene_symbol",
                "TIER_SCORE",
                "P_RUBRIC_SCORE",
                "P.TIER_score",
                "P.TIER_weight",
                "P.TIER_weighted_score",
                "TOTAL_SCORE"
            ]
        );
        assert_eq!(batch.num_rows(), 4);
    }

    #[test]
    fn test_sort_nan_last() {
        let mk = |i, t| ScoredRecord {
            row_index: i,
            key: None,
            key_2: None,
            scores: BTreeMap::new(),
            total_score: t,
        };
        let mut rows = vec![mk(0, f64::NAN), mk(1, 1.0), mk(2, 3.0), mk(3, 1.0)];
        sort_by_total(&mut rows);
        let order: Vec<_> = rows.iter().map(|r| r.row_index).collect();
        assert_eq!(order, vec![2, 1, 3, 0]);
    }

    fn constant(id: &str, name: &str, score: f64) -> Arc<Rule> {
        Arc::new(
            Rule::builder(id, name)
                .condition(format!("TRUE ~ {score}"))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_label_collisions_rejected() {
        let same_name = [constant("r2", "DUP", 100.0), constant("r3", "DUP", -5.0)];
        let err = BatchScorer::default()
            .run(&dataset(), &same_name, &[])
            .unwrap_err();
        assert!(err.to_string().contains("DUP_SCORE"));

        let total = [constant("r1", "TOTAL", 6.0)];
        let err = BatchScorer::default()
            .run(&dataset(), &total, &[])
            .unwrap_err();
        assert!(err.to_string().contains("TOTAL_SCORE"));
    }

    #[test]
    fn test_distinct_labels_export_unique_fields() {
        let rules = [constant("r2", "HIGH", 100.0), constant("r3", "LOW", -5.0)];
        let out = BatchScorer::default().run(&dataset(), &rules, &[]).unwrap();
        let batch = out.table.to_record_batch().unwrap();
        let schema = batch.schema();
        let mut names: Vec<_> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
        assert_eq!(out.table.totals()[0], 95.0);
    }
}
