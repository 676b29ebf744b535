//! Property-based tests for scoring invariants
//!
//! - Run with ProptestConfig::with_cases(100)
//! - Each property builds its own small dataset

use arrow::array::{Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use proptest::prelude::*;
use rubric_engine::batch::BatchScorer;
use rubric_engine::config::HistogramBins;
use rubric_engine::dataset::Dataset;
use rubric_engine::rubric::{AggregationMode, Rubric};
use rubric_engine::rule::Rule;
use rubric_engine::stats::Histogram;
use rubric_engine::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Strategies
// ============================================================================

/// Optional measurement, sometimes null or NaN
fn arb_measurement() -> impl Strategy<Value = Option<f64>> {
    prop_oneof![
        8 => (-10.0f64..10.0).prop_map(Some),
        1 => Just(None),
        1 => Just(Some(f64::NAN)),
    ]
}

/// Ascending thresholds with a score each
fn arb_clauses() -> impl Strategy<Value = Vec<(f64, f64)>> {
    prop::collection::vec((-10.0f64..10.0, 0.0f64..10.0), 1..6)
}

fn dataset(values: &[Option<f64>]) -> Dataset {
    let schema = Schema::new(vec![
        Field::new("gene_symbol", DataType::Utf8, false),
        Field::new("x", DataType::Float64, true),
    ]);
    let keys: Vec<String> = (0..values.len()).map(|i| format!("G{i}")).collect();
    let batch = RecordBatch::try_new(
        Arc::new(schema),
        vec![
            Arc::new(StringArray::from(keys)),
            Arc::new(Float64Array::from(values.to_vec())),
        ],
    )
    .unwrap();
    Dataset::from_batch(batch).unwrap()
}

fn threshold_rule(clauses: &[(f64, f64)], catch_all: bool) -> Rule {
    let mut builder = Rule::builder("r", "R").map("x", "x");
    for (threshold, score) in clauses {
        builder = builder.condition(format!("x > {threshold} ~ {score}"));
    }
    if catch_all {
        builder = builder.condition("TRUE ~ 0");
    }
    builder.build().unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: the score is that of the first true clause, else 0
    #[test]
    fn prop_first_match_wins(
        clauses in arb_clauses(),
        x in arb_measurement(),
        catch_all in any::<bool>()
    ) {
        let rule = threshold_rule(&clauses, catch_all);
        let value = x.map_or(Value::Null, Value::from);
        let record = HashMap::from([("x".to_string(), value)]);

        let expected = x
            .filter(|v| !v.is_nan())
            .and_then(|v| clauses.iter().find(|(t, _)| v > *t))
            .map_or(0.0, |(_, s)| *s);
        let score = rule.score(&record);
        prop_assert!(score.is_some());
        prop_assert!((score.unwrap() - expected).abs() < 1e-9);
    }

    /// Property: null or NaN bindings never make a predicate true
    #[test]
    fn prop_null_never_matches(clauses in arb_clauses()) {
        let rule = threshold_rule(&clauses, false);
        for value in [Value::Null, Value::from(f64::NAN)] {
            let record = HashMap::from([("x".to_string(), value)]);
            prop_assert_eq!(rule.score(&record), Some(0.0));
        }
    }

    /// Property: weighted total is the weighted sum with nulls as zero;
    /// unweighted total is the plain sum
    #[test]
    fn prop_rubric_totals(
        members in prop::collection::vec((prop::option::of(0.0f64..10.0), 0.0f64..5.0), 1..6)
    ) {
        let mut builder = Rubric::builder("rb", "RB");
        for (i, (score, weight)) in members.iter().enumerate() {
            let literal = score.map_or_else(|| "NA".to_string(), |s| s.to_string());
            let rule = Rule::builder(format!("r{i}"), format!("R{i}"))
                .condition(format!("TRUE ~ {literal}"))
                .build()
                .unwrap();
            builder = builder.rule(Arc::new(rule), *weight, i as i64);
        }
        let rubric = builder.build().unwrap();
        let record: HashMap<String, Value> = HashMap::new();

        let weighted: f64 = members.iter().map(|(s, w)| s.unwrap_or(0.0) * w).sum();
        let plain: f64 = members.iter().map(|(s, _)| s.unwrap_or(0.0)).sum();
        prop_assert!((rubric.score(&record, AggregationMode::Weighted) - weighted).abs() < 1e-9);
        prop_assert!((rubric.score(&record, AggregationMode::Unweighted) - plain).abs() < 1e-9);
    }

    /// Property: batch rows are sorted by total descending, ties in input order
    #[test]
    fn prop_batch_sorted_stable(
        values in prop::collection::vec(arb_measurement(), 1..60),
        clauses in arb_clauses()
    ) {
        let rule = Arc::new(threshold_rule(&clauses, true));
        let out = BatchScorer::default().run(&dataset(&values), &[rule], &[]).unwrap();
        let rows = out.table.rows();
        prop_assert_eq!(rows.len(), values.len());
        for pair in rows.windows(2) {
            prop_assert!(pair[0].total_score >= pair[1].total_score);
            if (pair[0].total_score - pair[1].total_score).abs() < f64::EPSILON {
                prop_assert!(pair[0].row_index < pair[1].row_index);
            }
        }
    }

    /// Property: re-running the same batch gives the same table
    #[test]
    fn prop_batch_deterministic(
        values in prop::collection::vec(arb_measurement(), 1..40),
        clauses in arb_clauses()
    ) {
        let rule = Arc::new(threshold_rule(&clauses, true));
        let data = dataset(&values);
        let first = BatchScorer::default().run(&data, &[Arc::clone(&rule)], &[]).unwrap();
        let second = BatchScorer::default().run(&data, &[rule], &[]).unwrap();
        prop_assert_eq!(first.table, second.table);
    }

    /// Property: histogram counts sum to the number of finite values
    #[test]
    fn prop_histogram_sums_to_valid(values in prop::collection::vec(arb_measurement(), 0..300)) {
        let valid = values.iter().filter(|v| v.is_some_and(f64::is_finite)).count();
        let h = Histogram::compute(values, HistogramBins::default());
        prop_assert_eq!(h.counts.iter().sum::<usize>(), valid);
        if valid > 0 {
            prop_assert!(h.counts.len() >= 10 && h.counts.len() <= 50);
        }
    }
}
