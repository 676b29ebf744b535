//! Analysis lifecycle through the engine: submit, query, cache, reopen, delete

use arrow::array::{Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use rubric_engine::analysis::{AnalysisRecord, AnalysisStatus, AnalysisTracker, DatasetSource};
use rubric_engine::config::EngineConfig;
use rubric_engine::rubric::Rubric;
use rubric_engine::rule::Rule;
use rubric_engine::store::PageRequest;
use rubric_engine::topk::SortOrder;
use rubric_engine::{Error, ScoringEngine};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn write_dataset(dir: &Path) -> PathBuf {
    let schema = Arc::new(Schema::new(vec![
        Field::new("gene_symbol", DataType::Utf8, false),
        Field::new("x", DataType::Float64, true),
        Field::new("y", DataType::Float64, true),
    ]));
    let batch = RecordBatch::try_new(
        Arc::clone(&schema),
        vec![
            Arc::new(StringArray::from(vec!["BRCA1", "TP53", "EGFR", "KRAS"])),
            Arc::new(Float64Array::from(vec![Some(0.3), Some(0.9), None, Some(0.05)])),
            Arc::new(Float64Array::from(vec![Some(5.0), Some(1.0), Some(5.0), Some(0.0)])),
        ],
    )
    .unwrap();

    let path = dir.join("genes.parquet");
    let file = File::create(&path).unwrap();
    let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
    path
}

fn panel() -> Arc<Rubric> {
    let tier = Rule::builder("tier", "TIER")
        .condition("x > 0.5 ~ 6")
        .condition("x > 0.1 ~ 2")
        .condition("TRUE ~ 0")
        .map("x", "x")
        .build()
        .unwrap();
    let high_y = Rule::builder("high_y", "HIGH_Y")
        .condition("y >= 5 ~ 1")
        .condition("TRUE ~ 0")
        .map("y", "y")
        .build()
        .unwrap();
    Arc::new(
        Rubric::builder("panel", "PANEL")
            .rule(tier, 2.0, 0)
            .rule(high_y, 1.0, 1)
            .build()
            .unwrap(),
    )
}

fn engine(storage: &Path) -> ScoringEngine {
    let config = EngineConfig::default()
        .with_storage_dir(storage)
        .with_top_records(2);
    ScoringEngine::builder().config(config).build().unwrap()
}

fn keys(rows: &[rubric_engine::batch::ScoredRecord]) -> Vec<&str> {
    rows.iter().filter_map(|r| r.key.as_deref()).collect()
}

#[tokio::test]
async fn test_full_lifecycle() {
    let temp = TempDir::new().unwrap();
    let dataset = write_dataset(temp.path());
    let storage = temp.path().join("store");
    let engine = engine(&storage);

    let request = engine
        .request("panel run", DatasetSource::Parquet(dataset))
        .with_rubric(panel());
    let handle = engine.submit(request).unwrap();
    let id = handle.id().to_string();
    let record = handle.wait().await.unwrap();

    assert_eq!(record.status(), AnalysisStatus::Completed);
    assert_eq!(record.records_processed(), 4);
    assert_eq!(record.rules_executed(), 2);
    assert_eq!(engine.status(&id).unwrap().status(), AnalysisStatus::Completed);
    assert_eq!(engine.list_analyses(Some(AnalysisStatus::Completed)).len(), 1);
    assert!(engine.list_analyses(Some(AnalysisStatus::Failed)).is_empty());

    // Ranked pages
    let first = engine.get_results(&id, &PageRequest::new(2, 0)).unwrap();
    assert_eq!(first.total, 4);
    assert!(first.has_more);
    assert_eq!(keys(&first.rows), vec!["TP53", "BRCA1"]);
    let second = engine.get_results(&id, &PageRequest::new(2, 2)).unwrap();
    assert!(!second.has_more);
    assert_eq!(keys(&second.rows), vec!["EGFR", "KRAS"]);
    let totals: Vec<f64> = first
        .rows
        .iter()
        .chain(&second.rows)
        .map(|r| r.total_score)
        .collect();
    assert_eq!(totals, vec![12.0, 5.0, 1.0, 0.0]);

    // Sorting by a member column keeps ties in ranked order
    let by_member = engine
        .get_results(
            &id,
            &PageRequest::new(10, 0).sort_by("rubric:panel/rule:high_y", SortOrder::Ascending),
        )
        .unwrap();
    assert_eq!(keys(&by_member.rows), vec!["TP53", "KRAS", "BRCA1", "EGFR"]);

    let found = engine.lookup(&id, &["EGFR", "TP53", "MYC"]).unwrap();
    assert_eq!(keys(&found), vec!["TP53", "EGFR"]);

    let summary = engine.get_summary(&id).unwrap();
    assert_eq!(summary.total_records, 4);
    assert_eq!(summary.total_rules, 2);
    assert_eq!(keys(&summary.top_records), vec!["TP53", "BRCA1"]);
    assert_eq!(summary.score_statistics.count, 4);
    assert_eq!(summary.score_statistics.max, Some(12.0));

    let artifact = engine.get_or_build_cache(&id).await.unwrap();
    assert_eq!(artifact.metadata.analysis_id, id);
    assert_eq!(artifact.metadata.row_count, 4);
    assert_eq!(artifact.snapshot.rows.len(), 4);
    assert!(artifact.statistics.contains_key("TOTAL_SCORE"));
    let total_hist = &artifact.histograms["TOTAL_SCORE"];
    assert_eq!(total_hist.counts.iter().sum::<usize>(), 4);

    // Reopen over the same directory
    drop(engine);
    let reopened = self::engine(&storage);
    assert_eq!(reopened.status(&id).unwrap().status(), AnalysisStatus::Completed);
    let page = reopened.get_results(&id, &PageRequest::new(10, 0)).unwrap();
    assert_eq!(keys(&page.rows), vec!["TP53", "BRCA1", "EGFR", "KRAS"]);
    assert_eq!(page.rows[0].score("rubric:panel"), Some(12.0));
    let cached = reopened.get_or_build_cache(&id).await.unwrap();
    assert_eq!(cached.snapshot, artifact.snapshot);

    assert!(reopened.delete_analysis(&id).await.unwrap());
    assert!(matches!(
        reopened.status(&id),
        Err(Error::AnalysisNotFound(_))
    ));
    assert!(reopened.get_results(&id, &PageRequest::new(10, 0)).is_err());
    assert!(!reopened.delete_analysis(&id).await.unwrap());
}

#[tokio::test]
async fn test_failed_analysis_is_recorded() {
    let temp = TempDir::new().unwrap();
    let dataset = write_dataset(temp.path());
    let engine = engine(&temp.path().join("store"));

    let handle = engine
        .submit(engine.request("empty", DatasetSource::Parquet(dataset)))
        .unwrap();
    let id = handle.id().to_string();
    let record = handle.wait().await.unwrap();

    assert_eq!(record.status(), AnalysisStatus::Failed);
    assert!(record
        .error_message()
        .is_some_and(|m| m.contains("no rules or rubrics")));
    assert_eq!(engine.list_analyses(Some(AnalysisStatus::Failed)).len(), 1);
    assert!(matches!(
        engine.get_results(&id, &PageRequest::new(10, 0)),
        Err(Error::InvalidInput(_))
    ));
    assert!(engine.delete_analysis(&id).await.unwrap());
}

#[tokio::test]
async fn test_missing_dataset_fails_analysis() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp.path().join("store"));

    let request = engine
        .request(
            "missing",
            DatasetSource::Parquet(temp.path().join("absent.parquet")),
        )
        .with_rubric(panel());
    let record = engine.submit(request).unwrap().wait().await.unwrap();
    assert_eq!(record.status(), AnalysisStatus::Failed);
    assert!(record.error_message().is_some());
}

#[tokio::test]
async fn test_in_memory_engine_has_no_files() {
    let temp = TempDir::new().unwrap();
    let dataset = write_dataset(temp.path());
    let engine = ScoringEngine::builder().build().unwrap();

    let request = engine
        .request("mem", DatasetSource::Parquet(dataset))
        .with_rubric(panel());
    let record = engine.submit(request).unwrap().wait().await.unwrap();
    assert_eq!(record.status(), AnalysisStatus::Completed);
    assert_eq!(
        record.storage_location(),
        Some(format!("memory://{}", record.id()).as_str())
    );
    assert!(!temp.path().join("store").exists());
}

#[tokio::test]
async fn test_cache_rebuilt_after_entries_removed() {
    let temp = TempDir::new().unwrap();
    let dataset = write_dataset(temp.path());
    let storage = temp.path().join("store");
    let engine = engine(&storage);

    let request = engine
        .request("panel run", DatasetSource::Parquet(dataset))
        .with_rubric(panel());
    let record = engine.submit(request).unwrap().wait().await.unwrap();
    let id = record.id().to_string();
    let built = engine.get_or_build_cache(&id).await.unwrap();

    let cache_dir = storage.join("cache");
    let meta = cache_dir.join(format!("meta_{id}"));
    let histograms = cache_dir.join(format!("histograms_{id}"));
    assert!(meta.exists());
    std::fs::remove_file(&meta).unwrap();
    std::fs::remove_file(&histograms).unwrap();

    let rebuilt = engine.get_or_build_cache(&id).await.unwrap();
    assert!(meta.exists());
    assert!(histograms.exists());
    assert_eq!(rebuilt.snapshot, built.snapshot);
    assert_eq!(rebuilt.metadata.row_count, 4);
    assert_eq!(
        rebuilt.histograms["TOTAL_SCORE"].counts.iter().sum::<usize>(),
        4
    );
}

#[tokio::test]
async fn test_clashing_labels_fail_analysis() {
    let temp = TempDir::new().unwrap();
    let dataset = write_dataset(temp.path());
    let engine = engine(&temp.path().join("store"));

    let tier = |id: &str| {
        Arc::new(
            Rule::builder(id, "TIER")
                .condition("x > 0.5 ~ 1")
                .map("x", "x")
                .build()
                .unwrap(),
        )
    };
    let request = engine
        .request("clash", DatasetSource::Parquet(dataset))
        .with_rule(tier("tier_a"))
        .with_rule(tier("tier_b"));
    let handle = engine.submit(request).unwrap();
    let id = handle.id().to_string();
    let record = handle.wait().await.unwrap();

    assert_eq!(record.status(), AnalysisStatus::Failed);
    assert!(record
        .error_message()
        .is_some_and(|m| m.contains("TIER_SCORE")));
    assert!(matches!(
        engine.get_results(&id, &PageRequest::new(10, 0)),
        Err(Error::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_delete_refuses_running_analysis() {
    let temp = TempDir::new().unwrap();
    let storage = temp.path().join("store");

    // A record left Running by a job that has not finished
    {
        let tracker = AnalysisTracker::open(storage.join("analyses")).unwrap();
        tracker.insert(AnalysisRecord::new("busy", "busy")).unwrap();
        tracker.start("busy").unwrap();
    }

    let engine = engine(&storage);
    assert_eq!(engine.status("busy").unwrap().status(), AnalysisStatus::Running);
    assert!(matches!(
        engine.delete_analysis("busy").await,
        Err(Error::InvalidInput(_))
    ));
    assert_eq!(engine.status("busy").unwrap().status(), AnalysisStatus::Running);
    assert!(storage.join("analyses").join("busy.json").exists());
}
