//! rubric-runner: score a Parquet dataset against rules and rubrics.
//!
//! Reads an analysis file (JSON) naming the dataset, rule and rubric
//! definitions, then either prints a compatibility report (`--dry-run`) or
//! runs the analysis and prints its summary as JSON.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use rubric_engine::analysis::{AnalysisStatus, DatasetSource};
use rubric_engine::config::{EngineConfig, KeyColumns};
use rubric_engine::dataset::Dataset;
use rubric_engine::rubric::{
    check_compatibility, check_rules, AggregationMode, CompatibilityReport, Rubric,
    RubricDefinition,
};
use rubric_engine::rule::{Rule, RuleDefinition};
use rubric_engine::ScoringEngine;

// ── CLI ─────────────────────────────────────────────────────────────

/// Score a dataset against rules and rubrics.
#[derive(Parser, Debug)]
#[command(name = "rubric-runner", version, about)]
struct Cli {
    /// Path to the analysis JSON file.
    analysis: PathBuf,

    /// Directory for result tables, analysis records and cache.
    #[arg(long, env = "RUBRIC_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Engine configuration JSON file.
    #[arg(long, env = "RUBRIC_ENGINE_CONFIG")]
    config: Option<PathBuf>,

    /// Only check rule columns against the dataset.
    #[arg(long)]
    dry_run: bool,

    /// Number of top records in the summary.
    #[arg(long)]
    top: Option<usize>,

    /// Debug logging (overridden by RUST_LOG).
    #[arg(short, long)]
    verbose: bool,
}

// ── Analysis file ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AnalysisFile {
    name: String,
    /// Parquet path, relative to the analysis file
    dataset: PathBuf,
    #[serde(default)]
    rules: Vec<RuleDefinition>,
    #[serde(default)]
    rubrics: Vec<RubricDefinition>,
    /// Rule ids scored on their own, outside any rubric
    #[serde(default)]
    standalone_rules: Vec<String>,
    #[serde(default)]
    mode: Option<AggregationMode>,
    #[serde(default)]
    keys: Option<KeyColumns>,
}

#[derive(Debug, Serialize)]
struct DryRunReport {
    dataset: String,
    columns: usize,
    rubrics: BTreeMap<String, CompatibilityReport>,
    standalone_rules: Option<CompatibilityReport>,
}

struct Resolved {
    dataset: PathBuf,
    standalone: Vec<Arc<Rule>>,
    rubrics: Vec<Arc<Rubric>>,
}

fn resolve(file: &AnalysisFile, base: &Path) -> anyhow::Result<Resolved> {
    let mut catalog: BTreeMap<String, Arc<Rule>> = BTreeMap::new();
    for def in &file.rules {
        let rule = Rule::try_from(def.clone())
            .with_context(|| format!("rule {} is invalid", def.id))?;
        if catalog.insert(def.id.clone(), Arc::new(rule)).is_some() {
            bail!("rule {} is defined twice", def.id);
        }
    }

    let rubrics = file
        .rubrics
        .iter()
        .map(|def| {
            Rubric::from_definition(def, &catalog)
                .map(Arc::new)
                .with_context(|| format!("rubric {} is invalid", def.id))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let standalone = file
        .standalone_rules
        .iter()
        .map(|id| {
            catalog
                .get(id)
                .cloned()
                .with_context(|| format!("standalone rule {id} is not defined"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let dataset = if file.dataset.is_absolute() {
        file.dataset.clone()
    } else {
        base.join(&file.dataset)
    };
    Ok(Resolved {
        dataset,
        standalone,
        rubrics,
    })
}

fn dry_run(resolved: &Resolved) -> anyhow::Result<DryRunReport> {
    let dataset = Dataset::load_parquet(&resolved.dataset)
        .with_context(|| format!("cannot read {}", resolved.dataset.display()))?;
    let columns = dataset.column_names();

    let rubrics = resolved
        .rubrics
        .iter()
        .map(|r| (r.id().to_string(), check_compatibility(r, &columns)))
        .collect();
    let standalone_rules = (!resolved.standalone.is_empty())
        .then(|| check_rules(resolved.standalone.iter().map(Arc::as_ref), &columns));

    Ok(DryRunReport {
        dataset: resolved.dataset.display().to_string(),
        columns: columns.len(),
        rubrics,
        standalone_rules,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let text = std::fs::read_to_string(&cli.analysis)
        .with_context(|| format!("cannot read {}", cli.analysis.display()))?;
    let file: AnalysisFile = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid analysis file", cli.analysis.display()))?;
    let base = cli.analysis.parent().unwrap_or_else(|| Path::new("."));
    let resolved = resolve(&file, base)?;

    if resolved.standalone.is_empty() && resolved.rubrics.is_empty() {
        bail!("analysis {} has no rubrics or standalone rules", file.name);
    }

    if cli.dry_run {
        let report = dry_run(&resolved)?;
        let invalid = report.rubrics.values().filter(|r| !r.is_valid()).count();
        if invalid > 0 {
            warn!(rubrics = invalid, "rubrics with no compatible rules");
        }
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = &cli.output_dir {
        config.storage_dir = Some(dir.clone());
    }
    if let Some(mode) = file.mode {
        config.aggregation_mode = mode;
    }
    if let Some(keys) = file.keys.clone() {
        config.keys = keys;
    }
    if let Some(top) = cli.top {
        config.top_records = top;
    }
    if config.storage_dir.is_none() {
        warn!("no --output-dir given, results are kept in memory only");
    }

    let engine = ScoringEngine::builder().config(config).build()?;
    let mut request =
        engine.request(&file.name, DatasetSource::Parquet(resolved.dataset.clone()));
    request.rules = resolved.standalone;
    request.rubrics = resolved.rubrics;

    let handle = engine.submit(request)?;
    info!(analysis_id = handle.id(), "analysis submitted");
    let record = handle.wait().await?;

    if record.status() != AnalysisStatus::Completed {
        bail!(
            "analysis {} failed: {}",
            record.id(),
            record.error_message().unwrap_or("unknown error")
        );
    }

    let summary = engine.get_summary(record.id())?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
