//! Per-analysis outcomes and the JSON report written at the end of a run.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tripdb_engine::{IngestSummary, MemoryUsage};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Failed,
    Skipped,
}

/// What happened to one analysis. A failed analysis carries its error chain instead of a result.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnalysisOutcome {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl AnalysisOutcome {
    fn ok(start: Instant, result: serde_json::Value) -> Self {
        Self {
            status: Status::Ok,
            duration_seconds: Some(start.elapsed().as_secs_f64()),
            error: None,
            result: Some(result),
        }
    }

    fn failed(start: Instant, err: &anyhow::Error) -> Self {
        Self {
            status: Status::Failed,
            duration_seconds: Some(start.elapsed().as_secs_f64()),
            error: Some(format!("{err:#}")),
            result: None,
        }
    }

    pub fn skipped(reason: impl ToString) -> Self {
        Self {
            status: Status::Skipped,
            duration_seconds: None,
            error: None,
            result: Some(serde_json::json!({ "reason": reason.to_string() })),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Runs one analysis, converting its result or error into an outcome. The typed result is handed
/// back for printing when the analysis succeeded.
pub fn run_analysis<T, F>(name: &str, analysis: F) -> (AnalysisOutcome, Option<T>)
where
    T: Serialize,
    F: FnOnce() -> Result<T>,
{
    let start = Instant::now();
    let result = analysis().and_then(|value| {
        let json = serde_json::to_value(&value)
            .with_context(|| format!("serialize {name} result"))?;
        Ok((value, json))
    });
    match result {
        Ok((value, json)) => {
            let outcome = AnalysisOutcome::ok(start, json);
            log::info!(
                "{name}: done in {:.2}s",
                outcome.duration_seconds.unwrap_or_default()
            );
            (outcome, Some(value))
        }
        Err(err) => {
            log::error!("{name} failed: {err:#}");
            (AnalysisOutcome::failed(start, &err), None)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ColumnReport {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
}

/// How the table was obtained for this run.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TableSource {
    Loaded { path: PathBuf },
    Ingested { summary: IngestSummary },
}

/// Headline numbers of the larger-than-memory test, present whenever it ran.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LargeMemorySummary {
    pub success: bool,
    pub duration_seconds: f64,
    pub result_count: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Report {
    pub input: PathBuf,
    pub table: String,
    pub generated_at: String,
    pub source: TableSource,
    pub row_count: usize,
    pub schema: Vec<ColumnReport>,
    pub memory_limit_bytes: Option<usize>,
    pub memory: MemoryUsage,
    pub analyses: BTreeMap<String, AnalysisOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_memory_test: Option<LargeMemorySummary>,
}

impl Report {
    pub fn record(&mut self, name: &str, outcome: AnalysisOutcome) {
        self.analyses.insert(name.to_owned(), outcome);
    }

    pub fn failed_analyses(&self) -> Vec<&str> {
        self.analyses
            .iter()
            .filter(|(_, outcome)| outcome.status == Status::Failed)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// `<prefix>_taxi_analytics_<YYYYmmdd_HHMMSS>.json`
pub fn report_file_name(prefix: &str, at: chrono::DateTime<chrono::Local>) -> String {
    format!("{prefix}_taxi_analytics_{}.json", at.format("%Y%m%d_%H%M%S"))
}

/// Writes the report as pretty-printed JSON into `dir`, creating it if needed.
pub fn write_report(dir: &Path, report: &Report) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create reports directory {}", dir.display()))?;
    let path = dir.join(report_file_name("tripdb", chrono::Local::now()));
    let json = serde_json::to_vec_pretty(report).context("serialize report")?;
    std::fs::write(&path, json).with_context(|| format!("write report {}", path.display()))?;
    Ok(path)
}
