use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tripdb_cli::analyses::{self, LargeMemoryTest};
use tripdb_cli::print;
use tripdb_cli::report::{
    run_analysis, write_report, AnalysisOutcome, ColumnReport, LargeMemorySummary, Report,
    TableSource,
};
use tripdb_engine::{
    parse_memory_limit, Engine, EngineConfig, SourceDescriptor, TableOrigin, TEMP_DIRECTORY_ENV,
};

#[derive(Parser, Debug)]
#[command(
    name = "tripdb",
    version,
    about = "Load a taxi trip CSV into a columnar table and run the trip analytics battery"
)]
struct Args {
    /// Trip records (CSV with a header row).
    #[arg(long)]
    input: PathBuf,

    /// Where table files are kept between runs.
    #[arg(long, default_value = "db")]
    data_dir: PathBuf,

    /// Spill directory. Defaults to `$TRIPDB_TEMP_DIRECTORY`, then `<data-dir>/temp`.
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Memory ceiling for queries, e.g. `400MB`, `2GiB` or `unlimited`.
    /// Defaults to `$TRIPDB_MEMORY_LIMIT`, then 400MB.
    #[arg(long)]
    memory_limit: Option<String>,

    /// Run the analysis battery and write a JSON report.
    #[arg(long)]
    analytics: bool,

    /// Also run the larger-than-memory window function test.
    #[arg(long = "large-memory-test")]
    large_memory_test: bool,

    #[arg(long, default_value = "reports")]
    reports_dir: PathBuf,

    /// Ingest the CSV again even when a table file exists.
    #[arg(long)]
    rebuild: bool,

    /// Rows shown from the top of the table.
    #[arg(long, default_value_t = 5)]
    sample_rows: usize,
}

fn config(args: &Args) -> Result<EngineConfig> {
    let mut config = EngineConfig::from_env().context("read engine settings from environment")?;
    if let Some(limit) = &args.memory_limit {
        config.memory_limit_bytes = parse_memory_limit(limit)?;
    }
    if let Some(dir) = &args.temp_dir {
        config.temp_dir = dir.clone();
    } else if std::env::var_os(TEMP_DIRECTORY_ENV).is_none() {
        config.temp_dir = args.data_dir.join("temp");
    }
    config.data_dir = Some(args.data_dir.clone());
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if !args.input.is_file() {
        anyhow::bail!(
            "could not find {} (working directory: {})",
            args.input.display(),
            std::env::current_dir()
                .map(|d| d.display().to_string())
                .unwrap_or_default()
        );
    }

    let config = config(&args)?;
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("create data directory {}", args.data_dir.display()))?;
    let mut engine = Engine::new(config).context("configure engine")?;

    let source = SourceDescriptor::csv_file(&args.input);
    let origin = if args.rebuild {
        let summary = engine
            .ingest(&source)
            .with_context(|| format!("ingest {}", args.input.display()))?;
        engine.persist_table().context("write table file")?;
        TableOrigin::Ingested(summary)
    } else {
        engine
            .open_or_ingest(&source)
            .with_context(|| format!("load {}", args.input.display()))?
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let table_name = engine.table_name().unwrap_or_default().to_owned();
    let row_count = engine.table().map_or(0, |t| t.row_count());
    match &origin {
        TableOrigin::Loaded { path } => writeln!(
            out,
            "Opened {} ({} rows) from {}",
            table_name,
            print::grouped(row_count as u64),
            path.display()
        )?,
        TableOrigin::Ingested(summary) => print::ingest_summary(&mut out, summary)?,
    }

    let columns = engine.describe()?;
    print::schema(&mut out, &columns)?;
    print::sample(&mut out, &engine.sample(args.sample_rows)?)?;
    print::memory(&mut out, &engine.memory_usage())?;

    if !args.analytics && !args.large_memory_test {
        return Ok(());
    }

    let mut report = Report {
        input: args.input.clone(),
        table: table_name,
        generated_at: chrono::Local::now().to_rfc3339(),
        source: match origin {
            TableOrigin::Loaded { path } => TableSource::Loaded { path },
            TableOrigin::Ingested(summary) => TableSource::Ingested { summary },
        },
        row_count,
        schema: columns
            .iter()
            .map(|(name, ty)| ColumnReport {
                name: name.clone(),
                column_type: ty.to_string(),
            })
            .collect(),
        memory_limit_bytes: engine.config().memory_limit_bytes,
        memory: engine.memory_usage(),
        analyses: BTreeMap::new(),
        large_memory_test: None,
    };

    if args.analytics {
        let (outcome, hourly) = run_analysis("hourly_stats", || analyses::trips_by_hour(&engine));
        report.record("hourly_stats", outcome);
        if let Some(rows) = hourly {
            print::hourly(&mut out, &rows)?;
        }

        let (outcome, routes) =
            run_analysis("popular_routes", || analyses::popular_routes(&engine));
        report.record("popular_routes", outcome);
        if let Some(routes) = routes {
            print::routes(&mut out, &routes)?;
        }

        let (outcome, payments) =
            run_analysis("payment_stats", || analyses::payment_methods(&engine));
        report.record("payment_stats", outcome);
        if let Some(rows) = payments {
            print::payments(&mut out, &rows)?;
        }

        let (outcome, days) = run_analysis("day_stats", || analyses::busy_days(&engine));
        report.record("day_stats", outcome);
        if let Some(days) = days {
            print::busy_days(&mut out, &days)?;
        }
    }

    if args.large_memory_test {
        let started = std::time::Instant::now();
        let (outcome, test) =
            run_analysis("large_memory_test", || analyses::large_memory_test(&engine));
        report.large_memory_test = Some(match &test {
            Some(test) => summary_of(test),
            None => LargeMemorySummary {
                success: false,
                duration_seconds: started.elapsed().as_secs_f64(),
                result_count: 0,
            },
        });
        report.record("large_memory_test", outcome);
        if let Some(test) = test {
            print::large_memory(&mut out, &test)?;
        }
    } else {
        report.record(
            "large_memory_test",
            AnalysisOutcome::skipped("pass --large-memory-test to run it"),
        );
    }

    report.memory = engine.memory_usage();
    print::memory(&mut out, &report.memory)?;
    let path = write_report(&args.reports_dir, &report)?;
    writeln!(out, "\nReport written to {}", path.display())?;

    let failed = report.failed_analyses();
    if !failed.is_empty() {
        log::warn!("{} analyses failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

fn summary_of(test: &LargeMemoryTest) -> LargeMemorySummary {
    LargeMemorySummary {
        success: test.success,
        duration_seconds: test.duration_seconds,
        result_count: test.result_count,
    }
}
