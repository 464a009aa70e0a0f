use crate::aggregate::{run_aggregate, AggregateQuery, AggregateResult};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::expr::ScalarExpr;
use crate::ingest::{ingest_csv, IngestSummary, SourceDescriptor};
use crate::memory::{MemoryBudget, MemoryUsage};
use crate::query::{CancellationToken, ProgressObserver, QueryContext, QueryStats};
use crate::schema::InferredSchema;
use crate::window::{
    moving_average_into, percentile_tile_into, rank_within_partition_into, RankMode,
    SortDirection, WindowOutput,
};
#[cfg(feature = "persist")]
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tripdb_columnar::{ColumnType, ColumnarTable, Value};

/// How [`Engine::open_or_ingest`] obtained its table.
#[derive(Clone, Debug)]
pub enum TableOrigin {
    /// Read from a table file written by an earlier run.
    Loaded { path: PathBuf },
    Ingested(IngestSummary),
}

struct LoadedTable {
    name: String,
    table: Arc<ColumnarTable>,
    schema: Option<InferredSchema>,
}

/// Owns the active table and the memory budget every query runs under.
///
/// The table is immutable once installed; queries take `&self` and can be cancelled from another
/// thread through [`Engine::cancellation_token`].
pub struct Engine {
    config: EngineConfig,
    budget: Arc<MemoryBudget>,
    cancel: CancellationToken,
    progress: Option<ProgressObserver>,
    table: Option<LoadedTable>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let budget = Arc::new(MemoryBudget::new(
            config.memory_limit_bytes,
            config.temp_dir.clone(),
        ));
        log::debug!(
            "engine: memory limit {}, temp dir {}",
            config
                .memory_limit_bytes
                .map_or_else(|| "unlimited".to_owned(), |b| format!("{b} bytes")),
            config.temp_dir.display()
        );
        Ok(Self {
            config,
            budget,
            cancel: CancellationToken::new(),
            progress: None,
            table: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        self.budget.usage()
    }

    /// Token shared with every query this engine runs. Cancelling it makes the running query
    /// return [`EngineError::Cancelled`]; call [`CancellationToken::reset`] before the next one.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Observer called once per processed batch during ingestion and queries.
    pub fn set_progress_observer(&mut self, observer: Option<ProgressObserver>) {
        self.progress = observer;
    }

    pub fn table(&self) -> Option<&Arc<ColumnarTable>> {
        self.table.as_ref().map(|t| &t.table)
    }

    pub fn table_name(&self) -> Option<&str> {
        self.table.as_ref().map(|t| t.name.as_str())
    }

    /// Schema inferred when the active table was ingested (absent for loaded tables).
    pub fn inferred_schema(&self) -> Option<&InferredSchema> {
        self.table.as_ref().and_then(|t| t.schema.as_ref())
    }

    pub fn set_table(&mut self, name: impl Into<String>, table: Arc<ColumnarTable>) {
        self.table = Some(LoadedTable {
            name: name.into(),
            table,
            schema: None,
        });
    }

    fn active(&self) -> EngineResult<&Arc<ColumnarTable>> {
        self.table().ok_or(EngineError::NoTable)
    }

    fn context(&self) -> QueryContext {
        QueryContext {
            budget: self.budget.clone(),
            cancel: self.cancel.clone(),
            progress: self.progress.clone(),
            max_merge_fan_in: self.config.max_merge_fan_in,
            parallelism: self.config.parallelism,
        }
    }

    /// Ingest `source` and make it the active table. On failure the previous table (if any)
    /// stays active.
    pub fn ingest(&mut self, source: &SourceDescriptor) -> EngineResult<IngestSummary> {
        let ingested = ingest_csv(source, &self.config, &self.cancel, self.progress.as_ref())?;
        self.table = Some(LoadedTable {
            name: source.table_name(),
            table: Arc::new(ingested.table),
            schema: Some(ingested.schema),
        });
        Ok(ingested.summary)
    }

    fn table_path(&self, name: &str) -> Option<PathBuf> {
        self.config
            .data_dir
            .as_ref()
            .map(|dir| dir.join(format!("{name}.arrow")))
    }

    /// Reuse the table file for `source` when one exists in the data directory, otherwise ingest
    /// it and write the file for next time.
    pub fn open_or_ingest(&mut self, source: &SourceDescriptor) -> EngineResult<TableOrigin> {
        let name = source.table_name();
        if cfg!(feature = "persist") {
            if let Some(path) = self.table_path(&name).filter(|p| p.is_file()) {
                match self.load_table(&name) {
                    Ok(()) => return Ok(TableOrigin::Loaded { path }),
                    Err(err) => log::warn!(
                        "could not load {}, ingesting again: {err}",
                        path.display()
                    ),
                }
            }
        }
        let summary = self.ingest(source)?;
        if cfg!(feature = "persist") && self.config.data_dir.is_some() {
            self.persist_table()?;
        }
        Ok(TableOrigin::Ingested(summary))
    }

    /// Write the active table to `<data_dir>/<table name>.arrow`.
    #[cfg(feature = "persist")]
    pub fn persist_table(&self) -> EngineResult<PathBuf> {
        let loaded = self.table.as_ref().ok_or(EngineError::NoTable)?;
        let path = self.table_path(&loaded.name).ok_or_else(|| {
            EngineError::InvalidArgument("no data directory configured".into())
        })?;
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        std::fs::create_dir_all(dir)?;
        // Written beside the target, then renamed into place.
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        let mut writer = BufWriter::new(file.as_file_mut());
        tripdb_columnar::arrow::write_table_ipc(&loaded.table, &mut writer)?;
        writer.flush()?;
        drop(writer);
        file.persist(&path).map_err(|err| err.error)?;
        log::info!(
            "persisted {} ({} rows) to {}",
            loaded.name,
            loaded.table.row_count(),
            path.display()
        );
        Ok(path)
    }

    #[cfg(not(feature = "persist"))]
    pub fn persist_table(&self) -> EngineResult<PathBuf> {
        Err(EngineError::InvalidArgument(
            "table files need the `persist` feature".into(),
        ))
    }

    /// Make the table file `<data_dir>/<name>.arrow` the active table.
    #[cfg(feature = "persist")]
    pub fn load_table(&mut self, name: &str) -> EngineResult<()> {
        let path = self.table_path(name).ok_or_else(|| {
            EngineError::InvalidArgument("no data directory configured".into())
        })?;
        let file = std::fs::File::open(&path).map_err(|source| EngineError::SourceUnavailable {
            path: path.clone(),
            source,
        })?;
        let table = tripdb_columnar::arrow::read_table_ipc(
            std::io::BufReader::new(file),
            tripdb_columnar::TableOptions {
                page_size_rows: self.config.page_size_rows,
            },
        )?;
        log::info!(
            "loaded {name} ({} rows) from {}",
            table.row_count(),
            path.display()
        );
        self.set_table(name, Arc::new(table));
        Ok(())
    }

    #[cfg(not(feature = "persist"))]
    pub fn load_table(&mut self, _name: &str) -> EngineResult<()> {
        Err(EngineError::InvalidArgument(
            "table files need the `persist` feature".into(),
        ))
    }

    pub fn describe(&self) -> EngineResult<Vec<(String, ColumnType)>> {
        Ok(self.active()?.describe())
    }

    /// The first `n` rows of the active table.
    pub fn sample(&self, n: usize) -> EngineResult<Vec<Vec<Value>>> {
        let table = self.active()?;
        let rows = n.min(table.row_count());
        Ok((0..rows)
            .map(|r| (0..table.column_count()).map(|c| table.get_cell(r, c)).collect())
            .collect())
    }

    pub fn aggregate(&self, query: &AggregateQuery) -> EngineResult<AggregateResult> {
        run_aggregate(self.active()?, query, &self.context())
    }

    /// Rank rows within each `partition` value by `order`. Results are `(row_id, rank)` ordered
    /// by partition, then rank.
    pub fn rank_within_partition(
        &self,
        partition: &ScalarExpr,
        order: &ScalarExpr,
        direction: SortDirection,
        mode: RankMode,
    ) -> EngineResult<WindowOutput<u64>> {
        let mut rows = Vec::new();
        let stats = self.rank_within_partition_into(partition, order, direction, mode, |row, rank| {
            rows.push((row, rank))
        })?;
        Ok(WindowOutput { rows, stats })
    }

    /// Streaming form of [`Engine::rank_within_partition`].
    pub fn rank_within_partition_into<F>(
        &self,
        partition: &ScalarExpr,
        order: &ScalarExpr,
        direction: SortDirection,
        mode: RankMode,
        sink: F,
    ) -> EngineResult<QueryStats>
    where
        F: FnMut(u64, u64),
    {
        rank_within_partition_into(
            self.active()?,
            partition,
            order,
            direction,
            mode,
            &self.context(),
            sink,
        )
    }

    /// Centered moving average of `value` over `[i - radius, i + radius]` in `order`.
    pub fn moving_average(
        &self,
        order: &ScalarExpr,
        value: &ScalarExpr,
        radius: usize,
    ) -> EngineResult<WindowOutput<Option<f64>>> {
        let mut rows = Vec::new();
        let stats =
            self.moving_average_into(order, value, radius, |row, avg| rows.push((row, avg)))?;
        Ok(WindowOutput { rows, stats })
    }

    pub fn moving_average_into<F>(
        &self,
        order: &ScalarExpr,
        value: &ScalarExpr,
        radius: usize,
        sink: F,
    ) -> EngineResult<QueryStats>
    where
        F: FnMut(u64, Option<f64>),
    {
        moving_average_into(self.active()?, order, value, radius, &self.context(), sink)
    }

    /// NTILE over ascending `order`: tile numbers `1..=tiles`.
    pub fn percentile_tile(
        &self,
        order: &ScalarExpr,
        tiles: u32,
    ) -> EngineResult<WindowOutput<u32>> {
        let mut rows = Vec::new();
        let stats = self.percentile_tile_into(order, tiles, |row, tile| rows.push((row, tile)))?;
        Ok(WindowOutput { rows, stats })
    }

    pub fn percentile_tile_into<F>(
        &self,
        order: &ScalarExpr,
        tiles: u32,
        sink: F,
    ) -> EngineResult<QueryStats>
    where
        F: FnMut(u64, u32),
    {
        percentile_tile_into(self.active()?, order, tiles, &self.context(), sink)
    }
}
