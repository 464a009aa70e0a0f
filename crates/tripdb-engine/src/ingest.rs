//! CSV ingestion into a [`ColumnarTable`].
//!
//! A reader thread parses records into fixed-size batches and hands them over a bounded channel;
//! the calling thread coerces fields to the inferred schema and appends them. The channel bound
//! is the backpressure: at most `max_in_flight_batches` parsed batches exist at any time.

use crate::config::{EngineConfig, MalformedRowPolicy};
use crate::error::{EngineError, EngineResult};
use crate::query::{CancellationToken, Progress, ProgressObserver, Stage};
use crate::schema::{coerce_field, infer_schema, InferredSchema};
use csv::ByteRecord;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tripdb_columnar::{ColumnType, ColumnarTable, ColumnarTableBuilder, TableOptions, Value};

/// Rejected records logged individually before going quiet.
const LOGGED_REJECTIONS: u64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CsvOptions {
    pub delimiter: u8,
    pub has_header: bool,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            has_header: true,
        }
    }
}

/// Where raw records come from.
#[derive(Clone, Debug)]
pub enum SourceDescriptor {
    CsvFile {
        path: PathBuf,
        options: CsvOptions,
    },
    CsvBytes {
        name: String,
        data: Arc<[u8]>,
        options: CsvOptions,
    },
}

impl SourceDescriptor {
    pub fn csv_file(path: impl Into<PathBuf>) -> Self {
        SourceDescriptor::CsvFile {
            path: path.into(),
            options: CsvOptions::default(),
        }
    }

    pub fn csv_bytes(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        let data: Vec<u8> = data.into();
        SourceDescriptor::CsvBytes {
            name: name.into(),
            data: Arc::from(data),
            options: CsvOptions::default(),
        }
    }

    pub fn with_options(mut self, new_options: CsvOptions) -> Self {
        match &mut self {
            SourceDescriptor::CsvFile { options, .. }
            | SourceDescriptor::CsvBytes { options, .. } => *options = new_options,
        }
        self
    }

    pub fn with_delimiter(self, delimiter: u8) -> Self {
        let options = CsvOptions {
            delimiter,
            ..self.options()
        };
        self.with_options(options)
    }

    pub fn with_header(self, has_header: bool) -> Self {
        let options = CsvOptions {
            has_header,
            ..self.options()
        };
        self.with_options(options)
    }

    pub fn options(&self) -> CsvOptions {
        match self {
            SourceDescriptor::CsvFile { options, .. }
            | SourceDescriptor::CsvBytes { options, .. } => *options,
        }
    }

    /// Short identity of the source: the file stem, or the name given to an in-memory buffer.
    pub fn name(&self) -> String {
        match self {
            SourceDescriptor::CsvFile { path, .. } => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "source".to_owned()),
            SourceDescriptor::CsvBytes { name, .. } => name.clone(),
        }
    }

    /// Name of the persisted table for this source.
    pub fn table_name(&self) -> String {
        format!("taxi_data_{}", self.name())
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            SourceDescriptor::CsvFile { path, .. } => Some(path),
            SourceDescriptor::CsvBytes { .. } => None,
        }
    }

    fn open(&self) -> EngineResult<Box<dyn Read + Send>> {
        match self {
            SourceDescriptor::CsvFile { path, .. } => {
                let file = File::open(path).map_err(|source| EngineError::SourceUnavailable {
                    path: path.clone(),
                    source,
                })?;
                Ok(Box::new(BufReader::new(file)))
            }
            SourceDescriptor::CsvBytes { data, .. } => Ok(Box::new(Cursor::new(data.clone()))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IngestSummary {
    pub source: String,
    pub success: bool,
    pub duration: Duration,
    pub row_count: u64,
    /// Records that had unparseable fields or too many fields.
    pub rejected_count: u64,
    /// Fields stored as null because they failed coercion.
    pub null_fields: u64,
    pub policy: MalformedRowPolicy,
    pub batches: u64,
    pub rows_per_second: f64,
    pub warnings: Vec<String>,
}

pub(crate) struct Ingested {
    pub table: ColumnarTable,
    pub schema: InferredSchema,
    pub summary: IngestSummary,
}

struct RowSink {
    types: Vec<ColumnType>,
    builder: ColumnarTableBuilder,
    row: Vec<Value>,
    policy: MalformedRowPolicy,
    records: u64,
    rejected: u64,
    null_fields: u64,
}

impl RowSink {
    fn push(&mut self, record: &ByteRecord) -> EngineResult<()> {
        self.records += 1;
        let mut failed = 0u64;
        for (i, ty) in self.types.iter().enumerate() {
            self.row[i] = match record.get(i) {
                None => Value::Null,
                Some(raw) => coerce_field(raw, *ty).unwrap_or_else(|()| {
                    failed += 1;
                    Value::Null
                }),
            };
        }
        let extra = record.len().saturating_sub(self.types.len());
        if failed > 0 || extra > 0 {
            self.rejected += 1;
            if self.rejected <= LOGGED_REJECTIONS {
                log::warn!(
                    "record {}: {failed} unparseable fields, {extra} extra fields ({:?})",
                    self.records,
                    self.policy
                );
            }
            if self.policy == MalformedRowPolicy::Reject {
                return Ok(());
            }
            self.null_fields += failed;
        }
        self.builder.append_row(&self.row)?;
        Ok(())
    }
}

type BatchMessage = EngineResult<Vec<ByteRecord>>;

fn consume(
    rx: &Receiver<BatchMessage>,
    sink: &mut RowSink,
    batches: &mut u64,
    cancel: &CancellationToken,
    progress: Option<&ProgressObserver>,
) -> EngineResult<()> {
    for batch in rx.iter() {
        cancel.check()?;
        for record in &batch? {
            sink.push(record)?;
        }
        *batches += 1;
        report(sink, *batches, progress);
    }
    Ok(())
}

fn report(sink: &RowSink, batches: u64, progress: Option<&ProgressObserver>) {
    log::debug!(
        "ingest batch {batches}: {} records read, {} rows stored",
        sink.records,
        sink.builder.rows()
    );
    if let Some(observer) = progress {
        observer(&Progress {
            stage: Stage::Ingest,
            batches,
            rows: sink.builder.rows() as u64,
        });
    }
}

pub(crate) fn ingest_csv(
    source: &SourceDescriptor,
    config: &EngineConfig,
    cancel: &CancellationToken,
    progress: Option<&ProgressObserver>,
) -> EngineResult<Ingested> {
    config.validate()?;
    let started = Instant::now();
    let options = source.options();
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(options.delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(source.open()?);

    let mut header = None;
    if options.has_header {
        let mut record = ByteRecord::new();
        if reader.read_byte_record(&mut record)? {
            header = Some(record);
        }
    }
    let mut sample = Vec::new();
    while sample.len() < config.sample_rows {
        let mut record = ByteRecord::new();
        if !reader.read_byte_record(&mut record)? {
            break;
        }
        sample.push(record);
    }

    let schema = infer_schema(header.as_ref(), &sample);
    for warning in &schema.warnings {
        log::warn!("{}: {warning}", source.name());
    }
    let types = schema.column_types();
    let mut sink = RowSink {
        row: vec![Value::Null; types.len()],
        builder: ColumnarTableBuilder::new(
            schema.columns.clone(),
            TableOptions {
                page_size_rows: config.page_size_rows,
            },
        ),
        types,
        policy: config.malformed_rows,
        records: 0,
        rejected: 0,
        null_fields: 0,
    };

    let mut batches = 0u64;
    for chunk in sample.chunks(config.batch_rows) {
        cancel.check()?;
        for record in chunk {
            sink.push(record)?;
        }
        batches += 1;
        report(&sink, batches, progress);
    }
    let sample_exhausted_input = sample.len() < config.sample_rows;
    drop(sample);

    if !sample_exhausted_input {
        let (tx, rx) = sync_channel::<BatchMessage>(config.max_in_flight_batches);
        let batch_rows = config.batch_rows;
        let producer = thread::Builder::new()
            .name("tripdb-csv-reader".into())
            .spawn(move || loop {
                let mut batch = Vec::with_capacity(batch_rows);
                while batch.len() < batch_rows {
                    let mut record = ByteRecord::new();
                    match reader.read_byte_record(&mut record) {
                        Ok(true) => batch.push(record),
                        Ok(false) => break,
                        Err(err) => {
                            let _ = tx.send(Err(err.into()));
                            return;
                        }
                    }
                }
                let last = batch.len() < batch_rows;
                if !batch.is_empty() && tx.send(Ok(batch)).is_err() {
                    // Consumer bailed out.
                    return;
                }
                if last {
                    return;
                }
            })?;

        let outcome = consume(&rx, &mut sink, &mut batches, cancel, progress);
        drop(rx);
        if producer.join().is_err() {
            return Err(EngineError::ReaderPanicked);
        }
        outcome?;
    }

    let RowSink {
        builder,
        rejected,
        null_fields,
        policy,
        ..
    } = sink;
    let table = builder.finalize();
    let duration = started.elapsed();
    let row_count = table.row_count() as u64;
    let rows_per_second = if duration.as_secs_f64() > 0.0 {
        row_count as f64 / duration.as_secs_f64()
    } else {
        0.0
    };
    log::info!(
        "ingested {row_count} rows from {} in {:.2?} ({rejected} rejected, {:.0} rows/s)",
        source.name(),
        duration,
        rows_per_second
    );

    Ok(Ingested {
        summary: IngestSummary {
            source: source.name(),
            success: true,
            duration,
            row_count,
            rejected_count: rejected,
            null_fields,
            policy,
            batches,
            rows_per_second,
            warnings: schema.warnings.clone(),
        },
        table,
        schema,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU64, Ordering};

    const TRIPS: &str = "\
pickup,passengers,fare,vendor
2016-03-01 00:00:00,1,10.5,CMT
2016-03-01 00:05:00,2,7,VTS
2016-03-01 00:10:00,x,8.25,CMT
2016-03-01 00:15:00,1
2016-03-01 00:20:00,3,9.0,VTS,extra
";

    fn config() -> EngineConfig {
        EngineConfig::default().with_batch_rows(2).with_sample_rows(3)
    }

    fn ingest(data: &str, config: &EngineConfig) -> Ingested {
        let source = SourceDescriptor::csv_bytes("trips", data.as_bytes().to_vec());
        ingest_csv(&source, config, &CancellationToken::new(), None).unwrap()
    }

    #[test]
    fn malformed_fields_become_nulls_by_default() {
        let ingested = ingest(TRIPS, &config());
        let table = &ingested.table;
        assert_eq!(
            table.describe(),
            vec![
                ("pickup".to_owned(), ColumnType::Timestamp),
                ("passengers".to_owned(), ColumnType::Text),
                ("fare".to_owned(), ColumnType::Float64),
                ("vendor".to_owned(), ColumnType::Text),
            ]
        );
        // The sample (3 records) sees "x", so passengers is text and nothing fails coercion;
        // only the record with an extra field is counted.
        assert_eq!(ingested.summary.row_count, 5);
        assert_eq!(ingested.summary.rejected_count, 1);
        assert_eq!(ingested.summary.null_fields, 0);
        assert_eq!(table.get_cell(3, 2), Value::Null);
        assert_eq!(table.get_cell(4, 3), Value::from("VTS"));
    }

    #[test]
    fn values_outside_the_sample_are_coerced_or_counted() {
        // Sample of two records types passengers as an integer; "x" arrives later.
        let config = config().with_sample_rows(2);
        let ingested = ingest(TRIPS, &config);
        let table = &ingested.table;
        assert_eq!(table.schema()[1].column_type, ColumnType::Int64);
        assert_eq!(ingested.summary.row_count, 5);
        assert_eq!(ingested.summary.rejected_count, 2);
        assert_eq!(ingested.summary.null_fields, 1);
        assert_eq!(table.get_cell(2, 1), Value::Null);
        assert_eq!(table.get_cell(2, 2), Value::Float(8.25));
        for col in 0..table.column_count() {
            let nulls = table.null_count(col).unwrap();
            assert_eq!(
                table.scan().count_non_null(col) as usize + nulls,
                table.row_count()
            );
        }
    }

    #[test]
    fn reject_policy_drops_malformed_records() {
        let config = config()
            .with_sample_rows(2)
            .with_malformed_rows(MalformedRowPolicy::Reject);
        let ingested = ingest(TRIPS, &config);
        assert_eq!(ingested.summary.row_count, 3);
        assert_eq!(ingested.summary.rejected_count, 2);
        assert_eq!(ingested.summary.policy, MalformedRowPolicy::Reject);
        // Third stored row is the short record.
        assert_eq!(ingested.table.get_cell(2, 0), Value::Timestamp(1_456_790_400 + 900));
        assert_eq!(ingested.table.get_cell(2, 2), Value::Null);
    }

    #[test]
    fn batches_and_progress() {
        let seen = Arc::new(AtomicU64::new(0));
        let observer: ProgressObserver = {
            let seen = seen.clone();
            Arc::new(move |p: &Progress| {
                assert_eq!(p.stage, Stage::Ingest);
                seen.fetch_add(1, Ordering::Relaxed);
            })
        };
        let source = SourceDescriptor::csv_bytes("trips", TRIPS.as_bytes().to_vec());
        let ingested = ingest_csv(
            &source,
            &config().with_sample_rows(1),
            &CancellationToken::new(),
            Some(&observer),
        )
        .unwrap();
        // 1 sample batch + 2 + 2 from the reader thread.
        assert_eq!(ingested.summary.batches, 3);
        assert_eq!(seen.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn headerless_semicolon_source() {
        let source = SourceDescriptor::csv_bytes("raw", b"1;2.5\n2;3\n".to_vec())
            .with_header(false)
            .with_delimiter(b';');
        let ingested =
            ingest_csv(&source, &config(), &CancellationToken::new(), None).unwrap();
        assert_eq!(
            ingested.table.describe(),
            vec![
                ("column1".to_owned(), ColumnType::Int64),
                ("column2".to_owned(), ColumnType::Float64),
            ]
        );
        assert_eq!(ingested.summary.row_count, 2);
    }

    #[test]
    fn empty_source_yields_an_empty_table_with_a_warning() {
        let ingested = ingest("", &config());
        assert_eq!(ingested.table.row_count(), 0);
        assert_eq!(ingested.table.column_count(), 0);
        assert!(ingested.summary.success);
        assert_eq!(ingested.summary.warnings.len(), 1);
    }

    #[test]
    fn missing_file_is_source_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = SourceDescriptor::csv_file(dir.path().join("missing.csv"));
        let err = ingest_csv(&source, &config(), &CancellationToken::new(), None)
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::SourceUnavailable { .. }));
    }

    #[test]
    fn cancellation_stops_ingestion() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let source = SourceDescriptor::csv_bytes("trips", TRIPS.as_bytes().to_vec());
        let err = ingest_csv(&source, &config(), &cancel, None).err().unwrap();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[test]
    fn table_name_follows_the_file_stem() {
        let source = SourceDescriptor::csv_file("/data/yellow_tripdata_2016-03.csv");
        assert_eq!(source.name(), "yellow_tripdata_2016-03");
        assert_eq!(source.table_name(), "taxi_data_yellow_tripdata_2016-03");
    }
}
