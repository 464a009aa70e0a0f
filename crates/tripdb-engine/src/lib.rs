//! Memory-bounded analytics over taxi trip records.
//!
//! CSV sources are ingested into a paged columnar table (`tripdb-columnar`) with an inferred
//! schema. Grouped aggregations and window functions run against that table under a
//! [`MemoryBudget`]; when an operator cannot reserve more memory it spills sorted runs to a
//! per-query directory and merges them back, so results are the same at any ceiling.

mod aggregate;
mod config;
mod engine;
mod error;
mod expr;
mod ingest;
mod memory;
mod parallel;
mod query;
mod schema;
mod sort;
mod spill;
mod window;

pub use crate::aggregate::{
    AggFn, AggState, AggregateQuery, AggregateResult, AggregateSpec, GroupKey, OrderBy,
};
pub use crate::config::{
    parse_memory_limit, EngineConfig, MalformedRowPolicy, MEMORY_LIMIT_ENV, TEMP_DIRECTORY_ENV,
};
pub use crate::engine::{Engine, TableOrigin};
pub use crate::error::{EngineError, EngineResult};
pub use crate::expr::{weekday_name, Predicate, Scalar, ScalarExpr, WEEKDAY_NAMES};
pub use crate::ingest::{CsvOptions, IngestSummary, SourceDescriptor};
pub use crate::memory::{parse_byte_size, Grant, MemoryBudget, MemoryReservation, MemoryUsage};
pub use crate::query::{CancellationToken, Progress, ProgressObserver, QueryStats, Stage};
pub use crate::schema::{infer_schema, InferredSchema};
pub use crate::window::{RankMode, SortDirection, WindowOutput};

pub use tripdb_columnar::{ColumnSchema, ColumnType, ColumnarTable, Value};
