use std::path::PathBuf;
use tripdb_columnar::{ColumnType, TableError};

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("source unavailable: {}: {source}", path.display())]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("memory ceiling exceeded: requested {requested} bytes with {in_use} of {ceiling} bytes in use")]
    MemoryExceeded {
        requested: usize,
        in_use: usize,
        ceiling: usize,
    },

    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error("column {column} has type {actual}, expected {expected}")]
    TypeMismatch {
        column: String,
        expected: &'static str,
        actual: ColumnType,
    },

    #[error("no table loaded")]
    NoTable,

    #[error("query cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("spill segment {}: {message}", path.display())]
    Spill { path: PathBuf, message: String },

    #[error("ingestion reader thread panicked")]
    ReaderPanicked,

    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// True for failures that only affect the query that raised them.
    pub fn is_query_local(&self) -> bool {
        matches!(
            self,
            EngineError::MemoryExceeded { .. }
                | EngineError::Cancelled
                | EngineError::UnknownColumn(_)
                | EngineError::TypeMismatch { .. }
                | EngineError::InvalidArgument(_)
                | EngineError::Spill { .. }
        )
    }
}
