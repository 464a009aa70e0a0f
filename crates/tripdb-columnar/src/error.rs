use thiserror::Error;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("row has {actual} values but the schema has {expected} columns")]
    RowArity { expected: usize, actual: usize },

    #[error("column index {index} out of range (table has {columns} columns)")]
    ColumnOutOfRange { index: usize, columns: usize },

    #[error("unsupported arrow column type for {column}: {data_type}")]
    UnsupportedArrowType { column: String, data_type: String },

    #[cfg(feature = "arrow")]
    #[error(transparent)]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
