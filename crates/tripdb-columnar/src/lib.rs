//! Paged columnar storage for tripdb.
//!
//! This crate focuses on:
//! - Typed column buffers with a parallel validity bitmap per page.
//! - Streaming, append-only construction (`ColumnarTableBuilder`), read-only afterwards.
//! - Projected scans: only the requested columns are touched.
//! - Optional Arrow IPC table files (`arrow` feature).

#![forbid(unsafe_code)]

#[cfg(feature = "arrow")]
pub mod arrow;
mod bitmap;
mod error;
mod stats;
mod table;
mod types;

pub use crate::bitmap::BitVec;
pub use crate::error::TableError;
pub use crate::stats::ColumnStats;
pub use crate::table::{
    Batches, Column, ColumnPage, ColumnSchema, ColumnValues, ColumnarRange, ColumnarTable,
    ColumnarTableBuilder, PageValues, ScanBatch, TableOptions, TableScan,
};
pub use crate::types::{ColumnType, Value};
