#![forbid(unsafe_code)]

use crate::bitmap::BitVec;
use crate::error::TableError;
use crate::stats::{ColumnStats, StatsBuilder};
use crate::types::{ColumnType, Value};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct TableOptions {
    pub page_size_rows: usize,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            page_size_rows: 65_536,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

#[derive(Clone, Debug)]
enum PageData {
    Int(Vec<i64>),
    Float(Vec<f64>),
    /// Indices into the column dictionary.
    Text(Vec<u32>),
    Timestamp(Vec<i64>),
    Boolean(BitVec),
}

impl PageData {
    fn with_capacity(column_type: ColumnType, rows: usize) -> Self {
        match column_type {
            ColumnType::Int64 => PageData::Int(Vec::with_capacity(rows)),
            ColumnType::Float64 => PageData::Float(Vec::with_capacity(rows)),
            ColumnType::Text => PageData::Text(Vec::with_capacity(rows)),
            ColumnType::Timestamp => PageData::Timestamp(Vec::with_capacity(rows)),
            ColumnType::Boolean => PageData::Boolean(BitVec::with_capacity_bits(rows)),
        }
    }

    fn size_bytes(&self) -> usize {
        match self {
            PageData::Int(v) | PageData::Timestamp(v) => v.len() * 8,
            PageData::Float(v) => v.len() * 8,
            PageData::Text(v) => v.len() * 4,
            PageData::Boolean(b) => b.size_bytes(),
        }
    }
}

#[derive(Clone, Debug)]
struct Page {
    data: PageData,
    /// `true` = value present.
    validity: BitVec,
}

#[derive(Clone, Debug)]
pub struct Column {
    schema: ColumnSchema,
    pages: Vec<Page>,
    stats: ColumnStats,
    dictionary: Arc<Vec<Arc<str>>>,
}

impl Column {
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn column_type(&self) -> ColumnType {
        self.schema.column_type
    }

    pub fn stats(&self) -> &ColumnStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.pages.iter().map(|p| p.validity.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn null_count(&self) -> usize {
        self.pages.iter().map(|p| p.validity.count_zeros()).sum()
    }

    /// Distinct values of a text column, in first-seen order.
    pub fn dictionary(&self) -> &[Arc<str>] {
        &self.dictionary
    }

    pub fn page(&self, idx: usize) -> Option<ColumnPage<'_>> {
        let page = self.pages.get(idx)?;
        let values = match &page.data {
            PageData::Int(v) => PageValues::Int(v),
            PageData::Float(v) => PageValues::Float(v),
            PageData::Text(v) => PageValues::Text {
                indices: v,
                dictionary: &self.dictionary,
            },
            PageData::Timestamp(v) => PageValues::Timestamp(v),
            PageData::Boolean(v) => PageValues::Boolean(v),
        };
        Some(ColumnPage {
            values,
            validity: &page.validity,
        })
    }

    pub fn size_bytes(&self) -> usize {
        let dict_bytes: usize = self.dictionary.iter().map(|s| s.len()).sum();
        let page_bytes: usize = self
            .pages
            .iter()
            .map(|p| p.data.size_bytes() + p.validity.size_bytes())
            .sum();
        dict_bytes + page_bytes
    }
}

/// Typed values of one page, borrowed from the table.
#[derive(Clone, Copy, Debug)]
pub enum PageValues<'a> {
    Int(&'a [i64]),
    Float(&'a [f64]),
    Text {
        indices: &'a [u32],
        dictionary: &'a [Arc<str>],
    },
    Timestamp(&'a [i64]),
    Boolean(&'a BitVec),
}

/// One page of one column. Slots whose validity bit is unset hold a placeholder and read as null.
#[derive(Clone, Copy, Debug)]
pub struct ColumnPage<'a> {
    values: PageValues<'a>,
    validity: &'a BitVec,
}

impl<'a> ColumnPage<'a> {
    pub fn len(&self) -> usize {
        self.validity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validity.is_empty()
    }

    pub fn values(&self) -> PageValues<'a> {
        self.values
    }

    pub fn is_valid(&self, idx: usize) -> bool {
        self.validity.get(idx)
    }

    pub fn null_count(&self) -> usize {
        self.validity.count_zeros()
    }

    pub fn value(&self, idx: usize) -> Value {
        if !self.validity.get(idx) {
            return Value::Null;
        }
        match self.values {
            PageValues::Int(v) => Value::Int(v[idx]),
            PageValues::Float(v) => Value::Float(v[idx]),
            PageValues::Text {
                indices,
                dictionary,
            } => Value::Text(dictionary[indices[idx] as usize].clone()),
            PageValues::Timestamp(v) => Value::Timestamp(v[idx]),
            PageValues::Boolean(v) => Value::Boolean(v.get(idx)),
        }
    }

    /// Numeric view of a slot (integers widen, booleans read as 0/1).
    pub fn f64_at(&self, idx: usize) -> Option<f64> {
        if !self.validity.get(idx) {
            return None;
        }
        match self.values {
            PageValues::Int(v) => Some(v[idx] as f64),
            PageValues::Float(v) => Some(v[idx]),
            PageValues::Boolean(v) => Some(if v.get(idx) { 1.0 } else { 0.0 }),
            PageValues::Text { .. } | PageValues::Timestamp(_) => None,
        }
    }

    /// Integer view of a slot; timestamps read as epoch seconds.
    pub fn i64_at(&self, idx: usize) -> Option<i64> {
        if !self.validity.get(idx) {
            return None;
        }
        match self.values {
            PageValues::Int(v) | PageValues::Timestamp(v) => Some(v[idx]),
            _ => None,
        }
    }

    pub fn text_at(&self, idx: usize) -> Option<&'a Arc<str>> {
        if !self.validity.get(idx) {
            return None;
        }
        match self.values {
            PageValues::Text {
                indices,
                dictionary,
            } => dictionary.get(indices[idx] as usize),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ColumnarTable {
    schema: Vec<ColumnSchema>,
    columns: Vec<Column>,
    rows: usize,
    options: TableOptions,
}

impl ColumnarTable {
    pub fn schema(&self) -> &[ColumnSchema] {
        &self.schema
    }

    pub fn options(&self) -> TableOptions {
        self.options
    }

    pub fn row_count(&self) -> usize {
        self.rows
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn page_size_rows(&self) -> usize {
        self.options.page_size_rows
    }

    pub fn page_count(&self) -> usize {
        self.rows.div_ceil(self.options.page_size_rows)
    }

    /// Row range covered by a page.
    pub fn page_rows(&self, page: usize) -> Range<usize> {
        let start = (page * self.options.page_size_rows).min(self.rows);
        let end = (start + self.options.page_size_rows).min(self.rows);
        start..end
    }

    pub fn column(&self, idx: usize) -> Option<&Column> {
        self.columns.get(idx)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.schema.iter().position(|c| c.name == name)
    }

    /// `(name, type)` for every column, in schema order.
    pub fn describe(&self) -> Vec<(String, ColumnType)> {
        self.schema
            .iter()
            .map(|c| (c.name.clone(), c.column_type))
            .collect()
    }

    pub fn stats(&self, col: usize) -> Option<&ColumnStats> {
        self.columns.get(col).map(|c| &c.stats)
    }

    pub fn null_count(&self, col: usize) -> Option<usize> {
        self.columns.get(col).map(Column::null_count)
    }

    pub fn get_cell(&self, row: usize, col: usize) -> Value {
        let Some(column) = self.columns.get(col) else {
            return Value::Null;
        };
        if row >= self.rows {
            return Value::Null;
        }
        let page_size = self.options.page_size_rows;
        column
            .page(row / page_size)
            .map(|p| p.value(row % page_size))
            .unwrap_or(Value::Null)
    }

    pub fn get_range(
        &self,
        row_start: usize,
        row_end: usize,
        col_start: usize,
        col_end: usize,
    ) -> ColumnarRange {
        let row_end = row_end.min(self.rows);
        let col_end = col_end.min(self.columns.len());
        let row_start = row_start.min(row_end);
        let col_start = col_start.min(col_end);
        let page_size = self.options.page_size_rows;

        let mut out_columns: Vec<Vec<Value>> = Vec::with_capacity(col_end - col_start);
        for column in &self.columns[col_start..col_end] {
            let mut values = Vec::with_capacity(row_end - row_start);
            let mut r = row_start;
            while r < row_end {
                let page_idx = r / page_size;
                let in_page = r % page_size;
                let take = (row_end - r).min(page_size - in_page);
                match column.page(page_idx) {
                    Some(page) => {
                        values.extend((in_page..in_page + take).map(|i| page.value(i)));
                    }
                    None => values.extend(std::iter::repeat(Value::Null).take(take)),
                }
                r += take;
            }
            out_columns.push(values);
        }

        ColumnarRange {
            row_start,
            row_end,
            col_start,
            col_end,
            columns: out_columns,
        }
    }

    pub fn scan(&self) -> TableScan<'_> {
        TableScan { table: self }
    }

    pub fn approx_size_bytes(&self) -> usize {
        self.columns.iter().map(Column::size_bytes).sum()
    }

    fn check_column(&self, col: usize) -> Result<(), TableError> {
        if col < self.columns.len() {
            Ok(())
        } else {
            Err(TableError::ColumnOutOfRange {
                index: col,
                columns: self.columns.len(),
            })
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnarRange {
    pub row_start: usize,
    pub row_end: usize,
    pub col_start: usize,
    pub col_end: usize,
    /// Column-major output: `columns[c][r]`.
    pub columns: Vec<Vec<Value>>,
}

impl ColumnarRange {
    pub fn rows(&self) -> usize {
        self.row_end - self.row_start
    }

    pub fn cols(&self) -> usize {
        self.col_end - self.col_start
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&Value> {
        self.columns.get(col)?.get(row)
    }

    /// Row-major copy of the range.
    pub fn to_rows(&self) -> Vec<Vec<Value>> {
        (0..self.rows())
            .map(|r| self.columns.iter().map(|c| c[r].clone()).collect())
            .collect()
    }
}

/// Entry point for read-only scans. Every iterator it hands out starts from row 0.
pub struct TableScan<'a> {
    table: &'a ColumnarTable,
}

impl<'a> TableScan<'a> {
    /// Lazy iterator over every value of one column.
    pub fn column(&self, col: usize) -> Result<ColumnValues<'a>, TableError> {
        self.table.check_column(col)?;
        Ok(ColumnValues {
            column: &self.table.columns[col],
            page: 0,
            offset: 0,
        })
    }

    /// Page-sized batches carrying only the projected columns, in projection order.
    pub fn batches(&self, projection: &[usize]) -> Result<Batches<'a>, TableError> {
        self.batches_in(projection, 0..self.table.page_count())
    }

    /// Like [`TableScan::batches`] but restricted to a page range (used for sharded scans).
    pub fn batches_in(
        &self,
        projection: &[usize],
        pages: Range<usize>,
    ) -> Result<Batches<'a>, TableError> {
        for &col in projection {
            self.table.check_column(col)?;
        }
        let end = pages.end.min(self.table.page_count());
        Ok(Batches {
            table: self.table,
            projection: projection.to_vec(),
            next_page: pages.start.min(end),
            end_page: end,
        })
    }

    pub fn count_non_null(&self, col: usize) -> u64 {
        self.table
            .columns
            .get(col)
            .map(|c| (self.table.rows - c.null_count()) as u64)
            .unwrap_or(0)
    }

    /// Sum of a numeric column, ignoring nulls. `None` for non-numeric columns.
    pub fn sum_f64(&self, col: usize) -> Option<f64> {
        let column = self.table.columns.get(col)?;
        if !matches!(
            column.column_type(),
            ColumnType::Int64 | ColumnType::Float64 | ColumnType::Boolean
        ) {
            return None;
        }
        let mut sum = 0f64;
        for idx in 0..column.pages.len() {
            let page = column.page(idx)?;
            sum += (0..page.len()).filter_map(|i| page.f64_at(i)).sum::<f64>();
        }
        Some(sum)
    }
}

/// Lazy single-column value iterator.
pub struct ColumnValues<'a> {
    column: &'a Column,
    page: usize,
    offset: usize,
}

impl Iterator for ColumnValues<'_> {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        loop {
            let page = self.column.page(self.page)?;
            if self.offset < page.len() {
                let v = page.value(self.offset);
                self.offset += 1;
                return Some(v);
            }
            self.page += 1;
            self.offset = 0;
        }
    }
}

/// A page-aligned slice of rows over the projected columns.
#[derive(Clone, Debug)]
pub struct ScanBatch<'a> {
    pub row_start: usize,
    len: usize,
    columns: Vec<ColumnPage<'a>>,
}

impl<'a> ScanBatch<'a> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Page for the `i`-th projected column.
    pub fn column(&self, i: usize) -> ColumnPage<'a> {
        self.columns[i]
    }

    pub fn columns(&self) -> &[ColumnPage<'a>] {
        &self.columns
    }
}

pub struct Batches<'a> {
    table: &'a ColumnarTable,
    projection: Vec<usize>,
    next_page: usize,
    end_page: usize,
}

impl<'a> Iterator for Batches<'a> {
    type Item = ScanBatch<'a>;

    fn next(&mut self) -> Option<ScanBatch<'a>> {
        if self.next_page >= self.end_page {
            return None;
        }
        let page = self.next_page;
        self.next_page += 1;

        let rows = self.table.page_rows(page);
        let columns = self
            .projection
            .iter()
            .map(|&col| self.table.columns[col].page(page))
            .collect::<Option<Vec<_>>>()?;
        Some(ScanBatch {
            row_start: rows.start,
            len: rows.len(),
            columns,
        })
    }
}

pub struct ColumnarTableBuilder {
    schema: Vec<ColumnSchema>,
    options: TableOptions,
    builders: Vec<ColumnBuilder>,
    rows: usize,
    mismatched_values: u64,
}

struct ColumnBuilder {
    schema: ColumnSchema,
    page_size: usize,
    current: PageData,
    validity: BitVec,
    pages: Vec<Page>,
    stats: StatsBuilder,
    dictionary: Vec<Arc<str>>,
    dict_index: HashMap<Arc<str>, u32>,
}

impl ColumnarTableBuilder {
    pub fn new(schema: Vec<ColumnSchema>, options: TableOptions) -> Self {
        let options = TableOptions {
            page_size_rows: options.page_size_rows.max(1),
        };
        let builders = schema
            .iter()
            .cloned()
            .map(|col| ColumnBuilder::new(col, options.page_size_rows))
            .collect();

        Self {
            schema,
            options,
            builders,
            rows: 0,
            mismatched_values: 0,
        }
    }

    pub fn schema(&self) -> &[ColumnSchema] {
        &self.schema
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Values that did not match their column type and were stored as null.
    pub fn mismatched_values(&self) -> u64 {
        self.mismatched_values
    }

    pub fn append_row(&mut self, row: &[Value]) -> Result<(), TableError> {
        if row.len() != self.builders.len() {
            return Err(TableError::RowArity {
                expected: self.builders.len(),
                actual: row.len(),
            });
        }

        for (builder, value) in self.builders.iter_mut().zip(row.iter()) {
            if !builder.push(value) {
                self.mismatched_values += 1;
            }
        }

        self.rows += 1;
        if self.rows % self.options.page_size_rows == 0 {
            for builder in &mut self.builders {
                builder.flush();
            }
        }
        Ok(())
    }

    pub fn finalize(self) -> ColumnarTable {
        let columns = self
            .builders
            .into_iter()
            .map(ColumnBuilder::finish)
            .collect();

        ColumnarTable {
            schema: self.schema,
            columns,
            rows: self.rows,
            options: self.options,
        }
    }
}

impl ColumnBuilder {
    fn new(schema: ColumnSchema, page_size: usize) -> Self {
        Self {
            current: PageData::with_capacity(schema.column_type, page_size),
            validity: BitVec::with_capacity_bits(page_size),
            stats: StatsBuilder::new(schema.column_type),
            schema,
            page_size,
            pages: Vec::new(),
            dictionary: Vec::new(),
            dict_index: HashMap::new(),
        }
    }

    fn intern(&mut self, s: &Arc<str>) -> u32 {
        if let Some(idx) = self.dict_index.get(s.as_ref()) {
            return *idx;
        }
        let idx = self.dictionary.len() as u32;
        self.dictionary.push(s.clone());
        self.dict_index.insert(s.clone(), idx);
        idx
    }

    /// Returns `false` when the value had the wrong type and was stored as null.
    fn push(&mut self, value: &Value) -> bool {
        if value.is_null() {
            self.push_null();
            return true;
        }
        let text_idx = match value {
            Value::Text(s) if self.schema.column_type == ColumnType::Text => Some(self.intern(s)),
            _ => None,
        };

        let stored = match (&mut self.current, value) {
            (PageData::Int(buf), Value::Int(v)) => {
                buf.push(*v);
                self.stats.observe_int(*v);
                true
            }
            (PageData::Float(buf), Value::Float(v)) => {
                buf.push(*v);
                self.stats.observe_float(*v);
                true
            }
            (PageData::Float(buf), Value::Int(v)) => {
                buf.push(*v as f64);
                self.stats.observe_float(*v as f64);
                true
            }
            (PageData::Timestamp(buf), Value::Timestamp(v)) => {
                buf.push(*v);
                self.stats.observe_int(*v);
                true
            }
            (PageData::Boolean(buf), Value::Boolean(v)) => {
                buf.push(*v);
                self.stats.observe_bool(*v);
                true
            }
            (PageData::Text(buf), Value::Text(s)) => match text_idx {
                Some(idx) => {
                    buf.push(idx);
                    self.stats.observe_text(s);
                    true
                }
                None => false,
            },
            _ => false,
        };

        if stored {
            self.validity.push(true);
        } else {
            self.push_null();
        }
        stored
    }

    fn push_null(&mut self) {
        match &mut self.current {
            PageData::Int(buf) | PageData::Timestamp(buf) => buf.push(0),
            PageData::Float(buf) => buf.push(0.0),
            PageData::Text(buf) => buf.push(0),
            PageData::Boolean(buf) => buf.push(false),
        }
        self.validity.push(false);
        self.stats.observe_null();
    }

    fn flush(&mut self) {
        if self.validity.is_empty() {
            return;
        }
        let data = std::mem::replace(
            &mut self.current,
            PageData::with_capacity(self.schema.column_type, self.page_size),
        );
        let validity = std::mem::replace(
            &mut self.validity,
            BitVec::with_capacity_bits(self.page_size),
        );
        self.pages.push(Page { data, validity });
    }

    fn finish(mut self) -> Column {
        self.flush();
        Column {
            schema: self.schema,
            pages: self.pages,
            stats: self.stats.finish(),
            dictionary: Arc::new(self.dictionary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(page_size_rows: usize) -> TableOptions {
        TableOptions { page_size_rows }
    }

    #[test]
    fn timestamp_column_roundtrip_across_pages() {
        let schema = vec![ColumnSchema::new("ts", ColumnType::Timestamp)];
        let mut builder = ColumnarTableBuilder::new(schema, options(128));
        for i in 0..1000 {
            builder.append_row(&[Value::Timestamp(i)]).unwrap();
        }
        let table = builder.finalize();

        assert_eq!(table.row_count(), 1000);
        assert_eq!(table.page_count(), 8);
        assert_eq!(table.get_cell(0, 0), Value::Timestamp(0));
        assert_eq!(table.get_cell(999, 0), Value::Timestamp(999));
        assert_eq!(table.get_cell(1000, 0), Value::Null);
        assert_eq!(table.stats(0).unwrap().max, Some(Value::Timestamp(999)));
    }

    #[test]
    fn dictionary_roundtrip_and_range() {
        let schema = vec![
            ColumnSchema::new("cat", ColumnType::Text),
            ColumnSchema::new("flag", ColumnType::Boolean),
        ];
        let mut builder = ColumnarTableBuilder::new(schema, options(4));
        let cats = ["A", "B", "A", "C", "C", "C"];
        for (i, c) in cats.iter().enumerate() {
            builder
                .append_row(&[Value::from(*c), Value::Boolean(i % 2 == 0)])
                .unwrap();
        }
        let table = builder.finalize();

        assert_eq!(table.column(0).unwrap().dictionary().len(), 3);
        assert_eq!(table.get_cell(3, 0), Value::from("C"));

        let range = table.get_range(1, 5, 0, 2);
        assert_eq!(range.rows(), 4);
        assert_eq!(range.cols(), 2);
        assert_eq!(range.get(0, 0), Some(&Value::from("B")));
        assert_eq!(range.get(3, 1), Some(&Value::Boolean(true)));
        assert_eq!(range.to_rows()[2], vec![Value::from("C"), Value::Boolean(false)]);
    }

    #[test]
    fn type_mismatch_is_stored_as_null() {
        let schema = vec![ColumnSchema::new("n", ColumnType::Int64)];
        let mut builder = ColumnarTableBuilder::new(schema, options(8));
        builder.append_row(&[Value::Int(1)]).unwrap();
        builder.append_row(&[Value::from("oops")]).unwrap();
        assert_eq!(builder.mismatched_values(), 1);

        let table = builder.finalize();
        assert_eq!(table.get_cell(1, 0), Value::Null);
        assert_eq!(table.null_count(0), Some(1));
    }

    #[test]
    fn arity_mismatch_is_an_error() {
        let schema = vec![ColumnSchema::new("n", ColumnType::Int64)];
        let mut builder = ColumnarTableBuilder::new(schema, options(8));
        let err = builder
            .append_row(&[Value::Int(1), Value::Int(2)])
            .unwrap_err();
        assert!(matches!(
            err,
            TableError::RowArity {
                expected: 1,
                actual: 2
            }
        ));
        assert_eq!(builder.rows(), 0);
    }

    #[test]
    fn scan_sum_and_null_counts() {
        let schema = vec![
            ColumnSchema::new("x", ColumnType::Float64),
            ColumnSchema::new("cat", ColumnType::Text),
        ];
        let mut builder = ColumnarTableBuilder::new(schema, options(8));
        for i in 0..12 {
            let x = if i == 5 {
                Value::Null
            } else {
                Value::Float((i + 1) as f64)
            };
            builder.append_row(&[x, Value::from("k")]).unwrap();
        }
        let table = builder.finalize();

        let expected: f64 = (1..=12).filter(|v| *v != 6).map(|v| v as f64).sum();
        assert_eq!(table.scan().sum_f64(0), Some(expected));
        assert_eq!(table.scan().sum_f64(1), None);
        assert_eq!(table.scan().count_non_null(0), 11);
        assert_eq!(table.null_count(0), Some(1));
    }
}
