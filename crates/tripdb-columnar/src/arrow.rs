//! Arrow IPC file persistence for [`ColumnarTable`].
//!
//! Each table page becomes one record batch, so writing never materializes more than a page of
//! Arrow arrays at a time.

use crate::table::{ColumnPage, ColumnSchema, ColumnarTable, ColumnarTableBuilder, TableOptions};
use crate::types::{ColumnType, Value};
use crate::TableError;
use arrow_array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampSecondArray,
};
use arrow_ipc::reader::FileReader;
use arrow_ipc::writer::FileWriter;
use arrow_schema::{ArrowError, DataType, Field, Schema, SchemaRef, TimeUnit};
use std::io::{Read, Seek, Write};
use std::sync::Arc;

fn data_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::Int64 => DataType::Int64,
        ColumnType::Float64 => DataType::Float64,
        ColumnType::Text => DataType::Utf8,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Second, None),
        ColumnType::Boolean => DataType::Boolean,
    }
}

fn column_type(field: &Field) -> Result<ColumnType, TableError> {
    match field.data_type() {
        DataType::Int64 => Ok(ColumnType::Int64),
        DataType::Float64 => Ok(ColumnType::Float64),
        DataType::Utf8 => Ok(ColumnType::Text),
        DataType::Timestamp(TimeUnit::Second, _) => Ok(ColumnType::Timestamp),
        DataType::Boolean => Ok(ColumnType::Boolean),
        other => Err(TableError::UnsupportedArrowType {
            column: field.name().clone(),
            data_type: other.to_string(),
        }),
    }
}

pub fn arrow_schema(table: &ColumnarTable) -> SchemaRef {
    let fields: Vec<Field> = table
        .schema()
        .iter()
        .map(|c| Field::new(c.name.clone(), data_type(c.column_type), true))
        .collect();
    Arc::new(Schema::new(fields))
}

fn page_to_array(page: ColumnPage<'_>, column_type: ColumnType) -> ArrayRef {
    let len = page.len();
    match column_type {
        ColumnType::Int64 => Arc::new(Int64Array::from(
            (0..len).map(|i| page.i64_at(i)).collect::<Vec<_>>(),
        )),
        ColumnType::Timestamp => Arc::new(TimestampSecondArray::from(
            (0..len).map(|i| page.i64_at(i)).collect::<Vec<_>>(),
        )),
        ColumnType::Float64 => Arc::new(Float64Array::from(
            (0..len).map(|i| page.f64_at(i)).collect::<Vec<_>>(),
        )),
        ColumnType::Text => Arc::new(StringArray::from(
            (0..len)
                .map(|i| page.text_at(i).map(|s| s.as_ref()))
                .collect::<Vec<Option<&str>>>(),
        )),
        ColumnType::Boolean => Arc::new(BooleanArray::from(
            (0..len)
                .map(|i| match page.value(i) {
                    Value::Boolean(b) => Some(b),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
    }
}

/// Convert one table page into a record batch.
pub fn page_to_record_batch(
    table: &ColumnarTable,
    schema: &SchemaRef,
    page: usize,
) -> Result<RecordBatch, TableError> {
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(table.column_count());
    for (idx, col) in table.schema().iter().enumerate() {
        let column_page = table
            .column(idx)
            .and_then(|c| c.page(page))
            .ok_or(TableError::ColumnOutOfRange {
                index: idx,
                columns: table.column_count(),
            })?;
        arrays.push(page_to_array(column_page, col.column_type));
    }
    Ok(RecordBatch::try_new(schema.clone(), arrays)?)
}

/// Write the whole table as an Arrow IPC file.
pub fn write_table_ipc<W: Write>(table: &ColumnarTable, writer: W) -> Result<(), TableError> {
    let schema = arrow_schema(table);
    let mut writer = FileWriter::try_new(writer, &schema)?;
    for page in 0..table.page_count() {
        let batch = page_to_record_batch(table, &schema, page)?;
        writer.write(&batch)?;
    }
    writer.finish()?;
    Ok(())
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, field: &Field) -> Result<&'a T, TableError> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        TableError::Arrow(ArrowError::CastError(format!(
            "column {} does not match its declared type",
            field.name()
        )))
    })
}

fn cell(array: &ArrayRef, field: &Field, ty: ColumnType, row: usize) -> Result<Value, TableError> {
    if array.is_null(row) {
        return Ok(Value::Null);
    }
    Ok(match ty {
        ColumnType::Int64 => Value::Int(downcast::<Int64Array>(array, field)?.value(row)),
        ColumnType::Float64 => Value::Float(downcast::<Float64Array>(array, field)?.value(row)),
        ColumnType::Timestamp => {
            Value::Timestamp(downcast::<TimestampSecondArray>(array, field)?.value(row))
        }
        ColumnType::Text => Value::from(downcast::<StringArray>(array, field)?.value(row)),
        ColumnType::Boolean => Value::Boolean(downcast::<BooleanArray>(array, field)?.value(row)),
    })
}

/// Read an Arrow IPC file written by [`write_table_ipc`] (or any file using the supported types).
pub fn read_table_ipc<R: Read + Seek>(
    reader: R,
    options: TableOptions,
) -> Result<ColumnarTable, TableError> {
    let reader = FileReader::try_new(reader, None)?;
    let schema = reader.schema();
    let columns: Vec<ColumnSchema> = schema
        .fields()
        .iter()
        .map(|f| Ok(ColumnSchema::new(f.name().clone(), column_type(f)?)))
        .collect::<Result<_, TableError>>()?;
    let types: Vec<ColumnType> = columns.iter().map(|c| c.column_type).collect();

    let mut builder = ColumnarTableBuilder::new(columns, options);
    let mut row: Vec<Value> = vec![Value::Null; types.len()];
    for batch in reader {
        let batch = batch?;
        for r in 0..batch.num_rows() {
            for (c, ty) in types.iter().enumerate() {
                row[c] = cell(batch.column(c), schema.field(c), *ty, r)?;
            }
            builder.append_row(&row)?;
        }
    }
    Ok(builder.finalize())
}
