#![cfg(feature = "arrow")]

use std::io::Cursor;
use tripdb_columnar::arrow::{read_table_ipc, write_table_ipc};
use tripdb_columnar::{ColumnSchema, ColumnType, ColumnarTableBuilder, TableOptions, Value};

#[test]
fn ipc_file_roundtrip_preserves_values_and_nulls() {
    let schema = vec![
        ColumnSchema::new("n", ColumnType::Int64),
        ColumnSchema::new("x", ColumnType::Float64),
        ColumnSchema::new("s", ColumnType::Text),
        ColumnSchema::new("ts", ColumnType::Timestamp),
        ColumnSchema::new("b", ColumnType::Boolean),
    ];
    let options = TableOptions { page_size_rows: 2 };
    let mut builder = ColumnarTableBuilder::new(schema, options);
    let rows = vec![
        vec![
            Value::Int(1),
            Value::Float(2.5),
            Value::from("A"),
            Value::Timestamp(100),
            Value::Boolean(true),
        ],
        vec![
            Value::Null,
            Value::Float(-1.0),
            Value::Null,
            Value::Timestamp(101),
            Value::Boolean(false),
        ],
        vec![
            Value::Int(3),
            Value::Null,
            Value::from("B"),
            Value::Null,
            Value::Null,
        ],
    ];
    for row in &rows {
        builder.append_row(row).unwrap();
    }
    let table = builder.finalize();

    let mut buf = Vec::new();
    write_table_ipc(&table, &mut buf).unwrap();
    let restored = read_table_ipc(Cursor::new(buf), options).unwrap();

    assert_eq!(restored.describe(), table.describe());
    assert_eq!(restored.row_count(), 3);
    for (r, row) in rows.iter().enumerate() {
        for (c, value) in row.iter().enumerate() {
            assert_eq!(&restored.get_cell(r, c), value, "row {r} col {c}");
        }
    }
}

#[test]
fn empty_table_roundtrip() {
    let schema = vec![ColumnSchema::new("n", ColumnType::Int64)];
    let table = ColumnarTableBuilder::new(schema, TableOptions::default()).finalize();

    let mut buf = Vec::new();
    write_table_ipc(&table, &mut buf).unwrap();
    let restored = read_table_ipc(Cursor::new(buf), TableOptions::default()).unwrap();
    assert_eq!(restored.row_count(), 0);
    assert_eq!(restored.describe(), table.describe());
}
