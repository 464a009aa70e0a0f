//! Sample-based schema inference and per-field coercion.
//!
//! A column's type is the most specific of integer, float, timestamp, boolean that every sampled
//! non-empty value satisfies; anything else (including a column with no sampled values) is text.

use chrono::{NaiveDate, NaiveDateTime};
use csv::ByteRecord;
use std::collections::HashSet;
use tripdb_columnar::{ColumnSchema, ColumnType, Value};

#[derive(Clone, Debug, PartialEq)]
pub struct InferredSchema {
    pub columns: Vec<ColumnSchema>,
    /// Sampled non-empty values per column.
    pub non_empty: Vec<usize>,
    pub sampled_rows: usize,
    pub warnings: Vec<String>,
}

impl InferredSchema {
    pub fn column_types(&self) -> Vec<ColumnType> {
        self.columns.iter().map(|c| c.column_type).collect()
    }
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%Y-%m-%d %H:%M",
];

pub(crate) fn parse_int(v: &str) -> Option<i64> {
    v.parse::<i64>().ok()
}

/// Decimal or exponent notation only; `inf`/`NaN` spellings are not numbers here.
pub(crate) fn parse_float(v: &str) -> Option<f64> {
    let bytes = v.as_bytes();
    if !bytes.iter().any(u8::is_ascii_digit)
        || !bytes
            .iter()
            .all(|b| b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E'))
    {
        return None;
    }
    v.parse::<f64>().ok()
}

pub(crate) fn parse_bool(v: &str) -> Option<bool> {
    if v.eq_ignore_ascii_case("true") {
        Some(true)
    } else if v.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Seconds since the Unix epoch (UTC). Fractional seconds are truncated.
pub(crate) fn parse_timestamp(v: &str) -> Option<i64> {
    let v = v.strip_suffix('Z').unwrap_or(v);
    let v = match v.rsplit_once('.') {
        Some((head, frac))
            if !frac.is_empty() && frac.bytes().all(|b| b.is_ascii_digit()) && head.len() >= 16 =>
        {
            head
        }
        _ => v,
    };
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(v, fmt) {
            return Some(dt.and_utc().timestamp());
        }
    }
    let date = NaiveDate::parse_from_str(v, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp())
}

/// Coerce one raw field. Empty fields are null; `Err(())` means the field did not parse.
pub(crate) fn coerce_field(raw: &[u8], column_type: ColumnType) -> Result<Value, ()> {
    if column_type == ColumnType::Text {
        let text = String::from_utf8_lossy(raw);
        let text = text.trim();
        if text.is_empty() {
            return Ok(Value::Null);
        }
        return Ok(Value::from(text));
    }
    let v = std::str::from_utf8(raw).map_err(|_| ())?.trim();
    if v.is_empty() {
        return Ok(Value::Null);
    }
    let value = match column_type {
        ColumnType::Int64 => parse_int(v).map(Value::Int),
        ColumnType::Float64 => parse_float(v).map(Value::Float),
        ColumnType::Timestamp => parse_timestamp(v).map(Value::Timestamp),
        ColumnType::Boolean => parse_bool(v).map(Value::Boolean),
        ColumnType::Text => unreachable!("text handled above"),
    };
    value.ok_or(())
}

#[derive(Clone, Copy)]
struct Candidates {
    int: bool,
    float: bool,
    timestamp: bool,
    boolean: bool,
    non_empty: usize,
}

impl Candidates {
    fn new() -> Self {
        Self {
            int: true,
            float: true,
            timestamp: true,
            boolean: true,
            non_empty: 0,
        }
    }

    fn observe(&mut self, raw: &[u8]) {
        let Ok(v) = std::str::from_utf8(raw) else {
            self.non_empty += 1;
            self.int = false;
            self.float = false;
            self.timestamp = false;
            self.boolean = false;
            return;
        };
        let v = v.trim();
        if v.is_empty() {
            return;
        }
        self.non_empty += 1;
        if self.int && parse_int(v).is_none() {
            self.int = false;
        }
        if self.float && parse_float(v).is_none() {
            self.float = false;
        }
        if self.timestamp && parse_timestamp(v).is_none() {
            self.timestamp = false;
        }
        if self.boolean && parse_bool(v).is_none() {
            self.boolean = false;
        }
    }

    fn resolve(&self) -> ColumnType {
        if self.non_empty == 0 {
            ColumnType::Text
        } else if self.int {
            ColumnType::Int64
        } else if self.float {
            ColumnType::Float64
        } else if self.timestamp {
            ColumnType::Timestamp
        } else if self.boolean {
            ColumnType::Boolean
        } else {
            ColumnType::Text
        }
    }
}

/// Fill missing names with `columnN` and make every name unique.
pub(crate) fn column_names(header: Option<&ByteRecord>, column_count: usize) -> Vec<String> {
    let mut names: Vec<String> = (0..column_count)
        .map(|i| {
            header
                .and_then(|h| h.get(i))
                .map(|raw| String::from_utf8_lossy(raw).trim().to_owned())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| format!("column{}", i + 1))
        })
        .collect();

    let mut seen: HashSet<String> = HashSet::with_capacity(names.len());
    for name in &mut names {
        if !seen.insert(name.clone()) {
            let mut suffix = 1;
            let mut candidate = format!("{name}_{suffix}");
            while seen.contains(&candidate) {
                suffix += 1;
                candidate = format!("{name}_{suffix}");
            }
            seen.insert(candidate.clone());
            *name = candidate;
        }
    }
    names
}

/// Infer column types from `sample`. The column count is the wider of the header and the widest
/// sampled record.
pub fn infer_schema(header: Option<&ByteRecord>, sample: &[ByteRecord]) -> InferredSchema {
    let column_count = sample
        .iter()
        .map(ByteRecord::len)
        .chain(header.map(ByteRecord::len))
        .max()
        .unwrap_or(0);

    let mut candidates = vec![Candidates::new(); column_count];
    for record in sample {
        for (col, raw) in record.iter().enumerate() {
            candidates[col].observe(raw);
        }
    }

    let names = column_names(header, column_count);
    let mut warnings = Vec::new();
    if sample.is_empty() {
        warnings.push(format!(
            "no records sampled; all {column_count} columns default to {}",
            ColumnType::Text
        ));
    } else {
        for (name, c) in names.iter().zip(&candidates) {
            if c.non_empty == 0 {
                warnings.push(format!(
                    "column {name} has no sampled values; defaulting to {}",
                    ColumnType::Text
                ));
            }
        }
    }

    InferredSchema {
        columns: names
            .into_iter()
            .zip(&candidates)
            .map(|(name, c)| ColumnSchema::new(name, c.resolve()))
            .collect(),
        non_empty: candidates.iter().map(|c| c.non_empty).collect(),
        sampled_rows: sample.len(),
        warnings,
    }
}
