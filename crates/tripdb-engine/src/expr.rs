//! Scalar values, derived-column expressions and row filters.
//!
//! Expressions are a closed set (no parser): plain columns plus the handful of derivations the
//! fixed analyses need (calendar parts of a timestamp, rounding, durations, guarded division and
//! scaling). They are bound against a table once per query, resolving column names to slots in a
//! projection, and then evaluated row by row over scan batches.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use tripdb_columnar::{ColumnPage, ColumnType, ColumnarTable, PageValues, ScanBatch, Value};

/// A single typed value flowing through the evaluators: group-key component, aggregate input or
/// result cell.
///
/// The derived order (variant first, then value) is a total order used for sorted runs; output
/// ordering goes through [`Scalar::cmp_nulls_last`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scalar {
    Null,
    Boolean(bool),
    Int(i64),
    Float(OrderedFloat<f64>),
    Timestamp(i64),
    Text(Arc<str>),
}

impl Scalar {
    pub fn float(v: f64) -> Self {
        Scalar::Float(OrderedFloat(v))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Numeric view; integers widen and booleans read as 0/1.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(v) => Some(*v as f64),
            Scalar::Float(v) => Some(v.0),
            Scalar::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) | Scalar::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Heap bytes owned beyond the enum itself.
    pub fn heap_bytes(&self) -> usize {
        match self {
            Scalar::Text(s) => s.len(),
            _ => 0,
        }
    }

    /// Ordering for result rows: nulls after everything else, numbers compared numerically
    /// across integer and float.
    pub fn cmp_nulls_last(&self, other: &Scalar) -> Ordering {
        match (self, other) {
            (Scalar::Null, Scalar::Null) => Ordering::Equal,
            (Scalar::Null, _) => Ordering::Greater,
            (_, Scalar::Null) => Ordering::Less,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => OrderedFloat(x).cmp(&OrderedFloat(y)),
                _ => a.cmp(b),
            },
        }
    }
}

impl From<Value> for Scalar {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Scalar::Null,
            Value::Int(v) => Scalar::Int(v),
            Value::Float(v) => Scalar::float(v),
            Value::Text(s) => Scalar::Text(s),
            Value::Timestamp(v) => Scalar::Timestamp(v),
            Value::Boolean(b) => Scalar::Boolean(b),
        }
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::float(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Text(Arc::from(s))
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => f.write_str("NULL"),
            Scalar::Boolean(b) => write!(f, "{b}"),
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::Float(v) => write!(f, "{}", v.0),
            Scalar::Timestamp(secs) => match DateTime::<Utc>::from_timestamp(*secs, 0) {
                Some(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
                None => write!(f, "@{secs}"),
            },
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

pub const WEEKDAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

/// English weekday name, Monday first.
pub fn weekday_name(day: Weekday) -> &'static str {
    WEEKDAY_NAMES[day.num_days_from_monday() as usize]
}

/// A (possibly derived) per-row value.
#[derive(Clone, Debug, PartialEq)]
pub enum ScalarExpr {
    Column(String),
    Literal(f64),
    /// Hour of day (0-23) of a timestamp column.
    Hour(String),
    /// Day of month (1-31) of a timestamp column.
    DayOfMonth(String),
    /// ISO day of week, Monday = 1.
    DayOfWeek(String),
    /// English weekday name of a timestamp column.
    DayName(String),
    /// Round half away from zero to `digits` decimal places.
    Round {
        expr: Box<ScalarExpr>,
        digits: u32,
    },
    /// `end - start` in seconds.
    DurationSeconds {
        start: String,
        end: String,
    },
    /// Null when the denominator is zero or null.
    Div {
        numerator: Box<ScalarExpr>,
        denominator: Box<ScalarExpr>,
    },
    Scale {
        expr: Box<ScalarExpr>,
        factor: f64,
    },
}

impl ScalarExpr {
    pub fn col(name: impl Into<String>) -> Self {
        ScalarExpr::Column(name.into())
    }

    pub fn lit(v: f64) -> Self {
        ScalarExpr::Literal(v)
    }

    pub fn hour(column: impl Into<String>) -> Self {
        ScalarExpr::Hour(column.into())
    }

    pub fn day_of_month(column: impl Into<String>) -> Self {
        ScalarExpr::DayOfMonth(column.into())
    }

    pub fn day_of_week(column: impl Into<String>) -> Self {
        ScalarExpr::DayOfWeek(column.into())
    }

    pub fn day_name(column: impl Into<String>) -> Self {
        ScalarExpr::DayName(column.into())
    }

    pub fn round(expr: ScalarExpr, digits: u32) -> Self {
        ScalarExpr::Round {
            expr: Box::new(expr),
            digits,
        }
    }

    pub fn duration_seconds(start: impl Into<String>, end: impl Into<String>) -> Self {
        ScalarExpr::DurationSeconds {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn div(numerator: ScalarExpr, denominator: ScalarExpr) -> Self {
        ScalarExpr::Div {
            numerator: Box::new(numerator),
            denominator: Box::new(denominator),
        }
    }

    pub fn scale(expr: ScalarExpr, factor: f64) -> Self {
        ScalarExpr::Scale {
            expr: Box::new(expr),
            factor,
        }
    }

    /// Output column name used when the caller does not pick one.
    pub fn default_name(&self) -> String {
        match self {
            ScalarExpr::Column(name) => name.clone(),
            ScalarExpr::Literal(v) => v.to_string(),
            ScalarExpr::Hour(c) => format!("hour({c})"),
            ScalarExpr::DayOfMonth(c) => format!("day({c})"),
            ScalarExpr::DayOfWeek(c) => format!("isodow({c})"),
            ScalarExpr::DayName(c) => format!("dayname({c})"),
            ScalarExpr::Round { expr, digits } => {
                format!("round({}, {digits})", expr.default_name())
            }
            ScalarExpr::DurationSeconds { start, end } => format!("seconds({end} - {start})"),
            ScalarExpr::Div {
                numerator,
                denominator,
            } => format!(
                "{} / {}",
                numerator.default_name(),
                denominator.default_name()
            ),
            ScalarExpr::Scale { expr, factor } => format!("{} * {factor}", expr.default_name()),
        }
    }
}

/// Row filter comparing a numeric expression against a constant. A null operand fails the filter.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    NotEq(ScalarExpr, f64),
    Gt(ScalarExpr, f64),
    GtEq(ScalarExpr, f64),
    Lt(ScalarExpr, f64),
    LtEq(ScalarExpr, f64),
}

#[derive(Clone, Copy, Debug)]
enum CmpOp {
    NotEq,
    Gt,
    GtEq,
    Lt,
    LtEq,
}

/// Expression with column names resolved to projection slots.
#[derive(Clone, Debug)]
pub(crate) enum BoundExpr {
    Column(usize),
    Literal(f64),
    Hour(usize),
    DayOfMonth(usize),
    DayOfWeek(usize),
    DayName { slot: usize, names: [Arc<str>; 7] },
    Round { input: Box<BoundExpr>, factor: f64 },
    Duration { start: usize, end: usize },
    Div(Box<BoundExpr>, Box<BoundExpr>),
    Scale(Box<BoundExpr>, f64),
}

#[derive(Clone, Debug)]
pub(crate) struct BoundPredicate {
    expr: BoundExpr,
    op: CmpOp,
    rhs: f64,
}

fn timestamp_at(page: &ColumnPage<'_>, row: usize) -> Option<DateTime<Utc>> {
    page.i64_at(row)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
}

fn numeric_at(page: &ColumnPage<'_>, row: usize) -> Option<f64> {
    match page.values() {
        PageValues::Timestamp(_) => page.i64_at(row).map(|v| v as f64),
        _ => page.f64_at(row),
    }
}

impl BoundExpr {
    pub fn eval(&self, batch: &ScanBatch<'_>, row: usize) -> Scalar {
        match self {
            BoundExpr::Column(slot) => Scalar::from(batch.column(*slot).value(row)),
            BoundExpr::Hour(slot) => timestamp_at(&batch.column(*slot), row)
                .map_or(Scalar::Null, |ts| Scalar::Int(ts.hour() as i64)),
            BoundExpr::DayOfMonth(slot) => timestamp_at(&batch.column(*slot), row)
                .map_or(Scalar::Null, |ts| Scalar::Int(ts.day() as i64)),
            BoundExpr::DayOfWeek(slot) => timestamp_at(&batch.column(*slot), row).map_or(
                Scalar::Null,
                |ts| Scalar::Int(ts.weekday().number_from_monday() as i64),
            ),
            BoundExpr::DayName { slot, names } => timestamp_at(&batch.column(*slot), row)
                .map_or(Scalar::Null, |ts| {
                    Scalar::Text(names[ts.weekday().num_days_from_monday() as usize].clone())
                }),
            BoundExpr::Duration { .. } => self
                .eval_f64(batch, row)
                .map_or(Scalar::Null, |v| Scalar::Int(v as i64)),
            BoundExpr::Literal(_)
            | BoundExpr::Round { .. }
            | BoundExpr::Div(..)
            | BoundExpr::Scale(..) => self.eval_f64(batch, row).map_or(Scalar::Null, Scalar::float),
        }
    }

    /// Numeric evaluation without building a [`Scalar`]. Timestamps read as epoch seconds.
    pub fn eval_f64(&self, batch: &ScanBatch<'_>, row: usize) -> Option<f64> {
        match self {
            BoundExpr::Column(slot) => numeric_at(&batch.column(*slot), row),
            BoundExpr::Literal(v) => Some(*v),
            BoundExpr::Hour(slot) => {
                timestamp_at(&batch.column(*slot), row).map(|t| t.hour() as f64)
            }
            BoundExpr::DayOfMonth(slot) => {
                timestamp_at(&batch.column(*slot), row).map(|t| t.day() as f64)
            }
            BoundExpr::DayOfWeek(slot) => timestamp_at(&batch.column(*slot), row)
                .map(|t| t.weekday().number_from_monday() as f64),
            BoundExpr::DayName { .. } => None,
            BoundExpr::Round { input, factor } => input
                .eval_f64(batch, row)
                .map(|v| (v * factor).round() / factor),
            BoundExpr::Duration { start, end } => {
                let start = batch.column(*start).i64_at(row)?;
                let end = batch.column(*end).i64_at(row)?;
                Some(end.checked_sub(start)? as f64)
            }
            BoundExpr::Div(num, den) => {
                let den = den.eval_f64(batch, row)?;
                if den == 0.0 {
                    return None;
                }
                Some(num.eval_f64(batch, row)? / den)
            }
            BoundExpr::Scale(input, factor) => input.eval_f64(batch, row).map(|v| v * factor),
        }
    }
}

impl BoundPredicate {
    pub fn matches(&self, batch: &ScanBatch<'_>, row: usize) -> bool {
        let Some(v) = self.expr.eval_f64(batch, row) else {
            return false;
        };
        match self.op {
            CmpOp::NotEq => v != self.rhs,
            CmpOp::Gt => v > self.rhs,
            CmpOp::GtEq => v >= self.rhs,
            CmpOp::Lt => v < self.rhs,
            CmpOp::LtEq => v <= self.rhs,
        }
    }
}

fn is_numeric(ty: ColumnType) -> bool {
    matches!(
        ty,
        ColumnType::Int64 | ColumnType::Float64 | ColumnType::Boolean
    )
}

/// Resolves expressions against a table, collecting the projection the query needs.
pub(crate) struct Binder<'t> {
    table: &'t ColumnarTable,
    projection: Vec<usize>,
}

impl<'t> Binder<'t> {
    pub fn new(table: &'t ColumnarTable) -> Self {
        Self {
            table,
            projection: Vec::new(),
        }
    }

    /// Table column indices to scan, in slot order.
    pub fn projection(&self) -> &[usize] {
        &self.projection
    }

    fn slot(&mut self, name: &str) -> EngineResult<(usize, ColumnType)> {
        let col = self
            .table
            .column_index(name)
            .ok_or_else(|| EngineError::UnknownColumn(name.to_owned()))?;
        let ty = self.table.schema()[col].column_type;
        let slot = match self.projection.iter().position(|&c| c == col) {
            Some(slot) => slot,
            None => {
                self.projection.push(col);
                self.projection.len() - 1
            }
        };
        Ok((slot, ty))
    }

    fn timestamp_slot(&mut self, name: &str) -> EngineResult<usize> {
        let (slot, ty) = self.slot(name)?;
        if ty != ColumnType::Timestamp {
            return Err(EngineError::TypeMismatch {
                column: name.to_owned(),
                expected: ColumnType::Timestamp.name(),
                actual: ty,
            });
        }
        Ok(slot)
    }

    /// Bind an expression and report its output type.
    pub fn bind(&mut self, expr: &ScalarExpr) -> EngineResult<(BoundExpr, ColumnType)> {
        Ok(match expr {
            ScalarExpr::Column(name) => {
                let (slot, ty) = self.slot(name)?;
                (BoundExpr::Column(slot), ty)
            }
            ScalarExpr::Literal(v) => (BoundExpr::Literal(*v), ColumnType::Float64),
            ScalarExpr::Hour(c) => (BoundExpr::Hour(self.timestamp_slot(c)?), ColumnType::Int64),
            ScalarExpr::DayOfMonth(c) => (
                BoundExpr::DayOfMonth(self.timestamp_slot(c)?),
                ColumnType::Int64,
            ),
            ScalarExpr::DayOfWeek(c) => (
                BoundExpr::DayOfWeek(self.timestamp_slot(c)?),
                ColumnType::Int64,
            ),
            ScalarExpr::DayName(c) => (
                BoundExpr::DayName {
                    slot: self.timestamp_slot(c)?,
                    names: WEEKDAY_NAMES.map(Arc::<str>::from),
                },
                ColumnType::Text,
            ),
            ScalarExpr::Round { expr, digits } => {
                let input = self.bind_numeric(expr)?;
                let factor = 10f64.powi((*digits).min(15) as i32);
                (
                    BoundExpr::Round {
                        input: Box::new(input),
                        factor,
                    },
                    ColumnType::Float64,
                )
            }
            ScalarExpr::DurationSeconds { start, end } => (
                BoundExpr::Duration {
                    start: self.timestamp_slot(start)?,
                    end: self.timestamp_slot(end)?,
                },
                ColumnType::Int64,
            ),
            ScalarExpr::Div {
                numerator,
                denominator,
            } => {
                let num = self.bind_numeric(numerator)?;
                let den = self.bind_numeric(denominator)?;
                (
                    BoundExpr::Div(Box::new(num), Box::new(den)),
                    ColumnType::Float64,
                )
            }
            ScalarExpr::Scale { expr, factor } => {
                let input = self.bind_numeric(expr)?;
                (
                    BoundExpr::Scale(Box::new(input), *factor),
                    ColumnType::Float64,
                )
            }
        })
    }

    pub fn bind_numeric(&mut self, expr: &ScalarExpr) -> EngineResult<BoundExpr> {
        let (bound, ty) = self.bind(expr)?;
        if !is_numeric(ty) {
            return Err(EngineError::TypeMismatch {
                column: expr.default_name(),
                expected: "numeric",
                actual: ty,
            });
        }
        Ok(bound)
    }

    /// Bind an expression that must yield an orderable number (numeric or timestamp).
    pub fn bind_orderable(&mut self, expr: &ScalarExpr) -> EngineResult<BoundExpr> {
        let (bound, ty) = self.bind(expr)?;
        if !(is_numeric(ty) || ty == ColumnType::Timestamp) {
            return Err(EngineError::TypeMismatch {
                column: expr.default_name(),
                expected: "numeric or timestamp",
                actual: ty,
            });
        }
        Ok(bound)
    }

    pub fn bind_predicate(&mut self, predicate: &Predicate) -> EngineResult<BoundPredicate> {
        let (expr, op, rhs) = match predicate {
            Predicate::NotEq(e, v) => (e, CmpOp::NotEq, *v),
            Predicate::Gt(e, v) => (e, CmpOp::Gt, *v),
            Predicate::GtEq(e, v) => (e, CmpOp::GtEq, *v),
            Predicate::Lt(e, v) => (e, CmpOp::Lt, *v),
            Predicate::LtEq(e, v) => (e, CmpOp::LtEq, *v),
        };
        Ok(BoundPredicate {
            expr: self.bind_orderable(expr)?,
            op,
            rhs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tripdb_columnar::{ColumnSchema, ColumnarTableBuilder, TableOptions};

    // 2016-03-07 was a Monday.
    const MONDAY_0930: i64 = 1_457_343_000;

    fn table() -> ColumnarTable {
        let schema = vec![
            ColumnSchema::new("pickup", ColumnType::Timestamp),
            ColumnSchema::new("dropoff", ColumnType::Timestamp),
            ColumnSchema::new("fare", ColumnType::Float64),
            ColumnSchema::new("tip", ColumnType::Float64),
            ColumnSchema::new("vendor", ColumnType::Text),
        ];
        let mut builder = ColumnarTableBuilder::new(schema, TableOptions::default());
        builder
            .append_row(&[
                Value::Timestamp(MONDAY_0930),
                Value::Timestamp(MONDAY_0930 + 600),
                Value::Float(12.346),
                Value::Float(2.0),
                Value::from("CMT"),
            ])
            .unwrap();
        builder
            .append_row(&[
                Value::Timestamp(MONDAY_0930 + 6 * 86_400 + 14 * 3_600),
                Value::Null,
                Value::Float(0.0),
                Value::Float(1.0),
                Value::Null,
            ])
            .unwrap();
        builder.finalize()
    }

    fn eval_all(table: &ColumnarTable, expr: &ScalarExpr) -> Vec<Scalar> {
        let mut binder = Binder::new(table);
        let (bound, _) = binder.bind(expr).unwrap();
        let mut out = Vec::new();
        for batch in table.scan().batches(binder.projection()).unwrap() {
            for row in 0..batch.len() {
                out.push(bound.eval(&batch, row));
            }
        }
        out
    }

    #[test]
    fn calendar_parts() {
        let t = table();
        assert_eq!(
            eval_all(&t, &ScalarExpr::hour("pickup")),
            vec![Scalar::Int(9), Scalar::Int(23)]
        );
        assert_eq!(
            eval_all(&t, &ScalarExpr::day_of_month("pickup")),
            vec![Scalar::Int(7), Scalar::Int(13)]
        );
        assert_eq!(
            eval_all(&t, &ScalarExpr::day_of_week("pickup")),
            vec![Scalar::Int(1), Scalar::Int(7)]
        );
        assert_eq!(
            eval_all(&t, &ScalarExpr::day_name("pickup")),
            vec![Scalar::from("Monday"), Scalar::from("Sunday")]
        );
    }

    #[test]
    fn derived_numbers_and_null_guards() {
        let t = table();
        assert_eq!(
            eval_all(&t, &ScalarExpr::round(ScalarExpr::col("fare"), 2)),
            vec![Scalar::float(12.35), Scalar::float(0.0)]
        );
        assert_eq!(
            eval_all(&t, &ScalarExpr::duration_seconds("pickup", "dropoff")),
            vec![Scalar::Int(600), Scalar::Null]
        );
        let tip_pct = ScalarExpr::scale(
            ScalarExpr::div(ScalarExpr::col("tip"), ScalarExpr::col("fare")),
            100.0,
        );
        let values = eval_all(&t, &tip_pct);
        assert!((values[0].as_f64().unwrap() - 16.19958).abs() < 1e-4);
        assert_eq!(values[1], Scalar::Null);
    }

    #[test]
    fn binding_checks_names_and_types() {
        let t = table();
        let mut binder = Binder::new(&t);
        assert!(matches!(
            binder.bind(&ScalarExpr::col("nope")),
            Err(EngineError::UnknownColumn(name)) if name == "nope"
        ));
        assert!(matches!(
            binder.bind(&ScalarExpr::hour("fare")),
            Err(EngineError::TypeMismatch { .. })
        ));
        assert!(matches!(
            binder.bind(&ScalarExpr::round(ScalarExpr::col("vendor"), 1)),
            Err(EngineError::TypeMismatch { .. })
        ));
        binder.bind(&ScalarExpr::col("tip")).unwrap();
        binder.bind(&ScalarExpr::hour("pickup")).unwrap();
        binder.bind(&ScalarExpr::col("tip")).unwrap();
        assert_eq!(binder.projection(), &[3, 0]);
    }

    #[test]
    fn predicates_fail_on_null() {
        let t = table();
        let mut binder = Binder::new(&t);
        let positive = binder
            .bind_predicate(&Predicate::Gt(
                ScalarExpr::duration_seconds("pickup", "dropoff"),
                60.0,
            ))
            .unwrap();
        let nonzero = binder
            .bind_predicate(&Predicate::NotEq(ScalarExpr::col("fare"), 0.0))
            .unwrap();
        let batch = t.scan().batches(binder.projection()).unwrap().next().unwrap();
        assert!(positive.matches(&batch, 0));
        assert!(!positive.matches(&batch, 1));
        assert!(nonzero.matches(&batch, 0));
        assert!(!nonzero.matches(&batch, 1));
    }

    #[test]
    fn result_ordering_puts_nulls_last() {
        let mut values = vec![
            Scalar::Null,
            Scalar::float(2.5),
            Scalar::Int(3),
            Scalar::Int(-1),
        ];
        values.sort_by(Scalar::cmp_nulls_last);
        assert_eq!(
            values,
            vec![
                Scalar::Int(-1),
                Scalar::float(2.5),
                Scalar::Int(3),
                Scalar::Null
            ]
        );
    }
}
