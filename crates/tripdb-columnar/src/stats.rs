#![forbid(unsafe_code)]

use crate::types::{ColumnType, Value};
use std::sync::Arc;

/// Per-column statistics maintained while rows are appended.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ColumnStats {
    pub column_type: ColumnType,
    pub null_count: u64,
    pub min: Option<Value>,
    pub max: Option<Value>,
    /// Sum of non-null values; only tracked for numeric columns.
    pub sum: Option<f64>,
}

#[derive(Clone, Debug)]
pub(crate) struct StatsBuilder {
    stats: ColumnStats,
    min_num: Option<f64>,
    max_num: Option<f64>,
    min_int: Option<i64>,
    max_int: Option<i64>,
    min_text: Option<Arc<str>>,
    max_text: Option<Arc<str>>,
    sum: f64,
    trues: u64,
    falses: u64,
}

impl StatsBuilder {
    pub fn new(column_type: ColumnType) -> Self {
        Self {
            stats: ColumnStats {
                column_type,
                ..ColumnStats::default()
            },
            min_num: None,
            max_num: None,
            min_int: None,
            max_int: None,
            min_text: None,
            max_text: None,
            sum: 0.0,
            trues: 0,
            falses: 0,
        }
    }

    pub fn observe_null(&mut self) {
        self.stats.null_count += 1;
    }

    pub fn observe_int(&mut self, v: i64) {
        self.min_int = Some(self.min_int.map_or(v, |m| m.min(v)));
        self.max_int = Some(self.max_int.map_or(v, |m| m.max(v)));
        self.sum += v as f64;
    }

    pub fn observe_float(&mut self, v: f64) {
        self.min_num = Some(self.min_num.map_or(v, |m| m.min(v)));
        self.max_num = Some(self.max_num.map_or(v, |m| m.max(v)));
        self.sum += v;
    }

    pub fn observe_text(&mut self, s: &Arc<str>) {
        if self.min_text.as_deref().map_or(true, |m| s.as_ref() < m) {
            self.min_text = Some(s.clone());
        }
        if self.max_text.as_deref().map_or(true, |m| s.as_ref() > m) {
            self.max_text = Some(s.clone());
        }
    }

    pub fn observe_bool(&mut self, v: bool) {
        if v {
            self.trues += 1;
        } else {
            self.falses += 1;
        }
    }

    pub fn finish(mut self) -> ColumnStats {
        match self.stats.column_type {
            ColumnType::Int64 => {
                self.stats.min = self.min_int.map(Value::Int);
                self.stats.max = self.max_int.map(Value::Int);
                self.stats.sum = Some(self.sum);
            }
            ColumnType::Timestamp => {
                self.stats.min = self.min_int.map(Value::Timestamp);
                self.stats.max = self.max_int.map(Value::Timestamp);
            }
            ColumnType::Float64 => {
                self.stats.min = self.min_num.map(Value::Float);
                self.stats.max = self.max_num.map(Value::Float);
                self.stats.sum = Some(self.sum);
            }
            ColumnType::Text => {
                self.stats.min = self.min_text.map(Value::Text);
                self.stats.max = self.max_text.map(Value::Text);
            }
            ColumnType::Boolean => {
                if self.trues + self.falses > 0 {
                    self.stats.min = Some(Value::Boolean(self.falses == 0));
                    self.stats.max = Some(Value::Boolean(self.trues > 0));
                }
            }
        }
        self.stats
    }
}
