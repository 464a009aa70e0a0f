use crate::error::{EngineError, EngineResult};
use crate::memory::parse_byte_size;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const MEMORY_LIMIT_ENV: &str = "TRIPDB_MEMORY_LIMIT";
pub const TEMP_DIRECTORY_ENV: &str = "TRIPDB_TEMP_DIRECTORY";

/// What ingestion does with a record that has unparseable fields or too many fields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedRowPolicy {
    /// Keep the record, storing null for each failing field.
    #[default]
    CoerceToNull,
    /// Drop the record.
    Reject,
}

/// Engine-wide settings.
///
/// Deserializes from partial documents; missing fields take their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ceiling for operator state in bytes. `None` disables spilling.
    pub memory_limit_bytes: Option<usize>,
    /// Parent directory for per-query spill directories.
    pub temp_dir: PathBuf,
    /// Where persisted tables live. `None` keeps tables in memory only.
    pub data_dir: Option<PathBuf>,
    /// Records sampled for schema inference.
    pub sample_rows: usize,
    /// Records per ingestion batch.
    pub batch_rows: usize,
    /// Batches buffered between the reader thread and the table builder.
    pub max_in_flight_batches: usize,
    pub page_size_rows: usize,
    pub malformed_rows: MalformedRowPolicy,
    /// Aggregation shards; `0` picks the rayon pool size.
    pub parallelism: usize,
    /// Upper bound on the number of runs merged at once.
    pub max_merge_fan_in: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: Some(400_000_000),
            temp_dir: std::env::temp_dir().join("tripdb"),
            data_dir: None,
            sample_rows: 100_000,
            batch_rows: 8_192,
            max_in_flight_batches: 4,
            page_size_rows: 65_536,
            malformed_rows: MalformedRowPolicy::CoerceToNull,
            parallelism: 0,
            max_merge_fan_in: 64,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `TRIPDB_MEMORY_LIMIT` and `TRIPDB_TEMP_DIRECTORY` when set.
    pub fn from_env() -> EngineResult<Self> {
        let mut config = Self::default();
        if let Ok(limit) = std::env::var(MEMORY_LIMIT_ENV) {
            config.memory_limit_bytes = parse_memory_limit(&limit)?;
        }
        if let Ok(dir) = std::env::var(TEMP_DIRECTORY_ENV) {
            if !dir.trim().is_empty() {
                config.temp_dir = PathBuf::from(dir);
            }
        }
        Ok(config)
    }

    pub fn with_memory_limit(mut self, bytes: Option<usize>) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_sample_rows(mut self, rows: usize) -> Self {
        self.sample_rows = rows;
        self
    }

    pub fn with_batch_rows(mut self, rows: usize) -> Self {
        self.batch_rows = rows;
        self
    }

    pub fn with_page_size_rows(mut self, rows: usize) -> Self {
        self.page_size_rows = rows;
        self
    }

    pub fn with_malformed_rows(mut self, policy: MalformedRowPolicy) -> Self {
        self.malformed_rows = policy;
        self
    }

    pub fn with_parallelism(mut self, shards: usize) -> Self {
        self.parallelism = shards;
        self
    }

    pub fn with_max_merge_fan_in(mut self, fan_in: usize) -> Self {
        self.max_merge_fan_in = fan_in;
        self
    }

    pub(crate) fn validate(&self) -> EngineResult<()> {
        if self.batch_rows == 0 {
            return Err(EngineError::InvalidArgument("batch_rows must be > 0".into()));
        }
        if self.max_in_flight_batches == 0 {
            return Err(EngineError::InvalidArgument(
                "max_in_flight_batches must be > 0".into(),
            ));
        }
        if self.max_merge_fan_in < 2 {
            return Err(EngineError::InvalidArgument(
                "max_merge_fan_in must be at least 2".into(),
            ));
        }
        Ok(())
    }
}

/// `"unlimited"`/`"none"` disable the ceiling; anything else goes through [`parse_byte_size`].
pub fn parse_memory_limit(value: &str) -> EngineResult<Option<usize>> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("unlimited") || trimmed.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    parse_byte_size(trimmed)
        .map(Some)
        .ok_or_else(|| EngineError::InvalidArgument(format!("invalid memory limit: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_documents_take_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"memory_limit_bytes": 1024, "malformed_rows": "reject", "temp_dir": "/tmp/x"}"#,
        )
        .unwrap();
        assert_eq!(config.memory_limit_bytes, Some(1024));
        assert_eq!(config.malformed_rows, MalformedRowPolicy::Reject);
        assert_eq!(config.temp_dir, PathBuf::from("/tmp/x"));
        assert_eq!(config.sample_rows, 100_000);
        assert_eq!(config.page_size_rows, 65_536);
    }

    #[test]
    fn memory_limit_strings() {
        assert_eq!(parse_memory_limit("400MB").unwrap(), Some(400_000_000));
        assert_eq!(parse_memory_limit("unlimited").unwrap(), None);
        assert!(matches!(
            parse_memory_limit("lots"),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn validation_rejects_degenerate_settings() {
        assert!(EngineConfig::default().validate().is_ok());
        assert!(EngineConfig::default().with_batch_rows(0).validate().is_err());
        assert!(EngineConfig::default()
            .with_max_merge_fan_in(1)
            .validate()
            .is_err());
    }
}
