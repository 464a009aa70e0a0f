//! Spill segments: sealed, newline-delimited JSON files holding partial operator state.
//!
//! A [`SpillDir`] is created lazily per query inside the budget's temp directory and removed
//! (with whatever segments are left) when it is dropped, whether the query finished, failed or
//! was cancelled. A sealed [`SpillSegment`] can only be turned into a reader once; the reader
//! deletes the file when it is dropped.

use crate::error::{EngineError, EngineResult};
use crate::memory::MemoryBudget;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub struct SpillDir {
    budget: Arc<MemoryBudget>,
    dir: Option<TempDir>,
    next_segment: u64,
}

impl SpillDir {
    pub fn new(budget: Arc<MemoryBudget>) -> Self {
        Self {
            budget,
            dir: None,
            next_segment: 0,
        }
    }

    /// The directory path, if anything has been spilled yet.
    #[cfg(test)]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(|d| d.path())
    }

    fn ensure_dir(&mut self) -> EngineResult<&Path> {
        let dir = match self.dir.take() {
            Some(dir) => dir,
            None => {
                let root = self.budget.temp_dir();
                std::fs::create_dir_all(root)?;
                let dir = tempfile::Builder::new()
                    .prefix("tripdb-spill-")
                    .tempdir_in(root)?;
                log::debug!("created spill directory {}", dir.path().display());
                dir
            }
        };
        Ok(self.dir.insert(dir).path())
    }

    pub fn create_segment<T: Serialize>(&mut self, label: &str) -> EngineResult<SpillWriter<T>> {
        let id = self.next_segment;
        self.next_segment += 1;
        let path = self.ensure_dir()?.join(format!("{label}-{id:05}.jsonl"));
        let file = File::create(&path)?;
        Ok(SpillWriter {
            path,
            writer: BufWriter::new(file),
            budget: self.budget.clone(),
            records: 0,
            bytes: 0,
            _marker: PhantomData,
        })
    }
}

pub struct SpillWriter<T> {
    path: PathBuf,
    writer: BufWriter<File>,
    budget: Arc<MemoryBudget>,
    records: u64,
    bytes: u64,
    _marker: PhantomData<fn(&T)>,
}

impl<T: Serialize> SpillWriter<T> {
    pub fn write(&mut self, record: &T) -> EngineResult<()> {
        let line = serde_json::to_string(record)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.records += 1;
        self.bytes += line.len() as u64 + 1;
        Ok(())
    }

    /// Flush and seal the segment.
    pub fn finish(mut self) -> EngineResult<SpillSegment<T>> {
        self.writer.flush()?;
        self.budget.record_spill(self.bytes);
        log::debug!(
            "sealed spill segment {} ({} records, {} bytes)",
            self.path.display(),
            self.records,
            self.bytes
        );
        Ok(SpillSegment {
            path: self.path,
            records: self.records,
            bytes: self.bytes,
            _marker: PhantomData,
        })
    }
}

#[derive(Debug)]
pub struct SpillSegment<T> {
    path: PathBuf,
    records: u64,
    bytes: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> SpillSegment<T> {
    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    #[cfg(test)]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn into_reader(self) -> EngineResult<SegmentReader<T>> {
        let file = File::open(&self.path)?;
        log::debug!(
            "reading spill segment {} ({} bytes)",
            self.path.display(),
            self.bytes
        );
        Ok(SegmentReader {
            path: self.path,
            lines: BufReader::new(file).lines(),
            remaining: self.records,
            _marker: PhantomData,
        })
    }
}

pub struct SegmentReader<T> {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    remaining: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Iterator for SegmentReader<T> {
    type Item = EngineResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = match self.lines.next() {
            Some(Ok(line)) => line,
            Some(Err(err)) => return Some(Err(err.into())),
            None if self.remaining == 0 => return None,
            None => {
                let missing = self.remaining;
                self.remaining = 0;
                return Some(Err(EngineError::Spill {
                    path: self.path.clone(),
                    message: format!("segment truncated, {missing} records missing"),
                }));
            }
        };
        self.remaining = self.remaining.saturating_sub(1);
        Some(
            serde_json::from_str(&line).map_err(|err| EngineError::Spill {
                path: self.path.clone(),
                message: format!("corrupt record: {err}"),
            }),
        )
    }
}

impl<T> Drop for SegmentReader<T> {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            log::debug!("failed to remove spill segment {}: {err}", self.path.display());
        }
    }
}
