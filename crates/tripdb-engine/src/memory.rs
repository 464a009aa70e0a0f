//! Memory budget accounting.
//!
//! Operators never allocate blindly: before growing a hash map or a sort buffer they reserve the
//! estimated number of bytes against the shared [`MemoryBudget`]. A denied reservation is the
//! signal to spill. Accounting is lock-free (a CAS loop on an `AtomicUsize`) so parallel shards can
//! share one budget.

use crate::error::{EngineError, EngineResult};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Outcome of [`MemoryBudget::reserve`].
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Grant {
    Granted,
    Denied,
}

impl Grant {
    pub fn is_granted(self) -> bool {
        matches!(self, Grant::Granted)
    }
}

/// Point-in-time view of a budget.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub ceiling: Option<usize>,
    pub reserved: usize,
    pub peak: usize,
    pub spill_segments: u64,
    pub spilled_bytes: u64,
}

#[derive(Debug)]
pub struct MemoryBudget {
    ceiling: Option<usize>,
    temp_dir: PathBuf,
    reserved: AtomicUsize,
    peak: AtomicUsize,
    spill_segments: AtomicU64,
    spilled_bytes: AtomicU64,
}

impl MemoryBudget {
    /// `ceiling: None` means unlimited. Spill directories are created under `temp_dir`.
    pub fn new(ceiling: Option<usize>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            ceiling,
            temp_dir: temp_dir.into(),
            reserved: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            spill_segments: AtomicU64::new(0),
            spilled_bytes: AtomicU64::new(0),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None, std::env::temp_dir())
    }

    pub fn ceiling(&self) -> Option<usize> {
        self.ceiling
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    /// Bytes still available under the ceiling (`None` when unlimited).
    pub fn available(&self) -> Option<usize> {
        self.ceiling
            .map(|ceiling| ceiling.saturating_sub(self.reserved()))
    }

    pub fn reserve(&self, bytes: usize) -> Grant {
        let mut current = self.reserved.load(Ordering::Acquire);
        loop {
            let Some(next) = current.checked_add(bytes) else {
                return Grant::Denied;
            };
            if matches!(self.ceiling, Some(ceiling) if next > ceiling) {
                return Grant::Denied;
            }
            match self.reserved.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::AcqRel);
                    return Grant::Granted;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release(&self, bytes: usize) {
        let _ = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    /// Build the error reported when `requested` bytes cannot be reserved even after spilling.
    pub fn exceeded(&self, requested: usize) -> EngineError {
        EngineError::MemoryExceeded {
            requested,
            in_use: self.reserved(),
            ceiling: self.ceiling.unwrap_or(usize::MAX),
        }
    }

    pub(crate) fn record_spill(&self, bytes: u64) {
        self.spill_segments.fetch_add(1, Ordering::Relaxed);
        self.spilled_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn usage(&self) -> MemoryUsage {
        MemoryUsage {
            ceiling: self.ceiling,
            reserved: self.reserved(),
            peak: self.peak.load(Ordering::Acquire),
            spill_segments: self.spill_segments.load(Ordering::Relaxed),
            spilled_bytes: self.spilled_bytes.load(Ordering::Relaxed),
        }
    }

    /// Reset the peak watermark to the current reservation level.
    pub fn reset_peak(&self) {
        self.peak.store(self.reserved(), Ordering::Release);
    }
}

/// Per-operator share of a [`MemoryBudget`]. Whatever is still held is released on drop, so an
/// operator that bails out with `?` cannot leak reserved bytes.
#[derive(Debug)]
pub struct MemoryReservation {
    budget: Arc<MemoryBudget>,
    size: usize,
    peak: usize,
}

impl MemoryReservation {
    pub fn new(budget: Arc<MemoryBudget>) -> Self {
        Self {
            budget,
            size: 0,
            peak: 0,
        }
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn try_grow(&mut self, bytes: usize) -> Grant {
        let grant = self.budget.reserve(bytes);
        if grant.is_granted() {
            self.size += bytes;
            self.peak = self.peak.max(self.size);
        }
        grant
    }

    /// Like [`try_grow`](Self::try_grow), but a denial is a [`EngineError::MemoryExceeded`].
    pub fn grow(&mut self, bytes: usize) -> EngineResult<()> {
        match self.try_grow(bytes) {
            Grant::Granted => Ok(()),
            Grant::Denied => Err(self.budget.exceeded(bytes)),
        }
    }

    pub fn shrink(&mut self, bytes: usize) {
        let bytes = bytes.min(self.size);
        self.budget.release(bytes);
        self.size -= bytes;
    }

    /// Release everything; returns the number of bytes freed.
    pub fn free(&mut self) -> usize {
        let freed = self.size;
        if freed > 0 {
            self.budget.release(freed);
            self.size = 0;
        }
        freed
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.free();
    }
}

/// Parse a human byte size: `"400MB"`, `"1GiB"`, `"512 kb"`, `"1024"`.
///
/// Decimal units (`KB`, `MB`, `GB`, `TB`) are powers of 1000, binary units (`KiB`, `MiB`, ...)
/// powers of 1024. A bare number is bytes. Fractions are allowed (`"1.5GB"`).
pub fn parse_byte_size(input: &str) -> Option<usize> {
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    if number.is_empty() {
        return None;
    }
    let multiplier: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "k" | "kb" => 1e3,
        "m" | "mb" => 1e6,
        "g" | "gb" => 1e9,
        "t" | "tb" => 1e12,
        "kib" => 1024.0,
        "mib" => 1024.0 * 1024.0,
        "gib" => 1024.0 * 1024.0 * 1024.0,
        "tib" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    let bytes = if number.contains('.') {
        number.parse::<f64>().ok()? * multiplier
    } else {
        number.parse::<u64>().ok()? as f64 * multiplier
    };
    if !bytes.is_finite() || bytes < 0.0 || bytes > usize::MAX as f64 {
        return None;
    }
    Some(bytes.round() as usize)
}
