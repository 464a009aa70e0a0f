//! Per-query plumbing shared by the evaluators: cancellation, progress and statistics.

use crate::error::{EngineError, EngineResult};
use crate::memory::{MemoryBudget, MemoryUsage};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative cancellation flag. Clones share the flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn check(&self) -> EngineResult<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Which stage of work a progress report describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    Aggregate,
    Window,
}

/// Emitted once per processed batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub stage: Stage,
    pub batches: u64,
    pub rows: u64,
}

pub type ProgressObserver = Arc<dyn Fn(&Progress) + Send + Sync>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueryStats {
    pub rows_scanned: u64,
    pub rows_filtered_out: u64,
    /// Output groups for aggregations, emitted rows for window functions.
    pub groups: u64,
    pub spill_segments: u64,
    pub spilled_bytes: u64,
    pub merge_passes: u64,
    pub peak_reserved_bytes: usize,
    pub duration: Duration,
}

/// Everything an evaluator needs besides the table itself.
#[derive(Clone)]
pub(crate) struct QueryContext {
    pub budget: Arc<MemoryBudget>,
    pub cancel: CancellationToken,
    pub progress: Option<ProgressObserver>,
    pub max_merge_fan_in: usize,
    pub parallelism: usize,
}

impl QueryContext {
    pub fn report(&self, progress: Progress) {
        if let Some(observer) = &self.progress {
            observer(&progress);
        }
    }
}

/// Tracks spill counters across a query by diffing the budget's totals.
pub(crate) struct StatsScope {
    started: Instant,
    base: MemoryUsage,
}

impl StatsScope {
    pub fn begin(budget: &MemoryBudget) -> Self {
        budget.reset_peak();
        Self {
            started: Instant::now(),
            base: budget.usage(),
        }
    }

    pub fn finish(self, budget: &MemoryBudget, stats: &mut QueryStats) {
        let now = budget.usage();
        stats.spill_segments = now.spill_segments.saturating_sub(self.base.spill_segments);
        stats.spilled_bytes = now.spilled_bytes.saturating_sub(self.base.spilled_bytes);
        stats.peak_reserved_bytes = now.peak.saturating_sub(self.base.reserved);
        stats.duration = self.started.elapsed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(token.check().is_ok());
        other.cancel();
        assert!(matches!(token.check(), Err(EngineError::Cancelled)));
        token.reset();
        assert!(!other.is_cancelled());
    }
}
