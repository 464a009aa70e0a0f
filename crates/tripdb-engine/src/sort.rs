//! Sorted runs, k-way run merging and the external sorter built on them.
//!
//! Both the aggregation evaluator (runs of partial groups) and the window evaluator (runs of
//! ordering keys) spill *sorted runs* and read them back through [`merge_runs`]. The merge fan-in
//! is bounded by what the budget can hold for one head item per run; when there are more runs than
//! that, intermediate passes merge groups of runs into new segments first.

use crate::error::EngineResult;
use crate::memory::{MemoryBudget, MemoryReservation};
use crate::spill::{SpillDir, SpillSegment};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

pub(crate) trait RunItem: Ord + Serialize + DeserializeOwned + Send + 'static {}

impl<T: Ord + Serialize + DeserializeOwned + Send + 'static> RunItem for T {}

/// A sequence of items in ascending order, either resident or on disk.
pub(crate) enum SortedRun<T> {
    Memory {
        items: Vec<T>,
        reservation: MemoryReservation,
    },
    Spilled(SpillSegment<T>),
}

impl<T> SortedRun<T> {
    fn is_spilled(&self) -> bool {
        matches!(self, SortedRun::Spilled(_))
    }
}

/// Sort `items` and write them as one sealed segment.
pub(crate) fn spill_sorted<T: RunItem>(
    mut items: Vec<T>,
    spill: &mut SpillDir,
    label: &str,
) -> EngineResult<SpillSegment<T>> {
    items.sort_unstable();
    let mut writer = spill.create_segment(label)?;
    for item in &items {
        writer.write(item)?;
    }
    writer.finish()
}

type Source<T> = Box<dyn Iterator<Item = EngineResult<T>>>;

/// Streaming k-way merge over sorted runs. Equal items come out in run order.
pub(crate) struct MergeIter<T> {
    sources: Vec<Source<T>>,
    heap: BinaryHeap<Reverse<(T, usize)>>,
    _reservations: Vec<MemoryReservation>,
}

impl<T: RunItem> MergeIter<T> {
    fn new(runs: Vec<SortedRun<T>>, heads: MemoryReservation) -> EngineResult<Self> {
        let mut sources: Vec<Source<T>> = Vec::with_capacity(runs.len());
        let mut reservations = vec![heads];
        for run in runs {
            match run {
                SortedRun::Memory { items, reservation } => {
                    reservations.push(reservation);
                    sources.push(Box::new(items.into_iter().map(Ok)));
                }
                SortedRun::Spilled(segment) => sources.push(Box::new(segment.into_reader()?)),
            }
        }
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (idx, source) in sources.iter_mut().enumerate() {
            if let Some(item) = source.next() {
                heap.push(Reverse((item?, idx)));
            }
        }
        Ok(Self {
            sources,
            heap,
            _reservations: reservations,
        })
    }
}

impl<T: RunItem> Iterator for MergeIter<T> {
    type Item = EngineResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse((item, idx)) = self.heap.pop()?;
        match self.sources[idx].next() {
            Some(Ok(next)) => self.heap.push(Reverse((next, idx))),
            Some(Err(err)) => {
                self.heap.clear();
                return Some(Err(err));
            }
            None => {}
        }
        Some(Ok(item))
    }
}

/// How many spilled runs can be merged at once given what is left in the budget.
fn fan_in(budget: &MemoryBudget, head_bytes: usize, max_fan_in: usize) -> usize {
    let max_fan_in = max_fan_in.max(2);
    match budget.available() {
        None => max_fan_in,
        Some(available) => (available / head_bytes.max(1)).clamp(2, max_fan_in),
    }
}

fn reserve_heads(
    budget: &Arc<MemoryBudget>,
    runs: usize,
    head_bytes: usize,
) -> EngineResult<MemoryReservation> {
    let mut heads = MemoryReservation::new(budget.clone());
    heads.grow(runs * head_bytes)?;
    Ok(heads)
}

pub(crate) struct MergeOptions<'a> {
    pub budget: &'a Arc<MemoryBudget>,
    pub head_bytes: usize,
    pub max_fan_in: usize,
    pub label: &'a str,
}

/// Merge `runs` into a single ascending stream. Returns the stream and the number of
/// intermediate passes that had to be written to disk.
pub(crate) fn merge_runs<T: RunItem>(
    mut runs: Vec<SortedRun<T>>,
    spill: &mut SpillDir,
    options: &MergeOptions<'_>,
) -> EngineResult<(MergeIter<T>, u64)> {
    let mut passes = 0;
    loop {
        let spilled = runs.iter().filter(|r| r.is_spilled()).count();
        let width = fan_in(options.budget, options.head_bytes, options.max_fan_in);
        if spilled <= width {
            let heads = reserve_heads(options.budget, spilled, options.head_bytes)?;
            return Ok((MergeIter::new(runs, heads)?, passes));
        }

        let mut group = Vec::with_capacity(width);
        let mut rest = Vec::with_capacity(runs.len() - width + 1);
        for run in runs {
            if run.is_spilled() && group.len() < width {
                group.push(run);
            } else {
                rest.push(run);
            }
        }
        log::debug!(
            "{}: merging {} of {} spilled runs into an intermediate segment",
            options.label,
            group.len(),
            spilled
        );
        let heads = reserve_heads(options.budget, group.len(), options.head_bytes)?;
        let merged = MergeIter::new(group, heads)?;
        let mut writer = spill.create_segment(options.label)?;
        for item in merged {
            writer.write(&item?)?;
        }
        rest.push(SortedRun::Spilled(writer.finish()?));
        runs = rest;
        passes += 1;
    }
}

/// Sorts an unbounded stream of items under the memory budget.
pub(crate) struct ExternalSorter<T> {
    label: &'static str,
    buffer: Vec<T>,
    reservation: MemoryReservation,
    runs: Vec<SortedRun<T>>,
    max_item_bytes: usize,
}

impl<T: RunItem> ExternalSorter<T> {
    pub fn new(budget: Arc<MemoryBudget>, label: &'static str) -> Self {
        Self {
            label,
            buffer: Vec::new(),
            reservation: MemoryReservation::new(budget),
            runs: Vec::new(),
            max_item_bytes: 0,
        }
    }

    pub fn spilled_runs(&self) -> usize {
        self.runs.len()
    }

    /// Buffer `item`, spilling the buffer first if its `bytes` cannot be reserved.
    pub fn push(&mut self, item: T, bytes: usize, spill: &mut SpillDir) -> EngineResult<()> {
        if !self.reservation.try_grow(bytes).is_granted() {
            self.spill(spill)?;
            self.reservation.grow(bytes)?;
        }
        self.max_item_bytes = self.max_item_bytes.max(bytes);
        self.buffer.push(item);
        Ok(())
    }

    fn spill(&mut self, spill: &mut SpillDir) -> EngineResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let items = std::mem::take(&mut self.buffer);
        let segment = spill_sorted(items, spill, self.label)?;
        log::debug!(
            "{}: spilled {} items ({} bytes reserved)",
            self.label,
            segment.records(),
            self.reservation.size()
        );
        self.runs.push(SortedRun::Spilled(segment));
        self.reservation.free();
        Ok(())
    }

    /// Finish input and return the sorted stream plus the number of intermediate merge passes.
    pub fn finish(
        mut self,
        spill: &mut SpillDir,
        max_fan_in: usize,
    ) -> EngineResult<(MergeIter<T>, u64)> {
        if !self.runs.is_empty() {
            // Release the buffer so the merge heads have room.
            self.spill(spill)?;
        }
        let budget = self.reservation.budget().clone();
        let ExternalSorter {
            label,
            mut buffer,
            reservation,
            mut runs,
            max_item_bytes,
        } = self;
        if !buffer.is_empty() {
            buffer.sort_unstable();
            runs.push(SortedRun::Memory {
                items: buffer,
                reservation,
            });
        }
        merge_runs(
            runs,
            spill,
            &MergeOptions {
                budget: &budget,
                head_bytes: max_item_bytes,
                max_fan_in,
                label,
            },
        )
    }
}
