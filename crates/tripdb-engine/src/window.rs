//! Window functions evaluated by sorted streaming.
//!
//! Every function turns each row into a small sort item, pushes it through an
//! [`ExternalSorter`] (which spills sorted runs when the budget denies growth) and walks the
//! merged stream once. Ordering keys sort nulls last in both directions and break ties by row id,
//! so results are deterministic whether or not anything spilled.

use crate::error::{EngineError, EngineResult};
use crate::expr::{Binder, Scalar, ScalarExpr};
use crate::memory::MemoryReservation;
use crate::query::{Progress, QueryContext, QueryStats, Stage, StatsScope};
use crate::sort::{ExternalSorter, MergeIter, RunItem};
use crate::spill::SpillDir;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::mem::size_of;
use tripdb_columnar::{ColumnarTable, ScanBatch};

/// Sorter bookkeeping per buffered item on top of the item itself.
const ITEM_OVERHEAD: usize = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// How equal ordering values are ranked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankMode {
    /// Ties broken by row id; ranks are distinct (`ROW_NUMBER()`).
    #[default]
    RowNumber,
    /// Ties share a rank and the next rank skips (`RANK()`).
    Competition,
}

/// Collected window results as `(row_id, value)` in ordering order.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WindowOutput<T> {
    pub rows: Vec<(u64, T)>,
    pub stats: QueryStats,
}

impl<T> WindowOutput<T> {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values indexed by row id, for joining several window results back onto the table.
    pub fn by_row(&self, row_count: usize) -> Vec<Option<&T>> {
        let mut out = vec![None; row_count];
        for (row, value) in &self.rows {
            if let Some(slot) = out.get_mut(*row as usize) {
                *slot = Some(value);
            }
        }
        out
    }
}

/// Sort key for a numeric ordering value. `null` sorts after every number; descending order
/// negates the value so a single ascending sort serves both directions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct OrderKey {
    null: bool,
    value: OrderedFloat<f64>,
}

impl OrderKey {
    fn new(value: Option<f64>, direction: SortDirection) -> Self {
        match value {
            None => Self {
                null: true,
                value: OrderedFloat(0.0),
            },
            Some(v) => Self {
                null: false,
                value: OrderedFloat(match direction {
                    SortDirection::Ascending => v,
                    SortDirection::Descending => -v,
                }),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct RankItem {
    partition: Scalar,
    order: OrderKey,
    row: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct MovingItem {
    order: OrderKey,
    row: u64,
    value: Option<OrderedFloat<f64>>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct TileItem {
    order: OrderKey,
    row: u64,
}

/// Scan the projection, turn every row into a sort item and return the merged, ordered stream.
fn sorted_stream<T, F>(
    table: &ColumnarTable,
    projection: &[usize],
    ctx: &QueryContext,
    spill: &mut SpillDir,
    label: &'static str,
    stats: &mut QueryStats,
    mut make: F,
) -> EngineResult<MergeIter<T>>
where
    T: RunItem,
    F: FnMut(&ScanBatch<'_>, usize, u64) -> (T, usize),
{
    let mut sorter = ExternalSorter::new(ctx.budget.clone(), label);
    let mut batches = 0u64;
    for batch in table.scan().batches(projection)? {
        ctx.cancel.check()?;
        for row in 0..batch.len() {
            let (item, bytes) = make(&batch, row, (batch.row_start + row) as u64);
            sorter.push(item, bytes + ITEM_OVERHEAD, spill)?;
        }
        batches += 1;
        stats.rows_scanned += batch.len() as u64;
        ctx.report(Progress {
            stage: Stage::Window,
            batches,
            rows: stats.rows_scanned,
        });
    }
    if sorter.spilled_runs() > 0 {
        log::debug!("{label}: {} sorted runs on disk", sorter.spilled_runs());
    }
    let (merged, passes) = sorter.finish(spill, ctx.max_merge_fan_in)?;
    stats.merge_passes = passes;
    Ok(merged)
}

/// Calls `emit` with `(index, item)` for each merged item, checking for cancellation as it goes.
fn drain<T, F>(
    stream: impl Iterator<Item = EngineResult<T>>,
    ctx: &QueryContext,
    mut emit: F,
) -> EngineResult<u64>
where
    F: FnMut(u64, T) -> EngineResult<()>,
{
    let mut n = 0u64;
    for item in stream {
        if n % 4_096 == 0 {
            ctx.cancel.check()?;
        }
        emit(n, item?)?;
        n += 1;
    }
    Ok(n)
}

fn finish(scope: StatsScope, ctx: &QueryContext, mut stats: QueryStats, label: &str) -> QueryStats {
    scope.finish(&ctx.budget, &mut stats);
    log::info!(
        "{label}: {} rows in {:.2?} ({} spill segments, {} merge passes)",
        stats.groups,
        stats.duration,
        stats.spill_segments,
        stats.merge_passes
    );
    stats
}

/// Rank rows within each partition by `order`, streaming `(row_id, rank)` to `sink` in
/// `(partition, rank)` order.
pub(crate) fn rank_within_partition_into<F>(
    table: &ColumnarTable,
    partition: &ScalarExpr,
    order: &ScalarExpr,
    direction: SortDirection,
    mode: RankMode,
    ctx: &QueryContext,
    mut sink: F,
) -> EngineResult<QueryStats>
where
    F: FnMut(u64, u64),
{
    let scope = StatsScope::begin(&ctx.budget);
    let mut binder = Binder::new(table);
    let (partition, _) = binder.bind(partition)?;
    let order = binder.bind_orderable(order)?;
    let projection = binder.projection().to_vec();

    let mut stats = QueryStats::default();
    let mut spill = SpillDir::new(ctx.budget.clone());
    let stream = sorted_stream(
        table,
        &projection,
        ctx,
        &mut spill,
        "rank",
        &mut stats,
        |batch, row, id| {
            let partition = partition.eval(batch, row);
            let bytes = size_of::<RankItem>() + partition.heap_bytes();
            let item = RankItem {
                partition,
                order: OrderKey::new(order.eval_f64(batch, row), direction),
                row: id,
            };
            (item, bytes)
        },
    )?;

    let mut current: Option<(Scalar, OrderKey)> = None;
    let mut position = 0u64;
    let mut rank = 0u64;
    stats.groups = drain(stream, ctx, |_, item| {
        match &mut current {
            Some((partition, last)) if *partition == item.partition => {
                position += 1;
                if mode == RankMode::RowNumber || *last != item.order {
                    rank = position;
                }
                *last = item.order;
            }
            _ => {
                position = 1;
                rank = 1;
                current = Some((item.partition, item.order));
            }
        }
        sink(item.row, rank);
        Ok(())
    })?;
    Ok(finish(scope, ctx, stats, "rank"))
}

/// Centered moving average of `value` over rows ordered by `order` (ties by row id). The window
/// `[i - radius, i + radius]` is clipped at both ends; nulls are left out of the average and a
/// window without values yields `None`.
pub(crate) fn moving_average_into<F>(
    table: &ColumnarTable,
    order: &ScalarExpr,
    value: &ScalarExpr,
    radius: usize,
    ctx: &QueryContext,
    mut sink: F,
) -> EngineResult<QueryStats>
where
    F: FnMut(u64, Option<f64>),
{
    let scope = StatsScope::begin(&ctx.budget);
    let mut binder = Binder::new(table);
    let order = binder.bind_orderable(order)?;
    let value = binder.bind_numeric(value)?;
    let projection = binder.projection().to_vec();

    // The frame buffer holds at most 2r+1 entries for the whole pass. Reserved ahead of the sort,
    // which then spills within whatever is left.
    let frame_len = radius
        .saturating_mul(2)
        .saturating_add(1)
        .min(table.row_count().max(1));
    let mut frame_reservation = MemoryReservation::new(ctx.budget.clone());
    frame_reservation.grow(frame_len.saturating_mul(size_of::<(u64, Option<f64>)>()))?;

    let mut stats = QueryStats::default();
    let mut spill = SpillDir::new(ctx.budget.clone());
    let stream = sorted_stream(
        table,
        &projection,
        ctx,
        &mut spill,
        "moving-average",
        &mut stats,
        |batch, row, id| {
            let item = MovingItem {
                order: OrderKey::new(order.eval_f64(batch, row), SortDirection::Ascending),
                row: id,
                value: value.eval_f64(batch, row).map(OrderedFloat),
            };
            (item, size_of::<MovingItem>())
        },
    )?;

    let mut window = SlidingWindow::new(radius);
    stats.groups = drain(stream, ctx, |_, item| {
        if let Some((row, avg)) = window.push(item.row, item.value.map(|v| v.0)) {
            sink(row, avg);
        }
        Ok(())
    })?;
    for (row, avg) in window.finish() {
        sink(row, avg);
    }
    drop(frame_reservation);
    Ok(finish(scope, ctx, stats, "moving-average"))
}

/// Streaming centered window: after item `j` is pushed, the average centered on `j - radius` is
/// complete.
struct SlidingWindow {
    radius: usize,
    frame: VecDeque<(u64, Option<f64>)>,
    /// Stream index of `frame[0]`.
    front: usize,
    /// Next stream index to be pushed.
    next: usize,
    /// Next center to emit.
    center: usize,
    sum: f64,
    count: u64,
}

impl SlidingWindow {
    fn new(radius: usize) -> Self {
        Self {
            radius,
            frame: VecDeque::new(),
            front: 0,
            next: 0,
            center: 0,
            sum: 0.0,
            count: 0,
        }
    }

    fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    fn pop_front(&mut self) {
        if let Some((_, value)) = self.frame.pop_front() {
            if let Some(v) = value {
                self.sum -= v;
                self.count -= 1;
            }
            self.front += 1;
        }
    }

    /// Drop entries that fell out of the frame of `self.center` and emit it.
    fn emit_center(&mut self) -> (u64, Option<f64>) {
        while self.front + self.radius < self.center {
            self.pop_front();
        }
        let (row, _) = self.frame[self.center - self.front];
        self.center += 1;
        (row, self.average())
    }

    fn push(&mut self, row: u64, value: Option<f64>) -> Option<(u64, Option<f64>)> {
        if let Some(v) = value {
            self.sum += v;
            self.count += 1;
        }
        self.frame.push_back((row, value));
        self.next += 1;
        (self.next > self.center + self.radius).then(|| self.emit_center())
    }

    /// Centers whose frames run past the end of the stream.
    fn finish(mut self) -> Vec<(u64, Option<f64>)> {
        let mut out = Vec::with_capacity(self.next - self.center);
        while self.center < self.next {
            out.push(self.emit_center());
        }
        out
    }
}

/// 1-based NTILE bucket of stream position `position` out of `n` rows and `tiles` buckets.
fn tile_of(position: u64, n: u64, tiles: u64) -> u64 {
    let q = n / tiles;
    let m = n % tiles;
    let big = m * (q + 1);
    if position < big {
        position / (q + 1) + 1
    } else {
        m + (position - big) / q + 1
    }
}

/// Assign each row to one of `tiles` equal-count buckets by ascending `order` (nulls last).
pub(crate) fn percentile_tile_into<F>(
    table: &ColumnarTable,
    order: &ScalarExpr,
    tiles: u32,
    ctx: &QueryContext,
    mut sink: F,
) -> EngineResult<QueryStats>
where
    F: FnMut(u64, u32),
{
    if tiles == 0 {
        return Err(EngineError::InvalidArgument(
            "tile count must be at least 1".into(),
        ));
    }
    let scope = StatsScope::begin(&ctx.budget);
    let mut binder = Binder::new(table);
    let order = binder.bind_orderable(order)?;
    let projection = binder.projection().to_vec();

    let mut stats = QueryStats::default();
    let mut spill = SpillDir::new(ctx.budget.clone());
    let stream = sorted_stream(
        table,
        &projection,
        ctx,
        &mut spill,
        "tile",
        &mut stats,
        |batch, row, id| {
            let item = TileItem {
                order: OrderKey::new(order.eval_f64(batch, row), SortDirection::Ascending),
                row: id,
            };
            (item, size_of::<TileItem>())
        },
    )?;

    let n = table.row_count() as u64;
    stats.groups = drain(stream, ctx, |position, item| {
        sink(item.row, tile_of(position, n, u64::from(tiles)) as u32);
        Ok(())
    })?;
    Ok(finish(scope, ctx, stats, "tile"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBudget;
    use crate::query::CancellationToken;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::sync::Arc;
    use tripdb_columnar::{ColumnSchema, ColumnType, ColumnarTableBuilder, TableOptions, Value};

    fn ctx(ceiling: Option<usize>, dir: &std::path::Path) -> QueryContext {
        QueryContext {
            budget: Arc::new(MemoryBudget::new(ceiling, dir)),
            cancel: CancellationToken::new(),
            progress: None,
            max_merge_fan_in: 8,
            parallelism: 1,
        }
    }

    /// `(day, fare)` rows.
    fn table(rows: &[(i64, Option<f64>)]) -> ColumnarTable {
        let schema = vec![
            ColumnSchema::new("day", ColumnType::Int64),
            ColumnSchema::new("fare", ColumnType::Float64),
        ];
        let mut builder = ColumnarTableBuilder::new(schema, TableOptions { page_size_rows: 4 });
        for &(day, fare) in rows {
            builder
                .append_row(&[Value::Int(day), fare.map_or(Value::Null, Value::Float)])
                .unwrap();
        }
        builder.finalize()
    }

    fn ranks(
        table: &ColumnarTable,
        direction: SortDirection,
        mode: RankMode,
        ctx: &QueryContext,
    ) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        rank_within_partition_into(
            table,
            &ScalarExpr::col("day"),
            &ScalarExpr::col("fare"),
            direction,
            mode,
            ctx,
            |row, rank| out.push((row, rank)),
        )
        .unwrap();
        out
    }

    fn moving(table: &ColumnarTable, radius: usize, ctx: &QueryContext) -> Vec<(u64, Option<f64>)> {
        let mut out = Vec::new();
        moving_average_into(
            table,
            &ScalarExpr::col("day"),
            &ScalarExpr::col("fare"),
            radius,
            ctx,
            |row, avg| out.push((row, avg)),
        )
        .unwrap();
        out
    }

    fn tiles(table: &ColumnarTable, tiles: u32, ctx: &QueryContext) -> Vec<(u64, u32)> {
        let mut out = Vec::new();
        percentile_tile_into(table, &ScalarExpr::col("fare"), tiles, ctx, |row, tile| {
            out.push((row, tile))
        })
        .unwrap();
        out
    }

    #[test]
    fn rank_modes_and_tie_breaks() {
        let t = table(&[
            (1, Some(10.0)),
            (2, Some(5.0)),
            (1, Some(30.0)),
            (1, Some(10.0)),
            (1, None),
            (2, Some(7.0)),
        ]);
        let temp = tempfile::tempdir().unwrap();
        let ctx = ctx(None, temp.path());

        assert_eq!(
            ranks(&t, SortDirection::Descending, RankMode::RowNumber, &ctx),
            vec![(2, 1), (0, 2), (3, 3), (4, 4), (5, 1), (1, 2)]
        );
        assert_eq!(
            ranks(&t, SortDirection::Descending, RankMode::Competition, &ctx),
            vec![(2, 1), (0, 2), (3, 2), (4, 4), (5, 1), (1, 2)]
        );
        // Nulls stay last when ascending too.
        assert_eq!(
            ranks(&t, SortDirection::Ascending, RankMode::Competition, &ctx),
            vec![(0, 1), (3, 1), (2, 3), (4, 4), (1, 1), (5, 2)]
        );
    }

    #[test]
    fn moving_average_clips_at_the_edges() {
        let t = table(&[
            (0, Some(1.0)),
            (1, Some(2.0)),
            (2, Some(3.0)),
            (3, Some(4.0)),
            (4, Some(5.0)),
        ]);
        let temp = tempfile::tempdir().unwrap();
        let out = moving(&t, 2, &ctx(None, temp.path()));
        assert_eq!(
            out,
            vec![
                (0, Some(2.0)),
                (1, Some(2.5)),
                (2, Some(3.0)),
                (3, Some(3.5)),
                (4, Some(4.0)),
            ]
        );
    }

    #[test]
    fn moving_average_skips_nulls() {
        let t = table(&[(0, None), (1, None), (2, Some(6.0)), (3, None)]);
        let temp = tempfile::tempdir().unwrap();
        let out = moving(&t, 1, &ctx(None, temp.path()));
        assert_eq!(
            out,
            vec![(0, None), (1, Some(6.0)), (2, Some(6.0)), (3, Some(6.0))]
        );
        let wide = moving(&t, 10, &ctx(None, temp.path()));
        assert!(wide.iter().all(|(_, avg)| *avg == Some(6.0)));
    }

    #[test]
    fn tiles_follow_ntile_distribution() {
        // 7 rows into 3 tiles: 3, 2, 2.
        let t = table(&[
            (0, Some(7.0)),
            (0, Some(1.0)),
            (0, None),
            (0, Some(3.0)),
            (0, Some(2.0)),
            (0, Some(5.0)),
            (0, Some(4.0)),
        ]);
        let temp = tempfile::tempdir().unwrap();
        let out = tiles(&t, 3, &ctx(None, temp.path()));
        assert_eq!(
            out,
            vec![(1, 1), (4, 1), (3, 1), (6, 2), (5, 2), (0, 3), (2, 3)]
        );
        let few = tiles(&t, 100, &ctx(None, temp.path()));
        let assigned: Vec<u32> = few.iter().map(|(_, tile)| *tile).collect();
        assert_eq!(assigned, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn zero_tiles_is_rejected() {
        let t = table(&[(0, Some(1.0))]);
        let temp = tempfile::tempdir().unwrap();
        let ctx = ctx(None, temp.path());
        let err =
            percentile_tile_into(&t, &ScalarExpr::col("fare"), 0, &ctx, |_, _| {}).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn text_order_columns_are_rejected() {
        let schema = vec![ColumnSchema::new("name", ColumnType::Text)];
        let mut builder = ColumnarTableBuilder::new(schema, TableOptions::default());
        builder.append_row(&[Value::Text("a".into())]).unwrap();
        let t = builder.finalize();
        let temp = tempfile::tempdir().unwrap();
        let ctx = ctx(None, temp.path());
        let err =
            percentile_tile_into(&t, &ScalarExpr::col("name"), 4, &ctx, |_, _| {}).unwrap_err();
        assert!(matches!(err, EngineError::TypeMismatch { .. }));
    }

    #[test]
    fn spilled_windows_match_in_memory_results() {
        let rows: Vec<(i64, Option<f64>)> = (0..2_000i64)
            .map(|i| ((i * 7_919) % 31, (i % 11 != 0).then(|| ((i * 13) % 97) as f64)))
            .collect();
        let t = table(&rows);
        let temp = tempfile::tempdir().unwrap();
        let unlimited = ctx(None, temp.path());
        let tight = ctx(Some(4_096), temp.path());

        for mode in [RankMode::RowNumber, RankMode::Competition] {
            assert_eq!(
                ranks(&t, SortDirection::Descending, mode, &tight),
                ranks(&t, SortDirection::Descending, mode, &unlimited)
            );
        }
        assert_eq!(moving(&t, 3, &tight), moving(&t, 3, &unlimited));
        assert_eq!(tiles(&t, 10, &tight), tiles(&t, 10, &unlimited));
        assert!(tight.budget.usage().spill_segments > 0);
        assert_eq!(tight.budget.reserved(), 0);
    }

    #[test]
    fn radius_beyond_the_budget_fails() {
        let t = table(&[(0, Some(1.0)), (1, Some(2.0)), (2, Some(3.0))]);
        let temp = tempfile::tempdir().unwrap();
        let ctx = ctx(Some(100), temp.path());
        let err = moving_average_into(
            &t,
            &ScalarExpr::col("day"),
            &ScalarExpr::col("fare"),
            10_000,
            &ctx,
            |_, _| {},
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::MemoryExceeded { .. }));
    }

    #[test]
    fn moving_average_frame_fits_beside_the_sort_at_every_ceiling() {
        // 100 rows with radius 10: near 5.6KB the unspilled sort buffer alone fills the budget.
        let rows: Vec<(i64, Option<f64>)> = (0..100i64).map(|i| (i, Some(i as f64))).collect();
        let t = table(&rows);
        let temp = tempfile::tempdir().unwrap();
        let expected = moving(&t, 10, &ctx(None, temp.path()));
        for ceiling in (2_000..=8_000).step_by(100) {
            let tight = ctx(Some(ceiling), temp.path());
            let mut out = Vec::new();
            let stats = moving_average_into(
                &t,
                &ScalarExpr::col("day"),
                &ScalarExpr::col("fare"),
                10,
                &tight,
                |row, avg| out.push((row, avg)),
            )
            .unwrap_or_else(|err| panic!("ceiling {ceiling}: {err}"));
            assert_eq!(out, expected, "ceiling {ceiling}");
            assert!(stats.peak_reserved_bytes <= ceiling);
            assert_eq!(tight.budget.reserved(), 0);
        }
    }

    #[test]
    fn cancellation_stops_windows() {
        let t = table(&[(0, Some(1.0))]);
        let temp = tempfile::tempdir().unwrap();
        let ctx = ctx(None, temp.path());
        ctx.cancel.cancel();
        let err =
            percentile_tile_into(&t, &ScalarExpr::col("fare"), 2, &ctx, |_, _| {}).unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn tiles_are_monotonic_and_balanced(
            fares in prop::collection::vec(prop::option::weighted(0.9, -1_000i32..1_000), 1..200),
            tile_count in 1u32..40,
        ) {
            let rows: Vec<(i64, Option<f64>)> =
                fares.iter().map(|f| (0, f.map(f64::from))).collect();
            let t = table(&rows);
            let temp = tempfile::tempdir().unwrap();
            let out = tiles(&t, tile_count, &ctx(None, temp.path()));
            prop_assert_eq!(out.len(), rows.len());

            let assigned: Vec<u32> = out.iter().map(|(_, tile)| *tile).collect();
            prop_assert!(assigned.windows(2).all(|w| w[0] <= w[1]));

            let n = rows.len() as u32;
            let (q, m) = (n / tile_count, n % tile_count);
            for tile in 1..=tile_count.min(n) {
                let size = assigned.iter().filter(|&&t| t == tile).count() as u32;
                let expected = if tile <= m { q + 1 } else { q };
                prop_assert_eq!(size, expected);
            }

            // Along the output order, non-null fares never decrease and nulls come last.
            let ordered: Vec<Option<f64>> =
                out.iter().map(|(row, _)| rows[*row as usize].1).collect();
            let first_null = ordered.iter().position(Option::is_none).unwrap_or(ordered.len());
            prop_assert!(ordered[first_null..].iter().all(Option::is_none));
            prop_assert!(ordered[..first_null].windows(2).all(|w| w[0] <= w[1]));
        }

        #[test]
        fn moving_average_matches_a_direct_computation(
            fares in prop::collection::vec(prop::option::weighted(0.8, 0i32..100), 1..60),
            radius in 0usize..8,
        ) {
            let rows: Vec<(i64, Option<f64>)> = fares
                .iter()
                .enumerate()
                .map(|(i, f)| (i as i64, f.map(f64::from)))
                .collect();
            let t = table(&rows);
            let temp = tempfile::tempdir().unwrap();
            let out = moving(&t, radius, &ctx(None, temp.path()));
            prop_assert_eq!(out.len(), rows.len());
            for (i, (row, avg)) in out.iter().enumerate() {
                prop_assert_eq!(*row, i as u64);
                let lo = i.saturating_sub(radius);
                let hi = (i + radius).min(rows.len() - 1);
                let values: Vec<f64> = rows[lo..=hi].iter().filter_map(|r| r.1).collect();
                let expected = (!values.is_empty())
                    .then(|| values.iter().sum::<f64>() / values.len() as f64);
                match (avg, expected) {
                    (Some(a), Some(e)) => prop_assert!((a - e).abs() < 1e-9),
                    (a, e) => prop_assert_eq!(*a, e),
                }
            }
        }
    }
}
