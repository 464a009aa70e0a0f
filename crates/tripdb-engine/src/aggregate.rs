//! Grouped aggregation with spill-to-disk.
//!
//! Each shard scans a contiguous page range into a private hash map of `key -> accumulators`,
//! within a fixed share of the query budget. Before a new group is inserted its estimated size is
//! reserved (and so is any growth of a text min/max accumulator); when the reservation is denied
//! the shard sorts its map by key, writes it out as a sealed run and starts over with an empty
//! map. A group too large for one shard's share sends the scan back to a single shard. At the end
//! every shard's runs (spilled or still resident) are merged k-way by key, equal keys are folded
//! together with [`AggState::merge`], and the finished groups are ordered and truncated.

use crate::error::{EngineError, EngineResult};
use crate::expr::{Binder, BoundExpr, BoundPredicate, Predicate, Scalar, ScalarExpr};
use crate::memory::{MemoryBudget, MemoryReservation};
use crate::parallel::{map_shards, shard_count};
use crate::query::{Progress, QueryContext, QueryStats, Stage, StatsScope};
use crate::sort::{merge_runs, spill_sorted, MergeOptions, SortedRun};
use crate::spill::SpillDir;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::mem::size_of;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tripdb_columnar::{ColumnType, ColumnarTable, ScanBatch};

/// Fixed per-group cost on top of key and accumulator payloads (hash slot, vec headers).
const GROUP_OVERHEAD: usize = 64;
/// Merge output rows between cancellation checks.
const MERGE_CHECK_INTERVAL: u64 = 4_096;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggFn {
    /// Rows in the group.
    Count,
    CountNonNull,
    Sum,
    Avg,
    Min,
    Max,
}

/// A group-by expression and its output column name.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupKey {
    pub name: String,
    pub expr: ScalarExpr,
}

impl GroupKey {
    pub fn new(name: impl Into<String>, expr: ScalarExpr) -> Self {
        Self {
            name: name.into(),
            expr,
        }
    }

    /// Group by a plain column, keeping its name.
    pub fn column(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            expr: ScalarExpr::Column(name.clone()),
            name,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AggregateSpec {
    pub name: String,
    pub func: AggFn,
    /// `None` only for [`AggFn::Count`].
    pub input: Option<ScalarExpr>,
}

impl AggregateSpec {
    pub fn count(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            func: AggFn::Count,
            input: None,
        }
    }

    pub fn count_non_null(name: impl Into<String>, input: ScalarExpr) -> Self {
        Self::with_input(name, AggFn::CountNonNull, input)
    }

    pub fn sum(name: impl Into<String>, input: ScalarExpr) -> Self {
        Self::with_input(name, AggFn::Sum, input)
    }

    pub fn avg(name: impl Into<String>, input: ScalarExpr) -> Self {
        Self::with_input(name, AggFn::Avg, input)
    }

    pub fn min(name: impl Into<String>, input: ScalarExpr) -> Self {
        Self::with_input(name, AggFn::Min, input)
    }

    pub fn max(name: impl Into<String>, input: ScalarExpr) -> Self {
        Self::with_input(name, AggFn::Max, input)
    }

    fn with_input(name: impl Into<String>, func: AggFn, input: ScalarExpr) -> Self {
        Self {
            name: name.into(),
            func,
            input: Some(input),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}

/// A grouped aggregation:
/// `SELECT keys, aggregates WHERE filters GROUP BY keys ORDER BY .. LIMIT ..`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregateQuery {
    pub keys: Vec<GroupKey>,
    pub aggregates: Vec<AggregateSpec>,
    pub filters: Vec<Predicate>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
}

impl AggregateQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group_by(mut self, key: GroupKey) -> Self {
        self.keys.push(key);
        self
    }

    pub fn aggregate(mut self, spec: AggregateSpec) -> Self {
        self.aggregates.push(spec);
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filters.push(predicate);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Result column names: keys first, then aggregates.
    pub fn output_columns(&self) -> Vec<String> {
        self.keys
            .iter()
            .map(|k| k.name.clone())
            .chain(self.aggregates.iter().map(|a| a.name.clone()))
            .collect()
    }
}

/// Mergeable accumulator state for one aggregate of one group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AggState {
    Count(u64),
    Sum { sum: f64, count: u64 },
    Avg { sum: f64, count: u64 },
    Min(Option<Scalar>),
    Max(Option<Scalar>),
}

impl AggState {
    pub fn new(func: AggFn) -> Self {
        match func {
            AggFn::Count | AggFn::CountNonNull => AggState::Count(0),
            AggFn::Sum => AggState::Sum { sum: 0.0, count: 0 },
            AggFn::Avg => AggState::Avg { sum: 0.0, count: 0 },
            AggFn::Min => AggState::Min(None),
            AggFn::Max => AggState::Max(None),
        }
    }

    /// Fold one input value in. Nulls only ever affect nothing.
    pub fn update(&mut self, value: &Scalar) {
        if value.is_null() {
            return;
        }
        match self {
            AggState::Count(n) => *n += 1,
            AggState::Sum { sum, count } | AggState::Avg { sum, count } => {
                if let Some(v) = value.as_f64() {
                    *sum += v;
                    *count += 1;
                }
            }
            AggState::Min(current) => {
                if current.as_ref().map_or(true, |c| value < c) {
                    *current = Some(value.clone());
                }
            }
            AggState::Max(current) => {
                if current.as_ref().map_or(true, |c| value > c) {
                    *current = Some(value.clone());
                }
            }
        }
    }

    pub fn update_f64(&mut self, value: Option<f64>) {
        let Some(v) = value else {
            return;
        };
        match self {
            AggState::Count(n) => *n += 1,
            AggState::Sum { sum, count } | AggState::Avg { sum, count } => {
                *sum += v;
                *count += 1;
            }
            AggState::Min(_) | AggState::Max(_) => self.update(&Scalar::float(v)),
        }
    }

    /// Associative, commutative merge of two partial states of the same aggregate.
    pub fn merge(&mut self, other: AggState) -> EngineResult<()> {
        match (self, other) {
            (AggState::Count(a), AggState::Count(b)) => *a += b,
            (AggState::Sum { sum, count }, AggState::Sum { sum: s, count: c })
            | (AggState::Avg { sum, count }, AggState::Avg { sum: s, count: c }) => {
                *sum += s;
                *count += c;
            }
            (AggState::Min(a), AggState::Min(b)) => {
                if let Some(b) = b {
                    if a.as_ref().map_or(true, |a| b < *a) {
                        *a = Some(b);
                    }
                }
            }
            (AggState::Max(a), AggState::Max(b)) => {
                if let Some(b) = b {
                    if a.as_ref().map_or(true, |a| b > *a) {
                        *a = Some(b);
                    }
                }
            }
            (a, b) => {
                return Err(EngineError::InvalidArgument(format!(
                    "cannot merge accumulator {a:?} with {b:?}"
                )))
            }
        }
        Ok(())
    }

    /// Final value. Sum, average, min and max over no values are null.
    pub fn finalize(&self) -> Scalar {
        match self {
            AggState::Count(n) => Scalar::Int(*n as i64),
            AggState::Sum { count: 0, .. } | AggState::Avg { count: 0, .. } => Scalar::Null,
            AggState::Sum { sum, .. } => Scalar::float(*sum),
            AggState::Avg { sum, count } => Scalar::float(*sum / *count as f64),
            AggState::Min(v) | AggState::Max(v) => v.clone().unwrap_or(Scalar::Null),
        }
    }

    fn heap_bytes(&self) -> usize {
        match self {
            AggState::Min(Some(v)) | AggState::Max(Some(v)) => v.heap_bytes(),
            _ => 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AggregateResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Scalar>>,
    pub stats: QueryStats,
}

impl AggregateResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Scalar> {
        let col = self.column_index(column)?;
        self.rows.get(row)?.get(col)
    }
}

/// One group's partial state as it travels through runs and segments. Runs are ordered by key;
/// `first_row` only breaks ties so the order is total.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct GroupEntry {
    key: Vec<Scalar>,
    first_row: u64,
    states: Vec<AggState>,
}

impl GroupEntry {
    fn absorb(&mut self, other: GroupEntry) -> EngineResult<()> {
        self.first_row = self.first_row.min(other.first_row);
        for (state, other) in self.states.iter_mut().zip(other.states) {
            state.merge(other)?;
        }
        Ok(())
    }
}

impl PartialEq for GroupEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.first_row == other.first_row
    }
}

impl Eq for GroupEntry {}

impl PartialOrd for GroupEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GroupEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then(self.first_row.cmp(&other.first_row))
    }
}

struct GroupState {
    first_row: u64,
    states: Vec<AggState>,
}

fn group_bytes(key: &[Scalar], states: &[AggState]) -> usize {
    GROUP_OVERHEAD
        + 2 * size_of::<Vec<Scalar>>()
        + size_of::<u64>()
        + key.len() * size_of::<Scalar>()
        + key.iter().map(Scalar::heap_bytes).sum::<usize>()
        + states.len() * size_of::<AggState>()
        + state_heap_bytes(states)
}

fn state_heap_bytes(states: &[AggState]) -> usize {
    states.iter().map(AggState::heap_bytes).sum()
}

/// Size guess used before any group exists (text keys assumed short).
fn nominal_group_bytes(keys: usize, aggregates: usize) -> usize {
    GROUP_OVERHEAD
        + 2 * size_of::<Vec<Scalar>>()
        + size_of::<u64>()
        + keys * (size_of::<Scalar>() + 16)
        + aggregates * size_of::<AggState>()
}

enum AggInput {
    Rows,
    Numeric(BoundExpr),
    Value(BoundExpr),
}

struct Plan {
    projection: Vec<usize>,
    keys: Vec<BoundExpr>,
    aggregates: Vec<(AggFn, AggInput)>,
    filters: Vec<BoundPredicate>,
    /// `(output column, descending)`.
    order: Vec<(usize, bool)>,
    /// Some accumulator can grow after its group is created (min/max over text).
    growable_states: bool,
}

impl Plan {
    fn bind(table: &ColumnarTable, query: &AggregateQuery) -> EngineResult<Self> {
        if query.keys.is_empty() && query.aggregates.is_empty() {
            return Err(EngineError::InvalidArgument(
                "aggregation needs at least one key or aggregate".into(),
            ));
        }
        let columns = query.output_columns();
        let mut seen = HashSet::new();
        for name in &columns {
            if !seen.insert(name.as_str()) {
                return Err(EngineError::InvalidArgument(format!(
                    "duplicate output column {name}"
                )));
            }
        }

        let mut binder = Binder::new(table);
        let keys = query
            .keys
            .iter()
            .map(|k| binder.bind(&k.expr).map(|(bound, _)| bound))
            .collect::<EngineResult<Vec<_>>>()?;
        let mut aggregates = Vec::with_capacity(query.aggregates.len());
        for spec in &query.aggregates {
            let input = match (spec.func, &spec.input) {
                (AggFn::Count, None) => AggInput::Rows,
                (AggFn::Sum | AggFn::Avg, Some(expr)) => {
                    AggInput::Numeric(binder.bind_numeric(expr)?)
                }
                (_, Some(expr)) => {
                    let (bound, ty) = binder.bind(expr)?;
                    if ty == ColumnType::Float64 {
                        AggInput::Numeric(bound)
                    } else {
                        AggInput::Value(bound)
                    }
                }
                (func, None) => {
                    return Err(EngineError::InvalidArgument(format!(
                        "aggregate {} ({func:?}) needs an input expression",
                        spec.name
                    )))
                }
            };
            aggregates.push((spec.func, input));
        }
        let filters = query
            .filters
            .iter()
            .map(|p| binder.bind_predicate(p))
            .collect::<EngineResult<Vec<_>>>()?;
        let order = query
            .order_by
            .iter()
            .map(|o| {
                columns
                    .iter()
                    .position(|c| *c == o.column)
                    .map(|idx| (idx, o.descending))
                    .ok_or_else(|| EngineError::UnknownColumn(o.column.clone()))
            })
            .collect::<EngineResult<Vec<_>>>()?;

        let growable_states = aggregates.iter().any(|(func, input)| {
            matches!(func, AggFn::Min | AggFn::Max) && matches!(input, AggInput::Value(_))
        });
        Ok(Self {
            projection: binder.projection().to_vec(),
            keys,
            aggregates,
            filters,
            order,
            growable_states,
        })
    }

    fn new_states(&self) -> Vec<AggState> {
        self.aggregates
            .iter()
            .map(|(func, _)| AggState::new(*func))
            .collect()
    }

    fn update(&self, states: &mut [AggState], batch: &ScanBatch<'_>, row: usize) {
        for (state, (_, input)) in states.iter_mut().zip(&self.aggregates) {
            match input {
                AggInput::Rows => state.update_f64(Some(1.0)),
                AggInput::Numeric(expr) => state.update_f64(expr.eval_f64(batch, row)),
                AggInput::Value(expr) => state.update(&expr.eval(batch, row)),
            }
        }
    }
}

struct ShardOutput {
    runs: Vec<SortedRun<GroupEntry>>,
    spill: SpillDir,
    spilled: bool,
    rows_scanned: u64,
    rows_filtered_out: u64,
    max_group_bytes: usize,
}

struct SharedProgress {
    batches: AtomicU64,
    rows: AtomicU64,
}

fn drain_groups(map: &mut AHashMap<Vec<Scalar>, GroupState>) -> Vec<GroupEntry> {
    map.drain()
        .map(|(key, group)| GroupEntry {
            key,
            first_row: group.first_row,
            states: group.states,
        })
        .collect()
}

/// One shard's slice of the query budget. A shard never reserves past its share, so siblings
/// holding resident groups cannot starve a shard that has just spilled.
struct ShardMemory {
    reservation: MemoryReservation,
    share: Option<usize>,
}

impl ShardMemory {
    fn fits(&self, bytes: usize) -> bool {
        self.share
            .map_or(true, |share| self.reservation.size().saturating_add(bytes) <= share)
    }

    fn try_grow(&mut self, bytes: usize) -> bool {
        self.fits(bytes) && self.reservation.try_grow(bytes).is_granted()
    }

    fn grow(&mut self, bytes: usize) -> EngineResult<()> {
        if !self.fits(bytes) {
            return Err(self.reservation.budget().exceeded(bytes));
        }
        self.reservation.grow(bytes)
    }
}

/// Write the resident groups out as one sorted run and release their reservation.
fn spill_groups(
    map: &mut AHashMap<Vec<Scalar>, GroupState>,
    runs: &mut Vec<SortedRun<GroupEntry>>,
    spill: &mut SpillDir,
    memory: &mut ShardMemory,
) -> EngineResult<()> {
    let entries = drain_groups(map);
    if !entries.is_empty() {
        log::debug!(
            "aggregate: spilling {} groups ({} bytes reserved)",
            entries.len(),
            memory.reservation.size()
        );
        runs.push(SortedRun::Spilled(spill_sorted(entries, spill, "agg")?));
    }
    memory.reservation.free();
    Ok(())
}

fn scan_shard(
    table: &ColumnarTable,
    plan: &Plan,
    pages: Range<usize>,
    share: Option<usize>,
    ctx: &QueryContext,
    progress: &SharedProgress,
) -> EngineResult<ShardOutput> {
    let mut spill = SpillDir::new(ctx.budget.clone());
    let mut memory = ShardMemory {
        reservation: MemoryReservation::new(ctx.budget.clone()),
        share,
    };
    let mut map: AHashMap<Vec<Scalar>, GroupState> = AHashMap::new();
    let mut runs = Vec::new();
    let mut key: Vec<Scalar> = Vec::with_capacity(plan.keys.len());
    let mut rows_scanned = 0u64;
    let mut rows_filtered_out = 0u64;
    let mut max_group_bytes = 0usize;

    for batch in table.scan().batches_in(&plan.projection, pages)? {
        ctx.cancel.check()?;
        'rows: for row in 0..batch.len() {
            rows_scanned += 1;
            for filter in &plan.filters {
                if !filter.matches(&batch, row) {
                    rows_filtered_out += 1;
                    continue 'rows;
                }
            }
            key.clear();
            key.extend(plan.keys.iter().map(|k| k.eval(&batch, row)));

            if let Some(group) = map.get_mut(key.as_slice()) {
                if !plan.growable_states {
                    plan.update(&mut group.states, &batch, row);
                    continue;
                }
                let before = state_heap_bytes(&group.states);
                plan.update(&mut group.states, &batch, row);
                let grown = state_heap_bytes(&group.states).saturating_sub(before);
                if grown > 0 {
                    max_group_bytes = max_group_bytes.max(group_bytes(&key, &group.states));
                    if !memory.try_grow(grown) {
                        // The grown group leaves with the rest of the map.
                        spill_groups(&mut map, &mut runs, &mut spill, &mut memory)?;
                    }
                }
                continue;
            }

            let mut group = GroupState {
                first_row: (batch.row_start + row) as u64,
                states: plan.new_states(),
            };
            plan.update(&mut group.states, &batch, row);
            let bytes = group_bytes(&key, &group.states);
            if !memory.try_grow(bytes) {
                spill_groups(&mut map, &mut runs, &mut spill, &mut memory)?;
                memory.grow(bytes)?;
            }
            max_group_bytes = max_group_bytes.max(bytes);
            map.insert(key.clone(), group);
        }

        let batches = progress.batches.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        let rows = progress
            .rows
            .fetch_add(batch.len() as u64, AtomicOrdering::Relaxed)
            + batch.len() as u64;
        ctx.report(Progress {
            stage: Stage::Aggregate,
            batches,
            rows,
        });
    }

    let spilled = !runs.is_empty();
    if !map.is_empty() {
        let mut items = drain_groups(&mut map);
        items.sort_unstable();
        runs.push(SortedRun::Memory {
            items,
            reservation: memory.reservation,
        });
    }
    Ok(ShardOutput {
        runs,
        spill,
        spilled,
        rows_scanned,
        rows_filtered_out,
        max_group_bytes,
    })
}

struct FinishedRow {
    first_row: u64,
    values: Vec<Scalar>,
}

fn compare_rows(order: &[(usize, bool)], a: &FinishedRow, b: &FinishedRow) -> Ordering {
    for &(idx, descending) in order {
        let (x, y) = (&a.values[idx], &b.values[idx]);
        let ord = match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) if descending => x.cmp_nulls_last(y).reverse(),
            (false, false) => x.cmp_nulls_last(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.first_row.cmp(&b.first_row)
}

/// Keeps the best `limit` rows seen so far (all rows without a limit).
struct TopRows<'a> {
    order: &'a [(usize, bool)],
    limit: Option<usize>,
    rows: Vec<FinishedRow>,
}

impl<'a> TopRows<'a> {
    fn push(&mut self, row: FinishedRow) {
        self.rows.push(row);
        if let Some(limit) = self.limit {
            if self.rows.len() >= 2 * limit.max(64) {
                self.compact(limit);
            }
        }
    }

    fn compact(&mut self, limit: usize) {
        let order = self.order;
        self.rows.sort_by(|a, b| compare_rows(order, a, b));
        self.rows.truncate(limit);
    }

    fn finish(mut self) -> Vec<Vec<Scalar>> {
        let order = self.order;
        self.rows.sort_by(|a, b| compare_rows(order, a, b));
        if let Some(limit) = self.limit {
            self.rows.truncate(limit);
        }
        self.rows.into_iter().map(|r| r.values).collect()
    }
}

fn finish_group(entry: GroupEntry) -> FinishedRow {
    let mut values = entry.key;
    values.extend(entry.states.iter().map(AggState::finalize));
    FinishedRow {
        first_row: entry.first_row,
        values,
    }
}

fn page_ranges(pages: usize, shards: usize) -> Vec<Range<usize>> {
    let shards = shards.clamp(1, pages.max(1));
    (0..shards)
        .map(|i| pages * i / shards..pages * (i + 1) / shards)
        .collect()
}

/// Shards the budget can plausibly feed: each should be able to hold a few groups at once.
fn affordable_shards(budget: &MemoryBudget, requested: usize, group_bytes: usize) -> usize {
    match budget.available() {
        None => requested,
        Some(available) => requested.min((available / (4 * group_bytes.max(1))).max(1)),
    }
}

/// Scan every range in its own shard. Each shard gets an equal fixed share of what the budget has
/// left, so whether a shard spills depends only on its own groups.
fn scan_shards(
    table: &ColumnarTable,
    plan: &Plan,
    ranges: &[Range<usize>],
    ctx: &QueryContext,
) -> EngineResult<Vec<ShardOutput>> {
    let share = ctx
        .budget
        .available()
        .map(|available| available / ranges.len().max(1));
    let progress = SharedProgress {
        batches: AtomicU64::new(0),
        rows: AtomicU64::new(0),
    };
    map_shards(ranges.len(), |i| {
        scan_shard(table, plan, ranges[i].clone(), share, ctx, &progress)
    })
    .into_iter()
    .collect()
}

pub(crate) fn run_aggregate(
    table: &ColumnarTable,
    query: &AggregateQuery,
    ctx: &QueryContext,
) -> EngineResult<AggregateResult> {
    let scope = StatsScope::begin(&ctx.budget);
    let plan = Plan::bind(table, query)?;
    let nominal = nominal_group_bytes(plan.keys.len(), plan.aggregates.len());
    let shards = affordable_shards(&ctx.budget, shard_count(ctx.parallelism), nominal);
    let ranges = page_ranges(table.page_count(), shards);
    log::debug!(
        "aggregate: {} keys, {} aggregates over {} rows in {} shards",
        plan.keys.len(),
        plan.aggregates.len(),
        table.row_count(),
        ranges.len()
    );

    let outputs = match scan_shards(table, &plan, &ranges, ctx) {
        Err(EngineError::MemoryExceeded { requested, .. }) if ranges.len() > 1 => {
            log::warn!(
                "aggregate: a {requested} byte group does not fit a 1/{} share of the budget, \
                 rescanning in one shard",
                ranges.len()
            );
            scan_shards(table, &plan, &page_ranges(table.page_count(), 1), ctx)?
        }
        result => result?,
    };

    let mut stats = QueryStats::default();
    let any_spilled = outputs.iter().any(|o| o.spilled);
    let mut merge_spill = SpillDir::new(ctx.budget.clone());
    let mut spill_dirs = Vec::with_capacity(outputs.len());
    let mut runs = Vec::new();
    let mut head_bytes = nominal;
    for output in outputs {
        stats.rows_scanned += output.rows_scanned;
        stats.rows_filtered_out += output.rows_filtered_out;
        head_bytes = head_bytes.max(output.max_group_bytes);
        spill_dirs.push(output.spill);
        for run in output.runs {
            match run {
                // Once anything is on disk, resident runs go to disk too so the merge heads
                // have the whole budget.
                SortedRun::Memory { items, reservation } if any_spilled => {
                    runs.push(SortedRun::Spilled(spill_sorted(
                        items,
                        &mut merge_spill,
                        "agg",
                    )?));
                    drop(reservation);
                }
                run => runs.push(run),
            }
        }
    }

    let (merged, passes) = merge_runs(
        runs,
        &mut merge_spill,
        &MergeOptions {
            budget: &ctx.budget,
            head_bytes,
            max_fan_in: ctx.max_merge_fan_in,
            label: "agg",
        },
    )?;
    stats.merge_passes = passes;

    let mut top = TopRows {
        order: &plan.order,
        limit: query.limit,
        rows: Vec::new(),
    };
    let mut current: Option<GroupEntry> = None;
    let mut merged_entries = 0u64;
    for entry in merged {
        let entry = entry?;
        merged_entries += 1;
        if merged_entries % MERGE_CHECK_INTERVAL == 0 {
            ctx.cancel.check()?;
        }
        match current.as_mut() {
            Some(group) if group.key == entry.key => group.absorb(entry)?,
            _ => {
                if let Some(done) = current.replace(entry) {
                    stats.groups += 1;
                    top.push(finish_group(done));
                }
            }
        }
    }
    if let Some(done) = current {
        stats.groups += 1;
        top.push(finish_group(done));
    }
    if stats.groups == 0 && plan.keys.is_empty() {
        // A global aggregate always yields one row.
        stats.groups = 1;
        top.push(finish_group(GroupEntry {
            key: Vec::new(),
            first_row: 0,
            states: plan.new_states(),
        }));
    }
    let rows = top.finish();
    drop(spill_dirs);

    scope.finish(&ctx.budget, &mut stats);
    log::info!(
        "aggregate: {} groups from {} rows in {:.2?} ({} spill segments)",
        stats.groups,
        stats.rows_scanned,
        stats.duration,
        stats.spill_segments
    );
    Ok(AggregateResult {
        columns: query.output_columns(),
        rows,
        stats,
    })
}
