//! The fixed analysis battery run against a loaded trip table.
//!
//! Each analysis issues one or more engine queries and shapes the result rows into a typed
//! record. They are independent: the caller decides which to run and isolates their failures.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::mem::size_of;
use std::time::Instant;
use tripdb_engine::{
    AggregateQuery, AggregateResult, AggregateSpec, Engine, GroupKey, MemoryReservation, OrderBy,
    Predicate, QueryStats, RankMode, Scalar, ScalarExpr, SortDirection,
};

pub const PICKUP: &str = "tpep_pickup_datetime";
pub const DROPOFF: &str = "tpep_dropoff_datetime";
pub const TRIP_DISTANCE: &str = "trip_distance";
pub const FARE: &str = "fare_amount";
pub const TIP: &str = "tip_amount";
pub const TOTAL: &str = "total_amount";
pub const PAYMENT_TYPE: &str = "payment_type";
pub const PICKUP_LONGITUDE: &str = "pickup_longitude";
pub const PICKUP_LATITUDE: &str = "pickup_latitude";
pub const DROPOFF_LONGITUDE: &str = "dropoff_longitude";
pub const DROPOFF_LATITUDE: &str = "dropoff_latitude";

const ROUTE_LIMIT: usize = 10;
const MOVING_AVERAGE_RADIUS: usize = 10_000;
const DISTANCE_TILES: u32 = 100;
const RANK_CUTOFF: u64 = 1_000;
/// Reserved per kept trip: the map entry plus its hash control byte, rounded up.
const SELECTED_ENTRY_BYTES: usize = size_of::<(u64, Selected)>() + 8;

fn f64_at(result: &AggregateResult, row: usize, column: &str) -> Option<f64> {
    result.value(row, column).and_then(Scalar::as_f64)
}

fn i64_at(result: &AggregateResult, row: usize, column: &str) -> Option<i64> {
    result.value(row, column).and_then(Scalar::as_i64)
}

fn count_at(result: &AggregateResult, row: usize, column: &str) -> u64 {
    i64_at(result, row, column).map_or(0, |n| n.max(0) as u64)
}

fn tip_percentage() -> ScalarExpr {
    ScalarExpr::scale(
        ScalarExpr::div(ScalarExpr::col(TIP), ScalarExpr::col(FARE)),
        100.0,
    )
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HourlyStats {
    pub hour: i64,
    pub trips: u64,
    pub avg_distance: Option<f64>,
    pub avg_fare: Option<f64>,
    pub avg_tip: Option<f64>,
    /// Average of tip / fare over trips with a non-zero fare; 0 when there are none.
    pub tip_percentage: f64,
}

pub fn trips_by_hour(engine: &Engine) -> Result<Vec<HourlyStats>> {
    let query = AggregateQuery::new()
        .group_by(GroupKey::new("hour", ScalarExpr::hour(PICKUP)))
        .aggregate(AggregateSpec::count("trips"))
        .aggregate(AggregateSpec::avg("avg_distance", ScalarExpr::col(TRIP_DISTANCE)))
        .aggregate(AggregateSpec::avg("avg_fare", ScalarExpr::col(FARE)))
        .aggregate(AggregateSpec::avg("avg_tip", ScalarExpr::col(TIP)))
        .aggregate(AggregateSpec::avg("tip_percentage", tip_percentage()))
        .order_by(OrderBy::asc("hour"));
    let result = engine.aggregate(&query).context("group trips by pickup hour")?;
    Ok((0..result.len())
        // Trips without a pickup time have no hour to report.
        .filter_map(|row| {
            Some(HourlyStats {
                hour: i64_at(&result, row, "hour")?,
                trips: count_at(&result, row, "trips"),
                avg_distance: f64_at(&result, row, "avg_distance"),
                avg_fare: f64_at(&result, row, "avg_fare"),
                avg_tip: f64_at(&result, row, "avg_tip"),
                tip_percentage: f64_at(&result, row, "tip_percentage").unwrap_or(0.0),
            })
        })
        .collect())
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RouteStats {
    pub pickup_longitude: Option<f64>,
    pub pickup_latitude: Option<f64>,
    pub dropoff_longitude: Option<f64>,
    pub dropoff_latitude: Option<f64>,
    pub trips: u64,
    pub avg_distance: Option<f64>,
    pub avg_fare: Option<f64>,
    pub avg_total: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PopularRoutes {
    /// Decimal places the coordinates were rounded to.
    pub precision: u32,
    pub routes: Vec<RouteStats>,
}

/// Most frequent pickup/dropoff pairs by rounded coordinates, skipping zero coordinates.
///
/// Grouping at 2 decimals can exceed a tight memory ceiling on large inputs; the analysis then
/// retries once at 1 decimal, which yields far fewer groups.
pub fn popular_routes(engine: &Engine) -> Result<PopularRoutes> {
    match routes_at(engine, 2) {
        Ok(routes) => Ok(PopularRoutes { precision: 2, routes }),
        Err(err) => {
            log::warn!("route analysis at 2 decimals failed ({err:#}); retrying at 1 decimal");
            let routes = routes_at(engine, 1)?;
            Ok(PopularRoutes { precision: 1, routes })
        }
    }
}

fn routes_at(engine: &Engine, digits: u32) -> Result<Vec<RouteStats>> {
    let coordinates = [
        PICKUP_LONGITUDE,
        PICKUP_LATITUDE,
        DROPOFF_LONGITUDE,
        DROPOFF_LATITUDE,
    ];
    let mut query = AggregateQuery::new();
    for column in coordinates {
        query = query
            .group_by(GroupKey::new(
                column,
                ScalarExpr::round(ScalarExpr::col(column), digits),
            ))
            .filter(Predicate::NotEq(ScalarExpr::col(column), 0.0));
    }
    let query = query
        .aggregate(AggregateSpec::count("trips"))
        .aggregate(AggregateSpec::avg("avg_distance", ScalarExpr::col(TRIP_DISTANCE)))
        .aggregate(AggregateSpec::avg("avg_fare", ScalarExpr::col(FARE)))
        .aggregate(AggregateSpec::avg("avg_total", ScalarExpr::col(TOTAL)))
        .order_by(OrderBy::desc("trips"))
        .limit(ROUTE_LIMIT);
    let result = engine
        .aggregate(&query)
        .with_context(|| format!("group routes at {digits} decimal places"))?;
    Ok((0..result.len())
        .map(|row| RouteStats {
            pickup_longitude: f64_at(&result, row, PICKUP_LONGITUDE),
            pickup_latitude: f64_at(&result, row, PICKUP_LATITUDE),
            dropoff_longitude: f64_at(&result, row, DROPOFF_LONGITUDE),
            dropoff_latitude: f64_at(&result, row, DROPOFF_LATITUDE),
            trips: count_at(&result, row, "trips"),
            avg_distance: f64_at(&result, row, "avg_distance"),
            avg_fare: f64_at(&result, row, "avg_fare"),
            avg_total: f64_at(&result, row, "avg_total"),
        })
        .collect())
}

/// TLC payment type codes.
pub fn payment_description(code: Option<i64>) -> &'static str {
    match code {
        Some(1) => "Credit card",
        Some(2) => "Cash",
        Some(3) => "No charge",
        Some(4) => "Dispute",
        Some(5) => "Unknown",
        Some(6) => "Voided",
        _ => "Other",
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PaymentStats {
    pub payment_type: Option<i64>,
    pub description: &'static str,
    pub trips: u64,
    pub avg_fare: Option<f64>,
    pub avg_tip: Option<f64>,
    pub total_tips: Option<f64>,
    pub tip_percentage: f64,
}

pub fn payment_methods(engine: &Engine) -> Result<Vec<PaymentStats>> {
    let query = AggregateQuery::new()
        .group_by(GroupKey::column(PAYMENT_TYPE))
        .aggregate(AggregateSpec::count("trips"))
        .aggregate(AggregateSpec::avg("avg_fare", ScalarExpr::col(FARE)))
        .aggregate(AggregateSpec::avg("avg_tip", ScalarExpr::col(TIP)))
        .aggregate(AggregateSpec::sum("total_tips", ScalarExpr::col(TIP)))
        .aggregate(AggregateSpec::avg("tip_percentage", tip_percentage()))
        .order_by(OrderBy::desc("trips"));
    let result = engine.aggregate(&query).context("group trips by payment type")?;
    Ok((0..result.len())
        .map(|row| {
            let code = i64_at(&result, row, PAYMENT_TYPE);
            PaymentStats {
                payment_type: code,
                description: payment_description(code),
                trips: count_at(&result, row, "trips"),
                avg_fare: f64_at(&result, row, "avg_fare"),
                avg_tip: f64_at(&result, row, "avg_tip"),
                total_tips: f64_at(&result, row, "total_tips"),
                tip_percentage: f64_at(&result, row, "tip_percentage").unwrap_or(0.0),
            }
        })
        .collect())
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DayStats {
    pub day: String,
    pub trips: u64,
    pub avg_distance: Option<f64>,
    pub avg_fare: Option<f64>,
    pub avg_tip: Option<f64>,
    pub avg_speed_mph: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DayHourCount {
    pub day: String,
    pub hour: i64,
    pub trips: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BusyDays {
    /// Monday first.
    pub days: Vec<DayStats>,
    /// Trip counts per (day, hour), Monday first then by hour.
    pub heat_map: Vec<DayHourCount>,
}

/// Per-weekday statistics over trips that moved and lasted over a minute, plus a day × hour
/// heat map over all trips.
pub fn busy_days(engine: &Engine) -> Result<BusyDays> {
    let duration = ScalarExpr::duration_seconds(PICKUP, DROPOFF);
    let speed = ScalarExpr::div(
        ScalarExpr::col(TRIP_DISTANCE),
        ScalarExpr::div(duration.clone(), ScalarExpr::lit(3_600.0)),
    );
    let query = AggregateQuery::new()
        .group_by(GroupKey::new("weekday", ScalarExpr::day_of_week(PICKUP)))
        .group_by(GroupKey::new("day", ScalarExpr::day_name(PICKUP)))
        .aggregate(AggregateSpec::count("trips"))
        .aggregate(AggregateSpec::avg("avg_distance", ScalarExpr::col(TRIP_DISTANCE)))
        .aggregate(AggregateSpec::avg("avg_fare", ScalarExpr::col(FARE)))
        .aggregate(AggregateSpec::avg("avg_tip", ScalarExpr::col(TIP)))
        .aggregate(AggregateSpec::avg("avg_speed_mph", speed))
        .filter(Predicate::Gt(ScalarExpr::col(TRIP_DISTANCE), 0.0))
        .filter(Predicate::Gt(duration, 60.0))
        .order_by(OrderBy::asc("weekday"));
    let result = engine.aggregate(&query).context("group trips by weekday")?;
    let days = (0..result.len())
        .filter_map(|row| {
            let day = result.value(row, "day")?.as_text()?.to_owned();
            Some(DayStats {
                day,
                trips: count_at(&result, row, "trips"),
                avg_distance: f64_at(&result, row, "avg_distance"),
                avg_fare: f64_at(&result, row, "avg_fare"),
                avg_tip: f64_at(&result, row, "avg_tip"),
                avg_speed_mph: f64_at(&result, row, "avg_speed_mph").unwrap_or(0.0),
            })
        })
        .collect();

    let query = AggregateQuery::new()
        .group_by(GroupKey::new("weekday", ScalarExpr::day_of_week(PICKUP)))
        .group_by(GroupKey::new("day", ScalarExpr::day_name(PICKUP)))
        .group_by(GroupKey::new("hour", ScalarExpr::hour(PICKUP)))
        .aggregate(AggregateSpec::count("trips"))
        .order_by(OrderBy::asc("weekday"))
        .order_by(OrderBy::asc("hour"));
    let result = engine
        .aggregate(&query)
        .context("count trips per weekday and hour")?;
    let heat_map = (0..result.len())
        .filter_map(|row| {
            Some(DayHourCount {
                day: result.value(row, "day")?.as_text()?.to_owned(),
                hour: i64_at(&result, row, "hour")?,
                trips: count_at(&result, row, "trips"),
            })
        })
        .collect();
    Ok(BusyDays { days, heat_map })
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TileStats {
    pub tile: u32,
    pub trips: u64,
    pub avg_distance: Option<f64>,
    pub avg_fare: Option<f64>,
    pub avg_tip: Option<f64>,
    /// Mean of the rows' moving-average fares.
    pub avg_moving_fare: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LargeMemoryTest {
    pub success: bool,
    pub duration_seconds: f64,
    /// Output rows: one per distance tile with at least one top-ranked trip.
    pub result_count: usize,
    /// Trips ranked within the top 1,000 fares of their day of month.
    pub ranked_trips: usize,
    pub tiles: Vec<TileStats>,
    pub rank_stats: QueryStats,
    pub moving_average_stats: QueryStats,
    pub tile_stats: QueryStats,
}

#[derive(Default)]
struct Selected {
    tile: Option<u32>,
    moving_fare: Option<f64>,
}

#[derive(Default)]
struct Mean {
    sum: f64,
    count: u64,
}

impl Mean {
    fn add(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.sum += v;
            self.count += 1;
        }
    }

    fn rounded(&self) -> Option<f64> {
        (self.count > 0).then(|| round2(self.sum / self.count as f64))
    }
}

#[derive(Default)]
struct TileAccumulator {
    trips: u64,
    distance: Mean,
    fare: Mean,
    tip: Mean,
    moving_fare: Mean,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Runs all three window functions over the full table, then summarizes the top-ranked trips
/// per distance tile.
///
/// Only trips that rank within the top 1,000 fares of their day are kept between passes. Tied fares
/// all share a rank, so that set is reserved against the engine's memory ceiling as it grows and
/// outgrowing it fails the test; the window passes themselves spill as needed.
pub fn large_memory_test(engine: &Engine) -> Result<LargeMemoryTest> {
    let start = Instant::now();
    let table = engine
        .table()
        .cloned()
        .ok_or_else(|| anyhow!("no table loaded"))?;
    let column = |name: &str| {
        table
            .column_index(name)
            .ok_or_else(|| anyhow!("table has no column named {name:?}"))
    };
    let (distance_col, fare_col, tip_col) = (column(TRIP_DISTANCE)?, column(FARE)?, column(TIP)?);

    let mut selected: HashMap<u64, Selected> = HashMap::new();
    let mut reservation = MemoryReservation::new(engine.budget().clone());
    let mut overflowed = false;
    let rank_stats = engine
        .rank_within_partition_into(
            &ScalarExpr::day_of_month(PICKUP),
            &ScalarExpr::col(FARE),
            SortDirection::Descending,
            RankMode::Competition,
            |row, rank| {
                if rank > RANK_CUTOFF || overflowed {
                    return;
                }
                if reservation.try_grow(SELECTED_ENTRY_BYTES).is_granted() {
                    selected.insert(row, Selected::default());
                } else {
                    overflowed = true;
                }
            },
        )
        .context("rank fares within day of month")?;
    if overflowed {
        return Err(engine.budget().exceeded(SELECTED_ENTRY_BYTES)).with_context(|| {
            format!(
                "keep {} top-ranked trips (ties share a rank)",
                selected.len() + 1
            )
        });
    }

    let moving_average_stats = engine
        .moving_average_into(
            &ScalarExpr::col(PICKUP),
            &ScalarExpr::col(FARE),
            MOVING_AVERAGE_RADIUS,
            |row, avg| {
                if let Some(entry) = selected.get_mut(&row) {
                    entry.moving_fare = avg;
                }
            },
        )
        .context("moving average of fares by pickup time")?;

    let tile_stats = engine
        .percentile_tile_into(&ScalarExpr::col(TRIP_DISTANCE), DISTANCE_TILES, |row, tile| {
            if let Some(entry) = selected.get_mut(&row) {
                entry.tile = Some(tile);
            }
        })
        .context("distance percentiles")?;

    let mut per_tile: Vec<TileAccumulator> = Vec::new();
    per_tile.resize_with(DISTANCE_TILES as usize + 1, TileAccumulator::default);
    for (&row, entry) in &selected {
        let Some(tile) = entry.tile else { continue };
        let Some(acc) = per_tile.get_mut(tile as usize) else {
            continue;
        };
        let row = row as usize;
        acc.trips += 1;
        acc.distance.add(table.get_cell(row, distance_col).as_f64());
        acc.fare.add(table.get_cell(row, fare_col).as_f64());
        acc.tip.add(table.get_cell(row, tip_col).as_f64());
        acc.moving_fare.add(entry.moving_fare);
    }
    let tiles: Vec<TileStats> = per_tile
        .iter()
        .enumerate()
        .filter(|(_, acc)| acc.trips > 0)
        .map(|(tile, acc)| TileStats {
            tile: tile as u32,
            trips: acc.trips,
            avg_distance: acc.distance.rounded(),
            avg_fare: acc.fare.rounded(),
            avg_tip: acc.tip.rounded(),
            avg_moving_fare: acc.moving_fare.rounded(),
        })
        .collect();

    Ok(LargeMemoryTest {
        success: true,
        duration_seconds: start.elapsed().as_secs_f64(),
        result_count: tiles.len(),
        ranked_trips: selected.len(),
        tiles,
        rank_stats,
        moving_average_stats,
        tile_stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn payment_codes() {
        assert_eq!(payment_description(Some(1)), "Credit card");
        assert_eq!(payment_description(Some(6)), "Voided");
        assert_eq!(payment_description(Some(9)), "Other");
        assert_eq!(payment_description(None), "Other");
    }

    #[test]
    fn means_round_to_cents() {
        let mut mean = Mean::default();
        assert_eq!(mean.rounded(), None);
        mean.add(Some(1.0));
        mean.add(None);
        mean.add(Some(2.0));
        mean.add(Some(2.5));
        assert_eq!(mean.count, 3);
        assert_eq!(mean.rounded(), Some(1.83));
    }
}
