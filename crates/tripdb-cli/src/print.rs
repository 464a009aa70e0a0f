//! Console tables for the run summary and each analysis.

use crate::analyses::{BusyDays, HourlyStats, LargeMemoryTest, PaymentStats, PopularRoutes};
use std::io::{self, Write};
use tripdb_engine::{ColumnType, IngestSummary, MemoryUsage, Scalar, Value};

fn opt(v: Option<f64>, precision: usize) -> String {
    v.map_or_else(|| "-".to_owned(), |v| format!("{v:.precision$}"))
}

/// Thousands separators for counts.
pub fn grouped(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

pub fn bytes(n: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit + 1 < UNITS.len() {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

pub fn display_value(value: &Value) -> String {
    Scalar::from(value.clone()).to_string()
}

pub fn ingest_summary(out: &mut impl Write, summary: &IngestSummary) -> io::Result<()> {
    writeln!(
        out,
        "Loaded {} rows from {} in {:.2}s ({:.0} rows/s)",
        grouped(summary.row_count),
        summary.source,
        summary.duration.as_secs_f64(),
        summary.rows_per_second
    )?;
    if summary.rejected_count > 0 || summary.null_fields > 0 {
        writeln!(
            out,
            "  {} malformed records, {} fields stored as null ({:?})",
            grouped(summary.rejected_count),
            grouped(summary.null_fields),
            summary.policy
        )?;
    }
    for warning in &summary.warnings {
        writeln!(out, "  warning: {warning}")?;
    }
    Ok(())
}

pub fn schema(out: &mut impl Write, columns: &[(String, ColumnType)]) -> io::Result<()> {
    writeln!(out, "\nTable schema:")?;
    for (name, ty) in columns {
        writeln!(out, "- {name}: {ty}")?;
    }
    Ok(())
}

pub fn sample(out: &mut impl Write, rows: &[Vec<Value>]) -> io::Result<()> {
    writeln!(out, "\nSample data ({} rows):", rows.len())?;
    for row in rows {
        let cells: Vec<String> = row.iter().map(display_value).collect();
        writeln!(out, "({})", cells.join(", "))?;
    }
    Ok(())
}

pub fn memory(out: &mut impl Write, usage: &MemoryUsage) -> io::Result<()> {
    writeln!(out, "\nMemory:")?;
    writeln!(
        out,
        "- limit: {}",
        usage.ceiling.map_or_else(|| "unlimited".to_owned(), bytes)
    )?;
    writeln!(out, "- peak reserved: {}", bytes(usage.peak))?;
    writeln!(
        out,
        "- spilled: {} in {} segments",
        bytes(usage.spilled_bytes as usize),
        usage.spill_segments
    )
}

pub fn hourly(out: &mut impl Write, rows: &[HourlyStats]) -> io::Result<()> {
    writeln!(out, "\nTrips by hour:")?;
    writeln!(
        out,
        "{:^6}|{:^12}|{:^14}|{:^10}|{:^10}|{:^8}",
        "Hour", "Trips", "Avg Distance", "Avg Fare", "Avg Tip", "Tip %"
    )?;
    writeln!(out, "{}", "-".repeat(65))?;
    for r in rows {
        writeln!(
            out,
            "{:^6}|{:>11} |{:>13} |{:>9} |{:>9} |{:>7}%",
            r.hour,
            grouped(r.trips),
            opt(r.avg_distance, 2),
            opt(r.avg_fare, 2),
            opt(r.avg_tip, 2),
            format!("{:.1}", r.tip_percentage)
        )?;
    }
    Ok(())
}

pub fn routes(out: &mut impl Write, routes: &PopularRoutes) -> io::Result<()> {
    writeln!(
        out,
        "\nPopular routes (coordinates rounded to {} decimals):",
        routes.precision
    )?;
    writeln!(
        out,
        "{:^24}|{:^24}|{:^10}|{:^10}|{:^10}",
        "Pickup", "Dropoff", "Trips", "Avg Fare", "Avg Total"
    )?;
    writeln!(out, "{}", "-".repeat(82))?;
    let point = |lon: Option<f64>, lat: Option<f64>| format!("({}, {})", opt(lat, 2), opt(lon, 2));
    for r in &routes.routes {
        writeln!(
            out,
            "{:^24}|{:^24}|{:>9} |{:>9} |{:>9}",
            point(r.pickup_longitude, r.pickup_latitude),
            point(r.dropoff_longitude, r.dropoff_latitude),
            grouped(r.trips),
            opt(r.avg_fare, 2),
            opt(r.avg_total, 2)
        )?;
    }
    Ok(())
}

pub fn payments(out: &mut impl Write, rows: &[PaymentStats]) -> io::Result<()> {
    writeln!(out, "\nPayment methods:")?;
    writeln!(
        out,
        "{:^14}|{:^12}|{:^10}|{:^10}|{:^14}|{:^8}",
        "Method", "Trips", "Avg Fare", "Avg Tip", "Total Tips", "Tip %"
    )?;
    writeln!(out, "{}", "-".repeat(73))?;
    for r in rows {
        writeln!(
            out,
            "{:^14}|{:>11} |{:>9} |{:>9} |{:>13} |{:>7}%",
            r.description,
            grouped(r.trips),
            opt(r.avg_fare, 2),
            opt(r.avg_tip, 2),
            opt(r.total_tips, 2),
            format!("{:.1}", r.tip_percentage)
        )?;
    }
    Ok(())
}

pub fn busy_days(out: &mut impl Write, days: &BusyDays) -> io::Result<()> {
    writeln!(out, "\nBusy days:")?;
    writeln!(
        out,
        "{:^11}|{:^12}|{:^14}|{:^10}|{:^10}|{:^11}",
        "Day", "Trips", "Avg Distance", "Avg Fare", "Avg Tip", "Avg Speed"
    )?;
    writeln!(out, "{}", "-".repeat(73))?;
    for d in &days.days {
        writeln!(
            out,
            "{:^11}|{:>11} |{:>13} |{:>9} |{:>9} |{:>6.1} mph",
            d.day,
            grouped(d.trips),
            opt(d.avg_distance, 2),
            opt(d.avg_fare, 2),
            opt(d.avg_tip, 2),
            d.avg_speed_mph
        )?;
    }
    if let Some(busiest) = days.heat_map.iter().max_by_key(|cell| cell.trips) {
        writeln!(
            out,
            "Busiest hour: {} {:02}:00 ({} trips)",
            busiest.day,
            busiest.hour,
            grouped(busiest.trips)
        )?;
    }
    Ok(())
}

pub fn large_memory(out: &mut impl Write, test: &LargeMemoryTest) -> io::Result<()> {
    writeln!(
        out,
        "\nLarger-than-memory test: {} top-ranked trips across {} distance tiles in {:.2}s",
        grouped(test.ranked_trips as u64),
        test.result_count,
        test.duration_seconds
    )?;
    let spilled = test.rank_stats.spill_segments
        + test.moving_average_stats.spill_segments
        + test.tile_stats.spill_segments;
    writeln!(out, "  window passes spilled {spilled} segments")?;
    writeln!(
        out,
        "{:^6}|{:^8}|{:^14}|{:^10}|{:^10}",
        "Tile", "Trips", "Avg Distance", "Avg Fare", "Avg Tip"
    )?;
    writeln!(out, "{}", "-".repeat(52))?;
    for t in &test.tiles {
        writeln!(
            out,
            "{:^6}|{:>7} |{:>13} |{:>9} |{:>9}",
            t.tile,
            grouped(t.trips),
            opt(t.avg_distance, 2),
            opt(t.avg_fare, 2),
            opt(t.avg_tip, 2)
        )?;
    }
    Ok(())
}
