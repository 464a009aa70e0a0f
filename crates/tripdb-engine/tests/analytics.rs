use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tripdb_engine::{
    AggregateQuery, AggregateSpec, ColumnType, Engine, EngineConfig, GroupKey, OrderBy,
    Predicate, Progress, RankMode, Scalar, ScalarExpr, SortDirection, SourceDescriptor,
};

const TRIPS: &str = "\
tpep_pickup_datetime,tpep_dropoff_datetime,passenger_count,trip_distance,payment_type,fare_amount,tip_amount
2016-03-07 00:10:00,2016-03-07 00:25:00,1,2.5,1,10,2
2016-03-07 00:45:00,2016-03-07 00:50:30,2,0.8,2,20,0
2016-03-07 13:00:00,2016-03-07 13:30:00,1,6.1,1,30,6
2016-03-08 09:00:00,2016-03-08 09:00:40,1,0,1,0,0
";

fn engine(dir: &std::path::Path) -> Engine {
    Engine::new(EngineConfig::default().with_temp_dir(dir.join("temp"))).unwrap()
}

fn loaded(dir: &std::path::Path, data: &str) -> Engine {
    let mut engine = engine(dir);
    engine
        .ingest(&SourceDescriptor::csv_bytes("trips", data.as_bytes().to_vec()))
        .unwrap();
    engine
}

#[test]
fn hourly_counts_and_average_fares() {
    let csv = "pickup,fare\n\
        2024-01-01 00:05:00,10\n\
        2024-01-01 00:40:00,20\n\
        2024-01-01 13:10:00,30\n";
    let temp = tempfile::tempdir().unwrap();
    let engine = loaded(temp.path(), csv);
    let result = engine
        .aggregate(
            &AggregateQuery::new()
                .group_by(GroupKey::new("hour", ScalarExpr::hour("pickup")))
                .aggregate(AggregateSpec::count("trips"))
                .aggregate(AggregateSpec::avg("avg_fare", ScalarExpr::col("fare")))
                .order_by(OrderBy::asc("hour")),
        )
        .unwrap();
    assert_eq!(
        result.rows,
        vec![
            vec![Scalar::Int(0), Scalar::Int(2), Scalar::float(15.0)],
            vec![Scalar::Int(13), Scalar::Int(1), Scalar::float(30.0)],
        ]
    );
}

#[test]
fn group_counts_cover_every_row() {
    let temp = tempfile::tempdir().unwrap();
    let engine = loaded(temp.path(), TRIPS);
    let result = engine
        .aggregate(
            &AggregateQuery::new()
                .group_by(GroupKey::column("payment_type"))
                .aggregate(AggregateSpec::count("trips")),
        )
        .unwrap();
    let total: i64 = result
        .rows
        .iter()
        .filter_map(|row| result.column_index("trips").and_then(|i| row[i].as_i64()))
        .sum();
    assert_eq!(total as usize, engine.table().unwrap().row_count());
}

#[test]
fn tip_percentage_skips_free_rides_but_counts_them() {
    let temp = tempfile::tempdir().unwrap();
    let engine = loaded(temp.path(), TRIPS);
    let tip_pct = ScalarExpr::scale(
        ScalarExpr::div(ScalarExpr::col("tip_amount"), ScalarExpr::col("fare_amount")),
        100.0,
    );
    let result = engine
        .aggregate(
            &AggregateQuery::new()
                .group_by(GroupKey::column("payment_type"))
                .aggregate(AggregateSpec::count("trips"))
                .aggregate(AggregateSpec::avg("tip_pct", tip_pct))
                .order_by(OrderBy::asc("payment_type")),
        )
        .unwrap();
    // Card trips: 2/10 and 6/30 are both 20%; the zero-fare trip counts but has no ratio.
    assert_eq!(result.value(0, "trips"), Some(&Scalar::Int(3)));
    let pct = result.value(0, "tip_pct").and_then(Scalar::as_f64).unwrap();
    assert!((pct - 20.0).abs() < 1e-9);
    assert_eq!(result.value(1, "tip_pct"), Some(&Scalar::float(0.0)));
}

#[test]
fn day_names_and_speeds() {
    let temp = tempfile::tempdir().unwrap();
    let engine = loaded(temp.path(), TRIPS);
    let duration = ScalarExpr::duration_seconds("tpep_pickup_datetime", "tpep_dropoff_datetime");
    let speed = ScalarExpr::div(
        ScalarExpr::col("trip_distance"),
        ScalarExpr::div(duration.clone(), ScalarExpr::lit(3_600.0)),
    );
    let result = engine
        .aggregate(
            &AggregateQuery::new()
                .group_by(GroupKey::new("day", ScalarExpr::day_name("tpep_pickup_datetime")))
                .aggregate(AggregateSpec::count("trips"))
                .aggregate(AggregateSpec::avg("avg_speed", speed))
                .filter(Predicate::Gt(ScalarExpr::col("trip_distance"), 0.0))
                .filter(Predicate::Gt(duration, 60.0))
                .order_by(OrderBy::desc("trips")),
        )
        .unwrap();
    // Only Monday trips survive the filters (Tuesday's trip has no distance).
    assert_eq!(result.len(), 1);
    assert_eq!(result.value(0, "day"), Some(&Scalar::from("Monday")));
    assert_eq!(result.value(0, "trips"), Some(&Scalar::Int(3)));
    let speed = result.value(0, "avg_speed").and_then(Scalar::as_f64).unwrap();
    let expected = (10.0 + 0.8 / (330.0 / 3_600.0) + 12.2) / 3.0;
    assert!((speed - expected).abs() < 1e-9);
    assert_eq!(result.stats.rows_filtered_out, 1);
}

#[test]
fn rejected_rows_keep_columns_consistent() {
    let csv = "pickup,fare\n\
        2024-01-01 00:05:00,10.5\n\
        2024-01-01 00:06:00,11\n\
        2024-01-01 00:07:00,abc\n\
        not a date,12\n";
    let temp = tempfile::tempdir().unwrap();
    let mut engine = Engine::new(
        EngineConfig::default()
            .with_temp_dir(temp.path().join("temp"))
            .with_sample_rows(2),
    )
    .unwrap();
    let summary = engine
        .ingest(&SourceDescriptor::csv_bytes("dirty", csv.as_bytes().to_vec()))
        .unwrap();
    assert_eq!(summary.row_count, 4);
    assert_eq!(summary.rejected_count, 2);

    let table = engine.table().unwrap();
    assert_eq!(
        engine.describe().unwrap(),
        vec![
            ("pickup".to_owned(), ColumnType::Timestamp),
            ("fare".to_owned(), ColumnType::Float64),
        ]
    );
    for col in 0..table.column_count() {
        let nulls = table.null_count(col).unwrap();
        assert_eq!(nulls, 1);
        assert_eq!(
            table.scan().count_non_null(col) as usize + nulls,
            table.row_count()
        );
    }
}

#[test]
fn large_table_window_battery() {
    // Rank within day, moving average and tiles joined back by row id, as the report does.
    let mut csv = String::from("pickup,fare,distance\n");
    for i in 0..600u32 {
        csv.push_str(&format!(
            "2016-03-{:02} {:02}:{:02}:00,{},{}\n",
            1 + i % 3,
            (i / 60) % 24,
            i % 60,
            (i * 37) % 101,
            f64::from((i * 13) % 50) / 10.0
        ));
    }
    let temp = tempfile::tempdir().unwrap();
    let engine = loaded(temp.path(), &csv);
    let rows = engine.table().unwrap().row_count();

    let ranks = engine
        .rank_within_partition(
            &ScalarExpr::day_of_month("pickup"),
            &ScalarExpr::col("fare"),
            SortDirection::Descending,
            RankMode::RowNumber,
        )
        .unwrap();
    let tiles = engine
        .percentile_tile(&ScalarExpr::col("distance"), 100)
        .unwrap();
    let averages = engine
        .moving_average(&ScalarExpr::col("pickup"), &ScalarExpr::col("fare"), 50)
        .unwrap();
    assert_eq!((ranks.len(), tiles.len(), averages.len()), (rows, rows, rows));

    // 200 rows per day: ranks 1..=200 in each.
    let by_row = ranks.by_row(rows);
    assert!(by_row.iter().all(|r| matches!(r, Some(rank) if (1..=200).contains(*rank))));
    assert_eq!(ranks.rows.iter().filter(|(_, r)| *r == 1).count(), 3);

    // 600 rows into 100 tiles: six per tile.
    let mut per_tile = [0u32; 101];
    for (_, tile) in &tiles.rows {
        per_tile[*tile as usize] += 1;
    }
    assert!(per_tile[1..].iter().all(|&n| n == 6));
    assert!(averages.rows.iter().all(|(_, avg)| avg.is_some()));
}

#[test]
fn progress_is_reported_per_batch() {
    let temp = tempfile::tempdir().unwrap();
    let mut engine = Engine::new(
        EngineConfig::default()
            .with_temp_dir(temp.path().join("temp"))
            .with_batch_rows(1)
            .with_page_size_rows(2),
    )
    .unwrap();
    let calls = Arc::new(AtomicU64::new(0));
    let seen = calls.clone();
    engine.set_progress_observer(Some(Arc::new(move |_: &Progress| {
        seen.fetch_add(1, Ordering::Relaxed);
    })));
    engine
        .ingest(&SourceDescriptor::csv_bytes("trips", TRIPS.as_bytes().to_vec()))
        .unwrap();
    let after_ingest = calls.load(Ordering::Relaxed);
    assert_eq!(after_ingest, 4);

    engine
        .percentile_tile(&ScalarExpr::col("fare_amount"), 2)
        .unwrap();
    assert_eq!(calls.load(Ordering::Relaxed) - after_ingest, 2);
}
