use pretty_assertions::assert_eq;
use tripdb_engine::{
    AggregateQuery, AggregateResult, AggregateSpec, Engine, EngineConfig, EngineError, GroupKey,
    OrderBy, RankMode, ScalarExpr, SortDirection, SourceDescriptor,
};

/// 10,000 synthetic trips; payment types arrive in runs of 100 so groups come and go.
fn synthetic_trips() -> String {
    let mut csv = String::from("tpep_pickup_datetime,payment_type,fare_amount,tip_amount\n");
    for i in 0..10_000u32 {
        csv.push_str(&format!(
            "2016-03-{:02} {:02}:{:02}:{:02},{},{},{}\n",
            1 + (i / 1_440) % 28,
            (i / 60) % 24,
            i % 60,
            (i * 7) % 60,
            1 + (i / 100) % 5,
            5 + (i * 31) % 70,
            (i * 11) % 9
        ));
    }
    csv
}

fn engine(dir: &std::path::Path, limit: Option<usize>, parallelism: usize) -> Engine {
    let mut engine = Engine::new(
        EngineConfig::default()
            .with_memory_limit(limit)
            .with_temp_dir(dir.join("temp"))
            .with_page_size_rows(1_024)
            .with_parallelism(parallelism),
    )
    .unwrap();
    engine
        .ingest(&SourceDescriptor::csv_bytes("synthetic", synthetic_trips()))
        .unwrap();
    engine
}

fn payment_query() -> AggregateQuery {
    AggregateQuery::new()
        .group_by(GroupKey::column("payment_type"))
        .aggregate(AggregateSpec::count("trips"))
        .aggregate(AggregateSpec::avg("avg_fare", ScalarExpr::col("fare_amount")))
        .aggregate(AggregateSpec::sum("total_tips", ScalarExpr::col("tip_amount")))
        .order_by(OrderBy::asc("payment_type"))
}

fn payments(engine: &Engine) -> AggregateResult {
    engine.aggregate(&payment_query()).unwrap()
}

#[test]
fn one_kilobyte_ceiling_gives_the_unlimited_answer() {
    let temp = tempfile::tempdir().unwrap();
    let expected = payments(&engine(temp.path(), None, 1));
    assert_eq!(expected.len(), 5);
    assert_eq!(expected.stats.spill_segments, 0);

    for parallelism in [1, 4] {
        let engine = engine(temp.path(), Some(1_000), parallelism);
        let spilled = payments(&engine);
        assert_eq!(spilled.rows, expected.rows);
        assert!(spilled.stats.spill_segments >= 1);
        assert!(spilled.stats.peak_reserved_bytes <= 1_000);
        assert_eq!(engine.memory_usage().reserved, 0);
    }
}

#[test]
fn spill_directories_are_removed_after_queries() {
    let temp = tempfile::tempdir().unwrap();
    let engine = engine(temp.path(), Some(1_000), 1);
    payments(&engine);
    engine
        .percentile_tile(&ScalarExpr::col("fare_amount"), 10)
        .unwrap();
    let spill_root = temp.path().join("temp");
    let leftovers = std::fs::read_dir(&spill_root)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[test]
fn windows_under_a_small_ceiling_match() {
    let temp = tempfile::tempdir().unwrap();
    let unlimited = engine(temp.path(), None, 1);
    let small = engine(temp.path(), Some(8_192), 1);

    let rank = |engine: &Engine| {
        engine
            .rank_within_partition(
                &ScalarExpr::day_of_month("tpep_pickup_datetime"),
                &ScalarExpr::col("fare_amount"),
                SortDirection::Descending,
                RankMode::Competition,
            )
            .unwrap()
    };
    let (a, b) = (rank(&unlimited), rank(&small));
    assert_eq!(a.rows, b.rows);
    assert!(b.stats.spill_segments > 0);

    let tiles = |engine: &Engine| {
        engine
            .percentile_tile(&ScalarExpr::col("fare_amount"), 100)
            .unwrap()
            .rows
    };
    assert_eq!(tiles(&unlimited), tiles(&small));

    let moving = |engine: &Engine| {
        engine
            .moving_average(
                &ScalarExpr::col("tpep_pickup_datetime"),
                &ScalarExpr::col("fare_amount"),
                20,
            )
            .unwrap()
            .rows
    };
    assert_eq!(moving(&unlimited), moving(&small));
}

#[test]
fn queries_fail_alone_when_the_ceiling_is_too_small() {
    let temp = tempfile::tempdir().unwrap();
    let engine = engine(temp.path(), Some(64), 1);
    let err = engine.aggregate(&payment_query()).unwrap_err();
    assert!(matches!(err, EngineError::MemoryExceeded { .. }));
    // The failed query released everything and the table is still usable.
    assert_eq!(engine.memory_usage().reserved, 0);
    assert_eq!(engine.describe().unwrap().len(), 4);
}
