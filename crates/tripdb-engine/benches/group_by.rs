use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use tripdb_columnar::{ColumnSchema, ColumnType, ColumnarTableBuilder, TableOptions, Value};
use tripdb_engine::{
    AggregateQuery, AggregateSpec, Engine, EngineConfig, GroupKey, OrderBy, ScalarExpr,
};

fn bench_rows() -> usize {
    std::env::var("TRIPDB_GROUP_BY_BENCH_ROWS")
        .ok()
        .and_then(|v| v.replace('_', "").parse::<usize>().ok())
        .filter(|&v| (10_000..=5_000_000).contains(&v))
        .unwrap_or(1_000_000)
}

fn build_table(rows: usize) -> tripdb_columnar::ColumnarTable {
    let schema = vec![
        ColumnSchema::new("pickup", ColumnType::Timestamp),
        ColumnSchema::new("payment_type", ColumnType::Int64),
        ColumnSchema::new("fare_amount", ColumnType::Float64),
        ColumnSchema::new("tip_amount", ColumnType::Float64),
    ];
    let mut builder = ColumnarTableBuilder::new(schema, TableOptions::default());
    for i in 0..rows {
        builder
            .append_row(&[
                Value::Timestamp(1_456_790_400 + (i as i64 * 37) % 2_678_400),
                Value::Int(1 + (i % 5) as i64),
                Value::Float(((i * 31) % 7_000) as f64 / 100.0),
                Value::Float(((i * 11) % 900) as f64 / 100.0),
            ])
            .unwrap();
    }
    builder.finalize()
}

fn engine(limit: Option<usize>, table: Arc<tripdb_columnar::ColumnarTable>) -> Engine {
    let mut engine = Engine::new(
        EngineConfig::default()
            .with_memory_limit(limit)
            .with_temp_dir(std::env::temp_dir().join("tripdb-bench")),
    )
    .unwrap();
    engine.set_table("bench", table);
    engine
}

fn bench_group_by(c: &mut Criterion) {
    let rows = bench_rows();
    let table = Arc::new(build_table(rows));

    let by_hour = AggregateQuery::new()
        .group_by(GroupKey::new("hour", ScalarExpr::hour("pickup")))
        .aggregate(AggregateSpec::count("trips"))
        .aggregate(AggregateSpec::avg("avg_fare", ScalarExpr::col("fare_amount")))
        .order_by(OrderBy::asc("hour"));
    // 7,000 fare groups: enough to spill under the small ceiling.
    let by_fare = AggregateQuery::new()
        .group_by(GroupKey::new("fare", ScalarExpr::round(ScalarExpr::col("fare_amount"), 2)))
        .aggregate(AggregateSpec::sum("tips", ScalarExpr::col("tip_amount")));

    let mut group = c.benchmark_group("group_by");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(10));
    group.throughput(Throughput::Elements(rows as u64));

    let unlimited = engine(None, table.clone());
    let small = engine(Some(256 << 10), table);
    for (name, query) in [("hour", &by_hour), ("fare", &by_fare)] {
        group.bench_with_input(BenchmarkId::new(format!("{name}/unlimited"), rows), &rows, |b, _| {
            b.iter(|| black_box(unlimited.aggregate(query).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new(format!("{name}/256KiB"), rows), &rows, |b, _| {
            b.iter(|| black_box(small.aggregate(query).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_group_by);
criterion_main!(benches);
