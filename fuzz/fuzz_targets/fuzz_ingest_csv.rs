#![no_main]

use libfuzzer_sys::fuzz_target;

use tripdb_engine::{
    AggregateQuery, AggregateSpec, Engine, EngineConfig, EngineError, GroupKey, ScalarExpr,
    SourceDescriptor,
};

/// Keep each input cheap: schema inference samples everything below this size anyway.
const MAX_INPUT_BYTES: usize = 64 * 1024;

fuzz_target!(|data: &[u8]| {
    if data.len() > MAX_INPUT_BYTES {
        return;
    }
    let temp = std::env::temp_dir().join("tripdb-fuzz");
    let Ok(mut engine) = Engine::new(
        EngineConfig::default()
            .with_temp_dir(temp)
            .with_memory_limit(Some(4_096))
            .with_sample_rows(64)
            .with_batch_rows(16)
            .with_page_size_rows(32),
    ) else {
        return;
    };

    let summary = match engine.ingest(&SourceDescriptor::csv_bytes("fuzz", data.to_vec())) {
        Ok(summary) => summary,
        Err(_) => return,
    };
    let Some(table) = engine.table().cloned() else {
        panic!("ingest succeeded without installing a table");
    };
    assert_eq!(summary.row_count as usize, table.row_count());
    for col in 0..table.column_count() {
        let nulls = table.null_count(col).unwrap_or_default();
        assert_eq!(
            table.scan().count_non_null(col) as usize + nulls,
            table.row_count()
        );
    }

    // Grouping by the first column must account for every row, spilled or not.
    let Some((first, _)) = engine.describe().ok().and_then(|cols| cols.into_iter().next()) else {
        return;
    };
    let query = AggregateQuery::new()
        .group_by(GroupKey::new("key", ScalarExpr::col(first)))
        .aggregate(AggregateSpec::count("rows"));
    match engine.aggregate(&query) {
        Ok(result) => {
            let total: i64 = result
                .rows
                .iter()
                .filter_map(|row| row.get(1).and_then(|v| v.as_i64()))
                .sum();
            assert_eq!(total as usize, table.row_count());
        }
        Err(EngineError::MemoryExceeded { .. }) => {}
        Err(err) => panic!("aggregate failed: {err}"),
    }
    assert_eq!(engine.memory_usage().reserved, 0);
});
