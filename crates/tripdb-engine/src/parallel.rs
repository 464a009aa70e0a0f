#[cfg(all(feature = "parallel", not(target_arch = "wasm32")))]
use rayon::ThreadPool;
#[cfg(all(feature = "parallel", not(target_arch = "wasm32")))]
use std::sync::OnceLock;

/// Crate-local rayon pool for sharded aggregation.
///
/// Building our own pool instead of using rayon's global one means a failed pool build degrades
/// to single-threaded execution rather than a panic on first use.
#[cfg(all(feature = "parallel", not(target_arch = "wasm32")))]
static RAYON_POOL: OnceLock<Option<ThreadPool>> = OnceLock::new();

#[cfg(all(feature = "parallel", not(target_arch = "wasm32")))]
fn desired_threads() -> usize {
    std::env::var("RAYON_NUM_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
}

#[cfg(all(feature = "parallel", not(target_arch = "wasm32")))]
fn build_pool() -> Option<ThreadPool> {
    let requested = desired_threads().max(1);
    let try_build = |n| {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .thread_name(|i| format!("tripdb-shard-{i}"))
            .build()
    };
    match try_build(requested) {
        Ok(pool) => Some(pool),
        Err(_) if requested > 1 => try_build(1).ok(),
        Err(_) => None,
    }
}

#[cfg(all(feature = "parallel", not(target_arch = "wasm32")))]
fn pool() -> Option<&'static ThreadPool> {
    RAYON_POOL.get_or_init(build_pool).as_ref()
}

/// Number of shards to use when the caller asked for `requested` (`0` = one per pool thread).
pub(crate) fn shard_count(requested: usize) -> usize {
    if requested > 0 {
        return requested;
    }
    #[cfg(all(feature = "parallel", not(target_arch = "wasm32")))]
    {
        pool().map_or(1, |p| p.current_num_threads().max(1))
    }
    #[cfg(not(all(feature = "parallel", not(target_arch = "wasm32"))))]
    {
        1
    }
}

/// Run `f(shard)` for every shard, in parallel when a pool is available. Results are returned in
/// shard order.
pub(crate) fn map_shards<T, F>(shards: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    #[cfg(all(feature = "parallel", not(target_arch = "wasm32")))]
    if shards > 1 {
        if let Some(pool) = pool() {
            use rayon::prelude::*;
            return pool.install(|| (0..shards).into_par_iter().map(&f).collect());
        }
    }
    (0..shards).map(f).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_come_back_in_shard_order() {
        let out = map_shards(5, |i| i * 10);
        assert_eq!(out, vec![0, 10, 20, 30, 40]);
        assert!(shard_count(0) >= 1);
        assert_eq!(shard_count(3), 3);
    }
}
