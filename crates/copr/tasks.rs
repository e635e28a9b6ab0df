use indexmap::IndexMap;
use indexmap::map::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_common::{KeyRange, RegionMeta, RegionVerId, ReplicaKind, StoreId};
use tracing::{info, warn};

use crate::backoff::{Backoff, BackoffReason};
use crate::balance::balance_batch_tasks;
use crate::cache::{RegionCache, RpcContext};
use crate::error::CoprError;
use crate::transport::CommandKind;

/// Building the task set is pure map lookups; anything slower means the
/// region map is churning under us and deserves a trace.
pub(crate) const BUILD_WARN_THRESHOLD: Duration = Duration::from_millis(500);

/// Immutable snapshot of one region scheduled into a batch.
#[derive(Clone, Debug)]
pub struct RegionInfo {
    pub region: RegionVerId,
    pub meta: RegionMeta,
    /// The slice of the request's key ranges inside this region.
    pub ranges: Vec<KeyRange>,
    /// Stores able to serve this region, home store first.
    pub all_stores: Vec<StoreId>,
}

/// All regions a single worker sends to a single storage node.
///
/// `regions` is never empty, every region lists the task's store among its
/// replicas, and the first region is one whose home store this is.
#[derive(Clone, Debug)]
pub struct BatchTask {
    pub store_addr: String,
    pub ctx: RpcContext,
    pub kind: CommandKind,
    pub regions: Vec<Arc<RegionInfo>>,
}

impl BatchTask {
    pub(crate) fn store_id(&self) -> StoreId {
        self.ctx.store.id
    }

    /// Union of the key ranges of every region in this batch, used to replan
    /// the whole batch after a store-level failure.
    pub fn all_ranges(&self) -> Vec<KeyRange> {
        self.regions
            .iter()
            .flat_map(|info| info.ranges.iter().cloned())
            .collect()
    }
}

/// Split `ranges` against the region map and group the pieces into one batch
/// task per storage node.
///
/// A region the map cannot route yet marks the whole build for retry: the
/// snapshot is stale and the next split reloads it. Retries are paced by the
/// region-miss backoff and its budget is the terminal failure.
pub async fn build_batch_tasks(
    bo: &mut Backoff,
    cache: &dyn RegionCache,
    ranges: &[KeyRange],
    replica: ReplicaKind,
) -> Result<Vec<BatchTask>, CoprError> {
    let started = Instant::now();
    let kind = CommandKind::BatchRead;
    loop {
        let located = cache.split_key_ranges(bo, ranges).await?;

        let mut store_tasks: IndexMap<String, BatchTask> = IndexMap::new();
        let mut needs_retry = false;
        for per_region in located {
            let Some(ctx) = cache
                .rpc_context(bo, &per_region.region, replica, false)
                .await?
            else {
                needs_retry = true;
                info!(region = %per_region.region, "no routable replica, will rebuild");
                continue;
            };
            let all_stores = cache.all_replica_stores(&per_region.region, replica, &ctx.store);
            let region_info = Arc::new(RegionInfo {
                region: per_region.region,
                meta: ctx.meta.clone(),
                ranges: per_region.ranges,
                all_stores,
            });
            match store_tasks.entry(ctx.store.addr.clone()) {
                Entry::Occupied(mut entry) => entry.get_mut().regions.push(region_info),
                Entry::Vacant(entry) => {
                    let store_addr = ctx.store.addr.clone();
                    entry.insert(BatchTask {
                        store_addr,
                        ctx,
                        kind,
                        regions: vec![region_info],
                    });
                }
            }
        }

        if needs_retry {
            bo.backoff(
                BackoffReason::RegionMiss,
                "region without a routable replica",
            )
            .await?;
            continue;
        }

        let tasks: Vec<BatchTask> = store_tasks.into_values().collect();
        let elapsed = started.elapsed();
        if elapsed > BUILD_WARN_THRESHOLD {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                range_count = ranges.len(),
                task_count = tasks.len(),
                "building batch tasks took too long",
            );
        }
        return Ok(balance_batch_tasks(tasks));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockRegionCache, mock_region};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn regions_with_the_same_home_share_one_task() {
        let cache = MockRegionCache::new(vec![
            mock_region(1, &b"a"[..], &b"b"[..], &[(1, "s1:20170")]),
            mock_region(2, &b"b"[..], &b"c"[..], &[(1, "s1:20170")]),
        ]);
        let mut bo = Backoff::new(Duration::from_secs(1));
        let ranges = vec![KeyRange::new(&b"a"[..], &b"c"[..])];

        let tasks = build_batch_tasks(&mut bo, &cache, &ranges, ReplicaKind::Columnar)
            .await
            .expect("build must succeed");

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].store_addr, "s1:20170");
        assert_eq!(tasks[0].regions.len(), 2);
        assert_eq!(tasks[0].all_ranges().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ranges_outside_a_single_region_are_clipped_per_region() {
        let cache = MockRegionCache::new(vec![
            mock_region(1, &b"a"[..], &b"m"[..], &[(1, "s1:20170")]),
            mock_region(2, &b"m"[..], &b""[..], &[(2, "s2:20170")]),
        ]);
        let mut bo = Backoff::new(Duration::from_secs(1));
        let ranges = vec![
            KeyRange::new(&b"c"[..], &b"f"[..]),
            KeyRange::new(&b"k"[..], &b"p"[..]),
        ];

        let tasks = build_batch_tasks(&mut bo, &cache, &ranges, ReplicaKind::Columnar)
            .await
            .expect("build must succeed");

        assert_eq!(tasks.len(), 2);
        let mut covered: Vec<KeyRange> = tasks
            .iter()
            .flat_map(|task| task.all_ranges())
            .collect();
        covered.sort();
        assert_eq!(
            covered,
            vec![
                KeyRange::new(&b"c"[..], &b"f"[..]),
                KeyRange::new(&b"k"[..], &b"m"[..]),
                KeyRange::new(&b"m"[..], &b"p"[..]),
            ],
        );
    }
}
