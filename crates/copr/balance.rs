//! Spreads regions across replica-equivalent storage nodes.
//!
//! Task construction tentatively assigns every region to its home store, so
//! a skewed home distribution would overload one node while its peers idle.
//! The balancer moves regions that have more than one valid replica onto the
//! lightest nodes, under three rules: the first region of every batch stays
//! where it is (no node is emptied), a region only moves to a node that
//! already serves a home region, and a region with a single valid target is
//! pinned there outright.

use indexmap::IndexMap;
use std::sync::Arc;
use tessera_common::{RegionVerId, StoreId};
use tracing::warn;

use crate::tasks::{BatchTask, RegionInfo};

type StoreTaskMap = IndexMap<StoreId, BatchTask>;
type CandidateMap = IndexMap<StoreId, IndexMap<RegionVerId, Arc<RegionInfo>>>;

/// Weight of a store, lower is better. `None` when the store has nothing
/// left to take.
///
/// `waiting / avg` discounts stores that could receive many regions later,
/// `placed` penalizes stores that are already heavy. Counting regions rather
/// than bytes is fine because the upstream splitter produces similarly sized
/// regions.
fn store_weight(
    store: StoreId,
    candidates: &CandidateMap,
    tasks: &StoreTaskMap,
    avg: f64,
) -> Option<f64> {
    let waiting = candidates.get(&store)?.len();
    if waiting == 0 {
        return None;
    }
    let placed = tasks.get(&store)?.regions.len();
    Some(waiting as f64 / avg + placed as f64)
}

/// Scan every store still holding candidates; first store with the strictly
/// lowest weight wins.
fn find_store_full(candidates: &CandidateMap, tasks: &StoreTaskMap, avg: f64) -> Option<StoreId> {
    let mut best: Option<(StoreId, f64)> = None;
    for &store in candidates.keys() {
        let Some(weight) = store_weight(store, candidates, tasks, avg) else {
            continue;
        };
        match best {
            Some((_, best_weight)) if weight >= best_weight => {}
            _ => best = Some((store, weight)),
        }
    }
    best.map(|(store, _)| store)
}

/// Rescan only the stores whose candidate set was touched by the just-placed
/// region, against the refreshed weight of the store that took it. A touched
/// store matching the current weight (`<=`) takes over, so on ties the later
/// store in `touched` wins. Checking every store would be marginally better,
/// but the touched set is where the weights actually changed.
fn find_store_local(
    touched: &[StoreId],
    current: StoreId,
    candidates: &CandidateMap,
    tasks: &StoreTaskMap,
    avg: f64,
) -> Option<StoreId> {
    let mut best = store_weight(current, candidates, tasks, avg).map(|weight| (current, weight));
    for &store in touched {
        if store == current {
            continue;
        }
        let Some(weight) = store_weight(store, candidates, tasks, avg) else {
            continue;
        };
        match best {
            Some((_, best_weight)) if weight > best_weight => {}
            _ => best = Some((store, weight)),
        }
    }
    best.map(|(store, _)| store)
}

/// Redistribute movable regions across the stores already present in
/// `original`. Returns `original` untouched whenever balancing is impossible
/// or pointless; the result then is skewed but still covers every range.
pub(crate) fn balance_batch_tasks(original: Vec<BatchTask>) -> Vec<BatchTask> {
    if original.len() <= 1 {
        return original;
    }

    // Seed one task per store with its anchor region.
    let mut store_tasks: StoreTaskMap = IndexMap::new();
    for task in &original {
        let Some(anchor) = task.regions.first() else {
            return original;
        };
        store_tasks.insert(
            task.store_id(),
            BatchTask {
                store_addr: task.store_addr.clone(),
                ctx: task.ctx.clone(),
                kind: task.kind,
                regions: vec![anchor.clone()],
            },
        );
    }

    let mut candidates: CandidateMap = IndexMap::new();
    // Candidate slots across all stores, and candidate regions left to place.
    let mut total_slots: usize = 0;
    let mut remaining: usize = 0;

    for task in &original {
        let home_store = task.store_id();
        for region_info in task.regions.iter().skip(1) {
            let valid_targets = if region_info.all_stores.len() <= 1 {
                1
            } else {
                region_info
                    .all_stores
                    .iter()
                    .filter(|store| store_tasks.contains_key(*store))
                    .count()
            };
            if valid_targets <= 1 {
                // Single valid target: pinned to its home batch, no weighing.
                if let Some(home_task) = store_tasks.get_mut(&home_store) {
                    home_task.regions.push(region_info.clone());
                }
                continue;
            }
            total_slots += valid_targets;
            remaining += 1;
            for store in &region_info.all_stores {
                if !store_tasks.contains_key(store) {
                    continue;
                }
                let per_store = candidates.entry(*store).or_default();
                if per_store
                    .insert(region_info.region, region_info.clone())
                    .is_some()
                {
                    // The same region queued twice would be dispatched twice.
                    warn!(
                        region = %region_info.region,
                        "duplicate candidate region, giving up balancing",
                    );
                    return original;
                }
            }
        }
    }

    if remaining == 0 {
        return original;
    }

    let mut avg = total_slots as f64 / remaining as f64;
    let mut current = find_store_full(&candidates, &store_tasks, avg);
    while remaining > 0 {
        let Some(store) = current else {
            break;
        };
        let Some(per_store) = candidates.get(&store) else {
            break;
        };
        let Some((&region_key, region_info)) = per_store.first() else {
            break;
        };
        let region_info = Arc::clone(region_info);

        let Some(target) = store_tasks.get_mut(&store) else {
            break;
        };
        target.regions.push(Arc::clone(&region_info));
        remaining -= 1;

        // The placed region stops being a candidate everywhere.
        for other in &region_info.all_stores {
            if let Some(set) = candidates.get_mut(other) {
                if set.shift_remove(&region_key).is_some() {
                    total_slots -= 1;
                }
                if set.is_empty() {
                    candidates.shift_remove(other);
                }
            }
        }

        if remaining > 0 {
            avg = total_slots as f64 / remaining as f64;
            current =
                find_store_local(&region_info.all_stores, store, &candidates, &store_tasks, avg)
                    .or_else(|| find_store_full(&candidates, &store_tasks, avg));
        }
    }

    if remaining > 0 {
        // Dropping a candidate would leave part of the key space unserved.
        warn!(remaining, "candidate regions left unplaced, giving up balancing");
        return original;
    }

    store_tasks.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RpcContext;
    use crate::transport::CommandKind;
    use bytes::Bytes;
    use tessera_common::{KeyRange, RegionEpoch, RegionMeta, RegionVerId, Store};

    fn region(id: u64, all_stores: &[StoreId]) -> Arc<RegionInfo> {
        let epoch = RegionEpoch {
            conf_ver: 1,
            version: 1,
        };
        let start = Bytes::from(vec![id as u8]);
        let end = Bytes::from(vec![id as u8 + 1]);
        Arc::new(RegionInfo {
            region: RegionVerId::new(id, epoch),
            meta: RegionMeta {
                id,
                start_key: start.clone(),
                end_key: end.clone(),
                epoch,
            },
            ranges: vec![KeyRange::new(start, end)],
            all_stores: all_stores.to_vec(),
        })
    }

    fn task(store: StoreId, regions: Vec<Arc<RegionInfo>>) -> BatchTask {
        let addr = format!("store-{store}:20170");
        let first = regions.first().expect("task needs regions");
        BatchTask {
            store_addr: addr.clone(),
            ctx: RpcContext {
                region: first.region,
                meta: first.meta.clone(),
                store: Store::new(store, addr),
            },
            kind: CommandKind::BatchRead,
            regions,
        }
    }

    fn region_ids(task: &BatchTask) -> Vec<u64> {
        task.regions.iter().map(|info| info.region.id).collect()
    }

    fn find_task<'a>(tasks: &'a [BatchTask], store: StoreId) -> &'a BatchTask {
        tasks
            .iter()
            .find(|task| task.store_id() == store)
            .expect("store must keep a task")
    }

    #[test]
    fn single_task_passes_through() {
        let tasks = vec![task(1, vec![region(1, &[1]), region(2, &[1])])];
        let balanced = balance_batch_tasks(tasks.clone());
        assert_eq!(balanced.len(), 1);
        assert_eq!(region_ids(&balanced[0]), region_ids(&tasks[0]));
    }

    #[test]
    fn anchors_only_is_a_no_op() {
        let tasks = vec![
            task(1, vec![region(1, &[1, 2])]),
            task(2, vec![region(2, &[2, 1])]),
        ];
        let balanced = balance_batch_tasks(tasks);
        assert_eq!(balanced.len(), 2);
        assert_eq!(region_ids(find_task(&balanced, 1)), vec![1]);
        assert_eq!(region_ids(find_task(&balanced, 2)), vec![2]);
    }

    #[test]
    fn skewed_home_distribution_is_spread() {
        // Store 1 is home to regions 10..14, every one replicated on store 2;
        // store 2 brings only its own anchor. Two of the four movable
        // regions must end up on store 2.
        let tasks = vec![
            task(
                1,
                vec![
                    region(10, &[1, 2]),
                    region(11, &[1, 2]),
                    region(12, &[1, 2]),
                    region(13, &[1, 2]),
                    region(14, &[1, 2]),
                ],
            ),
            task(2, vec![region(20, &[2, 1])]),
        ];
        let balanced = balance_batch_tasks(tasks);
        assert_eq!(balanced.len(), 2);

        let on_store1 = region_ids(find_task(&balanced, 1));
        let on_store2 = region_ids(find_task(&balanced, 2));
        assert_eq!(on_store1[0], 10, "anchor must stay first");
        assert_eq!(on_store2[0], 20, "anchor must stay first");
        assert_eq!(on_store1.len(), 3);
        assert_eq!(on_store2.len(), 3);

        // Every region placed exactly once.
        let mut all: Vec<u64> = on_store1.iter().chain(on_store2.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, vec![10, 11, 12, 13, 14, 20]);
    }

    #[test]
    fn balancing_is_deterministic() {
        let build = || {
            vec![
                task(
                    1,
                    vec![
                        region(10, &[1, 2]),
                        region(11, &[1, 2]),
                        region(12, &[1, 2]),
                        region(13, &[1, 2]),
                        region(14, &[1, 2]),
                    ],
                ),
                task(2, vec![region(20, &[2, 1])]),
            ]
        };
        let first: Vec<Vec<u64>> = balance_batch_tasks(build()).iter().map(region_ids).collect();
        let second: Vec<Vec<u64>> = balance_batch_tasks(build()).iter().map(region_ids).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn singleton_region_never_moves() {
        let tasks = vec![
            task(
                1,
                vec![
                    region(10, &[1, 2]),
                    // Replicated nowhere else: must stay on store 1.
                    region(11, &[1]),
                    region(12, &[1, 2]),
                ],
            ),
            task(2, vec![region(20, &[2, 1])]),
        ];
        let balanced = balance_batch_tasks(tasks);
        let on_store1 = region_ids(find_task(&balanced, 1));
        assert!(on_store1.contains(&11));
    }

    #[test]
    fn duplicate_candidate_returns_original() {
        let duplicated = region(11, &[1, 2]);
        let tasks = vec![
            task(1, vec![region(10, &[1, 2]), duplicated.clone()]),
            task(2, vec![region(20, &[2, 1]), duplicated]),
        ];
        let expected: Vec<Vec<u64>> = tasks.iter().map(region_ids).collect();
        let balanced = balance_batch_tasks(tasks);
        let got: Vec<Vec<u64>> = balanced.iter().map(region_ids).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn region_replicated_on_untracked_store_is_pinned_home() {
        // Store 3 serves no home region, so it is not a valid target and
        // region 11 has only its home left.
        let tasks = vec![
            task(1, vec![region(10, &[1, 2]), region(11, &[1, 3])]),
            task(2, vec![region(20, &[2, 1])]),
        ];
        let balanced = balance_batch_tasks(tasks);
        let on_store1 = region_ids(find_task(&balanced, 1));
        assert!(on_store1.contains(&11));
    }
}
