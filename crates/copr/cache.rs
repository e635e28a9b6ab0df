use async_trait::async_trait;
use tessera_common::{KeyRange, RegionMeta, RegionVerId, ReplicaKind, Store, StoreId};

use crate::backoff::Backoff;
use crate::error::CacheError;

/// Routing information for one region replica: where to send, and at which
/// region snapshot the routing was observed.
#[derive(Clone, Debug)]
pub struct RpcContext {
    pub region: RegionVerId,
    pub meta: RegionMeta,
    pub store: Store,
}

/// A region together with the slice of the request's key ranges it covers.
#[derive(Clone, Debug)]
pub struct RegionRanges {
    pub region: RegionVerId,
    pub ranges: Vec<KeyRange>,
}

/// Client-side view of the region map.
///
/// Shared by every worker of a request, so implementations must be safe for
/// concurrent queries. Results are snapshots that can go stale at any moment;
/// staleness is handled by the retry paths of the callers, never inside the
/// cache.
#[async_trait]
pub trait RegionCache: Send + Sync {
    /// Split `ranges` at region boundaries. The pieces of one region keep
    /// the order the caller supplied and cover the input exactly once.
    async fn split_key_ranges(
        &self,
        bo: &mut Backoff,
        ranges: &[KeyRange],
    ) -> Result<Vec<RegionRanges>, CacheError>;

    /// Routing context of a replica of `region` in the requested class, or
    /// `None` when the cached snapshot for that region is gone and the
    /// caller should rebuild.
    async fn rpc_context(
        &self,
        bo: &mut Backoff,
        region: &RegionVerId,
        replica: ReplicaKind,
        leader_only: bool,
    ) -> Result<Option<RpcContext>, CacheError>;

    /// All stores of the requested class currently able to serve `region`,
    /// with `primary` first.
    fn all_replica_stores(
        &self,
        region: &RegionVerId,
        replica: ReplicaKind,
        primary: &Store,
    ) -> Vec<StoreId>;

    /// Check that a snapshot at `read_ts` is still readable, i.e. has not
    /// been collected past the GC safe point.
    fn check_visibility(&self, read_ts: u64) -> Result<(), CacheError>;
}
