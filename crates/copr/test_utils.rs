//! Scripted in-memory collaborators for the test suite.
//!
//! [`MockRegionCache`] serves a fixed region table with optional scripted
//! lookup misses; [`MockTransport`] answers sends from per-store outcome
//! scripts and records everything it was asked to send.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tessera_common::{KeyRange, RegionId, RegionMeta, RegionVerId, ReplicaKind, Store, StoreId};
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::cache::{RegionCache, RegionRanges, RpcContext};
use crate::error::{CacheError, TransportError};
use crate::transport::{
    BatchCopRequest, BatchStream, CoprTransport, Fragment, FragmentStream, SendOutcome,
};

/// One region of the mock region table. `stores[0]` is the home store.
#[derive(Clone, Debug)]
pub struct MockRegion {
    pub meta: RegionMeta,
    pub stores: Vec<Store>,
}

pub fn mock_region(
    id: RegionId,
    start: impl Into<Bytes>,
    end: impl Into<Bytes>,
    stores: &[(StoreId, &str)],
) -> MockRegion {
    MockRegion {
        meta: RegionMeta {
            id,
            start_key: start.into(),
            end_key: end.into(),
            epoch: Default::default(),
        },
        stores: stores
            .iter()
            .map(|(id, addr)| Store::new(*id, *addr))
            .collect(),
    }
}

/// Region map backed by a static table.
pub struct MockRegionCache {
    regions: Vec<MockRegion>,
    /// Remaining scripted `rpc_context` misses per region.
    misses: Mutex<HashMap<RegionId, u32>>,
    safe_point: u64,
}

impl MockRegionCache {
    pub fn new(mut regions: Vec<MockRegion>) -> Self {
        regions.sort_by(|a, b| a.meta.start_key.cmp(&b.meta.start_key));
        Self {
            regions,
            misses: Mutex::new(HashMap::new()),
            safe_point: 0,
        }
    }

    /// Make the next `times` context lookups of `region_id` come back empty,
    /// as a stale map snapshot would.
    pub fn with_misses(self, region_id: RegionId, times: u32) -> Self {
        self.misses
            .lock()
            .expect("mock state poisoned")
            .insert(region_id, times);
        self
    }

    pub fn with_safe_point(mut self, safe_point: u64) -> Self {
        self.safe_point = safe_point;
        self
    }

    fn lookup(&self, region: &RegionVerId) -> Option<&MockRegion> {
        self.regions.iter().find(|r| r.meta.id == region.id)
    }

    fn clip(range: &KeyRange, meta: &RegionMeta) -> Option<KeyRange> {
        let start = if range.start >= meta.start_key {
            range.start.clone()
        } else {
            meta.start_key.clone()
        };
        let end = match (range.end.is_empty(), meta.end_key.is_empty()) {
            (true, true) => Bytes::new(),
            (true, false) => meta.end_key.clone(),
            (false, true) => range.end.clone(),
            (false, false) => {
                if range.end <= meta.end_key {
                    range.end.clone()
                } else {
                    meta.end_key.clone()
                }
            }
        };
        let clipped = KeyRange::new(start, end);
        (!clipped.is_empty()).then_some(clipped)
    }
}

#[async_trait]
impl RegionCache for MockRegionCache {
    async fn split_key_ranges(
        &self,
        _bo: &mut Backoff,
        ranges: &[KeyRange],
    ) -> Result<Vec<RegionRanges>, CacheError> {
        let mut out = Vec::new();
        for region in &self.regions {
            let pieces: Vec<KeyRange> = ranges
                .iter()
                .filter_map(|range| Self::clip(range, &region.meta))
                .collect();
            if !pieces.is_empty() {
                out.push(RegionRanges {
                    region: RegionVerId::new(region.meta.id, region.meta.epoch),
                    ranges: pieces,
                });
            }
        }
        Ok(out)
    }

    async fn rpc_context(
        &self,
        _bo: &mut Backoff,
        region: &RegionVerId,
        _replica: ReplicaKind,
        _leader_only: bool,
    ) -> Result<Option<RpcContext>, CacheError> {
        {
            let mut misses = self.misses.lock().expect("mock state poisoned");
            if let Some(left) = misses.get_mut(&region.id) {
                if *left > 0 {
                    *left -= 1;
                    return Ok(None);
                }
            }
        }
        let Some(found) = self.lookup(region) else {
            return Ok(None);
        };
        let Some(home) = found.stores.first() else {
            return Ok(None);
        };
        Ok(Some(RpcContext {
            region: *region,
            meta: found.meta.clone(),
            store: home.clone(),
        }))
    }

    fn all_replica_stores(
        &self,
        region: &RegionVerId,
        _replica: ReplicaKind,
        primary: &Store,
    ) -> Vec<StoreId> {
        let Some(found) = self.lookup(region) else {
            return vec![primary.id];
        };
        let mut stores = vec![primary.id];
        stores.extend(
            found
                .stores
                .iter()
                .map(|store| store.id)
                .filter(|id| *id != primary.id),
        );
        stores
    }

    fn check_visibility(&self, read_ts: u64) -> Result<(), CacheError> {
        if read_ts < self.safe_point {
            return Err(CacheError::SnapshotLost {
                read_ts,
                safe_point: self.safe_point,
            });
        }
        Ok(())
    }
}

/// What the mock node does with one send.
#[derive(Clone, Debug)]
pub enum MockOutcome {
    /// Store-level failure, the batch must be replanned.
    RetryBatch,
    /// Stream these fragments, then end of stream.
    Fragments(Vec<Fragment>),
    /// Stream these fragments, then keep failing recv with the error.
    FragmentsThenError(Vec<Fragment>, TransportError),
    /// Deliver one fragment, then block until the request is cancelled.
    FirstThenHang(Fragment),
}

/// Record of one send for later assertions.
#[derive(Clone, Debug)]
pub struct SentBatch {
    pub store_addr: String,
    pub region_ids: Vec<RegionId>,
}

/// RPC sender answering from per-store scripts. Stores without a script echo
/// one fragment of the form `addr|id,id,...` and end the stream.
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<HashMap<String, VecDeque<MockOutcome>>>,
    sent: Mutex<Vec<SentBatch>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, store_addr: &str, outcome: MockOutcome) -> Self {
        self.scripts
            .lock()
            .expect("mock state poisoned")
            .entry(store_addr.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn sent(&self) -> Vec<SentBatch> {
        self.sent.lock().expect("mock state poisoned").clone()
    }

    fn echo_fragment(store_addr: &str, region_ids: &[RegionId]) -> Fragment {
        let ids: Vec<String> = region_ids.iter().map(|id| id.to_string()).collect();
        Fragment {
            data: Bytes::from(format!("{store_addr}|{}", ids.join(","))),
            other_error: String::new(),
        }
    }
}

pub fn fragment(data: &str) -> Fragment {
    Fragment {
        data: Bytes::from(data.to_string()),
        other_error: String::new(),
    }
}

pub fn error_fragment(message: &str) -> Fragment {
    Fragment {
        data: Bytes::new(),
        other_error: message.to_string(),
    }
}

#[async_trait]
impl CoprTransport for MockTransport {
    async fn send(
        &self,
        _bo: &mut Backoff,
        ctx: &RpcContext,
        req: BatchCopRequest,
        _timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<SendOutcome, TransportError> {
        let region_ids: Vec<RegionId> = req.regions.iter().map(|slice| slice.region_id).collect();
        self.sent
            .lock()
            .expect("mock state poisoned")
            .push(SentBatch {
                store_addr: ctx.store.addr.clone(),
                region_ids: region_ids.clone(),
            });

        let outcome = self
            .scripts
            .lock()
            .expect("mock state poisoned")
            .get_mut(&ctx.store.addr)
            .and_then(|queue| queue.pop_front());

        let stream = match outcome {
            Some(MockOutcome::RetryBatch) => return Ok(SendOutcome::RetryBatch),
            Some(MockOutcome::Fragments(fragments)) => split_stream(fragments, None, None),
            Some(MockOutcome::FragmentsThenError(fragments, err)) => {
                split_stream(fragments, Some(err), None)
            }
            Some(MockOutcome::FirstThenHang(first)) => {
                split_stream(vec![first], None, Some(cancel))
            }
            None => split_stream(
                vec![Self::echo_fragment(&ctx.store.addr, &region_ids)],
                None,
                None,
            ),
        };
        Ok(SendOutcome::Stream(stream))
    }
}

fn split_stream(
    fragments: Vec<Fragment>,
    trailing: Option<TransportError>,
    hang: Option<CancellationToken>,
) -> BatchStream {
    let mut queue = VecDeque::from(fragments);
    let first = queue.pop_front();
    BatchStream {
        first,
        rest: Box::new(MockStream {
            fragments: queue,
            trailing,
            hang,
        }),
    }
}

struct MockStream {
    fragments: VecDeque<Fragment>,
    trailing: Option<TransportError>,
    hang: Option<CancellationToken>,
}

#[async_trait]
impl FragmentStream for MockStream {
    async fn recv(&mut self) -> Result<Option<Fragment>, TransportError> {
        if let Some(fragment) = self.fragments.pop_front() {
            return Ok(Some(fragment));
        }
        if let Some(cancel) = &self.hang {
            cancel.cancelled().await;
            return Err(TransportError::Cancelled);
        }
        match &self.trailing {
            // The broken stream stays broken on every retry.
            Some(err) => Err(err.clone()),
            None => Ok(None),
        }
    }
}
