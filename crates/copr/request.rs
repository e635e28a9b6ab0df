use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tessera_common::{KeyRange, ReplicaKind};

/// Read isolation applied by the storage nodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IsolationLevel {
    #[default]
    Snapshot,
    ReadCommitted,
}

/// Scheduling priority the storage nodes apply to the call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RequestPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// A batch analytical read over a set of key ranges.
#[derive(Clone, Debug)]
pub struct BatchReadRequest {
    /// Snapshot timestamp every region is read at.
    pub start_ts: u64,
    /// Opaque serialized execution plan evaluated by the storage nodes.
    pub plan: Bytes,
    pub schema_ver: i64,
    pub ranges: Vec<KeyRange>,
    pub replica: ReplicaKind,
    /// Batch mode has no per-region start key to resume from, so ordered
    /// delivery cannot be provided. Setting either flag fails the dispatch
    /// up front.
    pub keep_order: bool,
    pub desc: bool,
    pub isolation: IsolationLevel,
    pub priority: RequestPriority,
    pub not_fill_cache: bool,
    pub task_id: u64,
}

impl BatchReadRequest {
    pub fn new(start_ts: u64, plan: impl Into<Bytes>, ranges: Vec<KeyRange>) -> Self {
        Self {
            start_ts,
            plan: plan.into(),
            schema_ver: 0,
            ranges,
            replica: ReplicaKind::Columnar,
            keep_order: false,
            desc: false,
            isolation: IsolationLevel::default(),
            priority: RequestPriority::default(),
            not_fill_cache: false,
            task_id: 0,
        }
    }
}

/// Per-query mutable state shared between the session layer and the drain.
#[derive(Clone, Debug, Default)]
pub struct QueryVars {
    /// Set by the session layer to abort the query. The drain observes it on
    /// a periodic tick rather than wiring a wakeup into every worker.
    pub killed: Arc<AtomicBool>,
}

/// Passive admission-control hook. The response adapter reports the size of
/// every record it enqueues; the hook owner decides what to do about it.
pub trait MemoryQuota: Send + Sync {
    fn consume(&self, bytes: usize);
}
