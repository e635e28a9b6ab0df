use bytes::Bytes;
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backoff::{Backoff, BackoffReason};
use crate::error::CoprError;
use crate::request::MemoryQuota;
use crate::transport::Fragment;

/// Retry-latency attribution carried by every response record, snapshotted
/// from the producing worker's backoff ledger.
#[derive(Clone, Debug, Default)]
pub struct CopRuntimeStats {
    pub backoff_total: Duration,
    pub backoff_sleep: IndexMap<BackoffReason, Duration>,
    pub backoff_times: IndexMap<BackoffReason, u32>,
    pub callee_addr: String,
}

impl CopRuntimeStats {
    pub(crate) fn snapshot(bo: &Backoff, callee_addr: &str) -> Self {
        let mut backoff_sleep = IndexMap::new();
        let mut backoff_times = IndexMap::new();
        for (reason, slept, times) in bo.reasons() {
            backoff_sleep.insert(reason, slept);
            backoff_times.insert(reason, times);
        }
        Self {
            backoff_total: bo.total_sleep(),
            backoff_sleep,
            backoff_times,
            callee_addr: callee_addr.to_string(),
        }
    }
}

/// One response fragment as delivered to the caller, or the terminal error
/// of the batch that produced it.
#[derive(Debug)]
pub struct BatchCopResponse {
    data: Bytes,
    error: Option<CoprError>,
    /// Always empty in batch mode: fragments carry no resume position.
    start_key: Bytes,
    elapsed: Duration,
    stats: CopRuntimeStats,
    mem_size: OnceCell<usize>,
}

impl BatchCopResponse {
    pub(crate) fn from_data(data: Bytes, elapsed: Duration, stats: CopRuntimeStats) -> Self {
        Self {
            data,
            error: None,
            start_key: Bytes::new(),
            elapsed,
            stats,
            mem_size: OnceCell::new(),
        }
    }

    pub(crate) fn from_error(error: CoprError, stats: CopRuntimeStats) -> Self {
        Self {
            data: Bytes::new(),
            error: Some(error),
            start_key: Bytes::new(),
            elapsed: Duration::ZERO,
            stats,
            mem_size: OnceCell::new(),
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn start_key(&self) -> &Bytes {
        &self.start_key
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn stats(&self) -> &CopRuntimeStats {
        &self.stats
    }

    pub(crate) fn take_error(&mut self) -> Option<CoprError> {
        self.error.take()
    }

    /// Bytes this record pins in memory. Memoized so repeated accounting
    /// queries stay O(1).
    pub fn mem_size(&self) -> usize {
        *self
            .mem_size
            .get_or_init(|| std::mem::size_of::<Self>() + self.data.len() + self.start_key.len())
    }
}

/// Translate one wire fragment into a response record, attributing the
/// worker's accumulated retry latency to it. A fragment-level error fails
/// the whole batch.
pub(crate) fn adapt_fragment(
    bo: &Backoff,
    addr: &str,
    start_ts: u64,
    fragment: Fragment,
    elapsed: Duration,
) -> Result<BatchCopResponse, CoprError> {
    if !fragment.other_error.is_empty() {
        warn!(
            start_ts,
            store = addr,
            error = %fragment.other_error,
            "storage node failed the batch",
        );
        return Err(CoprError::Server {
            addr: addr.to_string(),
            msg: fragment.other_error,
        });
    }
    Ok(BatchCopResponse::from_data(
        fragment.data,
        elapsed,
        CopRuntimeStats::snapshot(bo, addr),
    ))
}

/// Producer end of the response channel, shared shape for every worker.
#[derive(Clone)]
pub(crate) struct ResponseSink {
    tx: mpsc::Sender<BatchCopResponse>,
    finished: CancellationToken,
    quota: Option<Arc<dyn MemoryQuota>>,
}

impl ResponseSink {
    pub(crate) fn new(
        tx: mpsc::Sender<BatchCopResponse>,
        finished: CancellationToken,
        quota: Option<Arc<dyn MemoryQuota>>,
    ) -> Self {
        Self {
            tx,
            finished,
            quota,
        }
    }

    /// Enqueue one record, reporting its size to the quota hook first.
    ///
    /// Returns `false` when shutdown won the race; the worker must stop
    /// producing. The send suspends when the channel is full, which is the
    /// backpressure path from a slow reader.
    pub(crate) async fn deliver(&self, resp: BatchCopResponse) -> bool {
        if let Some(quota) = &self.quota {
            quota.consume(resp.mem_size());
        }
        tokio::select! {
            _ = self.finished.cancelled() => false,
            sent = self.tx.send(resp) => sent.is_ok(),
        }
    }
}
