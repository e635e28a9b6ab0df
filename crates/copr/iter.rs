use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::backoff::Backoff;
use crate::cache::RegionCache;
use crate::config::CoprConfig;
use crate::error::CoprError;
use crate::request::{BatchReadRequest, MemoryQuota, QueryVars};
use crate::response::{BatchCopResponse, ResponseSink};
use crate::tasks::build_batch_tasks;
use crate::transport::CoprTransport;
use crate::worker::BatchWorker;

/// How often the drain re-checks the caller's kill flag. Killing is rare, so
/// a periodic poll beats one more wakeup channel on every drain iteration.
pub const KILL_CHECK_INTERVAL: Duration = Duration::from_secs(3);

/// Bound on undrained response records across all workers; a full channel
/// suspends the producers.
pub const RESPONSE_CHANNEL_CAPACITY: usize = 2048;

/// Dispatcher for batch coprocessor reads.
pub struct CoprClient {
    cache: Arc<dyn RegionCache>,
    transport: Arc<dyn CoprTransport>,
    config: CoprConfig,
}

impl CoprClient {
    pub fn new(
        cache: Arc<dyn RegionCache>,
        transport: Arc<dyn CoprTransport>,
        config: CoprConfig,
    ) -> Self {
        Self {
            cache,
            transport,
            config,
        }
    }

    /// Plan, balance and launch a batch read.
    ///
    /// The returned iterator is live immediately. Planning failures, like
    /// the up-front rejection of ordered requests, are delivered through its
    /// first [`BatchCopIterator::next`] call; no workers exist in that case.
    ///
    /// `caller` is the surrounding query's cancellation scope: when it fires
    /// during a drain, the iterator winds down cleanly.
    pub async fn send_batch(
        &self,
        req: BatchReadRequest,
        vars: QueryVars,
        quota: Option<Arc<dyn MemoryQuota>>,
        caller: CancellationToken,
    ) -> BatchCopIterator {
        if req.keep_order || req.desc {
            return BatchCopIterator::failed(
                CoprError::OrderedReadUnsupported,
                Arc::clone(&self.cache),
                req.start_ts,
                vars,
                caller,
            );
        }

        let mut bo = Backoff::new(self.config.build_backoff());
        let tasks =
            match build_batch_tasks(&mut bo, self.cache.as_ref(), &req.ranges, req.replica).await {
                Ok(tasks) => tasks,
                Err(err) => {
                    return BatchCopIterator::failed(
                        err,
                        Arc::clone(&self.cache),
                        req.start_ts,
                        vars,
                        caller,
                    );
                }
            };
        debug!(
            task_count = tasks.len(),
            range_count = req.ranges.len(),
            start_ts = req.start_ts,
            "dispatching batch read",
        );

        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let finished = CancellationToken::new();
        let rpc_cancel = CancellationToken::new();
        let workers = TaskTracker::new();
        let req = Arc::new(req);
        for task in tasks {
            let worker = BatchWorker {
                cache: Arc::clone(&self.cache),
                transport: Arc::clone(&self.transport),
                config: self.config.clone(),
                req: Arc::clone(&req),
                sink: ResponseSink::new(tx.clone(), finished.clone(), quota.clone()),
                rpc_cancel: rpc_cancel.clone(),
            };
            workers.spawn(worker.run(task));
        }
        workers.close();
        // Workers hold the only senders: the channel closes when the last
        // worker exits.
        drop(tx);

        BatchCopIterator {
            rx,
            finished,
            closed: AtomicBool::new(false),
            workers,
            rpc_cancel,
            vars,
            caller,
            cache: Arc::clone(&self.cache),
            start_ts: req.start_ts,
            pending_error: None,
        }
    }
}

/// Caller-facing drain over the response channel.
///
/// Records of one worker arrive in stream order; records of different
/// workers interleave arbitrarily. Keep polling [`next`](Self::next) until
/// it returns `Ok(None)`.
pub struct BatchCopIterator {
    rx: mpsc::Receiver<BatchCopResponse>,
    /// Shutdown signal observed by workers blocked on the response channel.
    finished: CancellationToken,
    /// Guards `finished` so racing closers cancel it exactly once.
    closed: AtomicBool,
    workers: TaskTracker,
    /// Broadcast to every in-flight RPC.
    rpc_cancel: CancellationToken,
    vars: QueryVars,
    caller: CancellationToken,
    cache: Arc<dyn RegionCache>,
    start_ts: u64,
    pending_error: Option<CoprError>,
}

impl BatchCopIterator {
    /// An iterator that was never dispatched: it surfaces `error` once and
    /// then behaves as exhausted. `close` stays a no-op.
    fn failed(
        error: CoprError,
        cache: Arc<dyn RegionCache>,
        start_ts: u64,
        vars: QueryVars,
        caller: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let workers = TaskTracker::new();
        workers.close();
        Self {
            rx,
            finished: CancellationToken::new(),
            closed: AtomicBool::new(false),
            workers,
            rpc_cancel: CancellationToken::new(),
            vars,
            caller,
            cache,
            start_ts,
            pending_error: Some(error),
        }
    }

    /// Next response record.
    ///
    /// `Ok(None)` is the clean end. A terminal record surfaces as `Err`; the
    /// caller decides whether to keep draining or [`close`](Self::close).
    pub async fn next(&mut self) -> Result<Option<BatchCopResponse>, CoprError> {
        if let Some(err) = self.pending_error.take() {
            return Err(err);
        }
        let mut kill_check = tokio::time::interval(KILL_CHECK_INTERVAL);
        loop {
            tokio::select! {
                resp = self.rx.recv() => {
                    let Some(mut resp) = resp else {
                        return Ok(None);
                    };
                    if let Some(err) = resp.take_error() {
                        return Err(err);
                    }
                    self.cache.check_visibility(self.start_ts)?;
                    return Ok(Some(resp));
                }
                _ = kill_check.tick() => {
                    if self.vars.killed.load(Ordering::SeqCst) {
                        return Err(CoprError::QueryInterrupted);
                    }
                }
                _ = self.finished.cancelled() => {
                    return Ok(None);
                }
                _ = self.caller.cancelled() => {
                    self.finish_once();
                    return Ok(None);
                }
            }
        }
    }

    /// Shut the request down: stop the workers, cancel their in-flight RPCs
    /// and wait for every one of them to exit. Idempotent, and safe to call
    /// before the drain is complete.
    pub async fn close(&mut self) -> Result<(), CoprError> {
        self.finish_once();
        self.rpc_cancel.cancel();
        self.workers.wait().await;
        Ok(())
    }

    /// Cancel `finished` exactly once, whichever of caller-cancel and close
    /// gets here first.
    fn finish_once(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.finished.cancel();
        }
    }
}
