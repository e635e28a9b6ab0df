use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backoff::{Backoff, BackoffReason};
use crate::cache::RegionCache;
use crate::config::CoprConfig;
use crate::error::CoprError;
use crate::request::BatchReadRequest;
use crate::response::{BatchCopResponse, CopRuntimeStats, ResponseSink, adapt_fragment};
use crate::tasks::{BatchTask, build_batch_tasks};
use crate::transport::{
    BatchCopRequest, BatchStream, CoprTransport, RegionSlice, RequestHeader, SendOutcome,
};

/// One spawned task per batch.
///
/// The worker owns its batch, streams the node's fragments into the response
/// channel, and replans itself through the task builder when the node asks
/// for a whole-batch retry. Any terminal failure becomes one error record on
/// the channel and ends the worker.
pub(crate) struct BatchWorker {
    pub(crate) cache: Arc<dyn RegionCache>,
    pub(crate) transport: Arc<dyn CoprTransport>,
    pub(crate) config: CoprConfig,
    pub(crate) req: Arc<BatchReadRequest>,
    pub(crate) sink: ResponseSink,
    pub(crate) rpc_cancel: CancellationToken,
}

impl BatchWorker {
    pub(crate) async fn run(self, task: BatchTask) {
        let mut bo = Backoff::new(self.config.next_backoff());
        let mut pending = VecDeque::from([task]);
        while let Some(task) = pending.pop_front() {
            match self.handle_task_once(&mut bo, &task).await {
                Ok(follow_ups) => pending.extend(follow_ups),
                Err(err) => {
                    let stats = CopRuntimeStats::snapshot(&bo, &task.store_addr);
                    self.sink
                        .deliver(BatchCopResponse::from_error(err, stats))
                        .await;
                    break;
                }
            }
        }
    }

    /// One RPC round trip. An empty result means the batch completed; a
    /// non-empty result is the replanned replacement after a store-level
    /// failure.
    async fn handle_task_once(
        &self,
        bo: &mut Backoff,
        task: &BatchTask,
    ) -> Result<Vec<BatchTask>, CoprError> {
        let regions: Vec<RegionSlice> = task
            .regions
            .iter()
            .map(|info| RegionSlice {
                region_id: info.region.id,
                epoch: info.region.epoch(),
                ranges: info.ranges.clone(),
            })
            .collect();
        let wire = BatchCopRequest {
            kind: task.kind,
            start_ts: self.req.start_ts,
            plan: self.req.plan.clone(),
            schema_ver: self.req.schema_ver,
            regions,
            header: RequestHeader {
                isolation: self.req.isolation,
                priority: self.req.priority,
                not_fill_cache: self.req.not_fill_cache,
                record_time_stat: true,
                record_scan_stat: true,
                task_id: self.req.task_id,
            },
        };

        debug!(
            store = %task.store_addr,
            region_count = task.regions.len(),
            "sending batch coprocessor request",
        );
        let started = Instant::now();
        match self
            .transport
            .send(
                bo,
                &task.ctx,
                wire,
                self.config.read_timeout(),
                self.rpc_cancel.clone(),
            )
            .await?
        {
            SendOutcome::RetryBatch => self.replan_task(task).await,
            SendOutcome::Stream(stream) => {
                self.drain_stream(bo, task, stream, started).await?;
                Ok(Vec::new())
            }
        }
    }

    /// Merge the batch's ranges and plan them again against the current
    /// region map. Region boundaries may have moved, so the replacement can
    /// be any number of tasks.
    ///
    /// The rebuild is a task-construction pass and paces its region-miss
    /// retries on a fresh build budget; the worker's own budget only ever
    /// paces stream recv failures.
    async fn replan_task(&self, task: &BatchTask) -> Result<Vec<BatchTask>, CoprError> {
        info!(store = %task.store_addr, "store-level error, replanning batch");
        let mut build_bo = Backoff::new(self.config.build_backoff());
        let ranges = task.all_ranges();
        build_batch_tasks(&mut build_bo, self.cache.as_ref(), &ranges, self.req.replica).await
    }

    /// Pump fragments into the response channel until end of stream. Recv
    /// failures are paced by the RPC backoff and the budget is the point of
    /// no return.
    async fn drain_stream(
        &self,
        bo: &mut Backoff,
        task: &BatchTask,
        stream: BatchStream,
        started: Instant,
    ) -> Result<(), CoprError> {
        let BatchStream { first, mut rest } = stream;
        // A stream that ends before its first fragment is a complete, empty
        // response.
        let mut fragment = first;
        while let Some(current) = fragment.take() {
            let resp = adapt_fragment(
                bo,
                &task.store_addr,
                self.req.start_ts,
                current,
                started.elapsed(),
            )?;
            if !self.sink.deliver(resp).await {
                // Shutdown won the race; nothing left to report.
                return Ok(());
            }
            fragment = loop {
                match rest.recv().await {
                    // Some(next) keeps streaming, None is end of stream.
                    Ok(next) => break next,
                    Err(err) => {
                        if err.is_cancelled() {
                            info!(store = %task.store_addr, %err, "batch stream recv timed out");
                        } else {
                            info!(store = %task.store_addr, %err, "batch stream recv failed");
                        }
                        // A dead stream keeps failing and lands back here
                        // until the budget runs out.
                        if bo.backoff(BackoffReason::Rpc, &err).await.is_err() {
                            return Err(CoprError::ColumnarServerTimeout);
                        }
                    }
                }
            };
        }
        Ok(())
    }
}
