use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tessera_common::{KeyRange, RegionEpoch, RegionId};
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::cache::RpcContext;
use crate::error::TransportError;
use crate::request::{IsolationLevel, RequestPriority};

/// Command dispatched to a storage node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    /// Streaming batch read served by columnar replicas.
    BatchRead,
}

/// One region's slice of a batch request on the wire. The epoch lets the
/// node reject the slice when its region snapshot moved on.
#[derive(Clone, Debug)]
pub struct RegionSlice {
    pub region_id: RegionId,
    pub epoch: RegionEpoch,
    pub ranges: Vec<KeyRange>,
}

/// Per-call fields mirrored into the RPC envelope.
#[derive(Clone, Debug)]
pub struct RequestHeader {
    pub isolation: IsolationLevel,
    pub priority: RequestPriority,
    pub not_fill_cache: bool,
    pub record_time_stat: bool,
    pub record_scan_stat: bool,
    pub task_id: u64,
}

/// Wire body of one batch coprocessor call.
#[derive(Clone, Debug)]
pub struct BatchCopRequest {
    pub kind: CommandKind,
    pub start_ts: u64,
    pub plan: Bytes,
    pub schema_ver: i64,
    pub regions: Vec<RegionSlice>,
    pub header: RequestHeader,
}

/// One streamed fragment of a batch response.
#[derive(Clone, Debug, Default)]
pub struct Fragment {
    pub data: Bytes,
    /// Non-empty when the node failed this batch as a whole.
    pub other_error: String,
}

/// Streaming receive handle. Dropping the handle tears the stream down, so
/// every exit path of a recv loop releases the wire channel.
#[async_trait]
pub trait FragmentStream: Send {
    /// Next fragment, `None` at end of stream.
    async fn recv(&mut self) -> Result<Option<Fragment>, TransportError>;
}

/// A successfully opened response stream. The transport delivers the first
/// fragment together with the call response; the rest arrive through
/// [`FragmentStream::recv`].
pub struct BatchStream {
    pub first: Option<Fragment>,
    pub rest: Box<dyn FragmentStream>,
}

/// Outcome of one batch send.
pub enum SendOutcome {
    /// Store-level failure. The region assignment behind the batch is
    /// suspect, so the whole batch must be rebuilt and resent.
    RetryBatch,
    /// The call went through and the node is streaming fragments back.
    Stream(BatchStream),
}

/// Low-level RPC sender for batch coprocessor calls.
#[async_trait]
pub trait CoprTransport: Send + Sync {
    /// Send one batch call to the replica in `ctx`.
    ///
    /// `cancel` is the request-wide broadcast token; implementations
    /// register the in-flight call against it and surface
    /// [`TransportError::Cancelled`] from the send or from `recv` once it
    /// fires.
    async fn send(
        &self,
        bo: &mut Backoff,
        ctx: &RpcContext,
        req: BatchCopRequest,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<SendOutcome, TransportError>;
}
