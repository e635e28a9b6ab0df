use thiserror::Error;
use tokio::sync::mpsc::error::SendError;

use crate::backoff::BackoffReason;

#[derive(Debug, Error)]
pub enum CoprError {
    #[error("batch coprocessor cannot provide keep-order or desc properties")]
    OrderedReadUnsupported,
    #[error("query interrupted by caller")]
    QueryInterrupted,
    #[error("columnar store timeout")]
    ColumnarServerTimeout,
    #[error("coprocessor error from {addr}: {msg}")]
    Server { addr: String, msg: String },
    #[error(transparent)]
    Backoff(#[from] BackoffError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Send(String),
}

impl<T> From<SendError<T>> for CoprError {
    fn from(value: SendError<T>) -> Self {
        Self::Send(value.to_string())
    }
}

/// The per-request retry budget ran out before the retried operation
/// recovered.
#[derive(Debug, Error)]
#[error("backoff budget of {budget_ms} ms exhausted retrying {reason}: {cause}")]
pub struct BackoffError {
    pub reason: BackoffReason,
    pub budget_ms: u64,
    pub cause: String,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("region map unavailable: {0}")]
    Unavailable(String),
    #[error("snapshot at ts {read_ts} is no longer readable, GC safe point is {safe_point}")]
    SnapshotLost { read_ts: u64, safe_point: u64 },
}

#[derive(Clone, Debug, Error)]
pub enum TransportError {
    #[error("rpc cancelled")]
    Cancelled,
    #[error("connection to {addr} failed: {msg}")]
    Connection { addr: String, msg: String },
    #[error("stream recv: {0}")]
    Recv(String),
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}
