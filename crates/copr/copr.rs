//! # tessera batch coprocessor client
//!
//! Client-side dispatcher for batch reads against the columnar replica tier
//! of a region-sharded store.
//!
//! A batch read names a set of key ranges. The dispatcher splits those ranges
//! at region boundaries through the [`RegionCache`], groups the resulting
//! per-region sub-requests into one [`BatchTask`] per storage node, spreads
//! regions across replica-equivalent nodes so no node is overloaded, and then
//! runs one worker per batch over a streaming RPC. Response fragments from
//! every worker funnel into a single bounded channel drained through
//! [`BatchCopIterator::next`].
//!
//! ## Key components
//!
//! - [`tasks`]: range splitting and per-store batch construction
//! - [`iter`]: the caller-facing iterator and worker lifecycle
//! - [`cache`] / [`transport`]: collaborator seams (region map, RPC sender)
//! - [`backoff`]: per-request retry pacing and latency attribution
//!
//! ## Ordering
//!
//! Fragments of one batch arrive in stream order; fragments of different
//! batches interleave arbitrarily. Requests that need ordered results are
//! rejected up front, since batch responses carry no per-region start key to
//! resume from.
//!
//! ## Usage
//!
//! ```ignore
//! use tessera_copr::{BatchReadRequest, CoprClient, QueryVars};
//!
//! let client = CoprClient::new(cache, transport, config);
//! let mut it = client
//!     .send_batch(request, QueryVars::default(), None, cancel_token)
//!     .await;
//! while let Some(resp) = it.next().await? {
//!     consume(resp.data());
//! }
//! it.close().await?;
//! ```

pub mod backoff;
mod balance;
pub mod cache;
pub mod config;
pub mod error;
pub mod iter;
pub mod request;
pub mod response;
pub mod tasks;
pub mod test_utils;
pub mod transport;
mod worker;

pub use backoff::{Backoff, BackoffReason};
pub use cache::{RegionCache, RegionRanges, RpcContext};
pub use config::CoprConfig;
pub use error::{BackoffError, CacheError, CoprError, TransportError};
pub use iter::{BatchCopIterator, CoprClient};
pub use request::{
    BatchReadRequest, IsolationLevel, MemoryQuota, QueryVars, RequestPriority,
};
pub use response::{BatchCopResponse, CopRuntimeStats};
pub use tasks::{BatchTask, RegionInfo};
pub use transport::{
    BatchCopRequest, BatchStream, CommandKind, CoprTransport, Fragment, FragmentStream,
    RegionSlice, RequestHeader, SendOutcome,
};
