//! The per-connection RPC surface of the sync protocol.
//!
//! The protocol is symmetric: both ends of a connection can send a [`WantList`] and push
//! [`BlobChunk`]s. [`BlobSyncService`] models one direction. A transport hands each
//! [`BlobSyncExtension`] an implementation that reaches the remote peer, and delivers
//! incoming calls to the extension, which implements the trait itself.
//!
//! Two transports are provided: [`memory`] connects two extensions in the same process,
//! [`stream`] runs the protocol over any byte stream.
//!
//! [`BlobSyncExtension`]: crate::BlobSyncExtension

use std::{future::Future, io, sync::Arc, time::Duration};

use blobsync_base::{BlobChunk, WantList};
use n0_future::boxed::BoxFuture;
use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};

pub mod memory;
pub mod stream;

/// One direction of the sync protocol.
pub trait BlobSyncService: Send + Sync + std::fmt::Debug + 'static {
    /// Replaces the want list the receiver keeps for the sender.
    fn want(&self, list: WantList) -> BoxFuture<Result<(), RpcError>>;

    /// Delivers a chunk the receiver asked for.
    fn push(&self, chunk: BlobChunk) -> BoxFuture<Result<(), RpcError>>;
}

impl<T: BlobSyncService> BlobSyncService for Arc<T> {
    fn want(&self, list: WantList) -> BoxFuture<Result<(), RpcError>> {
        self.as_ref().want(list)
    }

    fn push(&self, chunk: BlobChunk) -> BoxFuture<Result<(), RpcError>> {
        self.as_ref().push(chunk)
    }
}

/// Errors of RPC calls.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum RpcError {
    /// The connection is closed. Expected while tearing down.
    #[snafu(display("rpc channel closed"))]
    Closed {},
    #[snafu(display("rpc timed out after {timeout:?}"))]
    Timeout { timeout: Duration },
    /// The remote handler failed.
    #[snafu(display("remote error: {message}"))]
    Remote { message: String },
    #[snafu(display("transport io failed"))]
    Io { source: io::Error },
    #[snafu(display("failed to encode frame"))]
    Encode { source: postcard::Error },
    #[snafu(display("failed to decode frame"))]
    Decode { source: postcard::Error },
    #[snafu(display("frame of {len} bytes exceeds the maximum frame size"))]
    FrameTooLarge { len: usize },
}

impl RpcError {
    /// Whether this error only reports that the connection went away.
    pub fn is_closed(&self) -> bool {
        matches!(self, RpcError::Closed { .. })
    }
}

/// Runs an RPC call, failing with [`RpcError::Timeout`] if it takes longer than `timeout`.
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, RpcError>>,
) -> Result<T, RpcError> {
    match n0_future::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(TimeoutSnafu { timeout }.build()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timeout_maps_to_rpc_error() {
        let res: Result<(), RpcError> = with_timeout(Duration::from_secs(20), async {
            n0_future::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(RpcError::Timeout { .. })));

        let res = with_timeout(Duration::from_secs(20), async { Ok(7) }).await;
        assert_eq!(res.unwrap(), 7);
        assert!(ClosedSnafu.build().is_closed());
    }
}
