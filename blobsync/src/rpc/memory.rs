//! In-process transport pairing two extensions directly.

use std::sync::Arc;

use blobsync_base::{BlobChunk, WantList};
use n0_future::boxed::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{BlobSyncService, ClosedSnafu, RpcError};
use crate::BlobSyncExtension;

/// Connects two extensions so that calls made by one are handled by the other.
///
/// Both extensions are opened. The returned [`MemoryConnection`] closes the pair.
pub async fn connect(a: &BlobSyncExtension, b: &BlobSyncExtension) -> MemoryConnection {
    let closed = CancellationToken::new();
    let to_b = Arc::new(MemoryPeer {
        target: b.clone(),
        closed: closed.clone(),
    });
    let to_a = Arc::new(MemoryPeer {
        target: a.clone(),
        closed: closed.clone(),
    });
    debug!(a = %a.id(), b = %b.id(), "connecting in memory");
    // Both sides accept calls before either announces its want list.
    let opened_a = a.activate(to_b);
    let opened_b = b.activate(to_a);
    if opened_a {
        a.announce().await;
    }
    if opened_b {
        b.announce().await;
    }
    MemoryConnection {
        a: a.clone(),
        b: b.clone(),
        closed,
    }
}

/// A pair of extensions connected by [`connect`].
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    a: BlobSyncExtension,
    b: BlobSyncExtension,
    closed: CancellationToken,
}

impl MemoryConnection {
    /// Closes the connection. Further calls in either direction fail with [`RpcError::Closed`].
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.a.on_close();
        self.b.on_close();
    }

    /// Whether [`Self::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[derive(Debug)]
struct MemoryPeer {
    target: BlobSyncExtension,
    closed: CancellationToken,
}

impl BlobSyncService for MemoryPeer {
    fn want(&self, list: WantList) -> BoxFuture<Result<(), RpcError>> {
        if self.closed.is_cancelled() {
            return Box::pin(async { Err(ClosedSnafu.build()) });
        }
        self.target.want(list)
    }

    fn push(&self, chunk: BlobChunk) -> BoxFuture<Result<(), RpcError>> {
        if self.closed.is_cancelled() {
            return Box::pin(async { Err(ClosedSnafu.build()) });
        }
        self.target.push(chunk)
    }
}
