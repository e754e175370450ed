//! Coordinates a [`BlobStore`] with the extensions of all connected peers.

use std::{
    collections::BTreeMap,
    future::IntoFuture,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use blobsync_base::{BlobChunk, BlobId, WantList, WantListEntry};
use n0_future::boxed::BoxFuture;
use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, trace, warn};

use crate::{
    Config,
    config::ConfigError,
    extension::{BlobSyncExtension, ExtensionEvents, ExtensionId},
    store::{BlobStore, StoreError},
};

/// Errors of a [`Download`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum DownloadError {
    /// The context passed to [`BlobSync::download`] was cancelled.
    #[snafu(display("download cancelled"))]
    Cancelled {},
    /// The [`BlobSync`] was closed.
    #[snafu(display("blob sync closed"))]
    Closed {},
    #[snafu(transparent)]
    Store { source: StoreError },
}

/// Errors of [`BlobSync::open`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum OpenError {
    #[snafu(transparent)]
    Config { source: ConfigError },
    #[snafu(transparent)]
    Store { source: StoreError },
}

/// Replicates blobs between the local [`BlobStore`] and connected peers.
///
/// Downloads are registered with [`BlobSync::download`]. The set of pending downloads forms
/// the want list, which is sent to every peer. Chunks pushed by peers are written to the store.
/// In the other direction, every extension uploads the chunks its peer wants.
///
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct BlobSync {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    store: BlobStore,
    config: Config,
    /// Pending downloads by blob.
    requests: tokio::sync::Mutex<BTreeMap<BlobId, DownloadRequest>>,
    /// Active extensions.
    extensions: Mutex<BTreeMap<ExtensionId, BlobSyncExtension>>,
    next_extension_id: AtomicU64,
    next_request_key: AtomicU64,
    shutdown: CancellationToken,
}

#[derive(Debug)]
struct DownloadRequest {
    /// Distinguishes a request from a later one for the same blob.
    key: u64,
    refcount: usize,
    trigger: watch::Sender<Status>,
    want: WantListEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Complete,
    Closed,
}

impl BlobSync {
    /// Opens a sync for `store`.
    ///
    /// Blobs written through [`BlobSync::store`] are split into chunks of
    /// [`Config::default_chunk_size`]. Fails if `config` is invalid or the stored metadata
    /// cannot be read.
    pub async fn open(store: BlobStore, config: Config) -> Result<Self, OpenError> {
        config.validate()?;
        let store = store.with_default_chunk_size(config.default_chunk_size);
        let blobs = store.list().await?;
        debug!(blobs = blobs.len(), chunk_size = config.default_chunk_size, "opened blob sync");
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                config,
                requests: Default::default(),
                extensions: Default::default(),
                next_extension_id: AtomicU64::new(0),
                next_request_key: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Closes all extensions and fails pending downloads with [`DownloadError::Closed`].
    pub async fn close(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        let extensions = std::mem::take(&mut *self.inner.extensions());
        for ext in extensions.into_values() {
            ext.on_close();
        }
        let requests = std::mem::take(&mut *self.inner.requests.lock().await);
        for request in requests.into_values() {
            request.trigger.send_replace(Status::Closed);
        }
        debug!("closed blob sync");
    }

    /// The underlying store.
    pub fn store(&self) -> &BlobStore {
        &self.inner.store
    }

    /// The configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Creates the extension for a new connection.
    ///
    /// The extension joins the sync once the transport opens it.
    pub fn create_extension(&self) -> BlobSyncExtension {
        let id = ExtensionId(self.inner.next_extension_id.fetch_add(1, Ordering::Relaxed));
        let events = Arc::downgrade(&self.inner) as Weak<dyn ExtensionEvents>;
        BlobSyncExtension::new(
            id,
            self.inner.store.clone(),
            self.inner.config.clone(),
            events,
            self.inner.shutdown.child_token(),
        )
    }

    /// Requests blob `id` from connected peers.
    ///
    /// Concurrent downloads of the same blob share one request. The request is withdrawn
    /// once the contexts of all its downloads are cancelled. A blob already complete locally
    /// resolves right away.
    pub async fn download(
        &self,
        ctx: CancellationToken,
        id: BlobId,
    ) -> Result<Download, DownloadError> {
        let mut requests = self.inner.requests.lock().await;
        snafu::ensure!(!self.inner.shutdown.is_cancelled(), ClosedSnafu);
        let (key, status) = match requests.get_mut(&id) {
            Some(request) => {
                request.refcount += 1;
                trace!(id = %id.fmt_short(), refcount = request.refcount, "joined download");
                (request.key, request.trigger.subscribe())
            }
            None => {
                let meta = self.inner.store.get_meta(id).await?;
                let want = match &meta {
                    Some(meta) if meta.is_complete() => {
                        trace!(id = %id.fmt_short(), "already present");
                        return Ok(Download {
                            status: None,
                            ctx,
                        });
                    }
                    Some(meta) => WantListEntry::missing(meta),
                    None => WantListEntry::everything(id),
                };
                let key = self.inner.next_request_key.fetch_add(1, Ordering::Relaxed);
                let (trigger, status) = watch::channel(Status::Pending);
                requests.insert(
                    id,
                    DownloadRequest {
                        key,
                        refcount: 1,
                        trigger,
                        want,
                    },
                );
                debug!(id = %id.fmt_short(), "requested download");
                self.inner.broadcast(&requests);
                (key, status)
            }
        };
        drop(requests);

        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let mut done = status.clone();
        let hook_ctx = ctx.clone();
        tokio::task::spawn(
            async move {
                tokio::select! {
                    biased;
                    _ = async { done.wait_for(|s| *s != Status::Pending).await.map(|_| ()) } => {}
                    _ = shutdown.cancelled() => {}
                    _ = hook_ctx.cancelled() => {
                        if let Some(inner) = weak.upgrade() {
                            inner.release(id, key).await;
                        }
                    }
                }
            }
            .instrument(error_span!("download", id = %id.fmt_short())),
        );

        Ok(Download {
            status: Some(status),
            ctx,
        })
    }

    /// Announces that blob `id` was added to the store, so that peers wanting it are served.
    pub fn notify_blob_added(&self, id: BlobId) {
        trace!(id = %id.fmt_short(), "blob added");
        self.inner.reconcile_all();
    }

    /// The want list currently sent to peers, sorted by blob id.
    pub async fn want_list(&self) -> WantList {
        Inner::want_list_of(&*self.inner.requests.lock().await)
    }

    /// Number of connected extensions.
    pub fn extension_count(&self) -> usize {
        self.inner.extensions().len()
    }
}

impl Inner {
    fn extensions(&self) -> std::sync::MutexGuard<'_, BTreeMap<ExtensionId, BlobSyncExtension>> {
        self.extensions.lock().expect("poisoned")
    }

    fn want_list_of(requests: &BTreeMap<BlobId, DownloadRequest>) -> WantList {
        WantList {
            blobs: requests.values().map(|r| r.want.clone()).collect(),
        }
    }

    /// Sends the want list derived from `requests` to every extension.
    fn broadcast(&self, requests: &BTreeMap<BlobId, DownloadRequest>) {
        let list = Self::want_list_of(requests);
        for ext in self.extensions().values() {
            ext.update_want_list(list.clone());
        }
    }

    fn reconcile_all(&self) {
        for ext in self.extensions().values() {
            ext.reconcile_uploads();
        }
    }

    /// Drops one reference to the request `key` for `id`.
    async fn release(&self, id: BlobId, key: u64) {
        let mut requests = self.requests.lock().await;
        let Some(request) = requests.get_mut(&id) else {
            return;
        };
        if request.key != key {
            return;
        }
        request.refcount -= 1;
        if request.refcount == 0 {
            requests.remove(&id);
            debug!(id = %id.fmt_short(), "withdrew download");
            self.broadcast(&requests);
        }
    }

    /// Stores a pushed chunk of a requested blob.
    ///
    /// A failed write is returned, the peer then offers the chunk again later.
    async fn handle_push(&self, chunk: BlobChunk) -> Result<(), StoreError> {
        let id = chunk.id;
        let mut requests = self.requests.lock().await;
        if !requests.contains_key(&id) {
            trace!(id = %id.fmt_short(), "ignoring unrequested chunk");
            return Ok(());
        }
        let meta = self.store.set_chunk(chunk).await.inspect_err(|err| {
            warn!(id = %id.fmt_short(), "failed to store chunk: {err:#}");
        })?;
        if meta.is_complete() {
            if let Some(request) = requests.remove(&id) {
                debug!(id = %id.fmt_short(), "download complete");
                request.trigger.send_replace(Status::Complete);
            }
        } else if let Some(request) = requests.get_mut(&id) {
            request.want = WantListEntry::missing(&meta);
        }
        self.broadcast(&requests);
        drop(requests);
        self.reconcile_all();
        Ok(())
    }
}

impl ExtensionEvents for Inner {
    fn on_open(self: Arc<Self>, ext: BlobSyncExtension) -> BoxFuture<()> {
        Box::pin(async move {
            if self.shutdown.is_cancelled() {
                ext.on_close();
                return;
            }
            self.extensions().insert(ext.id(), ext.clone());
            let requests = self.requests.lock().await;
            ext.update_want_list(Self::want_list_of(&requests));
        })
    }

    fn on_close(&self, ext: &BlobSyncExtension) {
        if self.extensions().remove(&ext.id()).is_some() {
            debug!(ext = %ext.id(), "extension removed");
        }
    }

    fn on_push(self: Arc<Self>, chunk: BlobChunk) -> BoxFuture<Result<(), StoreError>> {
        Box::pin(async move { self.handle_push(chunk).await })
    }
}

/// A pending download, see [`BlobSync::download`].
///
/// Resolves through [`Download::wait`] or by awaiting it directly.
#[derive(Debug)]
pub struct Download {
    /// `None` if the blob was complete when the download was requested.
    status: Option<watch::Receiver<Status>>,
    ctx: CancellationToken,
}

impl Download {
    /// Waits until the blob is complete in the local store.
    pub async fn wait(self) -> Result<(), DownloadError> {
        let Some(mut status) = self.status else {
            return Ok(());
        };
        let res = tokio::select! {
            biased;
            res = async { status.wait_for(|s| *s != Status::Pending).await.map(|s| *s) } => res,
            _ = self.ctx.cancelled() => return CancelledSnafu.fail(),
        };
        match res {
            Ok(Status::Complete) => Ok(()),
            Ok(Status::Pending) | Ok(Status::Closed) | Err(_) => ClosedSnafu.fail(),
        }
    }
}

impl IntoFuture for Download {
    type Output = Result<(), DownloadError>;
    type IntoFuture = BoxFuture<Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}
