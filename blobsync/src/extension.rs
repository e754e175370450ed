//! The per-connection half of the sync protocol.
//!
//! A [`BlobSyncExtension`] is created by [`BlobSync::create_extension`] for every connection
//! to a peer. It keeps the peer's want list, serves chunks the peer is missing from the local
//! [`BlobStore`], and forwards the local want list to the peer.
//!
//! Two background jobs drive the extension, both [`DeferredTask`]s:
//! - the *want sender* sends the latest local want list, at most once per
//!   [`Config::min_want_list_update_interval`]. Updates arriving in between coalesce.
//! - the *upload reconciler* picks chunks the peer wants and that are present locally, and
//!   pushes them while upload permits are free. Every finished push releases its permit and
//!   schedules the reconciler again, which drains the backlog.
//!
//! [`BlobSync::create_extension`]: crate::BlobSync::create_extension

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, Weak},
};

use blobsync_base::{Bitfield, BlobChunk, BlobId, WantList, WantListEntry};
use n0_future::{
    boxed::BoxFuture,
    time::{Instant, sleep},
};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, trace, warn};

use crate::{
    Config,
    rpc::{BlobSyncService, ClosedSnafu, RemoteSnafu, RpcError, with_timeout},
    store::{BlobStore, Range, StoreError},
    util::DeferredTask,
};

/// Identifies an extension within its [`BlobSync`](crate::BlobSync).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("ext-{_0}")]
pub struct ExtensionId(pub(crate) u64);

/// Lifecycle of a [`BlobSyncExtension`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionState {
    /// Created, waiting for the transport to open it.
    Opened,
    /// Connected to the peer.
    Active,
    /// The connection was closed cleanly.
    Closed,
    /// The connection failed.
    Aborted,
}

impl ExtensionState {
    fn is_terminal(&self) -> bool {
        matches!(self, ExtensionState::Closed | ExtensionState::Aborted)
    }
}

/// Callbacks from an extension into its owner.
pub(crate) trait ExtensionEvents: Send + Sync + 'static {
    /// The extension became active.
    fn on_open(self: Arc<Self>, ext: BlobSyncExtension) -> BoxFuture<()>;
    /// The extension reached a terminal state.
    fn on_close(&self, ext: &BlobSyncExtension);
    /// The peer pushed a chunk. An error is reported back to the peer.
    fn on_push(self: Arc<Self>, chunk: BlobChunk) -> BoxFuture<Result<(), StoreError>>;
}

/// Protocol handler for a single connection.
///
/// Cheap to clone. Incoming calls are delivered through the [`BlobSyncService`]
/// implementation.
#[derive(Debug, Clone)]
pub struct BlobSyncExtension {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
struct Inner {
    id: ExtensionId,
    store: BlobStore,
    config: Config,
    #[debug("ExtensionEvents")]
    events: Weak<dyn ExtensionEvents>,
    cancel: CancellationToken,
    want_sender: DeferredTask,
    reconciler: DeferredTask,
    uploads: Arc<Semaphore>,
    state: Mutex<State>,
}

#[derive(derive_more::Debug)]
struct State {
    lifecycle: ExtensionState,
    remote: Option<Arc<dyn BlobSyncService>>,
    local_want_list: WantList,
    remote_want_list: Vec<WantListEntry>,
    /// Chunks currently being pushed.
    in_flight: HashSet<(BlobId, u32)>,
    /// Chunks pushed since the peer's last want list.
    delivered: HashSet<(BlobId, u32)>,
    last_want_sent: Option<Instant>,
    #[debug("StdRng")]
    rng: StdRng,
}

impl BlobSyncExtension {
    pub(crate) fn new(
        id: ExtensionId,
        store: BlobStore,
        config: Config,
        events: Weak<dyn ExtensionEvents>,
        cancel: CancellationToken,
    ) -> Self {
        let rng = match config.shuffle_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(id.0)),
            None => StdRng::from_entropy(),
        };
        let inner = Arc::new_cyclic(|me: &Weak<Inner>| {
            let want_sender = DeferredTask::spawn(
                cancel.child_token(),
                error_span!("want-sender", ext = %id),
                {
                    let me = me.clone();
                    move || {
                        let me = me.clone();
                        async move {
                            if let Some(inner) = me.upgrade() {
                                inner.send_want_list().await;
                            }
                        }
                    }
                },
            );
            let reconciler = DeferredTask::spawn(
                cancel.child_token(),
                error_span!("reconcile-uploads", ext = %id),
                {
                    let me = me.clone();
                    move || {
                        let me = me.clone();
                        async move {
                            if let Some(inner) = me.upgrade() {
                                inner.reconcile_uploads().await;
                            }
                        }
                    }
                },
            );
            Inner {
                id,
                store,
                uploads: Arc::new(Semaphore::new(config.max_concurrent_uploads)),
                config,
                events,
                cancel,
                want_sender,
                reconciler,
                state: Mutex::new(State {
                    lifecycle: ExtensionState::Opened,
                    remote: None,
                    local_want_list: WantList::default(),
                    remote_want_list: Vec::new(),
                    in_flight: HashSet::new(),
                    delivered: HashSet::new(),
                    last_want_sent: None,
                    rng,
                }),
            }
        });
        Self { inner }
    }

    /// The id of this extension.
    pub fn id(&self) -> ExtensionId {
        self.inner.id
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ExtensionState {
        self.inner.state().lifecycle
    }

    /// The want list most recently received from the peer.
    pub fn remote_want_list(&self) -> WantList {
        WantList {
            blobs: self.inner.state().remote_want_list.clone(),
        }
    }

    /// Called by the transport once the connection is established.
    ///
    /// `remote` reaches the peer's extension. The owner sends its current want list right away.
    pub async fn on_open(&self, remote: Arc<dyn BlobSyncService>) {
        if self.activate(remote) {
            self.announce().await;
        }
    }

    /// Marks the extension active, returns false if it was not freshly opened.
    ///
    /// From here on calls from the peer are accepted.
    pub(crate) fn activate(&self, remote: Arc<dyn BlobSyncService>) -> bool {
        let mut state = self.inner.state();
        if state.lifecycle != ExtensionState::Opened {
            warn!(ext = %self.id(), state = ?state.lifecycle, "ignoring open");
            return false;
        }
        state.lifecycle = ExtensionState::Active;
        state.remote = Some(remote);
        debug!(ext = %self.id(), "opened");
        true
    }

    /// Hands an active extension to its owner, which sends the current want list.
    pub(crate) async fn announce(&self) {
        if let Some(events) = self.inner.events.upgrade() {
            events.on_open(self.clone()).await;
        }
    }

    /// Called by the transport when the connection was closed cleanly.
    pub fn on_close(&self) {
        self.terminate(ExtensionState::Closed);
    }

    /// Called by the transport when the connection failed.
    pub fn on_abort(&self, err: &RpcError) {
        debug!(ext = %self.id(), "aborted: {err:#}");
        self.terminate(ExtensionState::Aborted);
    }

    /// Sets the want list to send to the peer.
    ///
    /// The list is sent by the throttled want sender, only the latest list is sent.
    pub fn update_want_list(&self, list: WantList) {
        self.inner.state().local_want_list = list;
        self.inner.want_sender.schedule();
    }

    /// Schedules a pass of the upload reconciler.
    pub fn reconcile_uploads(&self) {
        self.inner.reconciler.schedule();
    }

    /// Collects up to `amount` chunks the peer wants and that are present locally.
    ///
    /// Blobs and chunks are visited in shuffled order, so that concurrent uploads to
    /// different peers spread over different chunks.
    pub(crate) async fn pick_blob_chunks(&self, amount: usize) -> Vec<BlobChunk> {
        self.inner.pick_blob_chunks(amount).await
    }

    fn terminate(&self, to: ExtensionState) {
        {
            let mut state = self.inner.state();
            if state.lifecycle.is_terminal() {
                return;
            }
            state.lifecycle = to;
            state.remote = None;
        }
        self.inner.want_sender.cancel();
        self.inner.reconciler.cancel();
        self.inner.cancel.cancel();
        debug!(ext = %self.id(), state = ?to, "closed");
        if let Some(events) = self.inner.events.upgrade() {
            events.on_close(self);
        }
    }
}

impl BlobSyncService for BlobSyncExtension {
    fn want(&self, list: WantList) -> BoxFuture<Result<(), RpcError>> {
        let res = {
            let mut state = self.inner.state();
            if state.lifecycle == ExtensionState::Active {
                trace!(ext = %self.id(), blobs = list.blobs.len(), "received want list");
                state.remote_want_list = list.blobs;
                state.delivered.clear();
                Ok(())
            } else {
                Err(ClosedSnafu.build())
            }
        };
        if res.is_ok() {
            self.inner.reconciler.schedule();
        }
        Box::pin(async move { res })
    }

    fn push(&self, chunk: BlobChunk) -> BoxFuture<Result<(), RpcError>> {
        let this = self.clone();
        Box::pin(async move {
            if this.state() != ExtensionState::Active {
                return Err(ClosedSnafu.build());
            }
            trace!(ext = %this.id(), id = %chunk.id.fmt_short(), offset = chunk.chunk_offset, "received chunk");
            let Some(events) = this.inner.events.upgrade() else {
                return Ok(());
            };
            events.on_push(chunk).await.map_err(|err| {
                RemoteSnafu {
                    message: format!("{err:#}"),
                }
                .build()
            })
        })
    }
}

impl Inner {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("poisoned")
    }

    fn remote(&self) -> Option<Arc<dyn BlobSyncService>> {
        let state = self.state();
        match state.lifecycle {
            ExtensionState::Active => state.remote.clone(),
            _ => None,
        }
    }

    async fn send_want_list(&self) {
        let last = self.state().last_want_sent;
        if let Some(last) = last {
            let elapsed = last.elapsed();
            let interval = self.config.min_want_list_update_interval;
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        let Some(remote) = self.remote() else {
            return;
        };
        let list = {
            let mut state = self.state();
            state.last_want_sent = Some(Instant::now());
            state.local_want_list.clone()
        };
        let blobs = list.blobs.len();
        match with_timeout(self.config.rpc_timeout, remote.want(list)).await {
            Ok(()) => trace!(blobs, "sent want list"),
            Err(err) if err.is_closed() => {
                // The peer may not have opened its side yet.
                if self.remote().is_some() {
                    trace!("peer not ready, resending want list");
                    self.want_sender.schedule();
                }
            }
            Err(err) => warn!("failed to send want list: {err:#}"),
        }
    }

    async fn reconcile_uploads(self: Arc<Self>) {
        let available = self.uploads.available_permits();
        if available == 0 {
            return;
        }
        let Some(remote) = self.remote() else {
            return;
        };
        let chunks = self.pick_blob_chunks(available).await;
        if chunks.is_empty() {
            return;
        }
        trace!(count = chunks.len(), "scheduling uploads");
        for chunk in chunks {
            let Ok(permit) = self.uploads.clone().try_acquire_owned() else {
                break;
            };
            let key = (chunk.id, chunk.chunk_index());
            self.state().in_flight.insert(key);
            let inner = self.clone();
            let remote = remote.clone();
            let span = error_span!("push", id = %chunk.id.fmt_short(), index = key.1);
            tokio::task::spawn(
                async move {
                    let res = with_timeout(inner.config.rpc_timeout, remote.push(chunk)).await;
                    let failed = {
                        let mut state = inner.state();
                        state.in_flight.remove(&key);
                        match res {
                            Ok(()) => {
                                trace!("pushed chunk");
                                state.delivered.insert(key);
                                false
                            }
                            Err(err) if err.is_closed() => false,
                            Err(err) => {
                                warn!("failed to push chunk: {err:#}");
                                true
                            }
                        }
                    };
                    if failed {
                        // The chunk stays undelivered and is picked again after a pause.
                        sleep(inner.config.min_want_list_update_interval).await;
                    }
                    drop(permit);
                    inner.reconciler.schedule();
                }
                .instrument(span),
            );
        }
    }

    async fn pick_blob_chunks(&self, amount: usize) -> Vec<BlobChunk> {
        let mut headers = {
            let mut state = self.state();
            let mut headers = state.remote_want_list.clone();
            headers.shuffle(&mut state.rng);
            headers
        };
        let mut out = Vec::new();
        for header in headers.drain(..) {
            if out.len() >= amount {
                break;
            }
            let meta = match self.store.get_meta(header.id).await {
                Ok(Some(meta)) => meta,
                Ok(None) => continue,
                Err(err) => {
                    warn!(id = %header.id.fmt_short(), "failed to load metadata: {err:#}");
                    continue;
                }
            };
            if header.chunk_size.is_some_and(|size| size != meta.chunk_size) {
                trace!(id = %header.id.fmt_short(), "chunk size mismatch");
                continue;
            }
            let request = match &header.bitfield {
                Some(bytes) => match Bitfield::from_bytes(meta.chunk_count(), bytes.to_vec()) {
                    Some(request) => request,
                    None => {
                        debug!(id = %header.id.fmt_short(), "bitfield length mismatch");
                        continue;
                    }
                },
                None => Bitfield::full(meta.chunk_count()),
            };
            let present = meta.bitfield.and(&request);
            let mut indexes = present.find_indexes();
            {
                let mut state = self.state();
                indexes.retain(|index| {
                    let key = (meta.id, *index);
                    !state.in_flight.contains(&key) && !state.delivered.contains(&key)
                });
                indexes.shuffle(&mut state.rng);
            }
            for index in indexes {
                if out.len() >= amount {
                    break;
                }
                let (offset, length) = meta.chunk_range(index);
                match self.store.get(meta.id, Some(Range::new(offset, length))).await {
                    Ok(payload) => out.push(BlobChunk {
                        id: meta.id,
                        total_length: meta.length,
                        chunk_size: meta.chunk_size,
                        chunk_offset: offset,
                        payload,
                    }),
                    Err(err) => {
                        warn!(id = %meta.id.fmt_short(), index, "failed to read chunk: {err:#}")
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use bytes::Bytes;
    use n0_snafu::{Result, ResultExt};
    use tracing_test::traced_test;

    use super::*;
    use crate::store::MemDirectory;

    /// Owner that ignores every event.
    struct NoEvents;

    impl ExtensionEvents for NoEvents {
        fn on_open(self: Arc<Self>, _ext: BlobSyncExtension) -> BoxFuture<()> {
            Box::pin(async {})
        }

        fn on_close(&self, _ext: &BlobSyncExtension) {}

        fn on_push(self: Arc<Self>, _chunk: BlobChunk) -> BoxFuture<Result<(), StoreError>> {
            Box::pin(async { Ok(()) })
        }
    }

    /// Remote end that records what it receives.
    #[derive(Debug, Default)]
    struct Recorder {
        wants: Mutex<Vec<WantList>>,
        pushes: Mutex<Vec<BlobChunk>>,
        delay: Duration,
        /// Number of want lists to refuse as if not opened yet.
        refused_wants: AtomicUsize,
        /// Number of pushes to fail.
        failed_pushes: AtomicUsize,
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    impl BlobSyncService for Recorder {
        fn want(&self, list: WantList) -> BoxFuture<Result<(), RpcError>> {
            if take_one(&self.refused_wants) {
                return Box::pin(async { Err(ClosedSnafu.build()) });
            }
            self.wants.lock().unwrap().push(list);
            Box::pin(async { Ok(()) })
        }

        fn push(&self, chunk: BlobChunk) -> BoxFuture<Result<(), RpcError>> {
            let fail = take_one(&self.failed_pushes);
            self.pushes.lock().unwrap().push(chunk);
            let delay = self.delay;
            Box::pin(async move {
                sleep(delay).await;
                if fail {
                    return Err(RemoteSnafu {
                        message: "disk full",
                    }
                    .build());
                }
                Ok(())
            })
        }
    }

    fn config() -> Config {
        Config {
            min_want_list_update_interval: Duration::from_millis(50),
            max_concurrent_uploads: 4,
            shuffle_seed: Some(7),
            ..Default::default()
        }
    }

    /// A config that never uploads on its own, so picks can be inspected.
    fn picking_config() -> Config {
        Config {
            max_concurrent_uploads: 0,
            ..config()
        }
    }

    fn extension(store: &BlobStore, config: Config, events: &Arc<NoEvents>) -> BlobSyncExtension {
        let events: Weak<dyn ExtensionEvents> = Arc::downgrade(events) as Weak<dyn ExtensionEvents>;
        BlobSyncExtension::new(
            ExtensionId(0),
            store.clone(),
            config,
            events,
            CancellationToken::new(),
        )
    }

    fn wanted(id: BlobId, chunk_size: u32, missing: &Bitfield) -> WantListEntry {
        WantListEntry {
            id,
            chunk_size: Some(chunk_size),
            bitfield: Some(Bytes::from(missing.as_bytes().to_vec())),
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn picks_only_overlapping_chunks() -> Result {
        let events = Arc::new(NoEvents);
        let store = BlobStore::with_chunk_size(MemDirectory::new(), 10);
        let full = store.set(vec![1u8; 100]).await.e()?;
        let other = store.set(vec![2u8; 100]).await.e()?;
        let ext = extension(&store, picking_config(), &events);
        ext.on_open(Arc::new(Recorder::default())).await;

        // Peer misses chunks 2 and 7 of the first blob and nothing of the second.
        let mut missing = Bitfield::new(10);
        missing.set(2, true);
        missing.set(7, true);
        ext.want(WantList {
            blobs: vec![
                wanted(full.id, 10, &missing),
                wanted(other.id, 10, &Bitfield::new(10)),
            ],
        })
        .await
        .e()?;

        let picked = ext.pick_blob_chunks(100).await;
        let mut offsets: Vec<_> = picked.iter().map(|c| (c.id, c.chunk_offset)).collect();
        offsets.sort();
        assert_eq!(offsets, vec![(full.id, 20), (full.id, 70)]);
        assert!(picked.iter().all(|c| c.payload.len() == 10));

        // The amount caps the result across blobs.
        assert_eq!(ext.pick_blob_chunks(1).await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn skips_mismatching_and_unknown_headers() -> Result {
        let events = Arc::new(NoEvents);
        let store = BlobStore::with_chunk_size(MemDirectory::new(), 10);
        let meta = store.set(vec![1u8; 95]).await.e()?;
        let ext = extension(&store, picking_config(), &events);
        ext.on_open(Arc::new(Recorder::default())).await;

        ext.want(WantList {
            blobs: vec![
                // wrong chunk size
                wanted(meta.id, 20, &Bitfield::full(5)),
                // unknown blob
                WantListEntry::everything(BlobId::random()),
                // wrong bitfield length
                wanted(meta.id, 10, &Bitfield::full(3)),
            ],
        })
        .await
        .e()?;
        assert!(ext.pick_blob_chunks(100).await.is_empty());

        // Without a bitfield the peer wants everything, including the short last chunk.
        ext.want(WantList {
            blobs: vec![WantListEntry::everything(meta.id)],
        })
        .await
        .e()?;
        let picked = ext.pick_blob_chunks(100).await;
        assert_eq!(picked.len(), 10);
        let last = picked.iter().find(|c| c.chunk_offset == 90).expect("last chunk");
        assert_eq!(last.payload.len(), 5);
        assert_eq!(last.total_length, 95);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn uploads_respect_concurrency_and_do_not_repeat() -> Result {
        let events = Arc::new(NoEvents);
        let store = BlobStore::with_chunk_size(MemDirectory::new(), 10);
        let meta = store.set(vec![3u8; 200]).await.e()?;
        let ext = extension(&store, config(), &events);
        let recorder = Arc::new(Recorder {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        ext.on_open(recorder.clone()).await;
        ext.want(WantList {
            blobs: vec![WantListEntry::everything(meta.id)],
        })
        .await
        .e()?;

        // Only four pushes may be in flight at a time.
        sleep(Duration::from_millis(5)).await;
        assert_eq!(recorder.pushes.lock().unwrap().len(), 4);

        sleep(Duration::from_millis(500)).await;
        let mut offsets: Vec<u64> = recorder
            .pushes
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.chunk_offset)
            .collect();
        offsets.sort();
        assert_eq!(offsets, (0..20).map(|i| i * 10).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn want_list_updates_are_throttled() -> Result {
        let events = Arc::new(NoEvents);
        let store = BlobStore::memory();
        let mut config = config();
        config.min_want_list_update_interval = Duration::from_millis(200);
        let ext = extension(&store, config, &events);
        let recorder = Arc::new(Recorder::default());
        ext.on_open(recorder.clone()).await;

        let ids: Vec<_> = (0..5).map(|_| BlobId::random()).collect();
        ext.update_want_list(WantList {
            blobs: vec![WantListEntry::everything(ids[0])],
        });
        sleep(Duration::from_millis(20)).await;
        assert_eq!(recorder.wants.lock().unwrap().len(), 1);

        // A burst within the interval collapses into a single send of the latest list.
        for n in 1..5 {
            ext.update_want_list(WantList {
                blobs: ids[..=n].iter().copied().map(WantListEntry::everything).collect(),
            });
        }
        sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.wants.lock().unwrap().len(), 1);
        sleep(Duration::from_millis(300)).await;
        let wants = recorder.wants.lock().unwrap();
        assert_eq!(wants.len(), 2);
        assert_eq!(wants[1].blobs.len(), 5);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn closed_extension_rejects_calls() -> Result {
        let events = Arc::new(NoEvents);
        let store = BlobStore::memory();
        let ext = extension(&store, config(), &events);
        assert_eq!(ext.state(), ExtensionState::Opened);
        assert!(ext.want(WantList::default()).await.is_err());

        ext.on_open(Arc::new(Recorder::default())).await;
        assert_eq!(ext.state(), ExtensionState::Active);
        ext.want(WantList::default()).await.e()?;

        ext.on_close();
        assert_eq!(ext.state(), ExtensionState::Closed);
        // terminal states are final
        ext.on_abort(&ClosedSnafu.build());
        assert_eq!(ext.state(), ExtensionState::Closed);
        let err = ext.want(WantList::default()).await.unwrap_err();
        assert!(err.is_closed());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn want_list_is_resent_until_peer_accepts() -> Result {
        let events = Arc::new(NoEvents);
        let store = BlobStore::memory();
        let mut config = config();
        config.min_want_list_update_interval = Duration::from_millis(10);
        let ext = extension(&store, config, &events);
        let recorder = Arc::new(Recorder {
            refused_wants: AtomicUsize::new(2),
            ..Default::default()
        });
        ext.on_open(recorder.clone()).await;

        let id = BlobId::random();
        ext.update_want_list(WantList {
            blobs: vec![WantListEntry::everything(id)],
        });
        sleep(Duration::from_millis(200)).await;
        let wants = recorder.wants.lock().unwrap();
        assert_eq!(wants.len(), 1);
        assert_eq!(wants[0].blobs[0].id, id);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_pushes_are_retried() -> Result {
        let events = Arc::new(NoEvents);
        let store = BlobStore::with_chunk_size(MemDirectory::new(), 10);
        let meta = store.set(vec![4u8; 30]).await.e()?;
        let mut config = config();
        config.min_want_list_update_interval = Duration::from_millis(10);
        let ext = extension(&store, config, &events);
        let recorder = Arc::new(Recorder {
            failed_pushes: AtomicUsize::new(3),
            ..Default::default()
        });
        ext.on_open(recorder.clone()).await;
        ext.want(WantList {
            blobs: vec![WantListEntry::everything(meta.id)],
        })
        .await
        .e()?;

        sleep(Duration::from_millis(300)).await;
        let mut offsets: Vec<u64> = recorder
            .pushes
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.chunk_offset)
            .collect();
        // Every chunk failed once and was pushed again, delivered chunks are not repeated.
        offsets.sort();
        assert_eq!(offsets, vec![0, 0, 10, 10, 20, 20]);
        Ok(())
    }
}
