//! Runs the sync protocol over a byte stream.
//!
//! Every message is a length prefixed, postcard encoded [`Frame`]. The length prefix is a
//! big-endian `u32`. Requests carry an id which the matching response echoes, so several calls
//! can be in flight on the same stream.

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use blobsync_base::{BlobChunk, WantList};
use bytes::{Bytes, BytesMut};
use n0_future::{boxed::BoxFuture, task::AbortOnDropHandle};
use serde::{Deserialize, Serialize};
use snafu::{IntoError, ResultExt, ensure};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, trace, warn};

use super::{
    BlobSyncService, ClosedSnafu, DecodeSnafu, EncodeSnafu, FrameTooLargeSnafu, IoSnafu,
    RemoteSnafu, RpcError,
};
use crate::{BlobSyncExtension, defaults::MAX_FRAME_SIZE};

/// Capacity of the outgoing frame queue.
const SEND_QUEUE_CAP: usize = 64;

/// A call from one peer to the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// See [`BlobSyncService::want`].
    Want(WantList),
    /// See [`BlobSyncService::push`].
    Push(BlobChunk),
}

/// Failure reported in a [`Frame::Response`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteFailure {
    /// The remote extension is no longer active.
    Closed,
    /// The remote handler failed.
    Failed(String),
}

/// The unit written to the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// A call, answered by a [`Frame::Response`] with the same `id`.
    Request {
        /// Correlation id.
        id: u64,
        /// The call.
        request: Request,
    },
    /// The outcome of a call.
    Response {
        /// Id of the answered request.
        id: u64,
        /// Whether the call succeeded.
        result: Result<(), RemoteFailure>,
    },
}

/// Encodes `frame`, failing with [`RpcError::FrameTooLarge`] if it exceeds the frame limit.
pub fn encode_frame(frame: &Frame) -> Result<Bytes, RpcError> {
    let data = postcard::to_stdvec(frame).context(EncodeSnafu)?;
    ensure!(
        data.len() <= MAX_FRAME_SIZE,
        FrameTooLargeSnafu { len: data.len() }
    );
    Ok(data.into())
}

/// Writes `frame` as a length prefixed, postcard encoded message.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), RpcError> {
    let data = encode_frame(frame)?;
    write_lp(writer, &data).await
}

async fn write_lp<W: AsyncWrite + Unpin>(writer: &mut W, data: &Bytes) -> Result<(), RpcError> {
    writer.write_u32(data.len() as u32).await.context(IoSnafu)?;
    writer.write_all(data).await.context(IoSnafu)?;
    writer.flush().await.context(IoSnafu)?;
    Ok(())
}

/// Reads a length prefixed frame.
///
/// Returns `None` if the stream ends before a new frame starts.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut BytesMut,
) -> Result<Option<Frame>, RpcError> {
    let Some(data) = read_lp(reader, buffer).await? else {
        return Ok(None);
    };
    let frame = postcard::from_bytes(&data).context(DecodeSnafu)?;
    Ok(Some(frame))
}

async fn read_lp<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut BytesMut,
) -> Result<Option<Bytes>, RpcError> {
    let size = match reader.read_u32().await {
        Ok(size) => size as usize,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(IoSnafu.into_error(err)),
    };
    ensure!(size <= MAX_FRAME_SIZE, FrameTooLargeSnafu { len: size });
    buffer.clear();
    buffer.resize(size, 0u8);
    reader.read_exact(&mut buffer[..]).await.context(IoSnafu)?;
    Ok(Some(buffer.split_to(size).freeze()))
}

/// Runs `extension` over `stream` until the stream ends or `cancel` fires.
///
/// Opens the extension once the connection task is running. A clean end of the stream or a
/// cancellation closes the extension, any other failure aborts it and is returned.
pub async fn run<S>(
    extension: BlobSyncExtension,
    stream: S,
    cancel: CancellationToken,
) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let span = error_span!("stream", ext = %extension.id());
    let res = run_inner(extension.clone(), stream, cancel)
        .instrument(span)
        .await;
    match &res {
        Ok(()) => extension.on_close(),
        Err(err) => extension.on_abort(err),
    }
    res
}

async fn run_inner<S>(
    extension: BlobSyncExtension,
    stream: S,
    cancel: CancellationToken,
) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    // Frames are encoded before they are queued, so a frame that cannot be sent only fails
    // its own call.
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(SEND_QUEUE_CAP);
    let (in_tx, mut in_rx) = mpsc::channel::<Frame>(SEND_QUEUE_CAP);

    let mut write_task = AbortOnDropHandle::new(tokio::task::spawn(
        async move {
            while let Some(data) = out_rx.recv().await {
                write_lp(&mut writer, &data).await?;
            }
            writer.shutdown().await.context(IoSnafu)?;
            Ok::<_, RpcError>(())
        }
        .in_current_span(),
    ));
    let mut read_task = AbortOnDropHandle::new(tokio::task::spawn(
        async move {
            let mut buffer = BytesMut::new();
            while let Some(frame) = read_frame(&mut reader, &mut buffer).await? {
                if in_tx.send(frame).await.is_err() {
                    break;
                }
            }
            Ok::<_, RpcError>(())
        }
        .in_current_span(),
    ));

    let client = StreamClient::new(out_tx.clone());
    extension.on_open(Arc::new(client.clone())).await;

    let mut handlers = JoinSet::new();
    let res = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("cancelled");
                break Ok(());
            }
            res = &mut write_task => {
                break flatten(res);
            }
            frame = in_rx.recv() => match frame {
                Some(Frame::Request { id, request }) => {
                    let extension = extension.clone();
                    let out_tx = out_tx.clone();
                    handlers.spawn(
                        async move {
                            let result = handle(&extension, request).await;
                            match encode_frame(&Frame::Response { id, result }) {
                                Ok(data) => {
                                    out_tx.send(data).await.ok();
                                }
                                Err(err) => warn!(id, "failed to encode response: {err:#}"),
                            }
                        }
                        .in_current_span(),
                    );
                }
                Some(Frame::Response { id, result }) => client.respond(id, result),
                None => {
                    debug!("stream ended");
                    break flatten((&mut read_task).await);
                }
            },
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
        }
    };
    client.close();
    res
}

fn flatten(
    res: Result<Result<(), RpcError>, tokio::task::JoinError>,
) -> Result<(), RpcError> {
    match res {
        Ok(res) => res,
        Err(err) => Err(IoSnafu.into_error(io::Error::other(err))),
    }
}

async fn handle(
    extension: &BlobSyncExtension,
    request: Request,
) -> Result<(), RemoteFailure> {
    let res = match request {
        Request::Want(list) => extension.want(list).await,
        Request::Push(chunk) => extension.push(chunk).await,
    };
    res.map_err(|err| match err {
        err if err.is_closed() => RemoteFailure::Closed,
        err => RemoteFailure::Failed(format!("{err:#}")),
    })
}

/// The outbound side of a stream connection.
#[derive(Debug, Clone)]
struct StreamClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    tx: mpsc::Sender<Bytes>,
    next_id: AtomicU64,
    closed: CancellationToken,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<(), RemoteFailure>>>>,
}

impl StreamClient {
    fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                tx,
                next_id: AtomicU64::new(0),
                closed: CancellationToken::new(),
                pending: Default::default(),
            }),
        }
    }

    fn respond(&self, id: u64, result: Result<(), RemoteFailure>) {
        let sender = self.inner.pending.lock().expect("poisoned").remove(&id);
        match sender {
            Some(sender) => {
                sender.send(result).ok();
            }
            None => trace!(id, "response for unknown request"),
        }
    }

    /// Fails all pending and future calls with [`RpcError::Closed`].
    fn close(&self) {
        self.inner.closed.cancel();
        self.inner.pending.lock().expect("poisoned").clear();
    }

    fn call(&self, request: Request) -> BoxFuture<Result<(), RpcError>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            ensure!(!inner.closed.is_cancelled(), ClosedSnafu);
            let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
            let data = encode_frame(&Frame::Request { id, request })?;
            let (tx, rx) = oneshot::channel();
            inner.pending.lock().expect("poisoned").insert(id, tx);
            let _guard = PendingGuard {
                inner: inner.clone(),
                id,
            };
            inner
                .tx
                .send(data)
                .await
                .map_err(|_| ClosedSnafu.build())?;
            match rx.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(RemoteFailure::Failed(message))) => RemoteSnafu { message }.fail(),
                Ok(Err(RemoteFailure::Closed)) | Err(_) => ClosedSnafu.fail(),
            }
        })
    }
}

impl BlobSyncService for StreamClient {
    fn want(&self, list: WantList) -> BoxFuture<Result<(), RpcError>> {
        self.call(Request::Want(list))
    }

    fn push(&self, chunk: BlobChunk) -> BoxFuture<Result<(), RpcError>> {
        self.call(Request::Push(chunk))
    }
}

/// Removes the pending entry of a call that is dropped before its response arrives.
struct PendingGuard {
    inner: Arc<ClientInner>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.remove(&self.id);
        }
    }
}
