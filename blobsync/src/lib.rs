//! Chunked blob storage and replication between peers.
//!
//! Blobs are immutable byte arrays identified by a random [`BlobId`]. A [`BlobStore`] keeps
//! them split into fixed size chunks and tracks which chunks are present in a [`Bitfield`],
//! so that a blob can be assembled from chunks arriving in any order.
//!
//! A [`BlobSync`] replicates blobs over connections to peers. Every connection gets a
//! [`BlobSyncExtension`] from [`BlobSync::create_extension`], which a transport from [`rpc`]
//! runs. Peers exchange want lists naming the chunks they are missing and push the chunks
//! the other side wants.
//!
//! ```no_run
//! # async fn run() -> n0_snafu::Result {
//! use blobsync::{BlobStore, BlobSync, Config, rpc};
//! use n0_snafu::ResultExt;
//! use tokio_util::sync::CancellationToken;
//!
//! let alice = BlobSync::open(BlobStore::memory(), Config::default()).await.e()?;
//! let bob = BlobSync::open(BlobStore::memory(), Config::default()).await.e()?;
//! let _conn = rpc::memory::connect(&alice.create_extension(), &bob.create_extension()).await;
//!
//! let meta = alice.store().set(b"hello world".to_vec()).await.e()?;
//! alice.notify_blob_added(meta.id);
//! bob.download(CancellationToken::new(), meta.id).await.e()?.await.e()?;
//! assert_eq!(bob.store().get(meta.id, None).await.e()?, &b"hello world"[..]);
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(blobsync_docsrs, feature(doc_auto_cfg))]

pub mod config;
pub mod defaults;
pub mod extension;
pub mod rpc;
pub mod store;
pub mod sync;
mod util;

pub use blobsync_base::{
    Bitfield, BlobChunk, BlobId, BlobMeta, BlobState, WantList, WantListEntry,
};

pub use self::{
    config::Config,
    extension::{BlobSyncExtension, ExtensionId, ExtensionState},
    rpc::{BlobSyncService, RpcError},
    store::{BlobStore, GetError, Range, StoreError},
    sync::{BlobSync, Download, DownloadError, OpenError},
};
