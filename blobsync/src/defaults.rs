//! Default values used in [`blobsync`][`crate`]

use std::time::Duration;

/// Chunk size used for blobs written in one piece with [`BlobStore::set`].
///
/// [`BlobStore::set`]: crate::store::BlobStore::set
pub const DEFAULT_CHUNK_SIZE: u32 = 4096;

/// Minimum time between two want lists sent over the same connection.
pub const MIN_WANT_LIST_UPDATE_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum number of chunk pushes in flight per connection.
pub const MAX_CONCURRENT_UPLOADS: usize = 20;

/// Timeout for a single `want` or `push` call.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(20);

/// Largest frame accepted by the stream transport.
///
/// Leaves room for a chunk of up to 1 MiB plus framing.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024 + 4096;
