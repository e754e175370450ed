//! Chunk addressable blob storage.
//!
//! Every blob is kept as two files of a [`Directory`]: `<hex-id>/data` holds the blob bytes at
//! their final offsets, `<hex-id>/meta` the [`BlobMeta`] with the presence [`Bitfield`]. Blobs
//! can be written all at once with [`BlobStore::set`] or chunk by chunk, in any order, with
//! [`BlobStore::set_chunk`]. Reads only succeed for ranges whose chunks are all present.
//!
//! [`Bitfield`]: blobsync_base::Bitfield

use std::{io, sync::Arc};

use blobsync_base::{BlobChunk, BlobId, BlobMeta};
use bytes::{BufMut, Bytes, BytesMut};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu, ensure};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::{defaults::DEFAULT_CHUNK_SIZE, util::now_millis};

pub mod directory;

pub use self::directory::{Directory, FileStat, FsDirectory, MemDirectory, StorageFile};

const META_FILE: &str = "meta";
const DATA_FILE: &str = "data";

/// Errors of the underlying storage.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("storage io failed"))]
    Io { source: io::Error },
    #[snafu(display("failed to encode metadata"))]
    Encode { source: postcard::Error },
    #[snafu(display("corrupt metadata for blob {id}"))]
    Decode { id: BlobId, source: postcard::Error },
    #[snafu(display("invalid chunk for blob {id}: {reason}"))]
    InvalidChunk { id: BlobId, reason: &'static str },
}

/// Errors of [`BlobStore::get`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum GetError {
    /// Some chunk of the requested range is not present, or the range is out of bounds.
    #[snafu(display("range {offset}..{end} of blob {id} is not available"))]
    RangeUnavailable { id: BlobId, offset: u64, end: u64 },
    /// The blob is not fully present.
    #[snafu(display("blob {id} is not available"))]
    BlobUnavailable { id: BlobId },
    #[snafu(transparent)]
    Store { source: StoreError },
}

/// A byte range of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    /// Start of the range.
    pub offset: u64,
    /// Number of bytes.
    pub length: u64,
}

impl Range {
    /// The range `offset..offset + length`.
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }
}

/// Storage for blobs and their metadata.
///
/// Cheap to clone, clones share the same storage.
#[derive(Debug, Clone)]
pub struct BlobStore {
    inner: Arc<Inner>,
    chunk_size: u32,
}

#[derive(Debug)]
struct Inner {
    directory: Box<dyn Directory>,
    /// Serializes read-modify-write cycles of metadata.
    write_lock: Mutex<()>,
}

impl BlobStore {
    /// Creates a store persisting into `directory`.
    pub fn new(directory: impl Directory) -> Self {
        Self::with_chunk_size(directory, DEFAULT_CHUNK_SIZE)
    }

    /// Creates a store that splits blobs written with [`BlobStore::set`] into chunks of
    /// `chunk_size` bytes.
    pub fn with_chunk_size(directory: impl Directory, chunk_size: u32) -> Self {
        assert!(chunk_size > 0, "chunk size must not be zero");
        Self {
            inner: Arc::new(Inner {
                directory: Box::new(directory),
                write_lock: Mutex::new(()),
            }),
            chunk_size,
        }
    }

    /// A handle to the same storage whose [`BlobStore::set`] uses `chunk_size`.
    pub fn with_default_chunk_size(&self, chunk_size: u32) -> Self {
        assert!(chunk_size > 0, "chunk size must not be zero");
        Self {
            inner: self.inner.clone(),
            chunk_size,
        }
    }

    /// A store kept in memory.
    pub fn memory() -> Self {
        Self::new(MemDirectory::new())
    }

    /// The chunk size used by [`BlobStore::set`].
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Returns the metadata of `id`, or `None` if nothing is known about the blob.
    ///
    /// Looking up an unknown blob leaves the storage untouched.
    pub async fn get_meta(&self, id: BlobId) -> Result<Option<BlobMeta>, StoreError> {
        let Some(file) = self.existing_file(id, META_FILE).await? else {
            return Ok(None);
        };
        read_meta(id, file.as_ref()).await
    }

    /// Reads a blob, or a range of it.
    ///
    /// Without a range the whole blob is read, which requires every chunk to be present.
    /// With a range, only the chunks overlapping the range need to be present.
    pub async fn get(&self, id: BlobId, range: Option<Range>) -> Result<Bytes, GetError> {
        let Some(meta) = self.get_meta(id).await? else {
            return Err(match range {
                Some(range) => RangeUnavailableSnafu {
                    id,
                    offset: range.offset,
                    end: range.offset.saturating_add(range.length),
                }
                .build(),
                None => BlobUnavailableSnafu { id }.build(),
            });
        };
        let range = match range {
            Some(range) => range,
            None if meta.is_complete() => Range::new(0, meta.length),
            None => return Err(BlobUnavailableSnafu { id }.build()),
        };
        if range.length == 0 && range.offset <= meta.length {
            return Ok(Bytes::new());
        }
        let end = range.offset.checked_add(range.length);
        let available = end.is_some_and(|end| {
            end <= meta.length && {
                let from = (range.offset / meta.chunk_size as u64) as u32;
                let to = end.div_ceil(meta.chunk_size as u64) as u32;
                meta.bitfield.count(from, to) == to - from
            }
        });
        ensure!(
            available,
            RangeUnavailableSnafu {
                id,
                offset: range.offset,
                end: end.unwrap_or(u64::MAX),
            }
        );
        let data = self
            .existing_file(id, DATA_FILE)
            .await?
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "missing data file"))
            .context(IoSnafu)?;
        let bytes = data
            .read_at(range.offset, range.length)
            .await
            .context(IoSnafu)?;
        Ok(bytes)
    }

    /// Writes a complete blob under a new id.
    pub async fn set(&self, data: impl Into<Bytes>) -> Result<BlobMeta, StoreError> {
        let data = data.into();
        let id = BlobId::random();
        let mut meta = BlobMeta::new(id, data.len() as u64, self.chunk_size, now_millis());
        meta.bitfield = meta.bitfield.invert();
        meta.update_state();

        let _guard = self.inner.write_lock.lock().await;
        if !data.is_empty() {
            let file = self.file(id, DATA_FILE).await?;
            file.write_at(0, data).await.context(IoSnafu)?;
        }
        self.persist_meta(&meta).await?;
        debug!(id = %id.fmt_short(), length = meta.length, "stored blob");
        Ok(meta)
    }

    /// Writes a chunk received from a peer, creating the blob's metadata on first write.
    ///
    /// The payload has to start at a chunk boundary and end at a chunk boundary or at the end
    /// of the blob. It may cover several chunks.
    pub async fn set_chunk(&self, chunk: BlobChunk) -> Result<BlobMeta, StoreError> {
        let id = chunk.id;
        ensure!(
            chunk.chunk_size > 0,
            InvalidChunkSnafu {
                id,
                reason: "zero chunk size"
            }
        );
        let chunk_size = chunk.chunk_size as u64;
        let end = chunk.chunk_offset.checked_add(chunk.payload.len() as u64);
        ensure!(
            chunk.chunk_offset % chunk_size == 0,
            InvalidChunkSnafu {
                id,
                reason: "offset is not aligned to the chunk size"
            }
        );
        ensure!(
            end.is_some_and(|end| end <= chunk.total_length),
            InvalidChunkSnafu {
                id,
                reason: "payload exceeds the blob length"
            }
        );
        let end = end.expect("checked above");
        ensure!(
            end % chunk_size == 0 || end == chunk.total_length,
            InvalidChunkSnafu {
                id,
                reason: "payload ends inside a chunk"
            }
        );
        ensure!(
            chunk.total_length.div_ceil(chunk_size) <= u32::MAX as u64,
            InvalidChunkSnafu {
                id,
                reason: "too many chunks"
            }
        );

        let _guard = self.inner.write_lock.lock().await;
        let meta_file = self.file(id, META_FILE).await?;
        let mut meta = match read_meta(id, meta_file.as_ref()).await? {
            Some(meta) => {
                ensure!(
                    meta.length == chunk.total_length && meta.chunk_size == chunk.chunk_size,
                    InvalidChunkSnafu {
                        id,
                        reason: "length or chunk size differs from stored metadata"
                    }
                );
                meta
            }
            None => BlobMeta::new(id, chunk.total_length, chunk.chunk_size, now_millis()),
        };

        if !chunk.payload.is_empty() {
            let data = self.file(id, DATA_FILE).await?;
            data.write_at(chunk.chunk_offset, chunk.payload)
                .await
                .context(IoSnafu)?;
        }
        let from = (chunk.chunk_offset / chunk_size) as u32;
        let to = end.div_ceil(chunk_size) as u32;
        for index in from..to {
            meta.bitfield.set(index, true);
        }
        meta.update_state();
        meta.updated = now_millis();
        write_meta(meta_file.as_ref(), &meta).await?;
        trace!(
            id = %id.fmt_short(),
            chunks = ?(from..to),
            state = ?meta.state,
            "stored chunk"
        );
        Ok(meta)
    }

    /// Metadata of every stored blob, ordered by id.
    pub async fn list(&self) -> Result<Vec<BlobMeta>, StoreError> {
        let names = self.inner.directory.list().await.context(IoSnafu)?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let Ok(id) = name.parse::<BlobId>() else {
                warn!(%name, "ignoring unexpected entry in blob directory");
                continue;
            };
            if let Some(meta) = self.get_meta(id).await? {
                out.push(meta);
            }
        }
        out.sort_by_key(|meta| meta.id);
        Ok(out)
    }

    async fn file(&self, id: BlobId, name: &str) -> Result<Box<dyn StorageFile>, StoreError> {
        let path = format!("{}/{name}", id.to_hex());
        self.inner
            .directory
            .get_or_create_file(&path)
            .await
            .context(IoSnafu)
    }

    async fn existing_file(
        &self,
        id: BlobId,
        name: &str,
    ) -> Result<Option<Box<dyn StorageFile>>, StoreError> {
        let path = format!("{}/{name}", id.to_hex());
        self.inner.directory.open_file(&path).await.context(IoSnafu)
    }

    async fn persist_meta(&self, meta: &BlobMeta) -> Result<(), StoreError> {
        let file = self.file(meta.id, META_FILE).await?;
        write_meta(file.as_ref(), meta).await
    }
}

/// Meta files hold a big endian `u32` length followed by the postcard encoded [`BlobMeta`].
async fn read_meta(id: BlobId, file: &dyn StorageFile) -> Result<Option<BlobMeta>, StoreError> {
    let size = file.stat().await.context(IoSnafu)?.size;
    if size < 4 {
        return Ok(None);
    }
    let prefix = file.read_at(0, 4).await.context(IoSnafu)?;
    let len = u32::from_be_bytes(prefix[..].try_into().expect("4 bytes")) as u64;
    let data = file.read_at(4, len).await.context(IoSnafu)?;
    let meta = postcard::from_bytes(&data).context(DecodeSnafu { id })?;
    Ok(Some(meta))
}

async fn write_meta(file: &dyn StorageFile, meta: &BlobMeta) -> Result<(), StoreError> {
    let encoded = postcard::to_stdvec(meta).context(EncodeSnafu)?;
    let mut buf = BytesMut::with_capacity(4 + encoded.len());
    buf.put_u32(encoded.len() as u32);
    buf.put_slice(&encoded);
    file.write_at(0, buf.freeze()).await.context(IoSnafu)
}

#[cfg(test)]
mod tests {
    use blobsync_base::BlobState;
    use n0_snafu::{Result, ResultExt};
    use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
    use tracing_test::traced_test;

    use super::*;

    fn random_data(rng: &mut impl Rng, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        data
    }

    fn chunks_of(id: BlobId, data: &[u8], chunk_size: u32) -> Vec<BlobChunk> {
        data.chunks(chunk_size as usize)
            .enumerate()
            .map(|(i, payload)| BlobChunk {
                id,
                total_length: data.len() as u64,
                chunk_size,
                chunk_offset: i as u64 * chunk_size as u64,
                payload: Bytes::copy_from_slice(payload),
            })
            .collect()
    }

    #[tokio::test]
    #[traced_test]
    async fn set_then_get() -> Result {
        let store = BlobStore::with_chunk_size(MemDirectory::new(), 16);
        let mut rng = StdRng::seed_from_u64(0);
        for len in [0usize, 1, 15, 16, 17, 100, 1000] {
            let data = random_data(&mut rng, len);
            let meta = store.set(data.clone()).await.e()?;
            assert_eq!(meta.length, len as u64);
            assert_eq!(meta.state, BlobState::FullyPresent);
            assert_eq!(store.get(meta.id, None).await.e()?, data);
            assert_eq!(store.get_meta(meta.id).await.e()?, Some(meta));
        }
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn unknown_blob() -> Result {
        let store = BlobStore::memory();
        let id = BlobId::random();
        assert_eq!(store.get_meta(id).await.e()?, None);
        assert!(matches!(
            store.get(id, None).await,
            Err(GetError::BlobUnavailable { .. })
        ));
        assert!(matches!(
            store.get(id, Some(Range::new(0, 1))).await,
            Err(GetError::RangeUnavailable { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn chunks_in_any_order() -> Result {
        let mut rng = StdRng::seed_from_u64(1);
        let store = BlobStore::memory();
        let data = random_data(&mut rng, 1000);
        let id = BlobId::random();
        let mut chunks = chunks_of(id, &data, 64);
        chunks.shuffle(&mut rng);
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let meta = store.set_chunk(chunk).await.e()?;
            let expected = if i == last {
                BlobState::FullyPresent
            } else {
                BlobState::PartiallyPresent
            };
            assert_eq!(meta.state, expected);
            assert_eq!(meta.bitfield.count_ones(), i as u32 + 1);
        }
        assert_eq!(store.get(id, None).await.e()?, data);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn multi_chunk_payloads() -> Result {
        let mut rng = StdRng::seed_from_u64(2);
        let store = BlobStore::memory();
        let data = random_data(&mut rng, 250);
        let id = BlobId::random();
        // 10 byte chunks, written as [0, 30), [100, 250), [30, 100)
        for (start, end) in [(0usize, 30usize), (100, 250), (30, 100)] {
            store
                .set_chunk(BlobChunk {
                    id,
                    total_length: 250,
                    chunk_size: 10,
                    chunk_offset: start as u64,
                    payload: Bytes::copy_from_slice(&data[start..end]),
                })
                .await
                .e()?;
        }
        let meta = store.get_meta(id).await.e()?.expect("meta");
        assert!(meta.is_complete());
        assert_eq!(store.get(id, None).await.e()?, data);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn partial_reads() -> Result {
        let mut rng = StdRng::seed_from_u64(3);
        let store = BlobStore::memory();
        let data = random_data(&mut rng, 100);
        let id = BlobId::random();
        let chunks = chunks_of(id, &data, 10);
        // chunks 0, 1 and 5
        for index in [0usize, 1, 5] {
            store.set_chunk(chunks[index].clone()).await.e()?;
        }

        assert!(matches!(
            store.get(id, None).await,
            Err(GetError::BlobUnavailable { .. })
        ));
        assert_eq!(
            store.get(id, Some(Range::new(3, 15))).await.e()?,
            data[3..18]
        );
        assert_eq!(
            store.get(id, Some(Range::new(50, 10))).await.e()?,
            data[50..60]
        );
        assert!(matches!(
            store.get(id, Some(Range::new(55, 10))).await,
            Err(GetError::RangeUnavailable { .. })
        ));
        assert!(matches!(
            store.get(id, Some(Range::new(95, 10))).await,
            Err(GetError::RangeUnavailable { .. })
        ));
        assert_eq!(
            store.get(id, Some(Range::new(40, 0))).await.e()?,
            Bytes::new()
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn empty_ranges_need_no_chunks() -> Result {
        let store = BlobStore::memory();
        let id = BlobId::random();
        let chunks = chunks_of(id, &[9u8; 100], 10);
        store.set_chunk(chunks[0].clone()).await.e()?;

        // inside a missing chunk, unaligned, and at the very end
        for offset in [15, 37, 100] {
            assert_eq!(
                store.get(id, Some(Range::new(offset, 0))).await.e()?,
                Bytes::new()
            );
        }
        assert!(matches!(
            store.get(id, Some(Range::new(101, 0))).await,
            Err(GetError::RangeUnavailable { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn lookups_do_not_create_files() -> Result {
        let tmp = tempfile::tempdir().e()?;
        let dir = FsDirectory::new(tmp.path());
        let store = BlobStore::new(dir.clone());
        let id = BlobId::random();
        assert_eq!(store.get_meta(id).await.e()?, None);
        assert!(store.get(id, None).await.is_err());
        assert!(store.get(id, Some(Range::new(0, 0))).await.is_err());
        assert!(store.list().await.e()?.is_empty());
        assert!(dir.list().await.e()?.is_empty());
        assert!(!tmp.path().join(id.to_hex()).exists());

        let mem = MemDirectory::new();
        let store = BlobStore::new(mem.clone());
        assert_eq!(store.get_meta(id).await.e()?, None);
        assert!(mem.list().await.e()?.is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn default_chunk_size_is_per_handle() -> Result {
        let store = BlobStore::with_chunk_size(MemDirectory::new(), 16);
        let other = store.with_default_chunk_size(32);
        assert_eq!(other.chunk_size(), 32);
        let meta = other.set(vec![1u8; 100]).await.e()?;
        assert_eq!(meta.chunk_size, 32);
        assert_eq!(meta.chunk_count(), 4);
        // both handles share the storage
        assert_eq!(store.get_meta(meta.id).await.e()?, Some(meta));
        assert_eq!(store.set(vec![1u8; 100]).await.e()?.chunk_size, 16);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn rejects_invalid_chunks() -> Result {
        let store = BlobStore::memory();
        let id = BlobId::random();
        let chunk = |offset: u64, len: usize, chunk_size: u32, total: u64| BlobChunk {
            id,
            total_length: total,
            chunk_size,
            chunk_offset: offset,
            payload: Bytes::from(vec![1u8; len]),
        };
        for bad in [
            chunk(0, 10, 0, 100),
            chunk(5, 10, 10, 100),
            chunk(90, 20, 10, 100),
            chunk(0, 15, 10, 100),
        ] {
            assert!(matches!(
                store.set_chunk(bad).await,
                Err(StoreError::InvalidChunk { .. })
            ));
        }
        store.set_chunk(chunk(0, 10, 10, 100)).await.e()?;
        assert!(matches!(
            store.set_chunk(chunk(10, 10, 20, 100)).await,
            Err(StoreError::InvalidChunk { .. })
        ));
        assert!(matches!(
            store.set_chunk(chunk(10, 10, 10, 120)).await,
            Err(StoreError::InvalidChunk { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn list_and_reopen_on_disk() -> Result {
        let tmp = tempfile::tempdir().e()?;
        let mut ids = Vec::new();
        {
            let store = BlobStore::new(FsDirectory::new(tmp.path()));
            for len in [10usize, 5000, 10_000] {
                let meta = store.set(vec![7u8; len]).await.e()?;
                ids.push(meta.id);
            }
            let id = BlobId::random();
            store
                .set_chunk(BlobChunk {
                    id,
                    total_length: 9000,
                    chunk_size: 4096,
                    chunk_offset: 4096,
                    payload: Bytes::from(vec![1u8; 4096]),
                })
                .await
                .e()?;
            ids.push(id);
        }
        ids.sort();

        let store = BlobStore::new(FsDirectory::new(tmp.path()));
        let listed = store.list().await.e()?;
        assert_eq!(listed.iter().map(|m| m.id).collect::<Vec<_>>(), ids);
        let partial = listed
            .iter()
            .find(|m| m.state == BlobState::PartiallyPresent)
            .expect("partial blob");
        assert_eq!(partial.bitfield.find_indexes(), vec![1]);
        assert_eq!(
            store
                .get(partial.id, Some(Range::new(4096, 4096)))
                .await
                .e()?,
            vec![1u8; 4096]
        );
        Ok(())
    }
}
