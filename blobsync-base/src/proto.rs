//! Messages exchanged between peers, and the persisted blob metadata.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{BlobId, bitfield::Bitfield};

/// The blobs a peer is still missing.
///
/// A peer sends the same want list to every connected peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WantList {
    /// One entry per blob.
    pub blobs: Vec<WantListEntry>,
}

impl WantList {
    /// Whether the list asks for nothing.
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

/// A single blob in a [`WantList`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WantListEntry {
    /// The wanted blob.
    pub id: BlobId,
    /// Chunk size the `bitfield` refers to.
    pub chunk_size: Option<u32>,
    /// Packed [`Bitfield`] with a bit set for every chunk the sender is *missing*.
    ///
    /// `None` means the sender wants the whole blob.
    pub bitfield: Option<Bytes>,
}

impl WantListEntry {
    /// An entry asking for every chunk of `id`.
    pub fn everything(id: BlobId) -> Self {
        Self {
            id,
            chunk_size: None,
            bitfield: None,
        }
    }

    /// An entry asking for the chunks missing from `meta`.
    pub fn missing(meta: &BlobMeta) -> Self {
        Self {
            id: meta.id,
            chunk_size: Some(meta.chunk_size),
            bitfield: Some(Bytes::from(meta.bitfield.invert().into_bytes())),
        }
    }
}

/// A slice of a blob, the unit of replication.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobChunk {
    /// The blob this chunk belongs to.
    pub id: BlobId,
    /// Total length of the blob in bytes.
    pub total_length: u64,
    /// Chunk size of the blob.
    pub chunk_size: u32,
    /// Byte offset of the payload inside the blob, a multiple of `chunk_size`.
    pub chunk_offset: u64,
    /// The chunk data.
    pub payload: Bytes,
}

impl fmt::Debug for BlobChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobChunk")
            .field("id", &self.id)
            .field("total_length", &self.total_length)
            .field("chunk_size", &self.chunk_size)
            .field("chunk_offset", &self.chunk_offset)
            .field("payload", &format_args!("{} bytes", self.payload.len()))
            .finish()
    }
}

impl BlobChunk {
    /// Index of the first chunk covered by the payload.
    pub fn chunk_index(&self) -> u32 {
        (self.chunk_offset / self.chunk_size as u64) as u32
    }
}

/// How much of a blob is present locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlobState {
    /// No chunk is present.
    Empty = 0,
    /// Some, but not all chunks are present.
    PartiallyPresent = 1,
    /// Every chunk is present.
    FullyPresent = 2,
}

/// Metadata of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMeta {
    /// Id of the blob.
    pub id: BlobId,
    /// Total length in bytes.
    pub length: u64,
    /// Size of every chunk except possibly the last one.
    pub chunk_size: u32,
    /// A bit per chunk, set when the chunk is present.
    pub bitfield: Bitfield,
    /// Derived from `bitfield`, see [`BlobMeta::update_state`].
    pub state: BlobState,
    /// Creation time in milliseconds since the unix epoch.
    pub created: u64,
    /// Last modification time in milliseconds since the unix epoch.
    pub updated: u64,
}

impl BlobMeta {
    /// Metadata for a blob of which nothing is present yet.
    pub fn new(id: BlobId, length: u64, chunk_size: u32, now: u64) -> Self {
        let mut meta = Self {
            id,
            length,
            chunk_size,
            bitfield: Bitfield::new(chunk_count(length, chunk_size)),
            state: BlobState::Empty,
            created: now,
            updated: now,
        };
        meta.update_state();
        meta
    }

    /// Number of chunks of this blob.
    pub fn chunk_count(&self) -> u32 {
        self.bitfield.len()
    }

    /// Whether every chunk is present.
    pub fn is_complete(&self) -> bool {
        self.state == BlobState::FullyPresent
    }

    /// Byte range `(offset, length)` of chunk `index`.
    pub fn chunk_range(&self, index: u32) -> (u64, u64) {
        let offset = index as u64 * self.chunk_size as u64;
        let len = (self.length - offset).min(self.chunk_size as u64);
        (offset, len)
    }

    /// Recomputes [`BlobMeta::state`] from the bitfield.
    pub fn update_state(&mut self) {
        self.state = if self.bitfield.is_full() {
            BlobState::FullyPresent
        } else if self.bitfield.count_ones() == 0 {
            BlobState::Empty
        } else {
            BlobState::PartiallyPresent
        };
    }
}

/// Number of chunks a blob of `length` bytes is split into.
pub fn chunk_count(length: u64, chunk_size: u32) -> u32 {
    assert!(chunk_size > 0, "chunk size must not be zero");
    length.div_ceil(chunk_size as u64) as u32
}
