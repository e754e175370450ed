//! Base types for chunked blob replication.
//!
//! Everything two peers have to agree on lives here: how blobs are identified, how chunk
//! presence is tracked, and the messages of the sync protocol.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(blobsync_docsrs, feature(doc_auto_cfg))]

pub mod bitfield;
mod blob_id;
pub mod proto;

pub use self::{
    bitfield::Bitfield,
    blob_id::{BlobId, ParseError},
    proto::{BlobChunk, BlobMeta, BlobState, WantList, WantListEntry},
};
