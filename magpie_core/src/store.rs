//! Storage seams consumed by the server flows.
//!
//! Three collaborators back the acquisition pipeline: the content-addressed
//! blob store, the file-hash secondary index, and the per-client virtual
//! filesystem. Flows hold them as trait objects; implementations are
//! expected to be safely concurrent across flows.
//!
//! Collaborator failures are surfaced as [`anyhow::Error`] and treated as
//! fatal by the flow that observes them.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::agent::{BlobDescriptor, StatEntry};
use crate::hash::{CompositeHash, Digest};
use crate::pathspec::{PathSpec, VfsUrn};

pub type StoreResult<T, E = anyhow::Error> = std::result::Result<T, E>;

/// Content-addressed blob persistence, keyed by the digest the producer
/// reported for each blob.
#[async_trait]
pub trait BlobStore: fmt::Debug + Send + Sync + 'static {
    /// Batched presence probe. Returns one entry per queried digest.
    async fn blobs_exist(&self, digests: &[Digest]) -> StoreResult<HashMap<Digest, bool>>;

    /// Persist blobs under the digests their producer reported. The store
    /// records digests as supplied and does not verify them.
    async fn store_blobs(&self, blobs: Vec<(Digest, Bytes)>) -> StoreResult<()>;
}

/// Secondary index from file content hashes to the VFS objects already
/// holding that content.
#[async_trait]
pub trait FileHashIndex: fmt::Debug + Send + Sync + 'static {
    /// Look up a batch of composite hashes.
    ///
    /// Yields one `(stored_urn, hash)` pair per **unique** sha256 that is
    /// present in the index; callers with several files sharing a sha256
    /// must fan the hit back out themselves. When `external` is set,
    /// externally registered stores are consulted as well.
    async fn check_hashes(
        &self,
        hashes: &[CompositeHash],
        external: bool,
    ) -> StoreResult<Vec<(VfsUrn, CompositeHash)>>;

    /// Register `urn` as a holder of the content identified by `sha256`.
    async fn add_urn(&self, sha256: Digest, urn: &VfsUrn) -> StoreResult<()>;
}

/// The per-client virtual filesystem object store.
#[async_trait]
pub trait VfsStore: fmt::Debug + Send + Sync + 'static {
    /// Duplicate `src` at `dst` with refreshed timestamps. The copy is
    /// visible to readers once this returns.
    async fn copy(&self, src: &VfsUrn, dst: &VfsUrn) -> StoreResult<()>;

    /// Replace the stat attribute of an existing object.
    async fn set_stat(&self, urn: &VfsUrn, stat: &StatEntry) -> StoreResult<()>;

    /// Content size of the object at `urn`.
    async fn size(&self, urn: &VfsUrn) -> StoreResult<u64>;

    /// Override the recorded content size of the object at `urn`.
    async fn set_size(&self, urn: &VfsUrn, size: u64) -> StoreResult<()>;

    /// Begin writing a sparse blob image at `urn`, chunked at `chunk_size`.
    async fn create_blob_image(
        &self,
        urn: &VfsUrn,
        chunk_size: u64,
    ) -> StoreResult<Box<dyn BlobImageWriter>>;
}

/// Staged construction of a sparse blob image.
///
/// Attributes and blob references accumulate in memory; nothing is visible
/// in the VFS until [`finalize`](BlobImageWriter::finalize) succeeds.
/// Blobs must be appended in file order.
#[async_trait]
pub trait BlobImageWriter: Send {
    fn set_stat(&mut self, stat: StatEntry);

    fn set_pathspec(&mut self, pathspec: PathSpec);

    fn set_content_last(&mut self, when: DateTime<Utc>);

    fn add_blob(&mut self, blob: BlobDescriptor);

    async fn finalize(self: Box<Self>) -> StoreResult<()>;
}
