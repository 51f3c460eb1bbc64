//! In-memory implementations of the Magpie storage collaborators.
//!
//! Backed by `DashMap`, safe to share across concurrently running flows.
//! Used by the flow tests and by embedders that want a fully self-contained
//! server (fixtures, single-process deployments).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use magpie_core::{
    BlobDescriptor, BlobImageWriter, BlobStore, CompositeHash, Digest, FileHashIndex, PathSpec,
    StatEntry, StoreResult, VfsStore, VfsUrn,
};

/// Digest-keyed blob storage.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<Digest, Bytes>,
}

impl MemoryBlobStore {
    /// Creates a new, empty `MemoryBlobStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Content of the blob stored under `digest`.
    pub fn blob(&self, digest: &Digest) -> Option<Bytes> {
        self.blobs.get(digest).map(|entry| entry.value().clone())
    }

    /// Number of distinct blobs stored.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn blobs_exist(&self, digests: &[Digest]) -> StoreResult<HashMap<Digest, bool>> {
        Ok(digests
            .iter()
            .map(|digest| (*digest, self.blobs.contains_key(digest)))
            .collect())
    }

    async fn store_blobs(&self, blobs: Vec<(Digest, Bytes)>) -> StoreResult<()> {
        for (digest, bytes) in blobs {
            self.blobs.insert(digest, bytes);
        }
        Ok(())
    }
}

/// sha256 → stored URN secondary index.
#[derive(Debug, Default)]
pub struct MemoryHashIndex {
    by_sha256: DashMap<Digest, VfsUrn>,
}

impl MemoryHashIndex {
    /// Creates a new, empty `MemoryHashIndex`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the index with a known mapping.
    pub fn insert(&self, sha256: Digest, urn: VfsUrn) {
        self.by_sha256.insert(sha256, urn);
    }

    /// The URN registered for `sha256`, if any.
    pub fn urn_for(&self, sha256: &Digest) -> Option<VfsUrn> {
        self.by_sha256.get(sha256).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.by_sha256.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_sha256.is_empty()
    }
}

#[async_trait::async_trait]
impl FileHashIndex for MemoryHashIndex {
    async fn check_hashes(
        &self,
        hashes: &[CompositeHash],
        _external: bool,
    ) -> StoreResult<Vec<(VfsUrn, CompositeHash)>> {
        // One hit per unique sha256, as the contract requires.
        let mut seen = std::collections::HashSet::new();
        let mut hits = Vec::new();
        for hash in hashes {
            if !seen.insert(hash.sha256) {
                continue;
            }
            if let Some(urn) = self.by_sha256.get(&hash.sha256) {
                hits.push((urn.value().clone(), hash.clone()));
            }
        }
        Ok(hits)
    }

    async fn add_urn(&self, sha256: Digest, urn: &VfsUrn) -> StoreResult<()> {
        self.by_sha256.insert(sha256, urn.clone());
        Ok(())
    }
}

/// One object in the in-memory VFS.
#[derive(Debug, Clone, Default)]
pub struct VfsObject {
    pub stat: Option<StatEntry>,
    pub pathspec: Option<PathSpec>,
    pub content_last: Option<DateTime<Utc>>,
    pub chunk_size: u64,
    pub blobs: Vec<BlobDescriptor>,
    pub size: u64,
}

/// URN-keyed virtual filesystem.
#[derive(Debug, Default)]
pub struct MemoryVfs {
    objects: Arc<DashMap<VfsUrn, VfsObject>>,
}

impl MemoryVfs {
    /// Creates a new, empty `MemoryVfs`.
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of the object stored at `urn`.
    pub fn object(&self, urn: &VfsUrn) -> Option<VfsObject> {
        self.objects.get(urn).map(|entry| entry.value().clone())
    }

    /// Insert an object directly, bypassing the image writer.
    pub fn put_object(&self, urn: VfsUrn, object: VfsObject) {
        self.objects.insert(urn, object);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait::async_trait]
impl VfsStore for MemoryVfs {
    async fn copy(&self, src: &VfsUrn, dst: &VfsUrn) -> StoreResult<()> {
        let mut object = self
            .objects
            .get(src)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow!("copy source does not exist: {src}"))?;
        object.content_last = Some(Utc::now());
        self.objects.insert(dst.clone(), object);
        Ok(())
    }

    async fn set_stat(&self, urn: &VfsUrn, stat: &StatEntry) -> StoreResult<()> {
        let mut object = self
            .objects
            .get_mut(urn)
            .ok_or_else(|| anyhow!("no such object: {urn}"))?;
        object.stat = Some(stat.clone());
        Ok(())
    }

    async fn size(&self, urn: &VfsUrn) -> StoreResult<u64> {
        let object = self
            .objects
            .get(urn)
            .ok_or_else(|| anyhow!("no such object: {urn}"))?;
        Ok(object.size)
    }

    async fn set_size(&self, urn: &VfsUrn, size: u64) -> StoreResult<()> {
        let mut object = self
            .objects
            .get_mut(urn)
            .ok_or_else(|| anyhow!("no such object: {urn}"))?;
        object.size = size;
        Ok(())
    }

    async fn create_blob_image(
        &self,
        urn: &VfsUrn,
        chunk_size: u64,
    ) -> StoreResult<Box<dyn BlobImageWriter>> {
        Ok(Box::new(MemoryImageWriter {
            objects: Arc::clone(&self.objects),
            urn: urn.clone(),
            object: VfsObject {
                chunk_size,
                ..VfsObject::default()
            },
        }))
    }
}

/// Accumulates attributes and blob references; the object becomes visible
/// on finalize.
struct MemoryImageWriter {
    objects: Arc<DashMap<VfsUrn, VfsObject>>,
    urn: VfsUrn,
    object: VfsObject,
}

#[async_trait::async_trait]
impl BlobImageWriter for MemoryImageWriter {
    fn set_stat(&mut self, stat: StatEntry) {
        self.object.stat = Some(stat);
    }

    fn set_pathspec(&mut self, pathspec: PathSpec) {
        self.object.pathspec = Some(pathspec);
    }

    fn set_content_last(&mut self, when: DateTime<Utc>) {
        self.object.content_last = Some(when);
    }

    fn add_blob(&mut self, blob: BlobDescriptor) {
        self.object.size += blob.length;
        self.object.blobs.push(blob);
    }

    async fn finalize(self: Box<Self>) -> StoreResult<()> {
        let this = *self;
        this.objects.insert(this.urn, this.object);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magpie_core::PathType;

    fn digest(byte: u8) -> Digest {
        Digest::from_bytes([byte; 32])
    }

    #[tokio::test]
    async fn blobs_exist_reports_every_queried_digest() {
        let store = MemoryBlobStore::new();
        store
            .store_blobs(vec![(digest(1), Bytes::from_static(b"one"))])
            .await
            .unwrap();

        let existing = store.blobs_exist(&[digest(1), digest(2)]).await.unwrap();
        assert_eq!(existing.get(&digest(1)), Some(&true));
        assert_eq!(existing.get(&digest(2)), Some(&false));
        assert_eq!(store.blob(&digest(1)), Some(Bytes::from_static(b"one")));
    }

    #[tokio::test]
    async fn check_hashes_hits_once_per_unique_sha256() {
        let index = MemoryHashIndex::new();
        index.insert(digest(1), VfsUrn::new("store/1"));

        let hash = CompositeHash {
            md5: None,
            sha1: None,
            sha256: digest(1),
            bytes_read: 10,
        };
        let hits = index
            .check_hashes(&[hash.clone(), hash.clone()], false)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, VfsUrn::new("store/1"));
    }

    #[tokio::test]
    async fn image_writer_is_invisible_until_finalize() {
        let vfs = MemoryVfs::new();
        let urn = VfsUrn::new("C.1/fs/os/tmp/file");

        let mut image = vfs.create_blob_image(&urn, 512 * 1024).await.unwrap();
        image.add_blob(BlobDescriptor {
            digest: digest(3),
            length: 100,
        });
        image.add_blob(BlobDescriptor {
            digest: digest(4),
            length: 50,
        });
        assert!(vfs.object(&urn).is_none());

        image.finalize().await.unwrap();
        let object = vfs.object(&urn).expect("finalized object");
        assert_eq!(object.size, 150);
        assert_eq!(object.blobs.len(), 2);
        assert_eq!(object.chunk_size, 512 * 1024);
    }

    #[tokio::test]
    async fn copy_clones_and_refreshes_timestamps() {
        let vfs = MemoryVfs::new();
        let src = VfsUrn::new("store/abc");
        vfs.put_object(
            src.clone(),
            VfsObject {
                size: 7,
                ..VfsObject::default()
            },
        );

        let dst = VfsUrn::new("C.1/fs/os/etc/hosts");
        vfs.copy(&src, &dst).await.unwrap();
        let copied = vfs.object(&dst).expect("copied object");
        assert_eq!(copied.size, 7);
        assert!(copied.content_last.is_some());

        let mut stat = StatEntry::with_pathspec(magpie_core::PathSpec {
            path: "/etc/hosts".into(),
            pathtype: PathType::Os,
            options: Default::default(),
        });
        stat.st_size = 7;
        vfs.set_stat(&dst, &stat).await.unwrap();
        assert_eq!(vfs.object(&dst).unwrap().stat, Some(stat));

        vfs.set_size(&dst, 0).await.unwrap();
        assert_eq!(vfs.size(&dst).await.unwrap(), 0);

        assert!(vfs.copy(&VfsUrn::new("missing"), &dst).await.is_err());
    }
}
