//! Shared fixtures for the transfer flow tests: an in-process scripted
//! agent plus recording delegates and store wrappers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use sha2::{Digest as Sha256Digest, Sha256};

use magpie_core::{
    BlobStore, BlockHashResponse, ClientId, CompositeHash, Digest, FileHashIndex, PathSpec,
    StatEntry, StoreResult, VfsUrn,
};
use magpie_flows::envelope::{
    BufferReference, FileHashResult, FingerprintRequest, LegacyFingerprint, ListDirRequest,
    WireHash,
};
use magpie_flows::{
    AgentReply, AgentRequest, AgentResponse, AgentTransport, ClientAction, FetchDelegate,
    MultiGetFile, MultiGetFileArgs, RequestPayload, Stores,
};
use magpie_store_memory::{MemoryBlobStore, MemoryHashIndex, MemoryVfs};

/// sha256 of `data`, the digest the real agent would report.
pub fn sha256(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Digest::from_bytes(hasher.finalize().into())
}

fn truncated_md5(digest: &Digest) -> [u8; 16] {
    digest.as_bytes()[..16].try_into().unwrap()
}

fn truncated_sha1(digest: &Digest) -> [u8; 20] {
    digest.as_bytes()[..20].try_into().unwrap()
}

/// One file visible to the fake agent.
pub struct FakeFile {
    content: Bytes,
    /// Override for the stat size; device files report 0.
    stat_size: Option<u64>,
}

/// Failure script for the fake agent.
#[derive(Default)]
pub struct AgentBehavior {
    /// Paths whose `StatFile` errors.
    pub fail_stat: HashSet<String>,
    /// `HashFile` always errors, as on agents without the action.
    pub fail_hash_file: bool,
    /// Paths whose `FingerprintFile` errors.
    pub fail_fingerprint: HashSet<String>,
    /// Report hashes in the legacy named-results shape.
    pub legacy_results: bool,
    /// Paths whose legacy result carries an unusable name.
    pub malformed_legacy: HashSet<String>,
    /// `(path, offset)` pairs whose `HashBuffer` errors.
    pub fail_block_at: HashSet<(String, u64)>,
    /// `(path, offset)` pairs whose `TransferBuffer` errors.
    pub fail_transfer_at: HashSet<(String, u64)>,
}

/// In-process agent answering the transfer flow's RPCs from a scripted
/// filesystem. Transferred buffers land in the shared blob store the same
/// way the real upload receiver stores them.
pub struct FakeAgent {
    files: HashMap<String, FakeFile>,
    blob_store: Arc<MemoryBlobStore>,
    pub behavior: AgentBehavior,
    calls: Mutex<Vec<AgentRequest>>,
}

impl FakeAgent {
    pub fn new(blob_store: Arc<MemoryBlobStore>) -> Self {
        Self {
            files: HashMap::new(),
            blob_store,
            behavior: AgentBehavior::default(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn add_file(&mut self, path: &str, content: impl Into<Bytes>) {
        self.files.insert(
            path.to_string(),
            FakeFile {
                content: content.into(),
                stat_size: None,
            },
        );
    }

    /// A file that stats as zero bytes but still serves content, like a
    /// device node.
    pub fn add_device_file(&mut self, path: &str, content: impl Into<Bytes>) {
        self.files.insert(
            path.to_string(),
            FakeFile {
                content: content.into(),
                stat_size: Some(0),
            },
        );
    }

    pub fn count(&self, action: ClientAction) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.action == action)
            .count()
    }

    /// `(offset, length)` of every `HashBuffer` request seen so far.
    pub fn buffer_requests(&self) -> Vec<(u64, u64)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.action == ClientAction::HashBuffer)
            .filter_map(|request| match &request.payload {
                RequestPayload::Buffer(buffer) => Some((buffer.offset, buffer.length)),
                _ => None,
            })
            .collect()
    }

    /// Distinct digests requested through `TransferBuffer` so far.
    pub fn transferred_digests(&self) -> HashSet<Digest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|request| match (&request.action, &request.payload) {
                (ClientAction::TransferBuffer, RequestPayload::Block(block)) => {
                    Some(block.digest)
                }
                _ => None,
            })
            .collect()
    }

    fn slice(file: &FakeFile, offset: u64, length: u64) -> Bytes {
        let len = file.content.len() as u64;
        let start = offset.min(len) as usize;
        let end = (offset + length).min(len) as usize;
        file.content.slice(start..end)
    }

    fn stat(&self, request: &ListDirRequest) -> AgentReply {
        if self.behavior.fail_stat.contains(&request.pathspec.path) {
            return AgentReply::error("permission denied");
        }
        let Some(file) = self.files.get(&request.pathspec.path) else {
            return AgentReply::error("no such file");
        };
        let mut stat_entry = StatEntry::with_pathspec(request.pathspec.clone());
        stat_entry.st_size = file.stat_size.unwrap_or(file.content.len() as u64);
        stat_entry.st_mode = 0o100644;
        stat_entry.st_mtime = 1_700_000_000;
        AgentReply::ok(vec![AgentResponse::Stat(stat_entry)])
    }

    fn fingerprint(&self, request: &FingerprintRequest) -> AgentReply {
        let Some(file) = self.files.get(&request.pathspec.path) else {
            return AgentReply::error("no such file");
        };
        let bytes_read = if request.max_filesize > 0 {
            file.content.len().min(request.max_filesize as usize)
        } else {
            file.content.len()
        };
        let digest = sha256(&file.content[..bytes_read]);
        // md5/sha1 are fabricated; the server records them opaquely.
        let md5 = Some(truncated_md5(&digest));
        let sha1 = Some(truncated_sha1(&digest));

        let result = if self.behavior.legacy_results {
            let name = if self.behavior.malformed_legacy.contains(&request.pathspec.path) {
                "pecoff"
            } else {
                "generic"
            };
            FileHashResult {
                hash: None,
                results: vec![LegacyFingerprint {
                    name: name.to_string(),
                    md5,
                    sha1,
                    sha256: Some(*digest.as_bytes()),
                }],
                bytes_read: bytes_read as u64,
            }
        } else {
            FileHashResult {
                hash: Some(WireHash {
                    md5,
                    sha1,
                    sha256: Some(*digest.as_bytes()),
                }),
                results: Vec::new(),
                bytes_read: bytes_read as u64,
            }
        };
        AgentReply::ok(vec![AgentResponse::FileHash(result)])
    }

    fn hash_buffer(&self, request: &BufferReference) -> AgentReply {
        if self
            .behavior
            .fail_block_at
            .contains(&(request.pathspec.path.clone(), request.offset))
        {
            return AgentReply::error("read error");
        }
        let Some(file) = self.files.get(&request.pathspec.path) else {
            return AgentReply::error("no such file");
        };
        let slice = Self::slice(file, request.offset, request.length);
        AgentReply::ok(vec![AgentResponse::Buffer(BlockHashResponse {
            pathspec: request.pathspec.clone(),
            digest: sha256(&slice),
            offset: request.offset,
            length: slice.len() as u64,
        })])
    }

    async fn transfer_buffer(&self, block: &BlockHashResponse) -> AgentReply {
        if self
            .behavior
            .fail_transfer_at
            .contains(&(block.pathspec.path.clone(), block.offset))
        {
            return AgentReply::error("read error");
        }
        let Some(file) = self.files.get(&block.pathspec.path) else {
            return AgentReply::error("no such file");
        };
        let slice = Self::slice(file, block.offset, block.length);
        self.blob_store
            .store_blobs(vec![(block.digest, slice.clone())])
            .await
            .expect("memory store accepts blobs");
        AgentReply::ok(vec![AgentResponse::Buffer(BlockHashResponse {
            pathspec: block.pathspec.clone(),
            digest: block.digest,
            offset: block.offset,
            length: slice.len() as u64,
        })])
    }
}

#[async_trait::async_trait]
impl AgentTransport for FakeAgent {
    async fn call(&self, request: AgentRequest) -> AgentReply {
        self.calls.lock().unwrap().push(request.clone());
        match (&request.action, &request.payload) {
            (ClientAction::StatFile, RequestPayload::ListDir(req)) => self.stat(req),
            (ClientAction::HashFile, RequestPayload::Fingerprint(req)) => {
                if self.behavior.fail_hash_file {
                    AgentReply::error("unknown client action")
                } else {
                    self.fingerprint(req)
                }
            }
            (ClientAction::FingerprintFile, RequestPayload::Fingerprint(req)) => {
                if self.behavior.fail_fingerprint.contains(&req.pathspec.path) {
                    AgentReply::error("fingerprint failed")
                } else {
                    self.fingerprint(req)
                }
            }
            (ClientAction::HashBuffer, RequestPayload::Buffer(req)) => self.hash_buffer(req),
            (ClientAction::TransferBuffer, RequestPayload::Block(block)) => {
                self.transfer_buffer(block).await
            }
            _ => AgentReply::error("malformed request"),
        }
    }
}

/// Shared handles to everything the flow observed, cloneable into tests.
#[derive(Clone, Default)]
pub struct Recorder {
    fetched: Arc<Mutex<Vec<(StatEntry, CompositeHash, Option<u32>)>>>,
    failed: Arc<Mutex<Vec<(Option<PathSpec>, ClientAction, Option<u32>)>>>,
}

impl Recorder {
    pub fn delegate(&self) -> Box<dyn FetchDelegate<u32>> {
        Box::new(RecorderDelegate(self.clone()))
    }

    pub fn fetched(&self) -> Vec<(StatEntry, CompositeHash, Option<u32>)> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn failed(&self) -> Vec<(Option<PathSpec>, ClientAction, Option<u32>)> {
        self.failed.lock().unwrap().clone()
    }
}

struct RecorderDelegate(Recorder);

impl FetchDelegate<u32> for RecorderDelegate {
    fn receive_fetched_file(
        &mut self,
        stat_entry: &StatEntry,
        file_hash: &CompositeHash,
        request_data: Option<u32>,
    ) {
        self.0
            .fetched
            .lock()
            .unwrap()
            .push((stat_entry.clone(), file_hash.clone(), request_data));
    }

    fn file_fetch_failed(
        &mut self,
        pathspec: Option<&PathSpec>,
        action: ClientAction,
        request_data: Option<u32>,
    ) {
        self.0
            .failed
            .lock()
            .unwrap()
            .push((pathspec.cloned(), action, request_data));
    }
}

/// Hash index wrapper recording the size of every batch query.
#[derive(Debug)]
pub struct CountingHashIndex {
    inner: Arc<MemoryHashIndex>,
    batch_sizes: Mutex<Vec<usize>>,
}

impl CountingHashIndex {
    pub fn new(inner: Arc<MemoryHashIndex>) -> Self {
        Self {
            inner,
            batch_sizes: Mutex::new(Vec::new()),
        }
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl FileHashIndex for CountingHashIndex {
    async fn check_hashes(
        &self,
        hashes: &[CompositeHash],
        external: bool,
    ) -> StoreResult<Vec<(VfsUrn, CompositeHash)>> {
        self.batch_sizes.lock().unwrap().push(hashes.len());
        self.inner.check_hashes(hashes, external).await
    }

    async fn add_urn(&self, sha256: Digest, urn: &VfsUrn) -> StoreResult<()> {
        self.inner.add_urn(sha256, urn).await
    }
}

/// One set of server-side collaborators plus the client identity.
pub struct Env {
    pub client_id: ClientId,
    pub blob_store: Arc<MemoryBlobStore>,
    pub hash_index: Arc<MemoryHashIndex>,
    pub vfs: Arc<MemoryVfs>,
}

impl Env {
    pub fn new() -> Self {
        Self {
            client_id: ClientId::new("C.1000000000000000"),
            blob_store: Arc::new(MemoryBlobStore::new()),
            hash_index: Arc::new(MemoryHashIndex::new()),
            vfs: Arc::new(MemoryVfs::new()),
        }
    }

    pub fn stores(&self) -> Stores {
        Stores {
            hash_index: self.hash_index.clone(),
            blob_store: self.blob_store.clone(),
            vfs: self.vfs.clone(),
        }
    }

    pub fn agent(&self) -> FakeAgent {
        FakeAgent::new(self.blob_store.clone())
    }

    pub fn flow(&self, args: MultiGetFileArgs) -> MultiGetFile<u32> {
        MultiGetFile::new(self.client_id.clone(), self.stores(), args)
    }
}
