//! The multi-file acquisition flow.
//!
//! [`MultiGetFile`] drives a chunked, deduplicated, hash-verified transfer
//! pipeline against one remote agent. Files move through two phases, each
//! bounded by the admission window:
//!
//! 1. **Hashing**: stat and composite-hash the file, then look the hash
//!    up in the file-hash index in batches. A hit is materialized by
//!    copying the stored object into the client's VFS; no content moves.
//! 2. **Fetching**: hash every 512 KiB block on the agent, probe the blob
//!    store in batches, and transfer only the blocks it is missing. Blocks
//!    already stored re-enter the flow through a local fast-path delivery.
//!
//! Completed files become sparse blob images in the client's VFS and are
//! announced through a low-priority event so the indexing worker can pick
//! them up. Per-file failures are reported to the caller's delegate and
//! free their admission slot; they never stall the pipeline.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use magpie_core::{
    BlobDescriptor, BlobStore, BlockHashResponse, ClientId, CompositeHash, Digest, FileHashIndex,
    PathSpec, StatEntry, VfsStore, VfsUrn,
};

use crate::envelope::{
    AgentResponse, BufferReference, ClientAction, FileHashResult, FingerprintHasher,
    FingerprintRequest, ListDirRequest, RequestContext, RequestPayload, ResponseBundle,
};
use crate::runner::{EventPriority, Flow, FlowError, FlowResult, FlowRunner};

/// Size of the spans files are hashed and transferred in.
pub const CHUNK_SIZE: u64 = 512 * 1024;

/// Default batching threshold for file-store round trips. Hash-index and
/// blob-store queries are grouped to at least this many items to amortize
/// round trips; trailing smaller batches flush at end of flow.
pub const MIN_CALL_TO_FILE_STORE: usize = 200;

/// Event announcing a newly materialized file to the indexing worker.
pub const ADD_FILE_TO_STORE: &str = "FileStore.AddFileToStore";

/// Arguments of the [`MultiGetFile`] flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiGetFileArgs {
    pub pathspecs: Vec<PathSpec>,
    /// Per-file cap on the bytes hashed and downloaded; 0 means use the
    /// size the agent stats.
    pub file_size: u64,
    /// Bound on the number of files simultaneously in each phase.
    pub maximum_pending_files: usize,
    /// Consult externally registered stores in hash-index lookups.
    pub use_external_stores: bool,
}

impl Default for MultiGetFileArgs {
    fn default() -> Self {
        Self {
            pathspecs: Vec::new(),
            file_size: 0,
            maximum_pending_files: 1000,
            use_external_stores: false,
        }
    }
}

/// The storage collaborators a transfer flow works against.
#[derive(Debug, Clone)]
pub struct Stores {
    pub hash_index: Arc<dyn FileHashIndex>,
    pub blob_store: Arc<dyn BlobStore>,
    pub vfs: Arc<dyn VfsStore>,
}

/// Per-file observer supplied by the caller.
///
/// `D` is opaque per-file context handed to `start_file_fetch`; it is kept
/// server-side and returned verbatim with the completion callback.
pub trait FetchDelegate<D>: Send {
    /// Called once per successfully materialized file, whether downloaded
    /// or skipped because its content was already stored.
    fn receive_fetched_file(
        &mut self,
        stat_entry: &StatEntry,
        file_hash: &CompositeHash,
        request_data: Option<D>,
    ) {
        let _ = (stat_entry, file_hash, request_data);
    }

    /// Called when a stat, hash, or block request for a file fails.
    ///
    /// `pathspec` is absent when the failure reports on an index an
    /// earlier failure already retired.
    fn file_fetch_failed(
        &mut self,
        pathspec: Option<&PathSpec>,
        action: ClientAction,
        request_data: Option<D>,
    ) {
        let _ = (pathspec, action, request_data);
    }
}

/// Delegate that ignores every notification.
pub struct NoopDelegate;

impl<D> FetchDelegate<D> for NoopDelegate {}

/// Outcome counters of a transfer flow. Observability only; the flow never
/// branches on them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub files_hashed: u64,
    pub files_to_fetch: u64,
    pub files_fetched: u64,
    pub files_skipped: u64,
}

/// Named states of the transfer flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    StoreStat,
    ReceiveFileHash,
    CheckHash,
    WriteBuffer,
}

pub type TransferRunner = FlowRunner<TransferState, StatEntry>;

/// Book-keeping for one file moving through the pipeline.
///
/// A tracker lives in `pending_hashes` until its composite hash has been
/// checked against the file-hash index, then either retires (hit, failure)
/// or moves to `pending_files` for block transfer. `index` is its identity
/// for the whole flow and tags every request issued for it.
#[derive(Debug)]
struct FileTracker {
    index: usize,
    stat_entry: Option<StatEntry>,
    hash_obj: Option<CompositeHash>,
    /// Frozen when the tracker enters the fetching phase.
    size_to_download: u64,
    /// Block reports queued for the next blob-store probe, in issue order.
    hash_list: Vec<BlockHashResponse>,
    /// Blob references accumulated in issue order.
    blobs: Vec<BlobDescriptor>,
}

impl FileTracker {
    fn new(index: usize) -> Self {
        Self {
            index,
            stat_entry: None,
            hash_obj: None,
            size_to_download: 0,
            hash_list: Vec::new(),
            blobs: Vec::new(),
        }
    }

    fn bytes_read(&self) -> u64 {
        self.hash_obj.as_ref().map(|hash| hash.bytes_read).unwrap_or(0)
    }
}

/// A flow that efficiently retrieves a number of files from one agent.
pub struct MultiGetFile<D = ()> {
    client_id: ClientId,
    stores: Stores,
    delegate: Box<dyn FetchDelegate<D>>,

    // Configuration, frozen at construction.
    file_size: u64,
    maximum_pending_files: usize,
    use_external_stores: bool,
    min_call_to_file_store: usize,

    /// Args pathspecs not yet handed to `start_file_fetch`.
    queued_pathspecs: Vec<PathSpec>,

    /// Grow-only log of every pathspec handed to the flow; slots are
    /// cleared on completion but indices are never reused.
    indexed_pathspecs: Vec<Option<PathSpec>>,
    request_data_list: Vec<Option<D>>,

    pending_hashes: BTreeMap<usize, FileTracker>,
    pending_files: BTreeMap<usize, FileTracker>,

    next_pathspec_to_start: usize,
    files_hashed_since_check: usize,
    blob_hashes_pending: usize,
    stats: TransferStats,
}

impl<D: Send + 'static> MultiGetFile<D> {
    pub fn new(client_id: ClientId, stores: Stores, args: MultiGetFileArgs) -> Self {
        Self {
            client_id,
            stores,
            delegate: Box::new(NoopDelegate),
            file_size: args.file_size,
            maximum_pending_files: args.maximum_pending_files,
            use_external_stores: args.use_external_stores,
            min_call_to_file_store: MIN_CALL_TO_FILE_STORE,
            queued_pathspecs: args.pathspecs,
            indexed_pathspecs: Vec::new(),
            request_data_list: Vec::new(),
            pending_hashes: BTreeMap::new(),
            pending_files: BTreeMap::new(),
            next_pathspec_to_start: 0,
            files_hashed_since_check: 0,
            blob_hashes_pending: 0,
            stats: TransferStats::default(),
        }
    }

    /// Replace the no-op delegate.
    pub fn with_delegate(mut self, delegate: Box<dyn FetchDelegate<D>>) -> Self {
        self.delegate = delegate;
        self
    }

    /// Override the file-store batching threshold.
    pub fn with_min_call_to_file_store(mut self, threshold: usize) -> Self {
        self.min_call_to_file_store = threshold;
        self
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn pending_hash_count(&self) -> usize {
        self.pending_hashes.len()
    }

    pub fn pending_file_count(&self) -> usize {
        self.pending_files.len()
    }

    /// Schedule one more file transfer.
    ///
    /// The pathspec waits in the queue until the admission window has room
    /// for it. Callers feeding the same file twice get two completions;
    /// deduplicate by VFS URN beforehand if that is not wanted (the args
    /// entry point does).
    pub fn start_file_fetch(
        &mut self,
        runner: &mut TransferRunner,
        pathspec: PathSpec,
        request_data: Option<D>,
    ) {
        self.indexed_pathspecs.push(Some(pathspec));
        self.request_data_list.push(request_data);
        self.try_to_start_next_pathspec(runner);
    }

    fn try_to_start_next_pathspec(&mut self, runner: &mut TransferRunner) {
        if self.pending_files.len() >= self.maximum_pending_files {
            return;
        }
        if self.pending_hashes.len() >= self.maximum_pending_files {
            return;
        }

        let index = self.next_pathspec_to_start;
        let Some(Some(pathspec)) = self.indexed_pathspecs.get(index) else {
            // Every queued pathspec has been started.
            return;
        };
        let pathspec = pathspec.clone();
        self.next_pathspec_to_start = index + 1;

        // The tracker waits here until its composite hash comes back.
        self.pending_hashes.insert(index, FileTracker::new(index));

        let context = RequestContext::new(index);
        runner.call_client(
            ClientAction::StatFile,
            RequestPayload::ListDir(ListDirRequest {
                pathspec: pathspec.clone(),
            }),
            TransferState::StoreStat,
            context,
        );
        runner.call_client(
            ClientAction::HashFile,
            RequestPayload::Fingerprint(FingerprintRequest {
                pathspec,
                max_filesize: self.file_size,
                hashers: vec![
                    FingerprintHasher::Md5,
                    FingerprintHasher::Sha1,
                    FingerprintHasher::Sha256,
                ],
            }),
            TransferState::ReceiveFileHash,
            context,
        );
    }

    /// Retire `index` and free its admission slot. Safe to call for an
    /// index that was already retired.
    fn remove_completed_pathspec(
        &mut self,
        runner: &mut TransferRunner,
        index: usize,
    ) -> (Option<PathSpec>, Option<D>) {
        let pathspec = self.indexed_pathspecs.get_mut(index).and_then(Option::take);
        let request_data = self.request_data_list.get_mut(index).and_then(Option::take);
        self.pending_hashes.remove(&index);
        self.pending_files.remove(&index);
        self.try_to_start_next_pathspec(runner);
        (pathspec, request_data)
    }

    fn on_file_fetched(
        &mut self,
        runner: &mut TransferRunner,
        tracker: FileTracker,
    ) -> FlowResult<()> {
        let (_, request_data) = self.remove_completed_pathspec(runner, tracker.index);
        let Some(stat_entry) = tracker.stat_entry else {
            return Err(FlowError::Protocol("fetched file has no stat entry"));
        };
        let Some(hash_obj) = tracker.hash_obj else {
            return Err(FlowError::Protocol("fetched file has no composite hash"));
        };
        self.delegate
            .receive_fetched_file(&stat_entry, &hash_obj, request_data);
        runner.send_reply(stat_entry);
        Ok(())
    }

    fn file_fetch_failed(
        &mut self,
        runner: &mut TransferRunner,
        index: usize,
        action: ClientAction,
    ) {
        let (pathspec, request_data) = self.remove_completed_pathspec(runner, index);
        self.delegate
            .file_fetch_failed(pathspec.as_ref(), action, request_data);
    }

    fn store_stat(
        &mut self,
        runner: &mut TransferRunner,
        bundle: ResponseBundle<TransferState>,
    ) -> FlowResult<()> {
        let index = bundle.request_data.index;
        if !bundle.success {
            warn!("failed to stat file: {:?}", bundle.status);
            let action = bundle.request_action()?;
            self.file_fetch_failed(runner, index, action);
            return Ok(());
        }
        let Some(AgentResponse::Stat(stat_entry)) = bundle.first() else {
            return Err(FlowError::Protocol("stat bundle carries no stat entry"));
        };
        if let Some(tracker) = self.pending_hashes.get_mut(&index) {
            tracker.stat_entry = Some(stat_entry.clone());
        }
        Ok(())
    }

    async fn receive_file_hash(
        &mut self,
        runner: &mut TransferRunner,
        bundle: ResponseBundle<TransferState>,
    ) -> FlowResult<()> {
        // One-shot fallback for agents that predate the hash action.
        if !bundle.success
            && let Some(request) = &bundle.request
            && request.action == ClientAction::HashFile
        {
            debug!("hash action not available, falling back to fingerprint");
            runner.call_client(
                ClientAction::FingerprintFile,
                request.payload.clone(),
                TransferState::ReceiveFileHash,
                bundle.request_data,
            );
            return Ok(());
        }

        let index = bundle.request_data.index;
        if !bundle.success {
            warn!("failed to hash file: {:?}", bundle.status);
            self.pending_hashes.remove(&index);
            let action = bundle.request_action()?;
            self.file_fetch_failed(runner, index, action);
            return Ok(());
        }

        self.stats.files_hashed += 1;
        let Some(AgentResponse::FileHash(result)) = bundle.first() else {
            return Err(FlowError::Protocol("hash bundle carries no hash result"));
        };
        let Some(hash_obj) = composite_hash_from(result) else {
            // Unusable hash shapes retire the tracker without a failure
            // report.
            warn!(
                "failed to hash file: {:?}",
                self.indexed_pathspecs.get(index)
            );
            self.pending_hashes.remove(&index);
            return Ok(());
        };

        let Some(tracker) = self.pending_hashes.get_mut(&index) else {
            // Hashing worked but the stat side already dropped this index.
            let action = bundle.request_action()?;
            self.file_fetch_failed(runner, index, action);
            return Ok(());
        };
        tracker.hash_obj = Some(hash_obj);

        self.files_hashed_since_check += 1;
        if self.files_hashed_since_check >= self.min_call_to_file_store {
            self.check_hashes_with_file_store(runner).await?;
        }
        Ok(())
    }

    /// Check all queued composite hashes against the file-hash index in
    /// one round trip.
    ///
    /// Hits are materialized by copying the stored object into the
    /// client's namespace; misses move to the fetching phase and have
    /// every block hashed on the agent.
    async fn check_hashes_with_file_store(
        &mut self,
        runner: &mut TransferRunner,
    ) -> FlowResult<()> {
        if self.pending_hashes.is_empty() {
            return Ok(());
        }

        let mut file_hashes: BTreeMap<usize, CompositeHash> = BTreeMap::new();
        // Several queued files can share a sha256; remember all of them.
        let mut hash_to_tracker: HashMap<Digest, Vec<usize>> = HashMap::new();
        for (index, tracker) in &self.pending_hashes {
            // The composite hash might not have arrived yet.
            let Some(hash_obj) = &tracker.hash_obj else {
                continue;
            };
            file_hashes.insert(*index, hash_obj.clone());
            hash_to_tracker
                .entry(hash_obj.sha256)
                .or_default()
                .push(*index);
        }

        let query: Vec<CompositeHash> = file_hashes.values().cloned().collect();
        let hits = self
            .stores
            .hash_index
            .check_hashes(&query, self.use_external_stores)
            .await?;

        // The index reports one hit per unique hash; fan each hit back out
        // to every queued file with that hash, one copy source per distinct
        // stored object.
        let mut files_in_filestore: Vec<(VfsUrn, Vec<FileTracker>)> = Vec::new();
        for (stored_urn, hash_obj) in hits {
            runner.heart_beat();
            let Some(indices) = hash_to_tracker.get(&hash_obj.sha256) else {
                continue;
            };
            let mut trackers = Vec::new();
            for &index in indices {
                if let Some(tracker) = self.pending_hashes.remove(&index) {
                    self.stats.files_skipped += 1;
                    file_hashes.remove(&index);
                    trackers.push(tracker);
                }
            }
            if !trackers.is_empty() {
                files_in_filestore.push((stored_urn, trackers));
            }
        }

        self.files_hashed_since_check = 0;

        for (stored_urn, trackers) in files_in_filestore {
            for tracker in trackers {
                let Some(stat_entry) = tracker.stat_entry.clone() else {
                    return Err(FlowError::Protocol("hashed file has no stat entry"));
                };
                let Some(hash_obj) = tracker.hash_obj.clone() else {
                    return Err(FlowError::Protocol("index hit for a hashless tracker"));
                };
                let target_urn = stat_entry.pathspec.vfs_urn(&self.client_id);
                self.stores.vfs.copy(&stored_urn, &target_urn).await?;
                self.stores.vfs.set_stat(&target_urn, &stat_entry).await?;
                // Stored objects have been observed with zero length;
                // repair the copy's size from what the agent told us.
                if self.stores.vfs.size(&target_urn).await? == 0 {
                    let size = if tracker.bytes_read() > 0 {
                        tracker.bytes_read()
                    } else {
                        stat_entry.st_size
                    };
                    self.stores.vfs.set_size(&target_urn, size).await?;
                }
                self.stores
                    .hash_index
                    .add_urn(hash_obj.sha256, &target_urn)
                    .await?;
                self.on_file_fetched(runner, tracker)?;
            }
        }

        // Whatever is left was not in the index and must be fetched.
        for index in file_hashes.into_keys() {
            let Some(mut tracker) = self.pending_hashes.remove(&index) else {
                continue;
            };
            let Some(stat_entry) = tracker.stat_entry.clone() else {
                return Err(FlowError::Protocol("hashed file has no stat entry"));
            };
            tracker.size_to_download = if tracker.bytes_read() > 0 {
                tracker.bytes_read()
            } else {
                stat_entry.st_size
            };
            self.stats.files_to_fetch += 1;

            // Hash every block up front: even a whole-file miss usually
            // hits most of its blocks in the blob store, and agent-side
            // hashing is cheap.
            for (offset, length) in chunk_spans(tracker.size_to_download) {
                runner.call_client(
                    ClientAction::HashBuffer,
                    RequestPayload::Buffer(BufferReference {
                        pathspec: stat_entry.pathspec.clone(),
                        offset,
                        length,
                    }),
                    TransferState::CheckHash,
                    RequestContext::new(index),
                );
            }
            self.pending_files.insert(index, tracker);
        }

        if self.stats.files_hashed % 100 == 0 {
            info!(
                "hashed {} files, skipped {} already stored",
                self.stats.files_hashed, self.stats.files_skipped
            );
        }
        Ok(())
    }

    async fn check_hash(
        &mut self,
        runner: &mut TransferRunner,
        bundle: ResponseBundle<TransferState>,
    ) -> FlowResult<()> {
        let index = bundle.request_data.index;
        // Block reports for a file that already failed; dropping them here
        // avoids logging every remaining block.
        if !self.pending_files.contains_key(&index) {
            return Ok(());
        }

        let response = if bundle.success {
            bundle.first_buffer().cloned()
        } else {
            None
        };
        let Some(response) = response else {
            let urn = self
                .pending_files
                .get(&index)
                .and_then(|tracker| tracker.stat_entry.as_ref())
                .map(|stat| stat.pathspec.vfs_urn(&self.client_id));
            warn!("failed to read {:?}: {:?}", urn, bundle.status);
            let action = bundle.request_action()?;
            self.file_fetch_failed(runner, index, action);
            return Ok(());
        };

        if let Some(tracker) = self.pending_files.get_mut(&index) {
            tracker.hash_list.push(response);
        }

        self.blob_hashes_pending += 1;
        if self.blob_hashes_pending > self.min_call_to_file_store {
            self.fetch_file_content(runner).await?;
        }
        Ok(())
    }

    /// Probe the blob store for every queued block hash in one round trip
    /// and schedule delivery of each block: a local fast-path re-entry for
    /// blobs already stored, a transfer call for the rest.
    ///
    /// Per file, deliveries are scheduled in the order the block hashes
    /// were issued; the assembler depends on that.
    async fn fetch_file_content(&mut self, runner: &mut TransferRunner) -> FlowResult<()> {
        if self.pending_files.is_empty() {
            return Ok(());
        }

        let digests: Vec<Digest> = self
            .pending_files
            .values()
            .flat_map(|tracker| tracker.hash_list.iter().map(|response| response.digest))
            .collect();
        let existing_blobs = self.stores.blob_store.blobs_exist(&digests).await?;

        self.blob_hashes_pending = 0;

        for (index, tracker) in self.pending_files.iter_mut() {
            let pathspec = match &tracker.stat_entry {
                Some(stat_entry) => stat_entry.pathspec.clone(),
                None => return Err(FlowError::Protocol("fetching file has no stat entry")),
            };
            for mut hash_response in tracker.hash_list.drain(..) {
                // Read through the pathspec we statted, not whatever alias
                // the agent reported for the block.
                hash_response.pathspec = pathspec.clone();
                let context = RequestContext::new(*index);
                if existing_blobs
                    .get(&hash_response.digest)
                    .copied()
                    .unwrap_or(false)
                {
                    runner.call_state(
                        vec![AgentResponse::Buffer(hash_response)],
                        TransferState::WriteBuffer,
                        context,
                    );
                } else {
                    runner.call_client(
                        ClientAction::TransferBuffer,
                        RequestPayload::Block(hash_response),
                        TransferState::WriteBuffer,
                        context,
                    );
                }
            }
        }
        Ok(())
    }

    async fn write_buffer(
        &mut self,
        runner: &mut TransferRunner,
        bundle: ResponseBundle<TransferState>,
    ) -> FlowResult<()> {
        // Blocks arrive here in the order they were scheduled, local and
        // remote deliveries alike.
        let index = bundle.request_data.index;
        if !self.pending_files.contains_key(&index) {
            return Ok(());
        }
        if !bundle.success {
            let action = bundle.request_action()?;
            self.file_fetch_failed(runner, index, action);
            return Ok(());
        }
        let Some(response) = bundle.first_buffer().cloned() else {
            return Err(FlowError::Protocol("block bundle carries no block"));
        };

        let complete = {
            let Some(tracker) = self.pending_files.get_mut(&index) else {
                return Ok(());
            };
            tracker.blobs.push(BlobDescriptor {
                digest: response.digest,
                length: response.length,
            });
            // A short block or reaching the download size ends the file.
            response.length < CHUNK_SIZE
                || response.offset + response.length >= tracker.size_to_download
        };
        if !complete {
            return Ok(());
        }

        let Some(mut tracker) = self.pending_files.remove(&index) else {
            return Ok(());
        };
        let Some(stat_entry) = tracker.stat_entry.clone() else {
            return Err(FlowError::Protocol("fetched file has no stat entry"));
        };
        let urn = stat_entry.pathspec.vfs_urn(&self.client_id);

        let mut image = self.stores.vfs.create_blob_image(&urn, CHUNK_SIZE).await?;
        image.set_stat(stat_entry.clone());
        image.set_pathspec(stat_entry.pathspec.clone());
        image.set_content_last(Utc::now());
        for blob in tracker.blobs.drain(..) {
            image.add_blob(blob);
        }
        image.finalize().await?;

        self.on_file_fetched(runner, tracker)?;

        // Not time critical; the indexing worker picks this up when it has
        // spare capacity.
        runner.publish(ADD_FILE_TO_STORE, urn, EventPriority::Low);

        self.stats.files_fetched += 1;
        if self.stats.files_fetched % 100 == 0 {
            info!(
                "fetched {} of {} files",
                self.stats.files_fetched, self.stats.files_to_fetch
            );
        }
        Ok(())
    }
}

#[async_trait]
impl<D: Send + 'static> Flow for MultiGetFile<D> {
    type State = TransferState;
    type Reply = StatEntry;

    async fn start(&mut self, runner: &mut TransferRunner) -> FlowResult<()> {
        let mut unique_urns = HashSet::new();
        for pathspec in std::mem::take(&mut self.queued_pathspecs) {
            // Stat and hash each distinct file once; inputs can repeat.
            if unique_urns.insert(pathspec.vfs_urn(&self.client_id)) {
                self.start_file_fetch(runner, pathspec, None);
            }
        }
        Ok(())
    }

    async fn dispatch(
        &mut self,
        runner: &mut TransferRunner,
        bundle: ResponseBundle<TransferState>,
    ) -> FlowResult<()> {
        match bundle.next_state {
            TransferState::StoreStat => self.store_stat(runner, bundle),
            TransferState::ReceiveFileHash => self.receive_file_hash(runner, bundle).await,
            TransferState::CheckHash => self.check_hash(runner, bundle).await,
            TransferState::WriteBuffer => self.write_buffer(runner, bundle).await,
        }
    }

    async fn end(&mut self, runner: &mut TransferRunner) -> FlowResult<()> {
        // Trailing batches below the threshold only ever flush here; if
        // this schedules new requests the runtime calls us again at the
        // next quiescence.
        if !self.pending_hashes.is_empty() || !self.pending_files.is_empty() {
            self.check_hashes_with_file_store(runner).await?;
            self.fetch_file_content(runner).await?;
        }
        Ok(())
    }
}

/// Spans to hash for a download of `size_to_download` bytes: one per whole
/// chunk plus a trailing remainder span, which is empty when the size is
/// an exact multiple.
fn chunk_spans(size_to_download: u64) -> impl Iterator<Item = (u64, u64)> {
    let spans = size_to_download / CHUNK_SIZE + 1;
    (0..spans).map(move |i| {
        let length = if i == spans - 1 {
            size_to_download % CHUNK_SIZE
        } else {
            CHUNK_SIZE
        };
        (i * CHUNK_SIZE, length)
    })
}

/// Extract a usable composite hash from either accepted response shape.
/// Returns `None` for shapes without a sha256 or with a malformed legacy
/// result list.
fn composite_hash_from(result: &FileHashResult) -> Option<CompositeHash> {
    if let Some(wire) = &result.hash {
        return Some(CompositeHash {
            md5: wire.md5,
            sha1: wire.sha1,
            sha256: Digest::from(wire.sha256?),
            bytes_read: result.bytes_read,
        });
    }

    // Older agents report a list of named fingerprint results instead.
    let first = result.results.first()?;
    if first.name != "generic" {
        return None;
    }
    Some(CompositeHash {
        md5: Some(first.md5?),
        sha1: Some(first.sha1?),
        sha256: Digest::from(first.sha256?),
        bytes_read: result.bytes_read,
    })
}
