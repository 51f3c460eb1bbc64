//! Server-side flows for acquiring files from remote Magpie agents.
//!
//! This crate provides the cooperative flow runtime and the multi-file
//! transfer flow built on top of it:
//!
//! - [`FlowDriver`]: drives a [`Flow`] against an [`AgentTransport`],
//!   delivering one response bundle per scheduling round in issue order.
//! - [`MultiGetFile`]: the chunked, deduplicated, hash-verified transfer
//!   pipeline. Given pathspecs on a remote agent it interleaves stat, hash
//!   and transfer requests, skips content already known to the file-hash
//!   index or the blob store, and materializes each file as a sparse blob
//!   image in the client's VFS.
//!
//! The RPC substrate that actually reaches agents is not part of this
//! crate; embedders supply it behind the [`AgentTransport`] trait, along
//! with the storage collaborators from `magpie_core`.

pub mod envelope;
pub mod runner;
pub mod transfer;

pub use envelope::{
    AgentRequest, AgentResponse, ClientAction, RequestContext, RequestPayload, ResponseBundle,
};
pub use runner::{
    AgentReply, AgentTransport, EventPriority, Flow, FlowDriver, FlowError, FlowOutcome,
    FlowResult, FlowRunner, PublishedEvent,
};
pub use transfer::{
    FetchDelegate, MultiGetFile, MultiGetFileArgs, NoopDelegate, Stores, TransferState,
    TransferStats, ADD_FILE_TO_STORE, CHUNK_SIZE, MIN_CALL_TO_FILE_STORE,
};
