//! Core Magpie server types and traits.
//!
//! This crate defines the shared vocabulary of the Magpie acquisition
//! server: how files on a remote agent are addressed, what the agent
//! reports about them, and the seams through which server flows talk to
//! the storage collaborators.
//!
//! ## Value types
//!
//! - Content digests and per-file hash bundles (`hash::Digest`,
//!   `hash::CompositeHash`)
//! - Agent-side file locators and their server-side addresses
//!   (`pathspec::PathSpec`, `pathspec::VfsUrn`)
//! - Agent-reported metadata and block reports (`agent::StatEntry`,
//!   `agent::BlockHashResponse`, `agent::BlobDescriptor`)
//!
//! These are exchanged with agents and persisted by collaborators, so they
//! all carry serde derives and are treated as wire-adjacent: changes to
//! them are protocol changes.
//!
//! ## Collaborator traits
//!
//! The `store` module defines the storage seams the flows consume: the
//! content-addressed blob store, the file-hash secondary index, and the
//! per-client virtual filesystem. Implementations live in separate crates
//! (see `stores/`) and are plugged in as trait objects.

pub mod agent;
pub mod hash;
pub mod pathspec;
pub mod store;

// --- Core Public Surface ---

// Agent data model
pub use agent::{BlobDescriptor, BlockHashResponse, StatEntry};

// Digests
pub use hash::{CompositeHash, Digest};

// Path addressing
pub use pathspec::{ClientId, PathOptions, PathSpec, PathType, VfsUrn};

// Storage seams
pub use store::{BlobImageWriter, BlobStore, FileHashIndex, StoreResult, VfsStore};
