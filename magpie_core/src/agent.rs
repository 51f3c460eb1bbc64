//! Values reported by remote agents about files and buffers.

use serde::{Deserialize, Serialize};

use crate::hash::Digest;
use crate::pathspec::PathSpec;

/// File metadata as reported by the agent.
///
/// The server only interprets `st_size`, and only as a fallback download
/// size when the agent did not report how many bytes it will serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatEntry {
    pub pathspec: PathSpec,
    pub st_size: u64,
    pub st_mode: u32,
    pub st_atime: u64,
    pub st_mtime: u64,
    pub st_ctime: u64,
}

impl StatEntry {
    /// A stat entry carrying only the pathspec, with all metadata zeroed.
    pub fn with_pathspec(pathspec: PathSpec) -> Self {
        Self {
            pathspec,
            st_size: 0,
            st_mode: 0,
            st_atime: 0,
            st_mtime: 0,
            st_ctime: 0,
        }
    }
}

/// The agent's report for one hashed buffer of a file.
///
/// Produced in response to a hash-a-buffer request. When the block turns
/// out to be missing from the blob store, the same value is sent back to
/// the agent as the transfer-a-buffer request, so it carries everything
/// needed to re-read the range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHashResponse {
    pub pathspec: PathSpec,
    /// sha256 of the buffer contents.
    pub digest: Digest,
    /// Byte offset of the buffer within the file.
    pub offset: u64,
    /// Number of bytes actually hashed (short at end of file).
    pub length: u64,
}

/// One entry of a sparse blob image: a reference into the blob store plus
/// the number of content bytes it contributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDescriptor {
    pub digest: Digest,
    pub length: u64,
}
