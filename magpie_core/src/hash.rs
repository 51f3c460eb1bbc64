//! Content digests as reported by remote agents.
//!
//! The server never hashes file content itself: agents compute digests and
//! the server records them verbatim, using the sha256 digest as the
//! deduplication key across the blob store and the file-hash index.

use std::{borrow::Borrow, fmt};

use serde::{Deserialize, Serialize};

/// A raw 32-byte content digest (sha256 of a file or buffer).
#[derive(Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl Digest {
    /// Create a `Digest` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Bytes of the digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert the digest to a hex string.
    pub fn to_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }

    /// Hex of the first 5 bytes for a friendly string representation of
    /// the digest.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..5])
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Borrow<[u8]> for Digest {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl Borrow<[u8; 32]> for Digest {
    fn borrow(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Digest {
    fn from(value: [u8; 32]) -> Self {
        Digest(value)
    }
}

impl From<Digest> for [u8; 32] {
    fn from(value: Digest) -> Self {
        value.0
    }
}

impl From<&[u8; 32]> for Digest {
    fn from(value: &[u8; 32]) -> Self {
        Digest(*value)
    }
}

impl PartialOrd for Digest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Digest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// The hash bundle an agent computes over the first `bytes_read` bytes of
/// a file.
///
/// `sha256` is mandatory and is the only member the server keys on; md5
/// and sha1 are carried opaquely for consumers of the file-hash index.
/// `bytes_read` is the authoritative number of bytes the agent will serve
/// for this file: it may be smaller than the stat size when capped by the
/// caller, or larger for device-like files that stat as zero bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeHash {
    pub md5: Option<[u8; 16]>,
    pub sha1: Option<[u8; 20]>,
    pub sha256: Digest,
    pub bytes_read: u64,
}
