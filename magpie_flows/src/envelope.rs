//! The typed RPC envelope between server flows and remote agents.
//!
//! Every outbound call names a [`ClientAction`] and carries a
//! [`RequestPayload`]; the matching [`ResponseBundle`] is delivered to the
//! flow state the caller named, echoing the opaque [`RequestContext`] the
//! caller attached. Locally synthesized bundles (the blob-store fast path)
//! use the same shape, minus the originating request.

use serde::{Deserialize, Serialize};

use magpie_core::{BlockHashResponse, PathSpec, StatEntry};

use crate::runner::{FlowError, FlowResult};

/// Actions a Magpie agent executes on behalf of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientAction {
    /// Stat a file.
    StatFile,
    /// Compute the composite hash of a file.
    HashFile,
    /// Older agents expose composite hashing under this action instead.
    FingerprintFile,
    /// Hash one buffer of a file without sending its content.
    HashBuffer,
    /// Upload one buffer of a file to the server's blob receiver.
    TransferBuffer,
}

impl ClientAction {
    pub fn name(&self) -> &'static str {
        match self {
            ClientAction::StatFile => "StatFile",
            ClientAction::HashFile => "HashFile",
            ClientAction::FingerprintFile => "FingerprintFile",
            ClientAction::HashBuffer => "HashBuffer",
            ClientAction::TransferBuffer => "TransferBuffer",
        }
    }
}

impl std::fmt::Display for ClientAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Request payload for `StatFile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListDirRequest {
    pub pathspec: PathSpec,
}

/// Hash algorithms an agent can be asked to run over a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FingerprintHasher {
    Md5,
    Sha1,
    Sha256,
}

/// Request payload for `HashFile` and `FingerprintFile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRequest {
    pub pathspec: PathSpec,
    /// Cap on the number of bytes to hash; 0 means the whole file.
    pub max_filesize: u64,
    pub hashers: Vec<FingerprintHasher>,
}

/// Request payload for `HashBuffer`: one byte range of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferReference {
    pub pathspec: PathSpec,
    pub offset: u64,
    pub length: u64,
}

/// Payloads accepted by agents, one variant per action family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestPayload {
    ListDir(ListDirRequest),
    Fingerprint(FingerprintRequest),
    Buffer(BufferReference),
    /// A previously hashed block, sent back to request its content.
    Block(BlockHashResponse),
}

/// One hash algorithm's digest bytes in a legacy fingerprint result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyFingerprint {
    pub name: String,
    pub md5: Option<[u8; 16]>,
    pub sha1: Option<[u8; 20]>,
    pub sha256: Option<[u8; 32]>,
}

/// The hash digests of a file as carried in the preferred response shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireHash {
    pub md5: Option<[u8; 16]>,
    pub sha1: Option<[u8; 20]>,
    pub sha256: Option<[u8; 32]>,
}

/// Response to `HashFile` / `FingerprintFile`.
///
/// Current agents fill `hash`; older agents report a list of named
/// fingerprint results instead, of which only the `"generic"` entry is
/// meaningful here. `bytes_read` is authoritative in both shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHashResult {
    pub hash: Option<WireHash>,
    pub results: Vec<LegacyFingerprint>,
    pub bytes_read: u64,
}

/// Responses an agent can return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentResponse {
    Stat(StatEntry),
    FileHash(FileHashResult),
    Buffer(BlockHashResponse),
}

/// An outbound call to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub action: ClientAction,
    pub payload: RequestPayload,
}

/// Correlation context attached to every outbound request and returned
/// verbatim in the matching bundle.
///
/// `index` identifies the file tracker a response belongs to. Caller
/// supplied per-file context never rides here; it is kept server-side and
/// reattached at completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestContext {
    pub index: usize,
}

impl RequestContext {
    pub fn new(index: usize) -> Self {
        Self { index }
    }
}

/// A batch of responses delivered to one flow state in one scheduling
/// round.
#[derive(Debug, Clone)]
pub struct ResponseBundle<S> {
    /// Whether the call succeeded on the agent.
    pub success: bool,
    /// Agent-side error description when `success` is false.
    pub status: Option<String>,
    /// The originating request; absent for locally synthesized bundles.
    pub request: Option<AgentRequest>,
    pub request_data: RequestContext,
    pub responses: Vec<AgentResponse>,
    /// The flow state this bundle is addressed to.
    pub next_state: S,
}

impl<S> ResponseBundle<S> {
    /// The first response in the bundle, if any.
    pub fn first(&self) -> Option<&AgentResponse> {
        self.responses.first()
    }

    /// The first response, if it is a block report.
    pub fn first_buffer(&self) -> Option<&BlockHashResponse> {
        match self.responses.first() {
            Some(AgentResponse::Buffer(buffer)) => Some(buffer),
            _ => None,
        }
    }

    /// The action of the originating request.
    ///
    /// Errors on locally synthesized bundles, which never carry one; only
    /// remote bundles can fail, so failure handlers may rely on this.
    pub fn request_action(&self) -> FlowResult<ClientAction> {
        self.request
            .as_ref()
            .map(|request| request.action)
            .ok_or(FlowError::Protocol(
                "synthesized bundle has no originating request",
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magpie_core::Digest;

    #[test]
    fn first_buffer_filters_other_responses() {
        let stat = StatEntry::with_pathspec(PathSpec::os("/tmp/a"));
        let bundle = ResponseBundle {
            success: true,
            status: None,
            request: None,
            request_data: RequestContext::new(3),
            responses: vec![AgentResponse::Stat(stat)],
            next_state: 0u8,
        };
        assert!(bundle.first().is_some());
        assert!(bundle.first_buffer().is_none());
    }

    #[test]
    fn request_action_requires_an_originating_request() {
        let block = BlockHashResponse {
            pathspec: PathSpec::os("/tmp/a"),
            digest: Digest::from_bytes([0; 32]),
            offset: 0,
            length: 1,
        };
        let bundle = ResponseBundle {
            success: true,
            status: None,
            request: None,
            request_data: RequestContext::default(),
            responses: vec![AgentResponse::Buffer(block)],
            next_state: 0u8,
        };
        assert!(bundle.request_action().is_err());

        let bundle = ResponseBundle {
            request: Some(AgentRequest {
                action: ClientAction::HashBuffer,
                payload: RequestPayload::Buffer(BufferReference {
                    pathspec: PathSpec::os("/tmp/a"),
                    offset: 0,
                    length: 1,
                }),
            }),
            ..bundle
        };
        assert_eq!(bundle.request_action().unwrap(), ClientAction::HashBuffer);
    }
}
