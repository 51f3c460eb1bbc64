//! Addressing of files on remote agents and in the server VFS.
//!
//! A [`PathSpec`] is the locator a remote agent understands; it is opaque
//! to the server apart from its deterministic mapping into a per-client
//! [`VfsUrn`], the hierarchical address under which acquired content is
//! stored server-side.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How the agent should resolve a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PathType {
    /// Through the operating system's filesystem API.
    #[default]
    Os,
    /// Through raw device access with filesystem parsing on the agent.
    Tsk,
    /// Through the Windows registry.
    Registry,
}

impl PathType {
    fn vfs_segment(&self) -> &'static str {
        match self {
            PathType::Os => "os",
            PathType::Tsk => "tsk",
            PathType::Registry => "registry",
        }
    }
}

/// Path matching options understood by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PathOptions {
    /// Resolve each component case-insensitively if the exact name is
    /// not found.
    #[default]
    CaseInsensitive,
    /// Use the path exactly as given.
    CaseLiteral,
}

/// An opaque file locator on a remote agent.
///
/// Treated as a value: two pathspecs with equal fields address the same
/// file and map to the same [`VfsUrn`] for a given client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathSpec {
    pub path: String,
    pub pathtype: PathType,
    pub options: PathOptions,
}

impl PathSpec {
    /// A pathspec resolved through the OS filesystem API.
    pub fn os(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            pathtype: PathType::Os,
            options: PathOptions::default(),
        }
    }

    /// The server-side address of this file under `client_id`'s namespace.
    pub fn vfs_urn(&self, client_id: &ClientId) -> VfsUrn {
        VfsUrn(format!(
            "{}/fs/{}/{}",
            client_id.0,
            self.pathtype.vfs_segment(),
            self.path.trim_start_matches('/')
        ))
    }
}

impl fmt::Display for PathSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pathtype.vfs_segment(), self.path)
    }
}

/// Identifier of a remote agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A hierarchical server-side identifier for an object in a client's
/// virtual filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VfsUrn(String);

impl VfsUrn {
    pub fn new(urn: impl Into<String>) -> Self {
        Self(urn.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VfsUrn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
