//! Protocol versions and handshake-time negotiation.
//!
//! Each side advertises the versions it speaks, highest-preferred first. The
//! session runs at the highest version both lists contain; there is no
//! fallback when the lists are disjoint.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A protocol version identifier as carried in descriptors and hellos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(pub u32);

impl ProtocolVersion {
    /// First version with association-signed hellos.
    pub const V1: ProtocolVersion = ProtocolVersion(1);
    /// Current version: adds the busy refusal during the handshake.
    pub const V2: ProtocolVersion = ProtocolVersion(2);
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Versions this build speaks, highest-preferred first.
pub const SUPPORTED_VERSIONS: &[ProtocolVersion] = &[ProtocolVersion::V2, ProtocolVersion::V1];

/// Highest version present in both lists, or `None` if they are disjoint.
///
/// Order of either list does not matter.
pub fn negotiate_version(
    ours: &[ProtocolVersion],
    theirs: &[ProtocolVersion],
) -> Option<ProtocolVersion> {
    ours.iter().filter(|v| theirs.contains(v)).max().copied()
}
