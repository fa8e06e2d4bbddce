//! Protocol versioning for the HELLO/WELCOME handshake.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Wire protocol version, exchanged in HELLO and WELCOME.
///
/// - Major bump: frame layout or required fields changed, incompatible
/// - Minor bump: additive changes, compatible within the same major
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Current protocol version.
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Versions are compatible when their majors match.
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }

    /// Checks a peer's version against ours.
    pub fn negotiate(&self, peer: &ProtocolVersion) -> Result<(), VersionError> {
        if self.is_compatible_with(peer) {
            Ok(())
        } else {
            Err(VersionError::Incompatible {
                ours: *self,
                theirs: *peer,
            })
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Errors that can occur with version handling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Incompatible protocol version: ours {ours}, theirs {theirs}")]
    Incompatible {
        ours: ProtocolVersion,
        theirs: ProtocolVersion,
    },
}
