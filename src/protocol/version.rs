//! Protocol versioning
//!
//! Every envelope carries the sender's protocol version; requests from
//! incompatible peers are refused with an `ERROR` reply.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Current protocol version
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(1, 0, 0);

/// Protocol version identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    /// Create a new version
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Whether a peer speaking `remote` can be served by this version
    ///
    /// Major versions must match; this side must know at least the remote's minor.
    pub fn is_compatible_with(&self, remote: &ProtocolVersion) -> bool {
        self.major == remote.major && self.minor >= remote.minor
    }

    /// Fail with a protocol error when `remote` is incompatible
    pub fn ensure_compatible(&self, remote: &ProtocolVersion) -> Result<()> {
        if self.is_compatible_with(remote) {
            Ok(())
        } else {
            Err(Error::ProtocolVersion {
                expected: self.to_string(),
                actual: remote.to_string(),
            })
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_display() {
        assert_eq!(ProtocolVersion::new(1, 2, 3).to_string(), "1.2.3");
    }

    #[test]
    fn test_version_compatibility() {
        let v1_0 = ProtocolVersion::new(1, 0, 0);
        let v1_1 = ProtocolVersion::new(1, 1, 0);
        let v2_0 = ProtocolVersion::new(2, 0, 0);

        assert!(v1_1.is_compatible_with(&v1_0));
        assert!(!v1_0.is_compatible_with(&v1_1));
        assert!(!v2_0.is_compatible_with(&v1_0));

        assert!(v1_1.ensure_compatible(&v1_0).is_ok());
        assert!(matches!(
            v1_0.ensure_compatible(&v2_0),
            Err(Error::ProtocolVersion { .. })
        ));
    }
}
