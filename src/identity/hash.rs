//! 32-byte router hash.

use std::fmt;

use super::{sha256, IdentityError};

/// SHA-256 of a router's serialized identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdentHash([u8; 32]);

impl IdentHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, IdentityError> {
        let bytes: [u8; 32] = slice
            .try_into()
            .map_err(|_| IdentityError::InvalidHashLength(slice.len()))?;
        Ok(Self(bytes))
    }

    /// Hash a serialized identity.
    pub fn digest(identity_bytes: &[u8]) -> Self {
        Self(sha256(identity_bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Abbreviated form for log output.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for IdentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentHash({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for IdentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for IdentHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
