//! Router Identity
//!
//! Routers are identified by a secp256k1 public key. The 33-byte
//! compressed key is the on-wire identity carried in SessionConfirmed and
//! relay messages; its SHA-256 is the [`IdentHash`] used to address the
//! router in the routing database and the message router. Handshake
//! signatures are BIP-340 Schnorr over SHA-256 of the signed data.

mod hash;
mod local;
mod router;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub use hash::IdentHash;
pub use local::Identity;
pub use router::{IntroKey, IntroducerInfo, RouterCaps, RouterIdentity, RouterInfo, SsuAddress};

/// Size of a serialized router identity (compressed public key).
pub const IDENTITY_SIZE: usize = 33;

/// Size of a handshake signature.
pub const SIGNATURE_SIZE: usize = 64;

/// Errors that can occur in identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid key: {0}")]
    InvalidKey(#[from] secp256k1::Error),

    #[error("signature verification failed")]
    SignatureVerificationFailed,

    #[error("invalid identity length: expected 33, got {0}")]
    InvalidIdentityLength(usize),

    #[error("invalid ident hash length: expected 32, got {0}")]
    InvalidHashLength(usize),

    #[error("invalid intro key length: expected 32, got {0}")]
    InvalidIntroKeyLength(usize),

    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Compute SHA-256 hash of data.
pub(crate) fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Decode a hex string into a 32-byte intro key.
pub fn decode_intro_key(s: &str) -> Result<IntroKey, IdentityError> {
    let bytes = hex::decode(s.trim())?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| IdentityError::InvalidIntroKeyLength(bytes.len()))
}
