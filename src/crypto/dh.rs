//! Handshake key agreement.
//!
//! Each side of a session handshake generates an ephemeral secp256k1
//! keypair and sends the 33-byte compressed public key (X from the
//! initiator, Y from the responder). The shared secret is SHA-256 of the
//! x-coordinate of the ECDH point; session and MAC keys are expanded from
//! it with HKDF-SHA256.

use hkdf::Hkdf;
use rand::RngCore;
use secp256k1::{ecdh::shared_secret_point, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use std::fmt;

use super::CryptoError;

/// Size of a serialized DH public value.
pub const DH_PUBLIC_SIZE: usize = 33;

const SESSION_KEY_INFO: &[u8] = b"shroud-ssu-session-v1";

/// Ephemeral DH keypair held by a session until its handshake completes.
pub struct DhKeyPair {
    secret: SecretKey,
    public: [u8; DH_PUBLIC_SIZE],
}

impl DhKeyPair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            // Out-of-range scalars occur with negligible probability
            if let Ok(secret) = SecretKey::from_slice(&bytes) {
                return Self::from_secret(secret);
            }
        }
    }

    pub fn from_secret(secret: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public = PublicKey::from_secret_key(&secp, &secret).serialize();
        Self { secret, public }
    }

    /// Compressed public value to send to the peer.
    pub fn public(&self) -> &[u8; DH_PUBLIC_SIZE] {
        &self.public
    }

    /// Combine with the peer's public value.
    pub fn agree(&self, peer_public: &[u8]) -> Result<SharedSecret, CryptoError> {
        let peer = PublicKey::from_slice(peer_public).map_err(|_| CryptoError::InvalidPublicKey)?;
        let point = shared_secret_point(&peer, &self.secret);
        let mut hasher = Sha256::new();
        hasher.update(&point[..32]);
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&hasher.finalize());
        Ok(SharedSecret(secret))
    }
}

impl fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// Raw DH output before key expansion.
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    /// Expand into the session cipher key and MAC key.
    pub fn session_keys(&self) -> Result<SessionKeys, CryptoError> {
        let hk = Hkdf::<Sha256>::new(None, &self.0);
        let mut okm = [0u8; 64];
        hk.expand(SESSION_KEY_INFO, &mut okm)
            .map_err(|_| CryptoError::KeyDerivation)?;
        let mut cipher_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        cipher_key.copy_from_slice(&okm[..32]);
        mac_key.copy_from_slice(&okm[32..]);
        Ok(SessionKeys { cipher_key, mac_key })
    }
}

/// Symmetric keys for an established session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub cipher_key: [u8; 32],
    pub mac_key: [u8; 32],
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKeys { .. }")
    }
}
