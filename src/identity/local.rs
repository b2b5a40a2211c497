//! Local router identity with signing capability.

use secp256k1::{Keypair, Message, Secp256k1, SecretKey};
use std::fmt;

use super::{sha256, IdentHash, IdentityError, RouterIdentity, SIGNATURE_SIZE};

/// The local router's keypair and derived identifiers.
#[derive(Clone)]
pub struct Identity {
    keypair: Keypair,
    router_identity: RouterIdentity,
}

impl Identity {
    /// Create a new random identity.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut secret_bytes = [0u8; 32];
            rand::RngCore::fill_bytes(&mut rng, &mut secret_bytes);
            if let Ok(secret_key) = SecretKey::from_slice(&secret_bytes) {
                return Self::from_secret_key(secret_key);
            }
        }
    }

    /// Create an identity from a secret key.
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &secret_key);
        let router_identity = RouterIdentity::from_pubkey(keypair.public_key());
        Self {
            keypair,
            router_identity,
        }
    }

    /// Create an identity from secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, IdentityError> {
        let secret_key = SecretKey::from_slice(bytes)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Create an identity from a hex-encoded secret.
    pub fn from_secret_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s.trim())?;
        let secret_key = SecretKey::from_slice(&bytes)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Hex encoding of the secret key, for persisting to config.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.keypair.secret_bytes())
    }

    /// The public identity advertised to peers.
    pub fn router_identity(&self) -> &RouterIdentity {
        &self.router_identity
    }

    pub fn ident_hash(&self) -> &IdentHash {
        self.router_identity.ident_hash()
    }

    /// Sign arbitrary data with this identity's secret key.
    ///
    /// The signature covers SHA-256(data).
    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_SIZE] {
        let secp = Secp256k1::new();
        let digest = Message::from_digest(sha256(data));
        secp.sign_schnorr_no_aux_rand(&digest, &self.keypair)
            .serialize()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("ident_hash", self.ident_hash())
            .finish_non_exhaustive()
    }
}
