//! Cipher Primitives
//!
//! Symmetric and key-agreement building blocks shared by the SSU packet
//! codec and the tunnel layer:
//!
//! - AES-256 block cipher with two interchangeable backends: a hardware
//!   path built on the CPU's AES instructions and a portable path backed
//!   by the `aes` crate. The backend is probed once per process.
//! - ECB and CBC modes over either backend.
//! - The tunnel "double IV" layer cipher for 1024-byte tunnel messages.
//! - HMAC-SHA256 packet MACs (truncated to 16 bytes).
//! - secp256k1 Diffie-Hellman and HKDF derivation of session/MAC keys.
//!
//! Both backends must produce bit-identical output for identical inputs;
//! the tests in this module and `benches/cipher.rs` exercise that.

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod aesni;
mod block;
mod dh;
mod mac;
mod modes;
mod soft;
mod tunnel;

use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

pub use block::{Aes256, Block, BlockCipher, BLOCK_SIZE, KEY_SIZE};
pub use dh::{DhKeyPair, SessionKeys, SharedSecret, DH_PUBLIC_SIZE};
pub use mac::{compute_mac, verify_mac, MAC_SIZE};
pub use modes::{cbc_decrypt, cbc_encrypt, ecb_decrypt, ecb_encrypt};
pub(crate) use modes::{cbc_decrypt_blocks, cbc_encrypt_blocks};
pub use tunnel::{TunnelCipher, TUNNEL_BODY_SIZE, TUNNEL_DATA_SIZE, TUNNEL_IV_SIZE};

/// Errors from cipher primitives.
///
/// Fixed-size operations never produce these; they come from
/// variable-length inputs, key agreement, or an unavailable backend.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("length {0} is not a multiple of the cipher block size")]
    UnalignedLength(usize),

    #[error("cipher backend unavailable: {0}")]
    BackendUnavailable(CipherBackend),

    #[error("invalid key length: {0}")]
    InvalidKeyLength(usize),

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("key derivation failed")]
    KeyDerivation,
}

/// AES implementation selected for a cipher instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CipherBackend {
    /// CPU AES instructions operating on 128-bit registers.
    Hardware,
    /// Library-backed implementation available on every target.
    Portable,
}

impl CipherBackend {
    /// Check whether this backend can run on the current CPU.
    pub fn is_available(&self) -> bool {
        match self {
            CipherBackend::Hardware => hardware_supported(),
            CipherBackend::Portable => true,
        }
    }
}

impl fmt::Display for CipherBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CipherBackend::Hardware => "hardware",
            CipherBackend::Portable => "portable",
        };
        write!(f, "{}", s)
    }
}

static SELECTED_BACKEND: OnceLock<CipherBackend> = OnceLock::new();

/// Backend used by [`Aes256::new`] and everything built on it.
///
/// The CPU is probed on first call; the result is fixed for the life of
/// the process.
pub fn selected_backend() -> CipherBackend {
    *SELECTED_BACKEND.get_or_init(|| {
        let backend = if hardware_supported() {
            CipherBackend::Hardware
        } else {
            CipherBackend::Portable
        };
        tracing::debug!(backend = %backend, "AES backend selected");
        backend
    })
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn hardware_supported() -> bool {
    aesni::is_supported()
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn hardware_supported() -> bool {
    false
}
