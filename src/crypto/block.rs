//! AES-256 block cipher front end.

use super::soft::SoftAes256;
use super::{selected_backend, CipherBackend, CryptoError};
use std::fmt;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
use super::aesni::AesNi256;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// A single cipher block.
pub type Block = [u8; BLOCK_SIZE];

/// Single-block encryption and decryption.
///
/// Modes (ECB, CBC, tunnel) are written against this trait so every
/// backend shares one mode implementation.
pub trait BlockCipher {
    /// Encrypt one block in place.
    fn encrypt_block(&self, block: &mut Block);

    /// Decrypt one block in place.
    fn decrypt_block(&self, block: &mut Block);
}

/// AES-256 with an expanded key schedule for one of the backends.
#[derive(Clone)]
pub enum Aes256 {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    Hardware(AesNi256),
    Portable(SoftAes256),
}

impl Aes256 {
    /// Expand a key using the process-wide selected backend.
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        match Self::with_backend(selected_backend(), key) {
            Ok(cipher) => cipher,
            Err(_) => Aes256::Portable(SoftAes256::new(key)),
        }
    }

    /// Expand a key for a specific backend.
    ///
    /// Fails only when the hardware backend is requested on a CPU that
    /// lacks AES instructions.
    pub fn with_backend(backend: CipherBackend, key: &[u8; KEY_SIZE]) -> Result<Self, CryptoError> {
        match backend {
            CipherBackend::Portable => Ok(Aes256::Portable(SoftAes256::new(key))),
            CipherBackend::Hardware => {
                #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
                if let Some(cipher) = AesNi256::new(key) {
                    return Ok(Aes256::Hardware(cipher));
                }
                Err(CryptoError::BackendUnavailable(backend))
            }
        }
    }

    /// Expand a key given as a slice.
    pub fn from_slice(key: &[u8]) -> Result<Self, CryptoError> {
        let key: &[u8; KEY_SIZE] = key
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
        Ok(Self::new(key))
    }

    /// Which backend this instance runs on.
    pub fn backend(&self) -> CipherBackend {
        match self {
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            Aes256::Hardware(_) => CipherBackend::Hardware,
            Aes256::Portable(_) => CipherBackend::Portable,
        }
    }
}

impl BlockCipher for Aes256 {
    fn encrypt_block(&self, block: &mut Block) {
        match self {
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            Aes256::Hardware(c) => c.encrypt_block(block),
            Aes256::Portable(c) => c.encrypt_block(block),
        }
    }

    fn decrypt_block(&self, block: &mut Block) {
        match self {
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            Aes256::Hardware(c) => c.decrypt_block(block),
            Aes256::Portable(c) => c.decrypt_block(block),
        }
    }
}

impl fmt::Debug for Aes256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aes256")
            .field("backend", &self.backend())
            .finish_non_exhaustive()
    }
}
