//! Portable AES-256 backed by the RustCrypto `aes` crate.
//!
//! The `aes` crate performs its own runtime CPU detection, but this type
//! is what the process uses when the hardware backend is unavailable or
//! explicitly not wanted, and is the reference the hardware path is
//! checked against.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};

use super::block::{Block, BlockCipher, KEY_SIZE};

#[derive(Clone)]
pub struct SoftAes256 {
    inner: aes::Aes256,
}

impl SoftAes256 {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            inner: aes::Aes256::new(GenericArray::from_slice(key)),
        }
    }
}

impl BlockCipher for SoftAes256 {
    fn encrypt_block(&self, block: &mut Block) {
        self.inner
            .encrypt_block(GenericArray::from_mut_slice(block.as_mut_slice()));
    }

    fn decrypt_block(&self, block: &mut Block) {
        self.inner
            .decrypt_block(GenericArray::from_mut_slice(block.as_mut_slice()));
    }
}
