//! Tunnel layer cipher.
//!
//! A tunnel message is 1024 bytes: a 16-byte IV field followed by a
//! 1008-byte body. Each hop encrypts or peels one layer with its layer
//! key and IV key using double IV encryption:
//!
//! ```text
//! encrypt:  IV'  = E_iv(IV)
//!           body = CBC_layer(IV', body)
//!           IV   = E_iv(IV')
//! decrypt:  IV'  = D_iv(IV)
//!           body = CBC^-1_layer(IV', body)
//!           IV   = D_iv(IV')
//! ```

use super::block::{Aes256, Block, BlockCipher, BLOCK_SIZE, KEY_SIZE};
use super::modes::{cbc_decrypt_blocks, cbc_encrypt_blocks};
use super::{CipherBackend, CryptoError};

/// Full tunnel message size.
pub const TUNNEL_DATA_SIZE: usize = 1024;

/// Size of the IV field at the start of a tunnel message.
pub const TUNNEL_IV_SIZE: usize = BLOCK_SIZE;

/// Size of the encrypted body following the IV field.
pub const TUNNEL_BODY_SIZE: usize = TUNNEL_DATA_SIZE - TUNNEL_IV_SIZE;

/// Per-hop tunnel cipher holding expanded layer and IV keys.
#[derive(Clone, Debug)]
pub struct TunnelCipher {
    layer: Aes256,
    iv: Aes256,
}

impl TunnelCipher {
    /// Build a cipher on the process-wide selected backend.
    pub fn new(layer_key: &[u8; KEY_SIZE], iv_key: &[u8; KEY_SIZE]) -> Self {
        Self {
            layer: Aes256::new(layer_key),
            iv: Aes256::new(iv_key),
        }
    }

    /// Build a cipher on a specific backend.
    pub fn with_backend(
        backend: CipherBackend,
        layer_key: &[u8; KEY_SIZE],
        iv_key: &[u8; KEY_SIZE],
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            layer: Aes256::with_backend(backend, layer_key)?,
            iv: Aes256::with_backend(backend, iv_key)?,
        })
    }

    pub fn backend(&self) -> CipherBackend {
        self.layer.backend()
    }

    /// Add one layer of encryption in place.
    pub fn encrypt(&self, msg: &mut [u8; TUNNEL_DATA_SIZE]) {
        let mut iv = read_iv(msg);
        self.iv.encrypt_block(&mut iv);
        cbc_encrypt_blocks(&self.layer, &iv, &mut msg[TUNNEL_IV_SIZE..]);
        self.iv.encrypt_block(&mut iv);
        msg[..TUNNEL_IV_SIZE].copy_from_slice(&iv);
    }

    /// Remove one layer of encryption in place.
    pub fn decrypt(&self, msg: &mut [u8; TUNNEL_DATA_SIZE]) {
        let mut iv = read_iv(msg);
        self.iv.decrypt_block(&mut iv);
        cbc_decrypt_blocks(&self.layer, &iv, &mut msg[TUNNEL_IV_SIZE..]);
        self.iv.decrypt_block(&mut iv);
        msg[..TUNNEL_IV_SIZE].copy_from_slice(&iv);
    }
}

fn read_iv(msg: &[u8; TUNNEL_DATA_SIZE]) -> Block {
    let mut iv = [0u8; TUNNEL_IV_SIZE];
    iv.copy_from_slice(&msg[..TUNNEL_IV_SIZE]);
    iv
}
