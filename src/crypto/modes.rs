//! ECB and CBC over any [`BlockCipher`].
//!
//! All functions operate in place and require the buffer length to be a
//! multiple of [`BLOCK_SIZE`]. No padding is applied.

use super::block::{Block, BlockCipher, BLOCK_SIZE};
use super::CryptoError;

fn check_aligned(len: usize) -> Result<(), CryptoError> {
    if len % BLOCK_SIZE != 0 {
        return Err(CryptoError::UnalignedLength(len));
    }
    Ok(())
}

fn xor_into(dst: &mut Block, src: &Block) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= s;
    }
}

/// Encrypt each block independently.
pub fn ecb_encrypt<C: BlockCipher + ?Sized>(cipher: &C, data: &mut [u8]) -> Result<(), CryptoError> {
    check_aligned(data.len())?;
    for block in data.as_chunks_mut::<BLOCK_SIZE>().0 {
        cipher.encrypt_block(block);
    }
    Ok(())
}

/// Decrypt each block independently.
pub fn ecb_decrypt<C: BlockCipher + ?Sized>(cipher: &C, data: &mut [u8]) -> Result<(), CryptoError> {
    check_aligned(data.len())?;
    for block in data.as_chunks_mut::<BLOCK_SIZE>().0 {
        cipher.decrypt_block(block);
    }
    Ok(())
}

/// CBC-encrypt in place with the given IV.
pub fn cbc_encrypt<C: BlockCipher + ?Sized>(
    cipher: &C,
    iv: &Block,
    data: &mut [u8],
) -> Result<(), CryptoError> {
    check_aligned(data.len())?;
    cbc_encrypt_blocks(cipher, iv, data);
    Ok(())
}

/// CBC-decrypt in place with the given IV.
pub fn cbc_decrypt<C: BlockCipher + ?Sized>(
    cipher: &C,
    iv: &Block,
    data: &mut [u8],
) -> Result<(), CryptoError> {
    check_aligned(data.len())?;
    cbc_decrypt_blocks(cipher, iv, data);
    Ok(())
}

/// CBC encryption over whole blocks; a trailing partial block is left
/// untouched. Returns the final ciphertext block (the chaining value).
pub(crate) fn cbc_encrypt_blocks<C: BlockCipher + ?Sized>(
    cipher: &C,
    iv: &Block,
    data: &mut [u8],
) -> Block {
    let mut prev = *iv;
    for block in data.as_chunks_mut::<BLOCK_SIZE>().0 {
        xor_into(block, &prev);
        cipher.encrypt_block(block);
        prev = *block;
    }
    prev
}

pub(crate) fn cbc_decrypt_blocks<C: BlockCipher + ?Sized>(cipher: &C, iv: &Block, data: &mut [u8]) {
    let mut prev = *iv;
    for block in data.as_chunks_mut::<BLOCK_SIZE>().0 {
        let ciphertext = *block;
        cipher.decrypt_block(block);
        xor_into(block, &prev);
        prev = ciphertext;
    }
}
