//! AES-256 on x86 AES-NI instructions.
//!
//! Key schedule follows the Intel AES-NI white paper: the encryption
//! schedule is built with `aeskeygenassist`, and the decryption schedule
//! is the reversed encryption schedule passed through `aesimc` for the
//! inner rounds (equivalent inverse cipher).

#[cfg(target_arch = "x86")]
use std::arch::x86::*;
#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

use super::block::{Block, BlockCipher, KEY_SIZE};

const ROUNDS: usize = 14;

pub(super) fn is_supported() -> bool {
    is_x86_feature_detected!("aes") && is_x86_feature_detected!("sse2")
}

/// Expanded AES-256 schedule held in 128-bit registers.
#[derive(Clone)]
pub struct AesNi256 {
    enc: [__m128i; ROUNDS + 1],
    dec: [__m128i; ROUNDS + 1],
}

// __m128i is plain data; the schedule is never mutated after expansion.
unsafe impl Send for AesNi256 {}
unsafe impl Sync for AesNi256 {}

impl AesNi256 {
    /// Expand a key, or `None` if the CPU lacks AES-NI.
    pub fn new(key: &[u8; KEY_SIZE]) -> Option<Self> {
        if !is_supported() {
            return None;
        }
        // SAFETY: feature presence checked above.
        let (enc, dec) = unsafe { expand_key(key) };
        Some(Self { enc, dec })
    }
}

impl BlockCipher for AesNi256 {
    fn encrypt_block(&self, block: &mut Block) {
        // SAFETY: an AesNi256 only exists after a successful feature check.
        unsafe { encrypt(&self.enc, block) }
    }

    fn decrypt_block(&self, block: &mut Block) {
        // SAFETY: as above.
        unsafe { decrypt(&self.dec, block) }
    }
}

#[target_feature(enable = "aes,sse2")]
unsafe fn assist_1(mut t1: __m128i, mut t2: __m128i) -> __m128i {
    t2 = _mm_shuffle_epi32::<0xff>(t2);
    let mut t3 = _mm_slli_si128::<4>(t1);
    t1 = _mm_xor_si128(t1, t3);
    t3 = _mm_slli_si128::<4>(t3);
    t1 = _mm_xor_si128(t1, t3);
    t3 = _mm_slli_si128::<4>(t3);
    t1 = _mm_xor_si128(t1, t3);
    _mm_xor_si128(t1, t2)
}

#[target_feature(enable = "aes,sse2")]
unsafe fn assist_2(t1: __m128i, mut t3: __m128i) -> __m128i {
    let t4 = _mm_aeskeygenassist_si128::<0x00>(t1);
    let t2 = _mm_shuffle_epi32::<0xaa>(t4);
    let mut t4 = _mm_slli_si128::<4>(t3);
    t3 = _mm_xor_si128(t3, t4);
    t4 = _mm_slli_si128::<4>(t4);
    t3 = _mm_xor_si128(t3, t4);
    t4 = _mm_slli_si128::<4>(t4);
    t3 = _mm_xor_si128(t3, t4);
    _mm_xor_si128(t3, t2)
}

#[target_feature(enable = "aes,sse2")]
unsafe fn expand_key(key: &[u8; KEY_SIZE]) -> ([__m128i; ROUNDS + 1], [__m128i; ROUNDS + 1]) {
    let mut enc = [_mm_setzero_si128(); ROUNDS + 1];

    // SAFETY: key is 32 bytes; unaligned loads are permitted.
    let mut t1 = unsafe { _mm_loadu_si128(key.as_ptr() as *const __m128i) };
    let mut t3 = unsafe { _mm_loadu_si128(key[16..].as_ptr() as *const __m128i) };
    enc[0] = t1;
    enc[1] = t3;

    macro_rules! round {
        ($idx:expr, $rcon:literal) => {
            let t2 = _mm_aeskeygenassist_si128::<$rcon>(t3);
            t1 = unsafe { assist_1(t1, t2) };
            enc[$idx] = t1;
            t3 = unsafe { assist_2(t1, t3) };
            enc[$idx + 1] = t3;
        };
    }

    round!(2, 0x01);
    round!(4, 0x02);
    round!(6, 0x04);
    round!(8, 0x08);
    round!(10, 0x10);
    round!(12, 0x20);
    // Final round key only needs the first half of the step.
    let t2 = _mm_aeskeygenassist_si128::<0x40>(t3);
    t1 = unsafe { assist_1(t1, t2) };
    enc[14] = t1;

    let mut dec = [_mm_setzero_si128(); ROUNDS + 1];
    dec[0] = enc[ROUNDS];
    for i in 1..ROUNDS {
        dec[i] = _mm_aesimc_si128(enc[ROUNDS - i]);
    }
    dec[ROUNDS] = enc[0];

    (enc, dec)
}

#[target_feature(enable = "aes,sse2")]
unsafe fn encrypt(keys: &[__m128i; ROUNDS + 1], block: &mut Block) {
    // SAFETY: block is 16 bytes.
    let mut state = unsafe { _mm_loadu_si128(block.as_ptr() as *const __m128i) };
    state = _mm_xor_si128(state, keys[0]);
    for key in &keys[1..ROUNDS] {
        state = _mm_aesenc_si128(state, *key);
    }
    state = _mm_aesenclast_si128(state, keys[ROUNDS]);
    unsafe { _mm_storeu_si128(block.as_mut_ptr() as *mut __m128i, state) };
}

#[target_feature(enable = "aes,sse2")]
unsafe fn decrypt(keys: &[__m128i; ROUNDS + 1], block: &mut Block) {
    // SAFETY: block is 16 bytes.
    let mut state = unsafe { _mm_loadu_si128(block.as_ptr() as *const __m128i) };
    state = _mm_xor_si128(state, keys[0]);
    for key in &keys[1..ROUNDS] {
        state = _mm_aesdec_si128(state, *key);
    }
    state = _mm_aesdeclast_si128(state, keys[ROUNDS]);
    unsafe { _mm_storeu_si128(block.as_mut_ptr() as *mut __m128i, state) };
}
