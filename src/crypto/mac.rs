//! Packet authentication: HMAC-SHA256 truncated to 16 bytes.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Size of the MAC field at the start of every packet.
pub const MAC_SIZE: usize = 16;

fn keyed(key: &[u8; 32]) -> HmacSha256 {
    // HMAC accepts keys of any length
    match <HmacSha256 as Mac>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts any key length"),
    }
}

/// Compute the truncated MAC over the concatenation of `parts`.
pub fn compute_mac(key: &[u8; 32], parts: &[&[u8]]) -> [u8; MAC_SIZE] {
    let mut mac = keyed(key);
    for part in parts {
        mac.update(part);
    }
    let full = mac.finalize().into_bytes();
    let mut out = [0u8; MAC_SIZE];
    out.copy_from_slice(&full[..MAC_SIZE]);
    out
}

/// Constant-time check of a truncated MAC.
pub fn verify_mac(key: &[u8; 32], parts: &[&[u8]], tag: &[u8]) -> bool {
    if tag.len() != MAC_SIZE {
        return false;
    }
    let mut mac = keyed(key);
    for part in parts {
        mac.update(part);
    }
    mac.verify_truncated_left(tag).is_ok()
}
