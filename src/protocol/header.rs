//! Packet sealing and opening.

use rand::RngCore;
use std::fmt;

use super::{PayloadType, ProtocolError};
use crate::crypto::{
    cbc_decrypt_blocks, cbc_encrypt_blocks, compute_mac, verify_mac, Aes256, Block, SessionKeys,
    BLOCK_SIZE, MAC_SIZE,
};
use crate::identity::IntroKey;

/// Size of the IV field.
pub const IV_SIZE: usize = 16;

/// MAC + IV + flag + timestamp.
pub const HEADER_SIZE: usize = MAC_SIZE + IV_SIZE + 1 + 4;

/// Smallest well-formed packet: MAC, IV and one encrypted block.
pub const MIN_PACKET_SIZE: usize = MAC_SIZE + IV_SIZE + BLOCK_SIZE;

/// Flag bit: sender is rekeying.
pub const FLAG_REKEY: u8 = 0x08;

/// Flag bit: an extended options block follows the timestamp.
pub const FLAG_EXTENDED_OPTIONS: u8 = 0x04;

const BODY_OFFSET: usize = MAC_SIZE + IV_SIZE;

/// Cipher and MAC keys used to seal or open one packet.
#[derive(Clone)]
pub struct PacketKeys {
    cipher: Aes256,
    mac_key: [u8; 32],
}

impl PacketKeys {
    pub fn new(cipher_key: &[u8; 32], mac_key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256::new(cipher_key),
            mac_key: *mac_key,
        }
    }

    /// Keys for handshake packets: the intro key serves as both.
    pub fn intro(key: &IntroKey) -> Self {
        Self::new(key, key)
    }

    pub fn session(keys: &SessionKeys) -> Self {
        Self::new(&keys.cipher_key, &keys.mac_key)
    }
}

impl fmt::Debug for PacketKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketKeys")
            .field("backend", &self.cipher.backend())
            .finish_non_exhaustive()
    }
}

/// Decoded fixed fields of a packet body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub payload_type: PayloadType,
    pub rekey: bool,
    pub extended_options: Option<Vec<u8>>,
    pub timestamp: u32,
}

impl PacketHeader {
    pub fn new(payload_type: PayloadType, timestamp: u32) -> Self {
        Self {
            payload_type,
            rekey: false,
            extended_options: None,
            timestamp,
        }
    }

    pub fn with_extended_options(mut self, options: Vec<u8>) -> Self {
        self.extended_options = Some(options);
        self
    }

    fn flag(&self) -> u8 {
        let mut flag = self.payload_type.to_byte() << 4;
        if self.rekey {
            flag |= FLAG_REKEY;
        }
        if self.extended_options.is_some() {
            flag |= FLAG_EXTENDED_OPTIONS;
        }
        flag
    }
}

/// Seal a payload with a fresh random IV and random padding.
pub fn seal(keys: &PacketKeys, header: &PacketHeader, payload: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    seal_with_iv(keys, header, payload, &iv)
}

/// Seal a payload with a caller-provided IV.
///
/// Extended options longer than 255 bytes are truncated.
pub fn seal_with_iv(keys: &PacketKeys, header: &PacketHeader, payload: &[u8], iv: &Block) -> Vec<u8> {
    let opts = header.extended_options.as_deref().map(|o| &o[..o.len().min(255)]);
    let opts_len = opts.map(|o| 1 + o.len()).unwrap_or(0);
    let plain_len = 1 + 4 + opts_len + payload.len();
    let body_len = plain_len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;

    let mut packet = Vec::with_capacity(BODY_OFFSET + body_len);
    packet.extend_from_slice(&[0u8; MAC_SIZE]);
    packet.extend_from_slice(iv);
    packet.push(header.flag());
    packet.extend_from_slice(&header.timestamp.to_be_bytes());
    if let Some(opts) = opts {
        packet.push(opts.len() as u8);
        packet.extend_from_slice(opts);
    }
    packet.extend_from_slice(payload);
    let mut padding = vec![0u8; body_len - plain_len];
    rand::thread_rng().fill_bytes(&mut padding);
    packet.extend_from_slice(&padding);

    let (head, body) = packet.split_at_mut(BODY_OFFSET);
    cbc_encrypt_blocks(&keys.cipher, iv, body);
    let mac = compute_mac(&keys.mac_key, &[&head[MAC_SIZE..], body]);
    head[..MAC_SIZE].copy_from_slice(&mac);
    packet
}

/// Verify, decrypt and parse a packet.
///
/// The MAC is checked before any decryption. Returns the header and the
/// payload bytes, which may carry trailing padding.
pub fn open(keys: &PacketKeys, packet: &[u8]) -> Result<(PacketHeader, Vec<u8>), ProtocolError> {
    if packet.len() < MIN_PACKET_SIZE {
        return Err(ProtocolError::PacketTooShort {
            expected: MIN_PACKET_SIZE,
            got: packet.len(),
        });
    }
    let body_len = packet.len() - BODY_OFFSET;
    if body_len % BLOCK_SIZE != 0 {
        return Err(ProtocolError::UnalignedBody(body_len));
    }

    let mac = &packet[..MAC_SIZE];
    let iv_bytes = &packet[MAC_SIZE..BODY_OFFSET];
    let body = &packet[BODY_OFFSET..];
    if !verify_mac(&keys.mac_key, &[iv_bytes, body], mac) {
        return Err(ProtocolError::MacMismatch);
    }

    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(iv_bytes);
    let mut plain = body.to_vec();
    cbc_decrypt_blocks(&keys.cipher, &iv, &mut plain);

    let flag = plain[0];
    let payload_type =
        PayloadType::from_byte(flag >> 4).ok_or(ProtocolError::InvalidPayloadType(flag >> 4))?;
    let timestamp = u32::from_be_bytes([plain[1], plain[2], plain[3], plain[4]]);

    let mut offset = 5;
    let extended_options = if flag & FLAG_EXTENDED_OPTIONS != 0 {
        let len = plain[offset] as usize;
        offset += 1;
        if offset + len > plain.len() {
            return Err(ProtocolError::PayloadTooShort {
                expected: offset + len,
                got: plain.len(),
            });
        }
        let opts = plain[offset..offset + len].to_vec();
        offset += len;
        Some(opts)
    } else {
        None
    };

    let header = PacketHeader {
        payload_type,
        rekey: flag & FLAG_REKEY != 0,
        extended_options,
        timestamp,
    };
    plain.drain(..offset);
    Ok((header, plain))
}

/// Reject timestamps further than `max_skew` seconds from `now`.
pub fn check_timestamp(timestamp: u32, now: u32, max_skew: u32) -> Result<(), ProtocolError> {
    let skew = timestamp as i64 - now as i64;
    if skew.unsigned_abs() > max_skew as u64 {
        return Err(ProtocolError::ClockSkew { skew });
    }
    Ok(())
}
