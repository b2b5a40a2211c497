//! Data payload (type 6): acknowledgements and message fragments.
//!
//! ## Wire Format
//!
//! | Field          | Size            | Description                          |
//! |----------------|-----------------|--------------------------------------|
//! | flags          | 1 byte          | 0x80: explicit ACK list present      |
//! | ack_count      | 1 byte          | If flagged                           |
//! | acks           | 4 × ack_count   | Fully received message ids           |
//! | fragment_count | 1 byte          |                                      |
//! | fragments      | variable        | Repeated fragment records            |
//!
//! Fragment record: `msg_id` (4), info (1: fragment number << 1 | last),
//! size (2), data.

use super::payload::Reader;
use super::ProtocolError;

/// Data flag: explicit ACK list present.
pub const DATA_FLAG_EXPLICIT_ACKS: u8 = 0x80;

/// Fragment numbers are carried in seven bits.
pub const MAX_FRAGMENTS_PER_MESSAGE: usize = 128;

const FRAGMENT_HEADER_SIZE: usize = 4 + 1 + 2;

/// One piece of an application message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub msg_id: u32,
    pub fragment_num: u8,
    pub is_last: bool,
    pub data: Vec<u8>,
}

impl Fragment {
    pub fn encoded_len(&self) -> usize {
        FRAGMENT_HEADER_SIZE + self.data.len()
    }
}

/// Decoded Data payload.
///
/// An empty payload (no ACKs, no fragments) is a keep-alive.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataPayload {
    pub acks: Vec<u32>,
    pub fragments: Vec<Fragment>,
}

impl DataPayload {
    /// Encoded size of a payload with the given counts, excluding
    /// fragment data.
    pub fn overhead(ack_count: usize, fragment_count: usize) -> usize {
        let acks = if ack_count > 0 { 1 + 4 * ack_count } else { 0 };
        1 + acks + 1 + fragment_count * FRAGMENT_HEADER_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.acks.is_empty() && self.fragments.is_empty()
    }

    pub fn encoded_len(&self) -> usize {
        Self::overhead(self.acks.len(), self.fragments.len())
            + self.fragments.iter().map(|f| f.data.len()).sum::<usize>()
    }

    /// Encode; callers keep ACK and fragment counts within 255.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        if self.acks.is_empty() {
            buf.push(0);
        } else {
            buf.push(DATA_FLAG_EXPLICIT_ACKS);
            buf.push(self.acks.len() as u8);
            for id in &self.acks {
                buf.extend_from_slice(&id.to_be_bytes());
            }
        }
        buf.push(self.fragments.len() as u8);
        for frag in &self.fragments {
            buf.extend_from_slice(&frag.msg_id.to_be_bytes());
            buf.push((frag.fragment_num << 1) | frag.is_last as u8);
            buf.extend_from_slice(&(frag.data.len() as u16).to_be_bytes());
            buf.extend_from_slice(&frag.data);
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        let flags = r.u8()?;

        let mut acks = Vec::new();
        if flags & DATA_FLAG_EXPLICIT_ACKS != 0 {
            let count = r.u8()?;
            acks.reserve(count as usize);
            for _ in 0..count {
                acks.push(r.u32()?);
            }
        }

        let count = r.u8()?;
        let mut fragments = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let msg_id = r.u32()?;
            let info = r.u8()?;
            let size = r.u16()? as usize;
            let data = r.bytes(size)?.to_vec();
            fragments.push(Fragment {
                msg_id,
                fragment_num: info >> 1,
                is_last: info & 0x01 != 0,
                data,
            });
        }

        Ok(Self { acks, fragments })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_encoding() {
        let keepalive = DataPayload::default();
        assert!(keepalive.is_empty());
        assert_eq!(keepalive.encode(), vec![0, 0]);
        assert_eq!(DataPayload::decode(&[0, 0, 0xaa, 0xbb]).unwrap(), keepalive);
    }

    #[test]
    fn test_acks_and_fragments() {
        let payload = DataPayload {
            acks: vec![1, 0xffff_ffff],
            fragments: vec![
                Fragment {
                    msg_id: 10,
                    fragment_num: 0,
                    is_last: false,
                    data: vec![1; 100],
                },
                Fragment {
                    msg_id: 10,
                    fragment_num: 127,
                    is_last: true,
                    data: vec![],
                },
            ],
        };
        let encoded = payload.encode();
        assert_eq!(encoded.len(), payload.encoded_len());
        assert_eq!(encoded[0], DATA_FLAG_EXPLICIT_ACKS);
        assert_eq!(DataPayload::decode(&encoded).unwrap(), payload);
    }

    #[test]
    fn test_truncated_fragment() {
        let payload = DataPayload {
            acks: vec![],
            fragments: vec![Fragment {
                msg_id: 1,
                fragment_num: 0,
                is_last: true,
                data: vec![5; 20],
            }],
        };
        let encoded = payload.encode();
        assert!(matches!(
            DataPayload::decode(&encoded[..encoded.len() - 5]),
            Err(ProtocolError::PayloadTooShort { .. })
        ));
    }

    #[test]
    fn test_overhead() {
        assert_eq!(DataPayload::overhead(0, 0), 2);
        assert_eq!(DataPayload::overhead(2, 1), 1 + 1 + 8 + 1 + 7);
    }
}
