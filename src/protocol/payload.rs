//! Handshake, relay and peer-test payloads.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::ProtocolError;
use crate::crypto::DH_PUBLIC_SIZE;
use crate::identity::{IntroKey, IDENTITY_SIZE, SIGNATURE_SIZE};

/// Extended option bit in a SessionRequest: initiator wants a relay tag.
pub const EXT_OPT_REQUEST_RELAY_TAG: u8 = 0x01;

// ============================================================================
// Field helpers
// ============================================================================

/// Bounds-checked cursor over a decrypted payload.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(ProtocolError::PayloadTooShort {
                expected: end,
                got: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    /// Size-prefixed IP address; size 0 decodes to `None`.
    pub(crate) fn ip(&mut self) -> Result<Option<IpAddr>, ProtocolError> {
        match self.u8()? {
            0 => Ok(None),
            4 => Ok(Some(IpAddr::V4(Ipv4Addr::from(self.array::<4>()?)))),
            16 => Ok(Some(IpAddr::V6(Ipv6Addr::from(self.array::<16>()?)))),
            n => Err(ProtocolError::InvalidAddressSize(n)),
        }
    }
}

/// Encoded size of an IP field, including the size byte.
pub(crate) fn ip_len(ip: Option<IpAddr>) -> usize {
    1 + match ip {
        None => 0,
        Some(IpAddr::V4(_)) => 4,
        Some(IpAddr::V6(_)) => 16,
    }
}

pub(crate) fn put_ip(buf: &mut Vec<u8>, ip: Option<IpAddr>) {
    match ip {
        None => buf.push(0),
        Some(IpAddr::V4(v4)) => {
            buf.push(4);
            buf.extend_from_slice(&v4.octets());
        }
        Some(IpAddr::V6(v6)) => {
            buf.push(16);
            buf.extend_from_slice(&v6.octets());
        }
    }
}

// ============================================================================
// Session establishment
// ============================================================================

/// Payload type 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRequest {
    /// Initiator's DH public value (X).
    pub dh_x: [u8; DH_PUBLIC_SIZE],
    /// Responder IP the initiator sent to.
    pub bob_ip: Option<IpAddr>,
}

impl SessionRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DH_PUBLIC_SIZE + ip_len(self.bob_ip));
        buf.extend_from_slice(&self.dh_x);
        put_ip(&mut buf, self.bob_ip);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            dh_x: r.array()?,
            bob_ip: r.ip()?,
        })
    }
}

/// Payload type 1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionCreated {
    /// Responder's DH public value (Y).
    pub dh_y: [u8; DH_PUBLIC_SIZE],
    /// Initiator's address as observed by the responder.
    pub alice_ip: Option<IpAddr>,
    pub alice_port: u16,
    /// Tag the initiator may publish to be introduced; 0 if none.
    pub relay_tag: u32,
    pub signed_on: u32,
    /// Responder's signature over the signed dataset.
    pub signature: [u8; SIGNATURE_SIZE],
}

impl SessionCreated {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DH_PUBLIC_SIZE + ip_len(self.alice_ip) + 10 + SIGNATURE_SIZE);
        buf.extend_from_slice(&self.dh_y);
        put_ip(&mut buf, self.alice_ip);
        buf.extend_from_slice(&self.alice_port.to_be_bytes());
        buf.extend_from_slice(&self.relay_tag.to_be_bytes());
        buf.extend_from_slice(&self.signed_on.to_be_bytes());
        buf.extend_from_slice(&self.signature);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            dh_y: r.array()?,
            alice_ip: r.ip()?,
            alice_port: r.u16()?,
            relay_tag: r.u32()?,
            signed_on: r.u32()?,
            signature: r.array()?,
        })
    }
}

/// Payload type 2: one fragment of the initiator's confirmation.
///
/// The fragments concatenate to a [`ConfirmedBody`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfirmed {
    pub fragment_num: u8,
    pub fragment_count: u8,
    pub data: Vec<u8>,
}

impl SessionConfirmed {
    /// Most fragments a confirmation may be split into.
    pub const MAX_FRAGMENTS: u8 = 15;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + self.data.len());
        buf.push((self.fragment_num << 4) | (self.fragment_count & 0x0f));
        buf.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        let info = r.u8()?;
        let fragment_num = info >> 4;
        let fragment_count = info & 0x0f;
        if fragment_count == 0 || fragment_num >= fragment_count {
            return Err(ProtocolError::Malformed(format!(
                "confirmed fragment {} of {}",
                fragment_num, fragment_count
            )));
        }
        let size = r.u16()? as usize;
        let data = r.bytes(size)?.to_vec();
        Ok(Self {
            fragment_num,
            fragment_count,
            data,
        })
    }
}

/// Reassembled SessionConfirmed content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfirmedBody {
    /// Initiator's serialized router identity.
    pub identity: [u8; IDENTITY_SIZE],
    pub signed_on: u32,
    /// Initiator's signature over the signed dataset.
    pub signature: [u8; SIGNATURE_SIZE],
}

impl ConfirmedBody {
    pub const SIZE: usize = IDENTITY_SIZE + 4 + SIGNATURE_SIZE;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.identity);
        buf.extend_from_slice(&self.signed_on.to_be_bytes());
        buf.extend_from_slice(&self.signature);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            identity: r.array()?,
            signed_on: r.u32()?,
            signature: r.array()?,
        })
    }

    /// Split the encoded body into fragments carrying at most
    /// `max_fragment` bytes each.
    pub fn fragments(&self, max_fragment: usize) -> Vec<SessionConfirmed> {
        let encoded = self.encode();
        let max_fragment = max_fragment.max(Self::SIZE.div_ceil(SessionConfirmed::MAX_FRAGMENTS as usize));
        let chunks: Vec<&[u8]> = encoded.chunks(max_fragment).collect();
        let count = chunks.len() as u8;
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| SessionConfirmed {
                fragment_num: i as u8,
                fragment_count: count,
                data: chunk.to_vec(),
            })
            .collect()
    }
}

// ============================================================================
// Relay
// ============================================================================

/// Payload type 3: Alice asks introducer Bob to reach Charlie.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayRequest {
    /// Tag Charlie registered with Bob.
    pub relay_tag: u32,
    /// Alice's address, or `None` for "use the packet source".
    pub alice_ip: Option<IpAddr>,
    pub alice_port: u16,
    pub alice_intro_key: IntroKey,
    pub alice_identity: [u8; IDENTITY_SIZE],
    pub nonce: u32,
}

impl RelayRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + ip_len(self.alice_ip) + 2 + 32 + IDENTITY_SIZE + 4);
        buf.extend_from_slice(&self.relay_tag.to_be_bytes());
        put_ip(&mut buf, self.alice_ip);
        buf.extend_from_slice(&self.alice_port.to_be_bytes());
        buf.extend_from_slice(&self.alice_intro_key);
        buf.extend_from_slice(&self.alice_identity);
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            relay_tag: r.u32()?,
            alice_ip: r.ip()?,
            alice_port: r.u16()?,
            alice_intro_key: r.array()?,
            alice_identity: r.array()?,
            nonce: r.u32()?,
        })
    }
}

/// Payload type 4: Bob tells Alice where Charlie is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayResponse {
    pub charlie_ip: Option<IpAddr>,
    pub charlie_port: u16,
    /// Alice's address as Bob sees it.
    pub alice_ip: Option<IpAddr>,
    pub alice_port: u16,
    pub nonce: u32,
}

impl RelayResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ip_len(self.charlie_ip) + ip_len(self.alice_ip) + 8);
        put_ip(&mut buf, self.charlie_ip);
        buf.extend_from_slice(&self.charlie_port.to_be_bytes());
        put_ip(&mut buf, self.alice_ip);
        buf.extend_from_slice(&self.alice_port.to_be_bytes());
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            charlie_ip: r.ip()?,
            charlie_port: r.u16()?,
            alice_ip: r.ip()?,
            alice_port: r.u16()?,
            nonce: r.u32()?,
        })
    }
}

/// Payload type 5: Bob tells Charlie that Alice wants a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayIntro {
    pub alice_ip: Option<IpAddr>,
    pub alice_port: u16,
    pub alice_intro_key: IntroKey,
    pub alice_identity: [u8; IDENTITY_SIZE],
}

impl RelayIntro {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ip_len(self.alice_ip) + 2 + 32 + IDENTITY_SIZE);
        put_ip(&mut buf, self.alice_ip);
        buf.extend_from_slice(&self.alice_port.to_be_bytes());
        buf.extend_from_slice(&self.alice_intro_key);
        buf.extend_from_slice(&self.alice_identity);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            alice_ip: r.ip()?,
            alice_port: r.u16()?,
            alice_intro_key: r.array()?,
            alice_identity: r.array()?,
        })
    }
}

// ============================================================================
// Peer test
// ============================================================================

/// Payload type 7.
///
/// The role of each message is implied by who sends it and the state of
/// the receiver's test record, not carried on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerTest {
    pub nonce: u32,
    /// Alice's address, when relayed by Bob or Charlie.
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub intro_key: IntroKey,
}

impl PeerTest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + ip_len(self.ip) + 2 + 32);
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        put_ip(&mut buf, self.ip);
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf.extend_from_slice(&self.intro_key);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            nonce: r.u32()?,
            ip: r.ip()?,
            port: r.u16()?,
            intro_key: r.array()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_request_v4_and_v6() {
        let v4 = SessionRequest {
            dh_x: [2u8; 33],
            bob_ip: Some("192.0.2.1".parse().unwrap()),
        };
        let encoded = v4.encode();
        assert_eq!(encoded.len(), 33 + 1 + 4);
        assert_eq!(SessionRequest::decode(&encoded).unwrap(), v4);

        let v6 = SessionRequest {
            dh_x: [3u8; 33],
            bob_ip: Some("2001:db8::1".parse().unwrap()),
        };
        assert_eq!(v6.encode().len(), 33 + 1 + 16);
        assert_eq!(SessionRequest::decode(&v6.encode()).unwrap(), v6);
    }

    #[test]
    fn test_decode_tolerates_padding() {
        let created = SessionCreated {
            dh_y: [2u8; 33],
            alice_ip: Some("198.51.100.7".parse().unwrap()),
            alice_port: 31337,
            relay_tag: 0xdeadbeef,
            signed_on: 1_700_000_000,
            signature: [5u8; 64],
        };
        let mut encoded = created.encode();
        encoded.extend_from_slice(&[0xff; 11]);
        assert_eq!(SessionCreated::decode(&encoded).unwrap(), created);
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let created = SessionCreated {
            dh_y: [2u8; 33],
            alice_ip: None,
            alice_port: 1,
            relay_tag: 0,
            signed_on: 0,
            signature: [0u8; 64],
        };
        let encoded = created.encode();
        assert!(matches!(
            SessionCreated::decode(&encoded[..encoded.len() - 1]),
            Err(ProtocolError::PayloadTooShort { .. })
        ));
    }

    #[test]
    fn test_invalid_address_size() {
        let mut payload = vec![2u8; 33];
        payload.push(7);
        payload.extend_from_slice(&[0u8; 7]);
        assert!(matches!(
            SessionRequest::decode(&payload),
            Err(ProtocolError::InvalidAddressSize(7))
        ));
    }

    #[test]
    fn test_confirmed_fragments_reassemble() {
        let body = ConfirmedBody {
            identity: [2u8; 33],
            signed_on: 99,
            signature: [8u8; 64],
        };
        let frags = body.fragments(40);
        assert_eq!(frags.len(), 3);
        assert!(frags.iter().all(|f| f.fragment_count == 3));

        let mut joined = Vec::new();
        for frag in &frags {
            let decoded = SessionConfirmed::decode(&frag.encode()).unwrap();
            joined.extend_from_slice(&decoded.data);
        }
        assert_eq!(ConfirmedBody::decode(&joined).unwrap(), body);

        assert_eq!(body.fragments(1500).len(), 1);
        // Tiny fragment sizes are raised so the count fits in four bits
        assert!(body.fragments(1).len() <= SessionConfirmed::MAX_FRAGMENTS as usize);
    }

    #[test]
    fn test_confirmed_bad_fragment_info() {
        // fragment 2 of 2
        let payload = [0x22, 0x00, 0x00];
        assert!(matches!(
            SessionConfirmed::decode(&payload),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_relay_messages() {
        let request = RelayRequest {
            relay_tag: 42,
            alice_ip: None,
            alice_port: 0,
            alice_intro_key: [1u8; 32],
            alice_identity: [3u8; 33],
            nonce: 7,
        };
        assert_eq!(RelayRequest::decode(&request.encode()).unwrap(), request);

        let response = RelayResponse {
            charlie_ip: Some("203.0.113.5".parse().unwrap()),
            charlie_port: 4000,
            alice_ip: Some("198.51.100.1".parse().unwrap()),
            alice_port: 5000,
            nonce: 7,
        };
        assert_eq!(RelayResponse::decode(&response.encode()).unwrap(), response);

        let intro = RelayIntro {
            alice_ip: Some("2001:db8::2".parse().unwrap()),
            alice_port: 5000,
            alice_intro_key: [9u8; 32],
            alice_identity: [2u8; 33],
        };
        assert_eq!(RelayIntro::decode(&intro.encode()).unwrap(), intro);
    }

    #[test]
    fn test_peer_test_without_address() {
        let test = PeerTest {
            nonce: 0x01020304,
            ip: None,
            port: 0,
            intro_key: [4u8; 32],
        };
        let encoded = test.encode();
        assert_eq!(&encoded[..4], &[1, 2, 3, 4]);
        assert_eq!(PeerTest::decode(&encoded).unwrap(), test);
    }
}
