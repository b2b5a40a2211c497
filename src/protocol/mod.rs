//! SSU Packet Codec
//!
//! Wire format of every transport datagram:
//!
//! ```text
//! [0  .. 16)   MAC   HMAC-SHA256/128 over IV || encrypted body
//! [16 .. 32)   IV    random, CBC chaining value for the body
//! [32 .. end)  AES-256-CBC encrypted body:
//!     byte 0       flag: payload type (high 4 bits), rekey (0x08),
//!                  extended options present (0x04)
//!     bytes 1..5   timestamp, seconds since epoch (big-endian)
//!     [ext opts]   length byte + option bytes, if flagged
//!     payload      type-specific fields
//!     padding      random bytes up to a 16-byte boundary
//! ```
//!
//! Before a session key exists, handshake packets are sealed with the
//! responder's well-known introduction key used as both cipher key and
//! MAC key. Multi-byte integers are big-endian. IP addresses are encoded
//! as a size byte (0, 4 or 16) followed by the address bytes; size 0
//! means "unspecified".

mod data;
mod error;
mod header;
mod payload;

use std::fmt;

pub use data::{DataPayload, Fragment, DATA_FLAG_EXPLICIT_ACKS, MAX_FRAGMENTS_PER_MESSAGE};
pub use error::ProtocolError;
pub use header::{
    check_timestamp, open, seal, seal_with_iv, PacketHeader, PacketKeys, FLAG_EXTENDED_OPTIONS,
    FLAG_REKEY, HEADER_SIZE, IV_SIZE, MIN_PACKET_SIZE,
};
pub use payload::{
    ConfirmedBody, PeerTest, RelayIntro, RelayRequest, RelayResponse, SessionConfirmed,
    SessionCreated, SessionRequest, EXT_OPT_REQUEST_RELAY_TAG,
};
pub(crate) use payload::{ip_len, put_ip};

pub use crate::crypto::MAC_SIZE;

/// Payload type carried in the high four bits of the flag byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    /// Initiator's DH public value and the responder IP it dialed.
    SessionRequest = 0,
    /// Responder's DH public value, signed, and the initiator's observed address.
    SessionCreated = 1,
    /// Initiator's identity and signature over the signed dataset.
    SessionConfirmed = 2,
    /// Ask an introducer to broker a connection to a third router.
    RelayRequest = 3,
    /// Introducer's reply carrying the target's endpoint.
    RelayResponse = 4,
    /// Introducer's notice to the target carrying the requester's endpoint.
    RelayIntro = 5,
    /// Acknowledgements and message fragments.
    Data = 6,
    /// Reachability test exchange.
    PeerTest = 7,
    /// Explicit session termination.
    SessionDestroyed = 8,
}

impl PayloadType {
    /// Try to convert from the 4-bit type field.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(PayloadType::SessionRequest),
            1 => Some(PayloadType::SessionCreated),
            2 => Some(PayloadType::SessionConfirmed),
            3 => Some(PayloadType::RelayRequest),
            4 => Some(PayloadType::RelayResponse),
            5 => Some(PayloadType::RelayIntro),
            6 => Some(PayloadType::Data),
            7 => Some(PayloadType::PeerTest),
            8 => Some(PayloadType::SessionDestroyed),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Whether this payload is only valid under session keys.
    ///
    /// Intro keys are published, so anything sealed with one proves
    /// nothing about the sender.
    pub fn requires_session_keys(self) -> bool {
        matches!(
            self,
            PayloadType::SessionConfirmed
                | PayloadType::RelayIntro
                | PayloadType::Data
                | PayloadType::SessionDestroyed
        )
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PayloadType::SessionRequest => "SessionRequest",
            PayloadType::SessionCreated => "SessionCreated",
            PayloadType::SessionConfirmed => "SessionConfirmed",
            PayloadType::RelayRequest => "RelayRequest",
            PayloadType::RelayResponse => "RelayResponse",
            PayloadType::RelayIntro => "RelayIntro",
            PayloadType::Data => "Data",
            PayloadType::PeerTest => "PeerTest",
            PayloadType::SessionDestroyed => "SessionDestroyed",
        };
        write!(f, "{}", name)
    }
}

/// Current time as protocol seconds.
pub fn now_secs() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
