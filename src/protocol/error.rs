//! Packet codec error types.

use thiserror::Error;

/// Errors decoding a transport packet or payload.
///
/// Every variant results in the packet being dropped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet too short: expected at least {expected}, got {got}")]
    PacketTooShort { expected: usize, got: usize },

    #[error("encrypted body not block aligned: {0} bytes")]
    UnalignedBody(usize),

    #[error("MAC verification failed")]
    MacMismatch,

    #[error("invalid payload type: {0}")]
    InvalidPayloadType(u8),

    #[error("payload too short: expected at least {expected}, got {got}")]
    PayloadTooShort { expected: usize, got: usize },

    #[error("invalid address size: {0}")]
    InvalidAddressSize(u8),

    #[error("clock skew {skew}s exceeds limit")]
    ClockSkew { skew: i64 },

    #[error("malformed payload: {0}")]
    Malformed(String),
}
