//! UDP Transport Layer
//!
//! One UDP socket per address family. Each socket's receive task reads
//! datagrams in bursts of up to a configured count and hands each burst
//! to the server as a single batch, so that packets from one endpoint
//! inside a burst are dispatched in receipt order.

pub mod mtu;
pub mod udp;

use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub use mtu::{effective_mtu, FALLBACK_MTU_V4, FALLBACK_MTU_V6};
pub use udp::{read_burst, UdpTransport};

// ============================================================================
// Packet Channel Types
// ============================================================================

/// A datagram received from a socket.
#[derive(Clone, Debug)]
pub struct ReceivedPacket {
    /// Remote endpoint.
    pub remote_addr: SocketAddr,
    /// Packet data.
    pub data: Vec<u8>,
    /// Receipt timestamp (Unix milliseconds).
    pub timestamp_ms: u64,
}

impl ReceivedPacket {
    /// Create a new received packet with current timestamp.
    pub fn new(remote_addr: SocketAddr, data: Vec<u8>) -> Self {
        Self {
            remote_addr,
            data,
            timestamp_ms: now_ms(),
        }
    }
}

/// One receive cycle's worth of datagrams, in receipt order.
pub type PacketBatch = Vec<ReceivedPacket>;

/// Channel sender for received bursts.
pub type BatchTx = tokio::sync::mpsc::Sender<PacketBatch>;

/// Channel receiver for received bursts.
pub type BatchRx = tokio::sync::mpsc::Receiver<PacketBatch>;

/// Create a batch channel with the given buffer size.
pub fn batch_channel(buffer: usize) -> (BatchTx, BatchRx) {
    tokio::sync::mpsc::channel(buffer)
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Errors
// ============================================================================

/// Errors related to transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not started")]
    NotStarted,

    #[error("transport already started")]
    AlreadyStarted,

    #[error("transport failed to start: {0}")]
    StartFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("mtu exceeded: packet {packet_size} > mtu {mtu}")]
    MtuExceeded { packet_size: usize, mtu: u16 },

    #[error("no socket for address family {0}")]
    NoSocket(AddressFamily),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Transport State
// ============================================================================

/// Transport lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    /// Configured but not started.
    Configured,
    /// Socket bound, receive task running.
    Up,
    /// Was up, now stopped.
    Down,
}

impl TransportState {
    pub fn is_operational(&self) -> bool {
        matches!(self, TransportState::Up)
    }

    pub fn can_start(&self) -> bool {
        matches!(self, TransportState::Configured | TransportState::Down)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::Configured => "configured",
            TransportState::Up => "up",
            TransportState::Down => "down",
        };
        write!(f, "{}", s)
    }
}

/// IP address family of a socket or endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(addr: &SocketAddr) -> Self {
        if addr.is_ipv4() {
            AddressFamily::V4
        } else {
            AddressFamily::V6
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AddressFamily::V4 => "ipv4",
            AddressFamily::V6 => "ipv6",
        };
        write!(f, "{}", s)
    }
}
