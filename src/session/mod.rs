//! SSU Session
//!
//! One [`Session`] per remote endpoint. A session is a state machine
//! that consumes datagrams and timer ticks and returns [`SessionEvent`]s
//! for the server to act on: datagrams to write, messages to deliver, and
//! relay or peer-test payloads that involve other sessions. It never
//! touches a socket.
//!
//! ## States
//!
//! - Outbound direct: `Unknown → RequestSent → Established`
//! - Inbound: `Unknown → CreatedSent → Established`
//! - Inbound after a relay introduction: `Introduced → CreatedSent → Established`
//!
//! Any state may move to `Failed` or `Closed`; both are terminal and the
//! server removes the session from its table.

mod data;
mod handshake;


pub use data::{DataReassembler, SubmitResult};
pub use handshake::SignedDataset;

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::RouterConfig;
use crate::crypto::{CryptoError, SessionKeys, BLOCK_SIZE};
use crate::identity::{IdentHash, Identity, IntroKey, RouterIdentity};
use crate::protocol::{
    check_timestamp, now_secs, open, seal, PacketHeader, PacketKeys, PayloadType, PeerTest,
    ProtocolError, RelayIntro, RelayRequest, RelayResponse, IV_SIZE, MAC_SIZE,
};

use data::OutboundMessages;
use handshake::Handshake;

/// Messages held for a session that is not yet established.
const MAX_QUEUED_MESSAGES: usize = 64;

/// Incomplete inbound messages are dropped after this long.
const INCOMPLETE_MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// State
// ============================================================================

/// Session lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Created for an endpoint we know nothing about yet.
    Unknown,
    /// An introducer told the target about us; awaiting its SessionRequest.
    Introduced,
    /// Sent SessionRequest, awaiting SessionCreated (initiator).
    RequestSent,
    /// Sent SessionCreated, awaiting SessionConfirmed (responder).
    CreatedSent,
    /// Keys agreed and identity verified.
    Established,
    /// Handshake or validation failure, or connect timeout.
    Failed,
    /// Orderly termination or idle timeout.
    Closed,
}

impl SessionState {
    pub fn is_handshaking(&self) -> bool {
        matches!(
            self,
            SessionState::Introduced | SessionState::RequestSent | SessionState::CreatedSent
        )
    }

    pub fn is_established(&self) -> bool {
        matches!(self, SessionState::Established)
    }

    /// Failed or closed; the session is due for removal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Unknown => "unknown",
            SessionState::Introduced => "introduced",
            SessionState::RequestSent => "request_sent",
            SessionState::CreatedSent => "created_sent",
            SessionState::Established => "established",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Which side opened the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionDirection {
    Inbound,
    Outbound,
}

impl fmt::Display for SessionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionDirection::Inbound => write!(f, "inbound"),
            SessionDirection::Outbound => write!(f, "outbound"),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from session packet handling.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("decode error: {0}")]
    Decode(#[from] ProtocolError),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("unexpected {payload_type} in state {state}")]
    UnexpectedPayload {
        payload_type: PayloadType,
        state: SessionState,
    },

    #[error("{0} not sealed with session keys")]
    IntroKeyed(PayloadType),

    #[error("session not established")]
    NotEstablished,

    #[error("message too large: {size} bytes > {max}")]
    MessageTooLarge { size: usize, max: usize },
}

impl SessionError {
    /// Whether the session must be failed and removed.
    ///
    /// Decode errors and out-of-state payloads only drop the packet.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Handshake(_) | SessionError::Crypto(_))
    }
}

// ============================================================================
// Parameters and events
// ============================================================================

/// Timer and retry settings applied to every session.
#[derive(Clone, Debug)]
pub struct SessionTimers {
    pub connect_timeout: Duration,
    pub termination_timeout: Duration,
    pub keepalive_interval: Duration,
    pub resend_interval: Duration,
    pub max_resends: u32,
    pub clock_skew_secs: u32,
}

impl SessionTimers {
    pub fn from_config(config: &RouterConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            termination_timeout: config.termination_timeout(),
            keepalive_interval: config.keepalive_interval(),
            resend_interval: config.resend_interval(),
            max_resends: config.max_resends,
            clock_skew_secs: config.clock_skew_secs,
        }
    }
}

impl Default for SessionTimers {
    fn default() -> Self {
        Self::from_config(&RouterConfig::default())
    }
}

/// Local router parameters a session consults while handling a packet.
pub struct LocalRouter<'a> {
    pub identity: &'a Identity,
    /// Keys derived from our own intro key.
    pub intro_keys: &'a PacketKeys,
    /// Port we listen on, as covered by handshake signatures.
    pub local_port: u16,
    /// Whether to hand out relay tags to peers that ask.
    pub accept_relay: bool,
    /// Largest datagram for the session's address family.
    pub mtu: u16,
    pub timers: &'a SessionTimers,
}

impl LocalRouter<'_> {
    /// Largest payload that fits in one datagram without extended options.
    pub fn max_payload(&self) -> usize {
        let body = (self.mtu as usize).saturating_sub(MAC_SIZE + IV_SIZE);
        (body / BLOCK_SIZE * BLOCK_SIZE).saturating_sub(1 + 4)
    }
}

/// Work for the server produced by a session.
#[derive(Debug)]
pub enum SessionEvent {
    /// Datagram for the session's remote endpoint.
    Send(Vec<u8>),
    /// The handshake completed.
    Established { identity: RouterIdentity },
    /// A reassembled application message.
    Deliver { from: IdentHash, message: Vec<u8> },
    /// The remote told us how it sees our address.
    ExternalAddress(SocketAddr),
    /// We handed the remote a relay tag; it must be registered.
    RelayTagAssigned(u32),
    RelayRequest(RelayRequest),
    RelayResponse(RelayResponse),
    RelayIntro(RelayIntro),
    PeerTest(PeerTest),
    /// The remote ended the session.
    Destroyed,
}

/// Per-session traffic counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

// ============================================================================
// Session
// ============================================================================

/// Kind of key a received packet was opened with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SealedWith {
    IntroKey,
    SessionKey,
}

/// State for one remote endpoint.
pub struct Session {
    remote: SocketAddr,
    state: SessionState,
    direction: SessionDirection,

    /// Known up front for outbound and introduced sessions, learned from
    /// SessionConfirmed otherwise.
    remote_identity: Option<RouterIdentity>,
    /// The remote's intro key, for sealing our SessionRequest and opening
    /// its SessionCreated.
    remote_intro_key: Option<IntroKey>,
    remote_intro: Option<PacketKeys>,

    keys: Option<SessionKeys>,
    packet_keys: Option<PacketKeys>,
    handshake: Option<Handshake>,

    /// Tag the remote issued us: we may publish it as our introducer.
    relay_tag: Option<u32>,
    /// Tag we issued the remote: we introduce others to it.
    assigned_relay_tag: Option<u32>,
    peer_test_capable: bool,

    created_at: Instant,
    connect_deadline: Option<Instant>,
    last_recv: Instant,
    last_send: Instant,

    outbound: OutboundMessages,
    reassembler: DataReassembler,
    stats: SessionStats,
}

impl Session {
    /// A session for an endpoint that contacted us first.
    pub fn inbound(remote: SocketAddr, now: Instant) -> Self {
        Self::new(remote, SessionDirection::Inbound, None, None, now)
    }

    /// A session we are about to open with [`Session::connect`].
    pub fn outbound(
        remote: SocketAddr,
        identity: RouterIdentity,
        intro_key: &IntroKey,
        now: Instant,
    ) -> Self {
        Self::new(
            remote,
            SessionDirection::Outbound,
            Some(identity),
            Some(*intro_key),
            now,
        )
    }

    /// A session awaiting the SessionRequest of a router an introducer
    /// told about us.
    pub fn introduced(
        remote: SocketAddr,
        identity: RouterIdentity,
        connect_timeout: Duration,
        now: Instant,
    ) -> Self {
        let mut session = Self::new(remote, SessionDirection::Outbound, Some(identity), None, now);
        session.state = SessionState::Introduced;
        session.connect_deadline = Some(now + connect_timeout);
        session
    }

    fn new(
        remote: SocketAddr,
        direction: SessionDirection,
        remote_identity: Option<RouterIdentity>,
        remote_intro_key: Option<IntroKey>,
        now: Instant,
    ) -> Self {
        Self {
            remote,
            state: SessionState::Unknown,
            direction,
            remote_identity,
            remote_intro: remote_intro_key.as_ref().map(PacketKeys::intro),
            remote_intro_key,
            keys: None,
            packet_keys: None,
            handshake: None,
            relay_tag: None,
            assigned_relay_tag: None,
            peer_test_capable: false,
            created_at: now,
            connect_deadline: None,
            last_recv: now,
            last_send: now,
            outbound: OutboundMessages::new(),
            reassembler: DataReassembler::new(),
            stats: SessionStats::default(),
        }
    }

    // === Accessors ===

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn direction(&self) -> SessionDirection {
        self.direction
    }

    pub fn remote_identity(&self) -> Option<&RouterIdentity> {
        self.remote_identity.as_ref()
    }

    pub fn ident_hash(&self) -> Option<&IdentHash> {
        self.remote_identity.as_ref().map(|id| id.ident_hash())
    }

    /// The remote's intro key, known for sessions we opened.
    pub fn remote_intro_key(&self) -> Option<&IntroKey> {
        self.remote_intro_key.as_ref()
    }

    /// Session keys, once DH values have been exchanged.
    pub fn keys(&self) -> Option<&SessionKeys> {
        self.keys.as_ref()
    }

    pub fn relay_tag(&self) -> Option<u32> {
        self.relay_tag
    }

    pub fn assigned_relay_tag(&self) -> Option<u32> {
        self.assigned_relay_tag
    }

    pub fn is_v6(&self) -> bool {
        self.remote.is_ipv6()
    }

    pub fn peer_test_capable(&self) -> bool {
        self.peer_test_capable
    }

    pub fn set_peer_test_capable(&mut self, capable: bool) {
        self.peer_test_capable = capable;
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_recv(&self) -> Instant {
        self.last_recv
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Messages waiting for the session to be established.
    pub fn queued_messages(&self) -> usize {
        self.outbound.queued_len()
    }

    /// Messages sent and not yet acknowledged.
    pub fn unacked_messages(&self) -> usize {
        self.outbound.pending_len()
    }

    // === Inbound ===

    /// Authenticate, decrypt and handle one datagram.
    ///
    /// On error no session state has changed, except for fatal errors
    /// (see [`SessionError::is_fatal`]) which leave the session `Failed`.
    pub fn receive(
        &mut self,
        local: &LocalRouter<'_>,
        packet: &[u8],
        now: Instant,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        if self.state.is_terminal() {
            return Ok(Vec::new());
        }
        let (header, payload, sealed_with) = self.open_packet(local, packet)?;
        if sealed_with == SealedWith::IntroKey && header.payload_type.requires_session_keys() {
            debug!(
                remote_addr = %self.remote,
                payload_type = %header.payload_type,
                "Dropping session payload sealed with intro key"
            );
            return Err(SessionError::IntroKeyed(header.payload_type));
        }
        check_timestamp(header.timestamp, now_secs(), local.timers.clock_skew_secs)?;

        self.stats.packets_received += 1;
        self.stats.bytes_received += packet.len() as u64;

        let result = self.dispatch(local, &header, &payload, now);
        match &result {
            Ok(_) => {
                if self.state.is_established() {
                    self.last_recv = now;
                }
            }
            Err(e) if e.is_fatal() => {
                info!(
                    remote_addr = %self.remote,
                    state = %self.state,
                    error = %e,
                    "Session handshake failed"
                );
                self.fail();
            }
            Err(_) => {}
        }
        result
    }

    /// Try each key that may have sealed a packet in our current state,
    /// reporting which kind of key opened it.
    fn open_packet(
        &self,
        local: &LocalRouter<'_>,
        packet: &[u8],
    ) -> Result<(PacketHeader, Vec<u8>, SealedWith), SessionError> {
        let mut candidates: Vec<(&PacketKeys, SealedWith)> = Vec::with_capacity(2);
        match self.state {
            SessionState::RequestSent => {
                candidates.extend(self.remote_intro.as_ref().map(|k| (k, SealedWith::IntroKey)))
            }
            SessionState::CreatedSent | SessionState::Established => {
                candidates.extend(self.packet_keys.as_ref().map(|k| (k, SealedWith::SessionKey)))
            }
            _ => {}
        }
        candidates.push((local.intro_keys, SealedWith::IntroKey));

        for (keys, sealed_with) in candidates {
            match open(keys, packet) {
                Ok((header, payload)) => return Ok((header, payload, sealed_with)),
                Err(ProtocolError::MacMismatch) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ProtocolError::MacMismatch.into())
    }

    fn dispatch(
        &mut self,
        local: &LocalRouter<'_>,
        header: &PacketHeader,
        payload: &[u8],
        now: Instant,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        match header.payload_type {
            PayloadType::SessionRequest => self.handle_session_request(local, header, payload, now),
            PayloadType::SessionCreated => self.handle_session_created(local, payload, now),
            PayloadType::SessionConfirmed => self.handle_session_confirmed(local, payload, now),
            PayloadType::Data => self.handle_data(local, payload, now),
            PayloadType::RelayRequest => {
                Ok(vec![SessionEvent::RelayRequest(RelayRequest::decode(payload)?)])
            }
            PayloadType::RelayResponse => {
                Ok(vec![SessionEvent::RelayResponse(RelayResponse::decode(payload)?)])
            }
            PayloadType::RelayIntro => {
                self.require_established(header.payload_type)?;
                Ok(vec![SessionEvent::RelayIntro(RelayIntro::decode(payload)?)])
            }
            PayloadType::PeerTest => Ok(vec![SessionEvent::PeerTest(PeerTest::decode(payload)?)]),
            PayloadType::SessionDestroyed => {
                if !self.state.is_established() && !self.state.is_handshaking() {
                    return Err(self.unexpected(header.payload_type));
                }
                info!(remote_addr = %self.remote, "Session destroyed by remote");
                self.state = SessionState::Closed;
                self.outbound.clear();
                Ok(vec![SessionEvent::Destroyed])
            }
        }
    }

    fn require_established(&self, payload_type: PayloadType) -> Result<(), SessionError> {
        if self.state.is_established() {
            Ok(())
        } else {
            Err(self.unexpected(payload_type))
        }
    }

    fn unexpected(&self, payload_type: PayloadType) -> SessionError {
        SessionError::UnexpectedPayload {
            payload_type,
            state: self.state,
        }
    }

    // === Outbound ===

    /// Seal a payload with the session keys.
    pub fn seal_payload(
        &mut self,
        payload_type: PayloadType,
        payload: &[u8],
        now: Instant,
    ) -> Result<Vec<u8>, SessionError> {
        if !self.state.is_established() {
            return Err(SessionError::NotEstablished);
        }
        let keys = self.packet_keys.as_ref().ok_or(SessionError::NotEstablished)?;
        let packet = seal(keys, &PacketHeader::new(payload_type, now_secs()), payload);
        self.record_sent(packet.len(), now);
        Ok(packet)
    }

    fn record_sent(&mut self, len: usize, now: Instant) {
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += len as u64;
        self.last_send = now;
    }

    /// Hand over messages queued while the session was not established.
    pub fn take_queued(&mut self) -> Vec<Vec<u8>> {
        self.outbound.take_queued()
    }

    // === Lifecycle ===

    fn establish(&mut self, local: &LocalRouter<'_>, now: Instant) -> Vec<SessionEvent> {
        self.state = SessionState::Established;
        self.handshake = None;
        self.connect_deadline = None;
        self.last_recv = now;
        self.last_send = now;

        let mut events = Vec::new();
        if let Some(identity) = self.remote_identity {
            info!(
                remote_addr = %self.remote,
                direction = %self.direction,
                peer = %identity.ident_hash().short(),
                "Session established"
            );
            events.push(SessionEvent::Established { identity });
        }

        for message in self.outbound.take_queued() {
            match self.send_message(local, message, now) {
                Ok(sent) => events.extend(sent),
                Err(e) => debug!(remote_addr = %self.remote, error = %e, "Dropped queued message"),
            }
        }
        events
    }

    /// Mark the session failed. Queued messages are dropped.
    pub fn fail(&mut self) {
        self.state = SessionState::Failed;
        self.handshake = None;
        self.outbound.clear();
    }

    /// End the session, notifying the remote if established.
    pub fn close(&mut self, now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if self.state.is_established()
            && let Ok(packet) = self.seal_payload(PayloadType::SessionDestroyed, &[], now)
        {
            events.push(SessionEvent::Send(packet));
        }
        self.state = SessionState::Closed;
        self.handshake = None;
        self.outbound.clear();
        events
    }

    /// Periodic maintenance: connect deadline, idle termination, resends
    /// and keep-alive.
    pub fn on_tick(&mut self, local: &LocalRouter<'_>, now: Instant) -> Vec<SessionEvent> {
        if self.state.is_handshaking() || self.state == SessionState::Unknown {
            if let Some(deadline) = self.connect_deadline
                && now >= deadline
            {
                info!(
                    remote_addr = %self.remote,
                    state = %self.state,
                    "Session connect timed out"
                );
                self.fail();
            }
            return Vec::new();
        }
        if !self.state.is_established() {
            return Vec::new();
        }

        if now.duration_since(self.last_recv) >= local.timers.termination_timeout {
            info!(
                remote_addr = %self.remote,
                idle_secs = now.duration_since(self.last_recv).as_secs(),
                "Session idle, terminating"
            );
            return self.close(now);
        }

        let mut events = self.resend_due(local, now);
        self.reassembler.expire(now, INCOMPLETE_MESSAGE_TIMEOUT);

        if now.duration_since(self.last_send) >= local.timers.keepalive_interval {
            match self.send_keepalive(now) {
                Ok(packet) => events.push(SessionEvent::Send(packet)),
                Err(e) => debug!(remote_addr = %self.remote, error = %e, "Keep-alive not sent"),
            }
        }
        events
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("remote", &self.remote)
            .field("state", &self.state)
            .field("direction", &self.direction)
            .field("remote_identity", &self.remote_identity)
            .field("relay_tag", &self.relay_tag)
            .finish_non_exhaustive()
    }
}
