//! SSU Transport Server
//!
//! Owns one UDP socket per supported address family, the session table,
//! and the relay-tag table. A single RX loop drains packet batches from
//! the sockets, dispatches each packet to the session for its endpoint,
//! and acts on the events sessions return: writing datagrams, delivering
//! messages, brokering introductions and running peer tests. The same
//! loop runs the maintenance tick (session timers, introducer refresh,
//! peer-test cleanup).
//!
//! Other router components reach the server through a cloneable
//! [`ServerHandle`]: lookups go straight to the shared session table,
//! outbound sends are queued as [`Command`]s for the loop.

mod handlers;
mod introducer;
mod lifecycle;
mod peer_test;
mod table;

#[cfg(test)]
mod tests;

pub use peer_test::PeerTestRole;
pub use table::{SessionInfo, SessionTable};

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{Config, ConfigError, RouterConfig, SsuConfig};
use crate::context::{RouterContext, RouterStatus};
use crate::identity::{IdentHash, RouterIdentity, RouterInfo};
use crate::netdb::{MessageRouter, NetDb};
use crate::protocol::PacketKeys;
use crate::session::{LocalRouter, SessionError, SessionTimers};
use crate::transport::udp::UdpTransport;
use crate::transport::{AddressFamily, BatchRx, TransportError};

use peer_test::PeerTestRegistry;

/// Capacity of the command channel from handles to the RX loop.
const COMMAND_CHANNEL_SIZE: usize = 256;

/// Errors related to server operations.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server not started")]
    NotStarted,

    #[error("server already started")]
    AlreadyStarted,

    #[error("invalid bind address '{addr}': {reason}")]
    InvalidBindAddress { addr: String, reason: String },

    #[error("router {0} has no usable SSU address")]
    NoAddress(IdentHash),

    #[error("no usable introducer for router {0}")]
    NoIntroducer(IdentHash),

    #[error("refusing to connect to ourselves")]
    SelfConnect,

    #[error("server command channel closed")]
    ChannelClosed,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Server operational state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    /// Created but not started.
    Created,
    /// Sockets bound, RX loop may run.
    Running,
    /// Stopped; may be started again.
    Stopped,
}

impl ServerState {
    pub fn is_operational(&self) -> bool {
        matches!(self, ServerState::Running)
    }

    pub fn can_start(&self) -> bool {
        matches!(self, ServerState::Created | ServerState::Stopped)
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, ServerState::Running)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Created => "created",
            ServerState::Running => "running",
            ServerState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Work submitted to the RX loop from outside.
#[derive(Debug)]
pub enum Command {
    /// Deliver messages to a router, connecting first if needed.
    Send {
        target: RouterInfo,
        messages: Vec<Vec<u8>>,
    },
    /// Send to a router known only by hash, resolved through the netdb.
    SendTo {
        ident: IdentHash,
        messages: Vec<Vec<u8>>,
    },
}

/// An introduction we asked for and have not yet seen answered.
pub(crate) struct PendingIntroduction {
    pub target: RouterIdentity,
    pub introducer: SocketAddr,
    pub messages: Vec<Vec<u8>>,
    pub deadline: Instant,
}

/// Cloneable access to a running server.
#[derive(Clone)]
pub struct ServerHandle {
    table: Arc<SessionTable>,
    context: Arc<RouterContext>,
    command_tx: mpsc::Sender<Command>,
}

impl ServerHandle {
    /// Queue messages for a router; the RX loop connects as needed.
    pub async fn send(&self, target: RouterInfo, messages: Vec<Vec<u8>>) -> Result<(), ServerError> {
        self.command_tx
            .send(Command::Send { target, messages })
            .await
            .map_err(|_| ServerError::ChannelClosed)
    }

    /// Queue messages for a router known only by hash.
    pub async fn send_to(&self, ident: IdentHash, messages: Vec<Vec<u8>>) -> Result<(), ServerError> {
        self.command_tx
            .send(Command::SendTo { ident, messages })
            .await
            .map_err(|_| ServerError::ChannelClosed)
    }

    pub fn find_session(&self, remote: &SocketAddr) -> Option<SessionInfo> {
        self.table.info(remote)
    }

    pub fn find_session_by_relay_tag(&self, tag: u32) -> Option<SessionInfo> {
        self.table.info_by_relay_tag(tag)
    }

    pub fn find_session_by_ident(&self, ident: &IdentHash) -> Option<SessionInfo> {
        self.table.info_by_ident(ident)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.table.snapshot()
    }

    pub fn session_count(&self) -> usize {
        self.table.len()
    }

    pub fn status(&self) -> RouterStatus {
        self.context.status()
    }

    /// Report the outcome of reachability detection made elsewhere.
    pub fn set_status(&self, status: RouterStatus) -> bool {
        self.context.set_status(status)
    }
}

/// The SSU transport server.
pub struct Server {
    router_config: RouterConfig,
    ssu_config: SsuConfig,
    timers: SessionTimers,
    context: Arc<RouterContext>,
    intro_keys: PacketKeys,

    netdb: Arc<dyn NetDb>,
    message_router: Arc<dyn MessageRouter>,

    state: ServerState,
    transports: HashMap<AddressFamily, UdpTransport>,
    batch_rx: Option<BatchRx>,
    command_tx: mpsc::Sender<Command>,
    command_rx: Option<mpsc::Receiver<Command>>,

    table: Arc<SessionTable>,
    pending_introductions: HashMap<u32, PendingIntroduction>,
    peer_tests: PeerTestRegistry,
    /// When each published introducer was selected.
    introducer_since: HashMap<SocketAddr, Instant>,
    last_introducer_refresh: Option<Instant>,
    last_peer_test_cleanup: Instant,
}

impl Server {
    /// Create a server from configuration, generating any missing
    /// identity material.
    pub fn new(
        config: &Config,
        netdb: Arc<dyn NetDb>,
        message_router: Arc<dyn MessageRouter>,
    ) -> Result<Self, ServerError> {
        let identity = config.create_identity()?;
        let intro_key = config.intro_key()?;
        let status = match config.status.firewalled {
            Some(true) => RouterStatus::Firewalled,
            Some(false) => RouterStatus::Ok,
            None => RouterStatus::Testing,
        };
        let context = Arc::new(RouterContext::new(
            identity,
            intro_key,
            config.transport.ssu.ipv6(),
            config.router.max_introducers,
            status,
        ));
        Ok(Self::with_context(config, context, netdb, message_router))
    }

    /// Create a server around an existing router context.
    pub fn with_context(
        config: &Config,
        context: Arc<RouterContext>,
        netdb: Arc<dyn NetDb>,
        message_router: Arc<dyn MessageRouter>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        Self {
            router_config: config.router.clone(),
            ssu_config: config.transport.ssu.clone(),
            timers: SessionTimers::from_config(&config.router),
            intro_keys: PacketKeys::intro(context.intro_key()),
            context,
            netdb,
            message_router,
            state: ServerState::Created,
            transports: HashMap::new(),
            batch_rx: None,
            command_tx,
            command_rx: Some(command_rx),
            table: Arc::new(SessionTable::new()),
            pending_introductions: HashMap::new(),
            peer_tests: PeerTestRegistry::new(),
            introducer_since: HashMap::new(),
            last_introducer_refresh: None,
            last_peer_test_cleanup: Instant::now(),
        }
    }

    // === Accessors ===

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn context(&self) -> &Arc<RouterContext> {
        &self.context
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            table: Arc::clone(&self.table),
            context: Arc::clone(&self.context),
            command_tx: self.command_tx.clone(),
        }
    }

    pub fn session_table(&self) -> &SessionTable {
        &self.table
    }

    /// Bound address of the socket for `family` (only valid after start).
    pub fn local_addr(&self, family: AddressFamily) -> Option<SocketAddr> {
        self.transports.get(&family).and_then(|t| t.local_addr())
    }

    /// Our routing-database record as currently publishable.
    pub fn router_info(&self) -> Option<RouterInfo> {
        let listen = self.local_addr(AddressFamily::V4)?;
        Some(self.context.router_info(listen))
    }

    pub fn pending_introduction_count(&self) -> usize {
        self.pending_introductions.len()
    }

    pub fn peer_test_count(&self) -> usize {
        self.peer_tests.len()
    }

    /// Session parameters for a packet on `family`'s socket.
    fn local_router(&self, family: AddressFamily) -> Option<LocalRouter<'_>> {
        let transport = self.transports.get(&family)?;
        let local_addr = transport.local_addr()?;
        Some(LocalRouter {
            identity: self.context.identity(),
            intro_keys: &self.intro_keys,
            local_port: local_addr.port(),
            accept_relay: self.router_config.accept_relay,
            mtu: transport.mtu(),
            timers: &self.timers,
        })
    }

    /// Whether we can reach `addr` at all.
    fn supports_endpoint(&self, addr: &SocketAddr) -> bool {
        self.transports.contains_key(&AddressFamily::of(addr))
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state)
            .field("context", &self.context)
            .field("sessions", &self.table.len())
            .finish_non_exhaustive()
    }
}
