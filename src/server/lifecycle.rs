//! Server lifecycle: start, stop, outbound sends and connection setup.

use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{Server, ServerError, ServerState};
use crate::context::RouterStatus;
use crate::identity::{IntroKey, RouterIdentity, RouterInfo};
use crate::session::{Session, SessionEvent};
use crate::transport::udp::{send_datagram, UdpTransport};
use crate::transport::{batch_channel, effective_mtu, AddressFamily, TransportError};

impl Server {
    /// Bind the sockets and spawn their receive tasks.
    ///
    /// Bind failure is the one error surfaced to the caller; anything
    /// already bound is released again.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        if !self.state.can_start() {
            return Err(ServerError::AlreadyStarted);
        }

        let (batch_tx, batch_rx) = batch_channel(self.ssu_config.channel_size());
        let mut binds = vec![self.ssu_config.bind_v4()];
        if self.context.supports_v6() {
            binds.push(self.ssu_config.bind_v6());
        }

        for bind in binds {
            let addr: SocketAddr = bind.parse().map_err(|e: std::net::AddrParseError| {
                ServerError::InvalidBindAddress {
                    addr: bind.clone(),
                    reason: e.to_string(),
                }
            })?;
            let family = AddressFamily::of(&addr);
            let mtu = effective_mtu(family, self.ssu_config.mtu());
            let mut transport =
                UdpTransport::new(addr, mtu, self.ssu_config.burst(), batch_tx.clone());
            if let Err(e) = transport.start_async().await {
                self.stop_transports().await;
                return Err(e.into());
            }
            self.transports.insert(family, transport);
        }

        self.batch_rx = Some(batch_rx);
        self.last_peer_test_cleanup = Instant::now();
        self.last_introducer_refresh = None;
        self.state = ServerState::Running;

        info!(
            state = %self.state,
            ident = %self.context.ident_hash().short(),
            status = %self.context.status(),
            local_addr = ?self.local_addr(AddressFamily::V4),
            "Server started"
        );
        Ok(())
    }

    /// Close every session, then the sockets.
    ///
    /// Established sessions are sent a SessionDestroyed first. Pending
    /// introductions and peer tests are dropped.
    pub async fn stop(&mut self) -> Result<(), ServerError> {
        if !self.state.can_stop() {
            return Err(ServerError::NotStarted);
        }

        let now = Instant::now();
        let sessions = self.table.drain();
        let count = sessions.len();
        for mut session in sessions {
            let remote = session.remote();
            let events = session.close(now);
            self.send_events(remote, events).await;
        }

        self.pending_introductions.clear();
        self.peer_tests.clear();
        self.introducer_since.clear();
        self.context.clear_introducers();
        self.stop_transports().await;
        self.batch_rx = None;
        self.state = ServerState::Stopped;

        info!(state = %self.state, sessions_closed = count, "Server stopped");
        Ok(())
    }

    async fn stop_transports(&mut self) {
        for (family, mut transport) in self.transports.drain() {
            if let Err(e) = transport.stop_async().await {
                debug!(family = %family, error = %e, "Transport stop failed");
            }
        }
    }

    // === Outbound ===

    /// Deliver messages to a router, connecting directly or through an
    /// introducer when no session exists yet.
    ///
    /// An existing session for the router, or for its published
    /// endpoint, is always reused.
    pub async fn send(&mut self, target: &RouterInfo, messages: Vec<Vec<u8>>) -> Result<(), ServerError> {
        if !self.state.is_operational() {
            return Err(ServerError::NotStarted);
        }
        let ident = *target.ident_hash();
        if &ident == self.context.ident_hash() {
            return Err(ServerError::SelfConnect);
        }

        if let Some(existing) = self.table.info_by_ident(&ident) {
            self.queue_on_session(existing.remote, messages).await;
            return Ok(());
        }
        if let Some(pending) = self
            .pending_introductions
            .values_mut()
            .find(|p| p.target.ident_hash() == &ident)
        {
            debug!(peer = %ident.short(), "Introduction in progress, queueing");
            pending.messages.extend(messages);
            return Ok(());
        }

        let address = target
            .ssu_address(self.context.supports_v6())
            .ok_or(ServerError::NoAddress(ident))?
            .clone();

        if let Some(endpoint) = address.endpoint().filter(|e| self.supports_endpoint(e)) {
            let request_relay_tag = self.wants_relay_tag(target);
            self.connect_session(
                endpoint,
                target.identity,
                &address.intro_key,
                request_relay_tag,
                target.caps.peer_test,
                messages,
            )
            .await;
            return Ok(());
        }

        if address.requires_introducer() {
            return self.introduce(target.identity, &address, messages).await;
        }
        Err(ServerError::NoAddress(ident))
    }

    /// Resolve a router through the netdb and send to it.
    pub async fn send_to(
        &mut self,
        ident: &crate::identity::IdentHash,
        messages: Vec<Vec<u8>>,
    ) -> Result<(), ServerError> {
        if let Some(existing) = self.table.info_by_ident(ident) {
            self.queue_on_session(existing.remote, messages).await;
            return Ok(());
        }
        match self.netdb.find_router(ident) {
            Some(info) => self.send(&info, messages).await,
            None => {
                debug!(peer = %ident.short(), "Router not found, requesting");
                self.netdb.request_missing(ident);
                Err(ServerError::NoAddress(*ident))
            }
        }
    }

    /// While unreachable, ask introducer-capable peers for a relay tag.
    fn wants_relay_tag(&self, target: &RouterInfo) -> bool {
        self.context.status() != RouterStatus::Ok && target.caps.introducer
    }

    /// Open a session to `endpoint` unless one exists, then queue
    /// `messages` on whichever session governs the endpoint.
    pub(super) async fn connect_session(
        &mut self,
        endpoint: SocketAddr,
        identity: RouterIdentity,
        intro_key: &IntroKey,
        request_relay_tag: bool,
        peer_test_capable: bool,
        messages: Vec<Vec<u8>>,
    ) {
        let now = Instant::now();
        let inserted = self.table.get_or_insert_with(endpoint, || {
            let mut session = Session::outbound(endpoint, identity, intro_key, now);
            session.set_peer_test_capable(peer_test_capable);
            session
        });

        if inserted {
            let Some(local) = self.local_router(AddressFamily::of(&endpoint)) else {
                self.table.remove(&endpoint);
                return;
            };
            let result = self
                .table
                .with_session(&endpoint, |s| s.connect(&local, request_relay_tag, now));
            match result {
                Some(Ok(events)) => {
                    info!(
                        remote_addr = %endpoint,
                        peer = %identity.ident_hash().short(),
                        relay_tag_requested = request_relay_tag,
                        "Connecting"
                    );
                    self.send_events(endpoint, events).await;
                }
                Some(Err(e)) => {
                    debug!(remote_addr = %endpoint, error = %e, "Connect failed");
                    self.remove_session(&endpoint);
                    return;
                }
                None => return,
            }
        }

        self.queue_on_session(endpoint, messages).await;
    }

    /// Hand messages to the session at `endpoint`, which sends them now
    /// or holds them until established.
    pub(super) async fn queue_on_session(&mut self, endpoint: SocketAddr, messages: Vec<Vec<u8>>) {
        if messages.is_empty() {
            return;
        }
        let Some(local) = self.local_router(AddressFamily::of(&endpoint)) else {
            return;
        };
        let now = Instant::now();
        let events = self.table.with_session(&endpoint, |session| {
            let mut events = Vec::new();
            for message in messages {
                match session.send_message(&local, message, now) {
                    Ok(sent) => events.extend(sent),
                    Err(e) => debug!(remote_addr = %endpoint, error = %e, "Message not sent"),
                }
            }
            events
        });
        if let Some(events) = events {
            self.send_events(endpoint, events).await;
        }
    }

    // === Datagram output ===

    /// Write one datagram on the socket for the endpoint's family.
    ///
    /// Send failures are logged and the packet abandoned.
    pub(super) async fn send_packet(&self, remote: SocketAddr, data: &[u8]) {
        let family = AddressFamily::of(&remote);
        let result = match self.transports.get(&family).and_then(|t| t.socket()) {
            Some(socket) => send_datagram(&socket, self.mtu_for(family), remote, data).await,
            None => Err(TransportError::NoSocket(family)),
        };
        if let Err(e) = result {
            warn!(remote_addr = %remote, error = %e, "Failed to send packet");
        }
    }

    fn mtu_for(&self, family: AddressFamily) -> u16 {
        self.transports
            .get(&family)
            .map(|t| t.mtu())
            .unwrap_or_else(|| family.fallback_mtu())
    }

    /// Write the datagrams among `events`.
    ///
    /// Used for events produced outside packet dispatch (connects, sends,
    /// ticks), which only ever carry datagrams.
    pub(super) async fn send_events(&self, remote: SocketAddr, events: Vec<SessionEvent>) {
        for event in events {
            match event {
                SessionEvent::Send(packet) => self.send_packet(remote, &packet).await,
                other => debug!(remote_addr = %remote, event = ?other, "Ignoring session event"),
            }
        }
    }

    /// Drop a session and withdraw it as introducer if published.
    pub(super) fn remove_session(&mut self, remote: &SocketAddr) {
        if let Some(session) = self.table.remove(remote) {
            debug!(
                remote_addr = %remote,
                state = %session.state(),
                "Session removed"
            );
        }
        if self.introducer_since.remove(remote).is_some() {
            self.context.remove_introducer(*remote);
        }
    }
}
