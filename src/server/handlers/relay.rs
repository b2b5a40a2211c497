//! Relay (introduction) handling for all three roles.
//!
//! Alice cannot reach Charlie directly because Charlie is behind a NAT.
//! Charlie publishes Bob as an introducer, with the relay tag Bob issued
//! him. Alice sends Bob a RelayRequest carrying that tag; Bob sends
//! Charlie a RelayIntro over their session and Alice a RelayResponse
//! naming Charlie's endpoint. Charlie then opens a session to Alice while
//! Alice punches a hole towards Charlie.

use rand::seq::SliceRandom;
use rand::Rng;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info};

use crate::identity::{RouterIdentity, SsuAddress};
use crate::protocol::{
    now_secs, seal, PacketHeader, PacketKeys, PayloadType, RelayIntro, RelayRequest,
    RelayResponse,
};
use crate::server::{PendingIntroduction, Server, ServerError};
use crate::session::Session;

impl Server {
    // === Alice ===

    /// Ask one of the target's introducers to broker a session.
    ///
    /// `messages` are held until the target connects back to us.
    pub(in crate::server) async fn introduce(
        &mut self,
        target: RouterIdentity,
        address: &SsuAddress,
        messages: Vec<Vec<u8>>,
    ) -> Result<(), ServerError> {
        let ident = *target.ident_hash();
        let candidates: Vec<_> = address
            .introducers
            .iter()
            .filter(|i| self.supports_endpoint(&i.endpoint()))
            .collect();
        let introducer = (*candidates
            .choose(&mut rand::thread_rng())
            .ok_or(ServerError::NoIntroducer(ident))?)
        .clone();

        let nonce = loop {
            let nonce: u32 = rand::thread_rng().r#gen();
            if !self.pending_introductions.contains_key(&nonce) {
                break nonce;
            }
        };
        let request = RelayRequest {
            relay_tag: introducer.relay_tag,
            alice_ip: None,
            alice_port: 0,
            alice_intro_key: *self.context.intro_key(),
            alice_identity: self.context.identity().router_identity().to_bytes(),
            nonce,
        };
        let packet = seal(
            &PacketKeys::intro(&introducer.intro_key),
            &PacketHeader::new(PayloadType::RelayRequest, now_secs()),
            &request.encode(),
        );
        let endpoint = introducer.endpoint();
        self.send_packet(endpoint, &packet).await;

        info!(
            peer = %ident.short(),
            introducer = %endpoint,
            relay_tag = introducer.relay_tag,
            "RelayRequest sent"
        );
        self.pending_introductions.insert(
            nonce,
            PendingIntroduction {
                target,
                introducer: endpoint,
                messages,
                deadline: Instant::now() + self.timers.connect_timeout,
            },
        );
        Ok(())
    }

    /// Bob told us where the target is: expect its SessionRequest and
    /// open our NAT towards it.
    pub(super) async fn handle_relay_response(&mut self, from: SocketAddr, response: RelayResponse) {
        let Some(pending) = self.pending_introductions.remove(&response.nonce) else {
            debug!(remote_addr = %from, nonce = response.nonce, "Unsolicited RelayResponse");
            return;
        };
        if let Some(ip) = response.alice_ip
            && response.alice_port != 0
        {
            self.context
                .set_external_address(SocketAddr::new(ip, response.alice_port));
        }
        let Some(charlie_ip) = response.charlie_ip else {
            debug!(remote_addr = %from, "RelayResponse without target address");
            return;
        };
        let charlie = SocketAddr::new(charlie_ip, response.charlie_port);
        if !self.supports_endpoint(&charlie) {
            debug!(remote_addr = %charlie, "RelayResponse for unsupported address family");
            return;
        }

        let now = Instant::now();
        let PendingIntroduction {
            target, messages, ..
        } = pending;
        let mut held = Some(messages);
        let connect_timeout = self.timers.connect_timeout;
        let inserted = self.table.get_or_insert_with(charlie, || {
            let mut session = Session::introduced(charlie, target, connect_timeout, now);
            session.queue_messages(held.take().unwrap_or_default());
            session
        });

        info!(
            peer = %target.ident_hash().short(),
            remote_addr = %charlie,
            introducer = %from,
            "Introduction answered"
        );

        if inserted {
            // Empty datagram: opens our NAT mapping and is dropped unread
            self.send_packet(charlie, &[]).await;
        } else if let Some(messages) = held {
            self.queue_on_session(charlie, messages).await;
        }
    }

    // === Bob ===

    /// Broker an introduction to the holder of the requested relay tag.
    pub(super) async fn handle_relay_request(&mut self, from: SocketAddr, request: RelayRequest) {
        if !self.router_config.accept_relay {
            debug!(remote_addr = %from, "Relaying disabled, ignoring RelayRequest");
            return;
        }
        let Some(charlie) = self.table.relay_tag_endpoint(request.relay_tag) else {
            debug!(remote_addr = %from, relay_tag = request.relay_tag, "Unknown relay tag");
            return;
        };
        let alice = match request.alice_ip {
            Some(ip) if request.alice_port != 0 => SocketAddr::new(ip, request.alice_port),
            _ => from,
        };

        let now = Instant::now();
        let intro = RelayIntro {
            alice_ip: Some(alice.ip()),
            alice_port: alice.port(),
            alice_intro_key: request.alice_intro_key,
            alice_identity: request.alice_identity,
        };
        let sealed = self
            .table
            .with_session(&charlie, |s| s.seal_payload(PayloadType::RelayIntro, &intro.encode(), now));
        match sealed {
            Some(Ok(packet)) => self.send_packet(charlie, &packet).await,
            Some(Err(e)) => {
                debug!(remote_addr = %charlie, error = %e, "Cannot relay to tag holder");
                return;
            }
            None => {
                debug!(remote_addr = %charlie, "Tag holder session gone");
                return;
            }
        }

        let response = RelayResponse {
            charlie_ip: Some(charlie.ip()),
            charlie_port: charlie.port(),
            alice_ip: Some(alice.ip()),
            alice_port: alice.port(),
            nonce: request.nonce,
        };
        let packet = seal(
            &PacketKeys::intro(&request.alice_intro_key),
            &PacketHeader::new(PayloadType::RelayResponse, now_secs()),
            &response.encode(),
        );
        self.send_packet(alice, &packet).await;

        info!(
            alice = %alice,
            charlie = %charlie,
            relay_tag = request.relay_tag,
            "Introduction relayed"
        );
    }

    // === Charlie ===

    /// Bob introduced a router that wants a session with us: connect to it.
    pub(super) async fn handle_relay_intro(&mut self, from: SocketAddr, intro: RelayIntro) {
        let Some(ip) = intro.alice_ip else {
            debug!(remote_addr = %from, "RelayIntro without address");
            return;
        };
        let alice = SocketAddr::new(ip, intro.alice_port);
        if !self.supports_endpoint(&alice) {
            debug!(remote_addr = %alice, "RelayIntro for unsupported address family");
            return;
        }
        let identity = match RouterIdentity::from_bytes(&intro.alice_identity) {
            Ok(identity) => identity,
            Err(e) => {
                debug!(remote_addr = %from, error = %e, "RelayIntro with invalid identity");
                return;
            }
        };
        if self.table.contains(&alice) {
            debug!(remote_addr = %alice, "Session exists, ignoring RelayIntro");
            return;
        }

        info!(
            peer = %identity.ident_hash().short(),
            remote_addr = %alice,
            introducer = %from,
            "Introduced, connecting"
        );
        self.connect_session(alice, identity, &intro.alice_intro_key, false, false, Vec::new())
            .await;
    }
}
