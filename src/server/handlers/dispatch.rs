//! Batch dispatch and session event handling.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, trace};

use crate::identity::RouterIdentity;
use crate::protocol::MIN_PACKET_SIZE;
use crate::server::Server;
use crate::session::{Session, SessionEvent, SessionState};
use crate::transport::{AddressFamily, PacketBatch};

/// Split a batch into per-endpoint runs.
///
/// Endpoints appear in order of their first packet; each run keeps its
/// packets in receipt order.
pub(crate) fn group_by_endpoint(batch: PacketBatch) -> Vec<(SocketAddr, Vec<Vec<u8>>)> {
    let mut groups: Vec<(SocketAddr, Vec<Vec<u8>>)> = Vec::new();
    let mut index: HashMap<SocketAddr, usize> = HashMap::new();
    for packet in batch {
        match index.get(&packet.remote_addr) {
            Some(&i) => groups[i].1.push(packet.data),
            None => {
                index.insert(packet.remote_addr, groups.len());
                groups.push((packet.remote_addr, vec![packet.data]));
            }
        }
    }
    groups
}

impl Server {
    /// Dispatch one burst read.
    pub(in crate::server) async fn process_batch(&mut self, batch: PacketBatch) {
        trace!(packets = batch.len(), "Processing batch");
        for (remote, packets) in group_by_endpoint(batch) {
            for packet in packets {
                self.process_packet(remote, &packet).await;
            }
        }
    }

    /// Hand one datagram to the session for its endpoint.
    ///
    /// A session is created only when the table has none for the
    /// endpoint; an existing session governs whatever its state. A
    /// session created here that the packet did not move into a
    /// handshake is discarded again.
    pub(in crate::server) async fn process_packet(&mut self, remote: SocketAddr, packet: &[u8]) {
        if packet.len() < MIN_PACKET_SIZE {
            trace!(remote_addr = %remote, len = packet.len(), "Dropping short packet");
            return;
        }
        let family = AddressFamily::of(&remote);
        let now = Instant::now();

        let created = self
            .table
            .get_or_insert_with(remote, || Session::inbound(remote, now));

        let result = {
            let Some(local) = self.local_router(family) else {
                debug!(remote_addr = %remote, family = %family, "No socket for packet family");
                return;
            };
            self.table.with_session(&remote, |session| {
                let result = session.receive(&local, packet, now);
                (result, session.state())
            })
        };
        let Some((result, state)) = result else {
            return;
        };

        match result {
            Ok(events) => self.handle_events(remote, events).await,
            Err(e) if e.is_fatal() => {
                info!(remote_addr = %remote, error = %e, "Session failed");
            }
            Err(e) => {
                debug!(remote_addr = %remote, error = %e, "Dropping packet");
            }
        }

        if state.is_terminal() || (created && state == SessionState::Unknown) {
            self.remove_session(&remote);
        }
    }

    /// Act on the events a session returned while handling a packet.
    async fn handle_events(&mut self, remote: SocketAddr, events: Vec<SessionEvent>) {
        for event in events {
            match event {
                SessionEvent::Send(packet) => self.send_packet(remote, &packet).await,
                SessionEvent::Established { identity } => {
                    self.on_session_established(remote, &identity);
                }
                SessionEvent::Deliver { from, message } => {
                    self.message_router.deliver(&from, message);
                }
                SessionEvent::ExternalAddress(addr) => {
                    self.context.set_external_address(addr);
                }
                SessionEvent::RelayTagAssigned(tag) => {
                    if !self.table.register_relay_tag(tag, remote) {
                        debug!(remote_addr = %remote, relay_tag = tag, "Relay tag collision");
                    }
                }
                SessionEvent::RelayRequest(request) => {
                    self.handle_relay_request(remote, request).await;
                }
                SessionEvent::RelayResponse(response) => {
                    self.handle_relay_response(remote, response).await;
                }
                SessionEvent::RelayIntro(intro) => {
                    self.handle_relay_intro(remote, intro).await;
                }
                SessionEvent::PeerTest(message) => {
                    self.handle_peer_test(remote, message).await;
                }
                SessionEvent::Destroyed => self.remove_session(&remote),
            }
        }
    }

    /// Fill in what we know about a newly established peer.
    fn on_session_established(&mut self, remote: SocketAddr, identity: &RouterIdentity) {
        let ident = identity.ident_hash();
        match self.netdb.find_router(ident) {
            Some(info) => {
                self.table.with_session(&remote, |s| {
                    if !s.peer_test_capable() {
                        s.set_peer_test_capable(info.caps.peer_test);
                    }
                });
            }
            None => self.netdb.request_missing(ident),
        }
        debug!(remote_addr = %remote, peer = %ident.short(), "Session ready");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ReceivedPacket;

    fn packet(port: u16, tag: u8) -> ReceivedPacket {
        ReceivedPacket::new(SocketAddr::from(([10, 0, 0, 1], port)), vec![tag])
    }

    #[test]
    fn test_group_preserves_per_endpoint_order() {
        let batch = vec![
            packet(1, 0),
            packet(2, 1),
            packet(1, 2),
            packet(3, 3),
            packet(2, 4),
            packet(1, 5),
        ];
        let groups = group_by_endpoint(batch);
        let ports: Vec<u16> = groups.iter().map(|(a, _)| a.port()).collect();
        assert_eq!(ports, vec![1, 2, 3]);
        assert_eq!(groups[0].1, vec![vec![0], vec![2], vec![5]]);
        assert_eq!(groups[1].1, vec![vec![1], vec![4]]);
        assert_eq!(groups[2].1, vec![vec![3]]);
    }

    #[test]
    fn test_group_empty_batch() {
        assert!(group_by_endpoint(Vec::new()).is_empty());
    }
}
