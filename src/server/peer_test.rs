//! Peer Testing
//!
//! Reachability detection with three routers:
//!
//! ```text
//! Alice ──(1) PeerTest──▶ Bob            over the Alice/Bob session
//! Bob   ──(2) PeerTest──▶ Charlie        over the Bob/Charlie session, with Alice's endpoint and intro key
//! Charlie ─(3) PeerTest─▶ Bob            over the session, with Charlie's intro key
//! Charlie ─(4) PeerTest─▶ Alice          direct, sealed with Alice's intro key
//! Bob   ──(5) PeerTest──▶ Alice          over the session, relaying (3)
//! Alice ──(6) PeerTest──▶ Charlie        direct, sealed with Charlie's intro key
//! ```
//!
//! Alice is reachable if (4) arrives. If only (5) arrives before the
//! record expires, she is firewalled. Each router tracks its part in a
//! record keyed by the test nonce; records are kept until they expire so
//! late or duplicated messages cannot start a new test.

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{Server, SessionInfo};
use crate::context::RouterStatus;
use crate::protocol::{now_secs, seal, PacketHeader, PacketKeys, PayloadType, PeerTest};

/// Our part in a peer test.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerTestRole {
    /// Started the test; waiting to hear from Bob and Charlie.
    Alice1,
    /// Charlie's direct probe arrived; the test succeeded.
    Alice2,
    /// Relaying between Alice and Charlie.
    Bob,
    /// Probing Alice directly.
    Charlie,
}

impl fmt::Display for PeerTestRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerTestRole::Alice1 => "alice1",
            PeerTestRole::Alice2 => "alice2",
            PeerTestRole::Bob => "bob",
            PeerTestRole::Charlie => "charlie",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct PeerTestRecord {
    pub role: PeerTestRole,
    pub created: Instant,
    /// Bob for Alice; Alice for Bob and Charlie.
    pub peer: SocketAddr,
    /// Charlie, once known to Bob.
    pub charlie: Option<SocketAddr>,
    /// Alice has heard back from Bob.
    pub bob_replied: bool,
}

impl PeerTestRecord {
    fn new(role: PeerTestRole, peer: SocketAddr, now: Instant) -> Self {
        Self {
            role,
            created: now,
            peer,
            charlie: None,
            bob_replied: false,
        }
    }
}

/// Peer test records keyed by nonce.
#[derive(Default)]
pub(crate) struct PeerTestRegistry {
    records: HashMap<u32, PeerTestRecord>,
}

impl PeerTestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn get(&self, nonce: u32) -> Option<&PeerTestRecord> {
        self.records.get(&nonce)
    }

    pub fn get_mut(&mut self, nonce: u32) -> Option<&mut PeerTestRecord> {
        self.records.get_mut(&nonce)
    }

    pub fn insert(&mut self, nonce: u32, record: PeerTestRecord) {
        self.records.insert(nonce, record);
    }

    pub fn contains(&self, nonce: u32) -> bool {
        self.records.contains_key(&nonce)
    }

    /// Whether a test we started is still waiting for its outcome.
    pub fn has_active_test(&self) -> bool {
        self.records.values().any(|r| r.role == PeerTestRole::Alice1)
    }

    /// Remove and return records older than `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<(u32, PeerTestRecord)> {
        let expired: Vec<u32> = self
            .records
            .iter()
            .filter(|(_, r)| now.duration_since(r.created) >= timeout)
            .map(|(nonce, _)| *nonce)
            .collect();
        expired
            .into_iter()
            .filter_map(|nonce| self.records.remove(&nonce).map(|r| (nonce, r)))
            .collect()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl Server {
    /// Start a test through a random established peer-test-capable session.
    ///
    /// Returns false if a test is already running or no Bob is available.
    pub async fn start_peer_test(&mut self, now: Instant) -> bool {
        if self.peer_tests.has_active_test() {
            return false;
        }
        let supports_v6 = self.context.supports_v6();
        let candidates: Vec<SessionInfo> = self
            .table
            .snapshot()
            .into_iter()
            .filter(|s| s.state.is_established() && s.peer_test_capable && (supports_v6 || !s.is_v6()))
            .collect();
        let Some(bob) = candidates.choose(&mut rand::thread_rng()).map(|s| s.remote) else {
            debug!("No peer available for peer test");
            return false;
        };

        let nonce = self.allocate_peer_test_nonce();
        let message = PeerTest {
            nonce,
            ip: None,
            port: 0,
            intro_key: *self.context.intro_key(),
        };
        if !self.send_peer_test_over_session(bob, &message, now).await {
            return false;
        }
        self.peer_tests
            .insert(nonce, PeerTestRecord::new(PeerTestRole::Alice1, bob, now));
        info!(bob = %bob, nonce, "Peer test started");
        true
    }

    fn allocate_peer_test_nonce(&self) -> u32 {
        loop {
            let nonce: u32 = rand::thread_rng().r#gen();
            if !self.peer_tests.contains(nonce) {
                return nonce;
            }
        }
    }

    /// Route a PeerTest payload by our record for its nonce.
    pub(super) async fn handle_peer_test(&mut self, from: SocketAddr, message: PeerTest) {
        let now = Instant::now();
        let Some(record) = self.peer_tests.get(message.nonce).cloned() else {
            let from_session = self
                .table
                .info(&from)
                .is_some_and(|s| s.state.is_established());
            if !from_session {
                debug!(remote_addr = %from, nonce = message.nonce, "PeerTest for unknown test");
                return;
            }
            if message.ip.is_none() {
                self.peer_test_as_bob(from, message, now).await;
            } else {
                self.peer_test_as_charlie(from, message, now).await;
            }
            return;
        };

        match record.role {
            PeerTestRole::Alice1 if from == record.peer => {
                if let Some(r) = self.peer_tests.get_mut(message.nonce) {
                    r.bob_replied = true;
                }
                debug!(nonce = message.nonce, "Peer test reply from Bob");
            }
            PeerTestRole::Alice1 => {
                // Charlie reached us without a session: we are reachable
                if let Some(r) = self.peer_tests.get_mut(message.nonce) {
                    r.role = PeerTestRole::Alice2;
                }
                let reply = PeerTest {
                    nonce: message.nonce,
                    ip: None,
                    port: 0,
                    intro_key: *self.context.intro_key(),
                };
                self.send_peer_test_direct(from, &message.intro_key, &reply).await;
                info!(charlie = %from, nonce = message.nonce, "Peer test complete, reachable");
                self.context.set_status(RouterStatus::Ok);
            }
            PeerTestRole::Bob if Some(from) == record.charlie => {
                let Some(ip) = message.ip else {
                    return;
                };
                let relay = PeerTest {
                    nonce: message.nonce,
                    ip: Some(ip),
                    port: message.port,
                    intro_key: message.intro_key,
                };
                self.send_peer_test_over_session(record.peer, &relay, now).await;
                debug!(alice = %record.peer, nonce = message.nonce, "Peer test reply relayed");
            }
            PeerTestRole::Charlie if from == record.peer => {
                debug!(alice = %from, nonce = message.nonce, "Peer test confirmed by Alice");
            }
            role => {
                debug!(
                    remote_addr = %from,
                    nonce = message.nonce,
                    role = %role,
                    "Ignoring PeerTest"
                );
            }
        }
    }

    /// Alice asked us to test her: pick a Charlie among our other peers.
    async fn peer_test_as_bob(&mut self, alice: SocketAddr, message: PeerTest, now: Instant) {
        let supports_v6 = self.context.supports_v6();
        let candidates: Vec<SocketAddr> = self
            .table
            .snapshot()
            .into_iter()
            .filter(|s| s.state.is_established() && s.remote != alice && (supports_v6 || !s.is_v6()))
            .map(|s| s.remote)
            .collect();
        let Some(&charlie) = candidates.choose(&mut rand::thread_rng()) else {
            debug!(alice = %alice, "No Charlie available for peer test");
            return;
        };

        let relay = PeerTest {
            nonce: message.nonce,
            ip: Some(alice.ip()),
            port: alice.port(),
            intro_key: message.intro_key,
        };
        if !self.send_peer_test_over_session(charlie, &relay, now).await {
            return;
        }
        let mut record = PeerTestRecord::new(PeerTestRole::Bob, alice, now);
        record.charlie = Some(charlie);
        self.peer_tests.insert(message.nonce, record);
        debug!(alice = %alice, charlie = %charlie, nonce = message.nonce, "Peer test relayed to Charlie");
    }

    /// Bob asked us to probe Alice.
    async fn peer_test_as_charlie(&mut self, bob: SocketAddr, message: PeerTest, now: Instant) {
        let Some(ip) = message.ip else {
            return;
        };
        let alice = SocketAddr::new(ip, message.port);
        if !self.supports_endpoint(&alice) {
            debug!(alice = %alice, "Peer test for unsupported address family");
            return;
        }
        self.peer_tests
            .insert(message.nonce, PeerTestRecord::new(PeerTestRole::Charlie, alice, now));

        let ours = *self.context.intro_key();
        let reply = PeerTest {
            nonce: message.nonce,
            ip: Some(ip),
            port: message.port,
            intro_key: ours,
        };
        self.send_peer_test_over_session(bob, &reply, now).await;
        self.send_peer_test_direct(alice, &message.intro_key, &reply).await;
        debug!(alice = %alice, bob = %bob, nonce = message.nonce, "Peer test probe sent");
    }

    async fn send_peer_test_over_session(&mut self, remote: SocketAddr, message: &PeerTest, now: Instant) -> bool {
        let sealed = self
            .table
            .with_session(&remote, |s| s.seal_payload(PayloadType::PeerTest, &message.encode(), now));
        match sealed {
            Some(Ok(packet)) => {
                self.send_packet(remote, &packet).await;
                true
            }
            Some(Err(e)) => {
                debug!(remote_addr = %remote, error = %e, "Cannot send PeerTest");
                false
            }
            None => false,
        }
    }

    async fn send_peer_test_direct(&self, remote: SocketAddr, intro_key: &[u8; 32], message: &PeerTest) {
        let packet = seal(
            &PacketKeys::intro(intro_key),
            &PacketHeader::new(PayloadType::PeerTest, now_secs()),
            &message.encode(),
        );
        self.send_packet(remote, &packet).await;
    }

    /// Expire stale records. A test that heard only from Bob means we
    /// are firewalled.
    pub(super) fn cleanup_peer_tests(&mut self, now: Instant) {
        for (nonce, record) in self.peer_tests.expire(now, self.router_config.peer_test_timeout()) {
            if record.role == PeerTestRole::Alice1 {
                if record.bob_replied {
                    info!(nonce, "Peer test complete, firewalled");
                    self.context.set_status(RouterStatus::Firewalled);
                } else {
                    debug!(nonce, "Peer test expired without reply");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_registry_expire() {
        let mut registry = PeerTestRegistry::new();
        let start = Instant::now();
        registry.insert(1, PeerTestRecord::new(PeerTestRole::Alice1, addr(1), start));
        registry.insert(
            2,
            PeerTestRecord::new(PeerTestRole::Bob, addr(2), start + Duration::from_secs(30)),
        );
        assert!(registry.has_active_test());

        let expired = registry.expire(start + Duration::from_secs(60), Duration::from_secs(60));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, 1);
        assert!(!registry.has_active_test());
        assert_eq!(registry.len(), 1);

        let expired = registry.expire(start + Duration::from_secs(90), Duration::from_secs(60));
        assert_eq!(expired.len(), 1);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(PeerTestRole::Alice2.to_string(), "alice2");
        assert_eq!(PeerTestRole::Charlie.to_string(), "charlie");
    }
}
