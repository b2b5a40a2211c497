//! Session and relay-tag tables.
//!
//! The only server state shared across threads: handles held by other
//! router components look sessions up while the RX loop mutates them.
//! Every access takes the one mutex.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crate::identity::IdentHash;
use crate::session::{Session, SessionDirection, SessionState, SessionStats};

#[derive(Default)]
struct Tables {
    sessions: HashMap<SocketAddr, Session>,
    /// Relay tags we issued, mapped to the endpoint of the tag holder.
    relay_tags: HashMap<u32, SocketAddr>,
}

/// Snapshot of one session for callers outside the RX loop.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub remote: SocketAddr,
    pub state: SessionState,
    pub direction: SessionDirection,
    pub ident_hash: Option<IdentHash>,
    /// Tag the remote issued us.
    pub relay_tag: Option<u32>,
    /// Tag we issued the remote.
    pub assigned_relay_tag: Option<u32>,
    pub peer_test_capable: bool,
    pub created_at: Instant,
    pub stats: SessionStats,
}

impl SessionInfo {
    pub fn is_v6(&self) -> bool {
        self.remote.is_ipv6()
    }
}

impl From<&Session> for SessionInfo {
    fn from(session: &Session) -> Self {
        Self {
            remote: session.remote(),
            state: session.state(),
            direction: session.direction(),
            ident_hash: session.ident_hash().copied(),
            relay_tag: session.relay_tag(),
            assigned_relay_tag: session.assigned_relay_tag(),
            peer_test_capable: session.peer_test_capable(),
            created_at: session.created_at(),
            stats: session.stats(),
        }
    }
}

/// Sessions keyed by remote endpoint, plus the relay-tag index.
#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<Tables>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }

    pub fn contains(&self, remote: &SocketAddr) -> bool {
        self.lock().sessions.contains_key(remote)
    }

    /// Insert a session built by `create` unless one exists for `remote`.
    ///
    /// Check and insert happen under one lock, so concurrent callers for
    /// the same endpoint end up sharing a single session. Returns true if
    /// this call inserted.
    pub fn get_or_insert_with(&self, remote: SocketAddr, create: impl FnOnce() -> Session) -> bool {
        let mut tables = self.lock();
        if tables.sessions.contains_key(&remote) {
            return false;
        }
        tables.sessions.insert(remote, create());
        true
    }

    /// Run `f` on the session for `remote`, if any.
    pub fn with_session<R>(&self, remote: &SocketAddr, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.lock().sessions.get_mut(remote).map(f)
    }

    /// Remove a session and any relay tag indexed to it.
    ///
    /// The tag the session was assigned is not trusted here: on a
    /// collision the index entry belongs to another session.
    pub fn remove(&self, remote: &SocketAddr) -> Option<Session> {
        let mut tables = self.lock();
        let session = tables.sessions.remove(remote)?;
        tables.relay_tags.retain(|_, holder| holder != remote);
        Some(session)
    }

    /// Remove every session, clearing the relay-tag index.
    pub fn drain(&self) -> Vec<Session> {
        let mut tables = self.lock();
        tables.relay_tags.clear();
        tables.sessions.drain().map(|(_, s)| s).collect()
    }

    /// Index a relay tag we issued. Fails if the tag is already in use.
    pub fn register_relay_tag(&self, tag: u32, remote: SocketAddr) -> bool {
        let mut tables = self.lock();
        if tables.relay_tags.contains_key(&tag) {
            return false;
        }
        tables.relay_tags.insert(tag, remote);
        true
    }

    pub fn relay_tag_endpoint(&self, tag: u32) -> Option<SocketAddr> {
        self.lock().relay_tags.get(&tag).copied()
    }

    pub fn relay_tag_count(&self) -> usize {
        self.lock().relay_tags.len()
    }

    pub fn info(&self, remote: &SocketAddr) -> Option<SessionInfo> {
        self.lock().sessions.get(remote).map(SessionInfo::from)
    }

    pub fn info_by_relay_tag(&self, tag: u32) -> Option<SessionInfo> {
        let tables = self.lock();
        let remote = tables.relay_tags.get(&tag)?;
        tables.sessions.get(remote).map(SessionInfo::from)
    }

    /// The session for a router identity, preferring an established one.
    pub fn info_by_ident(&self, ident: &IdentHash) -> Option<SessionInfo> {
        let tables = self.lock();
        let mut matching = tables
            .sessions
            .values()
            .filter(|s| s.ident_hash() == Some(ident) && !s.state().is_terminal());
        let first = matching.next()?;
        if first.state().is_established() {
            return Some(first.into());
        }
        Some(
            matching
                .find(|s| s.state().is_established())
                .unwrap_or(first)
                .into(),
        )
    }

    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.lock().sessions.keys().copied().collect()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.lock().sessions.values().map(SessionInfo::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_insert_is_unique_per_endpoint() {
        let table = SessionTable::new();
        let now = Instant::now();
        assert!(table.get_or_insert_with(addr(1), || Session::inbound(addr(1), now)));
        assert!(!table.get_or_insert_with(addr(1), || Session::inbound(addr(1), now)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_concurrent_inserts_leave_one_session() {
        let table = Arc::new(SessionTable::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    let mut inserted = 0;
                    for port in 0..50u16 {
                        if table.get_or_insert_with(addr(port), || {
                            Session::inbound(addr(port), Instant::now())
                        }) {
                            inserted += 1;
                        }
                    }
                    inserted
                })
            })
            .collect();

        let inserted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(inserted, 50);
        assert_eq!(table.len(), 50);
    }

    #[test]
    fn test_relay_tags() {
        let table = SessionTable::new();
        let now = Instant::now();
        table.get_or_insert_with(addr(7), || Session::inbound(addr(7), now));

        assert!(table.register_relay_tag(42, addr(7)));
        assert!(!table.register_relay_tag(42, addr(8)));
        assert_eq!(table.relay_tag_endpoint(42), Some(addr(7)));
        assert_eq!(table.info_by_relay_tag(42).unwrap().remote, addr(7));
        assert!(table.info_by_relay_tag(43).is_none());
    }

    #[test]
    fn test_remove_keeps_colliding_tag_holder() {
        let table = SessionTable::new();
        let now = Instant::now();
        for port in [7, 8] {
            table.get_or_insert_with(addr(port), || Session::inbound(addr(port), now));
        }
        assert!(table.register_relay_tag(42, addr(7)));
        assert!(!table.register_relay_tag(42, addr(8)));

        table.remove(&addr(8));
        assert_eq!(table.relay_tag_endpoint(42), Some(addr(7)));

        table.remove(&addr(7));
        assert_eq!(table.relay_tag_endpoint(42), None);
        assert_eq!(table.relay_tag_count(), 0);
    }

    #[test]
    fn test_drain_clears_everything() {
        let table = SessionTable::new();
        let now = Instant::now();
        for port in 1..4 {
            table.get_or_insert_with(addr(port), || Session::inbound(addr(port), now));
        }
        table.register_relay_tag(9, addr(1));
        assert_eq!(table.drain().len(), 3);
        assert!(table.is_empty());
        assert_eq!(table.relay_tag_count(), 0);
    }

    #[test]
    fn test_with_session_missing() {
        let table = SessionTable::new();
        assert!(table.with_session(&addr(1), |s| s.state()).is_none());
        assert!(table.remove(&addr(1)).is_none());
    }
}
