//! Router Collaborators
//!
//! The transport depends on two external components, modelled as traits:
//!
//! - [`NetDb`]: the routing database, resolving router hashes to
//!   [`RouterInfo`] records and supplying introducers.
//! - [`MessageRouter`]: the consumer of application messages that
//!   arrive on established sessions.
//!
//! In-memory implementations back the daemon binary and the tests.

use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::identity::{IdentHash, RouterInfo};

/// Routing database lookups used by the transport.
pub trait NetDb: Send + Sync {
    /// Resolve a router record.
    fn find_router(&self, ident: &IdentHash) -> Option<RouterInfo>;

    /// Ask for a record that was not found; the fetch is asynchronous.
    fn request_missing(&self, ident: &IdentHash);

    /// A random reachable router willing to act as introducer.
    fn random_introducer(&self) -> Option<RouterInfo>;
}

/// Receiver of decrypted application messages.
pub trait MessageRouter: Send + Sync {
    /// Called once per reassembled message on an established session.
    fn deliver(&self, from: &IdentHash, message: Vec<u8>);
}

/// Routing database backed by a hash map.
#[derive(Default)]
pub struct MemoryNetDb {
    routers: RwLock<HashMap<IdentHash, RouterInfo>>,
    requested: RwLock<HashSet<IdentHash>>,
}

impl MemoryNetDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: RouterInfo) {
        let ident = *info.ident_hash();
        self.routers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ident, info);
        self.requested
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&ident);
    }

    pub fn len(&self) -> usize {
        self.routers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a fetch has been requested and not yet satisfied.
    pub fn was_requested(&self, ident: &IdentHash) -> bool {
        self.requested
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(ident)
    }
}

impl NetDb for MemoryNetDb {
    fn find_router(&self, ident: &IdentHash) -> Option<RouterInfo> {
        self.routers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(ident)
            .cloned()
    }

    fn request_missing(&self, ident: &IdentHash) {
        debug!(router = %ident.short(), "Router lookup requested");
        self.requested
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(*ident);
    }

    fn random_introducer(&self) -> Option<RouterInfo> {
        let routers = self.routers.read().unwrap_or_else(|e| e.into_inner());
        let candidates: Vec<&RouterInfo> = routers
            .values()
            .filter(|r| r.caps.introducer)
            .filter(|r| r.ssu_address(false).and_then(|a| a.endpoint()).is_some())
            .collect();
        candidates.choose(&mut rand::thread_rng()).map(|r| (*r).clone())
    }
}

/// Message router forwarding deliveries into a channel.
pub struct ChannelRouter {
    tx: mpsc::UnboundedSender<(IdentHash, Vec<u8>)>,
}

impl ChannelRouter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(IdentHash, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageRouter for ChannelRouter {
    fn deliver(&self, from: &IdentHash, message: Vec<u8>) {
        if self.tx.send((*from, message)).is_err() {
            debug!(from = %from.short(), "Message receiver dropped, discarding delivery");
        }
    }
}
