//! Router Context
//!
//! Local router state the transport consults and updates: identity,
//! intro key, IPv6 support, reachability status, the externally observed
//! address, and the introducers currently published for this router.
//! Shared between the server loop and other router components via `Arc`;
//! all mutation goes through the setters here.

use std::fmt;
use std::net::SocketAddr;
use std::sync::RwLock;
use tracing::info;

use crate::identity::{
    IdentHash, Identity, IntroKey, IntroducerInfo, RouterCaps, RouterInfo, SsuAddress,
};

/// Reachability of the local router.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouterStatus {
    /// Not yet determined; a peer test is pending.
    Testing,
    /// Directly reachable from the internet.
    Ok,
    /// Unreachable; peers must connect through introducers.
    Firewalled,
}

impl fmt::Display for RouterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RouterStatus::Testing => "testing",
            RouterStatus::Ok => "ok",
            RouterStatus::Firewalled => "firewalled",
        };
        write!(f, "{}", s)
    }
}

struct Published {
    status: RouterStatus,
    external_addr: Option<SocketAddr>,
    introducers: Vec<IntroducerInfo>,
}

/// Local router status and configuration.
pub struct RouterContext {
    identity: Identity,
    intro_key: IntroKey,
    supports_v6: bool,
    max_introducers: usize,
    published: RwLock<Published>,
}

impl RouterContext {
    pub fn new(
        identity: Identity,
        intro_key: IntroKey,
        supports_v6: bool,
        max_introducers: usize,
        status: RouterStatus,
    ) -> Self {
        Self {
            identity,
            intro_key,
            supports_v6,
            max_introducers,
            published: RwLock::new(Published {
                status,
                external_addr: None,
                introducers: Vec::new(),
            }),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn ident_hash(&self) -> &IdentHash {
        self.identity.ident_hash()
    }

    pub fn intro_key(&self) -> &IntroKey {
        &self.intro_key
    }

    pub fn supports_v6(&self) -> bool {
        self.supports_v6
    }

    pub fn max_introducers(&self) -> usize {
        self.max_introducers
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Published> {
        self.published.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Published> {
        self.published.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> RouterStatus {
        self.read().status
    }

    pub fn is_firewalled(&self) -> bool {
        self.status() == RouterStatus::Firewalled
    }

    /// Update reachability. Returns true if the status changed.
    pub fn set_status(&self, status: RouterStatus) -> bool {
        let mut published = self.write();
        if published.status == status {
            return false;
        }
        info!(from = %published.status, to = %status, "Router status changed");
        published.status = status;
        true
    }

    pub fn external_address(&self) -> Option<SocketAddr> {
        self.read().external_addr
    }

    /// Record our address as observed by a peer. Returns true if it changed.
    pub fn set_external_address(&self, addr: SocketAddr) -> bool {
        let mut published = self.write();
        if published.external_addr == Some(addr) {
            return false;
        }
        info!(external_addr = %addr, "External address updated");
        published.external_addr = Some(addr);
        true
    }

    pub fn introducers(&self) -> Vec<IntroducerInfo> {
        self.read().introducers.clone()
    }

    pub fn introducer_count(&self) -> usize {
        self.read().introducers.len()
    }

    /// Publish an introducer.
    ///
    /// Rejected when the set is full, the introducer's address family is
    /// unsupported, or an entry for the same endpoint already exists.
    pub fn add_introducer(&self, introducer: IntroducerInfo) -> bool {
        if introducer.host.is_ipv6() && !self.supports_v6 {
            return false;
        }
        let mut published = self.write();
        if published.introducers.len() >= self.max_introducers {
            return false;
        }
        if published
            .introducers
            .iter()
            .any(|i| i.endpoint() == introducer.endpoint())
        {
            return false;
        }
        info!(
            introducer = %introducer.endpoint(),
            relay_tag = introducer.relay_tag,
            "Introducer added"
        );
        published.introducers.push(introducer);
        true
    }

    /// Withdraw the introducer at `endpoint`. Returns true if one was removed.
    pub fn remove_introducer(&self, endpoint: SocketAddr) -> bool {
        let mut published = self.write();
        let before = published.introducers.len();
        published.introducers.retain(|i| i.endpoint() != endpoint);
        let removed = published.introducers.len() != before;
        if removed {
            info!(introducer = %endpoint, "Introducer removed");
        }
        removed
    }

    pub fn clear_introducers(&self) {
        let mut published = self.write();
        if !published.introducers.is_empty() {
            info!(count = published.introducers.len(), "Introducers cleared");
            published.introducers.clear();
        }
    }

    /// Our own routing-database record as currently publishable.
    ///
    /// A firewalled router publishes its introducers and no host. Until a
    /// peer reports our external address, a specific bind address is
    /// published as is.
    pub fn router_info(&self, listen: SocketAddr) -> RouterInfo {
        let published = self.read();
        let address = if published.status == RouterStatus::Firewalled {
            SsuAddress {
                host: None,
                port: listen.port(),
                intro_key: self.intro_key,
                introducers: published.introducers.clone(),
            }
        } else {
            let endpoint = published
                .external_addr
                .or_else(|| (!listen.ip().is_unspecified()).then_some(listen));
            SsuAddress {
                host: endpoint.map(|a| a.ip()),
                port: endpoint.map(|a| a.port()).unwrap_or(listen.port()),
                intro_key: self.intro_key,
                introducers: Vec::new(),
            }
        };
        let caps = RouterCaps {
            peer_test: true,
            introducer: published.status == RouterStatus::Ok,
        };
        RouterInfo::new(*self.identity.router_identity(), vec![address], caps)
    }
}

impl fmt::Debug for RouterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterContext")
            .field("ident_hash", self.ident_hash())
            .field("status", &self.status())
            .field("supports_v6", &self.supports_v6)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn context(max: usize) -> RouterContext {
        RouterContext::new(Identity::generate(), [1u8; 32], false, max, RouterStatus::Testing)
    }

    fn introducer(port: u16) -> IntroducerInfo {
        IntroducerInfo {
            host: "10.0.0.1".parse().unwrap(),
            port,
            intro_key: [2u8; 32],
            relay_tag: port as u32,
        }
    }

    #[test]
    fn test_status_transitions() {
        let ctx = context(3);
        assert_eq!(ctx.status(), RouterStatus::Testing);
        assert!(ctx.set_status(RouterStatus::Firewalled));
        assert!(!ctx.set_status(RouterStatus::Firewalled));
        assert!(ctx.is_firewalled());
        assert!(ctx.set_status(RouterStatus::Ok));
        assert!(!ctx.is_firewalled());
    }

    #[test]
    fn test_introducer_bound() {
        let ctx = context(2);
        assert!(ctx.add_introducer(introducer(1)));
        assert!(!ctx.add_introducer(introducer(1)));
        assert!(ctx.add_introducer(introducer(2)));
        assert!(!ctx.add_introducer(introducer(3)));
        assert_eq!(ctx.introducer_count(), 2);

        assert!(ctx.remove_introducer(introducer(1).endpoint()));
        assert!(!ctx.remove_introducer(introducer(1).endpoint()));
        assert!(ctx.add_introducer(introducer(3)));
        ctx.clear_introducers();
        assert_eq!(ctx.introducer_count(), 0);
    }

    #[test]
    fn test_v6_introducer_rejected_without_support() {
        let ctx = context(3);
        let mut v6 = introducer(1);
        v6.host = IpAddr::V6("2001:db8::1".parse().unwrap());
        assert!(!ctx.add_introducer(v6));
    }

    #[test]
    fn test_router_info_reflects_status() {
        let ctx = context(3);
        ctx.set_external_address("203.0.113.9:4567".parse().unwrap());
        ctx.set_status(RouterStatus::Ok);
        let listen: SocketAddr = "0.0.0.0:4567".parse().unwrap();
        let info = ctx.router_info(listen);
        let addr = info.ssu_address(false).unwrap();
        assert_eq!(addr.endpoint(), Some("203.0.113.9:4567".parse().unwrap()));
        assert!(info.caps.introducer);

        ctx.set_status(RouterStatus::Firewalled);
        ctx.add_introducer(introducer(7));
        let info = ctx.router_info(listen);
        let addr = info.ssu_address(false).unwrap();
        assert!(addr.requires_introducer());
        assert_eq!(addr.host, None);
        assert!(!info.caps.introducer);
    }

    #[test]
    fn test_router_info_uses_specific_bind_address() {
        let ctx = context(3);
        let info = ctx.router_info("127.0.0.1:9000".parse().unwrap());
        let addr = info.ssu_address(false).unwrap();
        assert_eq!(addr.endpoint(), Some("127.0.0.1:9000".parse().unwrap()));

        let info = ctx.router_info("0.0.0.0:9000".parse().unwrap());
        assert_eq!(info.ssu_address(false).unwrap().endpoint(), None);
    }
}
