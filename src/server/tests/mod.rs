//! Server integration tests over loopback UDP.
//!
//! Servers are started for real but the RX loop is not spawned: tests
//! pump each server's batch and command channels by hand, so every
//! step is deterministic apart from socket delivery.

mod peer_test;

use super::*;
use crate::config::Config;
use crate::crypto::SessionKeys;
use crate::netdb::{ChannelRouter, MemoryNetDb};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

const PUMP_DEADLINE: Duration = Duration::from_secs(5);

pub(super) struct TestRouter {
    pub server: Server,
    pub netdb: Arc<MemoryNetDb>,
    pub delivered: UnboundedReceiver<(IdentHash, Vec<u8>)>,
}

/// Loopback config with the given initial reachability.
pub(super) fn test_config(firewalled: Option<bool>) -> Config {
    let mut config = Config::new();
    config.transport.ssu.bind_v4 = Some("127.0.0.1".into());
    config.transport.ssu.port = Some(0);
    config.transport.ssu.mtu = Some(1484);
    config.status.firewalled = firewalled;
    config
}

pub(super) async fn start_router(config: Config) -> TestRouter {
    let netdb = Arc::new(MemoryNetDb::new());
    let (message_router, delivered) = ChannelRouter::new();
    let mut server = Server::new(&config, netdb.clone(), Arc::new(message_router)).unwrap();
    server.start().await.unwrap();
    TestRouter {
        server,
        netdb,
        delivered,
    }
}

impl TestRouter {
    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr(AddressFamily::V4).unwrap()
    }

    pub fn info(&self) -> RouterInfo {
        self.server.router_info().unwrap()
    }

    pub fn ident(&self) -> IdentHash {
        *self.server.context.ident_hash()
    }

    pub fn session_with(&self, other: &TestRouter) -> Option<SessionInfo> {
        self.server.table.info_by_ident(&other.ident())
    }

    pub fn established_with(&self, other: &TestRouter) -> bool {
        self.session_with(other)
            .is_some_and(|s| s.state.is_established())
    }

    pub fn keys_with(&self, other: &TestRouter) -> Option<SessionKeys> {
        let remote = self.session_with(other)?.remote;
        self.server
            .table
            .with_session(&remote, |s| s.keys().cloned())
            .flatten()
    }

    /// Process everything already queued on the batch and command channels.
    pub async fn drain(&mut self) {
        let mut batches = Vec::new();
        if let Some(rx) = self.server.batch_rx.as_mut() {
            while let Ok(batch) = rx.try_recv() {
                batches.push(batch);
            }
        }
        for batch in batches {
            self.server.process_batch(batch).await;
        }

        let mut commands = Vec::new();
        if let Some(rx) = self.server.command_rx.as_mut() {
            while let Ok(command) = rx.try_recv() {
                commands.push(command);
            }
        }
        for command in commands {
            self.server.handle_command(command).await;
        }
    }
}

/// Drain all routers until `done` holds or the deadline passes.
pub(super) async fn pump_until(
    routers: &mut [&mut TestRouter],
    done: impl Fn(&[&mut TestRouter]) -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + PUMP_DEADLINE;
    loop {
        for router in routers.iter_mut() {
            router.drain().await;
        }
        if done(&*routers) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Drain all routers for a fixed period.
pub(super) async fn pump_for(routers: &mut [&mut TestRouter], period: Duration) {
    let deadline = tokio::time::Instant::now() + period;
    while tokio::time::Instant::now() < deadline {
        for router in routers.iter_mut() {
            router.drain().await;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Drain all routers until router `index` has a delivered message.
pub(super) async fn pump_delivery(
    routers: &mut [&mut TestRouter],
    index: usize,
) -> Option<(IdentHash, Vec<u8>)> {
    let deadline = tokio::time::Instant::now() + PUMP_DEADLINE;
    loop {
        for router in routers.iter_mut() {
            router.drain().await;
        }
        if let Ok(delivery) = routers[index].delivered.try_recv() {
            return Some(delivery);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Connect `from` to `to` and pump until both sides are established.
pub(super) async fn connect_pair(from: &mut TestRouter, to: &mut TestRouter) {
    let target = to.info();
    from.server.send(&target, Vec::new()).await.unwrap();
    let done = pump_until(&mut [&mut *from, &mut *to], |r| {
        r[0].established_with(&r[1]) && r[1].established_with(&r[0])
    })
    .await;
    assert!(done, "handshake did not complete");
}
