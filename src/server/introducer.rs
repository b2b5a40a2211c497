//! Introducer maintenance.
//!
//! While firewalled we publish up to `max_introducers` peers that hold a
//! session with us and issued us a relay tag. Each refresh tick drops
//! introducers whose session ended or whose selection is older than the
//! configured lifetime, then fills free slots from random eligible
//! sessions. With no eligible session at all, we connect to a random
//! introducer from the netdb and ask it for a tag.

use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info};

use super::{Server, SessionInfo};
use crate::context::RouterStatus;
use crate::identity::IntroducerInfo;

impl Server {
    /// Act on the current reachability status.
    ///
    /// Testing starts a peer test, Ok withdraws all introducers, and
    /// Firewalled maintains the introducer set.
    pub async fn refresh_introducers(&mut self, now: Instant) {
        match self.context.status() {
            RouterStatus::Testing => {
                self.start_peer_test(now).await;
            }
            RouterStatus::Ok => {
                self.context.clear_introducers();
                self.introducer_since.clear();
            }
            RouterStatus::Firewalled => self.update_introducers(now).await,
        }
    }

    async fn update_introducers(&mut self, now: Instant) {
        let lifetime = self.router_config.introducer_lifetime();
        for introducer in self.context.introducers() {
            let endpoint = introducer.endpoint();
            let alive = self.table.info(&endpoint).is_some_and(|s| {
                s.state.is_established() && s.relay_tag == Some(introducer.relay_tag)
            });
            let fresh = self
                .introducer_since
                .get(&endpoint)
                .is_some_and(|since| now.duration_since(*since) < lifetime);
            if !alive || !fresh {
                self.context.remove_introducer(endpoint);
                self.introducer_since.remove(&endpoint);
            }
        }

        let max = self.context.max_introducers();
        if self.context.introducer_count() < max {
            let current: HashSet<SocketAddr> = self
                .context
                .introducers()
                .iter()
                .map(|i| i.endpoint())
                .collect();
            let mut candidates: Vec<SessionInfo> = self
                .table
                .snapshot()
                .into_iter()
                .filter(|s| {
                    s.state.is_established()
                        && !s.is_v6()
                        && s.relay_tag.is_some()
                        && !current.contains(&s.remote)
                })
                .collect();
            candidates.shuffle(&mut rand::thread_rng());

            for candidate in candidates {
                if self.context.introducer_count() >= max {
                    break;
                }
                let Some(relay_tag) = candidate.relay_tag else {
                    continue;
                };
                let Some(intro_key) = self
                    .table
                    .with_session(&candidate.remote, |s| s.remote_intro_key().copied())
                    .flatten()
                else {
                    continue;
                };
                let introducer = IntroducerInfo {
                    host: candidate.remote.ip(),
                    port: candidate.remote.port(),
                    intro_key,
                    relay_tag,
                };
                if self.context.add_introducer(introducer) {
                    self.introducer_since.insert(candidate.remote, now);
                }
            }
        }

        if self.context.introducer_count() == 0 {
            self.find_introducer().await;
        }
    }

    /// Connect to a netdb introducer, requesting a relay tag.
    async fn find_introducer(&mut self) {
        let Some(info) = self.netdb.random_introducer() else {
            debug!("No introducer available from netdb");
            return;
        };
        let Some(address) = info.ssu_address(self.context.supports_v6()).cloned() else {
            return;
        };
        let Some(endpoint) = address.endpoint().filter(|e| self.supports_endpoint(e)) else {
            return;
        };
        if self.table.contains(&endpoint) || info.ident_hash() == self.context.ident_hash() {
            return;
        }
        info!(
            introducer = %endpoint,
            peer = %info.ident_hash().short(),
            "Requesting relay tag from netdb introducer"
        );
        self.connect_session(
            endpoint,
            info.identity,
            &address.intro_key,
            true,
            info.caps.peer_test,
            Vec::new(),
        )
        .await;
    }
}
