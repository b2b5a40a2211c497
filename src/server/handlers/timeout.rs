//! Maintenance tick: session timers, introduction deadlines, introducer
//! refresh and peer-test cleanup.

use std::time::Instant;
use tracing::info;

use crate::server::Server;
use crate::transport::AddressFamily;

impl Server {
    /// Run every periodic check that is due at `now`.
    pub(in crate::server) async fn on_tick(&mut self, now: Instant) {
        self.tick_sessions(now).await;
        self.expire_introductions(now);

        let refresh_due = self
            .last_introducer_refresh
            .is_none_or(|last| now.duration_since(last) >= self.router_config.introducer_refresh());
        if refresh_due {
            self.last_introducer_refresh = Some(now);
            self.refresh_introducers(now).await;
        }

        if now.duration_since(self.last_peer_test_cleanup) >= self.router_config.peer_test_cleanup() {
            self.last_peer_test_cleanup = now;
            self.cleanup_peer_tests(now);
        }
    }

    /// Drive connect deadlines, idle termination, resends and keep-alives,
    /// then drop sessions that ended.
    async fn tick_sessions(&mut self, now: Instant) {
        for remote in self.table.endpoints() {
            let ticked = {
                let Some(local) = self.local_router(AddressFamily::of(&remote)) else {
                    continue;
                };
                self.table.with_session(&remote, |session| {
                    let events = session.on_tick(&local, now);
                    (events, session.state())
                })
            };
            let Some((events, state)) = ticked else {
                continue;
            };
            self.send_events(remote, events).await;
            if state.is_terminal() {
                self.remove_session(&remote);
            }
        }
    }

    /// Give up on introductions nobody answered. Held messages are dropped.
    fn expire_introductions(&mut self, now: Instant) {
        self.pending_introductions.retain(|nonce, pending| {
            if now < pending.deadline {
                return true;
            }
            info!(
                peer = %pending.target.ident_hash().short(),
                introducer = %pending.introducer,
                nonce = *nonce,
                dropped_messages = pending.messages.len(),
                "Introduction timed out"
            );
            false
        });
    }
}
