//! Router configuration (`router.*`).
//!
//! Identity material and the timers and limits that drive session
//! lifecycle, introducer maintenance and peer testing.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::IdentityConfig;

/// Router configuration (`router.*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Identity configuration (`router.identity.*`).
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Handshake must complete within this many seconds (`router.connect_timeout_secs`).
    #[serde(default = "RouterConfig::default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Established sessions idle this long are closed (`router.termination_timeout_secs`).
    #[serde(default = "RouterConfig::default_termination_timeout_secs")]
    pub termination_timeout_secs: u64,

    /// Send an empty Data packet after this much send-side idleness
    /// (`router.keepalive_interval_secs`).
    #[serde(default = "RouterConfig::default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// RX loop maintenance tick period in seconds (`router.tick_interval_secs`).
    #[serde(default = "RouterConfig::default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Introducer poll period (`router.introducer_refresh_secs`).
    #[serde(default = "RouterConfig::default_introducer_refresh_secs")]
    pub introducer_refresh_secs: u64,

    /// How long a selected introducer stays valid (`router.introducer_lifetime_secs`).
    #[serde(default = "RouterConfig::default_introducer_lifetime_secs")]
    pub introducer_lifetime_secs: u64,

    /// Upper bound on published introducers (`router.max_introducers`).
    #[serde(default = "RouterConfig::default_max_introducers")]
    pub max_introducers: usize,

    /// Peer test records expire after this many seconds (`router.peer_test_timeout_secs`).
    #[serde(default = "RouterConfig::default_peer_test_timeout_secs")]
    pub peer_test_timeout_secs: u64,

    /// Peer test cleanup sweep period (`router.peer_test_cleanup_secs`).
    #[serde(default = "RouterConfig::default_peer_test_cleanup_secs")]
    pub peer_test_cleanup_secs: u64,

    /// Maximum tolerated packet timestamp skew (`router.clock_skew_secs`).
    #[serde(default = "RouterConfig::default_clock_skew_secs")]
    pub clock_skew_secs: u32,

    /// Unacknowledged messages are resent at most this many times (`router.max_resends`).
    #[serde(default = "RouterConfig::default_max_resends")]
    pub max_resends: u32,

    /// Seconds between resends (`router.resend_interval_secs`).
    #[serde(default = "RouterConfig::default_resend_interval_secs")]
    pub resend_interval_secs: u64,

    /// Hand out relay tags and act as introducer (`router.accept_relay`).
    #[serde(default = "RouterConfig::default_accept_relay")]
    pub accept_relay: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            connect_timeout_secs: 5,
            termination_timeout_secs: 330,
            keepalive_interval_secs: 30,
            tick_interval_secs: 1,
            introducer_refresh_secs: 30,
            introducer_lifetime_secs: 3600,
            max_introducers: 3,
            peer_test_timeout_secs: 60,
            peer_test_cleanup_secs: 15,
            clock_skew_secs: 120,
            max_resends: 4,
            resend_interval_secs: 3,
            accept_relay: true,
        }
    }
}

impl RouterConfig {
    fn default_connect_timeout_secs() -> u64 { 5 }
    fn default_termination_timeout_secs() -> u64 { 330 }
    fn default_keepalive_interval_secs() -> u64 { 30 }
    fn default_tick_interval_secs() -> u64 { 1 }
    fn default_introducer_refresh_secs() -> u64 { 30 }
    fn default_introducer_lifetime_secs() -> u64 { 3600 }
    fn default_max_introducers() -> usize { 3 }
    fn default_peer_test_timeout_secs() -> u64 { 60 }
    fn default_peer_test_cleanup_secs() -> u64 { 15 }
    fn default_clock_skew_secs() -> u32 { 120 }
    fn default_max_resends() -> u32 { 4 }
    fn default_resend_interval_secs() -> u64 { 3 }
    fn default_accept_relay() -> bool { true }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_secs(self.termination_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn introducer_refresh(&self) -> Duration {
        Duration::from_secs(self.introducer_refresh_secs.max(1))
    }

    pub fn introducer_lifetime(&self) -> Duration {
        Duration::from_secs(self.introducer_lifetime_secs)
    }

    pub fn peer_test_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_test_timeout_secs)
    }

    pub fn peer_test_cleanup(&self) -> Duration {
        Duration::from_secs(self.peer_test_cleanup_secs.max(1))
    }

    pub fn resend_interval(&self) -> Duration {
        Duration::from_secs(self.resend_interval_secs)
    }

    /// Overlay values from `other` that differ from the defaults.
    pub(super) fn merge(&mut self, other: RouterConfig) {
        let defaults = RouterConfig::default();
        if other.identity.secret.is_some() {
            self.identity.secret = other.identity.secret;
        }
        if other.identity.intro_key.is_some() {
            self.identity.intro_key = other.identity.intro_key;
        }

        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if other.$field != defaults.$field {
                    self.$field = other.$field;
                })*
            };
        }
        overlay!(
            connect_timeout_secs,
            termination_timeout_secs,
            keepalive_interval_secs,
            tick_interval_secs,
            introducer_refresh_secs,
            introducer_lifetime_secs,
            max_introducers,
            peer_test_timeout_secs,
            peer_test_cleanup_secs,
            clock_skew_secs,
            max_resends,
            resend_interval_secs,
            accept_relay
        );
    }
}
