//! Transport configuration (`transport.*`).

use serde::{Deserialize, Serialize};

/// Default SSU listen port.
const DEFAULT_SSU_PORT: u16 = 4567;

/// Default IPv4 bind host.
const DEFAULT_BIND_V4: &str = "0.0.0.0";

/// Default IPv6 bind host.
const DEFAULT_BIND_V6: &str = "::";

/// Default number of datagrams read per receive cycle.
const DEFAULT_BURST: usize = 30;

/// Default transport→server batch channel capacity.
const DEFAULT_CHANNEL_SIZE: usize = 1024;

/// SSU transport configuration (`transport.ssu.*`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SsuConfig {
    /// Listen port for both families (`port`). Defaults to 4567.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// IPv4 bind host (`bind_v4`). Defaults to "0.0.0.0".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_v4: Option<String>,

    /// IPv6 bind host (`bind_v6`). Defaults to "::".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_v6: Option<String>,

    /// Enable the IPv6 socket (`ipv6`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<bool>,

    /// MTU override (`mtu`). Probed from interfaces if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u16>,

    /// Receive burst cap (`burst`). Defaults to 30.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<usize>,

    /// Batch channel capacity (`channel_size`). Defaults to 1024.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_size: Option<usize>,
}

impl SsuConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SSU_PORT)
    }

    /// IPv4 bind address as `host:port`.
    pub fn bind_v4(&self) -> String {
        format!(
            "{}:{}",
            self.bind_v4.as_deref().unwrap_or(DEFAULT_BIND_V4),
            self.port()
        )
    }

    /// IPv6 bind address as `[host]:port`.
    pub fn bind_v6(&self) -> String {
        format!(
            "[{}]:{}",
            self.bind_v6.as_deref().unwrap_or(DEFAULT_BIND_V6),
            self.port()
        )
    }

    pub fn ipv6(&self) -> bool {
        self.ipv6.unwrap_or(false)
    }

    pub fn mtu(&self) -> Option<u16> {
        self.mtu
    }

    pub fn burst(&self) -> usize {
        self.burst.unwrap_or(DEFAULT_BURST).max(1)
    }

    pub fn channel_size(&self) -> usize {
        self.channel_size.unwrap_or(DEFAULT_CHANNEL_SIZE).max(1)
    }

    fn merge(&mut self, other: SsuConfig) {
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.bind_v4.is_some() {
            self.bind_v4 = other.bind_v4;
        }
        if other.bind_v6.is_some() {
            self.bind_v6 = other.bind_v6;
        }
        if other.ipv6.is_some() {
            self.ipv6 = other.ipv6;
        }
        if other.mtu.is_some() {
            self.mtu = other.mtu;
        }
        if other.burst.is_some() {
            self.burst = other.burst;
        }
        if other.channel_size.is_some() {
            self.channel_size = other.channel_size;
        }
    }
}

/// Transport section (`transport.*`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// SSU over UDP (`transport.ssu.*`).
    #[serde(default)]
    pub ssu: SsuConfig,
}

impl TransportConfig {
    pub(super) fn merge(&mut self, other: TransportConfig) {
        self.ssu.merge(other.ssu);
    }
}
