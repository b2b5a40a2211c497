//! Packet size selection.
//!
//! The largest SSU packet is bounded by a per-family fallback. On Linux
//! the smallest non-loopback interface MTU, less IP and UDP header
//! overhead, can lower it further. A configured override wins outright.

use super::AddressFamily;

/// Largest IPv4 packet when nothing better is known.
pub const FALLBACK_MTU_V4: u16 = 1484;

/// Largest IPv6 packet when nothing better is known.
pub const FALLBACK_MTU_V6: u16 = 1492;

/// Smallest packet size accepted from probing or configuration.
const MIN_MTU: u16 = 576;

const IPV4_UDP_OVERHEAD: u16 = 20 + 8;
const IPV6_UDP_OVERHEAD: u16 = 40 + 8;

impl AddressFamily {
    pub fn fallback_mtu(&self) -> u16 {
        match self {
            AddressFamily::V4 => FALLBACK_MTU_V4,
            AddressFamily::V6 => FALLBACK_MTU_V6,
        }
    }

    fn header_overhead(&self) -> u16 {
        match self {
            AddressFamily::V4 => IPV4_UDP_OVERHEAD,
            AddressFamily::V6 => IPV6_UDP_OVERHEAD,
        }
    }
}

/// Packet size to use for a family.
pub fn effective_mtu(family: AddressFamily, override_mtu: Option<u16>) -> u16 {
    if let Some(mtu) = override_mtu {
        return mtu.max(MIN_MTU);
    }
    let fallback = family.fallback_mtu();
    match probe_interface_mtu() {
        Some(link_mtu) => clamp_to_link(family, link_mtu),
        None => fallback,
    }
}

fn clamp_to_link(family: AddressFamily, link_mtu: u16) -> u16 {
    link_mtu
        .saturating_sub(family.header_overhead())
        .clamp(MIN_MTU, family.fallback_mtu())
}

/// Smallest MTU across non-loopback interfaces that are up.
#[cfg(target_os = "linux")]
fn probe_interface_mtu() -> Option<u16> {
    let entries = std::fs::read_dir("/sys/class/net").ok()?;
    let mtu = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name() != "lo")
        .filter(|e| {
            std::fs::read_to_string(e.path().join("operstate"))
                .map(|s| s.trim() == "up")
                .unwrap_or(false)
        })
        .filter_map(|e| std::fs::read_to_string(e.path().join("mtu")).ok())
        .filter_map(|s| s.trim().parse::<u16>().ok())
        .min();
    if let Some(mtu) = mtu {
        tracing::debug!(mtu, "Probed interface MTU");
    }
    mtu
}

#[cfg(not(target_os = "linux"))]
fn probe_interface_mtu() -> Option<u16> {
    None
}
