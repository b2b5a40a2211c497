//! Static peer configuration (`peers`).
//!
//! Known routers used to seed the routing database at startup.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::identity::{
    decode_intro_key, IdentityError, IntroducerInfo, RouterCaps, RouterIdentity, RouterInfo,
    SsuAddress,
};

/// Introducer entry for a firewalled static peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntroducerConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Hex-encoded intro key of the introducer.
    pub intro_key: String,
    pub relay_tag: u32,
}

/// A statically configured router.
///
/// ```yaml
/// peers:
///   - pubkey: "02ab..."
///     host: "203.0.113.7"
///     port: 4567
///     intro_key: "00112233..."
///     introducer: true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Hex-encoded compressed public key.
    pub pubkey: String,

    /// Direct address; omitted for firewalled peers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<IpAddr>,

    #[serde(default)]
    pub port: u16,

    /// Hex-encoded intro key.
    pub intro_key: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub introducers: Vec<IntroducerConfig>,

    /// Advertises peer-test participation.
    #[serde(default)]
    pub peer_test: bool,

    /// Advertises willingness to introduce.
    #[serde(default)]
    pub introducer: bool,
}

impl PeerConfig {
    /// Build the routing-database record for this peer.
    pub fn to_router_info(&self) -> Result<RouterInfo, IdentityError> {
        let identity = RouterIdentity::from_hex(&self.pubkey)?;
        let introducers = self
            .introducers
            .iter()
            .map(|i| {
                Ok(IntroducerInfo {
                    host: i.host,
                    port: i.port,
                    intro_key: decode_intro_key(&i.intro_key)?,
                    relay_tag: i.relay_tag,
                })
            })
            .collect::<Result<Vec<_>, IdentityError>>()?;
        let address = SsuAddress {
            host: self.host,
            port: self.port,
            intro_key: decode_intro_key(&self.intro_key)?,
            introducers,
        };
        let caps = RouterCaps {
            peer_test: self.peer_test,
            introducer: self.introducer,
        };
        Ok(RouterInfo::new(identity, vec![address], caps))
    }
}
