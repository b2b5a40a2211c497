//! Remote router descriptions: identity, SSU addresses and introducers.

use secp256k1::{schnorr, Message, PublicKey, Secp256k1};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use super::{sha256, IdentHash, IdentityError, IDENTITY_SIZE, SIGNATURE_SIZE};

/// Per-router well-known key used before a session key exists.
pub type IntroKey = [u8; 32];

/// A router's public identity (verification only).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RouterIdentity {
    pubkey: PublicKey,
    ident_hash: IdentHash,
}

impl RouterIdentity {
    pub fn from_pubkey(pubkey: PublicKey) -> Self {
        let ident_hash = IdentHash::digest(&pubkey.serialize());
        Self { pubkey, ident_hash }
    }

    /// Parse a 33-byte compressed public key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != IDENTITY_SIZE {
            return Err(IdentityError::InvalidIdentityLength(bytes.len()));
        }
        Ok(Self::from_pubkey(PublicKey::from_slice(bytes)?))
    }

    /// Parse a hex-encoded compressed public key.
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        Self::from_bytes(&hex::decode(s.trim())?)
    }

    pub fn to_bytes(&self) -> [u8; IDENTITY_SIZE] {
        self.pubkey.serialize()
    }

    pub fn ident_hash(&self) -> &IdentHash {
        &self.ident_hash
    }

    /// Verify a Schnorr signature over SHA-256(data).
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        if signature.len() != SIGNATURE_SIZE {
            return false;
        }
        let Ok(sig) = schnorr::Signature::from_slice(signature) else {
            return false;
        };
        let secp = Secp256k1::verification_only();
        let digest = Message::from_digest(sha256(data));
        let (xonly, _parity) = self.pubkey.x_only_public_key();
        secp.verify_schnorr(&sig, &digest, &xonly).is_ok()
    }
}

impl fmt::Debug for RouterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RouterIdentity")
            .field(&self.ident_hash)
            .finish()
    }
}

/// One entry in a firewalled router's published introducer list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntroducerInfo {
    pub host: IpAddr,
    pub port: u16,
    pub intro_key: IntroKey,
    pub relay_tag: u32,
}

impl IntroducerInfo {
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// An SSU address advertised by a router.
///
/// A firewalled router publishes no host and instead lists introducers
/// through which it can be reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SsuAddress {
    pub host: Option<IpAddr>,
    pub port: u16,
    pub intro_key: IntroKey,
    pub introducers: Vec<IntroducerInfo>,
}

impl SsuAddress {
    pub fn direct(endpoint: SocketAddr, intro_key: IntroKey) -> Self {
        Self {
            host: Some(endpoint.ip()),
            port: endpoint.port(),
            intro_key,
            introducers: Vec::new(),
        }
    }

    /// Directly reachable endpoint, if published.
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.host.map(|h| SocketAddr::new(h, self.port))
    }

    pub fn is_v6(&self) -> bool {
        matches!(self.host, Some(IpAddr::V6(_)))
    }

    /// Whether a connection must be brokered by an introducer.
    pub fn requires_introducer(&self) -> bool {
        !self.introducers.is_empty()
    }
}

/// Advertised router capabilities relevant to the transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouterCaps {
    /// Willing to participate in peer tests as Bob or Charlie.
    pub peer_test: bool,
    /// Willing to act as an introducer.
    pub introducer: bool,
}

/// Routing-database record for a router.
#[derive(Clone, Debug)]
pub struct RouterInfo {
    pub identity: RouterIdentity,
    pub addresses: Vec<SsuAddress>,
    pub caps: RouterCaps,
}

impl RouterInfo {
    pub fn new(identity: RouterIdentity, addresses: Vec<SsuAddress>, caps: RouterCaps) -> Self {
        Self {
            identity,
            addresses,
            caps,
        }
    }

    pub fn ident_hash(&self) -> &IdentHash {
        self.identity.ident_hash()
    }

    /// Pick the SSU address to connect to.
    ///
    /// Direct addresses of an allowed family are preferred over
    /// introducer-only addresses; IPv6 is considered only if `allow_v6`.
    /// A router that has not learned its external address yet publishes
    /// an address with neither host nor introducers. It is returned last
    /// and cannot be dialed.
    pub fn ssu_address(&self, allow_v6: bool) -> Option<&SsuAddress> {
        let usable = self.addresses.iter().filter(|a| allow_v6 || !a.is_v6());
        let direct = usable
            .clone()
            .find(|a| a.endpoint().is_some() && !a.requires_introducer());
        direct
            .or_else(|| usable.clone().find(|a| a.requires_introducer()))
            .or_else(|| usable.clone().next())
    }
}
