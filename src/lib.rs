//! Shroud: secure UDP transport and tunnel cipher core
//!
//! Building blocks of an anonymity-network router's lowest layer:
//! authenticated, encrypted point-to-point sessions over UDP with
//! NAT traversal through introducers and reachability peer tests, and
//! the layered AES cipher applied to fixed-size tunnel messages.

pub mod config;
pub mod context;
pub mod crypto;
pub mod identity;
pub mod netdb;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

// Re-export identity types
pub use identity::{
    IdentHash, Identity, IdentityError, IntroKey, IntroducerInfo, RouterCaps, RouterIdentity,
    RouterInfo, SsuAddress,
};

// Re-export config types
pub use config::{Config, ConfigError, PeerConfig, RouterConfig, SsuConfig};

// Re-export cipher types
pub use crypto::{Aes256, CipherBackend, CryptoError, SessionKeys, TunnelCipher};

// Re-export router state
pub use context::{RouterContext, RouterStatus};
pub use netdb::{ChannelRouter, MemoryNetDb, MessageRouter, NetDb};

// Re-export protocol types
pub use protocol::{PayloadType, ProtocolError};

// Re-export transport types
pub use transport::{AddressFamily, ReceivedPacket, TransportError, UdpTransport};

// Re-export session types
pub use session::{Session, SessionDirection, SessionError, SessionState, SessionStats};

// Re-export server types
pub use server::{PeerTestRole, Server, ServerError, ServerHandle, ServerState, SessionInfo};
