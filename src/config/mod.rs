//! Shroud Configuration System
//!
//! Loads configuration from YAML files with a cascading priority system:
//! 1. `./shroud.yaml` (current directory - highest priority)
//! 2. `~/.shroud.yaml` (home directory)
//! 3. `~/.config/shroud/shroud.yaml` (user config directory)
//! 4. `/etc/shroud/shroud.yaml` (system - lowest priority)
//!
//! Values from higher priority files override those from lower priority files.
//!
//! # YAML Structure
//!
//! ```yaml
//! router:
//!   identity:
//!     secret: "0102..."
//!     intro_key: "a0a1..."
//!   termination_timeout_secs: 330
//! transport:
//!   ssu:
//!     port: 4567
//!     ipv6: true
//! status:
//!   firewalled: true
//! ```

mod peer;
mod router;
mod transport;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::identity::{decode_intro_key, Identity, IdentityError, IntroKey};

pub use peer::{IntroducerConfig, PeerConfig};
pub use router::RouterConfig;
pub use transport::{SsuConfig, TransportConfig};

/// Default config filename.
const CONFIG_FILENAME: &str = "shroud.yaml";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
}

/// Identity configuration (`router.identity.*`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Hex-encoded secp256k1 secret (`router.identity.secret`).
    /// If not specified, a new keypair will be generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Hex-encoded 32-byte introduction key (`router.identity.intro_key`).
    /// If not specified, a random key is generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intro_key: Option<String>,
}

/// Initial reachability (`status.*`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Start as firewalled (`true`), reachable (`false`), or run a peer
    /// test to find out (absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewalled: Option<bool>,
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Router configuration (`router.*`).
    #[serde(default)]
    pub router: RouterConfig,

    /// Transport configuration (`transport.*`).
    #[serde(default)]
    pub transport: TransportConfig,

    /// Reachability status (`status.*`).
    #[serde(default)]
    pub status: StatusConfig,

    /// Known routers (`peers`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<PeerConfig>,
}

impl Config {
    /// Create a new empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the standard search paths.
    ///
    /// Returns the merged config and the paths that were loaded.
    pub fn load() -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let search_paths = Self::search_paths();
        Self::load_from_paths(&search_paths)
    }

    /// Load configuration from specific paths.
    ///
    /// Paths are processed in order, with later paths overriding earlier ones.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut config = Config::default();
        let mut loaded_paths = Vec::new();

        for path in paths {
            if path.exists() {
                let file_config = Self::load_file(path)?;
                config.merge(file_config);
                loaded_paths.push(path.clone());
            }
        }

        Ok((config, loaded_paths))
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Get the standard search paths in priority order (lowest to highest).
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        paths.push(PathBuf::from("/etc/shroud").join(CONFIG_FILENAME));

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("shroud").join(CONFIG_FILENAME));
        }

        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".shroud.yaml"));
        }

        paths.push(PathBuf::from(".").join(CONFIG_FILENAME));

        paths
    }

    /// Merge another configuration into this one.
    ///
    /// Values from `other` override values in `self` when present.
    pub fn merge(&mut self, other: Config) {
        self.router.merge(other.router);
        self.transport.merge(other.transport);
        if other.status.firewalled.is_some() {
            self.status.firewalled = other.status.firewalled;
        }
        // Peers replace rather than accumulate
        if !other.peers.is_empty() {
            self.peers = other.peers;
        }
    }

    /// Create the router identity from this configuration.
    ///
    /// Uses the configured secret if present, otherwise generates one.
    pub fn create_identity(&self) -> Result<Identity, ConfigError> {
        match &self.router.identity.secret {
            Some(secret) => Ok(Identity::from_secret_hex(secret)?),
            None => Ok(Identity::generate()),
        }
    }

    /// The configured intro key, or a fresh random one.
    pub fn intro_key(&self) -> Result<IntroKey, ConfigError> {
        match &self.router.identity.intro_key {
            Some(key) => Ok(decode_intro_key(key)?),
            None => {
                let mut key = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut key);
                Ok(key)
            }
        }
    }

    /// Check if an identity is configured (vs. will be generated).
    pub fn has_identity(&self) -> bool {
        self.router.identity.secret.is_some()
    }

    /// Serialize this configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const SECRET_HEX: &str = "0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f20";

    #[test]
    fn test_empty_config() {
        let config = Config::new();
        assert!(config.router.identity.secret.is_none());
        assert!(!config.has_identity());
        assert_eq!(config.router.termination_timeout_secs, 330);
        assert_eq!(config.transport.ssu.port(), 4567);
        assert_eq!(config.transport.ssu.burst(), 30);
        assert!(!config.transport.ssu.ipv6());
    }

    #[test]
    fn test_parse_yaml_empty() {
        let config: Config = serde_yaml::from_str("").unwrap();
        assert!(config.router.identity.secret.is_none());
        assert_eq!(config.router, RouterConfig::default());
    }

    #[test]
    fn test_parse_yaml_partial_router() {
        let yaml = r#"
router:
  max_introducers: 5
  accept_relay: false
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.router.max_introducers, 5);
        assert!(!config.router.accept_relay);
        // Unspecified fields take defaults
        assert_eq!(config.router.connect_timeout_secs, 5);
        assert_eq!(config.router.clock_skew_secs, 120);
    }

    #[test]
    fn test_parse_transport() {
        let yaml = r#"
transport:
  ssu:
    port: 9000
    bind_v4: "127.0.0.1"
    ipv6: true
    mtu: 1400
    burst: 8
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let ssu = &config.transport.ssu;
        assert_eq!(ssu.bind_v4(), "127.0.0.1:9000");
        assert_eq!(ssu.bind_v6(), "[::]:9000");
        assert!(ssu.ipv6());
        assert_eq!(ssu.mtu(), Some(1400));
        assert_eq!(ssu.burst(), 8);
    }

    #[test]
    fn test_unknown_transport_field_rejected() {
        let yaml = r#"
transport:
  ssu:
    bogus: 1
"#;
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_merge_configs() {
        let mut base = Config::new();
        base.router.identity.secret = Some("base".to_string());
        base.router.max_introducers = 5;
        base.transport.ssu.port = Some(1000);

        let mut over = Config::new();
        over.router.identity.secret = Some("override".to_string());
        over.transport.ssu.ipv6 = Some(true);
        over.status.firewalled = Some(true);

        base.merge(over);
        assert_eq!(base.router.identity.secret, Some("override".to_string()));
        // Defaults in the override do not clobber explicit base values
        assert_eq!(base.router.max_introducers, 5);
        assert_eq!(base.transport.ssu.port(), 1000);
        assert!(base.transport.ssu.ipv6());
        assert_eq!(base.status.firewalled, Some(true));
    }

    #[test]
    fn test_create_identity_from_secret() {
        let mut config = Config::new();
        config.router.identity.secret = Some(SECRET_HEX.to_string());

        let a = config.create_identity().unwrap();
        let b = config.create_identity().unwrap();
        assert_eq!(a.ident_hash(), b.ident_hash());
    }

    #[test]
    fn test_create_identity_generates_new() {
        let config = Config::new();
        let a = config.create_identity().unwrap();
        let b = config.create_identity().unwrap();
        assert_ne!(a.ident_hash(), b.ident_hash());
    }

    #[test]
    fn test_intro_key() {
        let mut config = Config::new();
        config.router.identity.intro_key = Some("aa".repeat(32));
        assert_eq!(config.intro_key().unwrap(), [0xaa; 32]);

        config.router.identity.intro_key = Some("aa".to_string());
        assert!(matches!(config.intro_key(), Err(ConfigError::Identity(_))));
    }

    #[test]
    fn test_load_from_paths_merges() {
        let temp_dir = TempDir::new().unwrap();
        let low_priority = temp_dir.path().join("low.yaml");
        let high_priority = temp_dir.path().join("high.yaml");

        fs::write(
            &low_priority,
            r#"
router:
  identity:
    secret: "low"
  keepalive_interval_secs: 10
"#,
        )
        .unwrap();
        fs::write(
            &high_priority,
            r#"
router:
  identity:
    secret: "high"
"#,
        )
        .unwrap();

        let paths = vec![low_priority, high_priority];
        let (config, loaded) = Config::load_from_paths(&paths).unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(config.router.identity.secret, Some("high".to_string()));
        assert_eq!(config.router.keepalive_interval_secs, 10);
    }

    #[test]
    fn test_load_skips_missing_files() {
        let temp_dir = TempDir::new().unwrap();
        let existing = temp_dir.path().join("exists.yaml");
        let missing = temp_dir.path().join("missing.yaml");
        fs::write(&existing, "status:\n  firewalled: false\n").unwrap();

        let (config, loaded) = Config::load_from_paths(&[missing, existing.clone()]).unwrap();
        assert_eq!(loaded, vec![existing]);
        assert_eq!(config.status.firewalled, Some(false));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.yaml");
        fs::write(&path, "router: [unclosed").unwrap();
        assert!(matches!(
            Config::load_file(&path),
            Err(ConfigError::ParseYaml { .. })
        ));
    }

    #[test]
    fn test_search_paths_includes_expected() {
        let paths = Config::search_paths();
        assert!(paths.iter().any(|p| p.ends_with("shroud.yaml")));
        assert!(paths
            .iter()
            .any(|p| p.starts_with("/etc/shroud") && p.ends_with("shroud.yaml")));
    }

    #[test]
    fn test_to_yaml_omits_unset() {
        let yaml = Config::new().to_yaml().unwrap();
        assert!(!yaml.contains("secret:"));
        assert!(!yaml.contains("firewalled:"));
        assert!(yaml.contains("termination_timeout_secs: 330"));
    }

    #[test]
    fn test_peer_to_router_info() {
        let identity = Identity::generate();
        let pubkey = hex::encode(identity.router_identity().to_bytes());
        let yaml = format!(
            r#"
peers:
  - pubkey: "{}"
    host: "203.0.113.7"
    port: 4567
    intro_key: "{}"
    peer_test: true
  - pubkey: "{}"
    intro_key: "{}"
    introducers:
      - host: "198.51.100.2"
        port: 9000
        intro_key: "{}"
        relay_tag: 12
"#,
            pubkey,
            "11".repeat(32),
            pubkey,
            "22".repeat(32),
            "33".repeat(32)
        );
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.peers.len(), 2);

        let direct = config.peers[0].to_router_info().unwrap();
        assert_eq!(direct.ident_hash(), identity.ident_hash());
        assert!(direct.caps.peer_test);
        let addr = direct.ssu_address(false).unwrap();
        assert_eq!(addr.endpoint(), Some("203.0.113.7:4567".parse().unwrap()));
        assert_eq!(addr.intro_key, [0x11; 32]);

        let firewalled = config.peers[1].to_router_info().unwrap();
        let addr = firewalled.ssu_address(false).unwrap();
        assert!(addr.requires_introducer());
        assert_eq!(addr.introducers[0].relay_tag, 12);
        assert_eq!(addr.introducers[0].intro_key, [0x33; 32]);
    }

    #[test]
    fn test_peer_bad_pubkey() {
        let peer = PeerConfig {
            pubkey: "02".to_string(),
            host: None,
            port: 0,
            intro_key: "00".repeat(32),
            introducers: vec![],
            peer_test: false,
            introducer: false,
        };
        assert!(peer.to_router_info().is_err());
    }
}
