//! Configuration file parsing
//!
//! Parses the TOML configuration file for a storage node.

use crate::crypto::EncryptionKey;
use crate::store::{cas_path_transform, identity_path_transform, PathTransform, DEFAULT_ROOT};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Node configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Node settings
    pub node: NodeConfig,

    /// Protocol timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Node settings
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Address to listen on (e.g., 127.0.0.1:3000)
    pub listen_addr: String,

    /// Fixed node id, random if unset
    #[serde(default)]
    pub id: Option<String>,

    /// Fixed 32-byte key as hex, random if unset
    #[serde(default)]
    pub encryption_key: Option<String>,

    /// Storage root directory
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// Path layout on disk
    #[serde(default)]
    pub path_transform: PathTransformKind,

    /// Nodes to dial on startup
    #[serde(default)]
    pub bootstrap: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from(DEFAULT_ROOT)
}

fn default_log_level() -> String {
    "info".to_string()
}

/// On-disk layout
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PathTransformKind {
    /// Digest split into directory segments
    #[default]
    Cas,
    /// Key used verbatim
    Identity,
}

impl PathTransformKind {
    pub fn transform(self) -> PathTransform {
        match self {
            PathTransformKind::Cas => cas_path_transform,
            PathTransformKind::Identity => identity_path_transform,
        }
    }
}

/// Protocol timeouts in milliseconds
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// StoreFile to StoreAck wait per peer
    #[serde(default = "default_ack_ms")]
    pub ack_ms: u64,

    /// Bound on an announced stream nobody claims, and on awaiting a stream
    #[serde(default = "default_stream_ms")]
    pub stream_ms: u64,
}

fn default_ack_ms() -> u64 {
    2000
}

fn default_stream_ms() -> u64 {
    5000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ack_ms: default_ack_ms(),
            stream_ms: default_stream_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn ack(&self) -> Duration {
        Duration::from_millis(self.ack_ms)
    }

    pub fn stream(&self) -> Duration {
        Duration::from_millis(self.stream_ms)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration with defaults for everything but the listen address
    pub fn with_listen_addr(listen_addr: impl Into<String>) -> Self {
        Self {
            node: NodeConfig {
                listen_addr: listen_addr.into(),
                id: None,
                encryption_key: None,
                storage_root: default_storage_root(),
                path_transform: PathTransformKind::default(),
                bootstrap: Vec::new(),
                log_level: default_log_level(),
            },
            timeouts: TimeoutConfig::default(),
        }
    }

    /// Decoded encryption key, if one is configured
    pub fn encryption_key(&self) -> Result<Option<EncryptionKey>, ConfigError> {
        self.node
            .encryption_key
            .as_deref()
            .map(|hex| {
                EncryptionKey::from_hex(hex)
                    .map_err(|e| ConfigError::Invalid(format!("encryption_key: {}", e)))
            })
            .transpose()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.listen_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("listen_addr must not be empty".into()));
        }

        self.encryption_key()?;

        let mut seen = HashSet::new();
        for addr in &self.node.bootstrap {
            if addr == &self.node.listen_addr {
                return Err(ConfigError::Invalid(format!(
                    "bootstrap contains the node's own listen address {}",
                    addr
                )));
            }
            if !seen.insert(addr) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate bootstrap address: {}",
                    addr
                )));
            }
        }

        if self.timeouts.ack_ms == 0 || self.timeouts.stream_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be greater than zero".into()));
        }

        // A stream wait shorter than the ack window could expire while the body is still owed
        if self.timeouts.stream_ms < self.timeouts.ack_ms {
            return Err(ConfigError::Invalid(format!(
                "stream_ms ({}) must not be shorter than ack_ms ({})",
                self.timeouts.stream_ms, self.timeouts.ack_ms
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config_str = r#"
[node]
listen_addr = "127.0.0.1:3000"
"#;

        let config = Config::parse(config_str).unwrap();
        assert_eq!(config.node.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.node.storage_root, PathBuf::from(DEFAULT_ROOT));
        assert_eq!(config.node.path_transform, PathTransformKind::Cas);
        assert_eq!(config.node.log_level, "info");
        assert!(config.node.bootstrap.is_empty());
        assert_eq!(config.timeouts.ack(), Duration::from_secs(2));
        assert_eq!(config.timeouts.stream(), Duration::from_secs(5));
        assert!(config.encryption_key().unwrap().is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let config_str = r#"
[node]
listen_addr = "127.0.0.1:4000"
id = "node-b"
encryption_key = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"
storage_root = "/data/vault"
path_transform = "identity"
bootstrap = ["127.0.0.1:3000", "127.0.0.1:5000"]
log_level = "debug"

[timeouts]
ack_ms = 250
"#;

        let config = Config::parse(config_str).unwrap();
        assert_eq!(config.node.id.as_deref(), Some("node-b"));
        assert_eq!(config.node.path_transform, PathTransformKind::Identity);
        assert_eq!(config.node.bootstrap.len(), 2);
        assert_eq!(config.timeouts.ack_ms, 250);
        assert_eq!(config.timeouts.stream_ms, 5000);

        let key = config.encryption_key().unwrap().unwrap();
        assert_eq!(key.as_bytes()[31], 0x1f);

        let path = (config.node.path_transform.transform())("a/b");
        assert_eq!(path.filename, "a/b");
    }

    #[test]
    fn test_bad_encryption_key_error() {
        let config_str = r#"
[node]
listen_addr = "127.0.0.1:3000"
encryption_key = "abcd"
"#;

        let result = Config::parse(config_str);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_duplicate_bootstrap_error() {
        let config_str = r#"
[node]
listen_addr = "127.0.0.1:3000"
bootstrap = ["127.0.0.1:4000", "127.0.0.1:4000"]
"#;

        let result = Config::parse(config_str);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_self_bootstrap_error() {
        let config_str = r#"
[node]
listen_addr = "127.0.0.1:3000"
bootstrap = ["127.0.0.1:3000"]
"#;

        let result = Config::parse(config_str);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_timeout_error() {
        let config_str = r#"
[node]
listen_addr = "127.0.0.1:3000"

[timeouts]
stream_ms = 0
"#;

        let result = Config::parse(config_str);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_stream_shorter_than_ack_error() {
        let config_str = r#"
[node]
listen_addr = "127.0.0.1:3000"

[timeouts]
ack_ms = 3000
stream_ms = 1000
"#;

        let result = Config::parse(config_str);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_transform_is_parse_error() {
        let config_str = r#"
[node]
listen_addr = "127.0.0.1:3000"
path_transform = "sharded"
"#;

        let result = Config::parse(config_str);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "[node]\nlisten_addr = \"127.0.0.1:3000\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.node.listen_addr, "127.0.0.1:3000");

        assert!(matches!(
            Config::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_with_listen_addr_is_valid() {
        let config = Config::with_listen_addr(":3000");
        config.validate().unwrap();
        assert!(config.node.id.is_none());
    }
}
