//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via STOMPGATE_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use stompgate_protocol::DEFAULT_PORT;
use thiserror::Error;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub protocol: ProtocolConfig,
    pub broker: BrokerConfig,
    pub auth: AuthConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("STOMPGATE_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.protocol.apply_env_overrides();
        self.auth.apply_env_overrides();
    }

    /// Loads user entries from the external secrets file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        self.auth.load_secrets()
    }

    /// Checks settings that cannot be expressed by the types alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.required && self.auth.users.is_empty() {
            return Err(ConfigError::ValidationError(
                "authentication required but no users configured".to_string(),
            ));
        }
        if self.broker.temp_queue_prefix == self.broker.temp_topic_prefix {
            return Err(ConfigError::ValidationError(
                "temporary queue and topic prefixes must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Idle connection timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            idle_timeout_secs: 300,
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("STOMPGATE_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(timeout) = std::env::var("STOMPGATE_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.idle_timeout_secs = secs;
            }
        }

        if let Ok(max) = std::env::var("STOMPGATE_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }

    /// Returns idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Protocol behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Value of the CONNECTED `server` header.
    pub server_name: String,
    /// Close the connection on any malformed frame, not just fatal ones.
    pub close_on_parse_error: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            server_name: format!("stompgate/{}", env!("CARGO_PKG_VERSION")),
            close_on_parse_error: false,
        }
    }
}

impl ProtocolConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(close) = std::env::var("STOMPGATE_CLOSE_ON_PARSE_ERROR") {
            self.close_on_parse_error = close == "1" || close.to_lowercase() == "true";
        }
    }
}

/// Reference broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Name prefix of broker-assigned temporary queues.
    pub temp_queue_prefix: String,
    /// Name prefix of broker-assigned temporary topics.
    pub temp_topic_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            temp_queue_prefix: "tmp.queue.".to_string(),
            temp_topic_prefix: "tmp.topic.".to_string(),
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether CONNECT must carry known credentials.
    pub required: bool,
    /// Login to SHA-256 hex of the passcode.
    pub users: BTreeMap<String, String>,
    /// Optional file with one `login:sha256hex` entry per line.
    pub secrets_file: Option<PathBuf>,
}

impl AuthConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(auth) = std::env::var("STOMPGATE_AUTH_REQUIRED") {
            self.required = auth == "1" || auth.to_lowercase() == "true";
        }

        if let Ok(path) = std::env::var("STOMPGATE_AUTH_SECRETS_FILE") {
            self.secrets_file = Some(PathBuf::from(path));
        }
    }

    /// Adds the users listed in the secrets file, if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        let Some(path) = &self.secrets_file else {
            return Ok(());
        };
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(path.clone(), e))?;
        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((login, hash)) = line.split_once(':') else {
                return Err(ConfigError::ValidationError(format!(
                    "{}:{}: expected 'login:sha256hex'",
                    path.display(),
                    number + 1
                )));
            };
            self.users
                .insert(login.trim().to_string(), hash.trim().to_string());
        }
        Ok(())
    }

    /// Returns whether authentication is effectively disabled.
    pub fn is_disabled(&self) -> bool {
        !self.required
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {1}", path = .0.display())]
    IoError(PathBuf, std::io::Error),

    #[error("failed to parse config file '{path}': {1}", path = .0.display())]
    ParseError(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), 7672);
        assert_eq!(config.network.idle_timeout(), Duration::from_secs(300));
        assert!(config.protocol.server_name.starts_with("stompgate/"));
        assert!(!config.protocol.close_on_parse_error);
        assert!(config.auth.is_disabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.broker.temp_queue_prefix, "tmp.queue.");
    }

    #[test]
    fn test_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  bind_addr: \"0.0.0.0:61613\"\nprotocol:\n  close_on_parse_error: true\n\
             auth:\n  required: true\n  users:\n    admin: abc123"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 61613);
        assert_eq!(config.network.max_connections, 1000);
        assert!(config.protocol.close_on_parse_error);
        assert_eq!(config.auth.users.get("admin").map(String::as_str), Some("abc123"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "network:\n  bind_addr: \"not an address\"").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::ParseError(..))
        ));
        assert!(matches!(
            Config::from_file("/nonexistent/stompgate.yaml"),
            Err(ConfigError::IoError(..))
        ));
    }

    #[test]
    fn test_secrets_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# users\nadmin: aaaa\n\nguest:bbbb").unwrap();

        let mut auth = AuthConfig {
            secrets_file: Some(file.path().to_path_buf()),
            ..AuthConfig::default()
        };
        auth.load_secrets().unwrap();
        assert_eq!(auth.users.len(), 2);
        assert_eq!(auth.users["admin"], "aaaa");
        assert_eq!(auth.users["guest"], "bbbb");
    }

    #[test]
    fn test_malformed_secrets_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "admin-without-hash").unwrap();
        let mut auth = AuthConfig {
            secrets_file: Some(file.path().to_path_buf()),
            ..AuthConfig::default()
        };
        let err = auth.load_secrets().unwrap_err();
        assert!(err.to_string().contains(":1: expected"));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.auth.required = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        config.auth.users.insert("a".to_string(), "h".to_string());
        assert!(config.validate().is_ok());

        config.broker.temp_topic_prefix = config.broker.temp_queue_prefix.clone();
        assert!(config.validate().is_err());
    }
}
