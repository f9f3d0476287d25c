//! Responder configuration
//!
//! Loaded from TOML or JSON (chosen by file extension); every field has a
//! default so an empty file is a valid configuration. Command-line flags
//! override file values in the binaries.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::DEFAULT_PORT;

/// How the accept loop schedules handshakes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ConcurrencyMode {
    /// Finish one handshake before accepting the next connection
    #[default]
    Serial,
    /// Run every accepted connection on its own task
    PerConnection,
}

/// Server configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listening socket settings
    #[serde(default)]
    pub listen: ListenConfig,

    /// Per-connection settings
    #[serde(default)]
    pub connection: ConnectionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Address to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port; 0 picks an ephemeral port
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Accept loop scheduling
    #[serde(default)]
    pub concurrency: ConcurrencyMode,

    /// Stop after this many accepted connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u64>,

    /// Deadline for each receive, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_timeout_secs: Option<u64>,

    /// Deadline for each send, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_timeout_secs: Option<u64>,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { DEFAULT_PORT }

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ListenConfig {
    /// `host:port` form accepted by the listener
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl ConnectionConfig {
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_secs.map(Duration::from_secs)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_secs.map(Duration::from_secs)
    }
}

impl ServerConfig {
    /// Reject values the responder cannot run with
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.listen.host.trim().is_empty() {
            return Err(ProtocolError::Config("listen.host must not be empty".to_string()));
        }
        if self.connection.read_timeout_secs == Some(0) {
            return Err(ProtocolError::Config(
                "connection.read_timeout_secs must be positive".to_string(),
            ));
        }
        if self.connection.write_timeout_secs == Some(0) {
            return Err(ProtocolError::Config(
                "connection.write_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "json")
}

/// Load configuration from a file
pub fn load(path: &Path) -> ProtocolResult<ServerConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| ProtocolError::Config(format!("cannot read {}: {}", path.display(), e)))?;

    let config: ServerConfig = if is_json(path) {
        serde_json::from_str(&content)?
    } else {
        // Assume TOML if not JSON
        toml::from_str(&content)?
    };

    config.validate()?;
    Ok(config)
}

/// Save configuration to a file
pub fn save(config: &ServerConfig, path: &Path) -> ProtocolResult<()> {
    let content = if is_json(path) {
        serde_json::to_string_pretty(config)?
    } else {
        toml::to_string_pretty(config).map_err(|e| ProtocolError::Config(e.to_string()))?
    };

    fs::write(path, content)
        .map_err(|e| ProtocolError::Config(format!("cannot write {}: {}", path.display(), e)))
}

/// Generate a sample configuration file
pub fn generate_sample() -> String {
    let config = ServerConfig::default();
    toml::to_string_pretty(&config).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen.host, "0.0.0.0");
        assert_eq!(config.listen.port, 8081);
        assert_eq!(config.connection.concurrency, ConcurrencyMode::Serial);
        assert_eq!(config.connection.read_timeout(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_toml_config() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            "[listen]\nport = 9000\n\n[connection]\nconcurrency = \"per-connection\"\nread_timeout_secs = 5"
        )
        .unwrap();

        let config = load(file.path()).unwrap();
        assert_eq!(config.listen.port, 9000);
        assert_eq!(config.listen.host, "0.0.0.0");
        assert_eq!(config.connection.concurrency, ConcurrencyMode::PerConnection);
        assert_eq!(config.connection.read_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.connection.write_timeout(), None);
    }

    #[test]
    fn test_load_json_config() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"listen": {{"host": "127.0.0.1"}}}}"#).unwrap();

        let config = load(file.path()).unwrap();
        assert_eq!(config.listen.host, "127.0.0.1");
        assert_eq!(config.listen.port, 8081);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "[connection]\nwrite_timeout_secs = 0").unwrap();

        let err = load(file.path()).unwrap_err();
        assert!(matches!(err, ProtocolError::Config(_)));
    }

    #[test]
    fn test_save_and_load() {
        let mut config = ServerConfig::default();
        config.connection.max_connections = Some(3);
        let file = NamedTempFile::with_suffix(".json").unwrap();

        save(&config, file.path()).unwrap();
        let loaded = load(file.path()).unwrap();

        assert_eq!(config, loaded);
    }

    #[test]
    fn test_sample_parses_back() {
        let sample = generate_sample();
        let parsed: ServerConfig = toml::from_str(&sample).unwrap();
        assert_eq!(parsed, ServerConfig::default());
    }

    #[test]
    fn test_ipv6_socket_addr() {
        let listen = ListenConfig {
            host: "::1".to_string(),
            port: 8081,
        };
        assert_eq!(listen.socket_addr(), "[::1]:8081");
    }
}
