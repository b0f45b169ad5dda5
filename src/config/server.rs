//! Server-wide configuration
//!
//! Settings shared by every proxy instance in the registry.

use crate::helper::{
    DEFAULT_BUFFER_SIZE, DEFAULT_CLIENT_TIMEOUT_MS, DEFAULT_RESOLVE_TTL_MS,
};
use serde::{Deserialize, Serialize};

/// Default bind address for proxies
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

/// Default datagram buffer size
fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

/// Default client idle timeout in milliseconds
fn default_client_timeout() -> u64 {
    DEFAULT_CLIENT_TIMEOUT_MS
}

/// Default upstream re-resolution interval in milliseconds
fn default_resolve_ttl() -> u64 {
    DEFAULT_RESOLVE_TTL_MS
}

/// Registry-wide settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Local IP that bind sockets and ephemeral sockets use
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Datagram buffer size in bytes; larger datagrams are truncated
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Idle timeout for proxies that do not set their own (ms)
    #[serde(default = "default_client_timeout")]
    pub default_client_timeout: u64,

    /// Re-resolution interval for proxies that do not set their own (ms)
    #[serde(default = "default_resolve_ttl")]
    pub default_resolve_ttl: u64,

    /// Packet workers per proxy (0 = one per CPU)
    #[serde(default)]
    pub workers: usize,

    /// Inbound queue depth per worker (0 = default)
    #[serde(default)]
    pub queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: default_bind_address(),
            buffer_size: default_buffer_size(),
            default_client_timeout: default_client_timeout(),
            default_resolve_ttl: default_resolve_ttl(),
            workers: 0,
            queue_depth: 0,
        }
    }
}

impl ServerConfig {
    /// Validate the server configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.buffer_size == 0 {
            return Err("buffer_size must be greater than 0".to_string());
        }
        if self.bind_address.trim().is_empty() {
            return Err("bind_address cannot be empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.default_client_timeout, 60_000);
        assert_eq!(config.default_resolve_ttl, 30_000);
        assert_eq!(config.workers, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_config_validate_zero_buffer() {
        let config = ServerConfig {
            buffer_size: 0,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("buffer_size"));
    }

    #[test]
    fn test_server_config_validate_empty_bind() {
        let config = ServerConfig {
            bind_address: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_table_uses_defaults() {
        let config: ServerConfig = toml::from_str("buffer_size = 1500").unwrap();
        assert_eq!(config.buffer_size, 1500);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.default_resolve_ttl, 30_000);
    }
}
