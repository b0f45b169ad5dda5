//! Proxy instance configuration
//!
//! One `ProxyConfig` describes one engine: where it listens and where it
//! forwards. The same type is read from TOML files and from the management
//! API, so it accepts both snake_case and camelCase field names.

use serde::{Deserialize, Serialize};

/// Declarative description of a single proxy instance
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Human-readable instance name
    #[serde(default)]
    pub name: String,

    /// Local UDP port the proxy listens on; unique across the registry
    #[serde(default, alias = "bind_port")]
    pub bind_port: u16,

    /// Upstream hostname or IP literal
    #[serde(default, alias = "upstream_address")]
    pub upstream_address: String,

    /// Upstream UDP port
    #[serde(default, alias = "upstream_port")]
    pub upstream_port: u16,

    /// Client idle timeout in milliseconds (0 = registry default)
    #[serde(default, alias = "client_timeout")]
    pub client_timeout: u64,

    /// Upstream re-resolution interval in milliseconds (0 = registry default)
    #[serde(default, rename = "resolveTTL", alias = "resolve_ttl")]
    pub resolve_ttl: u64,
}

impl ProxyConfig {
    /// Create a config with the required fields set
    pub fn new(name: &str, bind_port: u16, upstream_address: &str, upstream_port: u16) -> Self {
        ProxyConfig {
            name: name.to_string(),
            bind_port,
            upstream_address: upstream_address.to_string(),
            upstream_port,
            ..Default::default()
        }
    }

    /// Set the client idle timeout in milliseconds
    pub fn with_client_timeout(mut self, ms: u64) -> Self {
        self.client_timeout = ms;
        self
    }

    /// Set the upstream re-resolution interval in milliseconds
    pub fn with_resolve_ttl(mut self, ms: u64) -> Self {
        self.resolve_ttl = ms;
        self
    }

    /// Validate the required fields.
    ///
    /// The messages match what the management API reports back to callers.
    pub fn validate(&self) -> Result<(), String> {
        if self.bind_port == 0 {
            return Err("bindPort required".to_string());
        }
        if self.upstream_port == 0 {
            return Err("upstreamPort required".to_string());
        }
        if self.upstream_address.trim().is_empty() {
            return Err("upstreamAddress required".to_string());
        }
        if self.name.trim().is_empty() {
            return Err("name required".to_string());
        }
        Ok(())
    }

    /// Fill zero timeouts with the given defaults
    pub fn with_defaults(mut self, client_timeout: u64, resolve_ttl: u64) -> Self {
        if self.client_timeout == 0 {
            self.client_timeout = client_timeout;
        }
        if self.resolve_ttl == 0 {
            self.resolve_ttl = resolve_ttl;
        }
        self
    }
}
