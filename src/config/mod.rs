//! Configuration module for Udpx
//!
//! This module provides configuration types and TOML loading for the
//! registry defaults and the static set of proxies started at boot.

mod proxy;
mod server;

pub use proxy::ProxyConfig;
pub use server::ServerConfig;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Registry-wide settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Proxies to register at startup
    #[serde(default, rename = "proxy")]
    pub proxies: Vec<ProxyConfig>,
}

/// Shape of a single file inside a config directory
#[derive(Debug, Deserialize)]
struct ConfigFile {
    server: Option<ServerConfig>,
    #[serde(default)]
    proxy: Vec<ProxyConfig>,
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse configuration")
}

/// Load every `*.toml` file in a directory, in file-name order.
///
/// Proxy entries are concatenated; the first `[server]` table wins. A
/// missing directory is not an error and yields the default configuration.
pub fn load_config_dir<P: AsRef<Path>>(dir: P) -> Result<Config> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        warn!("Config directory {:?} does not exist", dir);
        return Ok(Config::default());
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read config directory: {:?}", dir))?
    {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut server = None;
    let mut proxies = Vec::new();
    for path in paths {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let file: ConfigFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        debug!("Loaded {} proxies from {:?}", file.proxy.len(), path);

        if server.is_none() {
            server = file.server;
        }
        proxies.extend(file.proxy);
    }

    Ok(Config {
        server: server.unwrap_or_default(),
        proxies,
    })
}
