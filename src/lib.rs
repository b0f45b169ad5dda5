//! # Udpx - UDP Reverse Proxy
//!
//! Udpx listens on local UDP ports and forwards every datagram to a
//! configured upstream, relaying replies back to the original client. Each
//! client gets its own ephemeral socket toward upstream, so the upstream
//! sees one distinct peer per client and replies can be routed back.
//!
//! ## Features
//!
//! - **Many proxies per process**: a registry keyed by bind port
//! - **Lazy flows**: ephemeral sockets are opened on a client's first datagram
//! - **Idle eviction**: flows with no traffic for the client timeout are closed
//! - **Upstream re-resolution**: hostnames are resolved again every resolve TTL
//! - **Management API**: create, inspect and delete proxies over HTTP
//!
//! ## Usage
//!
//! ```rust,ignore
//! use udpx::config::{ProxyConfig, ServerConfig};
//! use udpx::registry::Registry;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Registry::new(ServerConfig::default());
//!     registry
//!         .register(ProxyConfig::new("dns", 5353, "resolver.internal", 53))
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     registry.shutdown_all().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Client -> bind socket -> worker -> ephemeral socket -> Upstream
//! Client <- bind socket <- flow reader <- ephemeral socket <- Upstream
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod api;
pub mod config;
pub mod error;
pub mod helper;
pub mod proxy;
pub mod registry;

// Re-export commonly used items
pub use config::{load_config, load_config_dir, Config, ProxyConfig, ServerConfig};
pub use error::{Result, UdpxError};
pub use proxy::{EngineSettings, EngineState, ProxyEngine};
pub use registry::Registry;

/// Version of the Udpx library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
