//! Proxy registry
//!
//! Keeps every running engine keyed by its bind port, along with the
//! defaults-filled configuration it was started from. A bind port is
//! reserved while its engine starts, so slow upstream resolution for one
//! proxy never blocks lookups or changes to the others.

use crate::config::{ProxyConfig, ServerConfig};
use crate::error::{Result, UdpxError};
use crate::proxy::{EngineSettings, ProxyEngine, Resolver, SystemResolver};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use tokio::sync::Mutex;
use tracing::{info, warn};

static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();

#[derive(Debug)]
struct Entry {
    engine: Arc<ProxyEngine>,
    config: ProxyConfig,
}

#[derive(Debug, Default)]
struct Table {
    entries: BTreeMap<u16, Entry>,
}

/// Holds a bind port while its engine starts outside the table lock.
///
/// Released on drop, also when the registering future is cancelled.
struct Reservation<'a> {
    starting: &'a StdMutex<BTreeSet<u16>>,
    bind_port: u16,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.starting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.bind_port);
    }
}

/// Table of running proxy engines keyed by bind port
#[derive(Debug)]
pub struct Registry {
    server: ServerConfig,
    resolver: Arc<dyn Resolver>,
    table: Mutex<Table>,
    starting: StdMutex<BTreeSet<u16>>,
}

impl Registry {
    /// Create an empty registry using the given server-wide settings
    pub fn new(server: ServerConfig) -> Self {
        Self::with_resolver(server, Arc::new(SystemResolver))
    }

    /// Create an empty registry whose engines use a custom resolver
    pub fn with_resolver(server: ServerConfig, resolver: Arc<dyn Resolver>) -> Self {
        Registry {
            server,
            resolver,
            table: Mutex::new(Table::default()),
            starting: StdMutex::new(BTreeSet::new()),
        }
    }

    /// Process-wide registry, built on first use.
    ///
    /// Only the first caller's settings take effect.
    pub fn global(server: ServerConfig) -> Arc<Registry> {
        GLOBAL
            .get_or_init(|| Arc::new(Registry::new(server)))
            .clone()
    }

    /// Server-wide settings applied to every engine
    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    /// Start a proxy and add it to the registry.
    ///
    /// Missing timeouts are filled from the server defaults before
    /// validation. Returns the stored configuration. Fails with
    /// [`UdpxError::AlreadyBound`] if the bind port is taken, in which case
    /// nothing changes.
    pub async fn register(&self, config: ProxyConfig) -> Result<ProxyConfig> {
        let config = config.with_defaults(
            self.server.default_client_timeout,
            self.server.default_resolve_ttl,
        );
        config.validate().map_err(UdpxError::Validation)?;

        let bind_port = config.bind_port;
        let reservation = self.reserve(bind_port).await?;

        let settings = EngineSettings::from_config(&config, &self.server);
        let engine = Arc::new(ProxyEngine::with_resolver(settings, self.resolver.clone()));
        engine.start().await?;

        let mut table = self.table.lock().await;

        info!(
            "Registered proxy '{}' on port {} -> {}:{}",
            config.name, bind_port, config.upstream_address, config.upstream_port
        );
        table.entries.insert(
            bind_port,
            Entry {
                engine,
                config: config.clone(),
            },
        );
        drop(reservation);
        Ok(config)
    }

    async fn reserve(&self, bind_port: u16) -> Result<Reservation<'_>> {
        let table = self.table.lock().await;
        let mut starting = self.starting.lock().unwrap_or_else(|e| e.into_inner());
        if table.entries.contains_key(&bind_port) || !starting.insert(bind_port) {
            return Err(UdpxError::AlreadyBound(bind_port));
        }
        Ok(Reservation {
            starting: &self.starting,
            bind_port,
        })
    }

    /// Register configurations in order, skipping any that fail.
    ///
    /// Returns how many were registered.
    pub async fn register_all<I>(&self, configs: I) -> usize
    where
        I: IntoIterator<Item = ProxyConfig>,
    {
        let mut registered = 0;
        for config in configs {
            let name = config.name.clone();
            match self.register(config).await {
                Ok(_) => registered += 1,
                Err(e) => warn!("Skipping proxy '{}': {}", name, e),
            }
        }
        registered
    }

    /// Stored configuration for a bind port
    pub async fn get_config(&self, bind_port: u16) -> Option<ProxyConfig> {
        self.table
            .lock()
            .await
            .entries
            .get(&bind_port)
            .map(|entry| entry.config.clone())
    }

    /// All stored configurations, ordered by bind port
    pub async fn list_configs(&self) -> Vec<ProxyConfig> {
        self.table
            .lock()
            .await
            .entries
            .values()
            .map(|entry| entry.config.clone())
            .collect()
    }

    /// Running engine for a bind port
    pub async fn engine(&self, bind_port: u16) -> Option<Arc<ProxyEngine>> {
        self.table
            .lock()
            .await
            .entries
            .get(&bind_port)
            .map(|entry| entry.engine.clone())
    }

    /// Stop the proxy on a bind port and forget it.
    ///
    /// Returns once the engine has released its sockets. The lock stays held
    /// while closing so the port cannot be registered again before it is
    /// free.
    pub async fn unregister(&self, bind_port: u16) -> Result<()> {
        let mut table = self.table.lock().await;
        let entry = table
            .entries
            .remove(&bind_port)
            .ok_or(UdpxError::NotFound(bind_port))?;

        entry.engine.close().await;
        info!(
            "Unregistered proxy '{}' on port {}",
            entry.config.name, bind_port
        );
        Ok(())
    }

    /// Stop and forget every proxy
    pub async fn shutdown_all(&self) {
        let mut table = self.table.lock().await;
        for (_, entry) in std::mem::take(&mut table.entries) {
            entry.engine.close().await;
        }
    }

    /// Number of registered proxies
    pub async fn len(&self) -> usize {
        self.table.lock().await.entries.len()
    }

    /// Whether no proxy is registered
    pub async fn is_empty(&self) -> bool {
        self.table.lock().await.entries.is_empty()
    }
}
