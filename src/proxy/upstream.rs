//! Upstream target and re-resolution
//!
//! The forwarding path reads the active upstream address on every inbound
//! datagram while a background loop may replace it. The address lives in an
//! [`ArcSwap`], so readers always see a whole address, never a torn one.

use crate::error::{Result, UdpxError};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Hostname resolution used for upstream targets
#[async_trait]
pub trait Resolver: Send + Sync + fmt::Debug {
    /// Resolve `host:port` into candidate socket addresses
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}

/// Pick the address to use among resolved candidates.
///
/// Ephemeral sockets are bound to the proxy's local IP, so an address of
/// the same family is preferred.
pub fn pick_address(candidates: &[SocketAddr], local: IpAddr) -> Option<SocketAddr> {
    candidates
        .iter()
        .find(|addr| addr.is_ipv4() == local.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
}

/// Logical upstream plus its currently active address
#[derive(Debug)]
pub struct Upstream {
    host: String,
    port: u16,
    local: IpAddr,
    resolver: Arc<dyn Resolver>,
    current: ArcSwap<SocketAddr>,
}

impl Upstream {
    /// Resolve `host:port` and build the target around the result
    pub async fn resolve(
        host: &str,
        port: u16,
        local: IpAddr,
        resolver: Arc<dyn Resolver>,
    ) -> Result<Self> {
        let initial = lookup(resolver.as_ref(), host, port, local).await?;
        Ok(Upstream {
            host: host.to_string(),
            port,
            local,
            resolver,
            current: ArcSwap::from_pointee(initial),
        })
    }

    /// Configured hostname
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Configured port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address datagrams are currently sent to
    pub fn current(&self) -> SocketAddr {
        **self.current.load()
    }

    /// Re-resolve the hostname and swap in the result if it changed.
    ///
    /// Returns the new address when a swap happened.
    pub async fn refresh(&self) -> Result<Option<SocketAddr>> {
        let resolved = lookup(self.resolver.as_ref(), &self.host, self.port, self.local).await?;
        if self.current() == resolved {
            return Ok(None);
        }
        self.current.store(Arc::new(resolved));
        Ok(Some(resolved))
    }
}

async fn lookup(
    resolver: &dyn Resolver,
    host: &str,
    port: u16,
    local: IpAddr,
) -> Result<SocketAddr> {
    let to_error = |source: io::Error| UdpxError::Resolve {
        host: host.to_string(),
        port,
        source,
    };
    let candidates = resolver.resolve(host, port).await.map_err(to_error)?;
    pick_address(&candidates, local).ok_or_else(|| {
        to_error(io::Error::new(
            io::ErrorKind::NotFound,
            "no addresses returned",
        ))
    })
}

/// Periodically re-resolve the upstream until `shutdown` fires.
///
/// Failures keep the current address in place.
pub async fn refresh_loop(upstream: Arc<Upstream>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match upstream.refresh().await {
            Ok(Some(addr)) => info!("Upstream address changed to {}", addr),
            Ok(None) => {}
            Err(e) => warn!("Upstream re-resolution failed, keeping {}: {}", upstream.current(), e),
        }
    }
    debug!("Upstream refresh loop stopped");
}
