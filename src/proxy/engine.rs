//! Proxy engine lifecycle
//!
//! An engine owns one bind socket, its session table, the upstream target
//! and the background tasks that serve them. It moves through
//! `Created -> Started -> Closed` exactly once.

use super::buffer::BufferPool;
use super::pipeline::Pipeline;
use super::session::SessionTable;
use super::sweep::sweep_loop;
use super::upstream::{refresh_loop, Resolver, SystemResolver, Upstream};
use crate::config::{ProxyConfig, ServerConfig};
use crate::error::{Result, UdpxError};
use crate::helper::{
    duration_from_millis, effective_queue_depth, effective_workers, DEFAULT_BUFFER_SIZE,
};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, info_span, warn, Instrument, Span};

/// Everything an engine needs to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Instance name, used in logs
    pub name: String,
    /// Local IP or hostname to bind on
    pub bind_address: String,
    /// Local port to bind on (0 = OS-assigned)
    pub bind_port: u16,
    /// Upstream hostname or IP literal
    pub upstream_address: String,
    /// Upstream port
    pub upstream_port: u16,
    /// Datagram buffer size; larger datagrams are truncated
    pub buffer_size: usize,
    /// Idle time after which a flow is evicted (zero disables eviction)
    pub idle_timeout: Duration,
    /// Interval between upstream re-resolutions (zero disables refresh)
    pub resolve_ttl: Duration,
    /// Number of packet workers
    pub workers: usize,
    /// Inbound queue depth per worker
    pub queue_depth: usize,
}

impl EngineSettings {
    /// Settings with default buffer, worker and queue sizes and both
    /// background loops disabled
    pub fn new(name: &str, bind_port: u16, upstream_address: &str, upstream_port: u16) -> Self {
        EngineSettings {
            name: name.to_string(),
            bind_address: "0.0.0.0".to_string(),
            bind_port,
            upstream_address: upstream_address.to_string(),
            upstream_port,
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: Duration::ZERO,
            resolve_ttl: Duration::ZERO,
            workers: effective_workers(0),
            queue_depth: effective_queue_depth(0),
        }
    }

    /// Build settings from a defaults-filled proxy config and server settings
    pub fn from_config(proxy: &ProxyConfig, server: &ServerConfig) -> Self {
        EngineSettings {
            name: proxy.name.clone(),
            bind_address: server.bind_address.clone(),
            bind_port: proxy.bind_port,
            upstream_address: proxy.upstream_address.clone(),
            upstream_port: proxy.upstream_port,
            buffer_size: server.buffer_size,
            idle_timeout: duration_from_millis(proxy.client_timeout),
            resolve_ttl: duration_from_millis(proxy.resolve_ttl),
            workers: effective_workers(server.workers),
            queue_depth: effective_queue_depth(server.queue_depth),
        }
    }

    /// Set the local bind address
    pub fn with_bind_address(mut self, addr: &str) -> Self {
        self.bind_address = addr.to_string();
        self
    }

    /// Set the datagram buffer size
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the re-resolution interval
    pub fn with_resolve_ttl(mut self, ttl: Duration) -> Self {
        self.resolve_ttl = ttl;
        self
    }

    /// Set the number of packet workers
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the per-worker queue depth
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }
}

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, nothing bound yet
    Created,
    /// Bind socket open and tasks running
    Started,
    /// Stopped; terminal
    Closed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Created => write!(f, "created"),
            EngineState::Started => write!(f, "started"),
            EngineState::Closed => write!(f, "closed"),
        }
    }
}

/// Handles available once the engine has started
#[derive(Debug)]
struct Running {
    local_addr: SocketAddr,
    sessions: Arc<SessionTable>,
    upstream: Arc<Upstream>,
}

/// One UDP reverse proxy instance
#[derive(Debug)]
pub struct ProxyEngine {
    settings: EngineSettings,
    resolver: Arc<dyn Resolver>,
    state: Mutex<EngineState>,
    running: OnceLock<Running>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    span: Span,
}

impl ProxyEngine {
    /// Create an engine that resolves hostnames through the system resolver
    pub fn new(settings: EngineSettings) -> Self {
        Self::with_resolver(settings, Arc::new(SystemResolver))
    }

    /// Create an engine with a custom resolver
    pub fn with_resolver(settings: EngineSettings, resolver: Arc<dyn Resolver>) -> Self {
        let span = info_span!(
            "proxy",
            name = %settings.name,
            bind_port = settings.bind_port,
            upstream = %format!("{}:{}", settings.upstream_address, settings.upstream_port),
        );
        ProxyEngine {
            settings,
            resolver,
            state: Mutex::new(EngineState::Created),
            running: OnceLock::new(),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            span,
        }
    }

    /// Engine settings
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Instance name
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Current lifecycle state
    pub async fn state(&self) -> EngineState {
        *self.state.lock().await
    }

    /// Bind and start serving.
    ///
    /// A failure leaves the engine `Closed` with nothing running.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state != EngineState::Created {
            return Err(UdpxError::InvalidState(format!(
                "cannot start an engine that is {}",
                *state
            )));
        }

        match self.launch().instrument(self.span.clone()).await {
            Ok(running) => {
                self.span.in_scope(|| {
                    info!(
                        "Listening on {}, forwarding to {}",
                        running.local_addr,
                        running.upstream.current()
                    )
                });
                let _ = self.running.set(running);
                *state = EngineState::Started;
                Ok(())
            }
            Err(e) => {
                self.shutdown.cancel();
                self.tracker.close();
                *state = EngineState::Closed;
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<Running> {
        let settings = &self.settings;
        let bind_addr = resolve_bind_addr(&settings.bind_address, settings.bind_port).await?;

        let upstream = Arc::new(
            Upstream::resolve(
                &settings.upstream_address,
                settings.upstream_port,
                bind_addr.ip(),
                self.resolver.clone(),
            )
            .await?,
        );

        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| UdpxError::Bind {
                addr: bind_addr,
                source,
            })?;
        let local_addr = socket.local_addr()?;
        let sessions = Arc::new(SessionTable::new());

        if settings.idle_timeout.is_zero() {
            warn!("No client timeout set, idle flows will never be evicted");
        } else {
            self.tracker.spawn(
                sweep_loop(sessions.clone(), settings.idle_timeout, self.shutdown.clone())
                    .instrument(self.span.clone()),
            );
        }

        if settings.resolve_ttl.is_zero() {
            warn!("No resolve TTL set, upstream address will never be refreshed");
        } else {
            self.tracker.spawn(
                refresh_loop(upstream.clone(), settings.resolve_ttl, self.shutdown.clone())
                    .instrument(self.span.clone()),
            );
        }

        let workers = settings.workers.max(1);
        let queue_depth = settings.queue_depth.max(1);
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(socket),
            sessions.clone(),
            upstream.clone(),
            BufferPool::new(settings.buffer_size, workers + queue_depth),
            SocketAddr::new(local_addr.ip(), 0),
            settings.idle_timeout,
            self.tracker.clone(),
            self.shutdown.clone(),
        ));
        pipeline.spawn(workers, queue_depth);

        Ok(Running {
            local_addr,
            sessions,
            upstream,
        })
    }

    /// Stop serving and release every socket. Idempotent.
    ///
    /// Returns once all tasks have exited, so the bind port is free again.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if *state == EngineState::Closed {
            return;
        }
        *state = EngineState::Closed;

        self.shutdown.cancel();
        if let Some(running) = self.running.get() {
            running.sessions.close_all();
        }
        self.tracker.close();
        self.tracker.wait().await;

        self.span.in_scope(|| info!("Proxy closed"));
    }

    /// Address the bind socket is listening on
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.get().map(|r| r.local_addr)
    }

    /// Address datagrams are currently forwarded to
    pub fn upstream_addr(&self) -> Option<SocketAddr> {
        self.running.get().map(|r| r.upstream.current())
    }

    /// Number of live flows
    pub fn flow_count(&self) -> usize {
        self.running.get().map_or(0, |r| r.sessions.len())
    }

    /// Whether `client` currently has a flow
    pub fn has_flow(&self, client: &SocketAddr) -> bool {
        self.running
            .get()
            .is_some_and(|r| r.sessions.contains(client))
    }
}

impl Drop for ProxyEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(running) = self.running.get() {
            running.sessions.close_all();
        }
    }
}

/// Resolve a local listen address, accepting hostnames as well as IP literals
pub async fn resolve_bind_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let to_error = |source: io::Error| UdpxError::Resolve {
        host: host.to_string(),
        port,
        source,
    };
    tokio::net::lookup_host((host, port))
        .await
        .map_err(to_error)?
        .next()
        .ok_or_else(|| {
            to_error(io::Error::new(
                io::ErrorKind::NotFound,
                "no addresses returned",
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn upstream_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    fn settings(upstream: SocketAddr) -> EngineSettings {
        EngineSettings::new("test", 0, "127.0.0.1", upstream.port())
            .with_bind_address("127.0.0.1")
            .with_workers(2)
            .with_queue_depth(16)
    }

    #[test]
    fn test_settings_from_config() {
        let proxy = ProxyConfig::new("dns", 5353, "10.0.0.1", 53)
            .with_client_timeout(1500)
            .with_resolve_ttl(0);
        let server = ServerConfig {
            buffer_size: 512,
            workers: 3,
            ..Default::default()
        };

        let settings = EngineSettings::from_config(&proxy, &server);
        assert_eq!(settings.name, "dns");
        assert_eq!(settings.bind_address, "0.0.0.0");
        assert_eq!(settings.bind_port, 5353);
        assert_eq!(settings.buffer_size, 512);
        assert_eq!(settings.idle_timeout, Duration::from_millis(1500));
        assert_eq!(settings.resolve_ttl, Duration::ZERO);
        assert_eq!(settings.workers, 3);
        assert!(settings.queue_depth > 0);
    }

    #[tokio::test]
    async fn test_resolve_bind_addr_accepts_hostnames() {
        let addr = resolve_bind_addr("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 8080)));

        let addr = resolve_bind_addr("localhost", 8080).await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 8080);

        // A TCP listener can bind whatever a hostname resolves to
        let addr = resolve_bind_addr("localhost", 0).await.unwrap();
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        assert!(listener.local_addr().unwrap().ip().is_loopback());

        assert!(matches!(
            resolve_bind_addr("no such host", 8080).await,
            Err(UdpxError::Resolve { .. })
        ));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let upstream = upstream_socket().await;
        let engine = ProxyEngine::new(settings(upstream.local_addr().unwrap()));
        assert_eq!(engine.state().await, EngineState::Created);
        assert!(engine.local_addr().is_none());

        engine.start().await.unwrap();
        assert_eq!(engine.state().await, EngineState::Started);
        assert!(engine.local_addr().is_some());
        assert_eq!(engine.upstream_addr(), Some(upstream.local_addr().unwrap()));
        assert_eq!(engine.flow_count(), 0);

        engine.close().await;
        assert_eq!(engine.state().await, EngineState::Closed);
        engine.close().await;

        assert!(matches!(
            engine.start().await,
            Err(UdpxError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let upstream = upstream_socket().await;
        let engine = ProxyEngine::new(settings(upstream.local_addr().unwrap()));
        engine.start().await.unwrap();
        assert!(matches!(
            engine.start().await,
            Err(UdpxError::InvalidState(_))
        ));
        engine.close().await;
    }

    #[tokio::test]
    async fn test_close_releases_bind_port() {
        let upstream = upstream_socket().await;
        let engine = ProxyEngine::new(settings(upstream.local_addr().unwrap()));
        engine.start().await.unwrap();
        let local = engine.local_addr().unwrap();

        engine.close().await;
        assert!(UdpSocket::bind(local).await.is_ok());
    }

    #[tokio::test]
    async fn test_bind_conflict_fails_start() {
        let upstream = upstream_socket().await;
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut s = settings(upstream.local_addr().unwrap());
        s.bind_port = port;
        let engine = ProxyEngine::new(s);

        assert!(matches!(
            engine.start().await,
            Err(UdpxError::Bind { .. })
        ));
        assert_eq!(engine.state().await, EngineState::Closed);
        assert!(engine.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_bad_bind_address_fails_start() {
        let upstream = upstream_socket().await;
        let engine = ProxyEngine::new(
            settings(upstream.local_addr().unwrap()).with_bind_address("not an address"),
        );
        assert!(matches!(
            engine.start().await,
            Err(UdpxError::Resolve { .. })
        ));
        assert_eq!(engine.state().await, EngineState::Closed);
    }

    #[tokio::test]
    async fn test_close_before_start() {
        let engine = ProxyEngine::new(EngineSettings::new("idle", 0, "127.0.0.1", 9));
        engine.close().await;
        assert_eq!(engine.state().await, EngineState::Closed);
    }

    #[tokio::test]
    async fn test_flow_tracked_and_evicted() {
        let upstream = upstream_socket().await;
        let engine = ProxyEngine::new(
            settings(upstream.local_addr().unwrap())
                .with_idle_timeout(Duration::from_millis(100)),
        );
        engine.start().await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"hi", engine.local_addr().unwrap())
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), upstream.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"hi");
        assert!(engine.has_flow(&client.local_addr().unwrap()));
        assert_eq!(engine.flow_count(), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(engine.flow_count(), 0);

        engine.close().await;
    }
}
