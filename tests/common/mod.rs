//! Test utilities for Udpx
//!
//! This module provides common test utilities used across integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::UdpSocket;
use udpx::config::{ProxyConfig, ServerConfig};
use udpx::proxy::Resolver;

/// Default wait for a datagram before a test fails
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Create a UDP socket standing in for an upstream service
pub async fn create_test_upstream() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

/// Create a UDP socket standing in for a client
pub async fn create_test_client() -> (UdpSocket, SocketAddr) {
    create_test_upstream().await
}

/// Pick a UDP port that is free right now
pub async fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap().port()
}

/// Receive one datagram or panic after [`RECV_TIMEOUT`]
pub async fn recv_datagram(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = vec![0u8; 65535];
    let (len, from) = tokio::time::timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .unwrap();
    buf.truncate(len);
    (buf, from)
}

/// Assert no datagram arrives within `wait`
pub async fn assert_silent(socket: &UdpSocket, wait: Duration) {
    let mut buf = [0u8; 1024];
    let result = tokio::time::timeout(wait, socket.recv_from(&mut buf)).await;
    assert!(result.is_err(), "unexpected datagram received");
}

/// Poll `check` until it holds or `within` elapses
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Resolver whose answer tests can change at runtime
#[derive(Debug)]
pub struct SwitchableResolver {
    answer: Mutex<Vec<SocketAddr>>,
}

impl SwitchableResolver {
    /// Resolve every host to `addr`
    pub fn new(addr: SocketAddr) -> Self {
        SwitchableResolver {
            answer: Mutex::new(vec![addr]),
        }
    }

    /// Resolve every host to `addr` from now on
    pub fn switch_to(&self, addr: SocketAddr) {
        *self.answer.lock().unwrap() = vec![addr];
    }
}

#[async_trait]
impl Resolver for SwitchableResolver {
    async fn resolve(&self, _host: &str, _port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(self.answer.lock().unwrap().clone())
    }
}

/// Test server configuration builder
pub struct TestServerBuilder {
    buffer_size: usize,
    client_timeout: u64,
    resolve_ttl: u64,
    workers: usize,
}

impl Default for TestServerBuilder {
    fn default() -> Self {
        TestServerBuilder {
            buffer_size: 4096,
            client_timeout: 60_000,
            resolve_ttl: 0,
            workers: 2,
        }
    }
}

impl TestServerBuilder {
    /// Create a new test server builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set buffer size
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set default client timeout (ms)
    pub fn client_timeout(mut self, ms: u64) -> Self {
        self.client_timeout = ms;
        self
    }

    /// Set default resolve TTL (ms)
    pub fn resolve_ttl(mut self, ms: u64) -> Self {
        self.resolve_ttl = ms;
        self
    }

    /// Set worker count
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            buffer_size: self.buffer_size,
            default_client_timeout: self.client_timeout,
            default_resolve_ttl: self.resolve_ttl,
            workers: self.workers,
            queue_depth: 64,
        }
    }
}

/// Proxy config forwarding `bind_port` to `upstream`
pub fn proxy_config(name: &str, bind_port: u16, upstream: SocketAddr) -> ProxyConfig {
    ProxyConfig::new(name, bind_port, &upstream.ip().to_string(), upstream.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_test_upstream() {
        let (socket, addr) = create_test_upstream().await;
        assert!(addr.port() > 0);
        drop(socket);
    }

    #[test]
    fn test_server_builder() {
        let config = TestServerBuilder::new()
            .buffer_size(8)
            .client_timeout(1000)
            .resolve_ttl(50)
            .workers(1)
            .build();

        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.buffer_size, 8);
        assert_eq!(config.default_client_timeout, 1000);
        assert_eq!(config.default_resolve_ttl, 50);
        assert!(config.validate().is_ok());
    }
}
