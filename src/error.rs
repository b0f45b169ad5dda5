//! Error types for Udpx
//!
//! This module defines the error type shared by the proxy engine and the
//! registry. Runtime failures inside background loops never surface here;
//! they are logged where they happen.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Result alias used by the proxy core
pub type Result<T> = std::result::Result<T, UdpxError>;

/// Main error type for Udpx operations
#[derive(Error, Debug)]
pub enum UdpxError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A proxy definition is missing a required field
    #[error("Validation error: {0}")]
    Validation(String),

    /// Hostname resolution failed or returned no usable address
    #[error("Failed to resolve {host}:{port}: {source}")]
    Resolve {
        /// Host that was looked up
        host: String,
        /// Port that was looked up
        port: u16,
        /// Underlying resolver error
        source: io::Error,
    },

    /// Binding a local socket failed
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address we tried to bind
        addr: SocketAddr,
        /// Underlying socket error
        source: io::Error,
    },

    /// A proxy is already registered on this bind port
    #[error("Bind port {0} is already in use by another proxy")]
    AlreadyBound(u16),

    /// No proxy is registered on this bind port
    #[error("No proxy registered on bind port {0}")]
    NotFound(u16),

    /// Lifecycle operation not allowed in the engine's current state
    #[error("Invalid engine state: {0}")]
    InvalidState(String),
}

impl UdpxError {
    /// Whether this error is a registry conflict rather than a failure
    pub fn is_conflict(&self) -> bool {
        matches!(self, UdpxError::AlreadyBound(_) | UdpxError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_udpx_error_display() {
        let err = UdpxError::Config("bad buffer".to_string());
        assert_eq!(format!("{}", err), "Configuration error: bad buffer");

        let err = UdpxError::Validation("name required".to_string());
        assert_eq!(format!("{}", err), "Validation error: name required");

        let err = UdpxError::AlreadyBound(23456);
        assert_eq!(
            format!("{}", err),
            "Bind port 23456 is already in use by another proxy"
        );

        let err = UdpxError::NotFound(9);
        assert_eq!(format!("{}", err), "No proxy registered on bind port 9");

        let err = UdpxError::InvalidState("closed".to_string());
        assert_eq!(format!("{}", err), "Invalid engine state: closed");
    }

    #[test]
    fn test_resolve_and_bind_display() {
        let err = UdpxError::Resolve {
            host: "upstream.invalid".to_string(),
            port: 53,
            source: io::Error::new(io::ErrorKind::NotFound, "no such host"),
        };
        assert_eq!(
            format!("{}", err),
            "Failed to resolve upstream.invalid:53: no such host"
        );

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 80);
        let err = UdpxError::Bind {
            addr,
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(format!("{}", err), "Failed to bind 127.0.0.1:80: in use");
    }

    #[test]
    fn test_udpx_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::Other, "io error");
        let err: UdpxError = io_err.into();
        assert!(matches!(err, UdpxError::Io(_)));
    }

    #[test]
    fn test_is_conflict() {
        assert!(UdpxError::AlreadyBound(1).is_conflict());
        assert!(UdpxError::NotFound(1).is_conflict());
        assert!(!UdpxError::Config("x".to_string()).is_conflict());
    }
}
