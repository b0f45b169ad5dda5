//! Helper utilities for Udpx
//!
//! Shared defaults and small conversions used by the config layer and the
//! proxy engine.

use std::time::Duration;

/// Default datagram buffer size in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default client idle timeout in milliseconds
pub const DEFAULT_CLIENT_TIMEOUT_MS: u64 = 60_000;

/// Default upstream re-resolution interval in milliseconds
pub const DEFAULT_RESOLVE_TTL_MS: u64 = 30_000;

/// Default depth of each worker's inbound queue
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// Default management API port
pub const DEFAULT_API_PORT: u16 = 8080;

/// Parse duration from milliseconds
pub fn duration_from_millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Number of packet workers to run when none is configured
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Resolve a configured worker count, where 0 means "one per CPU"
pub fn effective_workers(configured: usize) -> usize {
    if configured == 0 {
        default_workers()
    } else {
        configured
    }
}

/// Resolve a configured queue depth, where 0 means the default
pub fn effective_queue_depth(configured: usize) -> usize {
    if configured == 0 {
        DEFAULT_QUEUE_DEPTH
    } else {
        configured
    }
}
