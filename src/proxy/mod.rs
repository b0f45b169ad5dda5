//! UDP reverse proxy engine
//!
//! This module contains everything one proxy instance needs:
//! - Session table mapping clients to their flows
//! - Pooled datagram buffers
//! - Upstream target with periodic re-resolution
//! - Packet forwarding pipeline
//! - Idle flow eviction
//! - Engine lifecycle tying it all together

pub mod buffer;
pub mod engine;
pub mod pipeline;
pub mod session;
pub mod sweep;
pub mod upstream;

pub use buffer::{BufferPool, PooledBuffer};
pub use engine::{resolve_bind_addr, EngineSettings, EngineState, ProxyEngine};
pub use session::{Flow, SessionTable};
pub use upstream::{Resolver, SystemResolver, Upstream};
