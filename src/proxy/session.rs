//! Session table
//!
//! Maps each client address seen on the bind socket to the flow that
//! carries its traffic toward upstream. Lookups happen on every datagram,
//! so the table is a sharded concurrent map and per-flow activity
//! timestamps are atomics that can be bumped without a write lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// One client's pseudo-connection to upstream
#[derive(Debug)]
pub struct Flow {
    /// Ephemeral socket dedicated to this client
    socket: Arc<UdpSocket>,
    /// Last activity, in milliseconds since the owning table's epoch
    last_activity: AtomicU64,
    /// Cancelled when the flow is closed
    closed: CancellationToken,
}

impl Flow {
    /// The ephemeral socket used to reach upstream
    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    /// Local address of the ephemeral socket
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Last activity in table-relative milliseconds
    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Close the flow. Idempotent.
    ///
    /// The socket itself is released once the flow's reader task observes
    /// the cancellation and drops its handle.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the flow has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Future that resolves once the flow is closed
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    fn touch_at(&self, now_ms: u64) {
        self.last_activity.store(now_ms, Ordering::Relaxed);
    }

    fn idle_for(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_activity_ms())
    }
}

/// Concurrent map from client address to flow
#[derive(Debug)]
pub struct SessionTable {
    flows: DashMap<SocketAddr, Arc<Flow>>,
    /// Reference point for flow timestamps
    epoch: Instant,
    /// Parent of every flow's close token
    root: CancellationToken,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    /// Create an empty table
    pub fn new() -> Self {
        SessionTable {
            flows: DashMap::new(),
            epoch: Instant::now(),
            root: CancellationToken::new(),
        }
    }

    /// Milliseconds elapsed between the table epoch and `at`
    pub fn millis_at(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// Milliseconds elapsed since the table epoch
    pub fn now_ms(&self) -> u64 {
        self.millis_at(Instant::now())
    }

    /// Wrap an ephemeral socket into a new flow stamped with the current time.
    ///
    /// Flows created after [`close_all`](Self::close_all) start out closed.
    pub fn new_flow(&self, socket: UdpSocket) -> Arc<Flow> {
        Arc::new(Flow {
            socket: Arc::new(socket),
            last_activity: AtomicU64::new(self.now_ms()),
            closed: self.root.child_token(),
        })
    }

    /// Look up the flow for a client
    pub fn lookup(&self, client: &SocketAddr) -> Option<Arc<Flow>> {
        self.flows.get(client).map(|flow| flow.value().clone())
    }

    /// Insert a flow for a client.
    ///
    /// Returns `None` when the flow was stored. If another flow already
    /// exists for the client, the given flow is closed and the resident one
    /// is returned instead, so a client never owns two ephemeral sockets.
    ///
    /// A flow that is already closed, including every flow created after
    /// [`close_all`](Self::close_all), is never stored and is handed back.
    pub fn insert(&self, client: SocketAddr, flow: Arc<Flow>) -> Option<Arc<Flow>> {
        match self.flows.entry(client) {
            Entry::Occupied(existing) => {
                flow.close();
                Some(existing.get().clone())
            }
            // Checked under the shard lock, so a concurrent close_all either
            // sees this entry when clearing or cancels before the check.
            Entry::Vacant(_) if flow.is_closed() => Some(flow),
            Entry::Vacant(slot) => {
                slot.insert(flow);
                None
            }
        }
    }

    /// Mark a client's flow as active now
    pub fn touch(&self, client: &SocketAddr) -> bool {
        match self.flows.get(client) {
            Some(flow) => {
                flow.touch_at(self.now_ms());
                true
            }
            None => false,
        }
    }

    /// Mark a flow as active now
    pub fn touch_flow(&self, flow: &Flow) {
        flow.touch_at(self.now_ms());
    }

    /// Mark a flow as active only if its timestamp is at least `max_age` old.
    ///
    /// Returns whether the timestamp was updated.
    pub fn touch_if_stale(&self, flow: &Flow, max_age: Duration) -> bool {
        let now = self.now_ms();
        if flow.idle_for(now) >= max_age.as_millis() as u64 {
            flow.touch_at(now);
            true
        } else {
            false
        }
    }

    /// Remove and close a client's flow
    pub fn remove(&self, client: &SocketAddr) -> bool {
        match self.flows.remove(client) {
            Some((_, flow)) => {
                flow.close();
                true
            }
            None => false,
        }
    }

    /// Remove a client's flow only if it is still `flow`.
    ///
    /// The flow is closed either way. A reader whose socket failed must not
    /// tear down a newer flow that replaced its own.
    pub fn remove_flow(&self, client: &SocketAddr, flow: &Arc<Flow>) -> bool {
        flow.close();
        self.flows
            .remove_if(client, |_, current| Arc::ptr_eq(current, flow))
            .is_some()
    }

    /// Remove and close a client's flow if it has been idle for `timeout` at `now_ms`
    pub fn remove_if_idle(&self, client: &SocketAddr, now_ms: u64, timeout: Duration) -> bool {
        let timeout_ms = timeout.as_millis() as u64;
        match self
            .flows
            .remove_if(client, |_, flow| flow.idle_for(now_ms) >= timeout_ms)
        {
            Some((_, flow)) => {
                flow.close();
                true
            }
            None => false,
        }
    }

    /// Visit every flow. The visitor runs under a shard read lock and must
    /// not touch the table or perform I/O.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&SocketAddr, &Flow),
    {
        for entry in self.flows.iter() {
            visit(entry.key(), entry.value());
        }
    }

    /// Clients whose flows have been idle for at least `timeout` at `now_ms`
    pub fn idle_clients(&self, now_ms: u64, timeout: Duration) -> Vec<SocketAddr> {
        let timeout_ms = timeout.as_millis() as u64;
        let mut idle = Vec::new();
        self.for_each(|client, flow| {
            if flow.idle_for(now_ms) >= timeout_ms {
                idle.push(*client);
            }
        });
        idle
    }

    /// Close every flow, including ones created concurrently with this call
    pub fn close_all(&self) {
        self.root.cancel();
        self.flows.clear();
    }

    /// Whether a client currently has a flow
    pub fn contains(&self, client: &SocketAddr) -> bool {
        self.flows.contains_key(client)
    }

    /// Number of live flows
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Whether the table has no flows
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
