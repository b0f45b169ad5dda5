//! Packet forwarding pipeline
//!
//! A single read loop drains the bind socket and hands each datagram to one
//! of a fixed set of workers through bounded queues. The worker is picked by
//! hashing the client address, so one client's datagrams are always handled
//! by the same worker, in arrival order, and only that worker ever creates
//! the client's flow.
//!
//! ```text
//! client -> bind socket -> read loop -> worker[hash(client)] -> flow socket -> upstream
//! client <- bind socket <------------- flow reader <----------- flow socket <- upstream
//! ```

use super::buffer::{BufferPool, PooledBuffer};
use super::session::{Flow, SessionTable};
use super::upstream::Upstream;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn, Instrument, Span};

/// A datagram read from the bind socket
#[derive(Debug)]
pub struct Datagram {
    /// Client that sent it
    pub src: SocketAddr,
    /// Buffer holding the payload
    pub buf: PooledBuffer,
    /// Payload length within `buf`
    pub len: usize,
}

impl Datagram {
    /// Payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Worker responsible for a client address
pub fn worker_index(client: &SocketAddr, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    client.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

/// Shared state of one engine's forwarding path
#[derive(Debug)]
pub struct Pipeline {
    bind_socket: Arc<UdpSocket>,
    sessions: Arc<SessionTable>,
    upstream: Arc<Upstream>,
    buffers: BufferPool,
    /// Local address ephemeral sockets bind to (port 0)
    ephemeral_addr: SocketAddr,
    /// Minimum age before an inbound datagram refreshes a flow's timestamp
    touch_interval: Duration,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    span: Span,
}

impl Pipeline {
    /// Assemble the pipeline. Nothing runs until [`spawn`](Self::spawn).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bind_socket: Arc<UdpSocket>,
        sessions: Arc<SessionTable>,
        upstream: Arc<Upstream>,
        buffers: BufferPool,
        ephemeral_addr: SocketAddr,
        idle_timeout: Duration,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        Pipeline {
            bind_socket,
            sessions,
            upstream,
            buffers,
            ephemeral_addr,
            touch_interval: idle_timeout / 4,
            tracker,
            shutdown,
            span: Span::current(),
        }
    }

    /// Start the read loop and `workers` packet workers
    pub fn spawn(self: Arc<Self>, workers: usize, queue_depth: usize) {
        let workers = workers.max(1);
        let mut queues = Vec::with_capacity(workers);

        for id in 0..workers {
            let (tx, rx) = mpsc::channel(queue_depth.max(1));
            queues.push(tx);
            let pipeline = self.clone();
            self.tracker
                .spawn(pipeline.worker_loop(id, rx).instrument(self.span.clone()));
        }

        let pipeline = self.clone();
        self.tracker
            .spawn(pipeline.read_loop(queues).instrument(self.span.clone()));
    }

    async fn read_loop(self: Arc<Self>, queues: Vec<mpsc::Sender<Datagram>>) {
        loop {
            let mut buf = self.buffers.get();
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = self.bind_socket.recv_from(&mut buf) => res,
            };

            let (len, src) = match received {
                Ok(r) => r,
                Err(e) => {
                    warn!("Bind socket receive error: {}", e);
                    continue;
                }
            };

            let queue = &queues[worker_index(&src, queues.len())];
            let datagram = Datagram { src, buf, len };
            let sent = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = queue.send(datagram) => res,
            };
            if sent.is_err() {
                break;
            }
        }
        debug!("Bind socket read loop stopped");
    }

    async fn worker_loop(self: Arc<Self>, id: usize, mut rx: mpsc::Receiver<Datagram>) {
        loop {
            let datagram = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(d) => d,
                    None => break,
                },
            };
            self.handle_inbound(datagram).await;
        }
        debug!("Packet worker {} stopped", id);
    }

    /// Forward one client datagram upstream, creating the flow on first sight
    pub async fn handle_inbound(self: &Arc<Self>, datagram: Datagram) {
        let client = datagram.src;
        let upstream = self.upstream.current();

        let (flow, is_new) = match self.sessions.lookup(&client) {
            Some(flow) => (flow, false),
            None => match self.open_flow(client).await {
                Ok(flow) => flow,
                Err(e) => {
                    warn!("Failed to open upstream socket for {}: {}", client, e);
                    return;
                }
            },
        };

        if let Err(e) = flow.socket().send_to(datagram.payload(), upstream).await {
            warn!(
                "Dropping {} bytes from {} to {}: {}",
                datagram.len, client, upstream, e
            );
        }

        if is_new {
            let pipeline = self.clone();
            self.tracker.spawn(
                pipeline
                    .flow_reader(client, flow)
                    .instrument(self.span.clone()),
            );
        } else {
            self.sessions.touch_if_stale(&flow, self.touch_interval);
        }
    }

    /// Allocate an ephemeral socket and store it as the client's flow.
    ///
    /// Returns the flow that ended up in the table and whether it is new.
    async fn open_flow(&self, client: SocketAddr) -> io::Result<(Arc<Flow>, bool)> {
        let socket = UdpSocket::bind(self.ephemeral_addr).await?;
        debug!(
            "New client {} mapped to local port {}",
            client,
            socket.local_addr()?.port()
        );

        let flow = self.sessions.new_flow(socket);
        match self.sessions.insert(client, flow.clone()) {
            None => Ok((flow, true)),
            Some(resident) if resident.is_closed() => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "session table is closed",
            )),
            Some(resident) => Ok((resident, false)),
        }
    }

    /// Relay upstream replies for one flow back to its client
    async fn flow_reader(self: Arc<Self>, client: SocketAddr, flow: Arc<Flow>) {
        loop {
            let mut buf = self.buffers.get();
            let received = tokio::select! {
                _ = flow.closed() => break,
                res = flow.socket().recv_from(&mut buf) => res,
            };

            let len = match received {
                Ok((len, _)) => len,
                Err(e) => {
                    debug!("Upstream socket for {} failed: {}", client, e);
                    self.sessions.remove_flow(&client, &flow);
                    break;
                }
            };

            self.sessions.touch_flow(&flow);
            if let Err(e) = self.bind_socket.send_to(&buf[..len], client).await {
                warn!("Dropping {} bytes from upstream to {}: {}", len, client, e);
            }
        }
        debug!("Flow reader for {} stopped", client);
    }
}
