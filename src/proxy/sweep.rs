//! Idle flow eviction
//!
//! Every `timeout` the sweep snapshots idle clients under the table's read
//! locks, then evicts them one by one. Nothing is closed while iterating.

use super::session::SessionTable;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Run one sweep as of `now`, returning how many flows were evicted
pub fn sweep_once(sessions: &SessionTable, timeout: Duration, now: Instant) -> usize {
    let now_ms = sessions.millis_at(now);
    let candidates = sessions.idle_clients(now_ms, timeout);

    let mut evicted = 0;
    for client in candidates {
        if sessions.remove_if_idle(&client, now_ms, timeout) {
            debug!("Client {} timed out", client);
            evicted += 1;
        }
    }
    evicted
}

/// Sweep idle flows every `timeout` until `shutdown` fires
pub async fn sweep_loop(sessions: Arc<SessionTable>, timeout: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + timeout, timeout);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let evicted = sweep_once(&sessions, timeout, Instant::now());
        if evicted > 0 {
            debug!("Evicted {} idle flows, {} remaining", evicted, sessions.len());
        }
    }
    debug!("Idle sweep loop stopped");
}
