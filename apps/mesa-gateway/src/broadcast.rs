use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures_util::future::join_all;
use metrics::counter;
use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::limiter::SlidingWindow;
use crate::registry::{ConnectionHandle, ConnectionId};

/// Result of one fan-out call. Failed connections have been flagged dead;
/// the dead sweep removes them asynchronously.
#[derive(Debug, Default)]
pub struct BroadcastOutcome {
    pub sent: usize,
    pub failed: Vec<ConnectionId>,
    /// Set when the global broadcast limiter refused the whole call.
    pub throttled: bool,
}

/// Parallel batched fan-out. Targets are processed in fixed-size batches;
/// within a batch every send is issued concurrently and awaited to
/// completion, so one misbehaving client delays delivery by at most its
/// send timeout and never aborts the batch.
pub struct Broadcaster {
    batch_size: usize,
    send_timeout: Duration,
    global_window: Mutex<SlidingWindow>,
}

impl Broadcaster {
    pub fn new(batch_size: usize, send_timeout: Duration, broadcasts_per_second: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            send_timeout,
            global_window: Mutex::new(SlidingWindow::new(
                broadcasts_per_second,
                Duration::from_secs(1),
            )),
        }
    }

    pub async fn send(&self, targets: &[Arc<ConnectionHandle>], payload: &str) -> BroadcastOutcome {
        if targets.is_empty() {
            return BroadcastOutcome::default();
        }

        if !self.global_window.lock().try_hit() {
            warn!(targets = targets.len(), "broadcast rate limit hit, dropping fan-out");
            counter!("mesa_gateway_broadcasts_throttled_total", 1);
            return BroadcastOutcome {
                throttled: true,
                ..BroadcastOutcome::default()
            };
        }

        let mut outcome = BroadcastOutcome::default();
        for batch in targets.chunks(self.batch_size) {
            let sends = batch.iter().map(|conn| self.send_one(conn, payload));
            for (conn, ok) in batch.iter().zip(join_all(sends).await) {
                if ok {
                    outcome.sent += 1;
                } else {
                    conn.mark_dead();
                    outcome.failed.push(conn.id);
                }
            }
        }

        counter!("mesa_gateway_broadcast_deliveries_total", outcome.sent as u64);
        if !outcome.failed.is_empty() {
            counter!(
                "mesa_gateway_broadcast_failures_total",
                outcome.failed.len() as u64
            );
            debug!(
                failed = outcome.failed.len(),
                sent = outcome.sent,
                "fan-out finished with per-connection failures"
            );
        }
        outcome
    }

    /// One delivery attempt. A closed channel or a send that cannot make
    /// progress within the timeout both count as failure.
    async fn send_one(&self, conn: &Arc<ConnectionHandle>, payload: &str) -> bool {
        if conn.is_dead() {
            return false;
        }
        matches!(
            timeout(
                self.send_timeout,
                conn.sender().send(Message::Text(payload.to_string())),
            )
            .await,
            Ok(Ok(()))
        )
    }
}
