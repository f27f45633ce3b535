use std::borrow::Cow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use metrics::{counter, gauge};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mesa_proto::{close_codes, EndpointKind};

use crate::auth::Claims;
use crate::error::AdmissionError;
use crate::limiter::RateLimiter;
use crate::locks::ShardedLocks;
use crate::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};

const LOCK_TABLE_CLEANUP_THRESHOLD: usize = 512;

/// Admission control and teardown. All registry mutation happens here,
/// under the narrowest lock that covers the entities being touched; the
/// sector and session indices share dedicated global locks because they are
/// not naturally partitionable.
pub struct LifecycleManager {
    registry: ConnectionRegistry,
    limiter: Arc<RateLimiter>,
    user_locks: ShardedLocks<i64>,
    branch_locks: ShardedLocks<i64>,
    sector_lock: tokio::sync::Mutex<()>,
    session_lock: tokio::sync::Mutex<()>,
    total: AtomicUsize,
    per_user_cap: usize,
    global_cap: usize,
    heartbeat_timeout: Duration,
}

impl LifecycleManager {
    pub fn new(
        registry: ConnectionRegistry,
        limiter: Arc<RateLimiter>,
        per_user_cap: usize,
        global_cap: usize,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            limiter,
            user_locks: ShardedLocks::new(LOCK_TABLE_CLEANUP_THRESHOLD),
            branch_locks: ShardedLocks::new(LOCK_TABLE_CLEANUP_THRESHOLD),
            sector_lock: tokio::sync::Mutex::new(()),
            session_lock: tokio::sync::Mutex::new(()),
            total: AtomicUsize::new(0),
            per_user_cap,
            global_cap,
            heartbeat_timeout,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn active_connections(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Admits and registers a connection. The caller supplies the outbound
    /// channel sender; the receiver end belongs to the socket's writer task.
    pub async fn accept(
        &self,
        claims: &Claims,
        kind: EndpointKind,
        sender: mpsc::Sender<Message>,
    ) -> Result<Arc<ConnectionHandle>, AdmissionError> {
        // Reserve a slot in the global count first; backed out on any
        // subsequent refusal.
        if self
            .total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.global_cap).then_some(n + 1)
            })
            .is_err()
        {
            let err = AdmissionError::GlobalLimit {
                cap: self.global_cap,
            };
            counter!("mesa_gateway_admission_rejected_total", 1, "reason" => err.metric_label());
            return Err(err);
        }

        let _user_guard = match claims.user_id {
            Some(user_id) => Some(self.user_locks.acquire(user_id).await),
            None => None,
        };

        if let Some(user_id) = claims.user_id {
            let active = self.registry.user_connection_count(user_id);
            if active >= self.per_user_cap {
                self.total.fetch_sub(1, Ordering::SeqCst);
                let err = AdmissionError::UserLimit {
                    user_id,
                    active,
                    cap: self.per_user_cap,
                };
                counter!("mesa_gateway_admission_rejected_total", 1, "reason" => err.metric_label());
                return Err(err);
            }
        }

        let handle = Arc::new(ConnectionHandle::new(
            claims.tenant_id,
            claims.user_id,
            claims.branch_ids.clone(),
            claims.sector_ids.clone(),
            claims.session_id,
            claims.roles.clone(),
            kind,
            sender,
        ));

        let _branch_guards = self.branch_locks.acquire_many(claims.branch_ids.clone()).await;
        let _sector_guard = if claims.sector_ids.is_empty() {
            None
        } else {
            Some(self.sector_lock.lock().await)
        };
        let _session_guard = if claims.session_id.is_some() {
            Some(self.session_lock.lock().await)
        } else {
            None
        };

        self.registry.insert(handle.clone());

        counter!("mesa_gateway_connections_total", 1, "kind" => kind.as_str());
        gauge!("mesa_gateway_connections_active", self.total.load(Ordering::Relaxed) as f64);
        debug!(
            connection_id = %handle.id,
            tenant_id = handle.tenant_id,
            kind = kind.as_str(),
            "connection registered"
        );

        Ok(handle)
    }

    /// Removes a connection from every index and drops its rate-limiter
    /// entry. Safe to call twice and safe to race with a sweep: the loser
    /// observes a no-op.
    pub async fn release(&self, id: ConnectionId) -> bool {
        let Some(handle) = self.registry.get(id) else {
            return false;
        };

        let _user_guard = match handle.user_id {
            Some(user_id) => Some(self.user_locks.acquire(user_id).await),
            None => None,
        };
        let _branch_guards = self.branch_locks.acquire_many(handle.branch_ids.clone()).await;
        let _sector_guard = if handle.sector_ids.is_empty() {
            None
        } else {
            Some(self.sector_lock.lock().await)
        };
        let _session_guard = if handle.session_id.is_some() {
            Some(self.session_lock.lock().await)
        } else {
            None
        };

        // The registry removal is the linearization point; a concurrent
        // release for the same id finds nothing here.
        let Some(removed) = self.registry.remove(id) else {
            return false;
        };

        self.total.fetch_sub(1, Ordering::SeqCst);
        self.limiter.release(id);
        removed.mark_dead();

        gauge!("mesa_gateway_connections_active", self.total.load(Ordering::Relaxed) as f64);
        debug!(connection_id = %id, "connection released");
        true
    }

    /// Closes and releases connections with no recent liveness signal.
    pub async fn run_stale_sweep(&self) -> usize {
        let candidates: Vec<_> = self
            .registry
            .snapshot_all()
            .into_iter()
            .filter(|c| c.heartbeat_age() > self.heartbeat_timeout)
            .collect();

        let mut pruned = 0usize;
        for handle in candidates {
            info!(
                connection_id = %handle.id,
                age_secs = handle.heartbeat_age().as_secs(),
                "closing stale connection"
            );
            let _ = handle.sender().try_send(close_message(
                close_codes::NORMAL,
                "heartbeat timeout",
            ));
            if self.release(handle.id).await {
                pruned += 1;
                counter!("mesa_gateway_stale_pruned_total", 1);
            }
        }
        pruned
    }

    /// Releases connections the broadcaster flagged dead.
    pub async fn run_dead_sweep(&self) -> usize {
        let candidates: Vec<_> = self
            .registry
            .snapshot_all()
            .into_iter()
            .filter(|c| c.is_dead())
            .collect();

        let mut pruned = 0usize;
        for handle in candidates {
            if self.release(handle.id).await {
                pruned += 1;
                counter!("mesa_gateway_dead_pruned_total", 1);
            }
        }
        pruned
    }

    /// Spawns both periodic sweeps. A sweep iteration never aborts the task;
    /// per-item failures are logged and the next tick proceeds.
    pub fn spawn_sweepers(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (JoinHandle<()>, JoinHandle<()>) {
        let stale = {
            let manager = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {}
                    }
                    let pruned = manager.run_stale_sweep().await;
                    if pruned > 0 {
                        warn!(pruned, "stale sweep closed connections");
                    }
                }
            })
        };
        let dead = {
            let manager = self.clone();
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {}
                    }
                    let pruned = manager.run_dead_sweep().await;
                    if pruned > 0 {
                        debug!(pruned, "dead sweep released connections");
                    }
                }
            })
        };
        (stale, dead)
    }
}

pub fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    }))
}
