use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

/// How many rejected messages in a row escalate to disconnecting the
/// connection rather than just refusing the message.
const VIOLATION_DISCONNECT_AFTER: u32 = 3;

/// Share of the tracking table evicted in one pass when it is full.
const EVICTION_FRACTION: usize = 10;

/// Sliding-window counter: admits up to `limit` hits per `window`.
#[derive(Debug)]
pub struct SlidingWindow {
    limit: usize,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: VecDeque::with_capacity(limit),
        }
    }

    /// Records a hit at `now` if the window has room. Returns whether the
    /// hit was admitted.
    pub fn try_hit_at(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.hits.front() {
            if now.duration_since(*oldest) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        if self.hits.len() >= self.limit {
            return false;
        }
        self.hits.push_back(now);
        true
    }

    pub fn try_hit(&mut self) -> bool {
        self.try_hit_at(Instant::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allow,
    /// Message refused; connection stays open.
    Reject,
    /// Repeated violations; close the connection with the rate-limit code.
    Disconnect,
}

struct Entry {
    window: Mutex<SlidingWindow>,
    violations: Mutex<u32>,
    last_seen: Mutex<Instant>,
}

/// Per-connection message-rate enforcement with a bounded tracking table.
/// When the table is full the oldest tenth of entries is evicted in one
/// pass; a burst of relaxed limiting for those connections is the accepted
/// cost of avoiding per-message cleanup.
pub struct RateLimiter {
    entries: DashMap<Uuid, Arc<Entry>>,
    limit: usize,
    window: Duration,
    table_cap: usize,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration, table_cap: usize) -> Self {
        Self {
            entries: DashMap::new(),
            limit,
            window,
            table_cap,
        }
    }

    pub fn check(&self, connection_id: Uuid) -> RateDecision {
        self.check_at(connection_id, Instant::now())
    }

    pub fn check_at(&self, connection_id: Uuid, now: Instant) -> RateDecision {
        let entry = match self.entries.get(&connection_id) {
            Some(entry) => entry.clone(),
            None => {
                self.evict_if_full(now);
                self.entries
                    .entry(connection_id)
                    .or_insert_with(|| {
                        Arc::new(Entry {
                            window: Mutex::new(SlidingWindow::new(self.limit, self.window)),
                            violations: Mutex::new(0),
                            last_seen: Mutex::new(now),
                        })
                    })
                    .clone()
            }
        };

        *entry.last_seen.lock() = now;
        if entry.window.lock().try_hit_at(now) {
            *entry.violations.lock() = 0;
            return RateDecision::Allow;
        }

        let mut violations = entry.violations.lock();
        *violations += 1;
        counter!("mesa_gateway_rate_limited_total", 1);
        if *violations >= VIOLATION_DISCONNECT_AFTER {
            RateDecision::Disconnect
        } else {
            RateDecision::Reject
        }
    }

    /// Drops tracking state for a closed connection.
    pub fn release(&self, connection_id: Uuid) {
        self.entries.remove(&connection_id);
    }

    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    fn evict_if_full(&self, now: Instant) {
        if self.entries.len() < self.table_cap {
            return;
        }

        let batch = (self.table_cap / EVICTION_FRACTION).max(1);
        let mut ages: Vec<(Uuid, Duration)> = self
            .entries
            .iter()
            .map(|e| (*e.key(), now.saturating_duration_since(*e.last_seen.lock())))
            .collect();
        ages.sort_by(|a, b| b.1.cmp(&a.1));

        for (id, _) in ages.into_iter().take(batch) {
            self.entries.remove(&id);
        }
        debug!(evicted = batch, "rate-limiter table full, evicted oldest entries");
        counter!("mesa_gateway_rate_table_evictions_total", batch as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_boundary_at_limit() {
        let limiter = RateLimiter::new(20, Duration::from_secs(1), 2000);
        let id = Uuid::new_v4();
        let start = Instant::now();

        for i in 0..20 {
            assert_eq!(
                limiter.check_at(id, start + Duration::from_millis(i * 10)),
                RateDecision::Allow,
                "message {i} within the window must pass"
            );
        }
        assert_eq!(
            limiter.check_at(id, start + Duration::from_millis(500)),
            RateDecision::Reject,
            "21st message within the window is rejected"
        );
        assert_eq!(
            limiter.check_at(id, start + Duration::from_secs(2)),
            RateDecision::Allow,
            "a new window admits again"
        );
    }

    #[test]
    fn repeated_violations_disconnect() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10), 2000);
        let id = Uuid::new_v4();
        let now = Instant::now();

        assert_eq!(limiter.check_at(id, now), RateDecision::Allow);
        assert_eq!(limiter.check_at(id, now), RateDecision::Reject);
        assert_eq!(limiter.check_at(id, now), RateDecision::Reject);
        assert_eq!(limiter.check_at(id, now), RateDecision::Disconnect);
    }

    #[test]
    fn release_clears_entry() {
        let limiter = RateLimiter::new(5, Duration::from_secs(1), 2000);
        let id = Uuid::new_v4();
        limiter.check(id);
        assert_eq!(limiter.tracked(), 1);
        limiter.release(id);
        assert_eq!(limiter.tracked(), 0);
    }

    #[test]
    fn full_table_evicts_oldest_tenth() {
        let limiter = RateLimiter::new(5, Duration::from_secs(1), 100);
        let start = Instant::now();
        for i in 0..100u64 {
            limiter.check_at(Uuid::new_v4(), start + Duration::from_millis(i));
        }
        assert_eq!(limiter.tracked(), 100);

        limiter.check_at(Uuid::new_v4(), start + Duration::from_millis(200));
        // One pass removed cap/10 entries before admitting the newcomer.
        assert_eq!(limiter.tracked(), 91);
    }

    #[test]
    fn sliding_window_is_per_connection() {
        let limiter = RateLimiter::new(1, Duration::from_secs(1), 2000);
        let now = Instant::now();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(limiter.check_at(a, now), RateDecision::Allow);
        assert_eq!(limiter.check_at(b, now), RateDecision::Allow);
        assert_eq!(limiter.check_at(a, now), RateDecision::Reject);
    }
}
