use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

/// Lookup of which sectors a staff member currently covers in a branch.
/// The gateway is not authoritative for assignments; it reads whatever the
/// back office last published.
#[async_trait]
pub trait SectorAssignmentStore: Send + Sync {
    async fn sectors_for(
        &self,
        tenant_id: i64,
        branch_id: i64,
        user_id: i64,
    ) -> Result<Vec<i64>, AssignmentError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AssignmentError {
    #[error("assignment store unavailable: {0}")]
    Unavailable(String),
}

struct CachedSectors {
    sectors: Vec<i64>,
    fetched_at: Instant,
}

/// Over this many entries, an insert first sweeps out everything expired.
const CACHE_SWEEP_THRESHOLD: usize = 1024;

type CacheKey = (i64, i64, i64);

/// TTL cache over assignment lookups. An expired entry is removed by the
/// read that finds it, and the table is swept when it grows past the
/// threshold, so departed users do not pin entries forever.
struct AssignmentCache {
    entries: DashMap<CacheKey, CachedSectors>,
    ttl: Duration,
}

impl AssignmentCache {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn get_at(&self, key: &CacheKey, now: Instant) -> Option<Vec<i64>> {
        if let Some(cached) = self.entries.get(key) {
            if now.duration_since(cached.fetched_at) < self.ttl {
                return Some(cached.sectors.clone());
            }
        }
        self.entries
            .remove_if(key, |_, cached| now.duration_since(cached.fetched_at) >= self.ttl);
        None
    }

    fn insert_at(&self, key: CacheKey, sectors: Vec<i64>, now: Instant) {
        if self.entries.len() >= CACHE_SWEEP_THRESHOLD {
            self.entries
                .retain(|_, cached| now.duration_since(cached.fetched_at) < self.ttl);
        }
        self.entries.insert(
            key,
            CachedSectors {
                sectors,
                fetched_at: now,
            },
        );
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Redis-backed store with a short per-entry cache so a burst of
/// `refresh_assignment` requests does not turn into a burst of broker
/// round-trips. Key layout:
/// `assign:{tenant}:{branch}:{user}` -> set of sector ids.
pub struct RedisAssignmentStore {
    redis: ConnectionManager,
    cache: AssignmentCache,
}

impl RedisAssignmentStore {
    pub fn new(redis: ConnectionManager, ttl: Duration) -> Self {
        Self {
            redis,
            cache: AssignmentCache::new(ttl),
        }
    }

    fn key(tenant_id: i64, branch_id: i64, user_id: i64) -> String {
        format!("assign:{}:{}:{}", tenant_id, branch_id, user_id)
    }
}

#[async_trait]
impl SectorAssignmentStore for RedisAssignmentStore {
    async fn sectors_for(
        &self,
        tenant_id: i64,
        branch_id: i64,
        user_id: i64,
    ) -> Result<Vec<i64>, AssignmentError> {
        let cache_key = (tenant_id, branch_id, user_id);
        if let Some(sectors) = self.cache.get_at(&cache_key, Instant::now()) {
            counter!("mesa_gateway_assignment_lookups_total", 1, "source" => "cache");
            return Ok(sectors);
        }

        let mut conn = self.redis.clone();
        let mut sectors: Vec<i64> = conn
            .smembers(Self::key(tenant_id, branch_id, user_id))
            .await
            .map_err(|err| AssignmentError::Unavailable(err.to_string()))?;
        sectors.sort_unstable();

        debug!(tenant_id, branch_id, user_id, ?sectors, "fetched sector assignment");
        counter!("mesa_gateway_assignment_lookups_total", 1, "source" => "redis");
        self.cache
            .insert_at(cache_key, sectors.clone(), Instant::now());
        Ok(sectors)
    }
}

/// Fixed-answer store for tests and local harnesses.
pub struct StaticAssignmentStore {
    sectors: Vec<i64>,
}

impl StaticAssignmentStore {
    pub fn new(sectors: Vec<i64>) -> Self {
        Self { sectors }
    }
}

#[async_trait]
impl SectorAssignmentStore for StaticAssignmentStore {
    async fn sectors_for(
        &self,
        _tenant_id: i64,
        _branch_id: i64,
        _user_id: i64,
    ) -> Result<Vec<i64>, AssignmentError> {
        Ok(self.sectors.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_store_answers() {
        let store = StaticAssignmentStore::new(vec![3, 1, 2]);
        let sectors = store.sectors_for(1, 2, 3).await.unwrap();
        assert_eq!(sectors, vec![3, 1, 2]);
    }

    #[test]
    fn redis_key_layout() {
        assert_eq!(RedisAssignmentStore::key(4, 12, 99), "assign:4:12:99");
    }

    #[test]
    fn cache_read_drops_expired_entry() {
        let cache = AssignmentCache::new(Duration::from_secs(15));
        let start = Instant::now();
        cache.insert_at((1, 2, 3), vec![4, 5], start);

        assert_eq!(
            cache.get_at(&(1, 2, 3), start + Duration::from_secs(5)),
            Some(vec![4, 5])
        );
        assert_eq!(cache.get_at(&(1, 2, 3), start + Duration::from_secs(16)), None);
        assert_eq!(cache.len(), 0, "the stale entry is gone, not just ignored");
    }

    #[test]
    fn cache_sweeps_expired_entries_at_threshold() {
        let cache = AssignmentCache::new(Duration::from_secs(15));
        let start = Instant::now();
        for user in 0..CACHE_SWEEP_THRESHOLD {
            cache.insert_at((1, 1, user as i64), vec![], start);
        }
        assert_eq!(cache.len(), CACHE_SWEEP_THRESHOLD);

        // Everything above is stale by now, so this insert sweeps first.
        cache.insert_at((9, 9, 9), vec![1], start + Duration::from_secs(16));
        assert_eq!(cache.len(), 1);
    }
}
