use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::ws::Message;
use dashmap::DashMap;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

use mesa_proto::{EndpointKind, Role};

pub type ConnectionId = Uuid;

/// One live, accepted connection. The WebSocket sink itself is owned by the
/// connection's writer task; everything else addresses the connection
/// through this handle and its bounded outbound channel.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub tenant_id: i64,
    pub user_id: Option<i64>,
    pub branch_ids: Vec<i64>,
    pub sector_ids: Vec<i64>,
    pub session_id: Option<i64>,
    pub roles: Vec<Role>,
    pub kind: EndpointKind,
    pub connected_at: OffsetDateTime,
    last_heartbeat_ms: AtomicU64,
    dead: AtomicBool,
    sender: mpsc::Sender<Message>,
}

impl ConnectionHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: i64,
        user_id: Option<i64>,
        branch_ids: Vec<i64>,
        sector_ids: Vec<i64>,
        session_id: Option<i64>,
        roles: Vec<Role>,
        kind: EndpointKind,
        sender: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            user_id,
            branch_ids,
            sector_ids,
            session_id,
            roles,
            kind,
            connected_at: OffsetDateTime::now_utc(),
            last_heartbeat_ms: AtomicU64::new(now_millis()),
            dead: AtomicBool::new(false),
            sender,
        }
    }

    pub fn sender(&self) -> &mpsc::Sender<Message> {
        &self.sender
    }

    pub fn touch_heartbeat(&self) {
        self.last_heartbeat_ms.store(now_millis(), Ordering::Relaxed);
    }

    pub fn heartbeat_age(&self) -> Duration {
        let last = self.last_heartbeat_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    /// Monotonic: once dead, always dead.
    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::Relaxed);
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Relaxed)
    }

    pub fn is_admin(&self) -> bool {
        self.kind == EndpointKind::StaffAdmin
    }
}

type IdSet = HashSet<ConnectionId>;

struct RegistryInner {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    by_user: DashMap<i64, IdSet>,
    by_tenant: DashMap<i64, IdSet>,
    by_branch: DashMap<i64, IdSet>,
    by_sector: DashMap<i64, IdSet>,
    by_session: DashMap<i64, IdSet>,
    admins_by_branch: DashMap<i64, IdSet>,
    kitchen_by_branch: DashMap<i64, IdSet>,
}

/// Multi-dimensional index of live connections. Every lookup used for
/// fan-out returns an owned snapshot, so no registry guard is ever held
/// across send I/O. Mutation is funneled through the lifecycle manager,
/// which serializes it per entity via the sharded locks.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: DashMap::new(),
                by_user: DashMap::new(),
                by_tenant: DashMap::new(),
                by_branch: DashMap::new(),
                by_sector: DashMap::new(),
                by_session: DashMap::new(),
                admins_by_branch: DashMap::new(),
                kitchen_by_branch: DashMap::new(),
            }),
        }
    }

    /// Indexes a connection under every dimension its claims populate.
    pub fn insert(&self, handle: Arc<ConnectionHandle>) {
        let id = handle.id;
        let inner = &self.inner;

        inner.by_tenant.entry(handle.tenant_id).or_default().insert(id);
        if let Some(user_id) = handle.user_id {
            inner.by_user.entry(user_id).or_default().insert(id);
        }
        for &branch_id in &handle.branch_ids {
            inner.by_branch.entry(branch_id).or_default().insert(id);
            match handle.kind {
                EndpointKind::StaffAdmin => {
                    inner.admins_by_branch.entry(branch_id).or_default().insert(id);
                }
                EndpointKind::StaffKitchen => {
                    inner.kitchen_by_branch.entry(branch_id).or_default().insert(id);
                }
                _ => {}
            }
        }
        for &sector_id in &handle.sector_ids {
            inner.by_sector.entry(sector_id).or_default().insert(id);
        }
        if let Some(session_id) = handle.session_id {
            inner.by_session.entry(session_id).or_default().insert(id);
        }

        inner.connections.insert(id, handle);
    }

    /// Removes a connection from every dimension. Idempotent: a second
    /// removal finds nothing and returns `None`.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let inner = &self.inner;
        let (_, handle) = inner.connections.remove(&id)?;

        remove_from(&inner.by_tenant, handle.tenant_id, id);
        if let Some(user_id) = handle.user_id {
            remove_from(&inner.by_user, user_id, id);
        }
        for &branch_id in &handle.branch_ids {
            remove_from(&inner.by_branch, branch_id, id);
            remove_from(&inner.admins_by_branch, branch_id, id);
            remove_from(&inner.kitchen_by_branch, branch_id, id);
        }
        for &sector_id in &handle.sector_ids {
            remove_from(&inner.by_sector, sector_id, id);
        }
        if let Some(session_id) = handle.session_id {
            remove_from(&inner.by_session, session_id, id);
        }

        Some(handle)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.inner.connections.get(&id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn user_connection_count(&self, user_id: i64) -> usize {
        self.inner
            .by_user
            .get(&user_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn snapshot_by_session(&self, session_id: i64) -> Vec<Arc<ConnectionHandle>> {
        self.snapshot_index(&self.inner.by_session, session_id)
    }

    pub fn snapshot_by_sector(&self, sector_id: i64) -> Vec<Arc<ConnectionHandle>> {
        self.snapshot_index(&self.inner.by_sector, sector_id)
    }

    pub fn snapshot_by_branch(&self, branch_id: i64) -> Vec<Arc<ConnectionHandle>> {
        self.snapshot_index(&self.inner.by_branch, branch_id)
    }

    pub fn snapshot_by_tenant(&self, tenant_id: i64) -> Vec<Arc<ConnectionHandle>> {
        self.snapshot_index(&self.inner.by_tenant, tenant_id)
    }

    pub fn snapshot_by_user(&self, user_id: i64) -> Vec<Arc<ConnectionHandle>> {
        self.snapshot_index(&self.inner.by_user, user_id)
    }

    pub fn snapshot_admins(&self, branch_id: i64) -> Vec<Arc<ConnectionHandle>> {
        self.snapshot_index(&self.inner.admins_by_branch, branch_id)
    }

    pub fn snapshot_kitchen(&self, branch_id: i64) -> Vec<Arc<ConnectionHandle>> {
        self.snapshot_index(&self.inner.kitchen_by_branch, branch_id)
    }

    /// Point-in-time view of every live connection; used by the sweeps so
    /// they never mutate the maps they iterate.
    pub fn snapshot_all(&self) -> Vec<Arc<ConnectionHandle>> {
        self.inner
            .connections
            .iter()
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn counts_by_kind(&self) -> HashMap<&'static str, usize> {
        let mut counts = HashMap::new();
        for entry in self.inner.connections.iter() {
            *counts.entry(entry.value().kind.as_str()).or_insert(0) += 1;
        }
        counts
    }

    fn snapshot_index(
        &self,
        index: &DashMap<i64, IdSet>,
        key: i64,
    ) -> Vec<Arc<ConnectionHandle>> {
        let ids: Vec<ConnectionId> = match index.get(&key) {
            Some(set) => set.iter().copied().collect(),
            None => return Vec::new(),
        };
        // The guard above is dropped before the per-connection lookups.
        ids.into_iter()
            .filter_map(|id| self.get(id))
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_from(index: &DashMap<i64, IdSet>, key: i64, id: ConnectionId) {
    let mut drop_entry = false;
    if let Some(mut set) = index.get_mut(&key) {
        set.remove(&id);
        drop_entry = set.is_empty();
    }
    if drop_entry {
        index.remove_if(&key, |_, set| set.is_empty());
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Builds a staff handle with a 64-deep channel, returning the receiver
    /// so tests can observe delivered frames.
    pub fn staff_handle(
        tenant_id: i64,
        user_id: i64,
        branch_ids: Vec<i64>,
        sector_ids: Vec<i64>,
        kind: EndpointKind,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(64);
        let roles = match kind {
            EndpointKind::StaffAdmin => vec![Role::Admin],
            EndpointKind::StaffKitchen => vec![Role::Kitchen],
            _ => vec![Role::Waiter],
        };
        let handle = Arc::new(ConnectionHandle::new(
            tenant_id,
            Some(user_id),
            branch_ids,
            sector_ids,
            None,
            roles,
            kind,
            tx,
        ));
        (handle, rx)
    }

    pub fn diner_handle(
        tenant_id: i64,
        branch_id: i64,
        session_id: i64,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(64);
        let handle = Arc::new(ConnectionHandle::new(
            tenant_id,
            None,
            vec![branch_id],
            Vec::new(),
            Some(session_id),
            Vec::new(),
            EndpointKind::Diner,
            tx,
        ));
        (handle, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn indexes_every_populated_dimension() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = staff_handle(1, 10, vec![7, 8], vec![2], EndpointKind::StaffWaiter);
        let id = handle.id;
        registry.insert(handle);

        assert!(registry.contains(id));
        assert_eq!(registry.snapshot_by_tenant(1).len(), 1);
        assert_eq!(registry.snapshot_by_branch(7).len(), 1);
        assert_eq!(registry.snapshot_by_branch(8).len(), 1);
        assert_eq!(registry.snapshot_by_sector(2).len(), 1);
        assert_eq!(registry.snapshot_by_user(10).len(), 1);
        assert!(registry.snapshot_admins(7).is_empty());
        assert!(registry.snapshot_by_session(42).is_empty());
    }

    #[test]
    fn admin_and_kitchen_land_in_role_indices() {
        let registry = ConnectionRegistry::new();
        let (admin, _rx1) = staff_handle(1, 10, vec![7], vec![], EndpointKind::StaffAdmin);
        let (kitchen, _rx2) = staff_handle(1, 11, vec![7], vec![], EndpointKind::StaffKitchen);
        registry.insert(admin);
        registry.insert(kitchen);

        assert_eq!(registry.snapshot_admins(7).len(), 1);
        assert_eq!(registry.snapshot_kitchen(7).len(), 1);
        assert_eq!(registry.snapshot_by_branch(7).len(), 2);
    }

    #[test]
    fn remove_clears_every_dimension_and_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = staff_handle(1, 10, vec![7], vec![2], EndpointKind::StaffWaiter);
        let id = handle.id;
        registry.insert(handle);

        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none(), "second remove is a no-op");

        assert!(!registry.contains(id));
        assert!(registry.snapshot_by_branch(7).is_empty());
        assert!(registry.snapshot_by_sector(2).is_empty());
        assert!(registry.snapshot_by_user(10).is_empty());
        assert_eq!(registry.user_connection_count(10), 0);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn session_index_resolves_diners() {
        let registry = ConnectionRegistry::new();
        let (diner, _rx) = diner_handle(1, 7, 42);
        registry.insert(diner);

        assert_eq!(registry.snapshot_by_session(42).len(), 1);
        assert!(registry.snapshot_by_session(43).is_empty());
    }

    #[test]
    fn dead_flag_is_monotonic() {
        let (handle, _rx) = staff_handle(1, 10, vec![7], vec![], EndpointKind::StaffWaiter);
        assert!(!handle.is_dead());
        handle.mark_dead();
        handle.mark_dead();
        assert!(handle.is_dead());
    }

    #[test]
    fn counts_by_kind_rolls_up() {
        let registry = ConnectionRegistry::new();
        let (a, _r1) = staff_handle(1, 10, vec![7], vec![], EndpointKind::StaffWaiter);
        let (b, _r2) = staff_handle(1, 11, vec![7], vec![], EndpointKind::StaffWaiter);
        let (c, _r3) = diner_handle(1, 7, 42);
        registry.insert(a);
        registry.insert(b);
        registry.insert(c);

        let counts = registry.counts_by_kind();
        assert_eq!(counts.get("staff_waiter"), Some(&2));
        assert_eq!(counts.get("diner"), Some(&1));
    }
}
