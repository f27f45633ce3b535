use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tracing::{debug, warn};

use mesa_proto::Event;

use crate::broadcast::Broadcaster;
use crate::pipeline::EventSink;
use crate::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};

/// Decides which live connections an event reaches, then hands the batch
/// to the broadcaster. An event addresses up to three audiences at once:
///
/// - the diner session named by `session_id`, when present;
/// - one staff audience: the branch kitchen set for kitchen-typed events,
///   else the sector's waiters when `sector_id` is set, else all non-admin
///   staff in the branch;
/// - the branch admins, always.
///
/// `branch_id == 0` is the tenant-wide sentinel instead: only event types
/// explicitly configured as tenant-wide fan out that way (to every staff
/// connection in the tenant); anything else with branch 0 is dropped.
/// A connection is only ever matched within its own tenant.
pub struct EventRouter {
    registry: ConnectionRegistry,
    broadcaster: Arc<Broadcaster>,
    tenant_wide_types: HashSet<String>,
    kitchen_types: HashSet<String>,
}

impl EventRouter {
    pub fn new(
        registry: ConnectionRegistry,
        broadcaster: Arc<Broadcaster>,
        tenant_wide_types: HashSet<String>,
        kitchen_types: HashSet<String>,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            tenant_wide_types,
            kitchen_types,
        }
    }

    pub async fn route(&self, event: &Event) {
        let targets = self.select_targets(event);
        if targets.is_empty() {
            debug!(
                event_type = event.event_type,
                tenant_id = event.tenant_id,
                branch_id = event.branch_id,
                "no live connections for event"
            );
            return;
        }

        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to serialize event for fan-out");
                return;
            }
        };

        let outcome = self.broadcaster.send(&targets, &payload).await;
        counter!(
            "mesa_gateway_events_routed_total", 1,
            "type" => event.event_type.clone()
        );
        counter!("mesa_gateway_messages_sent_total", outcome.sent as u64);
        if !outcome.failed.is_empty() {
            // Failed connections are already marked dead; the dead sweep
            // prunes them from the registry.
            debug!(
                failed = outcome.failed.len(),
                event_type = event.event_type,
                "some deliveries failed"
            );
        }
    }

    fn select_targets(&self, event: &Event) -> Vec<Arc<ConnectionHandle>> {
        if event.is_tenant_wide() {
            if !self.tenant_wide_types.contains(&event.event_type) {
                warn!(
                    event_type = event.event_type,
                    tenant_id = event.tenant_id,
                    "branch 0 on a non-tenant-wide event type, dropping"
                );
                counter!("mesa_gateway_events_dropped_total", 1, "reason" => "bad_scope");
                return Vec::new();
            }
            return self
                .registry
                .snapshot_by_tenant(event.tenant_id)
                .into_iter()
                .filter(|c| c.kind.is_staff() && !c.is_dead())
                .collect();
        }

        let mut selected: HashMap<ConnectionId, Arc<ConnectionHandle>> = HashMap::new();
        let mut add = |handles: Vec<Arc<ConnectionHandle>>| {
            for handle in handles {
                if handle.tenant_id == event.tenant_id && !handle.is_dead() {
                    selected.entry(handle.id).or_insert(handle);
                }
            }
        };

        // Session leg: the diner party the event concerns, independent of
        // the staff selection below.
        if let Some(session_id) = event.session_id {
            add(self.registry.snapshot_by_session(session_id));
        }

        // Staff leg: kitchen-typed events address the kitchen displays;
        // otherwise the sector narrows the audience, and without one the
        // whole branch's non-admin staff is addressed.
        if self.kitchen_types.contains(&event.event_type) {
            add(self.registry.snapshot_kitchen(event.branch_id));
        } else if let Some(sector_id) = event.sector_id {
            add(self.registry.snapshot_by_sector(sector_id));
        } else {
            add(
                self.registry
                    .snapshot_by_branch(event.branch_id)
                    .into_iter()
                    .filter(|c| c.kind.is_staff() && !c.is_admin())
                    .collect(),
            );
        }

        // Branch admins see everything in their branch.
        add(self.registry.snapshot_admins(event.branch_id));

        selected.into_values().collect()
    }
}

#[async_trait]
impl EventSink for EventRouter {
    async fn deliver(&self, event: &Event) {
        self.route(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::{diner_handle, staff_handle};
    use mesa_proto::EndpointKind;
    use serde_json::json;
    use std::time::Duration;
    use time::OffsetDateTime;
    use tokio::sync::mpsc;

    fn event(event_type: &str, tenant: i64, branch: i64) -> Event {
        Event {
            event_type: event_type.into(),
            tenant_id: tenant,
            branch_id: branch,
            sector_id: None,
            session_id: None,
            payload: json!({}),
            actor: None,
            timestamp: OffsetDateTime::now_utc(),
            schema_version: 1,
        }
    }

    struct Fixture {
        registry: ConnectionRegistry,
        router: EventRouter,
        receivers: Vec<mpsc::Receiver<axum::extract::ws::Message>>,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = ConnectionRegistry::new();
            let broadcaster =
                Arc::new(Broadcaster::new(50, Duration::from_secs(5), 1000));
            let router = EventRouter::new(
                registry.clone(),
                broadcaster,
                HashSet::from(["catalog.updated".to_string()]),
                HashSet::from(["order.created".to_string()]),
            );
            Self {
                registry,
                router,
                receivers: Vec::new(),
            }
        }

        fn staff(
            &mut self,
            tenant: i64,
            user: i64,
            branches: Vec<i64>,
            sectors: Vec<i64>,
            kind: EndpointKind,
        ) -> ConnectionId {
            let (handle, rx) = staff_handle(tenant, user, branches, sectors, kind);
            let id = handle.id;
            self.registry.insert(handle);
            self.receivers.push(rx);
            id
        }

        fn diner(&mut self, tenant: i64, branch: i64, session: i64) -> usize {
            let (handle, rx) = diner_handle(tenant, branch, session);
            self.registry.insert(handle);
            self.receivers.push(rx);
            self.receivers.len() - 1
        }

        fn delivered(&mut self, slot: usize) -> bool {
            self.receivers[slot].try_recv().is_ok()
        }
    }

    #[tokio::test]
    async fn sector_event_reaches_covering_waiter_and_admin_only() {
        let mut fx = Fixture::new();
        fx.staff(1, 10, vec![7], vec![2], EndpointKind::StaffWaiter); // slot 0
        fx.staff(1, 11, vec![7], vec![3], EndpointKind::StaffWaiter); // slot 1
        fx.staff(1, 12, vec![7], vec![], EndpointKind::StaffAdmin); // slot 2

        let mut ev = event("table.called", 1, 7);
        ev.sector_id = Some(2);
        fx.router.route(&ev).await;

        assert!(fx.delivered(0), "waiter covering sector 2");
        assert!(!fx.delivered(1), "waiter on sector 3 skipped");
        assert!(fx.delivered(2), "admin always included");
    }

    #[tokio::test]
    async fn kitchen_typed_event_reaches_kitchen_and_session() {
        let mut fx = Fixture::new();
        fx.staff(1, 20, vec![7], vec![], EndpointKind::StaffKitchen); // slot 0
        fx.staff(1, 21, vec![7], vec![5], EndpointKind::StaffWaiter); // slot 1
        let diner = fx.diner(1, 7, 900); // slot 2

        let mut ev = event("order.created", 1, 7);
        ev.session_id = Some(900);
        fx.router.route(&ev).await;

        assert!(fx.delivered(0), "kitchen display gets order.created");
        assert!(!fx.delivered(1), "unrelated waiter skipped");
        assert!(fx.delivered(diner), "originating session notified");
    }

    #[tokio::test]
    async fn session_event_reaches_party_and_staff_legs() {
        let mut fx = Fixture::new();
        fx.staff(1, 25, vec![7], vec![4], EndpointKind::StaffWaiter); // slot 0
        let diner_42 = fx.diner(1, 7, 42); // slot 1
        let diner_43 = fx.diner(1, 7, 43); // slot 2

        // No sector, not kitchen-typed: session leg plus the branch staff.
        let mut ev = event("payment.completed", 1, 7);
        ev.session_id = Some(42);
        fx.router.route(&ev).await;

        assert!(fx.delivered(diner_42), "bound session notified");
        assert!(!fx.delivered(diner_43), "other session untouched");
        assert!(fx.delivered(0), "branch staff see the session event");
    }

    #[tokio::test]
    async fn tenant_isolation_holds_on_shared_ids() {
        let mut fx = Fixture::new();
        // Same branch id in two tenants.
        fx.staff(1, 30, vec![7], vec![], EndpointKind::StaffWaiter); // slot 0
        fx.staff(2, 31, vec![7], vec![], EndpointKind::StaffWaiter); // slot 1

        fx.router.route(&event("order.updated", 1, 7)).await;

        assert!(fx.delivered(0));
        assert!(!fx.delivered(1), "other tenant never sees the event");
    }

    #[tokio::test]
    async fn tenant_wide_requires_configured_type() {
        let mut fx = Fixture::new();
        fx.staff(1, 40, vec![7], vec![], EndpointKind::StaffWaiter); // slot 0
        fx.staff(1, 41, vec![8], vec![], EndpointKind::StaffAdmin); // slot 1
        let diner = fx.diner(1, 7, 901); // slot 2

        fx.router.route(&event("catalog.updated", 1, 0)).await;
        assert!(fx.delivered(0), "staff in branch 7");
        assert!(fx.delivered(1), "staff in branch 8");
        assert!(!fx.delivered(diner), "diners excluded from tenant-wide");

        fx.router.route(&event("order.updated", 1, 0)).await;
        assert!(!fx.delivered(0), "branch 0 on a branch-scoped type drops");
    }

    #[tokio::test]
    async fn branch_event_without_scope_reaches_all_branch_staff() {
        let mut fx = Fixture::new();
        fx.staff(1, 50, vec![7], vec![1], EndpointKind::StaffWaiter); // slot 0
        fx.staff(1, 51, vec![7], vec![], EndpointKind::StaffKitchen); // slot 1
        fx.staff(1, 52, vec![8], vec![], EndpointKind::StaffWaiter); // slot 2
        let diner = fx.diner(1, 7, 902); // slot 3

        fx.router.route(&event("shift.changed", 1, 7)).await;

        assert!(fx.delivered(0));
        assert!(fx.delivered(1));
        assert!(!fx.delivered(2), "other branch skipped");
        assert!(!fx.delivered(diner), "diner not addressed by staff event");
    }

    #[tokio::test]
    async fn duplicate_membership_gets_one_copy() {
        let fx = Fixture::new();
        // Admin also listed as covering a sector: one frame, not two.
        let (handle, mut rx) =
            staff_handle(1, 60, vec![7], vec![2], EndpointKind::StaffAdmin);
        fx.registry.insert(handle);

        let mut ev = event("table.called", 1, 7);
        ev.sector_id = Some(2);
        fx.router.route(&ev).await;

        assert!(rx.try_recv().is_ok(), "one copy delivered");
        assert!(rx.try_recv().is_err(), "no duplicate frame");
    }
}
