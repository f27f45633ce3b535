mod event;
mod messages;
mod token;

pub use event::{Actor, Event, EventValidationError};
pub use messages::{ClientMessage, ServerMessage};
pub use token::{
    sign_session_token, verify_session_token, SessionTokenClaims, SessionTokenError, StaffClaims,
};

use serde::{Deserialize, Serialize};

/// WebSocket close codes used by the gateway. Clients match on these
/// numerically, so the values are frozen.
pub mod close_codes {
    /// Normal close.
    pub const NORMAL: u16 = 1000;
    /// Server shutting down.
    pub const GOING_AWAY: u16 = 1001;
    /// Origin or policy violation (also malformed frames).
    pub const POLICY: u16 = 1008;
    /// Message exceeds the size limit.
    pub const TOO_LARGE: u16 = 1009;
    /// Server at global connection capacity.
    pub const TRY_AGAIN_LATER: u16 = 1013;
    /// Authentication failed.
    pub const AUTH_FAILED: u16 = 4001;
    /// Valid credential, wrong role or origin.
    pub const FORBIDDEN: u16 = 4003;
    /// Per-connection rate limit exceeded.
    pub const RATE_LIMITED: u16 = 4029;
}

/// Staff role carried in token claims.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Waiter,
    Kitchen,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Waiter => "waiter",
            Role::Kitchen => "kitchen",
            Role::Admin => "admin",
        }
    }
}

/// The closed set of connection endpoint kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    StaffWaiter,
    StaffKitchen,
    StaffAdmin,
    Diner,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::StaffWaiter => "staff_waiter",
            EndpointKind::StaffKitchen => "staff_kitchen",
            EndpointKind::StaffAdmin => "staff_admin",
            EndpointKind::Diner => "diner",
        }
    }

    pub fn is_staff(&self) -> bool {
        !matches!(self, EndpointKind::Diner)
    }

    /// Role a staff credential must carry to open this endpoint.
    pub fn required_role(&self) -> Option<Role> {
        match self {
            EndpointKind::StaffWaiter => Some(Role::Waiter),
            EndpointKind::StaffKitchen => Some(Role::Kitchen),
            EndpointKind::StaffAdmin => Some(Role::Admin),
            EndpointKind::Diner => None,
        }
    }
}

/// Broker channel naming. The subscriber listens on `CHANNEL_PATTERN`;
/// producers publish to the specific channel for the event's scope.
pub mod channels {
    pub const CHANNEL_PATTERN: &str = "rt.*";

    pub fn branch_staff(tenant_id: i64, branch_id: i64) -> String {
        format!("rt.{tenant_id}.branch.{branch_id}.staff")
    }

    pub fn branch_kitchen(tenant_id: i64, branch_id: i64) -> String {
        format!("rt.{tenant_id}.branch.{branch_id}.kitchen")
    }

    pub fn branch_admin(tenant_id: i64, branch_id: i64) -> String {
        format!("rt.{tenant_id}.branch.{branch_id}.admin")
    }

    pub fn branch_sector_staff(tenant_id: i64, branch_id: i64, sector_id: i64) -> String {
        format!("rt.{tenant_id}.branch.{branch_id}.sector.{sector_id}.staff")
    }

    pub fn session(tenant_id: i64, session_id: i64) -> String {
        format!("rt.{tenant_id}.session.{session_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_are_id_scoped() {
        assert_eq!(channels::branch_staff(3, 7), "rt.3.branch.7.staff");
        assert_eq!(
            channels::branch_sector_staff(3, 7, 2),
            "rt.3.branch.7.sector.2.staff"
        );
        assert_eq!(channels::session(3, 42), "rt.3.session.42");
    }

    #[test]
    fn endpoint_roles() {
        assert_eq!(EndpointKind::StaffAdmin.required_role(), Some(Role::Admin));
        assert_eq!(EndpointKind::Diner.required_role(), None);
        assert!(EndpointKind::StaffKitchen.is_staff());
        assert!(!EndpointKind::Diner.is_staff());
    }
}
