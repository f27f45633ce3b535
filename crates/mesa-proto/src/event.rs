use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

fn default_schema_version() -> u32 {
    1
}

/// Who triggered the event, as reported by the producer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Actor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// One unit of domain news in transit. Serialized as-is to clients, so the
/// field names here are the wire format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub tenant_id: i64,
    /// `0` is the tenant-wide sentinel, valid only for configured types.
    pub branch_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<i64>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Actor>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

#[derive(Debug, Error, PartialEq)]
pub enum EventValidationError {
    #[error("payload is not valid JSON: {0}")]
    Malformed(String),
    #[error("event missing type tag")]
    MissingType,
    #[error("event missing tenant_id")]
    MissingTenant,
    #[error("event tenant_id must be positive, got {0}")]
    InvalidTenant(i64),
    #[error("event missing branch_id")]
    MissingBranch,
}

impl EventValidationError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            EventValidationError::Malformed(_) => "malformed",
            EventValidationError::MissingType => "missing_type",
            EventValidationError::MissingTenant => "missing_tenant",
            EventValidationError::InvalidTenant(_) => "invalid_tenant",
            EventValidationError::MissingBranch => "missing_branch",
        }
    }
}

impl Event {
    /// Parses and validates a raw broker payload. The required-field check
    /// runs on the raw JSON first so a missing field is reported as exactly
    /// that rather than a generic deserialization error.
    pub fn from_json(raw: &str) -> Result<Event, EventValidationError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| EventValidationError::Malformed(e.to_string()))?;

        match value.get("type").and_then(|v| v.as_str()) {
            Some(t) if !t.trim().is_empty() => {}
            _ => return Err(EventValidationError::MissingType),
        }

        let tenant_id = value
            .get("tenant_id")
            .and_then(|v| v.as_i64())
            .ok_or(EventValidationError::MissingTenant)?;
        if tenant_id <= 0 {
            return Err(EventValidationError::InvalidTenant(tenant_id));
        }

        if value.get("branch_id").and_then(|v| v.as_i64()).is_none() {
            return Err(EventValidationError::MissingBranch);
        }

        serde_json::from_value(value).map_err(|e| EventValidationError::Malformed(e.to_string()))
    }

    /// True when the event targets the whole tenant rather than one branch.
    pub fn is_tenant_wide(&self) -> bool {
        self.branch_id == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(fields: &str) -> String {
        format!(r#"{{{fields},"timestamp":"2026-08-30T12:00:00Z"}}"#)
    }

    #[test]
    fn accepts_complete_event() {
        let event = Event::from_json(&raw(
            r#""type":"order.updated","tenant_id":1,"branch_id":7,"sector_id":2,"payload":{"order_id":9}"#,
        ))
        .expect("valid event");
        assert_eq!(event.event_type, "order.updated");
        assert_eq!(event.tenant_id, 1);
        assert_eq!(event.branch_id, 7);
        assert_eq!(event.sector_id, Some(2));
        assert_eq!(event.session_id, None);
        assert_eq!(event.schema_version, 1);
    }

    #[test]
    fn rejects_missing_tenant() {
        let err = Event::from_json(&raw(r#""type":"order.updated","branch_id":7"#)).unwrap_err();
        assert_eq!(err, EventValidationError::MissingTenant);
    }

    #[test]
    fn rejects_non_positive_tenant() {
        let err =
            Event::from_json(&raw(r#""type":"order.updated","tenant_id":0,"branch_id":7"#))
                .unwrap_err();
        assert_eq!(err, EventValidationError::InvalidTenant(0));
    }

    #[test]
    fn rejects_missing_type_and_branch() {
        let err = Event::from_json(&raw(r#""tenant_id":1,"branch_id":7"#)).unwrap_err();
        assert_eq!(err, EventValidationError::MissingType);

        let err = Event::from_json(&raw(r#""type":"x","tenant_id":1"#)).unwrap_err();
        assert_eq!(err, EventValidationError::MissingBranch);
    }

    #[test]
    fn branch_zero_is_valid_and_tenant_wide() {
        let event = Event::from_json(&raw(r#""type":"catalog.updated","tenant_id":1,"branch_id":0"#))
            .expect("branch 0 is the tenant-wide sentinel");
        assert!(event.is_tenant_wide());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            Event::from_json("not json").unwrap_err(),
            EventValidationError::Malformed(_)
        ));
    }
}
