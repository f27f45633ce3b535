use serde::{Deserialize, Serialize};

/// Messages clients may send to the gateway. Anything else on the socket is
/// a protocol error. A bare `"ping"` string is also accepted for liveness
/// (native clients with minimal WebSocket wrappers send it).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Liveness signal; answered with a pong.
    Ping,
    /// Re-pull the caller's sector assignment for one branch.
    RefreshAssignment { branch_id: i64 },
}

impl ClientMessage {
    /// Parses an inbound text frame, accepting both the JSON envelope and
    /// the bare-string ping form.
    pub fn parse(text: &str) -> Option<ClientMessage> {
        let trimmed = text.trim();
        if trimmed == "ping" || trimmed == "\"ping\"" {
            return Some(ClientMessage::Ping);
        }
        serde_json::from_str(trimmed).ok()
    }
}

/// Gateway-originated control messages. Domain events are not wrapped: they
/// are serialized [`crate::Event`]s whose `type` field is the event type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to a liveness ping.
    Pong,
    /// Current sector assignment, in response to `RefreshAssignment`.
    Assignment { branch_id: i64, sector_ids: Vec<i64> },
    /// Non-fatal error report; the connection stays open.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_ping() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"ping"}"#),
            Some(ClientMessage::Ping)
        );
    }

    #[test]
    fn parses_bare_ping() {
        assert_eq!(ClientMessage::parse("ping"), Some(ClientMessage::Ping));
        assert_eq!(ClientMessage::parse(" \"ping\" "), Some(ClientMessage::Ping));
    }

    #[test]
    fn parses_refresh() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"refresh_assignment","branch_id":7}"#),
            Some(ClientMessage::RefreshAssignment { branch_id: 7 })
        );
    }

    #[test]
    fn rejects_unknown() {
        assert_eq!(ClientMessage::parse(r#"{"type":"subscribe"}"#), None);
        assert_eq!(ClientMessage::parse("hello"), None);
    }

    #[test]
    fn server_messages_tagged() {
        let json = serde_json::to_string(&ServerMessage::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }
}
