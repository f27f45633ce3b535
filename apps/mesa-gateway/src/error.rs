use thiserror::Error;

use mesa_proto::close_codes;

/// Admission refused at connection time. Not retried by the gateway; the
/// client is expected to back off and reconnect.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("user {user_id} already has {active} connections (cap {cap})")]
    UserLimit { user_id: i64, active: usize, cap: usize },
    #[error("gateway at global connection capacity ({cap})")]
    GlobalLimit { cap: usize },
}

impl AdmissionError {
    pub fn close_code(&self) -> u16 {
        match self {
            AdmissionError::UserLimit { .. } => close_codes::FORBIDDEN,
            AdmissionError::GlobalLimit { .. } => close_codes::TRY_AGAIN_LATER,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            AdmissionError::UserLimit { .. } => "user_limit",
            AdmissionError::GlobalLimit { .. } => "global_limit",
        }
    }
}

/// Credential verification failure. Terminal for the connection attempt.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed credential: {0}")]
    Malformed(String),
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("token expired")]
    Expired,
    #[error("token revoked")]
    Revoked,
    /// The revocation list could not be consulted. Treated as revoked.
    #[error("revocation list unavailable: {0}")]
    RevocationUnavailable(String),
    #[error("no strategy accepted the credential")]
    NoStrategyMatched,
}

impl AuthError {
    pub fn close_code(&self) -> u16 {
        close_codes::AUTH_FAILED
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            AuthError::Malformed(_) => "malformed",
            AuthError::Invalid(_) => "invalid",
            AuthError::Expired => "expired",
            AuthError::Revoked => "revoked",
            AuthError::RevocationUnavailable(_) => "revocation_unavailable",
            AuthError::NoStrategyMatched => "no_strategy",
        }
    }
}

/// Valid credential, but the role or origin does not fit the endpoint.
#[derive(Debug, Error)]
pub enum ForbiddenError {
    #[error("credential lacks the {required} role")]
    MissingRole { required: &'static str },
    #[error("origin {origin:?} not allowed")]
    BadOrigin { origin: String },
}

impl ForbiddenError {
    pub fn close_code(&self) -> u16 {
        match self {
            ForbiddenError::MissingRole { .. } => close_codes::FORBIDDEN,
            ForbiddenError::BadOrigin { .. } => close_codes::POLICY,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            ForbiddenError::MissingRole { .. } => "missing_role",
            ForbiddenError::BadOrigin { .. } => "bad_origin",
        }
    }
}

/// Broker guarded by the circuit breaker is unavailable; callers fail fast.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("broker unavailable (circuit open)")]
pub struct BrokerUnavailable;
