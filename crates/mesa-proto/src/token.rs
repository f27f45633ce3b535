use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::Role;

type HmacSha256 = Hmac<sha2::Sha256>;

/// Claim set inside a staff bearer JWT, minted by the identity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaffClaims {
    /// Staff user id.
    pub sub: i64,
    pub tenant_id: i64,
    pub branch_ids: Vec<i64>,
    #[serde(default)]
    pub sector_ids: Vec<i64>,
    pub roles: Vec<Role>,
    /// Token id consulted against the revocation list.
    pub jti: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// Claims encoded inside the HMAC-signed diner session token. The token
/// binds one dining session at one table; there is no user identity behind
/// it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionTokenClaims {
    pub tenant_id: i64,
    pub branch_id: i64,
    pub session_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl SessionTokenClaims {
    pub fn new(
        tenant_id: i64,
        branch_id: i64,
        session_id: i64,
        table_id: Option<i64>,
        ttl: time::Duration,
    ) -> Self {
        let issued_at = OffsetDateTime::now_utc();
        Self {
            tenant_id,
            branch_id,
            session_id,
            table_id,
            issued_at,
            expires_at: issued_at + ttl,
        }
    }

    pub fn ensure_not_expired(&self, now: OffsetDateTime) -> Result<(), SessionTokenError> {
        if now > self.expires_at {
            Err(SessionTokenError::Expired)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SessionTokenError {
    #[error("token is not in payload.signature form")]
    InvalidFormat,
    #[error("invalid base64 in token: {0}")]
    InvalidBase64(String),
    #[error("invalid token payload: {0}")]
    InvalidJson(String),
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token has expired")]
    Expired,
}

/// Signs claims as `base64(json).base64(hmac)`.
pub fn sign_session_token(claims: &SessionTokenClaims, secret: &[u8]) -> String {
    let payload = serde_json::to_vec(claims).expect("session claims serialize");
    let encoded = URL_SAFE_NO_PAD.encode(&payload);
    let mac = compute_mac(secret, encoded.as_bytes());
    format!("{encoded}.{mac}")
}

/// Verifies signature and expiry, returning the embedded claims.
pub fn verify_session_token(
    token: &str,
    secret: &[u8],
    now: OffsetDateTime,
) -> Result<SessionTokenClaims, SessionTokenError> {
    let (payload, signature) = token
        .split_once('.')
        .ok_or(SessionTokenError::InvalidFormat)?;

    let expected = compute_mac(secret, payload.as_bytes());
    // Tokens arrive from untrusted clients; compare the freshly computed mac.
    if signature != expected {
        return Err(SessionTokenError::BadSignature);
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| SessionTokenError::InvalidBase64(e.to_string()))?;
    let claims: SessionTokenClaims =
        serde_json::from_slice(&bytes).map_err(|e| SessionTokenError::InvalidJson(e.to_string()))?;
    claims.ensure_not_expired(now)?;
    Ok(claims)
}

fn compute_mac(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(payload);
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}
