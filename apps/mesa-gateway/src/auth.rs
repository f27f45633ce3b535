use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use metrics::counter;
use redis::{aio::ConnectionManager, AsyncCommands};
use time::OffsetDateTime;
use tracing::{debug, warn};

use mesa_proto::{verify_session_token, Role, SessionTokenError, StaffClaims};

use crate::error::AuthError;

/// Identity established for an admitted connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Claims {
    pub tenant_id: i64,
    pub user_id: Option<i64>,
    pub branch_ids: Vec<i64>,
    pub sector_ids: Vec<i64>,
    pub session_id: Option<i64>,
    pub roles: Vec<Role>,
}

impl Claims {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

/// Verifies one kind of credential. Strategies never panic on malformed
/// input; every failure is a typed [`AuthError`] selecting the close code.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<Claims, AuthError>;
}

/// Revocation-list lookup behind the token strategy. The production
/// implementation reads a Redis set; failures are surfaced so the caller
/// can fail closed.
#[async_trait]
pub trait RevocationList: Send + Sync {
    async fn is_revoked(&self, jti: &str) -> Result<bool, String>;
}

const REVOCATION_SET_KEY: &str = "auth:revoked";

pub struct RedisRevocationList {
    redis: ConnectionManager,
}

impl RedisRevocationList {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl RevocationList for RedisRevocationList {
    async fn is_revoked(&self, jti: &str) -> Result<bool, String> {
        let mut conn = self.redis.clone();
        conn.sismember::<_, _, bool>(REVOCATION_SET_KEY, jti)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Verifies staff bearer JWTs: signature, expiry, issuer/audience when
/// configured, then the revocation list. A failed revocation lookup is
/// treated as revoked.
pub struct TokenStrategy {
    decoding_key: DecodingKey,
    validation: Validation,
    revocations: Arc<dyn RevocationList>,
}

impl TokenStrategy {
    pub fn new(
        secret: &str,
        issuer: Option<&str>,
        audience: Option<&str>,
        revocations: Arc<dyn RevocationList>,
    ) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = audience {
            validation.set_audience(&[audience]);
        }
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            revocations,
        }
    }
}

#[async_trait]
impl AuthStrategy for TokenStrategy {
    async fn authenticate(&self, credential: &str) -> Result<Claims, AuthError> {
        let data = decode::<StaffClaims>(credential, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            })?;
        let staff = data.claims;

        if staff.tenant_id <= 0 {
            return Err(AuthError::Invalid("tenant_id must be positive".into()));
        }

        match self.revocations.is_revoked(&staff.jti).await {
            Ok(true) => {
                counter!("mesa_gateway_auth_failures_total", 1, "reason" => "revoked");
                return Err(AuthError::Revoked);
            }
            Ok(false) => {}
            Err(err) => {
                // Fail closed: an unreachable revocation list means we
                // cannot prove the token is still good.
                warn!(error = %err, "revocation lookup failed, treating token as revoked");
                return Err(AuthError::RevocationUnavailable(err));
            }
        }

        debug!(user_id = staff.sub, tenant_id = staff.tenant_id, "staff token verified");
        Ok(Claims {
            tenant_id: staff.tenant_id,
            user_id: Some(staff.sub),
            branch_ids: staff.branch_ids,
            sector_ids: staff.sector_ids,
            session_id: None,
            roles: staff.roles,
        })
    }
}

/// Verifies HMAC-signed diner session tokens binding one dining session.
pub struct SessionStrategy {
    secret: Vec<u8>,
}

impl SessionStrategy {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for SessionStrategy {
    async fn authenticate(&self, credential: &str) -> Result<Claims, AuthError> {
        let claims = verify_session_token(credential, &self.secret, OffsetDateTime::now_utc())
            .map_err(|e| match e {
                SessionTokenError::Expired => AuthError::Expired,
                SessionTokenError::BadSignature => AuthError::Invalid("signature mismatch".into()),
                other => AuthError::Malformed(other.to_string()),
            })?;

        Ok(Claims {
            tenant_id: claims.tenant_id,
            user_id: None,
            branch_ids: vec![claims.branch_id],
            sector_ids: Vec::new(),
            session_id: Some(claims.session_id),
            roles: Vec::new(),
        })
    }
}

/// Tries strategies in declared order; first success wins, the last error
/// is reported when none match.
pub struct CompositeStrategy {
    strategies: Vec<Arc<dyn AuthStrategy>>,
}

impl CompositeStrategy {
    pub fn new(strategies: Vec<Arc<dyn AuthStrategy>>) -> Self {
        Self { strategies }
    }
}

#[async_trait]
impl AuthStrategy for CompositeStrategy {
    async fn authenticate(&self, credential: &str) -> Result<Claims, AuthError> {
        let mut last_error = AuthError::NoStrategyMatched;
        for strategy in &self.strategies {
            match strategy.authenticate(credential).await {
                Ok(claims) => return Ok(claims),
                Err(err) => last_error = err,
            }
        }
        Err(last_error)
    }
}

/// Always succeeds with the injected claims. For harnesses and local
/// development only; never wired into production endpoints.
pub struct StaticStrategy {
    claims: Claims,
}

impl StaticStrategy {
    pub fn new(claims: Claims) -> Self {
        Self { claims }
    }
}

#[async_trait]
impl AuthStrategy for StaticStrategy {
    async fn authenticate(&self, _credential: &str) -> Result<Claims, AuthError> {
        Ok(self.claims.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use mesa_proto::{sign_session_token, SessionTokenClaims};

    struct NoRevocations;

    #[async_trait]
    impl RevocationList for NoRevocations {
        async fn is_revoked(&self, _jti: &str) -> Result<bool, String> {
            Ok(false)
        }
    }

    struct RevokedList;

    #[async_trait]
    impl RevocationList for RevokedList {
        async fn is_revoked(&self, _jti: &str) -> Result<bool, String> {
            Ok(true)
        }
    }

    struct BrokenList;

    #[async_trait]
    impl RevocationList for BrokenList {
        async fn is_revoked(&self, _jti: &str) -> Result<bool, String> {
            Err("connection refused".into())
        }
    }

    fn staff_token(secret: &str, exp_offset_secs: i64) -> String {
        let claims = StaffClaims {
            sub: 10,
            tenant_id: 1,
            branch_ids: vec![7],
            sector_ids: vec![2],
            roles: vec![Role::Waiter],
            jti: "token-1".into(),
            exp: OffsetDateTime::now_utc().unix_timestamp() + exp_offset_secs,
            iss: None,
            aud: None,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn token_strategy(revocations: Arc<dyn RevocationList>) -> TokenStrategy {
        TokenStrategy::new("secret", None, None, revocations)
    }

    #[tokio::test]
    async fn valid_staff_token_yields_claims() {
        let strategy = token_strategy(Arc::new(NoRevocations));
        let claims = strategy
            .authenticate(&staff_token("secret", 300))
            .await
            .expect("valid token");
        assert_eq!(claims.tenant_id, 1);
        assert_eq!(claims.user_id, Some(10));
        assert_eq!(claims.branch_ids, vec![7]);
        assert_eq!(claims.sector_ids, vec![2]);
        assert!(claims.has_role(Role::Waiter));
    }

    #[tokio::test]
    async fn expired_staff_token_is_rejected() {
        let strategy = token_strategy(Arc::new(NoRevocations));
        let err = strategy
            .authenticate(&staff_token("secret", -300))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Expired));
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let strategy = token_strategy(Arc::new(NoRevocations));
        let err = strategy
            .authenticate(&staff_token("other-secret", 300))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Invalid(_)));
    }

    #[tokio::test]
    async fn revoked_token_is_rejected() {
        let strategy = token_strategy(Arc::new(RevokedList));
        let err = strategy
            .authenticate(&staff_token("secret", 300))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Revoked));
    }

    #[tokio::test]
    async fn revocation_outage_fails_closed() {
        let strategy = token_strategy(Arc::new(BrokenList));
        let err = strategy
            .authenticate(&staff_token("secret", 300))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::RevocationUnavailable(_)));
    }

    #[tokio::test]
    async fn garbage_credential_is_an_error_not_a_panic() {
        let strategy = token_strategy(Arc::new(NoRevocations));
        assert!(strategy.authenticate("not-a-jwt").await.is_err());
        assert!(strategy.authenticate("").await.is_err());
    }

    #[tokio::test]
    async fn session_strategy_binds_one_session() {
        let secret = b"session-secret";
        let token = sign_session_token(
            &SessionTokenClaims::new(1, 7, 42, Some(12), time::Duration::seconds(60)),
            secret,
        );
        let strategy = SessionStrategy::new(&secret[..]);
        let claims = strategy.authenticate(&token).await.expect("valid token");
        assert_eq!(claims.tenant_id, 1);
        assert_eq!(claims.session_id, Some(42));
        assert_eq!(claims.branch_ids, vec![7]);
        assert_eq!(claims.user_id, None);
        assert!(claims.roles.is_empty());
    }

    #[tokio::test]
    async fn composite_first_success_wins() {
        let secret = b"session-secret";
        let token = sign_session_token(
            &SessionTokenClaims::new(1, 7, 42, None, time::Duration::seconds(60)),
            secret,
        );
        let composite = CompositeStrategy::new(vec![
            Arc::new(token_strategy(Arc::new(NoRevocations))),
            Arc::new(SessionStrategy::new(&secret[..])),
        ]);

        // The JWT strategy fails on a session token; the session strategy
        // then succeeds.
        let claims = composite.authenticate(&token).await.expect("second strategy");
        assert_eq!(claims.session_id, Some(42));

        let err = composite.authenticate("junk").await.unwrap_err();
        assert!(matches!(err, AuthError::Malformed(_) | AuthError::Invalid(_)));
    }

    #[tokio::test]
    async fn static_strategy_returns_injected_claims() {
        let claims = Claims {
            tenant_id: 5,
            user_id: Some(1),
            branch_ids: vec![9],
            sector_ids: Vec::new(),
            session_id: None,
            roles: vec![Role::Admin],
        };
        let strategy = StaticStrategy::new(claims.clone());
        assert_eq!(strategy.authenticate("anything").await.unwrap(), claims);
    }
}
