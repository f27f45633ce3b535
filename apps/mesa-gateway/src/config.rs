use std::collections::HashSet;
use std::env;
use std::time::Duration;

/// Tuning knobs, all environment-backed with production defaults. Process
/// flags (listen address, redis url, shutdown grace) live on the CLI in
/// `main.rs`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Concurrent connections allowed per staff user.
    pub per_user_connection_cap: usize,
    /// Concurrent connections allowed across the whole process.
    pub global_connection_cap: usize,
    /// Inbound messages per connection per second.
    pub message_rate_limit: usize,
    /// Broadcasts per second across all events.
    pub broadcast_rate_limit: usize,
    /// Connections per concurrent send round during fan-out.
    pub broadcast_batch_size: usize,
    /// Per-connection send deadline during fan-out.
    pub send_timeout: Duration,
    /// Outbound channel depth per connection.
    pub outbound_buffer: usize,
    /// Heartbeat age beyond which a connection is stale.
    pub heartbeat_timeout: Duration,
    /// Interval of the stale and dead sweeps.
    pub sweep_interval: Duration,
    /// Largest accepted inbound frame.
    pub max_message_bytes: usize,
    /// Bounded ingest queue capacity (drop-oldest beyond this).
    pub queue_capacity: usize,
    /// Events drained per processor tick.
    pub queue_batch_size: usize,
    /// Per-event routing deadline; a timed-out event is re-enqueued once.
    pub routing_timeout: Duration,
    /// Rate-limiter tracking table cap; oldest ~10% evicted when full.
    pub rate_table_cap: usize,
    /// Drop ratio over the rolling window that raises an alert.
    pub drop_alert_threshold: f64,
    /// Alert suppression period after firing.
    pub drop_alert_cooldown: Duration,
    /// Consecutive broker failures before the breaker opens.
    pub breaker_failure_threshold: u32,
    /// How long the breaker stays open before probing.
    pub breaker_cooldown: Duration,
    /// Probe calls admitted while half-open.
    pub breaker_half_open_max: u32,
    /// Origins accepted on staff endpoints; empty means any.
    pub allowed_origins: Vec<String>,
    /// Event types eligible for tenant-wide delivery when branch_id is 0.
    pub tenant_wide_types: HashSet<String>,
    /// Event types delivered to the branch kitchen set.
    pub kitchen_types: HashSet<String>,
    /// HS256 secret for staff bearer tokens.
    pub staff_token_secret: String,
    pub token_issuer: Option<String>,
    pub token_audience: Option<String>,
    /// HMAC secret for diner session tokens.
    pub session_token_secret: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            per_user_connection_cap: env_usize("MESA_PER_USER_CONNECTIONS", 3),
            global_connection_cap: env_usize("MESA_MAX_CONNECTIONS", 1000),
            message_rate_limit: env_usize("MESA_MESSAGE_RATE", 20),
            broadcast_rate_limit: env_usize("MESA_BROADCAST_RATE", 10),
            broadcast_batch_size: env_usize("MESA_BROADCAST_BATCH", 50),
            send_timeout: Duration::from_secs(env_u64("MESA_SEND_TIMEOUT_SECS", 5)),
            outbound_buffer: env_usize("MESA_OUTBOUND_BUFFER", 64),
            heartbeat_timeout: Duration::from_secs(env_u64("MESA_HEARTBEAT_TIMEOUT_SECS", 60)),
            sweep_interval: Duration::from_secs(env_u64("MESA_SWEEP_INTERVAL_SECS", 30)),
            max_message_bytes: env_usize("MESA_MAX_MESSAGE_BYTES", 64 * 1024),
            queue_capacity: env_usize("MESA_QUEUE_CAPACITY", 5000),
            queue_batch_size: env_usize("MESA_QUEUE_BATCH", 50),
            routing_timeout: Duration::from_secs(env_u64("MESA_ROUTING_TIMEOUT_SECS", 30)),
            rate_table_cap: env_usize("MESA_RATE_TABLE_CAP", 2000),
            drop_alert_threshold: env::var("MESA_DROP_ALERT_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.05),
            drop_alert_cooldown: Duration::from_secs(env_u64("MESA_DROP_ALERT_COOLDOWN_SECS", 300)),
            breaker_failure_threshold: env_u64("MESA_BREAKER_FAILURES", 5) as u32,
            breaker_cooldown: Duration::from_secs(env_u64("MESA_BREAKER_COOLDOWN_SECS", 30)),
            breaker_half_open_max: env_u64("MESA_BREAKER_HALF_OPEN_MAX", 3) as u32,
            allowed_origins: env_list("MESA_ALLOWED_ORIGINS"),
            tenant_wide_types: env_set("MESA_TENANT_WIDE_TYPES", &["catalog.updated"]),
            kitchen_types: env_set("MESA_KITCHEN_TYPES", &["order.created"]),
            staff_token_secret: env::var("MESA_STAFF_TOKEN_SECRET")
                .unwrap_or_else(|_| "dev-staff-secret".to_string()),
            token_issuer: env::var("MESA_TOKEN_ISSUER").ok(),
            token_audience: env::var("MESA_TOKEN_AUDIENCE").ok(),
            session_token_secret: env::var("MESA_SESSION_TOKEN_SECRET")
                .unwrap_or_else(|_| "dev-session-secret".to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            per_user_connection_cap: 3,
            global_connection_cap: 1000,
            message_rate_limit: 20,
            broadcast_rate_limit: 10,
            broadcast_batch_size: 50,
            send_timeout: Duration::from_secs(5),
            outbound_buffer: 64,
            heartbeat_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            max_message_bytes: 64 * 1024,
            queue_capacity: 5000,
            queue_batch_size: 50,
            routing_timeout: Duration::from_secs(30),
            rate_table_cap: 2000,
            drop_alert_threshold: 0.05,
            drop_alert_cooldown: Duration::from_secs(300),
            breaker_failure_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
            breaker_half_open_max: 3,
            allowed_origins: Vec::new(),
            tenant_wide_types: ["catalog.updated".to_string()].into_iter().collect(),
            kitchen_types: ["order.created".to_string()].into_iter().collect(),
            staff_token_secret: "dev-staff-secret".to_string(),
            token_issuer: None,
            token_audience: None,
            session_token_secret: "dev-session-secret".to_string(),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn env_set(key: &str, defaults: &[&str]) -> HashSet<String> {
    match env::var(key) {
        Ok(v) => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => defaults.iter().map(|s| s.to_string()).collect(),
    }
}
