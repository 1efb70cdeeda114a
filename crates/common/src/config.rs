use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Redis connection string
    pub redis_url: String,

    /// Mirror the dispatch queue into a Redis sorted set (default: true)
    pub queue_accelerator_enabled: bool,

    /// Resend API key for email delivery
    pub resend_api_key: Option<String>,

    /// Resend endpoint (overridable for staging/mocks)
    pub resend_api_url: String,

    /// Email sender address
    pub email_from: String,

    /// Attempts allowed per notification before it fails terminally (default: 3)
    pub notify_max_attempts: u32,

    /// Minimum time between a failed attempt and the next one, in seconds (default: 300)
    pub notify_retry_delay_secs: u64,

    /// Records claimed per dispatch pass (default: 50)
    pub notify_batch_size: u32,

    /// Dispatch pass interval in seconds (default: 30)
    pub notify_dispatch_interval_secs: u64,

    /// Reconciliation pass interval in seconds (default: 300)
    pub notify_reconcile_interval_secs: u64,

    /// Upper bound on a single provider call, in seconds (default: 30)
    pub notify_send_timeout_secs: u64,

    /// Age after which an abandoned `processing` claim is recovered, in seconds (default: 600)
    pub notify_stale_claim_secs: u64,

    /// Stats cache lifetime in seconds (default: 300)
    pub notify_stats_ttl_secs: u64,

    /// Inbound domain event stream
    pub event_stream: String,

    /// Consumer group used on the inbound stream
    pub event_consumer_group: String,

    /// This process's consumer name within the group; keep it stable across
    /// restarts so unacknowledged entries are re-read
    pub event_consumer_name: String,

    /// Outbound delivery-outcome stream
    pub delivery_event_stream: String,

    /// Admin API listen port (default: 3000)
    pub api_port: u16,
}

/// Upper bound on every configured duration (30 days).
pub const MAX_DURATION_SECS: u64 = 30 * 24 * 60 * 60;

/// Typed engine tuning derived from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub batch_size: u32,
    pub dispatch_interval: Duration,
    pub reconcile_interval: Duration,
    pub send_timeout: Duration,
    pub stale_claim_after: Duration,
    pub stats_ttl: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(300),
            batch_size: 50,
            dispatch_interval: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(300),
            send_timeout: Duration::from_secs(30),
            stale_claim_after: Duration::from_secs(600),
            stats_ttl: Duration::from_secs(300),
        }
    }
}

impl EngineSettings {
    /// Reject tuning the engine cannot run safely with.
    ///
    /// A claim must outlive the provider call it guards, otherwise
    /// reconciliation recovers it while the owner is still sending.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("NOTIFY_MAX_ATTEMPTS must be at least 1");
        }
        if self.batch_size == 0 {
            anyhow::bail!("NOTIFY_BATCH_SIZE must be at least 1");
        }

        let max = Duration::from_secs(MAX_DURATION_SECS);
        for (name, value) in [
            ("NOTIFY_RETRY_DELAY_SECS", self.retry_delay),
            ("NOTIFY_DISPATCH_INTERVAL_SECS", self.dispatch_interval),
            ("NOTIFY_RECONCILE_INTERVAL_SECS", self.reconcile_interval),
            ("NOTIFY_SEND_TIMEOUT_SECS", self.send_timeout),
            ("NOTIFY_STALE_CLAIM_SECS", self.stale_claim_after),
            ("NOTIFY_STATS_TTL_SECS", self.stats_ttl),
        ] {
            if value > max {
                anyhow::bail!("{} must not exceed {} seconds", name, MAX_DURATION_SECS);
            }
        }

        if self.send_timeout.is_zero() {
            anyhow::bail!("NOTIFY_SEND_TIMEOUT_SECS must be at least 1");
        }
        if self.stale_claim_after <= self.send_timeout {
            anyhow::bail!(
                "NOTIFY_STALE_CLAIM_SECS ({}s) must be greater than NOTIFY_SEND_TIMEOUT_SECS ({}s)",
                self.stale_claim_after.as_secs(),
                self.send_timeout.as_secs()
            );
        }

        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 20)?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            queue_accelerator_enabled: parse_var("QUEUE_ACCELERATOR_ENABLED", true)?,
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            resend_api_url: std::env::var("RESEND_API_URL")
                .unwrap_or_else(|_| "https://api.resend.com/emails".to_string()),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "ExamHub <no-reply@examhub.local>".to_string()),
            notify_max_attempts: parse_var("NOTIFY_MAX_ATTEMPTS", 3)?,
            notify_retry_delay_secs: parse_var("NOTIFY_RETRY_DELAY_SECS", 300)?,
            notify_batch_size: parse_var("NOTIFY_BATCH_SIZE", 50)?,
            notify_dispatch_interval_secs: parse_var("NOTIFY_DISPATCH_INTERVAL_SECS", 30)?,
            notify_reconcile_interval_secs: parse_var("NOTIFY_RECONCILE_INTERVAL_SECS", 300)?,
            notify_send_timeout_secs: parse_var("NOTIFY_SEND_TIMEOUT_SECS", 30)?,
            notify_stale_claim_secs: parse_var("NOTIFY_STALE_CLAIM_SECS", 600)?,
            notify_stats_ttl_secs: parse_var("NOTIFY_STATS_TTL_SECS", 300)?,
            event_stream: std::env::var("EVENT_STREAM")
                .unwrap_or_else(|_| "domain-events".to_string()),
            event_consumer_group: std::env::var("EVENT_CONSUMER_GROUP")
                .unwrap_or_else(|_| "notifier".to_string()),
            event_consumer_name: std::env::var("EVENT_CONSUMER_NAME")
                .unwrap_or_else(|_| "notifier-1".to_string()),
            delivery_event_stream: std::env::var("DELIVERY_EVENT_STREAM")
                .unwrap_or_else(|_| "notification-events".to_string()),
            api_port: parse_var("API_PORT", 3000)?,
        };

        config.engine_settings().validate()?;

        Ok(config)
    }

    /// Engine tuning in typed form.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_attempts: self.notify_max_attempts,
            retry_delay: Duration::from_secs(self.notify_retry_delay_secs),
            batch_size: self.notify_batch_size,
            dispatch_interval: Duration::from_secs(self.notify_dispatch_interval_secs),
            reconcile_interval: Duration::from_secs(self.notify_reconcile_interval_secs),
            send_timeout: Duration::from_secs(self.notify_send_timeout_secs),
            stale_claim_after: Duration::from_secs(self.notify_stale_claim_secs),
            stats_ttl: Duration::from_secs(self.notify_stats_ttl_secs),
        }
    }
}

/// Read an optional variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                name,
                std::any::type_name::<T>()
            )
        }),
        Err(_) => Ok(default),
    }
}
