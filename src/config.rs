use crate::error::{Error, Result};
use clap::{Args, Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    #[command(flatten)]
    pub store: StoreConfig,

    #[command(flatten)]
    pub poller: PollerConfig,

    #[command(flatten)]
    pub delivery: DeliveryConfig,

    #[command(flatten)]
    pub retry: RetryConfig,

    #[command(flatten)]
    pub connection: ConnectionConfig,

    #[command(flatten)]
    pub credentials: CredentialConfig,

    #[command(flatten)]
    pub apps: AppsConfig,

    #[command(flatten)]
    pub telemetry: TelemetryConfig,

    /// Path to write the PID file to
    #[arg(long, env = "PUSH_RELAY_PID_FILE")]
    pub pid_file: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum StoreClient {
    Memory,
    #[default]
    Redis,
}

#[derive(Clone, Debug, Args)]
pub struct StoreConfig {
    /// Storage backend holding notifications and apps
    #[arg(long = "client", env = "PUSH_RELAY_CLIENT", value_enum, default_value_t = StoreClient::Redis)]
    pub client: StoreClient,

    /// Redis connection URL
    #[arg(long, env = "PUSH_RELAY_REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,

    /// Prefix for every key written by the store
    #[arg(long, env = "PUSH_RELAY_KEY_PREFIX", default_value = "push_relay")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            client: StoreClient::Redis,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "push_relay".to_string(),
        }
    }
}

#[derive(Clone, Debug, Args)]
pub struct PollerConfig {
    /// Seconds between checks for new notifications
    #[arg(long, env = "PUSH_RELAY_PUSH_POLL", default_value_t = 2)]
    pub push_poll: u64,

    /// Maximum notifications held in runner queues at once
    #[arg(long, env = "PUSH_RELAY_BATCH_SIZE", default_value_t = 100)]
    pub batch_size: usize,

    /// Idle runners are stopped after this many seconds without work
    #[arg(long, env = "PUSH_RELAY_RUNNER_IDLE_SECS", default_value_t = 300)]
    pub runner_idle_secs: u64,

    /// Upper bound for the poller's backoff while the store is unavailable
    #[arg(long, env = "PUSH_RELAY_STORE_BACKOFF_MAX_SECS", default_value_t = 30)]
    pub store_backoff_max_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self { push_poll: 2, batch_size: 100, runner_idle_secs: 300, store_backoff_max_secs: 30 }
    }
}

#[derive(Clone, Debug, Args)]
pub struct DeliveryConfig {
    /// Timeout for a single backend write
    #[arg(long, env = "PUSH_RELAY_SEND_TIMEOUT_MS", default_value_t = 10_000)]
    pub send_timeout_ms: u64,

    /// How long delivered notifications are kept before removal
    #[arg(long, env = "PUSH_RELAY_DELIVERED_TTL_SECS", default_value_t = 48 * 3600)]
    pub delivered_ttl_secs: u64,

    /// How long permanently failed notifications are kept before removal
    #[arg(long, env = "PUSH_RELAY_FAILED_TTL_SECS", default_value_t = 24 * 3600)]
    pub failed_ttl_secs: u64,

    /// Grace period for in-flight sends during shutdown
    #[arg(long, env = "PUSH_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    pub shutdown_grace_secs: u64,

    /// Claimed notifications of a paused app go back to the queue for this long
    #[arg(long, env = "PUSH_RELAY_PAUSED_DEFER_SECS", default_value_t = 30)]
    pub paused_defer_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 10_000,
            delivered_ttl_secs: 48 * 3600,
            failed_ttl_secs: 24 * 3600,
            shutdown_grace_secs: 10,
            paused_defer_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Args)]
pub struct RetryConfig {
    /// Delay before the first retry
    #[arg(long, env = "PUSH_RELAY_RETRY_BASE_MS", default_value_t = 2_000)]
    pub retry_base_ms: u64,

    /// Upper bound for the retry delay
    #[arg(long, env = "PUSH_RELAY_RETRY_CAP_MS", default_value_t = 3_600_000)]
    pub retry_cap_ms: u64,

    /// Retries before a notification is failed permanently
    #[arg(long, env = "PUSH_RELAY_MAX_RETRIES", default_value_t = 10)]
    pub max_retries: u32,

    /// Fraction of the delay added as random jitter
    #[arg(long, env = "PUSH_RELAY_RETRY_JITTER", default_value_t = 0.2)]
    pub retry_jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { retry_base_ms: 2_000, retry_cap_ms: 3_600_000, max_retries: 10, retry_jitter: 0.2 }
    }
}

#[derive(Clone, Debug, Args)]
pub struct ConnectionConfig {
    /// Minimum delay between reconnect attempts
    #[arg(long, env = "PUSH_RELAY_RECONNECT_MIN_MS", default_value_t = 1_000)]
    pub reconnect_min_ms: u64,

    /// Maximum delay between reconnect attempts
    #[arg(long, env = "PUSH_RELAY_RECONNECT_MAX_MS", default_value_t = 60_000)]
    pub reconnect_max_ms: u64,

    /// Timeout when establishing a backend connection
    #[arg(long, env = "PUSH_RELAY_CONNECT_TIMEOUT_MS", default_value_t = 10_000)]
    pub connect_timeout_ms: u64,

    /// Capacity of the feedback channel
    #[arg(long, env = "PUSH_RELAY_FEEDBACK_CHANNEL_CAPACITY", default_value_t = 1024)]
    pub feedback_channel_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_min_ms: 1_000,
            reconnect_max_ms: 60_000,
            connect_timeout_ms: 10_000,
            feedback_channel_capacity: 1024,
        }
    }
}

#[derive(Clone, Debug, Args)]
pub struct CredentialConfig {
    /// How often app credentials are checked for expiry
    #[arg(long, env = "PUSH_RELAY_CERT_CHECK_INTERVAL_SECS", default_value_t = 3600)]
    pub cert_check_interval_secs: u64,

    /// Warn when a credential expires within this many days
    #[arg(long, env = "PUSH_RELAY_CERT_WARNING_DAYS", default_value_t = 30)]
    pub cert_warning_days: i64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self { cert_check_interval_secs: 3600, cert_warning_days: 30 }
    }
}

#[derive(Clone, Debug, Default, Args)]
pub struct AppsConfig {
    /// Write every app from the manifest to the store before polling starts
    #[arg(long, env = "INITIALIZE_APPS", default_value_t = false)]
    pub initialize_apps: bool,

    /// JSON file listing the apps to initialize
    #[arg(long, env = "PUSH_RELAY_APPS_MANIFEST")]
    pub apps_manifest: Option<PathBuf>,

    /// Apps that must be registered before polling may begin
    #[arg(long, env = "PUSH_RELAY_REQUIRED_APPS", value_delimiter = ',')]
    pub required_apps: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Args)]
pub struct TelemetryConfig {
    /// Default log level, overridden by RUST_LOG
    #[arg(long, env = "PUSH_RELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "PUSH_RELAY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Append logs to this file instead of stdout
    #[arg(long, env = "PUSH_RELAY_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// OTLP collector endpoint for traces, metrics and logs
    #[arg(long, env = "PUSH_RELAY_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string(), log_format: LogFormat::Text, log_file: None, otlp_endpoint: None }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            poller: PollerConfig::default(),
            delivery: DeliveryConfig::default(),
            retry: RetryConfig::default(),
            connection: ConnectionConfig::default(),
            credentials: CredentialConfig::default(),
            apps: AppsConfig::default(),
            telemetry: TelemetryConfig::default(),
            pid_file: None,
        }
    }
}

impl Config {
    #[must_use]
    pub fn load() -> Self {
        Self::parse()
    }

    /// Rejects settings the engine cannot start with.
    ///
    /// # Errors
    /// Returns `Error::Configuration` describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.poller.push_poll == 0 {
            return Err(Error::Configuration("push_poll must be at least 1 second".into()));
        }
        if self.poller.batch_size == 0 {
            return Err(Error::Configuration("batch_size must be greater than 0".into()));
        }
        if self.delivery.paused_defer_secs == 0 {
            return Err(Error::Configuration("paused_defer_secs must be at least 1 second".into()));
        }
        if self.retry.retry_base_ms == 0 {
            return Err(Error::Configuration("retry_base_ms must be greater than 0".into()));
        }
        if self.retry.retry_cap_ms < self.retry.retry_base_ms {
            return Err(Error::Configuration("retry_cap_ms must not be below retry_base_ms".into()));
        }
        if !(0.0..1.0).contains(&self.retry.retry_jitter) {
            return Err(Error::Configuration("retry_jitter must be in [0, 1)".into()));
        }
        if self.connection.reconnect_max_ms < self.connection.reconnect_min_ms {
            return Err(Error::Configuration("reconnect_max_ms must not be below reconnect_min_ms".into()));
        }
        if self.connection.feedback_channel_capacity == 0 {
            return Err(Error::Configuration("feedback_channel_capacity must be greater than 0".into()));
        }
        if self.credentials.cert_check_interval_secs == 0 {
            return Err(Error::Configuration("cert_check_interval_secs must be at least 1 second".into()));
        }
        if self.credentials.cert_warning_days < 0 {
            return Err(Error::Configuration("cert_warning_days must not be negative".into()));
        }
        if self.apps.initialize_apps && self.apps.apps_manifest.is_none() {
            return Err(Error::Configuration("initialize_apps requires apps_manifest".into()));
        }
        Ok(())
    }
}
