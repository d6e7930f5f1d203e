//! Configuration for Dripline

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// API server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Quota ledger configuration
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Delivery worker configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Outbound SMTP configuration
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// API port
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// CORS allowed origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "postgres" or "memory"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

/// Quota ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Offset from UTC, in minutes, of the day boundary at which
    /// daily counters reset. The default of 330 keeps the historical
    /// midnight-IST reset; tenants with other reset policies override
    /// this per deployment.
    #[serde(default = "default_reset_utc_offset_minutes")]
    pub reset_utc_offset_minutes: i32,

    /// Maximum number of days auto-spread may push a schedule into
    /// the future. Overflow beyond the horizon is reported as
    /// restricted rather than scheduled.
    #[serde(default = "default_spread_horizon_days")]
    pub spread_horizon_days: u32,

    /// Days a stale quota counter is kept before cleanup
    #[serde(default = "default_counter_retention_days")]
    pub counter_retention_days: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            reset_utc_offset_minutes: default_reset_utc_offset_minutes(),
            spread_horizon_days: default_spread_horizon_days(),
            counter_retention_days: default_counter_retention_days(),
        }
    }
}

fn default_reset_utc_offset_minutes() -> i32 {
    330
}

fn default_spread_horizon_days() -> u32 {
    30
}

fn default_counter_retention_days() -> u32 {
    7
}

/// Delivery worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum concurrent sends
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    /// Batch size for claiming due jobs
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// Interval between processing cycles (seconds)
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// A send attempt older than this without an outcome is treated
    /// as failed and its speculative quota released
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            batch_size: default_batch_size(),
            poll_interval_secs: default_poll_interval_secs(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

fn default_concurrency_limit() -> usize {
    10
}

fn default_batch_size() -> i64 {
    100
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_send_timeout_secs() -> u64 {
    120
}

/// Outbound SMTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,

    #[serde(default = "default_smtp_port")]
    pub port: u16,

    pub username: Option<String>,
    pub password: Option<String>,

    /// Envelope sender for outbound mail
    #[serde(default = "default_from_address")]
    pub from_address: String,

    #[serde(default)]
    pub use_tls: bool,

    #[serde(default = "default_use_starttls")]
    pub use_starttls: bool,

    /// Per-send network timeout in seconds
    #[serde(default = "default_smtp_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: None,
            password: None,
            from_address: default_from_address(),
            use_tls: false,
            use_starttls: default_use_starttls(),
            timeout_secs: default_smtp_timeout_secs(),
        }
    }
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

fn default_from_address() -> String {
    "no-reply@localhost".to_string()
}

fn default_use_starttls() -> bool {
    true
}

fn default_smtp_timeout_secs() -> u64 {
    30
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            std::path::PathBuf::from("./dripline.toml"),
            std::path::PathBuf::from("./config.toml"),
            std::path::PathBuf::from("/etc/dripline/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Ok(Config::default())
    }
}
