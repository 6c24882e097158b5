use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the upload queue service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Staging and drain scheduling
    #[serde(default)]
    pub queue: QueueConfig,
    /// Session store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Remote presign/complete endpoints
    pub remote: RemoteConfig,
    /// Local status API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Queue staging and drain scheduling
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Root directory for per-session staging directories
    #[serde(default = "default_queue_root")]
    pub root: PathBuf,
    /// Seconds between periodic drain passes
    #[serde(default = "default_drain_interval_secs")]
    pub drain_interval_secs: u64,
    /// Drain once immediately at startup
    #[serde(default = "default_true")]
    pub drain_on_startup: bool,
}

/// SQLite session store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path of the SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Remote protocol endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the upload API
    pub base_url: String,
    /// Path of the batch presign endpoint
    #[serde(default = "default_presign_path")]
    pub presign_path: String,
    /// Path of the session finalize endpoint
    #[serde(default = "default_complete_path")]
    pub complete_path: String,
    /// API key or bearer token
    pub api_key: Option<String>,
    /// "bearer" or "x-api-key"
    #[serde(default = "default_auth_scheme")]
    pub auth_scheme: String,
    /// Timeout for presign/complete calls in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Timeout for a single asset transfer in seconds
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
}

/// API configuration for the status/trigger endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Serve the status API
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "upload-queue".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_queue_root() -> PathBuf {
    PathBuf::from("upload-queue")
}

fn default_drain_interval_secs() -> u64 {
    60
}

fn default_database_path() -> PathBuf {
    PathBuf::from("upload-queue/queue.db")
}

fn default_max_connections() -> u32 {
    4
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_presign_path() -> String {
    "/v1/uploads/presign".to_string()
}

fn default_complete_path() -> String {
    "/v1/sessions/complete".to_string()
}

fn default_auth_scheme() -> String {
    "bearer".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_upload_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "upload-queue")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/upload-queue").required(false))
            .add_source(config::File::with_name("/etc/fotox/upload-queue").required(false))
            // Override with environment variables
            // UPLOAD_QUEUE__REMOTE__BASE_URL -> remote.base_url
            .add_source(
                config::Environment::with_prefix("UPLOAD_QUEUE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get the periodic drain interval as Duration
    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.queue.drain_interval_secs.max(1))
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            root: default_queue_root(),
            drain_interval_secs: default_drain_interval_secs(),
            drain_on_startup: true,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            run_migrations: true,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: false,
            cors_origins: Vec::new(),
        }
    }
}
