use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the media service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Metadata store configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Object store configuration
    #[serde(default)]
    pub assets: AssetStoreConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log format (json or pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Metadata store (PostgreSQL) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default)]
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
    /// Connection attempts when the handshake fails transiently
    #[serde(default = "default_handshake_attempts")]
    pub handshake_attempts: u32,
    /// Fixed delay between handshake attempts in milliseconds
    #[serde(default = "default_handshake_retry_delay_ms")]
    pub handshake_retry_delay_ms: u64,
    /// Invocations per metadata operation when the topology is lost
    #[serde(default = "default_operation_max_attempts")]
    pub operation_max_attempts: u32,
    /// First backoff delay after topology loss in milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Backoff ceiling in milliseconds
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

/// Object store (S3) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AssetStoreConfig {
    /// S3 bucket name for product images
    #[serde(default)]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Public base URL images are served from (CDN or bucket website)
    #[serde(default)]
    pub public_base_url: String,
    /// Base URL of the image transformation proxy, if any
    pub transform_base_url: Option<String>,
    /// Path prefix under which each product gets its namespace
    #[serde(default = "default_namespace_prefix")]
    pub namespace_prefix: String,
    /// Concurrent deletes during namespace teardown
    #[serde(default = "default_delete_concurrency")]
    pub delete_concurrency: usize,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "catalog-media".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_run_migrations() -> bool {
    true
}

fn default_handshake_attempts() -> u32 {
    3
}

fn default_handshake_retry_delay_ms() -> u64 {
    2000
}

fn default_operation_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    8000
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_namespace_prefix() -> String {
    "products".to_string()
}

fn default_delete_concurrency() -> usize {
    8
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "catalog-media")?
            .set_default("service.log_level", "info")?
            // Add config file if present
            .add_source(config::File::with_name("config/media").required(false))
            .add_source(config::File::with_name("/etc/catalog/media").required(false))
            // Override with environment variables
            // MEDIA__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("MEDIA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigValidationError::MissingField("database.url".to_string()));
        }

        if self.database.handshake_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "database.handshake_attempts".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }

        if self.database.operation_max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "database.operation_max_attempts".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }

        if self.database.retry_max_delay_ms < self.database.retry_base_delay_ms {
            return Err(ConfigValidationError::InvalidValue {
                field: "database.retry_max_delay_ms".to_string(),
                message: "Must not be smaller than retry_base_delay_ms".to_string(),
            });
        }

        let prefix = &self.assets.namespace_prefix;
        if prefix.is_empty() || prefix.starts_with('/') || prefix.ends_with('/') {
            return Err(ConfigValidationError::InvalidValue {
                field: "assets.namespace_prefix".to_string(),
                message: "Must be non-empty without leading or trailing '/'".to_string(),
            });
        }

        if self.assets.part_size_bytes < 5 * 1024 * 1024 {
            return Err(ConfigValidationError::InvalidValue {
                field: "assets.part_size_bytes".to_string(),
                message: "S3 requires parts of at least 5MB".to_string(),
            });
        }

        if self.assets.delete_concurrency == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "assets.delete_concurrency".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl DatabaseConfig {
    /// Get database connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn handshake_retry_delay(&self) -> Duration {
        Duration::from_millis(self.handshake_retry_delay_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: default_run_migrations(),
            handshake_attempts: default_handshake_attempts(),
            handshake_retry_delay_ms: default_handshake_retry_delay_ms(),
            operation_max_attempts: default_operation_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl Default for AssetStoreConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            public_base_url: String::new(),
            transform_base_url: None,
            namespace_prefix: default_namespace_prefix(),
            delete_concurrency: default_delete_concurrency(),
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
