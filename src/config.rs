use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the ingestion service
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Storage backend configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Derivative generation configuration
    #[serde(default)]
    pub derivative: DerivativeConfig,
    /// Ingestion policy configuration
    #[serde(default)]
    pub ingest: IngestConfig,
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

/// API configuration for the upload and gallery endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum number of files per upload request
    #[serde(default = "default_max_upload_files")]
    pub max_upload_files: usize,
    /// Maximum size of a single uploaded file in bytes (15MB default)
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: usize,
}

/// Which storage backend persists artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local filesystem tree under an uploads root
    Local,
    /// S3-compatible object store
    S3,
}

/// Storage backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Active backend, selected once at startup
    #[serde(default = "default_backend_kind")]
    pub backend: BackendKind,
    /// Local-disk backend settings
    #[serde(default)]
    pub local: LocalStorageConfig,
    /// Object-store backend settings, required when backend = "s3"
    pub s3: Option<S3Config>,
}

/// Local-disk backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// Root directory for uploaded artifacts
    #[serde(default = "default_uploads_root")]
    pub uploads_root: String,
    /// Public URL prefix under which thumb/preview artifacts are served
    #[serde(default = "default_public_prefix")]
    pub public_prefix: String,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for artifact storage
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Base URL for public object locators; defaults to the
    /// virtual-hosted bucket URL when unset
    pub public_base_url: Option<String>,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; the in-memory record store is used when unset
    pub url: Option<String>,
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
}

/// Derivative generation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DerivativeConfig {
    /// Path to the watermark PNG, loaded once at startup
    #[serde(default = "default_watermark_path")]
    pub watermark_path: String,
    /// Target length of the thumbnail's longer edge in pixels
    #[serde(default = "default_thumb_max_edge")]
    pub thumb_max_edge: u32,
    /// JPEG quality for thumbnails
    #[serde(default = "default_thumb_quality")]
    pub thumb_quality: u8,
    /// Target width of the protected preview in pixels
    #[serde(default = "default_preview_width")]
    pub preview_width: u32,
    /// JPEG quality for the protected preview
    #[serde(default = "default_preview_quality")]
    pub preview_quality: u8,
    /// Target width of the un-watermarked fallback preview
    #[serde(default = "default_fallback_width")]
    pub fallback_width: u32,
    /// JPEG quality for the fallback preview
    #[serde(default = "default_fallback_quality")]
    pub fallback_quality: u8,
    /// Watermark opacity applied before compositing
    #[serde(default = "default_watermark_opacity")]
    pub watermark_opacity: f32,
    /// Fraction of each preview dimension the watermark may occupy
    #[serde(default = "default_watermark_coverage")]
    pub watermark_coverage: f32,
}

/// Ingestion policy configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Reject uploads that carry no session date instead of defaulting
    /// to the current moment
    #[serde(default)]
    pub require_session_date: bool,
    /// How many files of one batch are processed concurrently
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
}

// Default value functions
fn default_service_name() -> String {
    "revelo-ingest".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_upload_files() -> usize {
    50
}

fn default_max_file_size() -> usize {
    15 * 1024 * 1024 // 15MB
}

fn default_backend_kind() -> BackendKind {
    BackendKind::Local
}

fn default_uploads_root() -> String {
    "./uploads".to_string()
}

fn default_public_prefix() -> String {
    "/uploads".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_watermark_path() -> String {
    "assets/watermark.png".to_string()
}

fn default_thumb_max_edge() -> u32 {
    500
}

fn default_thumb_quality() -> u8 {
    80
}

fn default_preview_width() -> u32 {
    800
}

fn default_preview_quality() -> u8 {
    25
}

fn default_fallback_width() -> u32 {
    600
}

fn default_fallback_quality() -> u8 {
    20
}

fn default_upload_concurrency() -> usize {
    4
}

fn default_watermark_opacity() -> f32 {
    0.45
}

fn default_watermark_coverage() -> f32 {
    0.99
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "revelo-ingest")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/ingest").required(false))
            .add_source(config::File::with_name("/etc/revelo/ingest").required(false))
            // Override with environment variables
            // REVELO__STORAGE__BACKEND -> storage.backend
            .add_source(
                config::Environment::with_prefix("REVELO")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get database connection timeout as Duration
    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn db_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.database.idle_timeout_secs)
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

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            max_upload_files: default_max_upload_files(),
            max_file_size_bytes: default_max_file_size(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend_kind(),
            local: LocalStorageConfig::default(),
            s3: None,
        }
    }
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            uploads_root: default_uploads_root(),
            public_prefix: default_public_prefix(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: default_run_migrations(),
        }
    }
}

impl Default for DerivativeConfig {
    fn default() -> Self {
        Self {
            watermark_path: default_watermark_path(),
            thumb_max_edge: default_thumb_max_edge(),
            thumb_quality: default_thumb_quality(),
            preview_width: default_preview_width(),
            preview_quality: default_preview_quality(),
            fallback_width: default_fallback_width(),
            fallback_quality: default_fallback_quality(),
            watermark_opacity: default_watermark_opacity(),
            watermark_coverage: default_watermark_coverage(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            require_session_date: false,
            upload_concurrency: default_upload_concurrency(),
        }
    }
}
