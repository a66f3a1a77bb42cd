//! Configuration loading and types for the relabel tool.
//!
//! Configuration is read from an optional YAML file and deserialized into
//! the [`Config`] struct.  Every field has a default, so running without a
//! file is equivalent to an empty document.  Each subsection governs one
//! part of the run: bucket guard policy, the migration itself, local
//! backups, the object store and logging.

use garde::Validate;
use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    /// Bucket guard policy.
    #[serde(default)]
    #[garde(dive)]
    pub guard: GuardConfig,

    /// Migration settings.
    #[serde(default)]
    #[garde(dive)]
    pub migration: MigrationConfig,

    /// Local backup settings.
    #[serde(default)]
    #[garde(dive)]
    pub backup: BackupConfig,

    /// Object store settings.
    #[serde(default)]
    #[garde(dive)]
    pub storage: StorageConfig,

    /// Logging settings.
    #[serde(default)]
    #[garde(dive)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            guard: GuardConfig::default(),
            migration: MigrationConfig::default(),
            backup: BackupConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Which buckets the guard refuses to touch.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct GuardConfig {
    /// Name of the protected backup bucket.  Any bucket equal to or
    /// prefixed by this name is refused.
    #[serde(default = "default_protected_bucket")]
    #[garde(length(min = 1))]
    pub protected_bucket: String,

    /// Environment value that marks a bucket as a backup area.
    #[serde(default = "default_reserved_environment")]
    #[garde(length(min = 1))]
    pub reserved_environment: String,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            protected_bucket: default_protected_bucket(),
            reserved_environment: default_reserved_environment(),
        }
    }
}

/// Migration driver configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct MigrationConfig {
    /// Label key inserted into `thanos.labels`.
    #[serde(default = "default_label_key")]
    #[garde(pattern(r"^[a-zA-Z_][a-zA-Z0-9_]*$"))]
    pub label_key: String,

    /// Object name suffix identifying metadata documents.
    #[serde(default = "default_metadata_suffix")]
    #[garde(length(min = 1))]
    pub metadata_suffix: String,

    /// Number of objects processed at once.
    #[serde(default = "default_concurrency")]
    #[garde(range(min = 1, max = 64))]
    pub concurrency: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            label_key: default_label_key(),
            metadata_suffix: default_metadata_suffix(),
            concurrency: default_concurrency(),
        }
    }
}

/// Local backup configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BackupConfig {
    /// Directory backups are written to.
    #[serde(default = "default_backup_dir")]
    #[garde(length(min = 1))]
    pub dir: String,

    /// Permission bits applied to backup files (unix only).
    #[serde(default = "default_file_mode")]
    #[garde(range(max = 0o777))]
    pub file_mode: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: default_backup_dir(),
            file_mode: default_file_mode(),
        }
    }
}

/// Object store configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct StorageConfig {
    /// Backend type: `gcs` or `local`.
    #[serde(default = "default_storage_backend")]
    #[garde(pattern(r"^(gcs|local)$"))]
    pub backend: String,

    /// Google Cloud Storage settings.
    #[serde(default)]
    #[garde(dive)]
    pub gcs: GcsStorageConfig,

    /// Local directory settings.
    #[serde(default)]
    #[garde(dive)]
    pub local: LocalStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            gcs: GcsStorageConfig::default(),
            local: LocalStorageConfig::default(),
        }
    }
}

/// Google Cloud Storage client configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct GcsStorageConfig {
    /// JSON API endpoint (override for emulators).
    #[serde(default = "default_gcs_endpoint")]
    #[garde(length(min = 1))]
    pub endpoint: String,

    /// Path to a service account or authorized-user JSON file.
    #[serde(default)]
    #[garde(skip)]
    pub credentials_file: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_gcs_timeout")]
    #[garde(range(min = 1))]
    pub timeout_seconds: u64,
}

impl Default for GcsStorageConfig {
    fn default() -> Self {
        Self {
            endpoint: default_gcs_endpoint(),
            credentials_file: None,
            timeout_seconds: default_gcs_timeout(),
        }
    }
}

/// Local directory store configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LocalStorageConfig {
    /// Directory whose subdirectories act as buckets.
    #[serde(default = "default_local_root")]
    #[garde(length(min = 1))]
    pub root_dir: String,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_local_root(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    #[garde(pattern(r"^(trace|debug|info|warn|error)$"))]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    #[garde(pattern(r"^(text|json)$"))]
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

// -- Defaults ----------------------------------------------------------------

fn default_protected_bucket() -> String {
    "bruce-thanos-lts-expiring-backup".to_string()
}

fn default_reserved_environment() -> String {
    "backup".to_string()
}

fn default_label_key() -> String {
    "promenv".to_string()
}

fn default_metadata_suffix() -> String {
    "/meta.json".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_backup_dir() -> String {
    ".".to_string()
}

fn default_file_mode() -> u32 {
    0o644
}

fn default_storage_backend() -> String {
    "gcs".to_string()
}

fn default_gcs_endpoint() -> String {
    "https://storage.googleapis.com".to_string()
}

fn default_gcs_timeout() -> u64 {
    300
}

fn default_local_root() -> String {
    "./data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load, parse and validate configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

/// Parse and validate configuration from a YAML string.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents)?
    };
    config
        .validate()
        .map_err(|report| anyhow::anyhow!("invalid configuration: {report}"))?;
    Ok(config)
}
