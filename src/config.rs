//! # Operator Configuration
//!
//! Process-wide settings, read once from environment variables at startup.

use std::collections::BTreeMap;
use std::time::Duration;

/// Operator configuration
///
/// All settings have defaults and can be overridden via environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Only objects carrying this label are reconciled
    pub filter: LabelFilter,
    /// Working directory of generated containers
    pub working_dir: String,
    /// Image running the archive and dump commands
    pub backup_image: String,
    /// Image running the restore commands
    pub restore_image: String,
    /// Requests and limits for generated containers
    pub resources: ResourceConfig,
    /// Object storage target
    pub storage: StorageConfig,
    /// How long to wait before retrying a failed reconciliation (seconds)
    pub error_requeue_secs: u64,
    /// Default log directive when `RUST_LOG` is unset
    pub log_level: String,
    /// Log format (json, text)
    pub log_format: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter {
    pub key: Option<String>,
    pub value: String,
}

impl LabelFilter {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self.key.as_deref() {
            None => true,
            Some(key) => labels.get(key) == Some(&self.value),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceConfig {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible storage
    pub endpoint: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Secret field holding the access key id
    pub field_key_id: String,
    /// Secret field holding the secret access key
    pub field_access_key: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            filter: LabelFilter::default(),
            working_dir: "/tmp".to_string(),
            backup_image: DEFAULT_IMAGE.to_string(),
            restore_image: DEFAULT_IMAGE.to_string(),
            resources: ResourceConfig {
                cpu_request: "100m".to_string(),
                cpu_limit: "1".to_string(),
                memory_request: "256Mi".to_string(),
                memory_limit: "1Gi".to_string(),
            },
            storage: StorageConfig {
                bucket: String::new(),
                region: "ap-southeast-2".to_string(),
                endpoint: None,
                access_key_id: String::new(),
                secret_access_key: String::new(),
                field_key_id: "aws.key.id".to_string(),
                field_access_key: "aws.access.key".to_string(),
            },
            error_requeue_secs: 3,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

const DEFAULT_IMAGE: &str = "docker.io/backup-operator/tools:latest";

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let non_empty = |key: &str| lookup(key).filter(|value| !value.is_empty());

        Self {
            filter: LabelFilter {
                key: non_empty("FILTER_LABEL_KEY"),
                value: var("FILTER_LABEL_VALUE", ""),
            },
            working_dir: var("WORKING_DIR", &defaults.working_dir),
            backup_image: var("BACKUP_IMAGE", &defaults.backup_image),
            restore_image: var("RESTORE_IMAGE", &defaults.restore_image),
            resources: ResourceConfig {
                cpu_request: var("RESOURCE_CPU_REQUEST", &defaults.resources.cpu_request),
                cpu_limit: var("RESOURCE_CPU_LIMIT", &defaults.resources.cpu_limit),
                memory_request: var("RESOURCE_MEMORY_REQUEST", &defaults.resources.memory_request),
                memory_limit: var("RESOURCE_MEMORY_LIMIT", &defaults.resources.memory_limit),
            },
            storage: StorageConfig {
                bucket: var("AWS_BUCKET", &defaults.storage.bucket),
                region: var("AWS_REGION", &defaults.storage.region),
                endpoint: non_empty("AWS_ENDPOINT"),
                access_key_id: var("AWS_ACCESS_KEY_ID", ""),
                secret_access_key: var("AWS_SECRET_ACCESS_KEY", ""),
                field_key_id: var("AWS_FIELD_KEY_ID", &defaults.storage.field_key_id),
                field_access_key: var("AWS_FIELD_ACCESS_KEY", &defaults.storage.field_access_key),
            },
            error_requeue_secs: lookup("ERROR_REQUEUE_SECS")
                .and_then(|value| value.parse().ok())
                .unwrap_or(defaults.error_requeue_secs),
            log_level: var("LOG_LEVEL", &defaults.log_level),
            log_format: var("LOG_FORMAT", &defaults.log_format),
        }
    }

    /// Get reconciliation error requeue duration
    pub fn error_requeue_duration(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }
}
