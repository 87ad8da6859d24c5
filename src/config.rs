//! YAML configuration. Values containing `${VAR}` are expanded from the
//! environment before parsing; every section carries defaults so a
//! minimal file (or none at all) still yields a runnable local setup.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ArchiverError, Result};
use crate::event::FileFormat;
use crate::storage::StorageBackend;

pub const DEFAULT_CONFIG_PATH: &str = "config/application.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub application: ApplicationConfig,
    pub kafka: KafkaConfig,
    pub storage: StorageConfig,
    pub file_rotation: FileRotationConfig,
    pub processing: ProcessingConfig,
    pub observability: ObservabilityConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    pub version: String,
    pub environment: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        ApplicationConfig {
            name: "event-archiver".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub security_protocol: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub consumer: ConsumerConfig,
    pub dlq: DlqConfig,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        KafkaConfig {
            bootstrap_servers: "localhost:9092".to_string(),
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            consumer: ConsumerConfig::default(),
            dlq: DlqConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub group_id: String,
    pub topics: Vec<String>,
    pub auto_offset_reset: String,
    pub enable_auto_commit: bool,
    pub max_poll_records: u32,
    pub max_poll_interval_ms: Option<u64>,
    pub session_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub partition_assignment_strategy: Option<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            group_id: "event-archiver".to_string(),
            topics: vec!["events".to_string()],
            auto_offset_reset: "earliest".to_string(),
            // Commit handles store offsets; the auto-committer persists
            // what has been stored, never ahead of it.
            enable_auto_commit: true,
            max_poll_records: 500,
            max_poll_interval_ms: None,
            session_timeout_ms: 30_000,
            heartbeat_interval_ms: 3_000,
            partition_assignment_strategy: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub enabled: bool,
    pub topic_suffix: String,
    pub max_retries: u32,
}

impl Default for DlqConfig {
    fn default() -> Self {
        DlqConfig {
            enabled: true,
            topic_suffix: "-dlq".to_string(),
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: String,
    pub format: String,
    pub compression: String,
    pub file: Option<FileStorageConfig>,
    pub s3: Option<S3StorageConfig>,
    pub azure: Option<AzureStorageConfig>,
    pub gcs: Option<GcsStorageConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: "file".to_string(),
            format: "parquet".to_string(),
            compression: "snappy".to_string(),
            file: Some(FileStorageConfig::default()),
            s3: None,
            azure: None,
            gcs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStorageConfig {
    pub base_path: String,
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        FileStorageConfig {
            base_path: "./data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3StorageConfig {
    pub bucket: String,
    pub region: String,
    pub base_path: String,
    pub endpoint: Option<String>,
    pub force_path_style: bool,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub sse_enabled: bool,
    pub kms_key_id: Option<String>,
}

impl Default for S3StorageConfig {
    fn default() -> Self {
        S3StorageConfig {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            base_path: String::new(),
            endpoint: None,
            force_path_style: false,
            access_key_id: None,
            secret_access_key: None,
            sse_enabled: false,
            kms_key_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AzureStorageConfig {
    pub account_name: String,
    pub account_key: Option<String>,
    pub container: String,
    pub base_path: String,
    pub endpoint: Option<String>,
    pub use_emulator: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GcsStorageConfig {
    pub bucket: String,
    pub base_path: String,
    pub service_account_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileRotationConfig {
    pub max_file_size_mb: u64,
    pub max_records_per_file: usize,
    pub max_duration_seconds: u64,
    pub strategy: String,
}

impl Default for FileRotationConfig {
    fn default() -> Self {
        FileRotationConfig {
            max_file_size_mb: 128,
            max_records_per_file: 100_000,
            max_duration_seconds: 300,
            strategy: "composite".to_string(),
        }
    }
}

impl FileRotationConfig {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub buffer_size_mb: u64,
    pub buffer_flush_interval_seconds: u64,
    pub worker_pool_size: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        ProcessingConfig {
            buffer_size_mb: 256,
            buffer_flush_interval_seconds: 30,
            worker_pool_size: 4,
        }
    }
}

impl ProcessingConfig {
    pub fn buffer_size_bytes(&self) -> u64 {
        self.buffer_size_mb * 1024 * 1024
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: "text".to_string(),
            output: "stdout".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            enabled: true,
            port: 9090,
            path: "/metrics".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub port: u16,
    pub liveness_path: String,
    pub readiness_path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            port: 8080,
            liveness_path: "/health/live".to_string(),
            readiness_path: "/health/ready".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub grace_period_seconds: u64,
    pub force_timeout_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        ShutdownConfig {
            grace_period_seconds: 30,
            force_timeout_seconds: 10,
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ArchiverError::config(format!(
                "failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env(content);
        let config: AppConfig = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let backend = StorageBackend::parse(&self.storage.backend)?;
        let _: FileFormat = self.storage.format.parse()?;
        let section_present = match backend {
            StorageBackend::File => self.storage.file.is_some(),
            StorageBackend::S3 => self.storage.s3.is_some(),
            StorageBackend::Azure => self.storage.azure.is_some(),
            StorageBackend::Gcs => self.storage.gcs.is_some(),
        };
        if !section_present {
            return Err(ArchiverError::config(format!(
                "storage.backend is '{}' but the storage.{} section is missing",
                self.storage.backend, self.storage.backend
            )));
        }
        if self.kafka.consumer.topics.is_empty() {
            return Err(ArchiverError::config("kafka.consumer.topics must not be empty"));
        }
        match self.kafka.consumer.auto_offset_reset.as_str() {
            "earliest" | "latest" => {}
            other => {
                return Err(ArchiverError::config(format!(
                    "kafka.consumer.auto_offset_reset must be earliest or latest, got '{other}'"
                )));
            }
        }
        Ok(())
    }

    /// Stable identifier stamped on DLQ envelopes.
    pub fn processor_id(&self) -> String {
        format!("{}-{}", self.application.name, self.application.environment)
    }
}

/// Replaces every `${VAR}` occurrence with the environment value, or the
/// empty string when the variable is unset.
fn expand_env(content: &str) -> String {
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env pattern");
    pattern
        .replace_all(content, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
