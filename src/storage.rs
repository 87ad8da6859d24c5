//! Storage writers: durably place an encoded batch at a destination
//! path. One writer type covers the four backends (local filesystem,
//! S3, Azure Blob, GCS) through `object_store`; each batch is encoded
//! to a scratch file first, then uploaded and atomically published.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::buffered::BufWriter;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, ClientOptions, ObjectStore};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::encoder::{new_encoder, Encoder};
use crate::error::{ArchiverError, Result};
use crate::event::{FileFormat, Record};
use crate::metrics::MetricsCollector;
use crate::router::{PathRouter, Protocol};

/// Multipart part size for blob uploads.
const UPLOAD_PART_SIZE: usize = 10 * 1024 * 1024;
/// Concurrent in-flight parts per upload.
const UPLOAD_CONCURRENCY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    File,
    S3,
    Azure,
    Gcs,
}

impl StorageBackend {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(StorageBackend::File),
            "s3" => Ok(StorageBackend::S3),
            "azure" => Ok(StorageBackend::Azure),
            "gcs" => Ok(StorageBackend::Gcs),
            other => Err(ArchiverError::config(format!(
                "unsupported storage backend '{other}', expected file, s3, azure, or gcs"
            ))),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            StorageBackend::File => Protocol::File,
            StorageBackend::S3 => Protocol::S3,
            StorageBackend::Azure => Protocol::Wasbs,
            StorageBackend::Gcs => Protocol::Gs,
        }
    }
}

/// Builds the router matching a storage configuration: same protocol,
/// bucket, and base path the writer will strip back off.
pub fn build_router(cfg: &StorageConfig) -> Result<PathRouter> {
    let backend = StorageBackend::parse(&cfg.backend)?;
    let router = match backend {
        StorageBackend::File => PathRouter::new(Protocol::File, "", ""),
        StorageBackend::S3 => {
            let s3 = cfg.s3.as_ref().ok_or_else(|| missing_section("s3"))?;
            PathRouter::new(Protocol::S3, s3.bucket.clone(), s3.base_path.clone())
        }
        StorageBackend::Azure => {
            let az = cfg.azure.as_ref().ok_or_else(|| missing_section("azure"))?;
            PathRouter::new(Protocol::Wasbs, az.container.clone(), az.base_path.clone())
        }
        StorageBackend::Gcs => {
            let gcs = cfg.gcs.as_ref().ok_or_else(|| missing_section("gcs"))?;
            PathRouter::new(Protocol::Gs, gcs.bucket.clone(), gcs.base_path.clone())
        }
    };
    Ok(router)
}

fn missing_section(name: &str) -> ArchiverError {
    ArchiverError::config(format!("storage.backend is '{name}' but storage.{name} is missing"))
}

struct WriterState {
    closed: bool,
    last_second: i64,
    sequence: u32,
}

/// Writer for one configured backend. Individual `write` calls are
/// serialized behind a mutex so file-name sequencing stays monotone
/// within the writer instance.
pub struct StorageWriter {
    store: Arc<dyn ObjectStore>,
    backend: StorageBackend,
    format: FileFormat,
    encoder: Arc<dyn Encoder>,
    metrics: Arc<MetricsCollector>,
    state: tokio::sync::Mutex<WriterState>,
}

impl StorageWriter {
    pub fn from_config(cfg: &StorageConfig, metrics: Arc<MetricsCollector>) -> Result<Self> {
        let backend = StorageBackend::parse(&cfg.backend)?;
        let format: FileFormat = cfg.format.parse()?;
        let store = build_object_store(backend, cfg)?;
        let encoder = new_encoder(format, &cfg.compression);
        Ok(StorageWriter {
            store,
            backend,
            format,
            encoder,
            metrics,
            state: tokio::sync::Mutex::new(WriterState {
                closed: false,
                last_second: 0,
                sequence: 0,
            }),
        })
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }

    /// Encodes `records` and durably places the file under
    /// `directory_path` (a router-produced directory, possibly carrying a
    /// `<protocol>://<bucket>/` prefix which is stripped to a relative
    /// key). Returns the encoded size in bytes.
    pub async fn write(
        &self,
        records: &[Record],
        directory_path: &str,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ArchiverError::WriterClosed);
        }
        let started = Instant::now();
        let result = self
            .write_locked(&mut state, records, directory_path, cancel)
            .await;
        match &result {
            Ok(bytes) => {
                self.metrics.files_written.with_label_values(&["success"]).inc();
                self.metrics.file_size_bytes.observe(*bytes as f64);
                self.metrics
                    .write_duration_seconds
                    .observe(started.elapsed().as_secs_f64());
            }
            Err(e) => {
                self.metrics.files_written.with_label_values(&["failure"]).inc();
                if let ArchiverError::Storage { operation, .. } = e {
                    self.metrics
                        .storage_errors
                        .with_label_values(&[operation])
                        .inc();
                }
            }
        }
        result
    }

    async fn write_locked(
        &self,
        state: &mut WriterState,
        records: &[Record],
        directory_path: &str,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let file_name = next_file_name(state, Utc::now(), self.encoder.file_extension());
        let scratch = tempfile::Builder::new()
            .prefix("event-archiver-")
            .tempfile()
            .map_err(|e| ArchiverError::storage("file_open", e.into()))?;

        let encoder = Arc::clone(&self.encoder);
        let stats = tokio::task::block_in_place(|| encoder.encode(scratch.path(), records))
            .map_err(|e| match e {
                ArchiverError::EmptyBatch => e,
                other => ArchiverError::storage("encode", other),
            })?;

        let key = relative_key(directory_path);
        let location = ObjectPath::from(format!("{key}{file_name}"));
        debug!(%location, records = stats.record_count, "uploading encoded batch");

        self.upload(scratch.path(), &location, cancel)
            .await
            .map_err(|e| ArchiverError::storage("upload", e))?;

        info!(
            %location,
            records = stats.record_count,
            bytes = stats.size_bytes,
            "wrote {} file", self.format
        );
        Ok(stats.size_bytes)
    }

    async fn upload(
        &self,
        scratch: &Path,
        location: &ObjectPath,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut writer =
            BufWriter::with_capacity(Arc::clone(&self.store), location.clone(), UPLOAD_PART_SIZE)
                .with_max_concurrency(UPLOAD_CONCURRENCY);
        if self.backend == StorageBackend::Gcs {
            let mut attributes = Attributes::new();
            attributes.insert(Attribute::ContentType, content_type(self.format).into());
            writer = writer.with_attributes(attributes);
        }

        let mut source = tokio::fs::File::open(scratch).await?;
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = writer.abort().await {
                    warn!(error = %e, "failed to abort cancelled upload");
                }
                return Err(ArchiverError::internal("upload cancelled by shutdown"));
            }
            copied = tokio::io::copy(&mut source, &mut writer) => {
                copied?;
            }
        }
        writer.shutdown().await?;
        Ok(())
    }

    /// Idempotent; subsequent writes fault with `WriterClosed`.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
    }
}

fn content_type(format: FileFormat) -> &'static str {
    match format {
        FileFormat::Parquet => "application/octet-stream",
        FileFormat::Avro => "application/avro",
    }
}

/// `events_<YYYYMMDD>_<HHMMSS>_<NNN><ext>`; the sequence resets on each
/// new second to break ties within the writer.
fn next_file_name(state: &mut WriterState, now: DateTime<Utc>, extension: &str) -> String {
    let second = now.timestamp();
    if second != state.last_second {
        state.last_second = second;
        state.sequence = 0;
    }
    let name = format!(
        "events_{}_{:03}{}",
        now.format("%Y%m%d_%H%M%S"),
        state.sequence,
        extension
    );
    state.sequence += 1;
    name
}

/// Strips any `<protocol>://<bucket>/` prefix, producing a relative key
/// ending in `/` (or empty for the bucket root).
fn relative_key(directory_path: &str) -> String {
    let stripped = match directory_path.split_once("://") {
        Some((_scheme, rest)) => rest.split_once('/').map(|(_bucket, p)| p).unwrap_or(""),
        None => directory_path,
    };
    let trimmed = stripped.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

fn build_object_store(backend: StorageBackend, cfg: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    match backend {
        StorageBackend::File => {
            let file = cfg.file.as_ref().ok_or_else(|| missing_section("file"))?;
            std::fs::create_dir_all(&file.base_path)
                .map_err(|e| ArchiverError::storage("mkdir", e.into()))?;
            let store = LocalFileSystem::new_with_prefix(&file.base_path)?;
            Ok(Arc::new(store))
        }
        StorageBackend::S3 => {
            let s3 = cfg.s3.as_ref().ok_or_else(|| missing_section("s3"))?;
            let mut builder = AmazonS3Builder::from_env()
                .with_bucket_name(&s3.bucket)
                .with_region(&s3.region);
            if let Some(access_key_id) = &s3.access_key_id {
                builder = builder.with_access_key_id(access_key_id);
            }
            if let Some(secret_access_key) = &s3.secret_access_key {
                builder = builder.with_secret_access_key(secret_access_key);
            }
            if let Some(endpoint) = &s3.endpoint {
                builder = builder.with_endpoint(endpoint).with_allow_http(true);
            }
            if s3.force_path_style {
                builder = builder.with_virtual_hosted_style_request(false);
            }
            if s3.sse_enabled {
                match &s3.kms_key_id {
                    Some(key_id) => builder = builder.with_sse_kms_encryption(key_id),
                    None => {
                        // object_store models SSE-KMS but not SSE-S3; the
                        // plain AES256 mode rides in as a default header.
                        let mut headers = http::HeaderMap::new();
                        headers.insert(
                            http::HeaderName::from_static("x-amz-server-side-encryption"),
                            http::HeaderValue::from_static("AES256"),
                        );
                        builder = builder.with_client_options(
                            ClientOptions::new().with_default_headers(headers),
                        );
                    }
                }
            }
            Ok(Arc::new(builder.build()?))
        }
        StorageBackend::Azure => {
            let az = cfg.azure.as_ref().ok_or_else(|| missing_section("azure"))?;
            let mut builder = MicrosoftAzureBuilder::from_env()
                .with_account(&az.account_name)
                .with_container_name(&az.container);
            if let Some(account_key) = &az.account_key {
                builder = builder.with_access_key(account_key);
            }
            if let Some(endpoint) = &az.endpoint {
                builder = builder.with_endpoint(endpoint.clone()).with_allow_http(true);
            }
            if az.use_emulator {
                builder = builder.with_use_emulator(true);
            }
            Ok(Arc::new(builder.build()?))
        }
        StorageBackend::Gcs => {
            let gcs = cfg.gcs.as_ref().ok_or_else(|| missing_section("gcs"))?;
            let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(&gcs.bucket);
            if let Some(path) = &gcs.service_account_path {
                builder = builder.with_service_account_path(path);
            }
            Ok(Arc::new(builder.build()?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileStorageConfig, StorageConfig};
    use crate::event::{CloudEvent, KafkaMetadata, PartitionId};
    use serde_json::json;

    fn file_config(base: &Path) -> StorageConfig {
        StorageConfig {
            backend: "file".to_string(),
            format: "parquet".to_string(),
            compression: "snappy".to_string(),
            file: Some(FileStorageConfig {
                base_path: base.to_string_lossy().into_owned(),
            }),
            s3: None,
            azure: None,
            gcs: None,
        }
    }

    fn record(offset: i64) -> Record {
        let event: CloudEvent = serde_json::from_value(json!({
            "id": format!("r-{offset}"),
            "source": "s",
            "specversion": "1.0",
            "type": "t.x",
            "time": "2025-12-18T09:30:00Z",
            "data": {"k": "v"}
        }))
        .unwrap();
        Record::new(
            event,
            KafkaMetadata {
                topic: "evt".to_string(),
                partition: 3,
                offset,
                key: None,
                headers: None,
                timestamp: "2025-12-18T10:00:00Z".parse().unwrap(),
            },
        )
    }

    #[test]
    fn file_names_are_sequenced_within_a_second() {
        let mut state = WriterState {
            closed: false,
            last_second: 0,
            sequence: 0,
        };
        let now: DateTime<Utc> = "2025-12-18T09:30:00Z".parse().unwrap();
        assert_eq!(
            next_file_name(&mut state, now, ".parquet"),
            "events_20251218_093000_000.parquet"
        );
        assert_eq!(
            next_file_name(&mut state, now, ".parquet"),
            "events_20251218_093000_001.parquet"
        );
        let later = now + chrono::Duration::seconds(1);
        assert_eq!(
            next_file_name(&mut state, later, ".parquet"),
            "events_20251218_093001_000.parquet"
        );
    }

    #[test]
    fn relative_key_strips_protocol_and_bucket() {
        assert_eq!(
            relative_key("s3://bucket/base/evt/v10/dt=2025-12-18/pid=3/"),
            "base/evt/v10/dt=2025-12-18/pid=3/"
        );
        assert_eq!(
            relative_key("evt/v10/dt=2025-12-18/pid=3/"),
            "evt/v10/dt=2025-12-18/pid=3/"
        );
        assert_eq!(relative_key("s3://bucket-only"), "");
        assert_eq!(relative_key("no-trailing-slash"), "no-trailing-slash/");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn writes_parquet_file_under_routed_directory() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let cfg = file_config(dir.path());
        let writer = StorageWriter::from_config(&cfg, Arc::clone(&metrics)).unwrap();
        let router = build_router(&cfg).unwrap();

        let records = vec![record(42)];
        let path = router.route(&PartitionId::new("evt", 3), records[0].event_time_unix(), "1.0");
        assert_eq!(path, "evt/v10/dt=2025-12-18/pid=3/");

        let cancel = CancellationToken::new();
        let bytes = writer.write(&records, &path, &cancel).await.unwrap();
        assert!(bytes > 0);

        let published = dir.path().join("evt/v10/dt=2025-12-18/pid=3");
        let entries: Vec<_> = std::fs::read_dir(&published)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries.len(), 1);
        let re = regex::Regex::new(r"^events_\d{8}_\d{6}_\d{3}\.parquet$").unwrap();
        assert!(re.is_match(&entries[0]), "unexpected file name {}", entries[0]);
        assert_eq!(metrics.files_written.with_label_values(&["success"]).get(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_is_idempotent_and_fails_later_writes() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let writer = StorageWriter::from_config(&file_config(dir.path()), metrics).unwrap();
        writer.close().await;
        writer.close().await;
        let cancel = CancellationToken::new();
        let err = writer.write(&[record(1)], "evt/", &cancel).await.unwrap_err();
        assert!(matches!(err, ArchiverError::WriterClosed));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_batch_surfaces_encoder_fault() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let writer = StorageWriter::from_config(&file_config(dir.path()), metrics).unwrap();
        let cancel = CancellationToken::new();
        let err = writer.write(&[], "evt/", &cancel).await.unwrap_err();
        assert!(matches!(err, ArchiverError::EmptyBatch));
    }
}
