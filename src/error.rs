use thiserror::Error;

pub type Result<T> = std::result::Result<T, ArchiverError>;

#[derive(Error, Debug)]
pub enum ArchiverError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid cloudevent: {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("buffer full for {partition}: {reason}")]
    BufferFull { partition: String, reason: String },

    #[error("empty record batch")]
    EmptyBatch,

    #[error("encoding error: {0}")]
    Encode(String),

    #[error("storage error during {operation}: {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: Box<ArchiverError>,
    },

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("consumer closed")]
    ConsumerClosed,

    #[error("writer closed")]
    WriterClosed,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("avro error: {0}")]
    Avro(#[from] apache_avro::Error),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ArchiverError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        ArchiverError::Config(msg.into())
    }

    pub fn validation<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        ArchiverError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn encode<S: Into<String>>(msg: S) -> Self {
        ArchiverError::Encode(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        ArchiverError::Internal(msg.into())
    }

    /// Wraps an error with the storage operation that produced it, so the
    /// failure counter can be tagged and the cause chain preserved.
    pub fn storage(operation: &'static str, source: ArchiverError) -> Self {
        ArchiverError::Storage {
            operation,
            source: Box::new(source),
        }
    }

    /// Whether the caller may retry the failed operation. Transient
    /// transport and I/O faults qualify; validation, encoding, and the
    /// closed sentinels never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            ArchiverError::ConnectionLost(_) => true,
            ArchiverError::Io(_) => true,
            ArchiverError::ObjectStore(e) => !matches!(
                e,
                object_store::Error::NotFound { .. } | object_store::Error::InvalidPath { .. }
            ),
            ArchiverError::Storage { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}
