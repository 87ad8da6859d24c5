//! Value types flowing through the pipeline: the CloudEvents envelope,
//! the Kafka-side metadata, and the buffered record that pairs them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ArchiverError;

/// Event envelope per CNCF CloudEvents 1.0. Field names follow the
/// CloudEvents JSON format (`specversion`, `datacontenttype`, ...); the
/// four required attributes default to empty strings so that a missing
/// attribute surfaces as a validation fault instead of a parse error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub source: String,
    #[serde(rename = "specversion", default)]
    pub spec_version: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(rename = "datacontenttype", default, skip_serializing_if = "Option::is_none")]
    pub data_content_type: Option<String>,
    #[serde(rename = "dataschema", default, skip_serializing_if = "Option::is_none")]
    pub data_schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extensions: HashMap<String, Value>,
}

impl CloudEvent {
    /// The legacy "0.1" spec version is silently upgraded; everything else
    /// is left for the validator to judge.
    pub fn normalize_spec_version(&mut self) {
        if self.spec_version == "0.1" {
            self.spec_version = "1.0".to_string();
        }
    }

    /// The JSON payload rendered as a string, `"null"` when absent.
    pub fn data_as_json_string(&self) -> String {
        match &self.data {
            Some(v) => v.to_string(),
            None => "null".to_string(),
        }
    }
}

/// Broker-side metadata captured at consumption time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    pub timestamp: DateTime<Utc>,
}

/// Key type for the buffer map: one entry per (topic, partition).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionId {
    pub topic: String,
    pub partition: i32,
}

impl PartitionId {
    pub fn new<T: Into<String>>(topic: T, partition: i32) -> Self {
        PartitionId {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A validated event paired with its Kafka provenance, as held by a
/// partition buffer. Records are append-only: once handed to a buffer
/// they are never mutated, only drained for encoding.
#[derive(Debug, Clone)]
pub struct Record {
    pub event: CloudEvent,
    pub kafka: KafkaMetadata,
    /// Duplicate of `kafka.offset` for convenience at flush time.
    pub offset: i64,
    /// Wall-clock instant the orchestrator accepted the record.
    pub processed_at: DateTime<Utc>,
}

impl Record {
    pub fn new(event: CloudEvent, kafka: KafkaMetadata) -> Self {
        let offset = kafka.offset;
        Record {
            event,
            kafka,
            offset,
            processed_at: Utc::now(),
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        PartitionId::new(self.kafka.topic.clone(), self.kafka.partition)
    }

    /// The event's own timestamp when present, else the broker ingest time.
    pub fn event_time(&self) -> DateTime<Utc> {
        self.event.time.unwrap_or(self.kafka.timestamp)
    }

    pub fn event_time_unix(&self) -> i64 {
        self.event_time().timestamp()
    }

    /// In-memory size estimate used by the buffer's byte cap. Sums the
    /// byte lengths of the event's string fields, the raw data, and the
    /// Kafka topic/key/headers. Monotone and non-trivial; it does not
    /// track the encoded wire size.
    pub fn estimated_size(&self) -> usize {
        let e = &self.event;
        let mut size = e.id.len()
            + e.source.len()
            + e.spec_version.len()
            + e.event_type.len()
            + e.subject.as_ref().map_or(0, String::len)
            + e.data_content_type.as_ref().map_or(0, String::len)
            + e.data_schema.as_ref().map_or(0, String::len);
        if let Some(data) = &e.data {
            size += data.to_string().len();
        }
        size += self.kafka.topic.len();
        size += self.kafka.key.as_ref().map_or(0, Vec::len);
        if let Some(headers) = &self.kafka.headers {
            for (k, v) in headers {
                size += k.len() + v.len();
            }
        }
        size
    }
}

/// Observation of a buffer (or an encoded file) consulted by the
/// rotation policy and reported by encoders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileStats {
    pub record_count: usize,
    pub size_bytes: u64,
    pub first_write_time: Option<DateTime<Utc>>,
    pub last_write_time: Option<DateTime<Utc>>,
}

/// On-disk encoding of a flushed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Parquet,
    Avro,
}

impl FromStr for FileFormat {
    type Err = ArchiverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "parquet" => Ok(FileFormat::Parquet),
            "avro" => Ok(FileFormat::Avro),
            other => Err(ArchiverError::config(format!(
                "unsupported storage format '{other}', expected parquet or avro"
            ))),
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileFormat::Parquet => write!(f, "parquet"),
            FileFormat::Avro => write!(f, "avro"),
        }
    }
}
