//! Batch encoders: one columnar (Parquet), one row-based (Avro OCF).
//! Both serialize a drained batch of records to a local file that the
//! storage writer then uploads.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    ArrayRef, Int32Array, Int64Array, RecordBatch, StringArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use chrono::SecondsFormat;
use flate2::write::GzEncoder;
use once_cell::sync::Lazy;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression as ParquetCompression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::schema::types::ColumnPath;
use tracing::warn;

use crate::error::{ArchiverError, Result};
use crate::event::{FileFormat, FileStats, Record};

const CREATED_BY: &str = concat!("event-archiver ", env!("CARGO_PKG_VERSION"));

/// Serializes a record batch to a file at `target`. Implementations are
/// safe to share across independent batches; a single batch is encoded
/// by a single caller.
pub trait Encoder: Send + Sync {
    /// Writes the batch and returns its statistics. An empty batch is a
    /// fault: there is nothing worth a file.
    fn encode(&self, target: &Path, records: &[Record]) -> Result<FileStats>;

    fn format(&self) -> FileFormat;

    /// On-disk suffix, compression included (".parquet", ".avro.gz", ...).
    fn file_extension(&self) -> &'static str;
}

/// Builds the encoder for the configured format and compression codec.
pub fn new_encoder(format: FileFormat, compression: &str) -> Arc<dyn Encoder> {
    match format {
        FileFormat::Parquet => Arc::new(ParquetEncoder::new(compression)),
        FileFormat::Avro => Arc::new(AvroEncoder::new(compression)),
    }
}

fn batch_stats(records: &[Record], size_bytes: u64) -> FileStats {
    FileStats {
        record_count: records.len(),
        size_bytes,
        first_write_time: records.first().map(|r| r.processed_at),
        last_write_time: records.last().map(|r| r.processed_at),
    }
}

// ---------------------------------------------------------------------------
// Parquet

/// Columns that benefit from dictionary encoding: low-cardinality strings
/// repeated across a batch.
const DICTIONARY_COLUMNS: [&str; 8] = [
    "spec_version",
    "id",
    "source",
    "type",
    "subject",
    "data_content_type",
    "data_schema",
    "kafka_topic",
];

static PARQUET_SCHEMA: Lazy<SchemaRef> = Lazy::new(|| {
    let utc_ts = || DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()));
    Arc::new(Schema::new(vec![
        Field::new("spec_version", DataType::Utf8, false),
        Field::new("id", DataType::Utf8, false),
        Field::new("source", DataType::Utf8, false),
        Field::new("type", DataType::Utf8, false),
        Field::new("subject", DataType::Utf8, true),
        Field::new("data_content_type", DataType::Utf8, true),
        Field::new("data_schema", DataType::Utf8, true),
        Field::new("time", utc_ts(), true),
        Field::new("data", DataType::Utf8, false),
        Field::new("kafka_topic", DataType::Utf8, false),
        Field::new("kafka_partition", DataType::Int32, false),
        Field::new("kafka_offset", DataType::Int64, false),
        Field::new("kafka_timestamp", utc_ts(), false),
        Field::new("ingested_at", utc_ts(), false),
    ]))
});

pub struct ParquetEncoder {
    compression: ParquetCompression,
}

impl ParquetEncoder {
    /// Unknown codec strings fall back to snappy.
    pub fn new(compression: &str) -> Self {
        let compression = match compression.to_ascii_lowercase().as_str() {
            "snappy" => ParquetCompression::SNAPPY,
            "gzip" => ParquetCompression::GZIP(GzipLevel::default()),
            "lz4" => ParquetCompression::LZ4,
            "zstd" => ParquetCompression::ZSTD(ZstdLevel::default()),
            "uncompressed" | "none" => ParquetCompression::UNCOMPRESSED,
            other => {
                warn!(codec = other, "unknown parquet codec, falling back to snappy");
                ParquetCompression::SNAPPY
            }
        };
        ParquetEncoder { compression }
    }

    fn writer_properties(&self) -> WriterProperties {
        let mut builder = WriterProperties::builder()
            .set_compression(self.compression)
            .set_created_by(CREATED_BY.to_string())
            .set_dictionary_enabled(false);
        for column in DICTIONARY_COLUMNS {
            builder = builder.set_column_dictionary_enabled(ColumnPath::from(column), true);
        }
        builder.build()
    }

    fn to_record_batch(&self, records: &[Record]) -> Result<RecordBatch> {
        let micros = |t: chrono::DateTime<chrono::Utc>| t.timestamp_micros();

        let spec_version: ArrayRef = Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.event.spec_version.as_str()),
        ));
        let id: ArrayRef = Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.event.id.as_str()),
        ));
        let source: ArrayRef = Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.event.source.as_str()),
        ));
        let event_type: ArrayRef = Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.event.event_type.as_str()),
        ));
        let subject: ArrayRef = Arc::new(StringArray::from(
            records.iter().map(|r| r.event.subject.as_deref()).collect::<Vec<_>>(),
        ));
        let data_content_type: ArrayRef = Arc::new(StringArray::from(
            records
                .iter()
                .map(|r| r.event.data_content_type.as_deref())
                .collect::<Vec<_>>(),
        ));
        let data_schema: ArrayRef = Arc::new(StringArray::from(
            records.iter().map(|r| r.event.data_schema.as_deref()).collect::<Vec<_>>(),
        ));
        let time: ArrayRef = Arc::new(
            TimestampMicrosecondArray::from(
                records
                    .iter()
                    .map(|r| r.event.time.map(micros))
                    .collect::<Vec<_>>(),
            )
            .with_timezone("UTC"),
        );
        let data: ArrayRef = Arc::new(StringArray::from(
            records.iter().map(|r| r.event.data_as_json_string()).collect::<Vec<_>>(),
        ));
        let kafka_topic: ArrayRef = Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.kafka.topic.as_str()),
        ));
        let kafka_partition: ArrayRef = Arc::new(Int32Array::from_iter_values(
            records.iter().map(|r| r.kafka.partition),
        ));
        let kafka_offset: ArrayRef = Arc::new(Int64Array::from_iter_values(
            records.iter().map(|r| r.kafka.offset),
        ));
        let kafka_timestamp: ArrayRef = Arc::new(
            TimestampMicrosecondArray::from_iter_values(
                records.iter().map(|r| micros(r.kafka.timestamp)),
            )
            .with_timezone("UTC"),
        );
        let ingested_at: ArrayRef = Arc::new(
            TimestampMicrosecondArray::from_iter_values(
                records.iter().map(|r| micros(r.processed_at)),
            )
            .with_timezone("UTC"),
        );

        let batch = RecordBatch::try_new(
            PARQUET_SCHEMA.clone(),
            vec![
                spec_version,
                id,
                source,
                event_type,
                subject,
                data_content_type,
                data_schema,
                time,
                data,
                kafka_topic,
                kafka_partition,
                kafka_offset,
                kafka_timestamp,
                ingested_at,
            ],
        )?;
        Ok(batch)
    }
}

impl Encoder for ParquetEncoder {
    fn encode(&self, target: &Path, records: &[Record]) -> Result<FileStats> {
        if records.is_empty() {
            return Err(ArchiverError::EmptyBatch);
        }
        let batch = self.to_record_batch(records)?;
        let file = File::create(target)?;
        let mut writer =
            ArrowWriter::try_new(file, PARQUET_SCHEMA.clone(), Some(self.writer_properties()))?;
        writer.write(&batch)?;
        writer.close()?;
        let size_bytes = std::fs::metadata(target)?.len();
        Ok(batch_stats(records, size_bytes))
    }

    fn format(&self) -> FileFormat {
        FileFormat::Parquet
    }

    fn file_extension(&self) -> &'static str {
        ".parquet"
    }
}

// ---------------------------------------------------------------------------
// Avro

static AVRO_SCHEMA: Lazy<apache_avro::Schema> = Lazy::new(|| {
    apache_avro::Schema::parse_str(AVRO_SCHEMA_JSON).expect("embedded avro schema is well-formed")
});

const AVRO_SCHEMA_JSON: &str = r#"{
  "type": "record",
  "name": "CloudEventRecord",
  "namespace": "io.eventarchiver",
  "fields": [
    {"name": "spec_version", "type": "string"},
    {"name": "id", "type": "string"},
    {"name": "source", "type": "string"},
    {"name": "type", "type": "string"},
    {"name": "subject", "type": ["null", "string"], "default": null},
    {"name": "data_content_type", "type": ["null", "string"], "default": null},
    {"name": "data_schema", "type": ["null", "string"], "default": null},
    {"name": "time", "type": ["null", "string"], "default": null},
    {"name": "data", "type": "string"},
    {"name": "kafka_topic", "type": "string"},
    {"name": "kafka_partition", "type": "int"},
    {"name": "kafka_offset", "type": "long"},
    {"name": "kafka_timestamp", "type": "string"},
    {"name": "ingested_at", "type": "string"}
  ]
}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AvroCompression {
    Uncompressed,
    Deflate,
    /// OCF stream wrapped in a gzip layer; extension becomes ".avro.gz".
    Gzip,
}

pub struct AvroEncoder {
    compression: AvroCompression,
}

impl AvroEncoder {
    pub fn new(compression: &str) -> Self {
        let compression = match compression.to_ascii_lowercase().as_str() {
            "uncompressed" | "none" => AvroCompression::Uncompressed,
            "deflate" => AvroCompression::Deflate,
            "gzip" => AvroCompression::Gzip,
            other => {
                warn!(codec = other, "unsupported avro codec, falling back to deflate");
                AvroCompression::Deflate
            }
        };
        AvroEncoder { compression }
    }

    fn write_container<W: Write>(&self, target: W, records: &[Record]) -> Result<W> {
        let codec = match self.compression {
            AvroCompression::Deflate => apache_avro::Codec::Deflate,
            _ => apache_avro::Codec::Null,
        };
        let mut writer = apache_avro::Writer::with_codec(&AVRO_SCHEMA, target, codec);
        let rfc3339 = |t: chrono::DateTime<chrono::Utc>| t.to_rfc3339_opts(SecondsFormat::Nanos, true);

        for record in records {
            let mut row = apache_avro::types::Record::new(writer.schema())
                .ok_or_else(|| ArchiverError::encode("avro schema root is not a record"))?;
            let event = &record.event;
            row.put("spec_version", event.spec_version.as_str());
            row.put("id", event.id.as_str());
            row.put("source", event.source.as_str());
            row.put("type", event.event_type.as_str());
            row.put("subject", event.subject.clone());
            row.put("data_content_type", event.data_content_type.clone());
            row.put("data_schema", event.data_schema.clone());
            row.put("time", event.time.map(rfc3339));
            row.put("data", event.data_as_json_string());
            row.put("kafka_topic", record.kafka.topic.as_str());
            row.put("kafka_partition", record.kafka.partition);
            row.put("kafka_offset", record.kafka.offset);
            row.put("kafka_timestamp", rfc3339(record.kafka.timestamp));
            row.put("ingested_at", rfc3339(record.processed_at));
            writer.append(row)?;
        }
        Ok(writer.into_inner()?)
    }
}

impl Encoder for AvroEncoder {
    fn encode(&self, target: &Path, records: &[Record]) -> Result<FileStats> {
        if records.is_empty() {
            return Err(ArchiverError::EmptyBatch);
        }
        let file = File::create(target)?;
        match self.compression {
            AvroCompression::Gzip => {
                let encoder = GzEncoder::new(file, flate2::Compression::default());
                let encoder = self.write_container(encoder, records)?;
                encoder.finish()?;
            }
            _ => {
                let mut file = self.write_container(file, records)?;
                file.flush()?;
            }
        }
        let size_bytes = std::fs::metadata(target)?.len();
        Ok(batch_stats(records, size_bytes))
    }

    fn format(&self) -> FileFormat {
        FileFormat::Avro
    }

    fn file_extension(&self) -> &'static str {
        match self.compression {
            AvroCompression::Gzip => ".avro.gz",
            _ => ".avro",
        }
    }
}
