//! Dead-letter publisher: ships unprocessable events to a sibling topic
//! so the main pipeline can move on without losing them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::KafkaConfig;
use crate::consumer::apply_security;
use crate::error::{ArchiverError, Result};
use crate::event::{CloudEvent, KafkaMetadata};
use crate::metrics::MetricsCollector;

const PRODUCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reason tag for events rejected by CloudEvents validation.
pub const REASON_VALIDATION_FAILED: &str = "validation_failed";
/// Reason tag for batches that exhausted storage retries.
pub const REASON_STORAGE_FAILED: &str = "storage_failed";

/// Wire envelope published to the dead-letter topic.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    pub original_event: CloudEvent,
    pub original_topic: String,
    pub original_partition: i32,
    pub original_offset: i64,
    pub failure_reason: String,
    pub failure_timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub processor_id: String,
}

/// Synchronous producer to `<original_topic><suffix>`. Idempotent with
/// `acks=all`, one in-flight request, and bounded retries, so a
/// re-published envelope cannot reorder or duplicate within the topic.
/// When disabled by configuration, publishing is a successful no-op.
pub struct DlqPublisher {
    producer: Option<FutureProducer>,
    topic_suffix: String,
    processor_id: String,
    metrics: Arc<MetricsCollector>,
}

impl DlqPublisher {
    pub fn new(
        kafka: &KafkaConfig,
        processor_id: String,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        let producer = if kafka.dlq.enabled {
            let mut config = ClientConfig::new();
            config
                .set("bootstrap.servers", &kafka.bootstrap_servers)
                .set("enable.idempotence", "true")
                .set("acks", "all")
                .set("compression.type", "snappy")
                .set("max.in.flight.requests.per.connection", "1")
                .set("retries", kafka.dlq.max_retries.to_string())
                .set("message.timeout.ms", "30000");
            apply_security(&mut config, kafka)?;
            let producer: FutureProducer = config.create()?;
            info!(suffix = %kafka.dlq.topic_suffix, "dead-letter publisher enabled");
            Some(producer)
        } else {
            info!("dead-letter publisher disabled by configuration");
            None
        };
        Ok(DlqPublisher {
            producer,
            topic_suffix: kafka.dlq.topic_suffix.clone(),
            processor_id,
            metrics,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.producer.is_some()
    }

    /// Publishes one event to the dead-letter topic derived from its
    /// original topic. The message key is the CloudEvent id.
    pub async fn publish(
        &self,
        event: &CloudEvent,
        kafka: &KafkaMetadata,
        failure_reason: &str,
        retry_count: u32,
    ) -> Result<()> {
        let Some(producer) = &self.producer else {
            debug!(reason = failure_reason, "dlq disabled, dropping envelope");
            return Ok(());
        };

        let topic = format!("{}{}", kafka.topic, self.topic_suffix);
        let envelope = DeadLetterEnvelope {
            original_event: event.clone(),
            original_topic: kafka.topic.clone(),
            original_partition: kafka.partition,
            original_offset: kafka.offset,
            failure_reason: failure_reason.to_string(),
            failure_timestamp: Utc::now(),
            retry_count,
            processor_id: self.processor_id.clone(),
        };
        let payload = serde_json::to_vec(&envelope)?;
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "failure_reason",
                value: Some(failure_reason),
            })
            .insert(Header {
                key: "original_topic",
                value: Some(kafka.topic.as_str()),
            })
            .insert(Header {
                key: "processor_id",
                value: Some(self.processor_id.as_str()),
            });

        let record = FutureRecord::to(&topic)
            .payload(&payload)
            .key(&event.id)
            .headers(headers);

        match producer.send(record, PRODUCE_TIMEOUT).await {
            Ok((partition, offset)) => {
                self.metrics
                    .dlq_published
                    .with_label_values(&[failure_reason])
                    .inc();
                info!(
                    %topic,
                    partition,
                    offset,
                    reason = failure_reason,
                    original_offset = kafka.offset,
                    "published to dead-letter topic"
                );
                Ok(())
            }
            Err((e, _)) => {
                self.metrics.dlq_failures.inc();
                error!(%topic, error = %e, "dead-letter publish failed");
                Err(ArchiverError::Kafka(e))
            }
        }
    }
}
