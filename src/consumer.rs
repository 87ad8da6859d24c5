//! Kafka consumer adapter: joins the consumer group, parses message
//! payloads into CloudEvents, and delivers them with per-record commit
//! handles through a bounded channel. Rebalance transitions flow through
//! a custom context that signals readiness and times reassignments.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rdkafka::client::{ClientContext, OAuthToken};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::topic_partition_list::TopicPartitionList;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::{ArchiverError, Result};
use crate::event::{CloudEvent, KafkaMetadata};
use crate::health::ReadinessProbe;
use crate::metrics::MetricsCollector;

/// Bounded capacity of the event delivery channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;
/// Bounded capacity of the non-fatal error channel.
pub const ERROR_CHANNEL_CAPACITY: usize = 10;

const DEFAULT_MAX_POLL_INTERVAL_MS: u64 = 300_000;

/// Marks one (topic, partition, offset) as processed inside the live
/// consumer session. Invoked by the orchestrator only after the upload
/// containing the offset has been acknowledged.
#[derive(Clone)]
pub struct CommitHandle(Arc<dyn Fn() -> Result<()> + Send + Sync>);

impl CommitHandle {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        CommitHandle(Arc::new(f))
    }

    /// A handle that records nothing; used by tests and drained batches
    /// whose offsets were already covered.
    pub fn noop() -> Self {
        CommitHandle(Arc::new(|| Ok(())))
    }

    pub fn commit(&self) -> Result<()> {
        (self.0)()
    }
}

impl fmt::Debug for CommitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CommitHandle")
    }
}

/// One consumed, parsed message with its provenance and commit handle.
#[derive(Debug, Clone)]
pub struct ConsumedEvent {
    pub event: CloudEvent,
    pub metadata: KafkaMetadata,
    pub commit: CommitHandle,
}

/// Token source for SASL/OAUTHBEARER (AWS MSK IAM). Deployments inject
/// an implementation that signs requests; the adapter only plumbs the
/// refresh callback through.
pub trait OauthTokenProvider: Send + Sync {
    fn token(&self) -> std::result::Result<OAuthToken, Box<dyn std::error::Error>>;
}

/// Client context carrying readiness and rebalance bookkeeping.
pub struct ArchiverContext {
    probe: Arc<ReadinessProbe>,
    metrics: Arc<MetricsCollector>,
    ready_signalled: AtomicBool,
    revoked_at: Mutex<Option<Instant>>,
    token_provider: Option<Arc<dyn OauthTokenProvider>>,
}

impl ArchiverContext {
    pub fn new(
        probe: Arc<ReadinessProbe>,
        metrics: Arc<MetricsCollector>,
        token_provider: Option<Arc<dyn OauthTokenProvider>>,
    ) -> Self {
        ArchiverContext {
            probe,
            metrics,
            ready_signalled: AtomicBool::new(false),
            revoked_at: Mutex::new(None),
            token_provider,
        }
    }
}

impl ClientContext for ArchiverContext {
    const ENABLE_REFRESH_OAUTH_TOKEN: bool = true;

    fn generate_oauth_token(
        &self,
        _oauthbearer_config: Option<&str>,
    ) -> std::result::Result<OAuthToken, Box<dyn std::error::Error>> {
        match &self.token_provider {
            Some(provider) => provider.token(),
            None => Err("oauth token requested but no token provider is configured".into()),
        }
    }
}

impl ConsumerContext for ArchiverContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(partitions) = rebalance {
            debug!(partitions = partitions.count(), "partitions being revoked");
            *self.revoked_at.lock() = Some(Instant::now());
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                info!(partitions = partitions.count(), "partitions assigned");
                // First assignment signals readiness exactly once.
                if !self.ready_signalled.swap(true, Ordering::SeqCst) {
                    self.probe.set_kafka_ready(true);
                }
                if let Some(revoked) = self.revoked_at.lock().take() {
                    self.metrics
                        .rebalance_duration_seconds
                        .observe(revoked.elapsed().as_secs_f64());
                }
            }
            Rebalance::Revoke(partitions) => {
                info!(partitions = partitions.count(), "partitions revoked");
            }
            Rebalance::Error(e) => {
                error!(error = %e, "rebalance error");
            }
        }
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        _offsets: &TopicPartitionList,
    ) {
        if let Err(e) = result {
            warn!(error = %e, "offset commit failed");
        }
    }
}

/// Parses a message payload as a CloudEvent and applies the legacy
/// spec-version upgrade.
pub fn parse_cloud_event(payload: &[u8]) -> Result<CloudEvent> {
    let mut event: CloudEvent = serde_json::from_slice(payload)?;
    event.normalize_spec_version();
    Ok(event)
}

/// Applies the configured transport security to a Kafka client. Shared
/// by the consumer and the DLQ producer.
pub(crate) fn apply_security(config: &mut ClientConfig, kafka: &KafkaConfig) -> Result<()> {
    let Some(protocol) = &kafka.security_protocol else {
        return Ok(());
    };
    config.set("security.protocol", protocol);
    if !protocol.to_ascii_uppercase().starts_with("SASL") {
        return Ok(());
    }
    let mechanism = kafka
        .sasl_mechanism
        .as_deref()
        .unwrap_or("PLAIN")
        .to_ascii_uppercase();
    match mechanism.as_str() {
        "PLAIN" | "SCRAM-SHA-256" | "SCRAM-SHA-512" => {
            config.set("sasl.mechanism", &mechanism);
            if let Some(username) = &kafka.sasl_username {
                config.set("sasl.username", username);
            }
            if let Some(password) = &kafka.sasl_password {
                config.set("sasl.password", password);
            }
        }
        // MSK IAM rides on OAUTHBEARER with a token-provider callback.
        "AWS_MSK_IAM" | "OAUTHBEARER" => {
            config.set("sasl.mechanism", "OAUTHBEARER");
        }
        other => {
            return Err(ArchiverError::config(format!(
                "unsupported sasl mechanism '{other}'"
            )));
        }
    }
    Ok(())
}

/// Wraps the consumer group: subscription, delivery, and shutdown.
pub struct ConsumerAdapter {
    consumer: Arc<StreamConsumer<ArchiverContext>>,
    closed: Mutex<bool>,
}

impl ConsumerAdapter {
    pub fn new(
        kafka: &KafkaConfig,
        probe: Arc<ReadinessProbe>,
        metrics: Arc<MetricsCollector>,
        token_provider: Option<Arc<dyn OauthTokenProvider>>,
    ) -> Result<Self> {
        let consumer_cfg = &kafka.consumer;
        if consumer_cfg.topics.is_empty() {
            return Err(ArchiverError::config("kafka.consumer.topics must not be empty"));
        }

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &kafka.bootstrap_servers)
            .set("group.id", &consumer_cfg.group_id)
            .set("enable.auto.commit", consumer_cfg.enable_auto_commit.to_string())
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &consumer_cfg.auto_offset_reset)
            .set("session.timeout.ms", consumer_cfg.session_timeout_ms.to_string())
            .set(
                "heartbeat.interval.ms",
                consumer_cfg.heartbeat_interval_ms.to_string(),
            )
            .set(
                "max.poll.interval.ms",
                consumer_cfg
                    .max_poll_interval_ms
                    .unwrap_or(DEFAULT_MAX_POLL_INTERVAL_MS)
                    .to_string(),
            )
            .set("enable.partition.eof", "false");
        if let Some(strategy) = &consumer_cfg.partition_assignment_strategy {
            config.set("partition.assignment.strategy", strategy);
        }
        apply_security(&mut config, kafka)?;

        let context = ArchiverContext::new(probe, metrics, token_provider);
        let consumer: StreamConsumer<ArchiverContext> = config.create_with_context(context)?;

        let topics: Vec<&str> = consumer_cfg.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;
        info!(topics = ?consumer_cfg.topics, group = %consumer_cfg.group_id, "subscribed");

        Ok(ConsumerAdapter {
            consumer: Arc::new(consumer),
            closed: Mutex::new(false),
        })
    }

    /// Spawns the fan-in delivery task: polls the consumer, parses each
    /// message, and pushes `ConsumedEvent`s into the bounded channel.
    /// Non-fatal faults go to the error channel.
    pub fn spawn_delivery(
        &self,
        events: mpsc::Sender<ConsumedEvent>,
        errors: mpsc::Sender<ArchiverError>,
        metrics: Arc<MetricsCollector>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        if self.is_closed() {
            return Err(ArchiverError::ConsumerClosed);
        }
        let consumer = Arc::clone(&self.consumer);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    polled = consumer.recv() => match polled {
                        Ok(message) => {
                            if !deliver(&consumer, &message, &events, &errors, &metrics).await {
                                break;
                            }
                        }
                        Err(e) => {
                            metrics.consumer_errors.inc();
                            if errors.send(e.into()).await.is_err() {
                                break;
                            }
                        }
                    },
                }
            }
            info!("consumer delivery task stopped");
        });
        Ok(handle)
    }

    /// Flushes stored offsets and shuts the group membership down.
    /// Idempotent; a second call is a no-op.
    pub fn close(&self) {
        let mut closed = self.closed.lock();
        if *closed {
            return;
        }
        *closed = true;
        // Stored offsets that the auto-committer has not yet written are
        // committed synchronously so a clean shutdown loses nothing.
        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            match e {
                rdkafka::error::KafkaError::ConsumerCommit(
                    rdkafka::types::RDKafkaErrorCode::NoOffset,
                ) => {}
                other => warn!(error = %other, "final offset commit failed"),
            }
        }
        self.consumer.unsubscribe();
        info!("consumer closed");
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

/// Returns false when the event channel is gone and delivery must stop.
async fn deliver(
    consumer: &Arc<StreamConsumer<ArchiverContext>>,
    message: &BorrowedMessage<'_>,
    events: &mpsc::Sender<ConsumedEvent>,
    errors: &mpsc::Sender<ArchiverError>,
    metrics: &MetricsCollector,
) -> bool {
    metrics.events_consumed.inc();
    let payload = message.payload().unwrap_or_default();
    let event = match parse_cloud_event(payload) {
        Ok(event) => event,
        Err(e) => {
            metrics.parse_failures.inc();
            warn!(
                topic = message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                error = %e,
                "dropping unparseable message"
            );
            // Skip the poison message so the partition keeps moving.
            if let Err(store_err) =
                consumer.store_offset(message.topic(), message.partition(), message.offset())
            {
                warn!(error = %store_err, "failed to store offset for skipped message");
            }
            let _ = errors.try_send(e);
            return true;
        }
    };

    let headers = message.headers().map(|headers| {
        headers
            .iter()
            .map(|h| {
                (
                    h.key.to_string(),
                    String::from_utf8_lossy(h.value.unwrap_or_default()).into_owned(),
                )
            })
            .collect()
    });
    let timestamp = message
        .timestamp()
        .to_millis()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .unwrap_or_else(chrono::Utc::now);
    let metadata = KafkaMetadata {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        headers,
        timestamp,
    };

    let commit = {
        let consumer = Arc::clone(consumer);
        let topic = metadata.topic.clone();
        let (partition, offset) = (metadata.partition, metadata.offset);
        CommitHandle::new(move || {
            consumer
                .store_offset(&topic, partition, offset)
                .map_err(|e| ArchiverError::Commit(e.to_string()))
        })
    };

    events
        .send(ConsumedEvent {
            event,
            metadata,
            commit,
        })
        .await
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsumerConfig;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn commit_handle_invokes_closure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let handle = CommitHandle::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        handle.commit().unwrap();
        handle.clone().commit().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(CommitHandle::noop().commit().is_ok());
    }

    #[test]
    fn parse_normalizes_legacy_spec_version() {
        let event = parse_cloud_event(
            br#"{"id":"1","source":"s","specversion":"0.1","type":"t"}"#,
        )
        .unwrap();
        assert_eq!(event.spec_version, "1.0");
    }

    #[test]
    fn parse_rejects_non_json() {
        assert!(parse_cloud_event(b"not json").is_err());
    }

    fn kafka_config() -> KafkaConfig {
        KafkaConfig {
            bootstrap_servers: "localhost:9092".to_string(),
            security_protocol: Some("SASL_SSL".to_string()),
            sasl_mechanism: Some("SCRAM-SHA-512".to_string()),
            sasl_username: Some("user".to_string()),
            sasl_password: Some("secret".to_string()),
            consumer: ConsumerConfig::default(),
            dlq: Default::default(),
        }
    }

    #[test]
    fn security_settings_are_applied() {
        let mut config = ClientConfig::new();
        apply_security(&mut config, &kafka_config()).unwrap();
        assert_eq!(config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(config.get("sasl.mechanism"), Some("SCRAM-SHA-512"));
        assert_eq!(config.get("sasl.username"), Some("user"));
    }

    #[test]
    fn msk_iam_maps_to_oauthbearer() {
        let mut kafka = kafka_config();
        kafka.sasl_mechanism = Some("AWS_MSK_IAM".to_string());
        let mut config = ClientConfig::new();
        apply_security(&mut config, &kafka).unwrap();
        assert_eq!(config.get("sasl.mechanism"), Some("OAUTHBEARER"));
    }

    #[test]
    fn unknown_mechanism_is_rejected() {
        let mut kafka = kafka_config();
        kafka.sasl_mechanism = Some("GSSAPI-ISH".to_string());
        let mut config = ClientConfig::new();
        assert!(apply_security(&mut config, &kafka).is_err());
    }

    #[test]
    fn plaintext_skips_sasl_settings() {
        let mut kafka = kafka_config();
        kafka.security_protocol = Some("PLAINTEXT".to_string());
        let mut config = ClientConfig::new();
        apply_security(&mut config, &kafka).unwrap();
        assert_eq!(config.get("sasl.mechanism"), None);
    }
}
