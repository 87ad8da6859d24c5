//! Pipeline orchestrator: one task multiplexing shutdown, consumer
//! errors, consumed events, and the periodic sweeper. Owns the
//! validate -> buffer -> rotate -> flush sequence and the
//! commit-after-upload discipline that gives at-least-once delivery.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferManager, PartitionBuffer};
use crate::consumer::ConsumedEvent;
use crate::dlq::{DlqPublisher, REASON_STORAGE_FAILED, REASON_VALIDATION_FAILED};
use crate::error::ArchiverError;
use crate::event::Record;
use crate::metrics::MetricsCollector;
use crate::router::PathRouter;
use crate::rotation::RotationPolicy;
use crate::storage::StorageWriter;
use crate::validator;

/// Transient storage failures are retried this many times before the
/// batch is dead-lettered.
const STORAGE_RETRY_LIMIT: u32 = 3;
const STORAGE_RETRY_BACKOFF: Duration = Duration::from_millis(500);

pub struct Pipeline {
    buffers: Arc<BufferManager>,
    policy: RotationPolicy,
    router: PathRouter,
    writer: Arc<StorageWriter>,
    dlq: Arc<DlqPublisher>,
    metrics: Arc<MetricsCollector>,
    flush_interval: Duration,
}

impl Pipeline {
    pub fn new(
        buffers: Arc<BufferManager>,
        policy: RotationPolicy,
        router: PathRouter,
        writer: Arc<StorageWriter>,
        dlq: Arc<DlqPublisher>,
        metrics: Arc<MetricsCollector>,
        flush_interval: Duration,
    ) -> Self {
        Pipeline {
            buffers,
            policy,
            router,
            writer,
            dlq,
            metrics,
            flush_interval,
        }
    }

    /// Runs until `shutdown` fires or the event channel closes. `force`
    /// is the hard deadline handed to uploads: a graceful drain runs
    /// with it untripped, and tripping it aborts in-flight writes.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<ConsumedEvent>,
        mut errors: mpsc::Receiver<ArchiverError>,
        shutdown: CancellationToken,
        force: CancellationToken,
    ) {
        info!("pipeline started");
        let mut sweeper = tokio::time::interval(self.flush_interval);
        sweeper.set_missed_tick_behavior(MissedTickBehavior::Skip);
        sweeper.reset();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested, draining buffers");
                    self.drain_all(&force).await;
                    break;
                }
                Some(err) = errors.recv() => {
                    warn!(error = %err, "consumer reported a non-fatal error");
                }
                maybe = events.recv() => match maybe {
                    Some(consumed) => self.process(consumed, &force).await,
                    None => {
                        info!("event channel closed, draining buffers");
                        self.drain_all(&force).await;
                        break;
                    }
                },
                _ = sweeper.tick() => self.sweep(&force).await,
            }
        }
        info!("pipeline stopped");
    }

    async fn process(&self, consumed: ConsumedEvent, force: &CancellationToken) {
        let ConsumedEvent {
            event,
            metadata,
            commit,
        } = consumed;

        if let Err(fault) = validator::validate(&event) {
            self.metrics.validation_failures.inc();
            warn!(
                topic = %metadata.topic,
                partition = metadata.partition,
                offset = metadata.offset,
                error = %fault,
                "event failed validation"
            );
            if let Err(e) = self
                .dlq
                .publish(&event, &metadata, REASON_VALIDATION_FAILED, 0)
                .await
            {
                error!(error = %e, "failed to dead-letter invalid event");
            }
            // The offset is committed so the invalid event is skipped.
            if let Err(e) = commit.commit() {
                self.metrics.commit_failures.inc();
                warn!(error = %e, "failed to commit skipped offset");
            }
            return;
        }

        let record = Record::new(event, metadata);
        let estimate = record.estimated_size() as i64;
        let id = record.partition_id();
        let buffer = self.buffers.get_or_create(&id);

        match buffer.add(record, commit) {
            Ok(()) => {
                self.metrics.records_buffered.inc();
                self.metrics.bytes_buffered.add(estimate);
            }
            Err(rejected) => {
                // Buffer full is not fatal: flush the batch that filled
                // it, then retry the append into the emptied buffer.
                debug!(partition = %id, reason = %rejected.reason, "buffer full, flushing");
                self.flush(&buffer, force).await;
                match buffer.add(rejected.record, rejected.commit) {
                    Ok(()) => {
                        self.metrics.records_buffered.inc();
                        self.metrics.bytes_buffered.add(estimate);
                    }
                    Err(still_rejected) => {
                        // Unreachable with a single orchestrator task; an
                        // empty buffer admits any record.
                        let err = ArchiverError::BufferFull {
                            partition: id.to_string(),
                            reason: still_rejected.reason,
                        };
                        error!(error = %err, "record rejected by emptied buffer");
                    }
                }
            }
        }

        if self.policy.should_rotate(&buffer.stats()) {
            self.flush(&buffer, force).await;
        }
    }

    /// Drains one buffer and writes the batch. On success the highest
    /// commit handle is invoked (the batch is a contiguous offset range,
    /// so the top offset covers it). On terminal failure every record is
    /// dead-lettered and nothing is committed, so the range is re-read
    /// after restart.
    async fn flush(&self, buffer: &PartitionBuffer, force: &CancellationToken) {
        let stats = buffer.stats();
        let batch = buffer.drain();
        if batch.is_empty() {
            return;
        }
        self.metrics.records_buffered.sub(batch.records.len() as i64);
        self.metrics.bytes_buffered.sub(stats.size_bytes as i64);

        let first = &batch.records[0];
        let path = self
            .router
            .route(buffer.id(), first.event_time_unix(), &first.event.spec_version);

        let mut attempt: u32 = 0;
        loop {
            match self.writer.write(&batch.records, &path, force).await {
                Ok(bytes) => {
                    info!(
                        partition = %buffer.id(),
                        records = batch.records.len(),
                        bytes,
                        path = %path,
                        "flushed batch"
                    );
                    if let Some(handle) = batch.commits.last() {
                        if let Err(e) = handle.commit() {
                            self.metrics.commit_failures.inc();
                            warn!(
                                partition = %buffer.id(),
                                error = %e,
                                "commit after upload failed; range may be re-delivered"
                            );
                        }
                    }
                    return;
                }
                Err(e) if force.is_cancelled() => {
                    warn!(
                        partition = %buffer.id(),
                        error = %e,
                        "flush aborted by shutdown; records will be re-delivered"
                    );
                    return;
                }
                Err(e) if e.is_retryable() && attempt < STORAGE_RETRY_LIMIT => {
                    attempt += 1;
                    warn!(
                        partition = %buffer.id(),
                        attempt,
                        error = %e,
                        "transient storage failure, retrying"
                    );
                    tokio::select! {
                        _ = force.cancelled() => return,
                        _ = tokio::time::sleep(STORAGE_RETRY_BACKOFF * attempt) => {}
                    }
                }
                Err(e) => {
                    error!(
                        partition = %buffer.id(),
                        error = %e,
                        "terminal storage failure, dead-lettering batch"
                    );
                    for record in &batch.records {
                        if let Err(dlq_err) = self
                            .dlq
                            .publish(&record.event, &record.kafka, REASON_STORAGE_FAILED, attempt)
                            .await
                        {
                            error!(
                                offset = record.offset,
                                error = %dlq_err,
                                "failed to dead-letter record"
                            );
                        }
                    }
                    // Offsets stay uncommitted; the range is re-read
                    // after restart.
                    return;
                }
            }
        }
    }

    /// Rotates idle buffers that crossed a threshold between appends.
    async fn sweep(&self, force: &CancellationToken) {
        for buffer in self.buffers.snapshot() {
            if !buffer.is_empty() && self.policy.should_rotate(&buffer.stats()) {
                debug!(partition = %buffer.id(), "sweeper rotating buffer");
                self.flush(&buffer, force).await;
            }
        }
    }

    /// Best-effort flush of everything still buffered, used on shutdown.
    async fn drain_all(&self, force: &CancellationToken) {
        for buffer in self.buffers.snapshot() {
            if !buffer.is_empty() {
                self.flush(&buffer, force).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DlqConfig, FileStorageConfig, KafkaConfig, StorageConfig};
    use crate::consumer::CommitHandle;
    use crate::event::{CloudEvent, KafkaMetadata};
    use crate::router::{PathRouter, Protocol};
    use crate::storage::build_router;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn storage_config(base: &std::path::Path) -> StorageConfig {
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

    fn pipeline(
        base: &std::path::Path,
        policy: RotationPolicy,
        buffer_size: u64,
    ) -> (Pipeline, Arc<MetricsCollector>) {
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let cfg = storage_config(base);
        let writer = Arc::new(StorageWriter::from_config(&cfg, Arc::clone(&metrics)).unwrap());
        let kafka = KafkaConfig {
            dlq: DlqConfig {
                enabled: false,
                ..DlqConfig::default()
            },
            ..KafkaConfig::default()
        };
        let dlq =
            Arc::new(DlqPublisher::new(&kafka, "test".to_string(), Arc::clone(&metrics)).unwrap());
        let pipeline = Pipeline::new(
            Arc::new(BufferManager::new(buffer_size, 0)),
            policy,
            build_router(&cfg).unwrap(),
            writer,
            dlq,
            Arc::clone(&metrics),
            Duration::from_secs(60),
        );
        (pipeline, metrics)
    }

    fn consumed(offset: i64, commits: &Arc<AtomicUsize>) -> ConsumedEvent {
        let event: CloudEvent = serde_json::from_value(json!({
            "id": format!("r-{offset}"),
            "source": "s",
            "specversion": "1.0",
            "type": "t.x",
            "time": "2025-12-18T09:30:00Z",
            "data": {"k": "v"}
        }))
        .unwrap();
        let metadata = KafkaMetadata {
            topic: "evt".to_string(),
            partition: 3,
            offset,
            key: None,
            headers: None,
            timestamp: "2025-12-18T10:00:00Z".parse().unwrap(),
        };
        let counter = Arc::clone(commits);
        ConsumedEvent {
            event,
            metadata,
            commit: CommitHandle::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        }
    }

    fn files_under(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
        let mut found = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            for entry in std::fs::read_dir(&current).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    found.push(path);
                }
            }
        }
        found
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rotation_by_count_flushes_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RotationPolicy::new(0, 100, ChronoDuration::zero());
        let (pipeline, _metrics) = pipeline(dir.path(), policy, 0);
        let commits = Arc::new(AtomicUsize::new(0));
        let force = CancellationToken::new();

        for offset in 0..100 {
            pipeline.process(consumed(offset, &commits), &force).await;
        }

        let files = files_under(dir.path());
        assert_eq!(files.len(), 1, "expected one flushed file, got {files:?}");
        // Only the highest-offset handle is invoked per flush.
        assert_eq!(commits.load(Ordering::SeqCst), 1);
        for buffer in pipeline.buffers.snapshot() {
            assert!(buffer.is_empty());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn buffer_full_triggers_flush_then_retry() {
        let dir = tempfile::tempdir().unwrap();
        // Policy never fires; only the buffer byte cap forces the flush.
        let policy = RotationPolicy::new(0, 0, ChronoDuration::zero());
        let commits = Arc::new(AtomicUsize::new(0));
        let probe = consumed(0, &commits);
        let cap = Record::new(probe.event.clone(), probe.metadata.clone()).estimated_size() as u64 + 8;
        let (pipeline, _metrics) = pipeline(dir.path(), policy, cap);
        let force = CancellationToken::new();

        pipeline.process(consumed(0, &commits), &force).await;
        pipeline.process(consumed(1, &commits), &force).await;

        // First record flushed to disk, second re-buffered.
        assert_eq!(files_under(dir.path()).len(), 1);
        let buffers = pipeline.buffers.snapshot();
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].stats().record_count, 1);
        assert_eq!(commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn validation_failure_commits_without_buffering() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RotationPolicy::new(0, 10, ChronoDuration::zero());
        let (pipeline, metrics) = pipeline(dir.path(), policy, 0);
        let commits = Arc::new(AtomicUsize::new(0));
        let force = CancellationToken::new();

        let mut invalid = consumed(0, &commits);
        invalid.event.id = String::new();
        pipeline.process(invalid, &force).await;

        assert_eq!(commits.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.validation_failures.get(), 1);
        assert!(pipeline.buffers.is_empty());
        assert!(files_under(dir.path()).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drain_all_flushes_partial_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RotationPolicy::new(0, 1000, ChronoDuration::zero());
        let (pipeline, _metrics) = pipeline(dir.path(), policy, 0);
        let commits = Arc::new(AtomicUsize::new(0));
        let force = CancellationToken::new();

        for offset in 0..7 {
            pipeline.process(consumed(offset, &commits), &force).await;
        }
        assert!(files_under(dir.path()).is_empty());

        pipeline.drain_all(&force).await;
        assert_eq!(files_under(dir.path()).len(), 1);
        assert_eq!(commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sweep_rotates_aged_buffers() {
        fn past_clock() -> chrono::DateTime<chrono::Utc> {
            chrono::Utc::now() + ChronoDuration::seconds(3600)
        }
        let dir = tempfile::tempdir().unwrap();
        // Injected clock an hour ahead makes any buffered record "old".
        let policy = RotationPolicy::with_clock(0, 0, ChronoDuration::seconds(300), past_clock);
        let (pipeline, _metrics) = pipeline(dir.path(), policy, 0);
        let commits = Arc::new(AtomicUsize::new(0));
        let force = CancellationToken::new();

        let buffer = pipeline
            .buffers
            .get_or_create(&crate::event::PartitionId::new("evt", 3));
        let probe = consumed(5, &commits);
        buffer
            .add(Record::new(probe.event, probe.metadata), probe.commit)
            .unwrap();

        pipeline.sweep(&force).await;
        assert_eq!(files_under(dir.path()).len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn router_used_for_file_backend_is_relative() {
        let router = PathRouter::new(Protocol::File, "", "");
        let path = router.route(&crate::event::PartitionId::new("evt", 3), 0, "1.0");
        assert!(!path.contains("://"));
    }
}
