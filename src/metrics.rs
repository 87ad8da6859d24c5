//! Prometheus collector. The registry is constructed explicitly and
//! handed to each component; nothing registers through a global.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::error::Result;

pub struct MetricsCollector {
    registry: Registry,

    // Consumption
    pub events_consumed: IntCounter,
    pub parse_failures: IntCounter,
    pub consumer_errors: IntCounter,
    pub rebalance_duration_seconds: Histogram,

    // Processing
    pub validation_failures: IntCounter,
    pub records_buffered: IntGauge,
    pub bytes_buffered: IntGauge,
    pub commit_failures: IntCounter,

    // Storage
    pub files_written: IntCounterVec,
    pub file_size_bytes: Histogram,
    pub write_duration_seconds: Histogram,
    pub storage_errors: IntCounterVec,

    // Dead letter queue
    pub dlq_published: IntCounterVec,
    pub dlq_failures: IntCounter,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let events_consumed = IntCounter::with_opts(Opts::new(
            "archiver_events_consumed_total",
            "Events received from the consumer adapter",
        ))?;
        let parse_failures = IntCounter::with_opts(Opts::new(
            "archiver_parse_failures_total",
            "Messages whose payload could not be parsed as a CloudEvent",
        ))?;
        let consumer_errors = IntCounter::with_opts(Opts::new(
            "archiver_consumer_errors_total",
            "Non-fatal errors reported by the consumer",
        ))?;
        let rebalance_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "archiver_rebalance_duration_seconds",
                "Time between partition revocation and reassignment",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        )?;

        let validation_failures = IntCounter::with_opts(Opts::new(
            "archiver_validation_failures_total",
            "Events rejected by CloudEvents validation",
        ))?;
        let records_buffered = IntGauge::with_opts(Opts::new(
            "archiver_records_buffered",
            "Records currently held across all partition buffers",
        ))?;
        let bytes_buffered = IntGauge::with_opts(Opts::new(
            "archiver_bytes_buffered",
            "Estimated bytes currently held across all partition buffers",
        ))?;
        let commit_failures = IntCounter::with_opts(Opts::new(
            "archiver_commit_failures_total",
            "Offset commits that failed after a successful upload",
        ))?;

        let files_written = IntCounterVec::new(
            Opts::new("archiver_files_written_total", "Files written by status"),
            &["status"],
        )?;
        let file_size_bytes = Histogram::with_opts(
            HistogramOpts::new("archiver_file_size_bytes", "Size of written files").buckets(vec![
                1024.0,
                65536.0,
                1048576.0,
                16777216.0,
                134217728.0,
                1073741824.0,
            ]),
        )?;
        let write_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "archiver_write_duration_seconds",
                "Encode-and-upload duration per file",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        )?;
        let storage_errors = IntCounterVec::new(
            Opts::new(
                "archiver_storage_errors_total",
                "Storage backend errors by operation",
            ),
            &["operation"],
        )?;

        let dlq_published = IntCounterVec::new(
            Opts::new(
                "archiver_dlq_published_total",
                "Events shipped to the dead-letter topic by reason",
            ),
            &["reason"],
        )?;
        let dlq_failures = IntCounter::with_opts(Opts::new(
            "archiver_dlq_failures_total",
            "Dead-letter publishes that themselves failed",
        ))?;

        registry.register(Box::new(events_consumed.clone()))?;
        registry.register(Box::new(parse_failures.clone()))?;
        registry.register(Box::new(consumer_errors.clone()))?;
        registry.register(Box::new(rebalance_duration_seconds.clone()))?;
        registry.register(Box::new(validation_failures.clone()))?;
        registry.register(Box::new(records_buffered.clone()))?;
        registry.register(Box::new(bytes_buffered.clone()))?;
        registry.register(Box::new(commit_failures.clone()))?;
        registry.register(Box::new(files_written.clone()))?;
        registry.register(Box::new(file_size_bytes.clone()))?;
        registry.register(Box::new(write_duration_seconds.clone()))?;
        registry.register(Box::new(storage_errors.clone()))?;
        registry.register(Box::new(dlq_published.clone()))?;
        registry.register(Box::new(dlq_failures.clone()))?;

        Ok(MetricsCollector {
            registry,
            events_consumed,
            parse_failures,
            consumer_errors,
            rebalance_duration_seconds,
            validation_failures,
            records_buffered,
            bytes_buffered,
            commit_failures,
            files_written,
            file_size_bytes,
            write_duration_seconds,
            storage_errors,
            dlq_published,
            dlq_failures,
        })
    }

    /// Prometheus text exposition of everything registered.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
