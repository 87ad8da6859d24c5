//! End-to-end pipeline tests over the filesystem backend: events enter
//! through the bounded channel exactly as the consumer adapter would
//! deliver them, and the published files are read back for verification.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arrow::array::AsArray;
use arrow::datatypes::{Int64Type, TimestampMicrosecondType};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use event_archiver::buffer::BufferManager;
use event_archiver::config::{DlqConfig, FileStorageConfig, KafkaConfig, StorageConfig};
use event_archiver::consumer::{parse_cloud_event, CommitHandle, ConsumedEvent};
use event_archiver::dlq::DlqPublisher;
use event_archiver::event::KafkaMetadata;
use event_archiver::metrics::MetricsCollector;
use event_archiver::pipeline::Pipeline;
use event_archiver::rotation::RotationPolicy;
use event_archiver::storage::{build_router, StorageWriter};

fn storage_config(base: &Path, format: &str) -> StorageConfig {
    let compression = if format == "avro" { "deflate" } else { "snappy" };
    StorageConfig {
        backend: "file".to_string(),
        format: format.to_string(),
        compression: compression.to_string(),
        file: Some(FileStorageConfig {
            base_path: base.to_string_lossy().into_owned(),
        }),
        s3: None,
        azure: None,
        gcs: None,
    }
}

fn build_pipeline(
    base: &Path,
    format: &str,
    max_records: usize,
) -> (Pipeline, Arc<MetricsCollector>) {
    let metrics = Arc::new(MetricsCollector::new().unwrap());
    let cfg = storage_config(base, format);
    let writer = Arc::new(StorageWriter::from_config(&cfg, Arc::clone(&metrics)).unwrap());
    let kafka = KafkaConfig {
        dlq: DlqConfig {
            enabled: false,
            ..DlqConfig::default()
        },
        ..KafkaConfig::default()
    };
    let dlq = Arc::new(
        DlqPublisher::new(&kafka, "integration-test".to_string(), Arc::clone(&metrics)).unwrap(),
    );
    let pipeline = Pipeline::new(
        Arc::new(BufferManager::new(0, 0)),
        RotationPolicy::new(0, max_records, chrono::Duration::zero()),
        build_router(&cfg).unwrap(),
        writer,
        dlq,
        Arc::clone(&metrics),
        Duration::from_secs(60),
    );
    (pipeline, metrics)
}

fn consumed_from_json(payload: &str, offset: i64, commits: &Arc<AtomicUsize>) -> ConsumedEvent {
    let event = parse_cloud_event(payload.as_bytes()).unwrap();
    let counter = Arc::clone(commits);
    ConsumedEvent {
        event,
        metadata: KafkaMetadata {
            topic: "evt".to_string(),
            partition: 3,
            offset,
            key: None,
            headers: None,
            timestamp: "2025-12-18T10:00:00Z".parse().unwrap(),
        },
        commit: CommitHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    }
}

fn files_under(dir: &Path) -> Vec<PathBuf> {
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
async fn round_trip_single_record_to_parquet() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, _metrics) = build_pipeline(dir.path(), "parquet", 1);
    let commits = Arc::new(AtomicUsize::new(0));

    let (event_tx, event_rx) = mpsc::channel(100);
    let (_error_tx, error_rx) = mpsc::channel(10);
    let shutdown = CancellationToken::new();
    let force = CancellationToken::new();

    let runner = {
        let shutdown = shutdown.clone();
        let force = force.clone();
        tokio::spawn(async move { pipeline.run(event_rx, error_rx, shutdown, force).await })
    };

    event_tx
        .send(consumed_from_json(
            r#"{"id":"r-1","source":"s","specversion":"1.0","type":"t.x",
               "time":"2025-12-18T09:30:00Z","data":{"k":"v"}}"#,
            42,
            &commits,
        ))
        .await
        .unwrap();
    drop(event_tx);
    runner.await.unwrap();

    // The routed directory is derived from the event timestamp.
    let published = dir.path().join("evt/v10/dt=2025-12-18/pid=3");
    assert!(published.is_dir(), "missing {published:?}");
    let files = files_under(&published);
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().unwrap().to_string_lossy().into_owned();
    let pattern = regex::Regex::new(r"^events_\d{8}_\d{6}_\d{3}\.parquet$").unwrap();
    assert!(pattern.is_match(&name), "unexpected file name {name}");

    // No temp files anywhere in the published tree.
    for file in files_under(dir.path()) {
        assert!(file.to_string_lossy().ends_with(".parquet"), "stray file {file:?}");
    }

    let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&files[0]).unwrap())
        .unwrap()
        .build()
        .unwrap();
    let batches: Vec<_> = reader.map(|b| b.unwrap()).collect();
    assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 1);
    let batch = &batches[0];

    let offsets = batch
        .column_by_name("kafka_offset")
        .unwrap()
        .as_primitive::<Int64Type>();
    assert_eq!(offsets.value(0), 42);

    let expected: chrono::DateTime<chrono::Utc> = "2025-12-18T09:30:00Z".parse().unwrap();
    let time = batch
        .column_by_name("time")
        .unwrap()
        .as_primitive::<TimestampMicrosecondType>();
    assert_eq!(time.value(0), expected.timestamp_micros());

    assert_eq!(commits.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn legacy_spec_version_is_stored_normalized() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, _metrics) = build_pipeline(dir.path(), "parquet", 1);
    let commits = Arc::new(AtomicUsize::new(0));

    let (event_tx, event_rx) = mpsc::channel(100);
    let (_error_tx, error_rx) = mpsc::channel(10);
    let shutdown = CancellationToken::new();
    let force = CancellationToken::new();
    let runner = {
        let shutdown = shutdown.clone();
        let force = force.clone();
        tokio::spawn(async move { pipeline.run(event_rx, error_rx, shutdown, force).await })
    };

    event_tx
        .send(consumed_from_json(
            r#"{"id":"r-2","source":"s","specversion":"0.1","type":"t.x",
               "time":"2025-12-18T09:30:00Z","data":null}"#,
            7,
            &commits,
        ))
        .await
        .unwrap();
    drop(event_tx);
    runner.await.unwrap();

    // Normalization happened before routing and before storage.
    let published = dir.path().join("evt/v10/dt=2025-12-18/pid=3");
    let files = files_under(&published);
    assert_eq!(files.len(), 1);

    let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&files[0]).unwrap())
        .unwrap()
        .build()
        .unwrap();
    let batch = reader.map(|b| b.unwrap()).next().unwrap();
    let versions = batch.column_by_name("spec_version").unwrap().as_string::<i32>();
    assert_eq!(versions.value(0), "1.0");
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_drains_partial_buffers() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, _metrics) = build_pipeline(dir.path(), "parquet", 1000);
    let commits = Arc::new(AtomicUsize::new(0));

    let (event_tx, event_rx) = mpsc::channel(100);
    let (_error_tx, error_rx) = mpsc::channel(10);
    let shutdown = CancellationToken::new();
    let force = CancellationToken::new();
    let runner = {
        let shutdown = shutdown.clone();
        let force = force.clone();
        tokio::spawn(async move { pipeline.run(event_rx, error_rx, shutdown, force).await })
    };

    for offset in 0..5 {
        event_tx
            .send(consumed_from_json(
                &format!(
                    r#"{{"id":"r-{offset}","source":"s","specversion":"1.0","type":"t.x",
                        "time":"2025-12-18T09:30:00Z","data":{{}}}}"#
                ),
                offset,
                &commits,
            ))
            .await
            .unwrap();
    }
    // Give the pipeline a beat to take everything off the channel, then
    // request a graceful shutdown while the buffer is still partial.
    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();
    runner.await.unwrap();

    let files = files_under(dir.path());
    assert_eq!(files.len(), 1, "drain should publish one file, got {files:?}");
    assert_eq!(commits.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn avro_batches_are_readable_after_flush() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, _metrics) = build_pipeline(dir.path(), "avro", 2);
    let commits = Arc::new(AtomicUsize::new(0));

    let (event_tx, event_rx) = mpsc::channel(100);
    let (_error_tx, error_rx) = mpsc::channel(10);
    let shutdown = CancellationToken::new();
    let force = CancellationToken::new();
    let runner = {
        let shutdown = shutdown.clone();
        let force = force.clone();
        tokio::spawn(async move { pipeline.run(event_rx, error_rx, shutdown, force).await })
    };

    for offset in [10, 11] {
        event_tx
            .send(consumed_from_json(
                &format!(
                    r#"{{"id":"r-{offset}","source":"s","specversion":"1.0","type":"t.x",
                        "time":"2025-12-18T09:30:00Z","data":{{"n":{offset}}}}}"#
                ),
                offset,
                &commits,
            ))
            .await
            .unwrap();
    }
    drop(event_tx);
    runner.await.unwrap();

    let files = files_under(dir.path());
    assert_eq!(files.len(), 1);
    assert!(files[0].to_string_lossy().ends_with(".avro"));

    let reader = apache_avro::Reader::new(File::open(&files[0]).unwrap()).unwrap();
    let rows: Vec<_> = reader.map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), 2);
}
