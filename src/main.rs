use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use event_archiver::buffer::BufferManager;
use event_archiver::config::{AppConfig, DEFAULT_CONFIG_PATH};
use event_archiver::consumer::{
    ConsumerAdapter, ERROR_CHANNEL_CAPACITY, EVENT_CHANNEL_CAPACITY,
};
use event_archiver::dlq::DlqPublisher;
use event_archiver::health::{serve_health, serve_metrics, ReadinessProbe};
use event_archiver::metrics::MetricsCollector;
use event_archiver::pipeline::Pipeline;
use event_archiver::rotation::RotationPolicy;
use event_archiver::storage::{build_router, StorageWriter};

#[derive(Parser, Debug)]
#[command(name = "event-archiver", version, about = "Archive CloudEvents from Kafka to object storage")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Overrides observability.logging.level.
    #[arg(long)]
    log_level: Option<String>,

    /// Overrides observability.metrics.port.
    #[arg(long)]
    metrics_port: Option<u16>,
}

fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // Tracing may not be initialized yet when configuration loading
        // fails, so the fatal error goes to stderr directly as well.
        eprintln!("fatal: {e:#}");
        error!(error = ?e, "fatal error");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = if config_path.exists() {
        AppConfig::load(&config_path)
            .with_context(|| format!("loading configuration from {}", config_path.display()))?
    } else {
        AppConfig::default()
    };
    if let Some(level) = cli.log_level {
        config.observability.logging.level = level;
    }
    if let Some(port) = cli.metrics_port {
        config.observability.metrics.port = port;
    }

    init_tracing(
        &config.observability.logging.level,
        &config.observability.logging.format,
    );
    info!(
        name = %config.application.name,
        version = %config.application.version,
        environment = %config.application.environment,
        config = %config_path.display(),
        "starting event archiver"
    );

    let metrics = Arc::new(MetricsCollector::new()?);
    let probe = Arc::new(ReadinessProbe::new());

    let writer = Arc::new(StorageWriter::from_config(&config.storage, Arc::clone(&metrics))?);
    probe.set_storage_ready(true);
    let router = build_router(&config.storage)?;

    let buffers = Arc::new(BufferManager::new(config.processing.buffer_size_bytes(), 0));
    let policy = RotationPolicy::new(
        config.file_rotation.max_size_bytes(),
        config.file_rotation.max_records_per_file,
        chrono::Duration::seconds(config.file_rotation.max_duration_seconds as i64),
    );
    let dlq = Arc::new(DlqPublisher::new(
        &config.kafka,
        config.processor_id(),
        Arc::clone(&metrics),
    )?);

    let consumer = Arc::new(ConsumerAdapter::new(
        &config.kafka,
        Arc::clone(&probe),
        Arc::clone(&metrics),
        None,
    )?);

    // Graceful shutdown stops consumption and drains buffers; the force
    // token fires after the grace period and aborts in-flight uploads.
    let shutdown = CancellationToken::new();
    let force = CancellationToken::new();

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

    let delivery = consumer.spawn_delivery(
        event_tx,
        error_tx,
        Arc::clone(&metrics),
        shutdown.clone(),
    )?;

    let health_task = tokio::spawn(serve_health(
        config.observability.health.clone(),
        Arc::clone(&probe),
        shutdown.clone(),
    ));
    let metrics_task = tokio::spawn(serve_metrics(
        config.observability.metrics.clone(),
        Arc::clone(&metrics),
        shutdown.clone(),
    ));

    let pipeline = Pipeline::new(
        buffers,
        policy,
        router,
        Arc::clone(&writer),
        dlq,
        Arc::clone(&metrics),
        Duration::from_secs(config.processing.buffer_flush_interval_seconds.max(1)),
    );
    let pipeline_task = {
        let shutdown = shutdown.clone();
        let force = force.clone();
        tokio::spawn(async move { pipeline.run(event_rx, error_rx, shutdown, force).await })
    };

    wait_for_signal().await;
    info!("shutdown signal received");
    probe.set_alive(false);
    shutdown.cancel();

    // The force token trips when the grace period runs out, or sooner if
    // a second signal arrives while the drain is still in flight.
    let grace = Duration::from_secs(config.shutdown.grace_period_seconds);
    let force_trigger = {
        let force = force.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(grace) => {
                    warn!("grace period elapsed, forcing shutdown");
                }
                _ = wait_for_signal() => {
                    warn!("second shutdown signal received, forcing shutdown");
                }
            }
            force.cancel();
        })
    };

    let force_timeout = Duration::from_secs(config.shutdown.force_timeout_seconds);
    match tokio::time::timeout(grace + force_timeout, pipeline_task).await {
        Ok(Ok(())) => info!("pipeline drained cleanly"),
        Ok(Err(e)) => warn!(error = %e, "pipeline task panicked"),
        Err(_) => warn!("pipeline did not stop within the force timeout"),
    }
    force_trigger.abort();
    force.cancel();

    consumer.close();
    writer.close().await;
    let _ = delivery.await;
    health_task.abort();
    metrics_task.abort();

    info!("event archiver stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
