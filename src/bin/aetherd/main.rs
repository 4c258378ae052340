use aether::config::Config;
use aether::core::advisor::HttpAdvisor;
use aether::core::cluster::ClusterStateStore;
use aether::core::command::{NatsCommandSink, Subjects};
use aether::core::dashboard::DashboardSource;
use aether::core::ingest::Ingestor;
use aether::core::queue::JobQueue;
use aether::core::scheduler::Scheduler;
use aether::core::signals::{carbon_from_config, Detector};
use aether::core::store::PgTelemetryStore;
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod cli;
mod server;
mod transport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let aetherd = cli::Aetherd::parse();

    // Initialize tracing: console (stderr) + daily rolling file appender
    let log_dir = aether::core::get_log_dir()?;
    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("aetherd")
        .filename_suffix("log")
        .max_log_files(7)
        .build(&log_dir)?;
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(
            tracing_subscriber::filter::LevelFilter::from(aetherd.verbosity).into(),
        )
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    let mut config = aether::config::load_config(aetherd.config.as_ref())?;

    // CLI flags override config file
    if let Some(host) = aetherd.host {
        config.daemon.host = host;
    }
    if let Some(port) = aetherd.port {
        config.daemon.port = port;
    }

    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting aetherd {}", aether::core::version());
    let shutdown = CancellationToken::new();

    let nats = async_nats::connect(config.transport.url.as_str())
        .await
        .with_context(|| format!("Failed to connect to transport at {}", config.transport.url))?;
    tracing::info!("Connected to transport at {}", config.transport.url);

    let store = PgTelemetryStore::connect(&config.store)
        .await
        .context("Failed to connect to telemetry store")?;
    store
        .ensure_schema()
        .await
        .context("Failed to prepare telemetry table")?;
    tracing::info!("Connected to telemetry store (table {})", config.store.table);

    let cluster = Arc::new(ClusterStateStore::new());
    let queue = Arc::new(JobQueue::new());
    let carbon = carbon_from_config(&config.carbon);
    let subjects = Subjects::new(&config.transport.subject_prefix);

    let detector = Detector::from_config(&config.anomaly)?;
    let ingestor = Ingestor::new(
        Arc::clone(&cluster),
        Arc::new(store.clone()),
        Some(Arc::new(detector)),
    );
    let subscriber = nats
        .subscribe(subjects.telemetry())
        .await
        .with_context(|| format!("Failed to subscribe to {}", subjects.telemetry()))?;
    tracing::info!("Subscribed to {}", subjects.telemetry());
    let ingest_handle = tokio::spawn(transport::ingest_loop(
        subscriber,
        ingestor,
        shutdown.clone(),
    ));

    let advisor = HttpAdvisor::new(&config.advisor)?;
    tracing::info!("Placement advisor at {}", advisor.url());
    let scheduler = Scheduler::new(
        Arc::clone(&cluster),
        Arc::clone(&queue),
        advisor,
        NatsCommandSink::new(nats.clone(), subjects),
        Arc::clone(&carbon),
        config.scheduler.clone(),
    );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown.clone()));

    tokio::spawn(wait_for_signal(shutdown.clone()));

    let state = server::AppState {
        queue,
        cluster: Arc::clone(&cluster),
        dashboard: DashboardSource::new(
            cluster,
            carbon,
            config.anomaly.temperature_threshold_c,
        ),
        dashboard_config: config.dashboard.clone(),
        shutdown: shutdown.clone(),
    };
    let served = server::run(&config.daemon, state).await;

    // The server may also end on a bind error; stop the other loops either way.
    shutdown.cancel();
    if let Err(e) = scheduler_handle.await {
        tracing::error!("Scheduler task failed: {}", e);
    }
    if let Err(e) = ingest_handle.await {
        tracing::error!("Ingestion task failed: {}", e);
    }
    if let Err(e) = nats.flush().await {
        tracing::warn!("Failed to flush transport: {}", e);
    }
    store.close().await;
    tracing::info!("aetherd stopped");

    served
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
