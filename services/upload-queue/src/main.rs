use anyhow::{Context, Result};
use fotox_upload_queue::api::{start_api_server, AppState};
use fotox_upload_queue::{
    Config, DrainOutcome, HttpRemoteClient, SqliteSessionStore, Staging, UploadQueue,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting FotoX Upload Queue"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let store = SqliteSessionStore::new(&config.store)
        .await
        .context("Failed to open session store")?;

    if config.store.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run session store migrations")?;
    }

    let remote =
        HttpRemoteClient::new(&config.remote).context("Failed to initialize remote client")?;

    tokio::fs::create_dir_all(&config.queue.root)
        .await
        .with_context(|| format!("Failed to create queue root {}", config.queue.root.display()))?;

    let queue = Arc::new(UploadQueue::new(
        Arc::new(store),
        Arc::new(remote),
        Staging::new(config.queue.root.clone()),
    ));

    let api_handle = if config.api.enabled {
        let api_state = AppState {
            queue: queue.clone(),
        };
        let api_config = config.api.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = start_api_server(api_state, &api_config).await {
                error!(error = %e, "API server error");
            }
        }))
    } else {
        None
    };

    let drain_handle = tokio::spawn(drain_loop(
        queue.clone(),
        config.drain_interval(),
        config.queue.drain_on_startup,
    ));

    info!("Upload queue started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down upload queue");

    drain_handle.abort();
    if let Some(handle) = api_handle {
        handle.abort();
    }

    info!("Upload queue stopped");

    Ok(())
}

/// Periodically drain the queue. Ticks that land during an active drain are skipped.
async fn drain_loop(queue: Arc<UploadQueue>, period: Duration, drain_on_startup: bool) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    if !drain_on_startup {
        // The first tick completes immediately
        interval.tick().await;
    }

    loop {
        interval.tick().await;

        let outcome = queue
            .start_processing(
                |session_id| info!(session_id = %session_id, "Upload progress"),
                |session_id, e| warn!(session_id = %session_id, error = %e, "Upload halted"),
            )
            .await;

        if let DrainOutcome::Finished(summary) = outcome {
            if summary.pending > 0 {
                warn!(
                    pending = summary.pending,
                    completed = summary.completed,
                    "Sessions left for the next drain"
                );
            }
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
