//! Process lifecycle: startup logging, run loop and shutdown.

use crate::di::CacheSyncModule;
use inkflow_config::AppConfig;
use inkflow_core::{InkflowError, InkflowResult};
use std::future::Future;
use tokio::signal;
use tracing::{info, warn};

/// Logs where the worker connects and what it consumes.
pub fn print_startup_info(config: &AppConfig, consumer_id: &str) {
    let separator = "=".repeat(60);
    info!("{}", separator);
    info!("Queue:       {}", config.broker.queue);
    info!("Consumer:    {}", consumer_id);
    info!("Prefetch:    {}", config.consumer.prefetch);
    info!("Key prefix:  {}", config.broker.key_prefix);
    info!(
        "Warm-up:     {}",
        if config.warmup.enabled {
            format!("{} page(s) of {}", config.warmup.warm_pages, config.warmup.page_limit)
        } else {
            "disabled".to_string()
        }
    );
    info!("{}", separator);
}

/// Runs the supervisor and the worker until `shutdown` resolves or the
/// worker stops on its own.
pub async fn run_until<F>(module: &CacheSyncModule, shutdown: F) -> InkflowResult<()>
where
    F: Future<Output = ()>,
{
    let connections = module.connections();
    let supervisor = connections.spawn();

    let worker = module.worker();
    let mut worker_task = tokio::spawn(async move { worker.run().await });

    let finished = tokio::select! {
        joined = &mut worker_task => Some(joined),
        _ = shutdown => None,
    };

    module.worker().shutdown();
    let joined = match finished {
        Some(joined) => joined,
        None => worker_task.await,
    };

    connections.shutdown();
    if let Err(e) = supervisor.await {
        warn!(error = %e, "Connection supervisor task failed");
    }

    joined
        .map_err(|e| InkflowError::Internal(format!("Worker task failed: {}", e)))?
        .map_err(InkflowError::from)
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
