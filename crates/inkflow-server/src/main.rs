//! # Inkflow Cache Sync
//!
//! Consumes cache invalidation jobs, deletes the matching keys and warms
//! the canonical blog views back up.

use inkflow_config::ConfigLoader;
use inkflow_core::telemetry::init_tracing;
use inkflow_core::InkflowResult;
use inkflow_invalidation::register_metrics;
use inkflow_server::di::build_cache_sync_module;
use inkflow_server::startup::{print_startup_info, run_until, shutdown_signal};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // Tracing may not be up yet
        eprintln!("Application error: {}", e);
        error!("Application error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> InkflowResult<()> {
    let config_loader = ConfigLoader::from_default_location()?;
    let config = config_loader.get().await;

    init_tracing(&config.observability)?;
    register_metrics();

    info!("Starting Inkflow cache sync...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Environment: {}", config.app.environment);

    let module = build_cache_sync_module(&config).await?;
    print_startup_info(&config, module.consumer_id());

    run_until(&module, shutdown_signal()).await?;

    info!("Cache sync shutdown complete");
    Ok(())
}
