#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use server::config::{CliArgs, ServerConfig};
use server::network::listener::Listener;
use server::pool::manager::DispatcherConfig;
use server::processing::processor::AckProcessor;
use server::service::handler::DispatchService;
use server::telemetry::init_telemetry;
use tokio::{signal, time::timeout};
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let service = DispatchService::new(DispatcherConfig::from(&config), AckProcessor);
    let listener = Listener::bind(
        &config.server_addr,
        config.max_connections,
        config.max_package_bytes,
    )
    .await?;

    let shutdown = CancellationToken::new();
    let listening = tokio::spawn(listener.run(service.handle(), shutdown.clone()));

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, terminating gracefully...");

    // 1. Stop accepting connections and reading packages
    shutdown.cancel();
    match listening.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Listener failed: {e}"),
        Err(e) => tracing::error!("Listener task panicked: {e}"),
    }

    // 2. Drain the worker pool and let admitted items finish
    let teardown = service.shutdown();
    let drained = teardown.workers();
    if timeout(config.shutdown_timeout, teardown.join()).await.is_err() {
        tracing::warn!(
            "Worker teardown did not finish within {:?}",
            config.shutdown_timeout
        );
    }
    let stats = service.dispatcher().stats();
    tracing::info!(
        "Service shut down successfully ({drained} workers drained, {} remaining)",
        stats.workers
    );

    providers.shutdown();
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting package service on {} with full config: {:#?}",
            config.server_addr,
            config
        );
    } else {
        tracing::info!(
            "Starting package service on {} with {} workers of capacity {}",
            config.server_addr,
            config.num_workers,
            config.worker_capacity
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}
