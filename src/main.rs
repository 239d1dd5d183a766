//! TaskHub worker: consumes jobs from the configured broker.
//!
//! Main entry point that wires the broker, task registry, and worker together.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt};

use taskhub_broker::BrokerManager;
use taskhub_core::config::AppConfig;
use taskhub_core::error::AppError;
use taskhub_core::traits::Broker;
use taskhub_worker::{TaskRegistry, Worker, builtin};

#[tokio::main]
async fn main() {
    let env = std::env::var("TASKHUB_ENV").unwrap_or_else(|_| "development".to_string());
    let config = match AppConfig::load(&env) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config);
    tracing::info!(env = %env, "Configuration loaded");

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "Worker error");
        std::process::exit(1);
    }
}

/// Initialize tracing/logging
fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
        _ => {
            fmt()
                .pretty()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
}

/// Start the broker and run the worker until a shutdown signal arrives
async fn run(config: AppConfig) -> Result<(), AppError> {
    tracing::info!("Starting TaskHub worker v{}", env!("CARGO_PKG_VERSION"));

    tracing::info!(provider = %config.broker.provider, "Initializing broker");
    let manager = BrokerManager::new(&config.broker)?;
    manager.start().await?;
    let broker = manager.broker();

    let mut registry = TaskRegistry::new(&config.broker.default_queue);
    builtin::register(&mut registry);
    tracing::info!(tasks = ?registry.task_ids(), "Tasks registered");

    let worker = Worker::new(Arc::clone(&broker), Arc::new(registry), config.worker.clone());

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received, starting graceful shutdown...");
        signal_cancel.cancel();
    });

    let result = worker.run(cancel).await;

    if let Err(e) = broker.close().await {
        tracing::warn!(error = %e, "Failed to close broker cleanly");
    }
    tracing::info!("TaskHub worker shut down gracefully");
    result
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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
}
