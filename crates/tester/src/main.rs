//! Tester - grading worker
//!
//! Consumes grading jobs from a Redis Stream, builds the submission, runs
//! every test case under a deadline and hands the results back to the sync
//! agent.

mod config;
mod consumer;
mod coordinator;
mod executor;
mod layout;
mod metrics;
mod queue;
mod testcase;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::consumer::JobConsumer;
use crate::metrics::MetricsServer;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tester=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting tester worker");

    // Load configuration
    let config = Config::from_env();
    tracing::info!("Environment: {}", config.environment);
    tracing::info!("Working directory: {}", config.storage.working_dir.display());

    // Create Redis pool
    tracing::info!("Connecting to Redis...");
    let redis_cfg = deadpool_redis::Config::from_url(&config.queue.redis_url);
    let redis_pool = redis_cfg.create_pool(Some(deadpool_redis::Runtime::Tokio1))?;
    tracing::info!("Redis connected");

    // Create shutdown signal
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    // Setup signal handlers
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        tracing::info!("Shutdown signal received, finishing current job...");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    // Start metrics server
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = MetricsServer::run(metrics_port).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    // Create and initialize consumer
    let mut consumer = JobConsumer::new(config, redis_pool, shutdown);
    consumer.initialize().await?;

    tracing::info!("Tester ready, starting job consumer loop");

    consumer.run().await?;

    tracing::info!("Tester shutdown complete");
    Ok(())
}
