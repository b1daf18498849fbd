//! Prometheus metrics for the tester worker

use std::sync::LazyLock;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Test case execution duration histogram
pub static EXECUTION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        "tester_execution_duration_seconds",
        "Time spent running test cases",
    )
    .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]);

    HistogramVec::new(opts, &["status"]).expect("Failed to create histogram")
});

/// Test case outcomes by status
pub static OUTCOME_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let opts = Opts::new("tester_outcome_total", "Test case outcomes by status");
    IntCounterVec::new(opts, &["status"]).expect("Failed to create counter")
});

/// Jobs processed counter
pub static JOBS_PROCESSED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("tester_jobs_processed_total", "Total jobs processed")
        .expect("Failed to create counter")
});

/// Jobs failed counter
pub static JOBS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("tester_jobs_failed_total", "Total jobs that failed")
        .expect("Failed to create counter")
});

/// Builds that failed or timed out
pub static BUILD_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("tester_build_failures_total", "Total failed builds")
        .expect("Failed to create counter")
});

/// Currently active jobs gauge
pub static ACTIVE_JOBS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("tester_active_jobs", "Currently active jobs").expect("Failed to create gauge")
});

/// Register all metrics
pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(EXECUTION_DURATION.clone()))?;
    REGISTRY.register(Box::new(OUTCOME_TOTAL.clone()))?;
    REGISTRY.register(Box::new(JOBS_PROCESSED.clone()))?;
    REGISTRY.register(Box::new(JOBS_FAILED.clone()))?;
    REGISTRY.register(Box::new(BUILD_FAILURES.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_JOBS.clone()))?;
    Ok(())
}

/// Record one test case outcome
pub fn record_outcome(status: &str, duration_secs: f64) {
    OUTCOME_TOTAL.with_label_values(&[status]).inc();
    EXECUTION_DURATION
        .with_label_values(&[status])
        .observe(duration_secs);
}

/// HTTP server for Prometheus metrics endpoint
pub struct MetricsServer;

impl MetricsServer {
    /// Run the metrics server
    pub async fn run(port: u16) -> anyhow::Result<()> {
        use axum::{routing::get, Router};
        use std::net::SocketAddr;

        init_metrics()?;

        let app = Router::new()
            .route("/metrics", get(Self::metrics_handler))
            .route("/health", get(|| async { "OK" }));

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        tracing::info!("Metrics server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    async fn metrics_handler() -> String {
        let encoder = TextEncoder::new();
        let metric_families = REGISTRY.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
