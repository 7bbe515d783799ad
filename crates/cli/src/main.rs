mod metrics;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fanout_core::{
    load_config, validate_config, Config, Dispatcher, ReporterKind, RunReport, CONFIG_PATH_ENV,
    DEFAULT_CONFIG_PATH,
};

/// Exit code when the run finished but not every partition succeeded
const EXIT_PARTIAL_FAILURE: i32 = 2;

#[tokio::main]
async fn main() {
    match run().await {
        Ok(report) if report.is_success() => {}
        Ok(_) => std::process::exit(EXIT_PARTIAL_FAILURE),
        Err(e) => {
            error!("Fatal error: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<RunReport> {
    // Determine config path
    let config_path = std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let loaded = load_config(&config_path);

    // Keep the dashboard readable unless RUST_LOG asks for more
    let dashboard = matches!(&loaded, Ok(c) if c.reporter.kind == ReporterKind::Dashboard);
    init_logging(if dashboard { "warn" } else { "info" });

    let config = loaded.with_context(|| format!("Failed to load config from {:?}", config_path))?;
    validate_config(&config).context("Configuration validation failed")?;

    info!("Configuration loaded from {:?}", config_path);
    info!("Worker program: {}", config.dispatch.program);
    info!("Reporter: {:?}", config.reporter.kind);

    let dispatcher = Dispatcher::new(config.clone());
    let prepared = dispatcher.prepare().context("Failed to prepare run")?;
    info!(
        "Running {} items on {} workers",
        prepared.plan.total_items, prepared.plan.num_workers
    );

    let shutdown = prepared.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown signal received, stopping workers");
        shutdown.trigger();
    });

    let report = prepared.run().await.context("Run failed")?;
    write_outputs(&config, &report).await?;

    for worker in report.failed_workers() {
        error!(
            "Worker {} failed on {}..{} after {} attempts: {}",
            worker.worker_id,
            worker.partition.start_index,
            worker.partition.end_index,
            worker.attempts,
            worker.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    info!(
        "Completed {}/{} items in {}s",
        report.global_completed,
        report.total_items,
        report.duration().num_seconds()
    );

    Ok(report)
}

fn init_logging(default_directive: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn write_outputs(config: &Config, report: &RunReport) -> Result<()> {
    if let Some(path) = &config.output.report_path {
        write_report(path, report).await?;
        info!("Run report written to {:?}", path);
    }

    if let Some(path) = &config.output.metrics_path {
        let text = metrics::encode_metrics()?;
        tokio::fs::write(path, text)
            .await
            .with_context(|| format!("Failed to write metrics to {:?}", path))?;
        info!("Metrics written to {:?}", path);
    }

    Ok(())
}

async fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize run report")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write run report to {:?}", path))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
