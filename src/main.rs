//! Proxyscan Pool Daemon - Entry Point
//!
//! Keeps the proxy pool running and logs every change of its URL list until
//! Ctrl+C or SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proxyscan::config::LogConfig;
use proxyscan::proxy::{EngineSet, HttpProber};
use proxyscan::repository::{ScanStateRepository, StateStore};
use proxyscan::subscription::SubscriptionLoader;
use proxyscan::{Config, Database, PoolDeps, ProxyPool, ShutdownHandle};

/// Upper bound of due retries counted at startup
const RETRY_REPORT_LIMIT: usize = 10_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(&config.log);

    info!("Starting proxyscan pool daemon");

    let db = Database::new(&config.state)
        .await
        .context("Failed to open state database")?;
    db.run_migrations()
        .await
        .context("Failed to run database migrations")?;
    let latency = db
        .health_check()
        .await
        .context("State database health check failed")?;

    let store = ScanStateRepository::from_config(db.pool().clone(), &config.scan);
    let due = store
        .list_due_retry(RETRY_REPORT_LIMIT)
        .await
        .context("Failed to read scan state")?;
    info!(
        domain = store.domain(),
        latency_ms = latency.as_millis() as u64,
        due_retries = due.len(),
        "State database ready"
    );

    let (shutdown_handle, shutdown) = ShutdownHandle::new();

    let engines = EngineSet::from_config(&config.engine);
    info!(
        mode = config.engine.mode.as_str(),
        basic = engines.basic_available(),
        advanced = engines.advanced_available(),
        "Tunnel engines resolved"
    );

    let deps = PoolDeps {
        source: Arc::new(SubscriptionLoader::new(&config.subscription, shutdown)?),
        prober: Arc::new(HttpProber::new(&config.probe)),
        engines,
    };

    let pool = ProxyPool::start(&config, deps)
        .await
        .context("Failed to start proxy pool")?;

    pool.on_update(|urls| {
        info!(count = urls.len(), urls = ?urls, "Proxy pool updated");
    });

    let status = pool.status();
    if status.enabled && status.usable == 0 {
        warn!("Proxy pool has no usable proxies; consumers will run direct");
    }

    shutdown_signal().await;
    info!("Shutdown signal received");

    shutdown_handle.shutdown();
    pool.close().await;
    db.close().await;

    info!("Proxyscan stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("proxyscan={}", log.level).into());
    let registry = tracing_subscriber::registry().with(filter);

    if log.format == "pretty" {
        registry.with(tracing_subscriber::fmt::layer()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
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
