mod config;
mod error;
mod http;
mod ingest;
mod poller;
mod registry;
mod sample;
mod scheduler;
mod sink;

use crate::config::Config;
use crate::ingest::TimestampBounds;
use crate::poller::SnmpPoller;
use crate::registry::{RegistryDefaults, TargetRegistry};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::sink::{InfluxBackend, SinkCommand, SinkHandle, SinkStats, SinkWorkerConfig};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,telemetry_collector=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let stats = Arc::new(SinkStats::new());
    let (tx, rx) = mpsc::channel::<SinkCommand>(config.max_queue);
    let sink = SinkHandle::new(tx, stats.clone());
    let backend = InfluxBackend::new(&config)?;
    let _worker = sink::spawn_worker(backend, rx, stats, SinkWorkerConfig::from_config(&config));

    let registry = Arc::new(TargetRegistry::load(
        &config.targets_path,
        RegistryDefaults::from_config(&config),
    )?);
    let poller = Arc::new(SnmpPoller::new(config.snmp_timeout()));
    let scheduler = Arc::new(Scheduler::new(
        registry.clone(),
        poller,
        sink.clone(),
        SchedulerConfig::from_config(&config),
    ));

    let cancel = CancellationToken::new();
    let tick_handle = scheduler.start(config.tick_interval(), cancel.clone());

    let app = http::router(http::HttpState {
        registry,
        sink: sink.clone(),
        bounds: TimestampBounds::from_config(&config),
    });
    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    tracing::info!(bind = %config.http_bind, "collector HTTP listening");
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = http_handle => {}
    }

    cancel.cancel();
    let _ = tick_handle.await;
    sink.flush().await;

    Ok(())
}
