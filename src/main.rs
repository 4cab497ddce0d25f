use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use genqueue::config::Config;
use genqueue::events::QueueEvent;
use genqueue::provider::SimulatedProvider;
use genqueue::queue_manager::QueueManagerService;
use genqueue::queue_store::InMemoryQueueStore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = Config::from_env()?;
  let latency_ms = std::env::var("GENQ_SIMULATED_LATENCY_MS")
    .ok()
    .and_then(|v| v.parse().ok())
    .unwrap_or(250);
  let latency = Duration::from_millis(latency_ms);
  let provider = Arc::new(SimulatedProvider::new(latency));
  let manager = Arc::new(QueueManagerService::from_config(
    &config,
    Arc::new(InMemoryQueueStore::new()),
    provider,
  ));

  let events = manager.events().stream();
  let logger = tokio::spawn(async move {
    tokio::pin!(events);
    while let Some(event) = events.next().await {
      match &event {
        QueueEvent::Alert(alert) => warn!("alert: {}", alert.message),
        QueueEvent::JobFailed { job_id, error, .. } => warn!("job {} failed: {}", job_id, error.message),
        other => info!("event {}", other.name()),
      }
    }
  });

  manager.start().await?;
  info!("genqueue worker running; press Ctrl-C to stop");

  if let Err(e) = tokio::signal::ctrl_c().await {
    error!("Failed to listen for shutdown signal: {}", e);
  }
  info!("Shutdown requested");
  manager.stop().await?;
  logger.abort();
  Ok(())
}
