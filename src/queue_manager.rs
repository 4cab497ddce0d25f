use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch_processor::BatchProcessor;
use crate::config::{Config, ManagerConfig, WorkerConfig};
use crate::error::ManagerError;
use crate::events::{EventBus, QueueEvent};
use crate::generation_queue::GenerationQueueService;
use crate::metrics_collector::{Alert, MetricsCollector, names};
use crate::models::{HealthStatus, QueueHealth, QueueMetrics, WorkerHealth, WorkerMetrics};
use crate::provider::GenerationProvider;
use crate::queue_store::QueueStore;
use crate::queue_worker::QueueWorker;
use crate::rate_limiter::{LimiterKind, RateLimiterRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
  Stopped,
  Starting,
  Running,
  Stopping,
}

impl fmt::Display for ManagerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      ManagerState::Stopped => "stopped",
      ManagerState::Starting => "starting",
      ManagerState::Running => "running",
      ManagerState::Stopping => "stopping",
    })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
  Warning,
  Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
  QueueSize,
  ErrorRate,
  ProcessingTime,
  WorkerHealth,
  /// Forwarded from a metrics collector rule.
  Metric,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
  pub level: AlertLevel,
  pub alert_type: AlertType,
  pub message: String,
  pub data: serde_json::Value,
  pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
  fn new(level: AlertLevel, alert_type: AlertType, message: String, data: serde_json::Value) -> Self {
    Self {
      level,
      alert_type,
      message,
      data,
      timestamp: Utc::now(),
    }
  }

  fn from_metric_alert(alert: &Alert) -> Self {
    Self::new(
      AlertLevel::Warning,
      AlertType::Metric,
      format!(
        "{} is {} ({:?} {})",
        alert.metric_name, alert.value, alert.condition, alert.threshold
      ),
      json!({ "rule_id": alert.rule_id, "alert_id": alert.id, "value": alert.value }),
    )
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
  pub health: WorkerHealth,
  pub metrics: WorkerMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
  pub queue: QueueMetrics,
  pub queue_health: QueueHealth,
  pub workers: Vec<WorkerSnapshot>,
  pub active_batches: usize,
  pub total_processed: u64,
  /// Successful over finished jobs across all workers since start, including
  /// workers since scaled away. 1.0 before any finish.
  pub success_rate: f64,
  pub overall_health: HealthStatus,
  pub timestamp: DateTime<Utc>,
}

impl SystemMetrics {
  pub fn unhealthy_workers(&self) -> usize {
    self
      .workers
      .iter()
      .filter(|w| w.health.status == HealthStatus::Unhealthy)
      .count()
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
  pub name: &'static str,
  pub status: HealthStatus,
  pub details: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
  pub state: ManagerState,
  pub status: HealthStatus,
  pub services: Vec<ServiceHealth>,
  pub started_at: Option<DateTime<Utc>>,
  pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
  pub jobs_removed: usize,
  pub points_removed: usize,
  pub alerts_removed: usize,
}

struct Background {
  shutdown: CancellationToken,
  handles: Vec<JoinHandle<()>>,
}

/// Owns the worker pool and every background task of the queue system.
pub struct QueueManagerService {
  config: ManagerConfig,
  worker_config: WorkerConfig,
  queue: Arc<GenerationQueueService>,
  processor: Arc<BatchProcessor>,
  metrics: Arc<MetricsCollector>,
  limiters: Arc<RateLimiterRegistry>,
  events: EventBus,
  state: Mutex<ManagerState>,
  workers: tokio::sync::Mutex<Vec<Arc<QueueWorker>>>,
  worker_seq: AtomicUsize,
  /// Counters of workers removed by scaling down since the last start.
  retired_workers: Mutex<WorkerMetrics>,
  paused: AtomicBool,
  alert_history: Mutex<VecDeque<AlertEvent>>,
  background: tokio::sync::Mutex<Option<Background>>,
  started_at: Mutex<Option<DateTime<Utc>>>,
}

impl QueueManagerService {
  pub fn new(
    config: ManagerConfig,
    worker_config: WorkerConfig,
    queue: Arc<GenerationQueueService>,
    processor: Arc<BatchProcessor>,
    metrics: Arc<MetricsCollector>,
    limiters: Arc<RateLimiterRegistry>,
    events: EventBus,
  ) -> Self {
    Self {
      config,
      worker_config,
      queue,
      processor,
      metrics,
      limiters,
      events,
      state: Mutex::new(ManagerState::Stopped),
      workers: tokio::sync::Mutex::new(Vec::new()),
      worker_seq: AtomicUsize::new(0),
      retired_workers: Mutex::new(WorkerMetrics::default()),
      paused: AtomicBool::new(false),
      alert_history: Mutex::new(VecDeque::new()),
      background: tokio::sync::Mutex::new(None),
      started_at: Mutex::new(None),
    }
  }

  /// Wires the queue, collector, provider limiter and batch processor from one config.
  pub fn from_config(config: &Config, store: Arc<dyn QueueStore>, provider: Arc<dyn GenerationProvider>) -> Self {
    let queue = Arc::new(GenerationQueueService::new(store, config.queue.clone()));
    let metrics = Arc::new(MetricsCollector::new(config.metrics.clone()));
    let limiters = Arc::new(RateLimiterRegistry::new());
    let limiter = limiters.get_or_create(provider.name(), LimiterKind::TokenBucket, config.provider_rate_limit.clone());
    let processor = Arc::new(BatchProcessor::new(
      provider,
      limiter,
      config.provider_retry.clone(),
      metrics.clone(),
    ));
    Self::new(
      config.manager.clone(),
      config.worker.clone(),
      queue,
      processor,
      metrics,
      limiters,
      EventBus::default(),
    )
  }

  pub fn queue(&self) -> &Arc<GenerationQueueService> {
    &self.queue
  }

  pub fn metrics(&self) -> &Arc<MetricsCollector> {
    &self.metrics
  }

  pub fn limiters(&self) -> &Arc<RateLimiterRegistry> {
    &self.limiters
  }

  pub fn events(&self) -> &EventBus {
    &self.events
  }

  pub fn state(&self) -> ManagerState {
    *self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn set_state(&self, state: ManagerState) {
    *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
  }

  /// Atomically moves `from -> to`, or reports the state that blocked it.
  fn transition(&self, action: &'static str, from: ManagerState, to: ManagerState) -> Result<(), ManagerError> {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    if *state != from {
      return Err(ManagerError::InvalidState {
        action,
        state: state.to_string(),
      });
    }
    *state = to;
    Ok(())
  }

  fn require_running(&self, action: &'static str) -> Result<(), ManagerError> {
    let state = self.state();
    if state != ManagerState::Running {
      return Err(ManagerError::InvalidState {
        action,
        state: state.to_string(),
      });
    }
    Ok(())
  }

  pub fn is_paused(&self) -> bool {
    self.paused.load(Ordering::Acquire)
  }

  pub async fn worker_count(&self) -> usize {
    self.workers.lock().await.len()
  }

  pub async fn start(self: &Arc<Self>) -> Result<(), ManagerError> {
    self.transition("start", ManagerState::Stopped, ManagerState::Starting)?;
    info!("Queue manager starting with {} workers", self.config.worker_count);

    if let Err(e) = self.start_components().await {
      error!("Queue manager failed to start: {}", e);
      self.teardown().await;
      self.set_state(ManagerState::Stopped);
      return Err(e);
    }

    let now = Utc::now();
    *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
    self.set_state(ManagerState::Running);
    self.events.publish(QueueEvent::SystemStarted {
      workers: self.config.worker_count,
      at: now,
    });
    info!("Queue manager running");
    Ok(())
  }

  async fn start_components(self: &Arc<Self>) -> Result<(), ManagerError> {
    if self.config.worker_count == 0 || self.config.worker_count > self.config.max_workers {
      return Err(ManagerError::InvalidWorkerCount {
        requested: self.config.worker_count,
        max: self.config.max_workers,
      });
    }
    let zero = self
      .worker_config
      .zero_interval()
      .or_else(|| self.metrics.config().zero_interval())
      .or_else(|| self.config.zero_interval());
    if let Some(name) = zero {
      return Err(ManagerError::ZeroInterval(name));
    }
    self.queue.initialize().await?;
    self.paused.store(false, Ordering::Release);
    *self.retired_workers.lock().unwrap_or_else(PoisonError::into_inner) = WorkerMetrics::default();

    let mut workers = self.workers.lock().await;
    for _ in 0..self.config.worker_count {
      let worker = self.spawn_worker();
      worker.start().await;
      workers.push(worker);
    }
    drop(workers);

    self.spawn_background().await;
    Ok(())
  }

  /// Stops workers (draining in-flight jobs), background tasks and the queue.
  /// Stopping a stopped manager is a no-op.
  pub async fn stop(&self) -> Result<(), ManagerError> {
    {
      let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
      match *state {
        ManagerState::Stopped | ManagerState::Stopping => return Ok(()),
        ManagerState::Starting => {
          return Err(ManagerError::InvalidState {
            action: "stop",
            state: state.to_string(),
          });
        }
        ManagerState::Running => *state = ManagerState::Stopping,
      }
    }
    info!("Queue manager stopping");
    self.teardown().await;
    self.set_state(ManagerState::Stopped);
    self.events.publish(QueueEvent::SystemStopped { at: Utc::now() });
    info!("Queue manager stopped");
    Ok(())
  }

  /// Best-effort release of everything `start` may have acquired.
  async fn teardown(&self) {
    if let Some(background) = self.background.lock().await.take() {
      background.shutdown.cancel();
      for result in join_all(background.handles).await {
        if let Err(e) = result {
          error!("Background task ended abnormally: {}", e);
        }
      }
    }

    let workers = std::mem::take(&mut *self.workers.lock().await);
    join_all(workers.iter().map(|w| w.stop())).await;

    if let Err(e) = self.queue.shutdown().await {
      warn!("Queue shutdown failed: {}", e);
    }
  }

  fn spawn_worker(&self) -> Arc<QueueWorker> {
    let seq = self.worker_seq.fetch_add(1, Ordering::SeqCst) + 1;
    Arc::new(QueueWorker::new(
      format!("worker-{}", seq),
      self.queue.clone(),
      self.processor.clone(),
      self.metrics.clone(),
      self.events.clone(),
      self.worker_config.clone(),
    ))
  }

  /// Adds workers or gracefully stops the newest ones until exactly `count` remain.
  pub async fn scale_workers(&self, count: usize) -> Result<(), ManagerError> {
    self.require_running("scale workers")?;
    if count == 0 || count > self.config.max_workers {
      return Err(ManagerError::InvalidWorkerCount {
        requested: count,
        max: self.config.max_workers,
      });
    }

    let mut workers = self.workers.lock().await;
    let from = workers.len();
    if count > from {
      for _ in from..count {
        let worker = self.spawn_worker();
        if !self.is_paused() {
          worker.start().await;
        }
        workers.push(worker);
      }
    } else if count < from {
      let removed = workers.split_off(count);
      drop(workers);
      info!("Draining {} workers", removed.len());
      join_all(removed.iter().map(|w| w.stop())).await;
      let mut retired = self.retired_workers.lock().unwrap_or_else(PoisonError::into_inner);
      for worker in &removed {
        retired.absorb(&worker.metrics());
      }
    }

    if from != count {
      info!("Scaled workers from {} to {}", from, count);
      self.events.publish(QueueEvent::WorkersScaled { from, to: count });
    }
    Ok(())
  }

  /// Stops every worker without touching queued jobs.
  pub async fn pause_processing(&self) -> Result<(), ManagerError> {
    self.require_running("pause processing")?;
    if self.paused.swap(true, Ordering::AcqRel) {
      return Ok(());
    }
    let workers = self.workers.lock().await.clone();
    join_all(workers.iter().map(|w| w.stop())).await;
    info!("Processing paused ({} workers stopped)", workers.len());
    Ok(())
  }

  pub async fn resume_processing(&self) -> Result<(), ManagerError> {
    self.require_running("resume processing")?;
    if !self.paused.swap(false, Ordering::AcqRel) {
      return Ok(());
    }
    let workers = self.workers.lock().await.clone();
    for worker in &workers {
      worker.start().await;
    }
    info!("Processing resumed ({} workers started)", workers.len());
    Ok(())
  }

  pub async fn get_system_metrics(&self) -> Result<SystemMetrics, ManagerError> {
    let queue = self.queue.get_metrics().await?;
    let queue_health = self.queue.get_health_status().await;
    let workers = self.workers.lock().await.clone();

    let mut snapshots = Vec::with_capacity(workers.len());
    for worker in &workers {
      snapshots.push(WorkerSnapshot {
        health: worker.health().await,
        metrics: worker.metrics(),
      });
    }

    let mut totals = self.retired_workers.lock().unwrap_or_else(PoisonError::into_inner).clone();
    for snapshot in &snapshots {
      totals.absorb(&snapshot.metrics);
    }
    let total_processed = totals.processed;
    let success_rate = if totals.successful + totals.failed > 0 {
      totals.successful as f64 / (totals.successful + totals.failed) as f64
    } else {
      1.0
    };

    let worst_worker = snapshots.iter().map(|s| s.health.status).max().unwrap_or(HealthStatus::Healthy);
    let overall_health = if worst_worker == HealthStatus::Unhealthy || !queue_health.is_healthy {
      HealthStatus::Unhealthy
    } else if worst_worker == HealthStatus::Degraded || queue_health.queue_size > self.config.degraded_queue_size {
      HealthStatus::Degraded
    } else {
      HealthStatus::Healthy
    };

    Ok(SystemMetrics {
      queue,
      queue_health,
      workers: snapshots,
      active_batches: self.processor.active_batches(),
      total_processed,
      success_rate,
      overall_health,
      timestamp: Utc::now(),
    })
  }

  /// Compares current metrics against the configured thresholds and raises
  /// an alert per breach.
  pub async fn check_alert_thresholds(&self) -> Result<Vec<AlertEvent>, ManagerError> {
    let metrics = self.get_system_metrics().await?;
    let thresholds = &self.config.alert_thresholds;
    let mut raised = Vec::new();

    let queue_size = metrics.queue.queue_size();
    if queue_size > thresholds.max_queue_size {
      raised.push(AlertEvent::new(
        AlertLevel::Warning,
        AlertType::QueueSize,
        format!("Queue size {} exceeds {}", queue_size, thresholds.max_queue_size),
        json!({ "queue_size": queue_size, "threshold": thresholds.max_queue_size }),
      ));
    }

    let error_rate = 1.0 - metrics.success_rate;
    if error_rate > thresholds.max_error_rate {
      raised.push(AlertEvent::new(
        AlertLevel::Critical,
        AlertType::ErrorRate,
        format!("Error rate {:.1}% exceeds {:.1}%", error_rate * 100.0, thresholds.max_error_rate * 100.0),
        json!({ "error_rate": error_rate, "threshold": thresholds.max_error_rate }),
      ));
    }

    let processing_ms = metrics.queue.average_processing_time_ms;
    if processing_ms > thresholds.max_average_processing_time_ms {
      raised.push(AlertEvent::new(
        AlertLevel::Warning,
        AlertType::ProcessingTime,
        format!(
          "Average processing time {:.0}ms exceeds {:.0}ms",
          processing_ms, thresholds.max_average_processing_time_ms
        ),
        json!({ "average_processing_time_ms": processing_ms, "threshold": thresholds.max_average_processing_time_ms }),
      ));
    }

    let unhealthy = metrics.unhealthy_workers();
    if unhealthy > thresholds.max_unhealthy_workers {
      raised.push(AlertEvent::new(
        AlertLevel::Critical,
        AlertType::WorkerHealth,
        format!("{} unhealthy workers", unhealthy),
        json!({ "unhealthy_workers": unhealthy, "threshold": thresholds.max_unhealthy_workers }),
      ));
    }

    for alert in &raised {
      self.raise_alert(alert.clone());
    }
    Ok(raised)
  }

  fn raise_alert(&self, alert: AlertEvent) {
    match alert.level {
      AlertLevel::Critical => error!("ALERT {:?}: {}", alert.alert_type, alert.message),
      AlertLevel::Warning => warn!("ALERT {:?}: {}", alert.alert_type, alert.message),
    }
    {
      let mut history = self.alert_history.lock().unwrap_or_else(PoisonError::into_inner);
      history.push_back(alert.clone());
      while history.len() > self.config.alert_history_limit {
        history.pop_front();
      }
    }
    self.events.publish(QueueEvent::Alert(alert));
  }

  /// Most recent alerts, oldest first.
  pub fn get_alert_history(&self, limit: Option<usize>) -> Vec<AlertEvent> {
    let history = self.alert_history.lock().unwrap_or_else(PoisonError::into_inner);
    let skip = limit.map_or(0, |limit| history.len().saturating_sub(limit));
    history.iter().skip(skip).cloned().collect()
  }

  pub async fn get_system_health(&self) -> SystemHealth {
    let state = self.state();
    let mut services = Vec::new();

    let queue_health = self.queue.get_health_status().await;
    services.push(ServiceHealth {
      name: "queue",
      status: if queue_health.is_healthy {
        HealthStatus::Healthy
      } else {
        HealthStatus::Unhealthy
      },
      details: json!({ "queue_size": queue_health.queue_size }),
    });

    let workers = self.workers.lock().await.clone();
    let mut worker_statuses = Vec::with_capacity(workers.len());
    for worker in &workers {
      worker_statuses.push(worker.health().await);
    }
    let running = worker_statuses.iter().filter(|w| w.running).count();
    let workers_status = if running == 0 && !self.is_paused() {
      HealthStatus::Unhealthy
    } else {
      worker_statuses.iter().map(|w| w.status).max().unwrap_or(HealthStatus::Healthy)
    };
    services.push(ServiceHealth {
      name: "workers",
      status: workers_status,
      details: json!({ "total": workers.len(), "running": running, "paused": self.is_paused() }),
    });

    let active_alerts = self.metrics.active_alerts().len();
    services.push(ServiceHealth {
      name: "metrics",
      status: if active_alerts > 0 {
        HealthStatus::Degraded
      } else {
        HealthStatus::Healthy
      },
      details: json!({ "active_alerts": active_alerts, "series": self.metrics.series_names().len() }),
    });

    let limiters = self.limiters.summaries();
    services.push(ServiceHealth {
      name: "rate_limiters",
      status: HealthStatus::Healthy,
      details: json!(
        limiters
          .iter()
          .map(|l| json!({ "name": l.name, "kind": format!("{:?}", l.kind), "tracked": l.tracked_identifiers }))
          .collect::<Vec<_>>()
      ),
    });

    let worst = services.iter().map(|s| s.status).max().unwrap_or(HealthStatus::Healthy);
    SystemHealth {
      state,
      status: if state == ManagerState::Running {
        worst
      } else {
        HealthStatus::Unhealthy
      },
      services,
      started_at: *self.started_at.lock().unwrap_or_else(PoisonError::into_inner),
      timestamp: Utc::now(),
    }
  }

  /// Removes old terminal jobs, expired metric points and stale resolved alerts.
  pub async fn run_cleanup(&self) -> Result<CleanupReport, ManagerError> {
    let jobs_removed = self.queue.cleanup(self.config.cleanup_days_old).await?;
    let metrics = self.metrics.cleanup();
    let report = CleanupReport {
      jobs_removed,
      points_removed: metrics.points_removed,
      alerts_removed: metrics.alerts_removed,
    };
    info!(
      "Cleanup removed {} jobs, {} metric points, {} alerts",
      report.jobs_removed, report.points_removed, report.alerts_removed
    );
    self.events.publish(QueueEvent::CleanupCompleted {
      jobs_removed: report.jobs_removed,
      points_removed: report.points_removed,
      alerts_removed: report.alerts_removed,
    });
    Ok(report)
  }

  /// Samples system metrics into the collector and broadcasts them.
  async fn publish_metrics(&self) -> Result<(), ManagerError> {
    let snapshot = self.get_system_metrics().await?;
    self.metrics.record(names::QUEUE_SIZE, snapshot.queue.queue_size() as f64, "jobs");
    self.metrics.record(names::QUEUE_ERROR_RATE, 1.0 - snapshot.success_rate, "ratio");
    let active = snapshot.workers.iter().filter(|w| w.health.running).count();
    self.metrics.record(names::WORKERS_ACTIVE, active as f64, "workers");
    self.events.publish(QueueEvent::MetricsUpdated(Box::new(snapshot)));
    Ok(())
  }

  async fn spawn_background(self: &Arc<Self>) {
    let shutdown = CancellationToken::new();
    let mut handles = vec![
      self.spawn_periodic("health check", self.config.health_check_interval, shutdown.clone(), |manager| async move {
        manager.check_alert_thresholds().await.map(|_| ())
      }),
      self.spawn_periodic("cleanup", self.config.cleanup_interval, shutdown.clone(), |manager| async move {
        manager.run_cleanup().await.map(|_| ())
      }),
      self.spawn_periodic("metrics", self.config.metrics_interval, shutdown.clone(), |manager| async move {
        manager.publish_metrics().await
      }),
      self.metrics.spawn_aggregation(shutdown.clone()),
      self.limiters.spawn_sweeper(self.config.limiter_sweep_interval, shutdown.clone()),
    ];
    handles.push(self.spawn_alert_forwarder(shutdown.clone()));

    *self.background.lock().await = Some(Background { shutdown, handles });
    debug!("Queue manager background tasks started");
  }

  fn spawn_periodic<F, Fut>(
    self: &Arc<Self>,
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    task: F,
  ) -> JoinHandle<()>
  where
    F: Fn(Arc<Self>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), ManagerError>> + Send + 'static,
  {
    let manager = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.tick().await;
      loop {
        tokio::select! {
          _ = shutdown.cancelled() => break,
          _ = ticker.tick() => {
            if let Err(e) = task(manager.clone()).await {
              warn!("Background {} failed: {}", name, e);
            }
          }
        }
      }
      debug!("Background {} stopped", name);
    })
  }

  /// Surfaces collector rule alerts as manager alerts.
  fn spawn_alert_forwarder(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
    let manager = self.clone();
    let mut alerts = self.metrics.subscribe_alerts();
    tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = shutdown.cancelled() => break,
          received = alerts.recv() => match received {
            Ok(alert) => manager.raise_alert(AlertEvent::from_metric_alert(&alert)),
            Err(RecvError::Lagged(skipped)) => warn!("Alert forwarder skipped {} alerts", skipped),
            Err(RecvError::Closed) => break,
          },
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{MetricsConfig, QueueConfiguration, RateLimiterConfig, RetryConfig};
  use crate::error::StoreError;
  use crate::models::{GenerationJob, GenerationPrompt, GenerationRequest, JobPayload, JobQuery, JobStatus};
  use crate::provider::SimulatedProvider;
  use crate::queue_store::InMemoryQueueStore;
  use async_trait::async_trait;
  use tokio::sync::broadcast;
  use uuid::Uuid;

  fn fast_retry() -> RetryConfig {
    RetryConfig {
      max_attempts: 2,
      base_delay_ms: 10,
      max_delay_ms: 50,
      backoff_multiplier: 2.0,
      jitter_factor: 0.0,
    }
  }

  fn test_config(manager: ManagerConfig) -> Config {
    Config {
      queue: QueueConfiguration::default(),
      provider_retry: fast_retry(),
      provider_rate_limit: RateLimiterConfig::new(1000, 1000),
      worker: WorkerConfig {
        concurrency: 2,
        poll_interval: Duration::from_millis(20),
        job_retry: fast_retry(),
        ..WorkerConfig::default()
      },
      metrics: MetricsConfig::default(),
      manager,
    }
  }

  fn manager_with(manager: ManagerConfig) -> Arc<QueueManagerService> {
    let provider = Arc::new(SimulatedProvider::new(Duration::from_millis(20)));
    Arc::new(QueueManagerService::from_config(
      &test_config(manager),
      Arc::new(InMemoryQueueStore::new()),
      provider,
    ))
  }

  fn manager() -> Arc<QueueManagerService> {
    manager_with(ManagerConfig::default())
  }

  fn single(prompt: &str) -> GenerationRequest {
    GenerationRequest::new(JobPayload::Single {
      prompt: GenerationPrompt::new(prompt),
    })
  }

  async fn next_matching(rx: &mut broadcast::Receiver<QueueEvent>, name: &str) -> QueueEvent {
    loop {
      let event = rx.recv().await.unwrap();
      if event.name() == name {
        return event;
      }
    }
  }

  /// A store whose backend never comes up.
  struct UnreachableStore;

  #[async_trait]
  impl QueueStore for UnreachableStore {
    async fn connect(&self) -> Result<(), StoreError> {
      Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn insert_bounded(&self, _job: GenerationJob, _capacity: usize) -> Result<(), StoreError> {
      Err(StoreError::Closed)
    }
    async fn get(&self, _id: Uuid) -> Result<Option<GenerationJob>, StoreError> {
      Err(StoreError::Closed)
    }
    async fn claim_next(&self, _worker_id: &str, _now: DateTime<Utc>) -> Result<Option<GenerationJob>, StoreError> {
      Err(StoreError::Closed)
    }
    async fn compare_and_swap(&self, _expected: JobStatus, _job: GenerationJob) -> Result<bool, StoreError> {
      Err(StoreError::Closed)
    }
    async fn list_by_user(&self, _user_id: &str, _query: &JobQuery) -> Result<Vec<GenerationJob>, StoreError> {
      Err(StoreError::Closed)
    }
    async fn snapshot(&self) -> Result<Vec<GenerationJob>, StoreError> {
      Err(StoreError::Closed)
    }
    async fn count_waiting(&self) -> Result<usize, StoreError> {
      Err(StoreError::Closed)
    }
    async fn remove_terminal_before(&self, _cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
      Err(StoreError::Closed)
    }
    async fn close(&self) -> Result<(), StoreError> {
      Ok(())
    }
  }

  #[tokio::test(start_paused = true)]
  async fn start_and_stop_walk_the_state_machine() {
    let manager = manager();
    let mut rx = manager.events().subscribe();
    assert_eq!(manager.state(), ManagerState::Stopped);

    manager.start().await.unwrap();
    assert_eq!(manager.state(), ManagerState::Running);
    assert_eq!(manager.worker_count().await, 2);
    assert!(matches!(rx.recv().await.unwrap(), QueueEvent::SystemStarted { workers: 2, .. }));
    assert!(matches!(manager.start().await, Err(ManagerError::InvalidState { action: "start", .. })));

    manager.stop().await.unwrap();
    assert_eq!(manager.state(), ManagerState::Stopped);
    assert_eq!(manager.worker_count().await, 0);
    next_matching(&mut rx, "systemStopped").await;
    manager.stop().await.unwrap();

    manager.start().await.unwrap();
    assert_eq!(manager.state(), ManagerState::Running);
    manager.stop().await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn failed_start_releases_everything() {
    let provider = Arc::new(SimulatedProvider::new(Duration::from_millis(10)));
    let manager = Arc::new(QueueManagerService::from_config(
      &test_config(ManagerConfig::default()),
      Arc::new(UnreachableStore),
      provider,
    ));

    let err = manager.start().await.unwrap_err();
    assert!(matches!(err, ManagerError::Queue(_)));
    assert_eq!(manager.state(), ManagerState::Stopped);
    assert_eq!(manager.worker_count().await, 0);
    assert!(manager.background.lock().await.is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn scale_workers_reaches_exact_count() {
    let manager = manager();
    manager.start().await.unwrap();
    let mut rx = manager.events().subscribe();

    manager.scale_workers(5).await.unwrap();
    assert_eq!(manager.worker_count().await, 5);
    assert!(matches!(rx.recv().await.unwrap(), QueueEvent::WorkersScaled { from: 2, to: 5 }));

    manager.scale_workers(1).await.unwrap();
    assert_eq!(manager.worker_count().await, 1);
    assert!(matches!(rx.recv().await.unwrap(), QueueEvent::WorkersScaled { from: 5, to: 1 }));

    assert!(matches!(
      manager.scale_workers(0).await,
      Err(ManagerError::InvalidWorkerCount { requested: 0, .. })
    ));
    assert!(matches!(
      manager.scale_workers(33).await,
      Err(ManagerError::InvalidWorkerCount { requested: 33, max: 32 })
    ));
    manager.stop().await.unwrap();
    assert!(matches!(manager.scale_workers(2).await, Err(ManagerError::InvalidState { .. })));
  }

  #[tokio::test(start_paused = true)]
  async fn scaling_down_drains_in_flight_jobs() {
    let manager = manager_with(ManagerConfig {
      worker_count: 4,
      ..ManagerConfig::default()
    });
    manager.start().await.unwrap();
    let mut rx = manager.events().subscribe();
    let mut ids = Vec::new();
    for prompt in ["paladin", "ranger", "monk", "druid"] {
      ids.push(manager.queue().enqueue(single(prompt)).await.unwrap());
    }
    next_matching(&mut rx, "jobStarted").await;

    manager.scale_workers(1).await.unwrap();
    manager.stop().await.unwrap();
    manager.queue().initialize().await.unwrap();
    for id in ids {
      let job = manager.queue().get_job(id).await.unwrap().unwrap();
      assert_ne!(job.status, JobStatus::Processing);
    }
  }

  #[tokio::test(start_paused = true)]
  async fn totals_survive_scaling_down() {
    let manager = manager_with(ManagerConfig {
      worker_count: 3,
      ..ManagerConfig::default()
    });
    manager.start().await.unwrap();
    let mut rx = manager.events().subscribe();
    for prompt in ["bard", "cleric", "rogue", "sorcerer", "warlock", "fighter"] {
      manager.queue().enqueue(single(prompt)).await.unwrap();
    }
    for _ in 0..6 {
      next_matching(&mut rx, "jobCompleted").await;
    }
    let before = manager.get_system_metrics().await.unwrap();
    assert_eq!(before.total_processed, 6);

    manager.scale_workers(1).await.unwrap();
    let after = manager.get_system_metrics().await.unwrap();
    assert_eq!(after.workers.len(), 1);
    assert_eq!(after.total_processed, 6);
    assert_eq!(after.success_rate, 1.0);
    assert!(manager.check_alert_thresholds().await.unwrap().is_empty());
    manager.stop().await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn zero_intervals_are_refused_at_start() {
    let manager = manager_with(ManagerConfig {
      health_check_interval: Duration::ZERO,
      ..ManagerConfig::default()
    });
    let err = manager.start().await.unwrap_err();
    assert!(matches!(err, ManagerError::ZeroInterval("manager.health_check_interval")));
    assert_eq!(manager.state(), ManagerState::Stopped);
    assert_eq!(manager.worker_count().await, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn pause_keeps_jobs_queued_until_resume() {
    let manager = manager();
    manager.start().await.unwrap();
    manager.pause_processing().await.unwrap();
    assert!(manager.is_paused());

    let mut rx = manager.events().subscribe();
    let id = manager.queue().enqueue(single("sleeping wizard")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let job = manager.queue().get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);

    manager.resume_processing().await.unwrap();
    let done = next_matching(&mut rx, "jobCompleted").await;
    assert!(matches!(done, QueueEvent::JobCompleted { job_id, .. } if job_id == id));
    manager.stop().await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn threshold_alerts_are_raised_and_history_is_bounded() {
    let mut config = ManagerConfig {
      alert_history_limit: 2,
      ..ManagerConfig::default()
    };
    config.alert_thresholds.max_queue_size = 1;
    let manager = manager_with(config);
    manager.start().await.unwrap();
    manager.pause_processing().await.unwrap();
    for prompt in ["a", "b", "c"] {
      manager.queue().enqueue(single(prompt)).await.unwrap();
    }
    let mut rx = manager.events().subscribe();

    for _ in 0..3 {
      let raised = manager.check_alert_thresholds().await.unwrap();
      assert_eq!(raised.len(), 1);
      assert_eq!(raised[0].alert_type, AlertType::QueueSize);
      assert_eq!(raised[0].data["queue_size"], 3);
    }
    assert!(matches!(rx.recv().await.unwrap(), QueueEvent::Alert(_)));
    assert_eq!(manager.get_alert_history(None).len(), 2);
    assert_eq!(manager.get_alert_history(Some(1)).len(), 1);
    manager.stop().await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn large_backlog_degrades_overall_health() {
    let manager = manager_with(ManagerConfig {
      degraded_queue_size: 1,
      ..ManagerConfig::default()
    });
    manager.start().await.unwrap();
    let metrics = manager.get_system_metrics().await.unwrap();
    assert_eq!(metrics.overall_health, HealthStatus::Healthy);
    assert_eq!(metrics.success_rate, 1.0);

    manager.pause_processing().await.unwrap();
    manager.queue().enqueue(single("x")).await.unwrap();
    manager.queue().enqueue(single("y")).await.unwrap();
    let metrics = manager.get_system_metrics().await.unwrap();
    assert_eq!(metrics.overall_health, HealthStatus::Degraded);
    assert_eq!(metrics.workers.len(), 2);

    let health = manager.get_system_health().await;
    assert_eq!(health.state, ManagerState::Running);
    assert!(health.services.iter().any(|s| s.name == "workers"));
    manager.stop().await.unwrap();
    assert_eq!(manager.get_system_health().await.status, HealthStatus::Unhealthy);
  }

  #[tokio::test(start_paused = true)]
  async fn cleanup_reports_and_publishes() {
    let manager = manager();
    manager.start().await.unwrap();
    let mut rx = manager.events().subscribe();

    let report = manager.run_cleanup().await.unwrap();
    assert_eq!(report.jobs_removed, 0);
    assert!(matches!(
      next_matching(&mut rx, "cleanupCompleted").await,
      QueueEvent::CleanupCompleted { jobs_removed: 0, .. }
    ));
    manager.stop().await.unwrap();
  }
}
