use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch_processor::{BatchFailure, BatchProcessor, JobControl};
use crate::config::WorkerConfig;
use crate::error::GenerationError;
use crate::events::{EventBus, QueueEvent};
use crate::generation_queue::GenerationQueueService;
use crate::metrics_collector::{MetricsCollector, names, tags};
use crate::models::{GenerationJob, GenerationOutput, HealthStatus, JobError, JobStatus, WorkerHealth, WorkerMetrics};
use crate::retry_handler::{RetryHandler, RetryOptions, Retryable};

/// Why a single processing attempt of a job ended without results.
#[derive(Debug, Clone)]
enum AttemptFailure {
  /// The batch already retried its provider calls; not retried again.
  Batch(BatchFailure),
  TimedOut(Duration),
}

impl AttemptFailure {
  fn generation_error(&self) -> GenerationError {
    match self {
      AttemptFailure::Batch(failure) => failure.error.clone(),
      AttemptFailure::TimedOut(limit) => GenerationError::Timeout {
        timeout_ms: limit.as_millis() as u64,
      },
    }
  }
}

impl fmt::Display for AttemptFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      AttemptFailure::Batch(failure) => fmt::Display::fmt(failure, f),
      AttemptFailure::TimedOut(limit) => write!(f, "attempt exceeded {:?}", limit),
    }
  }
}

impl Retryable for AttemptFailure {
  fn is_retryable(&self) -> bool {
    matches!(self, AttemptFailure::TimedOut(_))
  }
}

struct QueueJobControl<'a> {
  queue: &'a GenerationQueueService,
  job_id: Uuid,
}

#[async_trait]
impl JobControl for QueueJobControl<'_> {
  async fn is_cancelled(&self) -> bool {
    match self.queue.is_cancelled(self.job_id).await {
      Ok(cancelled) => cancelled,
      Err(e) => {
        warn!("Could not check cancellation of job {}: {}", self.job_id, e);
        false
      }
    }
  }

  async fn report_progress(&self, progress: u8) {
    if let Err(e) = self.queue.update_progress(self.job_id, progress).await {
      debug!("Progress update for job {} dropped: {}", self.job_id, e);
    }
  }
}

#[derive(Default)]
struct WorkerStats {
  processed: AtomicU64,
  successful: AtomicU64,
  failed: AtomicU64,
  retried: AtomicU64,
  total_processing_ms: AtomicU64,
}

struct WorkerRun {
  shutdown: CancellationToken,
  handle: JoinHandle<()>,
}

/// Polls the queue and runs claimed jobs through the batch processor.
pub struct QueueWorker {
  id: String,
  queue: Arc<GenerationQueueService>,
  processor: Arc<BatchProcessor>,
  metrics: Arc<MetricsCollector>,
  events: EventBus,
  config: WorkerConfig,
  job_retry: RetryHandler,
  stats: WorkerStats,
  /// Recent outcomes, `true` for success, capped at `health_window`.
  recent: Mutex<VecDeque<bool>>,
  active_jobs: AtomicUsize,
  running: AtomicBool,
  last_activity: Mutex<Option<DateTime<Utc>>>,
  run: tokio::sync::Mutex<Option<WorkerRun>>,
}

impl QueueWorker {
  pub fn new(
    id: impl Into<String>,
    queue: Arc<GenerationQueueService>,
    processor: Arc<BatchProcessor>,
    metrics: Arc<MetricsCollector>,
    events: EventBus,
    config: WorkerConfig,
  ) -> Self {
    let job_retry = RetryHandler::new(config.job_retry.clone());
    Self {
      id: id.into(),
      queue,
      processor,
      metrics,
      events,
      config,
      job_retry,
      stats: WorkerStats::default(),
      recent: Mutex::new(VecDeque::new()),
      active_jobs: AtomicUsize::new(0),
      running: AtomicBool::new(false),
      last_activity: Mutex::new(None),
      run: tokio::sync::Mutex::new(None),
    }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::Acquire)
  }

  pub fn active_jobs(&self) -> usize {
    self.active_jobs.load(Ordering::SeqCst)
  }

  /// Starts the polling loop. Returns `false` if it was already running.
  pub async fn start(self: &Arc<Self>) -> bool {
    let mut run = self.run.lock().await;
    if run.is_some() {
      return false;
    }
    let shutdown = CancellationToken::new();
    let worker = self.clone();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { worker.poll_loop(token).await });
    *run = Some(WorkerRun { shutdown, handle });
    self.running.store(true, Ordering::Release);
    info!("Worker {} started (concurrency {})", self.id, self.config.concurrency);
    true
  }

  /// Stops polling and waits for in-flight jobs to finish. Returns `false`
  /// if the worker was not running.
  pub async fn stop(&self) -> bool {
    let Some(run) = self.run.lock().await.take() else {
      return false;
    };
    info!("Worker {} stopping, draining {} active jobs", self.id, self.active_jobs());
    run.shutdown.cancel();
    if let Err(e) = run.handle.await {
      error!("Worker {} loop ended abnormally: {}", self.id, e);
    }
    self.running.store(false, Ordering::Release);
    info!("Worker {} stopped", self.id);
    true
  }

  async fn poll_loop(self: Arc<Self>, shutdown: CancellationToken) {
    let concurrency = self.config.concurrency.max(1);
    let slots = Arc::new(Semaphore::new(concurrency));

    while !shutdown.is_cancelled() {
      while let Ok(permit) = slots.clone().try_acquire_owned() {
        match self.queue.dequeue(&self.id).await {
          Ok(Some(job)) => {
            let worker = self.clone();
            tokio::spawn(async move {
              worker.handle_job(job).await;
              drop(permit);
            });
          }
          Ok(None) => break,
          Err(e) => {
            warn!("Worker {} failed to poll the queue: {}", self.id, e);
            break;
          }
        }
      }

      let saturated = slots.available_permits() == 0;
      tokio::select! {
        _ = shutdown.cancelled() => break,
        _ = async {
          if saturated {
            let _ = slots.acquire().await;
          } else {
            sleep(self.config.poll_interval).await;
          }
        } => {}
      }
    }

    // Every permit back means every spawned job has finished.
    if let Err(e) = slots.acquire_many(concurrency as u32).await {
      error!("Worker {} could not drain: {}", self.id, e);
    }
    debug!("Worker {} poll loop exited", self.id);
  }

  async fn handle_job(self: Arc<Self>, job: GenerationJob) {
    let started = Instant::now();
    self.active_jobs.fetch_add(1, Ordering::SeqCst);
    self.touch();
    info!("Worker {} processing job {} (attempt {})", self.id, job.id, job.attempts);
    self.events.publish(QueueEvent::JobStarted {
      job_id: job.id,
      worker_id: self.id.clone(),
      attempt: job.attempts,
    });

    let control = QueueJobControl {
      queue: &self.queue,
      job_id: job.id,
    };
    let observer = self.clone();
    let job_id = job.id;
    let options = RetryOptions::named(format!("job {}", job.id)).on_retry(move |failure: &AttemptFailure, attempt, delay| {
      observer.stats.retried.fetch_add(1, Ordering::Relaxed);
      observer.metrics.record_metric(names::JOB_RETRIED, 1.0, "count", tags([("worker", observer.id.as_str())]));
      observer.events.publish(QueueEvent::JobRetried {
        job_id,
        worker_id: observer.id.clone(),
        attempt: attempt + 1,
        delay_ms: delay.as_millis() as u64,
        reason: failure.to_string(),
      });
    });

    let details = self
      .job_retry
      .execute_with_details(|_| self.attempt(&job, &control), options)
      .await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match details.result {
      Ok(outputs) => self.finish_success(&job, outputs, elapsed_ms).await,
      Err(err) => {
        let retry_count = err.attempt.saturating_sub(1);
        let job_error = JobError::from_generation(&err.original_error.generation_error(), retry_count);
        self.finish_failure(&job, job_error, elapsed_ms).await;
      }
    }
    self.active_jobs.fetch_sub(1, Ordering::SeqCst);
    self.touch();
  }

  async fn attempt(&self, job: &GenerationJob, control: &dyn JobControl) -> Result<Vec<GenerationOutput>, AttemptFailure> {
    match timeout(self.config.job_timeout, self.processor.process(job, control)).await {
      Ok(result) => result.map_err(AttemptFailure::Batch),
      Err(_) => {
        warn!("Job {} exceeded {:?}", job.id, self.config.job_timeout);
        Err(AttemptFailure::TimedOut(self.config.job_timeout))
      }
    }
  }

  async fn finish_success(&self, job: &GenerationJob, outputs: Vec<GenerationOutput>, elapsed_ms: u64) {
    match self.queue.complete_job(job.id, outputs).await {
      Ok(Some(done)) => {
        info!("Worker {} completed job {} in {}ms", self.id, job.id, elapsed_ms);
        self.record_outcome(true, elapsed_ms);
        self.metrics.record_metric(names::JOB_COMPLETED, 1.0, "count", tags([("worker", self.id.as_str())]));
        self.metrics.record_metric(names::JOB_DURATION_MS, elapsed_ms as f64, "ms", tags([("worker", self.id.as_str())]));
        self.events.publish(QueueEvent::JobCompleted {
          job_id: job.id,
          worker_id: self.id.clone(),
          duration_ms: elapsed_ms,
          outputs: done.results.len(),
        });
      }
      Ok(None) => self.publish_cancelled(job),
      Err(e) => {
        error!("Worker {} could not record completion of job {}: {}", self.id, job.id, e);
        self.record_outcome(false, elapsed_ms);
      }
    }
  }

  async fn finish_failure(&self, job: &GenerationJob, job_error: JobError, elapsed_ms: u64) {
    match self.queue.fail_job(job.id, job_error.clone()).await {
      Ok(Some(_)) => {
        warn!("Worker {} failed job {}: {} ({})", self.id, job.id, job_error.message, job_error.code);
        self.record_outcome(false, elapsed_ms);
        self.metrics.record_metric(
          names::JOB_FAILED,
          1.0,
          "count",
          tags([("worker", self.id.as_str()), ("code", job_error.code.as_str())]),
        );
        self.events.publish(QueueEvent::JobFailed {
          job_id: job.id,
          worker_id: self.id.clone(),
          status: JobStatus::Failed,
          error: job_error,
        });
      }
      Ok(None) => self.publish_cancelled(job),
      Err(e) => {
        error!("Worker {} could not record failure of job {}: {}", self.id, job.id, e);
        self.record_outcome(false, elapsed_ms);
      }
    }
  }

  /// Cancelled jobs count as processed but not against the error rate.
  fn publish_cancelled(&self, job: &GenerationJob) {
    info!("Worker {} dropped cancelled job {}", self.id, job.id);
    self.stats.processed.fetch_add(1, Ordering::Relaxed);
    self.events.publish(QueueEvent::JobFailed {
      job_id: job.id,
      worker_id: self.id.clone(),
      status: JobStatus::Cancelled,
      error: JobError::from_generation(&GenerationError::Cancelled, 0),
    });
  }

  fn record_outcome(&self, succeeded: bool, elapsed_ms: u64) {
    self.stats.processed.fetch_add(1, Ordering::Relaxed);
    self.stats.total_processing_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
    if succeeded {
      self.stats.successful.fetch_add(1, Ordering::Relaxed);
    } else {
      self.stats.failed.fetch_add(1, Ordering::Relaxed);
    }
    let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
    recent.push_back(succeeded);
    while recent.len() > self.config.health_window.max(1) {
      recent.pop_front();
    }
  }

  fn touch(&self) {
    *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
  }

  pub fn error_rate(&self) -> f64 {
    let recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
    if recent.is_empty() {
      return 0.0;
    }
    recent.iter().filter(|ok| !**ok).count() as f64 / recent.len() as f64
  }

  pub fn metrics(&self) -> WorkerMetrics {
    let processed = self.stats.processed.load(Ordering::Relaxed);
    let successful = self.stats.successful.load(Ordering::Relaxed);
    let failed = self.stats.failed.load(Ordering::Relaxed);
    let timed = successful + failed;
    WorkerMetrics {
      processed,
      successful,
      failed,
      retried: self.stats.retried.load(Ordering::Relaxed),
      average_processing_time_ms: if timed > 0 {
        self.stats.total_processing_ms.load(Ordering::Relaxed) as f64 / timed as f64
      } else {
        0.0
      },
    }
  }

  pub async fn health(&self) -> WorkerHealth {
    let backlog = self.queue.get_health_status().await.queue_size;
    let error_rate = self.error_rate();
    let status = if error_rate >= self.config.unhealthy_error_rate {
      HealthStatus::Unhealthy
    } else if error_rate >= self.config.degraded_error_rate || backlog >= self.config.degraded_backlog {
      HealthStatus::Degraded
    } else {
      HealthStatus::Healthy
    };
    WorkerHealth {
      worker_id: self.id.clone(),
      status,
      active_jobs: self.active_jobs(),
      error_rate,
      backlog,
      running: self.is_running(),
      last_activity: *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner),
    }
  }
}
