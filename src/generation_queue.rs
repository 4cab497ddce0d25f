use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{Duration as ChronoDuration, Utc};
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfiguration;
use crate::error::{QueueError, QueueResult, StoreError};
use crate::models::{
  GenerationJob, GenerationOutput, GenerationRequest, JobError, JobPayload, JobQuery, JobStatus, QueueHealth,
  QueueMetrics, Requester,
};
use crate::queue_store::QueueStore;

// 100ms, 200ms, 400ms, 800ms, 1.6s between connection attempts.
const CONNECT_BACKOFF_BASE: u64 = 2;
const CONNECT_BACKOFF_FACTOR: u64 = 50;
const CONNECT_RETRIES: usize = 5;
const MAX_PROMPT_LEN: usize = 4000;
const MAX_BATCH_SIZE: usize = 50;

/// Priority queue of generation jobs over a pluggable store.
pub struct GenerationQueueService {
  store: Arc<dyn QueueStore>,
  config: QueueConfiguration,
  initialized: AtomicBool,
  accepting: AtomicBool,
}

impl GenerationQueueService {
  pub fn new(store: Arc<dyn QueueStore>, config: QueueConfiguration) -> Self {
    Self {
      store,
      config,
      initialized: AtomicBool::new(false),
      accepting: AtomicBool::new(false),
    }
  }

  pub fn config(&self) -> &QueueConfiguration {
    &self.config
  }

  pub async fn initialize(&self) -> QueueResult<()> {
    if self.initialized.load(Ordering::Acquire) {
      return Ok(());
    }
    Retry::spawn(
      ExponentialBackoff::from_millis(CONNECT_BACKOFF_BASE)
        .factor(CONNECT_BACKOFF_FACTOR)
        .take(CONNECT_RETRIES),
      || self.store.connect(),
    )
    .await?;
    self.initialized.store(true, Ordering::Release);
    self.accepting.store(true, Ordering::Release);
    info!("Generation queue initialized (max size {})", self.config.max_queue_size);
    Ok(())
  }

  fn ensure_ready(&self) -> QueueResult<()> {
    if !self.initialized.load(Ordering::Acquire) {
      return Err(QueueError::NotInitialized);
    }
    Ok(())
  }

  fn validate(&self, request: &GenerationRequest) -> QueueResult<()> {
    let prompts = request.payload.prompts();
    if prompts.is_empty() {
      return Err(QueueError::InvalidRequest("batch must contain at least one prompt".into()));
    }
    if let JobPayload::Batch { items } = &request.payload {
      if items.len() > MAX_BATCH_SIZE {
        return Err(QueueError::InvalidRequest(format!("batch of {} prompts is too large", items.len())));
      }
    }
    if let JobPayload::Character { name, .. } = &request.payload {
      if name.trim().is_empty() {
        return Err(QueueError::InvalidRequest("character name must not be empty".into()));
      }
    }
    for prompt in prompts {
      if prompt.prompt.trim().is_empty() {
        return Err(QueueError::InvalidRequest("prompt must not be empty".into()));
      }
      if prompt.prompt.chars().count() > MAX_PROMPT_LEN {
        return Err(QueueError::InvalidRequest(format!("prompt exceeds {} characters", MAX_PROMPT_LEN)));
      }
    }
    if !self.config.priority_levels.contains(&request.priority) {
      return Err(QueueError::InvalidRequest(format!("priority {:?} is not enabled", request.priority)));
    }
    Ok(())
  }

  pub async fn enqueue(&self, request: GenerationRequest) -> QueueResult<Uuid> {
    self.ensure_ready()?;
    if !self.accepting.load(Ordering::Acquire) {
      return Err(QueueError::ShuttingDown);
    }
    self.validate(&request)?;

    let mut job = GenerationJob::from_request(request);
    if job.is_due(job.created_at) {
      job.status = JobStatus::Queued;
    }
    let id = job.id;
    let (priority, status) = (job.priority, job.status);
    match self.store.insert_bounded(job, self.config.max_queue_size).await {
      Ok(()) => {}
      Err(StoreError::Full { waiting, capacity }) => {
        warn!("Rejecting job: queue full ({}/{})", waiting, capacity);
        return Err(QueueError::QueueFull {
          size: waiting,
          max_size: capacity,
        });
      }
      Err(e) => return Err(e.into()),
    }
    info!("Job {} enqueued ({:?}, {})", id, priority, status);
    Ok(id)
  }

  /// Claims the next job for `worker_id`, if any is due.
  pub async fn dequeue(&self, worker_id: &str) -> QueueResult<Option<GenerationJob>> {
    self.ensure_ready()?;
    if !self.accepting.load(Ordering::Acquire) {
      return Ok(None);
    }
    let job = self.store.claim_next(worker_id, Utc::now()).await?;
    if let Some(job) = &job {
      debug!("Worker {} claimed job {}", worker_id, job.id);
    }
    Ok(job)
  }

  pub async fn get_job(&self, job_id: Uuid) -> QueueResult<Option<GenerationJob>> {
    self.ensure_ready()?;
    Ok(self.store.get(job_id).await?)
  }

  async fn require_job(&self, job_id: Uuid) -> QueueResult<GenerationJob> {
    self.store.get(job_id).await?.ok_or(QueueError::NotFound(job_id))
  }

  /// Moves `job` from its current status to `next`. When another writer got
  /// there first the job is re-read, and the move is retried as long as the
  /// lifecycle still allows it. Terminates because the lifecycle has no cycles.
  async fn transition(
    &self,
    mut job: GenerationJob,
    next: JobStatus,
    apply: impl Fn(&mut GenerationJob),
  ) -> QueueResult<GenerationJob> {
    loop {
      let from = job.status;
      if !from.can_transition_to(next) {
        return Err(QueueError::InvalidTransition { job_id: job.id, from, to: next });
      }
      let now = Utc::now();
      let mut updated = job.clone();
      updated.status = next;
      updated.updated_at = now;
      if next.is_terminal() {
        updated.completed_at = Some(now);
      }
      apply(&mut updated);
      if self.store.compare_and_swap(from, updated.clone()).await? {
        return Ok(updated);
      }
      job = self.require_job(job.id).await?;
      debug!("Job {} moved to {} concurrently; retrying move to {}", job.id, job.status, next);
    }
  }

  pub async fn cancel_job(&self, job_id: Uuid, requester: &Requester) -> QueueResult<GenerationJob> {
    self.ensure_ready()?;
    let job = self.require_job(job_id).await?;
    if let Requester::User(user_id) = requester {
      if job.user_id.as_deref() != Some(user_id.as_str()) {
        return Err(QueueError::Forbidden {
          job_id,
          user_id: user_id.clone(),
        });
      }
    }
    let was = job.status;
    let job = self.transition(job, JobStatus::Cancelled, |_| {}).await?;
    info!("Job {} cancelled (was {})", job_id, was);
    Ok(job)
  }

  pub async fn get_user_jobs(&self, user_id: &str, query: JobQuery) -> QueueResult<Vec<GenerationJob>> {
    self.ensure_ready()?;
    Ok(self.store.list_by_user(user_id, &query).await?)
  }

  pub async fn update_progress(&self, job_id: Uuid, progress: u8) -> QueueResult<()> {
    let mut job = self.require_job(job_id).await?;
    if job.status != JobStatus::Processing {
      return Ok(());
    }
    job.progress = progress.min(100);
    job.updated_at = Utc::now();
    // Losing this race to a cancellation is fine; the next check sees it.
    self.store.compare_and_swap(JobStatus::Processing, job).await?;
    Ok(())
  }

  pub async fn is_cancelled(&self, job_id: Uuid) -> QueueResult<bool> {
    Ok(self.require_job(job_id).await?.status == JobStatus::Cancelled)
  }

  /// Returns `None` when the job stopped being ours (cancelled) and the
  /// results were discarded.
  pub async fn complete_job(&self, job_id: Uuid, results: Vec<GenerationOutput>) -> QueueResult<Option<GenerationJob>> {
    let job = self.require_job(job_id).await?;
    if job.status == JobStatus::Cancelled {
      info!("Job {} was cancelled while processing; discarding {} results", job_id, results.len());
      return Ok(None);
    }
    match self
      .transition(job, JobStatus::Completed, |j| {
        j.results = results.clone();
        j.progress = 100;
        j.error = None;
      })
      .await
    {
      Ok(job) => Ok(Some(job)),
      Err(QueueError::InvalidTransition { from: JobStatus::Cancelled, .. }) => {
        info!("Job {} was cancelled before completion was recorded", job_id);
        Ok(None)
      }
      Err(e) => Err(e),
    }
  }

  pub async fn fail_job(&self, job_id: Uuid, error: JobError) -> QueueResult<Option<GenerationJob>> {
    let job = self.require_job(job_id).await?;
    if job.status == JobStatus::Cancelled {
      return Ok(None);
    }
    match self.transition(job, JobStatus::Failed, |j| j.error = Some(error.clone())).await {
      Ok(job) => Ok(Some(job)),
      Err(QueueError::InvalidTransition { from: JobStatus::Cancelled, .. }) => Ok(None),
      Err(e) => Err(e),
    }
  }

  pub async fn get_metrics(&self) -> QueueResult<QueueMetrics> {
    self.ensure_ready()?;
    let jobs = self.store.snapshot().await?;
    let now = Utc::now();
    let hour_ago = now - ChronoDuration::hours(1);

    let mut metrics = QueueMetrics::default();
    let mut wait_total = 0.0;
    let mut wait_count = 0usize;
    let mut processing_total = 0.0;
    let mut processing_count = 0usize;
    let mut completed_last_hour = 0usize;

    for job in &jobs {
      match job.status {
        JobStatus::Pending => metrics.pending += 1,
        JobStatus::Queued => metrics.queued += 1,
        JobStatus::Processing => metrics.processing += 1,
        JobStatus::Completed => metrics.completed += 1,
        JobStatus::Failed => metrics.failed += 1,
        JobStatus::Cancelled => metrics.cancelled += 1,
      }
      if let Some(started) = job.started_at {
        wait_total += (started - job.created_at).num_milliseconds().max(0) as f64;
        wait_count += 1;
      }
      if job.status == JobStatus::Completed {
        if let (Some(started), Some(completed)) = (job.started_at, job.completed_at) {
          processing_total += (completed - started).num_milliseconds().max(0) as f64;
          processing_count += 1;
          if completed >= hour_ago {
            completed_last_hour += 1;
          }
        }
      }
    }

    if wait_count > 0 {
      metrics.average_wait_time_ms = wait_total / wait_count as f64;
    }
    if processing_count > 0 {
      metrics.average_processing_time_ms = processing_total / processing_count as f64;
    }
    metrics.throughput_per_hour = completed_last_hour as f64;
    Ok(metrics)
  }

  pub async fn get_health_status(&self) -> QueueHealth {
    let queue_size = self.store.count_waiting().await;
    let healthy = self.initialized.load(Ordering::Acquire) && self.accepting.load(Ordering::Acquire);
    match queue_size {
      Ok(queue_size) => QueueHealth {
        is_healthy: healthy && queue_size < self.config.max_queue_size,
        queue_size,
      },
      Err(e) => {
        warn!("Queue health check failed: {}", e);
        QueueHealth {
          is_healthy: false,
          queue_size: 0,
        }
      }
    }
  }

  /// Deletes terminal jobs untouched for more than `days_old` days.
  pub async fn cleanup(&self, days_old: u32) -> QueueResult<usize> {
    self.ensure_ready()?;
    let cutoff = Utc::now() - ChronoDuration::days(days_old as i64);
    let removed = self.store.remove_terminal_before(cutoff).await?;
    if removed > 0 {
      info!("Queue cleanup removed {} jobs older than {} days", removed, days_old);
    }
    Ok(removed)
  }

  /// Stops accepting work and closes the store. Jobs already claimed must be
  /// finished by their workers before this is called.
  pub async fn shutdown(&self) -> QueueResult<()> {
    if !self.initialized.swap(false, Ordering::AcqRel) {
      return Ok(());
    }
    self.accepting.store(false, Ordering::Release);
    self.store.close().await?;
    info!("Generation queue shut down");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{GenerationPrompt, JobPriority};
  use crate::queue_store::InMemoryQueueStore;
  use async_trait::async_trait;
  use chrono::DateTime;
  use std::time::Duration;
  use tokio_test::assert_ok;

  /// In-memory store whose reads return late and whose inserts start late,
  /// widening every window between a read and the write that follows it.
  struct LaggingStore {
    inner: InMemoryQueueStore,
    lag: Duration,
  }

  impl LaggingStore {
    fn new(lag: Duration) -> Self {
      Self {
        inner: InMemoryQueueStore::new(),
        lag,
      }
    }
  }

  #[async_trait]
  impl QueueStore for LaggingStore {
    async fn connect(&self) -> Result<(), StoreError> {
      self.inner.connect().await
    }
    async fn insert_bounded(&self, job: GenerationJob, capacity: usize) -> Result<(), StoreError> {
      tokio::time::sleep(self.lag).await;
      self.inner.insert_bounded(job, capacity).await
    }
    async fn get(&self, id: Uuid) -> Result<Option<GenerationJob>, StoreError> {
      let job = self.inner.get(id).await;
      tokio::time::sleep(self.lag).await;
      job
    }
    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<GenerationJob>, StoreError> {
      self.inner.claim_next(worker_id, now).await
    }
    async fn compare_and_swap(&self, expected: JobStatus, job: GenerationJob) -> Result<bool, StoreError> {
      self.inner.compare_and_swap(expected, job).await
    }
    async fn list_by_user(&self, user_id: &str, query: &JobQuery) -> Result<Vec<GenerationJob>, StoreError> {
      self.inner.list_by_user(user_id, query).await
    }
    async fn snapshot(&self) -> Result<Vec<GenerationJob>, StoreError> {
      self.inner.snapshot().await
    }
    async fn count_waiting(&self) -> Result<usize, StoreError> {
      let waiting = self.inner.count_waiting().await;
      tokio::time::sleep(self.lag).await;
      waiting
    }
    async fn remove_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
      self.inner.remove_terminal_before(cutoff).await
    }
    async fn close(&self) -> Result<(), StoreError> {
      self.inner.close().await
    }
  }

  async fn lagging_service(max_queue_size: usize) -> Arc<GenerationQueueService> {
    let config = QueueConfiguration {
      max_queue_size,
      ..QueueConfiguration::default()
    };
    let store = Arc::new(LaggingStore::new(Duration::from_millis(5)));
    let queue = Arc::new(GenerationQueueService::new(store, config));
    queue.initialize().await.unwrap();
    queue
  }

  fn request(priority: JobPriority) -> GenerationRequest {
    GenerationRequest::new(JobPayload::Single { prompt: GenerationPrompt::new("a paladin") })
      .with_user("alice")
      .with_priority(priority)
  }

  async fn service(max_queue_size: usize) -> GenerationQueueService {
    let config = QueueConfiguration {
      max_queue_size,
      ..QueueConfiguration::default()
    };
    let queue = GenerationQueueService::new(Arc::new(InMemoryQueueStore::new()), config);
    queue.initialize().await.unwrap();
    queue
  }

  #[tokio::test]
  async fn dequeues_urgent_then_normal_then_low() {
    let queue = service(10).await;
    let low = queue.enqueue(request(JobPriority::Low)).await.unwrap();
    let urgent = queue.enqueue(request(JobPriority::Urgent)).await.unwrap();
    let normal = queue.enqueue(request(JobPriority::Normal)).await.unwrap();

    let mut order = Vec::new();
    while let Some(job) = queue.dequeue("w1").await.unwrap() {
      order.push(job.id);
    }
    assert_eq!(order, vec![urgent, normal, low]);
  }

  #[tokio::test]
  async fn rejects_when_full() {
    let queue = service(2).await;
    queue.enqueue(request(JobPriority::Normal)).await.unwrap();
    queue.enqueue(request(JobPriority::Normal)).await.unwrap();
    let err = queue.enqueue(request(JobPriority::Normal)).await.unwrap_err();
    assert!(matches!(err, QueueError::QueueFull { size: 2, max_size: 2 }));
    assert!(!queue.get_health_status().await.is_healthy);
  }

  #[tokio::test]
  async fn rejects_invalid_requests() {
    let queue = service(10).await;
    let blank = GenerationRequest::new(JobPayload::Single { prompt: GenerationPrompt::new(" ") });
    assert!(matches!(queue.enqueue(blank).await, Err(QueueError::InvalidRequest(_))));
    let empty_batch = GenerationRequest::new(JobPayload::Batch { items: vec![] });
    assert!(matches!(queue.enqueue(empty_batch).await, Err(QueueError::InvalidRequest(_))));
  }

  #[tokio::test]
  async fn cancelled_pending_job_is_never_dequeued() {
    let queue = service(10).await;
    let scheduled = request(JobPriority::Urgent).scheduled_at(Utc::now() + ChronoDuration::milliseconds(200));
    let id = queue.enqueue(scheduled).await.unwrap();
    assert_eq!(queue.get_job(id).await.unwrap().unwrap().status, JobStatus::Pending);

    let cancelled = assert_ok!(queue.cancel_job(id, &Requester::User("alice".into())).await);
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(queue.dequeue("w1").await.unwrap().is_none());
    assert_eq!(queue.get_job(id).await.unwrap().unwrap().status, JobStatus::Cancelled);
  }

  #[tokio::test]
  async fn cancel_checks_ownership_unless_admin() {
    let queue = service(10).await;
    let id = queue.enqueue(request(JobPriority::Normal)).await.unwrap();
    let err = queue.cancel_job(id, &Requester::User("mallory".into())).await.unwrap_err();
    assert!(matches!(err, QueueError::Forbidden { .. }));
    assert_ok!(queue.cancel_job(id, &Requester::Admin).await);

    let again = queue.cancel_job(id, &Requester::Admin).await.unwrap_err();
    assert!(matches!(again, QueueError::InvalidTransition { from: JobStatus::Cancelled, .. }));
  }

  #[tokio::test]
  async fn completion_after_cancel_discards_results() {
    let queue = service(10).await;
    let id = queue.enqueue(request(JobPriority::Normal)).await.unwrap();
    queue.dequeue("w1").await.unwrap().unwrap();
    queue.cancel_job(id, &Requester::Admin).await.unwrap();

    assert!(queue.complete_job(id, vec![]).await.unwrap().is_none());
    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.results.is_empty());
  }

  #[tokio::test]
  async fn user_jobs_are_filtered_and_paged() {
    let queue = service(10).await;
    for _ in 0..3 {
      queue.enqueue(request(JobPriority::Normal)).await.unwrap();
    }
    queue
      .enqueue(GenerationRequest::new(JobPayload::Single { prompt: GenerationPrompt::new("orc") }).with_user("bob"))
      .await
      .unwrap();
    let claimed = queue.dequeue("w1").await.unwrap().unwrap();
    queue.complete_job(claimed.id, vec![]).await.unwrap();

    let all = queue.get_user_jobs("alice", JobQuery::default()).await.unwrap();
    assert_eq!(all.len(), 3);
    let page = queue
      .get_user_jobs("alice", JobQuery { limit: Some(2), offset: Some(2), ..JobQuery::default() })
      .await
      .unwrap();
    assert_eq!(page.len(), 1);
    let queued = queue
      .get_user_jobs("alice", JobQuery { status: Some(JobStatus::Queued), ..JobQuery::default() })
      .await
      .unwrap();
    assert_eq!(queued.len(), 2);
  }

  #[tokio::test]
  async fn metrics_count_each_status() {
    let queue = service(10).await;
    for _ in 0..3 {
      queue.enqueue(request(JobPriority::Normal)).await.unwrap();
    }
    let first = queue.dequeue("w1").await.unwrap().unwrap();
    let second = queue.dequeue("w1").await.unwrap().unwrap();
    queue.complete_job(first.id, vec![]).await.unwrap();
    queue
      .fail_job(second.id, JobError { code: "TIMEOUT".into(), message: "slow".into(), retryable: true, retry_count: 2 })
      .await
      .unwrap();

    let metrics = queue.get_metrics().await.unwrap();
    assert_eq!(metrics.queued, 1);
    assert_eq!(metrics.completed, 1);
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.queue_size(), 1);
    assert_eq!(metrics.throughput_per_hour, 1.0);
  }

  #[tokio::test]
  async fn cleanup_and_shutdown() {
    let queue = service(10).await;
    let id = queue.enqueue(request(JobPriority::Normal)).await.unwrap();
    queue.cancel_job(id, &Requester::Admin).await.unwrap();
    assert_eq!(queue.cleanup(1).await.unwrap(), 0);
    assert_eq!(queue.cleanup(0).await.unwrap(), 1);

    queue.shutdown().await.unwrap();
    assert!(matches!(queue.enqueue(request(JobPriority::Low)).await, Err(QueueError::NotInitialized)));
    assert!(queue.shutdown().await.is_ok());
  }

  #[tokio::test(start_paused = true)]
  async fn concurrent_submissions_respect_capacity() {
    let queue = lagging_service(5).await;
    let mut handles = Vec::new();
    for _ in 0..20 {
      let queue = queue.clone();
      handles.push(tokio::spawn(async move { queue.enqueue(request(JobPriority::Normal)).await }));
    }

    let mut accepted = 0;
    for handle in handles {
      match handle.await.unwrap() {
        Ok(_) => accepted += 1,
        Err(e) => assert!(matches!(e, QueueError::QueueFull { size: 5, max_size: 5 })),
      }
    }
    assert_eq!(accepted, 5);
    assert_eq!(queue.get_health_status().await.queue_size, 5);
  }

  #[tokio::test(start_paused = true)]
  async fn cancel_follows_a_job_claimed_mid_flight() {
    let queue = lagging_service(10).await;
    let id = queue.enqueue(request(JobPriority::Normal)).await.unwrap();

    let cancelling = {
      let queue = queue.clone();
      tokio::spawn(async move { queue.cancel_job(id, &Requester::Admin).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    let claimed = queue.dequeue("w1").await.unwrap();
    assert_eq!(claimed.map(|j| j.id), Some(id));

    let cancelled = assert_ok!(cancelling.await.unwrap());
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.worker_id.as_deref(), Some("w1"));
    assert!(queue.is_cancelled(id).await.unwrap());
  }

  #[tokio::test]
  async fn prompt_limit_counts_characters() {
    let queue = service(10).await;
    let runes = "ᚠ".repeat(MAX_PROMPT_LEN);
    assert!(runes.len() > MAX_PROMPT_LEN);
    let fits = GenerationRequest::new(JobPayload::Single { prompt: GenerationPrompt::new(runes.as_str()) });
    assert_ok!(queue.enqueue(fits).await);

    let too_long = "ᚠ".repeat(MAX_PROMPT_LEN + 1);
    let rejected = GenerationRequest::new(JobPayload::Single { prompt: GenerationPrompt::new(too_long.as_str()) });
    assert!(matches!(queue.enqueue(rejected).await, Err(QueueError::InvalidRequest(_))));
  }
}
