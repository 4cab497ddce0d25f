use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{GenerationJob, JobPriority, JobQuery, JobStatus};

/// Storage collaborator behind `GenerationQueueService`.
///
/// Implementations must make `claim_next` and `compare_and_swap` atomic: two
/// workers racing for the same job must see exactly one winner.
#[async_trait]
pub trait QueueStore: Send + Sync {
  async fn connect(&self) -> Result<(), StoreError>;

  async fn insert(&self, job: GenerationJob) -> Result<(), StoreError> {
    self.insert_bounded(job, usize::MAX).await
  }

  /// Inserts `job` only while fewer than `capacity` jobs are pending or
  /// queued. The count and the insert must happen atomically.
  async fn insert_bounded(&self, job: GenerationJob, capacity: usize) -> Result<(), StoreError>;

  async fn get(&self, id: Uuid) -> Result<Option<GenerationJob>, StoreError>;

  /// Claims the highest-priority due job and moves it to `processing`.
  async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<GenerationJob>, StoreError>;

  /// Replaces the stored job only if its status still equals `expected`.
  async fn compare_and_swap(&self, expected: JobStatus, job: GenerationJob) -> Result<bool, StoreError>;

  async fn list_by_user(&self, user_id: &str, query: &JobQuery) -> Result<Vec<GenerationJob>, StoreError>;

  async fn snapshot(&self) -> Result<Vec<GenerationJob>, StoreError>;

  async fn count_waiting(&self) -> Result<usize, StoreError>;

  /// Removes terminal jobs last updated before `cutoff`.
  async fn remove_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

  async fn close(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadyEntry {
  priority: JobPriority,
  sequence: u64,
  id: Uuid,
}

impl Ord for ReadyEntry {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .priority
      .cmp(&other.priority)
      .then_with(|| other.sequence.cmp(&self.sequence))
  }
}

impl PartialOrd for ReadyEntry {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

#[derive(Default)]
struct MemoryState {
  jobs: HashMap<Uuid, GenerationJob>,
  /// Queued jobs; cancelled entries are skipped lazily on claim.
  ready: BinaryHeap<ReadyEntry>,
  sequence: u64,
}

impl MemoryState {
  fn waiting(&self) -> usize {
    self
      .jobs
      .values()
      .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Queued))
      .count()
  }

  fn push_ready(&mut self, job: &GenerationJob) {
    self.sequence += 1;
    self.ready.push(ReadyEntry {
      priority: job.priority,
      sequence: self.sequence,
      id: job.id,
    });
  }

  /// Moves pending jobs whose schedule has come due into the ready heap.
  fn promote_due(&mut self, now: DateTime<Utc>) {
    let mut due: Vec<(DateTime<Utc>, Uuid)> = self
      .jobs
      .values()
      .filter(|j| j.status == JobStatus::Pending && j.is_due(now))
      .map(|j| (j.scheduled_at.unwrap_or(j.created_at), j.id))
      .collect();
    due.sort();
    for (_, id) in due {
      if let Some(job) = self.jobs.get_mut(&id) {
        job.status = JobStatus::Queued;
        job.updated_at = now;
        let job = job.clone();
        self.push_ready(&job);
      }
    }
  }
}

/// Process-local store: a priority heap under one async mutex.
#[derive(Default)]
pub struct InMemoryQueueStore {
  state: Mutex<MemoryState>,
  closed: AtomicBool,
}

impl InMemoryQueueStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn ensure_open(&self) -> Result<(), StoreError> {
    if self.closed.load(AtomicOrdering::Acquire) {
      Err(StoreError::Closed)
    } else {
      Ok(())
    }
  }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
  async fn connect(&self) -> Result<(), StoreError> {
    self.closed.store(false, AtomicOrdering::Release);
    Ok(())
  }

  async fn insert_bounded(&self, job: GenerationJob, capacity: usize) -> Result<(), StoreError> {
    self.ensure_open()?;
    let mut state = self.state.lock().await;
    if state.jobs.contains_key(&job.id) {
      return Err(StoreError::Duplicate(job.id));
    }
    let waiting = state.waiting();
    if waiting >= capacity {
      return Err(StoreError::Full { waiting, capacity });
    }
    if job.status == JobStatus::Queued {
      state.push_ready(&job);
    }
    state.jobs.insert(job.id, job);
    Ok(())
  }

  async fn get(&self, id: Uuid) -> Result<Option<GenerationJob>, StoreError> {
    self.ensure_open()?;
    Ok(self.state.lock().await.jobs.get(&id).cloned())
  }

  async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<GenerationJob>, StoreError> {
    self.ensure_open()?;
    let mut state = self.state.lock().await;
    state.promote_due(now);

    while let Some(entry) = state.ready.pop() {
      let Some(job) = state.jobs.get_mut(&entry.id) else {
        continue;
      };
      if job.status != JobStatus::Queued {
        continue;
      }
      job.status = JobStatus::Processing;
      job.worker_id = Some(worker_id.to_string());
      job.started_at = Some(now);
      job.updated_at = now;
      job.attempts += 1;
      return Ok(Some(job.clone()));
    }
    Ok(None)
  }

  async fn compare_and_swap(&self, expected: JobStatus, job: GenerationJob) -> Result<bool, StoreError> {
    self.ensure_open()?;
    let mut state = self.state.lock().await;
    let current = match state.jobs.get(&job.id) {
      Some(current) => current.status,
      None => return Ok(false),
    };
    if current != expected {
      return Ok(false);
    }
    let requeue = job.status == JobStatus::Queued && expected != JobStatus::Queued;
    if requeue {
      state.push_ready(&job);
    }
    state.jobs.insert(job.id, job);
    Ok(true)
  }

  async fn list_by_user(&self, user_id: &str, query: &JobQuery) -> Result<Vec<GenerationJob>, StoreError> {
    self.ensure_open()?;
    let state = self.state.lock().await;
    let mut jobs: Vec<GenerationJob> = state
      .jobs
      .values()
      .filter(|j| j.user_id.as_deref() == Some(user_id))
      .filter(|j| query.status.is_none_or(|s| j.status == s))
      .cloned()
      .collect();
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(
      jobs
        .into_iter()
        .skip(query.offset.unwrap_or(0))
        .take(query.limit.unwrap_or(usize::MAX))
        .collect(),
    )
  }

  async fn snapshot(&self) -> Result<Vec<GenerationJob>, StoreError> {
    self.ensure_open()?;
    Ok(self.state.lock().await.jobs.values().cloned().collect())
  }

  async fn count_waiting(&self) -> Result<usize, StoreError> {
    self.ensure_open()?;
    Ok(self.state.lock().await.waiting())
  }

  async fn remove_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
    self.ensure_open()?;
    let mut state = self.state.lock().await;
    let before = state.jobs.len();
    state.jobs.retain(|_, j| !(j.status.is_terminal() && j.updated_at < cutoff));
    Ok(before - state.jobs.len())
  }

  async fn close(&self) -> Result<(), StoreError> {
    self.closed.store(true, AtomicOrdering::Release);
    Ok(())
  }
}
