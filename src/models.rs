use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GenerationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
  Pending,
  Queued,
  Processing,
  Completed,
  Failed,
  Cancelled,
}

impl JobStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
  }

  /// Edges of the job lifecycle DAG.
  pub fn can_transition_to(self, next: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
      (self, next),
      (Pending, Queued)
        | (Pending, Cancelled)
        | (Queued, Processing)
        | (Queued, Cancelled)
        | (Processing, Completed)
        | (Processing, Failed)
        | (Processing, Cancelled)
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      JobStatus::Pending => "pending",
      JobStatus::Queued => "queued",
      JobStatus::Processing => "processing",
      JobStatus::Completed => "completed",
      JobStatus::Failed => "failed",
      JobStatus::Cancelled => "cancelled",
    }
  }
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Dequeue precedence, lowest first so the derived `Ord` matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
  Low,
  #[default]
  Normal,
  High,
  Urgent,
}

impl JobPriority {
  pub const ALL: [JobPriority; 4] = [JobPriority::Urgent, JobPriority::High, JobPriority::Normal, JobPriority::Low];
}

impl std::str::FromStr for JobPriority {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "low" => Ok(JobPriority::Low),
      "normal" => Ok(JobPriority::Normal),
      "high" => Ok(JobPriority::High),
      "urgent" => Ok(JobPriority::Urgent),
      other => Err(format!("unknown priority '{}'", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
  Character,
  Batch,
  Single,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationPrompt {
  pub prompt: String,
  #[serde(default)]
  pub style: Option<String>,
  #[serde(default)]
  pub parameters: serde_json::Value,
}

impl GenerationPrompt {
  pub fn new(prompt: impl Into<String>) -> Self {
    Self {
      prompt: prompt.into(),
      style: None,
      parameters: serde_json::Value::Null,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
  Character { name: String, prompt: GenerationPrompt },
  Batch { items: Vec<GenerationPrompt> },
  Single { prompt: GenerationPrompt },
}

impl JobPayload {
  pub fn job_type(&self) -> JobType {
    match self {
      JobPayload::Character { .. } => JobType::Character,
      JobPayload::Batch { .. } => JobType::Batch,
      JobPayload::Single { .. } => JobType::Single,
    }
  }

  pub fn prompts(&self) -> Vec<&GenerationPrompt> {
    match self {
      JobPayload::Character { prompt, .. } | JobPayload::Single { prompt } => vec![prompt],
      JobPayload::Batch { items } => items.iter().collect(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
  pub user_id: Option<String>,
  pub payload: JobPayload,
  #[serde(default)]
  pub priority: JobPriority,
  #[serde(default)]
  pub scheduled_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub metadata: serde_json::Value,
}

impl GenerationRequest {
  pub fn new(payload: JobPayload) -> Self {
    Self {
      user_id: None,
      payload,
      priority: JobPriority::Normal,
      scheduled_at: None,
      metadata: serde_json::Value::Null,
    }
  }

  pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
    self.user_id = Some(user_id.into());
    self
  }

  pub fn with_priority(mut self, priority: JobPriority) -> Self {
    self.priority = priority;
    self
  }

  pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
    self.scheduled_at = Some(at);
    self
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
  pub index: usize,
  pub content: serde_json::Value,
  pub provider: String,
  pub cost: f64,
  pub latency_ms: u64,
}

/// Error as shown to API callers deciding whether to resubmit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
  pub code: String,
  pub message: String,
  pub retryable: bool,
  pub retry_count: u32,
}

impl JobError {
  pub fn from_generation(error: &GenerationError, retry_count: u32) -> Self {
    Self {
      code: error.code().to_string(),
      message: error.to_string(),
      retryable: error.is_transient(),
      retry_count,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
  pub id: Uuid,
  pub user_id: Option<String>,
  pub job_type: JobType,
  pub payload: JobPayload,
  pub status: JobStatus,
  pub priority: JobPriority,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub scheduled_at: Option<DateTime<Utc>>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub results: Vec<GenerationOutput>,
  pub error: Option<JobError>,
  pub progress: u8,
  pub attempts: u32,
  pub worker_id: Option<String>,
  pub metadata: serde_json::Value,
}

impl GenerationJob {
  pub fn from_request(request: GenerationRequest) -> Self {
    let now = Utc::now();
    Self {
      id: Uuid::new_v4(),
      user_id: request.user_id,
      job_type: request.payload.job_type(),
      payload: request.payload,
      status: JobStatus::Pending,
      priority: request.priority,
      created_at: now,
      updated_at: now,
      scheduled_at: request.scheduled_at,
      started_at: None,
      completed_at: None,
      results: Vec::new(),
      error: None,
      progress: 0,
      attempts: 0,
      worker_id: None,
      metadata: request.metadata,
    }
  }

  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.scheduled_at.is_none_or(|at| at <= now)
  }

  pub fn item_count(&self) -> usize {
    self.payload.prompts().len()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
  Healthy,
  Degraded,
  Unhealthy,
}

impl HealthStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      HealthStatus::Healthy => "healthy",
      HealthStatus::Degraded => "degraded",
      HealthStatus::Unhealthy => "unhealthy",
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
  pub worker_id: String,
  pub status: HealthStatus,
  pub active_jobs: usize,
  pub error_rate: f64,
  pub backlog: usize,
  pub running: bool,
  pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerMetrics {
  pub processed: u64,
  pub successful: u64,
  pub failed: u64,
  pub retried: u64,
  pub average_processing_time_ms: f64,
}

impl WorkerMetrics {
  /// Adds `other`'s counters; the average is weighted by finished jobs.
  pub fn absorb(&mut self, other: &WorkerMetrics) {
    let mine = (self.successful + self.failed) as f64;
    let theirs = (other.successful + other.failed) as f64;
    if mine + theirs > 0.0 {
      self.average_processing_time_ms =
        (self.average_processing_time_ms * mine + other.average_processing_time_ms * theirs) / (mine + theirs);
    }
    self.processed += other.processed;
    self.successful += other.successful;
    self.failed += other.failed;
    self.retried += other.retried;
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueMetrics {
  pub pending: usize,
  pub queued: usize,
  pub processing: usize,
  pub completed: usize,
  pub failed: usize,
  pub cancelled: usize,
  pub average_wait_time_ms: f64,
  pub average_processing_time_ms: f64,
  pub throughput_per_hour: f64,
}

impl QueueMetrics {
  /// Jobs waiting to be claimed.
  pub fn queue_size(&self) -> usize {
    self.pending + self.queued
  }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueHealth {
  pub is_healthy: bool,
  pub queue_size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct JobQuery {
  pub status: Option<JobStatus>,
  pub limit: Option<usize>,
  pub offset: Option<usize>,
}

/// Who is asking to cancel a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requester {
  User(String),
  Admin,
}
