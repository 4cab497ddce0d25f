use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailure {
  /// Token expired but can be refreshed by the provider client.
  TokenExpired,
  InvalidCredentials,
}

/// Every failure a generation attempt can end with.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationError {
  #[error("network error: {message}")]
  Network { message: String },

  #[error("timed out after {timeout_ms}ms")]
  Timeout { timeout_ms: u64 },

  #[error("rate limited")]
  RateLimited { retry_after_ms: Option<u64> },

  #[error("quota exceeded ({code})")]
  QuotaExceeded { code: String },

  #[error("model not ready: {message}")]
  ModelNotReady { message: String },

  #[error("provider returned HTTP {status}: {message}")]
  Http { status: u16, message: String },

  #[error("authentication failed: {message}")]
  Auth { failure: AuthFailure, message: String },

  #[error("validation failed: {message}")]
  Validation { message: String },

  #[error("malformed request: {message}")]
  MalformedRequest { message: String },

  #[error("job was cancelled")]
  Cancelled,

  #[error("provider error: {message}")]
  Provider { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
  Transient,
  Terminal,
}

impl GenerationError {
  pub fn network(message: impl Into<String>) -> Self {
    GenerationError::Network { message: message.into() }
  }

  pub fn provider(message: impl Into<String>) -> Self {
    GenerationError::Provider { message: message.into() }
  }

  pub fn validation(message: impl Into<String>) -> Self {
    GenerationError::Validation { message: message.into() }
  }

  pub fn http(status: u16, message: impl Into<String>) -> Self {
    GenerationError::Http { status, message: message.into() }
  }

  /// Generic classification. Provider-specific conditions are layered on top
  /// of this in `retry_handler::is_provider_retryable`.
  pub fn classify(&self) -> ErrorClass {
    match self {
      GenerationError::Network { .. }
      | GenerationError::Timeout { .. }
      | GenerationError::RateLimited { .. } => ErrorClass::Transient,
      GenerationError::Http { status, .. } if *status == 429 || *status >= 500 => ErrorClass::Transient,
      GenerationError::Http { .. }
      | GenerationError::QuotaExceeded { .. }
      | GenerationError::ModelNotReady { .. }
      | GenerationError::Auth { .. }
      | GenerationError::Validation { .. }
      | GenerationError::MalformedRequest { .. }
      | GenerationError::Cancelled
      | GenerationError::Provider { .. } => ErrorClass::Terminal,
    }
  }

  pub fn is_transient(&self) -> bool {
    self.classify() == ErrorClass::Transient
  }

  /// Stable machine-readable code recorded on failed jobs.
  pub fn code(&self) -> &'static str {
    match self {
      GenerationError::Network { .. } => "NETWORK_ERROR",
      GenerationError::Timeout { .. } => "TIMEOUT",
      GenerationError::RateLimited { .. } => "RATE_LIMITED",
      GenerationError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
      GenerationError::ModelNotReady { .. } => "MODEL_NOT_READY",
      GenerationError::Http { .. } => "HTTP_ERROR",
      GenerationError::Auth { failure: AuthFailure::TokenExpired, .. } => "TOKEN_EXPIRED",
      GenerationError::Auth { failure: AuthFailure::InvalidCredentials, .. } => "INVALID_CREDENTIALS",
      GenerationError::Validation { .. } => "VALIDATION_ERROR",
      GenerationError::MalformedRequest { .. } => "MALFORMED_REQUEST",
      GenerationError::Cancelled => "CANCELLED",
      GenerationError::Provider { .. } => "PROVIDER_ERROR",
    }
  }
}

/// Errors raised while talking to the queue storage collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("storage unavailable: {0}")]
  Unavailable(String),

  #[error("job {0} already exists")]
  Duplicate(Uuid),

  #[error("storage is closed")]
  Closed,

  #[error("storage holds {waiting} waiting jobs (capacity {capacity})")]
  Full { waiting: usize, capacity: usize },
}

#[derive(Debug, Error)]
pub enum QueueError {
  #[error("queue is full ({size}/{max_size})")]
  QueueFull { size: usize, max_size: usize },

  #[error("job not found: {0}")]
  NotFound(Uuid),

  #[error("user {user_id} does not own job {job_id}")]
  Forbidden { job_id: Uuid, user_id: String },

  #[error("job {job_id} cannot move from {from} to {to}")]
  InvalidTransition { job_id: Uuid, from: JobStatus, to: JobStatus },

  #[error("invalid request: {0}")]
  InvalidRequest(String),

  #[error("queue service is not initialized")]
  NotInitialized,

  #[error("queue service is shutting down")]
  ShuttingDown,

  #[error(transparent)]
  Store(#[from] StoreError),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Last error of an operation that will not be attempted again.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("gave up after attempt {attempt} of {max_attempts}: {original_error}")]
pub struct RetryError<E> {
  pub original_error: E,
  pub attempt: u32,
  pub max_attempts: u32,
}

impl<E> RetryError<E> {
  pub fn into_inner(self) -> E {
    self.original_error
  }
}

#[derive(Debug, Error)]
pub enum ManagerError {
  #[error("manager cannot {action} while {state}")]
  InvalidState { action: &'static str, state: String },

  #[error("worker count must be between 1 and {max}, got {requested}")]
  InvalidWorkerCount { requested: usize, max: usize },

  #[error("{0} must be greater than zero")]
  ZeroInterval(&'static str),

  #[error(transparent)]
  Queue(#[from] QueueError),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn transient_conditions_are_retryable() {
    assert!(GenerationError::network("connection reset").is_transient());
    assert!(GenerationError::Timeout { timeout_ms: 100 }.is_transient());
    assert!(GenerationError::RateLimited { retry_after_ms: None }.is_transient());
    assert!(GenerationError::http(503, "unavailable").is_transient());
    assert!(GenerationError::http(429, "slow down").is_transient());
  }

  #[test]
  fn terminal_conditions_fail_fast() {
    assert!(!GenerationError::validation("empty prompt").is_transient());
    assert!(!GenerationError::http(400, "bad").is_transient());
    assert!(!GenerationError::Cancelled.is_transient());
    let auth = GenerationError::Auth { failure: AuthFailure::InvalidCredentials, message: "bad key".into() };
    assert!(!auth.is_transient());
    assert_eq!(auth.code(), "INVALID_CREDENTIALS");
  }

  #[test]
  fn retry_error_mentions_attempts() {
    let err = RetryError { original_error: GenerationError::network("down"), attempt: 3, max_attempts: 3 };
    assert_eq!(err.to_string(), "gave up after attempt 3 of 3: network error: down");
  }
}
