use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{AuthFailure, GenerationError, RetryError};

/// Default retry classification for an error type.
pub trait Retryable {
  fn is_retryable(&self) -> bool;
}

impl Retryable for GenerationError {
  fn is_retryable(&self) -> bool {
    self.is_transient()
  }
}

pub type ShouldRetry<E> = Arc<dyn Fn(&E, u32) -> bool + Send + Sync>;
pub type OnRetry<E> = Arc<dyn Fn(&E, u32, Duration) + Send + Sync>;

pub struct RetryOptions<E> {
  pub max_attempts: Option<u32>,
  pub should_retry: Option<ShouldRetry<E>>,
  pub on_retry: Option<OnRetry<E>>,
  pub operation: String,
}

impl<E> Default for RetryOptions<E> {
  fn default() -> Self {
    Self {
      max_attempts: None,
      should_retry: None,
      on_retry: None,
      operation: "operation".to_string(),
    }
  }
}

impl<E> RetryOptions<E> {
  pub fn named(operation: impl Into<String>) -> Self {
    Self {
      operation: operation.into(),
      ..Self::default()
    }
  }

  pub fn max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = Some(max_attempts);
    self
  }

  pub fn should_retry(mut self, predicate: impl Fn(&E, u32) -> bool + Send + Sync + 'static) -> Self {
    self.should_retry = Some(Arc::new(predicate));
    self
  }

  pub fn on_retry(mut self, observer: impl Fn(&E, u32, Duration) + Send + Sync + 'static) -> Self {
    self.on_retry = Some(Arc::new(observer));
    self
  }
}

#[derive(Debug, Clone)]
pub struct AttemptRecord<E> {
  pub attempt: u32,
  pub started_at: DateTime<Utc>,
  pub ended_at: DateTime<Utc>,
  pub duration: Duration,
  /// Wait before the next attempt, absent on the last one.
  pub delay: Option<Duration>,
  pub error: Option<E>,
}

#[derive(Debug)]
pub struct RetryDetails<T, E> {
  pub result: Result<T, RetryError<E>>,
  pub attempts: Vec<AttemptRecord<E>>,
  pub total_duration: Duration,
}

#[derive(Debug, Clone)]
pub struct RetryHandler {
  config: RetryConfig,
}

impl RetryHandler {
  pub fn new(config: RetryConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &RetryConfig {
    &self.config
  }

  /// Un-jittered delay after attempt `attempt` (1-based).
  pub fn base_delay(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let raw = self.config.base_delay_ms as f64 * self.config.backoff_multiplier.powi(exponent);
    let capped = raw.min(self.config.max_delay_ms as f64).max(0.0);
    Duration::from_micros((capped * 1000.0).round() as u64)
  }

  pub fn calculate_delay(&self, attempt: u32) -> Duration {
    let delay = self.base_delay(attempt);
    let jitter_factor = self.config.jitter_factor.clamp(0.0, 1.0);
    if jitter_factor == 0.0 || delay.is_zero() {
      return delay;
    }
    let spread = delay.as_secs_f64() * jitter_factor;
    let jitter = rand::rng().random_range(-spread..=spread);
    Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0))
  }

  pub async fn execute<T, E, F, Fut>(&self, op: F, options: RetryOptions<E>) -> Result<T, RetryError<E>>
  where
    E: Retryable + Clone + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    self.execute_with_details(op, options).await.result
  }

  pub async fn execute_with_details<T, E, F, Fut>(&self, mut op: F, options: RetryOptions<E>) -> RetryDetails<T, E>
  where
    E: Retryable + Clone + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    let max_attempts = options.max_attempts.unwrap_or(self.config.max_attempts).max(1);
    let started = Instant::now();
    let mut attempts = Vec::with_capacity(max_attempts as usize);
    let mut attempt = 0;

    loop {
      attempt += 1;
      let started_at = Utc::now();
      let attempt_start = Instant::now();
      let outcome = op(attempt).await;
      let duration = attempt_start.elapsed();

      let error = match outcome {
        Ok(value) => {
          attempts.push(AttemptRecord {
            attempt,
            started_at,
            ended_at: Utc::now(),
            duration,
            delay: None,
            error: None,
          });
          if attempt > 1 {
            debug!("{} succeeded on attempt {}/{}", options.operation, attempt, max_attempts);
          }
          return RetryDetails {
            result: Ok(value),
            attempts,
            total_duration: started.elapsed(),
          };
        }
        Err(error) => error,
      };

      let retry = attempt < max_attempts
        && match &options.should_retry {
          Some(predicate) => predicate(&error, attempt),
          None => error.is_retryable(),
        };
      let delay = retry.then(|| self.calculate_delay(attempt));

      attempts.push(AttemptRecord {
        attempt,
        started_at,
        ended_at: Utc::now(),
        duration,
        delay,
        error: Some(error.clone()),
      });

      let Some(delay) = delay else {
        warn!("{} failed on attempt {}/{}: {}", options.operation, attempt, max_attempts, error);
        return RetryDetails {
          result: Err(RetryError {
            original_error: error,
            attempt,
            max_attempts,
          }),
          attempts,
          total_duration: started.elapsed(),
        };
      };

      debug!(
        "{} attempt {}/{} failed: {}; retrying in {:?}",
        options.operation, attempt, max_attempts, error, delay
      );
      if let Some(observer) = &options.on_retry {
        observer(&error, attempt, delay);
      }
      sleep(delay).await;
    }
  }
}

/// What a provider call is doing; some statuses are only transient for generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderOperation {
  Generation,
  Status,
}

static NOT_READY: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"(?i)(warming up|not ready|still loading|model is loading|cold start)").expect("valid regex"));

static EXPIRED_TOKEN: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"(?i)(token (has )?expired|expired (access )?token|jwt expired)").expect("valid regex"));

static INVALID_CREDENTIALS: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"(?i)invalid[ _-]?(credentials|api[ _-]?key|token|signature)").expect("valid regex"));

const TRANSIENT_QUOTA_CODES: &[&str] = &["quota_exceeded", "rate_limit_exceeded", "resource_exhausted", "too_many_requests"];

/// Provider-aware retry decision layered over `GenerationError::is_transient`.
pub fn is_provider_retryable(error: &GenerationError, operation: ProviderOperation) -> bool {
  if error.is_transient() {
    return true;
  }
  match error {
    GenerationError::QuotaExceeded { code } => {
      let code = code.to_ascii_lowercase();
      TRANSIENT_QUOTA_CODES.iter().any(|c| *c == code)
    }
    GenerationError::ModelNotReady { .. } => true,
    GenerationError::Http { status: 408 | 409, .. } => operation == ProviderOperation::Generation,
    GenerationError::Http { status: 401, message } => {
      EXPIRED_TOKEN.is_match(message) && !INVALID_CREDENTIALS.is_match(message)
    }
    GenerationError::Auth { failure: AuthFailure::TokenExpired, .. } => true,
    GenerationError::Auth { failure: AuthFailure::InvalidCredentials, .. } => false,
    GenerationError::Provider { message } => NOT_READY.is_match(message),
    _ => false,
  }
}

/// Retry handler preconfigured with the provider classifier.
#[derive(Debug, Clone)]
pub struct ProviderRetryHandler {
  inner: RetryHandler,
  operation: ProviderOperation,
}

impl ProviderRetryHandler {
  pub fn new(config: RetryConfig, operation: ProviderOperation) -> Self {
    Self {
      inner: RetryHandler::new(config),
      operation,
    }
  }

  pub fn handler(&self) -> &RetryHandler {
    &self.inner
  }

  fn with_classifier(&self, mut options: RetryOptions<GenerationError>) -> RetryOptions<GenerationError> {
    if options.should_retry.is_none() {
      let operation = self.operation;
      options.should_retry = Some(Arc::new(move |error: &GenerationError, _| is_provider_retryable(error, operation)));
    }
    options
  }

  pub async fn execute<T, F, Fut>(&self, op: F, options: RetryOptions<GenerationError>) -> Result<T, RetryError<GenerationError>>
  where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, GenerationError>>,
  {
    self.inner.execute(op, self.with_classifier(options)).await
  }

  pub async fn execute_with_details<T, F, Fut>(
    &self,
    op: F,
    options: RetryOptions<GenerationError>,
  ) -> RetryDetails<T, GenerationError>
  where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, GenerationError>>,
  {
    self.inner.execute_with_details(op, self.with_classifier(options)).await
  }
}
