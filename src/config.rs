use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::models::JobPriority;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfiguration {
  pub max_concurrent_jobs: usize,
  pub max_queue_size: usize,
  pub priority_levels: Vec<JobPriority>,
  pub retry_attempts: u32,
  pub retry_delay_ms: u64,
  pub job_timeout_ms: u64,
}

impl Default for QueueConfiguration {
  fn default() -> Self {
    Self {
      max_concurrent_jobs: 4,
      max_queue_size: 1000,
      priority_levels: JobPriority::ALL.to_vec(),
      retry_attempts: 3,
      retry_delay_ms: 1000,
      job_timeout_ms: 300_000,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub backoff_multiplier: f64,
  /// Fraction of the delay used as symmetric random jitter, 0.0..=1.0.
  pub jitter_factor: f64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay_ms: 1000,
      max_delay_ms: 30_000,
      backoff_multiplier: 2.0,
      jitter_factor: 0.1,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
  pub window_ms: u64,
  pub max_requests: u32,
  pub skip_successful_requests: bool,
  pub skip_failed_requests: bool,
}

impl RateLimiterConfig {
  pub fn new(window_ms: u64, max_requests: u32) -> Self {
    Self {
      window_ms,
      max_requests,
      skip_successful_requests: false,
      skip_failed_requests: false,
    }
  }

  pub fn window(&self) -> Duration {
    Duration::from_millis(self.window_ms)
  }
}

impl Default for RateLimiterConfig {
  fn default() -> Self {
    Self::new(60_000, 60)
  }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub concurrency: usize,
  pub poll_interval: Duration,
  pub job_timeout: Duration,
  /// Whole-job attempts; provider calls inside a job retry on their own.
  pub job_retry: RetryConfig,
  /// Number of recent outcomes used to compute the error rate.
  pub health_window: usize,
  pub degraded_error_rate: f64,
  pub unhealthy_error_rate: f64,
  pub degraded_backlog: usize,
}

/// Name of the first interval that is zero; periodic tasks cannot tick on those.
fn first_zero<const N: usize>(intervals: [(&'static str, Duration); N]) -> Option<&'static str> {
  intervals.into_iter().find(|(_, period)| period.is_zero()).map(|(name, _)| name)
}

impl WorkerConfig {
  pub fn zero_interval(&self) -> Option<&'static str> {
    first_zero([("worker.poll_interval", self.poll_interval), ("worker.job_timeout", self.job_timeout)])
  }
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      concurrency: 2,
      poll_interval: Duration::from_millis(1000),
      job_timeout: Duration::from_secs(300),
      job_retry: RetryConfig::default(),
      health_window: 50,
      degraded_error_rate: 0.2,
      unhealthy_error_rate: 0.5,
      degraded_backlog: 500,
    }
  }
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
  pub max_points_per_series: usize,
  pub aggregation_interval: Duration,
  pub retention: Duration,
  pub view_cache_ttl: Duration,
}

impl MetricsConfig {
  pub fn zero_interval(&self) -> Option<&'static str> {
    first_zero([("metrics.aggregation_interval", self.aggregation_interval)])
  }
}

impl Default for MetricsConfig {
  fn default() -> Self {
    Self {
      max_points_per_series: 10_000,
      aggregation_interval: Duration::from_secs(60),
      retention: Duration::from_secs(24 * 60 * 60),
      view_cache_ttl: Duration::from_secs(5),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
  pub max_queue_size: usize,
  pub max_error_rate: f64,
  pub max_average_processing_time_ms: f64,
  pub max_unhealthy_workers: usize,
}

impl Default for AlertThresholds {
  fn default() -> Self {
    Self {
      max_queue_size: 500,
      max_error_rate: 0.1,
      max_average_processing_time_ms: 120_000.0,
      max_unhealthy_workers: 0,
    }
  }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
  pub worker_count: usize,
  pub max_workers: usize,
  pub health_check_interval: Duration,
  pub cleanup_interval: Duration,
  pub metrics_interval: Duration,
  pub limiter_sweep_interval: Duration,
  pub cleanup_days_old: u32,
  /// Queue size above which the system reports itself degraded.
  pub degraded_queue_size: usize,
  pub alert_thresholds: AlertThresholds,
  pub alert_history_limit: usize,
}

impl ManagerConfig {
  pub fn zero_interval(&self) -> Option<&'static str> {
    first_zero([
      ("manager.health_check_interval", self.health_check_interval),
      ("manager.cleanup_interval", self.cleanup_interval),
      ("manager.metrics_interval", self.metrics_interval),
      ("manager.limiter_sweep_interval", self.limiter_sweep_interval),
    ])
  }
}

impl Default for ManagerConfig {
  fn default() -> Self {
    Self {
      worker_count: 2,
      max_workers: 32,
      health_check_interval: Duration::from_secs(30),
      cleanup_interval: Duration::from_secs(60 * 60),
      metrics_interval: Duration::from_secs(60),
      limiter_sweep_interval: Duration::from_secs(60),
      cleanup_days_old: 7,
      degraded_queue_size: 250,
      alert_thresholds: AlertThresholds::default(),
      alert_history_limit: 1000,
    }
  }
}

/// Process-wide settings, read once at bootstrap.
#[derive(Debug, Clone)]
pub struct Config {
  pub queue: QueueConfiguration,
  pub provider_retry: RetryConfig,
  pub provider_rate_limit: RateLimiterConfig,
  pub worker: WorkerConfig,
  pub metrics: MetricsConfig,
  pub manager: ManagerConfig,
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
  T: FromStr,
  T::Err: std::fmt::Display,
{
  match env::var(key) {
    Ok(raw) => raw
      .trim()
      .parse()
      .map_err(|e| anyhow::anyhow!("{}", e))
      .with_context(|| format!("invalid value for {}: '{}'", key, raw)),
    Err(_) => Ok(default),
  }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
  Ok(Duration::from_millis(env_or(key, default.as_millis() as u64)?))
}

impl Config {
  pub fn from_env() -> Result<Self> {
    let queue_defaults = QueueConfiguration::default();
    let queue = QueueConfiguration {
      max_concurrent_jobs: env_or("GENQ_MAX_CONCURRENT_JOBS", queue_defaults.max_concurrent_jobs)?,
      max_queue_size: env_or("GENQ_MAX_QUEUE_SIZE", queue_defaults.max_queue_size)?,
      priority_levels: queue_defaults.priority_levels,
      retry_attempts: env_or("GENQ_RETRY_ATTEMPTS", queue_defaults.retry_attempts)?,
      retry_delay_ms: env_or("GENQ_RETRY_DELAY_MS", queue_defaults.retry_delay_ms)?,
      job_timeout_ms: env_or("GENQ_JOB_TIMEOUT_MS", queue_defaults.job_timeout_ms)?,
    };

    let retry_defaults = RetryConfig::default();
    let provider_retry = RetryConfig {
      max_attempts: env_or("GENQ_PROVIDER_MAX_ATTEMPTS", retry_defaults.max_attempts)?,
      base_delay_ms: env_or("GENQ_PROVIDER_BASE_DELAY_MS", retry_defaults.base_delay_ms)?,
      max_delay_ms: env_or("GENQ_PROVIDER_MAX_DELAY_MS", retry_defaults.max_delay_ms)?,
      backoff_multiplier: env_or("GENQ_PROVIDER_BACKOFF_MULTIPLIER", retry_defaults.backoff_multiplier)?,
      jitter_factor: env_or("GENQ_PROVIDER_JITTER_FACTOR", retry_defaults.jitter_factor)?,
    };

    let limit_defaults = RateLimiterConfig::default();
    let provider_rate_limit = RateLimiterConfig {
      window_ms: env_or("GENQ_PROVIDER_WINDOW_MS", limit_defaults.window_ms)?,
      max_requests: env_or("GENQ_PROVIDER_MAX_REQUESTS", limit_defaults.max_requests)?,
      skip_successful_requests: env_or("GENQ_SKIP_SUCCESSFUL_REQUESTS", false)?,
      skip_failed_requests: env_or("GENQ_SKIP_FAILED_REQUESTS", false)?,
    };

    let worker_defaults = WorkerConfig::default();
    let worker = WorkerConfig {
      concurrency: queue.max_concurrent_jobs,
      poll_interval: env_millis("GENQ_POLL_INTERVAL_MS", worker_defaults.poll_interval)?,
      job_timeout: Duration::from_millis(queue.job_timeout_ms),
      job_retry: RetryConfig {
        max_attempts: queue.retry_attempts,
        base_delay_ms: queue.retry_delay_ms,
        ..RetryConfig::default()
      },
      ..worker_defaults
    };

    let metrics_defaults = MetricsConfig::default();
    let metrics = MetricsConfig {
      max_points_per_series: env_or("GENQ_METRICS_MAX_POINTS", metrics_defaults.max_points_per_series)?,
      aggregation_interval: env_millis("GENQ_METRICS_AGGREGATION_MS", metrics_defaults.aggregation_interval)?,
      ..metrics_defaults
    };

    let manager_defaults = ManagerConfig::default();
    let manager = ManagerConfig {
      worker_count: env_or("GENQ_WORKERS", manager_defaults.worker_count)?,
      health_check_interval: env_millis("GENQ_HEALTH_CHECK_MS", manager_defaults.health_check_interval)?,
      cleanup_interval: env_millis("GENQ_CLEANUP_INTERVAL_MS", manager_defaults.cleanup_interval)?,
      cleanup_days_old: env_or("GENQ_CLEANUP_DAYS_OLD", manager_defaults.cleanup_days_old)?,
      ..manager_defaults
    };

    let config = Self {
      queue,
      provider_retry,
      provider_rate_limit,
      worker,
      metrics,
      manager,
    };
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    if self.queue.max_concurrent_jobs == 0 {
      bail!("GENQ_MAX_CONCURRENT_JOBS must be at least 1");
    }
    if self.queue.max_queue_size == 0 {
      bail!("GENQ_MAX_QUEUE_SIZE must be at least 1");
    }
    if self.provider_retry.max_attempts == 0 || self.queue.retry_attempts == 0 {
      bail!("retry attempts must be at least 1");
    }
    if !(0.0..=1.0).contains(&self.provider_retry.jitter_factor) {
      bail!("GENQ_PROVIDER_JITTER_FACTOR must be within 0.0..=1.0");
    }
    if self.provider_rate_limit.window_ms == 0 || self.provider_rate_limit.max_requests == 0 {
      bail!("provider rate limit window and max requests must be positive");
    }
    if self.manager.worker_count == 0 || self.manager.worker_count > self.manager.max_workers {
      bail!("GENQ_WORKERS must be between 1 and {}", self.manager.max_workers);
    }
    let zero = self
      .worker
      .zero_interval()
      .or_else(|| self.metrics.zero_interval())
      .or_else(|| self.manager.zero_interval());
    if let Some(name) = zero {
      bail!("{} must be greater than zero", name);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_pass_validation() {
    let config = Config {
      queue: QueueConfiguration::default(),
      provider_retry: RetryConfig::default(),
      provider_rate_limit: RateLimiterConfig::default(),
      worker: WorkerConfig::default(),
      metrics: MetricsConfig::default(),
      manager: ManagerConfig::default(),
    };
    assert!(config.validate().is_ok());
  }

  #[test]
  fn rejects_out_of_range_jitter() {
    let config = Config {
      queue: QueueConfiguration::default(),
      provider_retry: RetryConfig { jitter_factor: 1.5, ..RetryConfig::default() },
      provider_rate_limit: RateLimiterConfig::default(),
      worker: WorkerConfig::default(),
      metrics: MetricsConfig::default(),
      manager: ManagerConfig::default(),
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn rejects_zero_intervals() {
    let base = || Config {
      queue: QueueConfiguration::default(),
      provider_retry: RetryConfig::default(),
      provider_rate_limit: RateLimiterConfig::default(),
      worker: WorkerConfig::default(),
      metrics: MetricsConfig::default(),
      manager: ManagerConfig::default(),
    };

    let mut config = base();
    config.manager.health_check_interval = Duration::ZERO;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("manager.health_check_interval"));

    let mut config = base();
    config.worker.poll_interval = Duration::ZERO;
    assert!(config.validate().unwrap_err().to_string().contains("worker.poll_interval"));

    let mut config = base();
    config.metrics.aggregation_interval = Duration::ZERO;
    assert!(config.validate().is_err());

    let mut config = base();
    config.manager.cleanup_interval = Duration::ZERO;
    assert!(config.validate().is_err());
  }
}
