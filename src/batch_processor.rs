use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::error::GenerationError;
use crate::metrics_collector::{MetricsCollector, names, tags};
use crate::models::{GenerationJob, GenerationOutput, GenerationPrompt};
use crate::provider::GenerationProvider;
use crate::rate_limiter::RateLimiter;
use crate::retry_handler::{ProviderOperation, ProviderRetryHandler, RetryOptions};

/// Hooks a running batch uses to talk back to whoever owns the job.
#[async_trait]
pub trait JobControl: Send + Sync {
  /// Checked between prompts; a cancelled job stops before the next call.
  async fn is_cancelled(&self) -> bool;

  async fn report_progress(&self, progress: u8);
}

/// A batch that stopped early.
#[derive(Debug, Clone)]
pub struct BatchFailure {
  pub error: GenerationError,
  /// Provider calls made across every prompt, successful ones included.
  pub provider_calls: u32,
  pub completed_items: usize,
}

impl fmt::Display for BatchFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} (after {} provider calls, {} items done)",
      self.error, self.provider_calls, self.completed_items
    )
  }
}

struct ActiveBatch<'a>(&'a AtomicUsize);

impl<'a> ActiveBatch<'a> {
  fn enter(counter: &'a AtomicUsize) -> Self {
    counter.fetch_add(1, Ordering::SeqCst);
    Self(counter)
  }
}

impl Drop for ActiveBatch<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

/// Runs every prompt of a job against the provider, rate limited and retried.
pub struct BatchProcessor {
  provider: Arc<dyn GenerationProvider>,
  limiter: Arc<dyn RateLimiter>,
  limiter_key: String,
  retry: ProviderRetryHandler,
  metrics: Arc<MetricsCollector>,
  active_batches: AtomicUsize,
}

impl BatchProcessor {
  pub fn new(
    provider: Arc<dyn GenerationProvider>,
    limiter: Arc<dyn RateLimiter>,
    retry: RetryConfig,
    metrics: Arc<MetricsCollector>,
  ) -> Self {
    let limiter_key = provider.name().to_string();
    Self {
      provider,
      limiter,
      limiter_key,
      retry: ProviderRetryHandler::new(retry, ProviderOperation::Generation),
      metrics,
      active_batches: AtomicUsize::new(0),
    }
  }

  pub fn active_batches(&self) -> usize {
    self.active_batches.load(Ordering::SeqCst)
  }

  pub fn provider_name(&self) -> &str {
    &self.limiter_key
  }

  pub async fn process(&self, job: &GenerationJob, control: &dyn JobControl) -> Result<Vec<GenerationOutput>, BatchFailure> {
    let _active = ActiveBatch::enter(&self.active_batches);
    let prompts = job.payload.prompts();
    let total = prompts.len().max(1);
    let mut outputs = Vec::with_capacity(prompts.len());
    let mut provider_calls = 0u32;

    info!("Processing {:?} job {} ({} prompts)", job.job_type, job.id, prompts.len());
    for (index, prompt) in prompts.into_iter().enumerate() {
      if control.is_cancelled().await {
        info!("Job {} cancelled after {} of {} prompts", job.id, index, total);
        return Err(BatchFailure {
          error: GenerationError::Cancelled,
          provider_calls,
          completed_items: outputs.len(),
        });
      }

      let details = self
        .retry
        .execute_with_details(
          |_| self.call_provider(index, prompt),
          RetryOptions::named(format!("job {} prompt {}", job.id, index)),
        )
        .await;
      provider_calls += details.attempts.len() as u32;

      match details.result {
        Ok(output) => outputs.push(output),
        Err(err) => {
          warn!("Job {} prompt {} failed: {}", job.id, index, err);
          return Err(BatchFailure {
            error: err.into_inner(),
            provider_calls,
            completed_items: outputs.len(),
          });
        }
      }
      control.report_progress((((index + 1) * 100) / total) as u8).await;
    }

    debug!("Job {} produced {} outputs in {} provider calls", job.id, outputs.len(), provider_calls);
    Ok(outputs)
  }

  async fn call_provider(&self, index: usize, prompt: &GenerationPrompt) -> Result<GenerationOutput, GenerationError> {
    let provider = self.limiter_key.as_str();
    let decision = self.limiter.check_limit(provider);
    if !decision.allowed {
      self.metrics.record_metric(names::RATE_LIMITED, 1.0, "count", tags([("provider", provider)]));
      return Err(GenerationError::RateLimited {
        retry_after_ms: decision.retry_after.map(|d| d.as_millis() as u64),
      });
    }

    let started = Instant::now();
    let result = self.provider.generate(index, prompt).await;
    let latency_ms = started.elapsed().as_millis() as f64;
    self.limiter.record_outcome(provider, result.is_ok());

    self.metrics.record_metric(names::API_REQUESTS, 1.0, "count", tags([("provider", provider)]));
    self.metrics.record_metric(names::API_LATENCY_MS, latency_ms, "ms", tags([("provider", provider)]));
    match &result {
      Ok(output) => {
        self.metrics.record_metric(names::API_COST, output.cost, "credits", tags([("provider", provider)]));
      }
      Err(e) => {
        self
          .metrics
          .record_metric(names::API_ERRORS, 1.0, "count", tags([("provider", provider), ("code", e.code())]));
      }
    }
    result
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{MetricsConfig, RateLimiterConfig};
  use crate::models::{GenerationRequest, JobPayload};
  use crate::rate_limiter::{SlidingWindowLimiter, TokenBucketLimiter};
  use std::collections::VecDeque;
  use std::sync::Mutex;
  use std::sync::atomic::AtomicBool;

  /// Replays a fixed list of outcomes, then succeeds.
  struct ScriptedProvider {
    script: Mutex<VecDeque<GenerationError>>,
    calls: AtomicUsize,
  }

  impl ScriptedProvider {
    fn new(script: Vec<GenerationError>) -> Self {
      Self {
        script: Mutex::new(script.into()),
        calls: AtomicUsize::new(0),
      }
    }
  }

  #[async_trait]
  impl GenerationProvider for ScriptedProvider {
    fn name(&self) -> &str {
      "scripted"
    }

    async fn generate(&self, index: usize, prompt: &GenerationPrompt) -> Result<GenerationOutput, GenerationError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if let Some(error) = self.script.lock().unwrap().pop_front() {
        return Err(error);
      }
      Ok(GenerationOutput {
        index,
        content: serde_json::json!({ "prompt": prompt.prompt }),
        provider: "scripted".into(),
        cost: 0.5,
        latency_ms: 0,
      })
    }
  }

  #[derive(Default)]
  struct RecordingControl {
    cancelled: AtomicBool,
    progress: Mutex<Vec<u8>>,
  }

  #[async_trait]
  impl JobControl for RecordingControl {
    async fn is_cancelled(&self) -> bool {
      self.cancelled.load(Ordering::SeqCst)
    }

    async fn report_progress(&self, progress: u8) {
      self.progress.lock().unwrap().push(progress);
    }
  }

  fn retry() -> RetryConfig {
    RetryConfig {
      max_attempts: 3,
      base_delay_ms: 10,
      max_delay_ms: 100,
      backoff_multiplier: 2.0,
      jitter_factor: 0.0,
    }
  }

  fn batch_job(prompts: &[&str]) -> GenerationJob {
    let items = prompts.iter().map(|p| GenerationPrompt::new(*p)).collect();
    GenerationJob::from_request(GenerationRequest::new(JobPayload::Batch { items }))
  }

  fn processor(provider: Arc<dyn GenerationProvider>, limiter: Arc<dyn RateLimiter>) -> (BatchProcessor, Arc<MetricsCollector>) {
    let metrics = Arc::new(MetricsCollector::new(MetricsConfig::default()));
    (BatchProcessor::new(provider, limiter, retry(), metrics.clone()), metrics)
  }

  fn roomy_limiter() -> Arc<dyn RateLimiter> {
    Arc::new(SlidingWindowLimiter::new(RateLimiterConfig::new(1000, 100)))
  }

  #[tokio::test(start_paused = true)]
  async fn processes_every_prompt_and_reports_progress() {
    let provider = Arc::new(ScriptedProvider::new(vec![]));
    let (processor, metrics) = processor(provider.clone(), roomy_limiter());
    let control = RecordingControl::default();

    let outputs = processor.process(&batch_job(&["elf", "dwarf", "orc", "troll"]), &control).await.unwrap();
    assert_eq!(outputs.len(), 4);
    assert_eq!(*control.progress.lock().unwrap(), vec![25, 50, 75, 100]);
    assert_eq!(processor.active_batches(), 0);
    assert_eq!(metrics.cost().total_cost, 2.0);
  }

  #[tokio::test(start_paused = true)]
  async fn transient_provider_errors_are_retried_per_prompt() {
    let provider = Arc::new(ScriptedProvider::new(vec![
      GenerationError::http(503, "busy"),
      GenerationError::ModelNotReady { message: "warming up".into() },
    ]));
    let (processor, _) = processor(provider.clone(), roomy_limiter());

    let outputs = processor.process(&batch_job(&["elf"]), &RecordingControl::default()).await.unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn terminal_error_stops_the_batch() {
    let provider = Arc::new(ScriptedProvider::new(vec![GenerationError::validation("unsafe prompt")]));
    let (processor, metrics) = processor(provider.clone(), roomy_limiter());

    let failure = processor.process(&batch_job(&["elf", "dwarf"]), &RecordingControl::default()).await.unwrap_err();
    assert_eq!(failure.error, GenerationError::validation("unsafe prompt"));
    assert_eq!(failure.provider_calls, 1);
    assert_eq!(failure.completed_items, 0);
    assert_eq!(metrics.api_usage().failed_requests, 1.0);
  }

  #[tokio::test(start_paused = true)]
  async fn cancellation_stops_before_next_prompt() {
    let provider = Arc::new(ScriptedProvider::new(vec![]));
    let (processor, _) = processor(provider.clone(), roomy_limiter());
    let control = RecordingControl::default();
    control.cancelled.store(true, Ordering::SeqCst);

    let failure = processor.process(&batch_job(&["elf", "dwarf"]), &control).await.unwrap_err();
    assert_eq!(failure.error, GenerationError::Cancelled);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn rate_limit_denials_back_off_instead_of_calling() {
    let provider = Arc::new(ScriptedProvider::new(vec![]));
    let limiter: Arc<dyn RateLimiter> = Arc::new(TokenBucketLimiter::new(RateLimiterConfig::new(1000, 1)));
    let (processor, metrics) = processor(provider.clone(), limiter);

    // Second prompt is denied once the bucket is empty; the 10ms and 20ms
    // backoffs are not enough for a refill, so the third attempt gives up.
    let failure = processor.process(&batch_job(&["elf", "dwarf"]), &RecordingControl::default()).await.unwrap_err();
    assert!(matches!(failure.error, GenerationError::RateLimited { retry_after_ms: Some(ms) } if ms > 0));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    assert_eq!(failure.completed_items, 1);
    assert_eq!(metrics.api_usage().rate_limited, 3.0);
  }
}
