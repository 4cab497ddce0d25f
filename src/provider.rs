use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tokio::time::sleep;
use tracing::debug;

use crate::error::GenerationError;
use crate::models::{GenerationOutput, GenerationPrompt};

/// The external generation API, one prompt per call.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
  fn name(&self) -> &str;

  async fn generate(&self, index: usize, prompt: &GenerationPrompt) -> Result<GenerationOutput, GenerationError>;
}

/// Stand-in provider that sleeps and returns a synthetic character sheet.
///
/// Used by the worker binary when no real provider is wired in, and by tests.
pub struct SimulatedProvider {
  name: String,
  latency: Duration,
  failure_rate: f64,
  cost_per_call: f64,
  calls: AtomicU64,
}

impl SimulatedProvider {
  pub fn new(latency: Duration) -> Self {
    Self {
      name: "simulated".to_string(),
      latency,
      failure_rate: 0.0,
      cost_per_call: 1.0,
      calls: AtomicU64::new(0),
    }
  }

  /// Fraction of calls, 0.0..=1.0, that fail with a transient network error.
  pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
    self.failure_rate = failure_rate.clamp(0.0, 1.0);
    self
  }

  pub fn with_cost(mut self, cost_per_call: f64) -> Self {
    self.cost_per_call = cost_per_call;
    self
  }

  pub fn calls(&self) -> u64 {
    self.calls.load(Ordering::Relaxed)
  }
}

#[async_trait]
impl GenerationProvider for SimulatedProvider {
  fn name(&self) -> &str {
    &self.name
  }

  async fn generate(&self, index: usize, prompt: &GenerationPrompt) -> Result<GenerationOutput, GenerationError> {
    self.calls.fetch_add(1, Ordering::Relaxed);
    if prompt.prompt.trim().is_empty() {
      return Err(GenerationError::validation("prompt must not be empty"));
    }
    sleep(self.latency).await;

    if self.failure_rate > 0.0 && rand::rng().random_bool(self.failure_rate) {
      debug!("Simulated provider dropping item {}", index);
      return Err(GenerationError::network("simulated connection reset"));
    }

    Ok(GenerationOutput {
      index,
      content: json!({
        "prompt": prompt.prompt,
        "style": prompt.style,
        "description": format!("Generated character for '{}'", prompt.prompt),
      }),
      provider: self.name.clone(),
      cost: self.cost_per_call,
      latency_ms: self.latency.as_millis() as u64,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn produces_output_for_each_prompt() {
    let provider = SimulatedProvider::new(Duration::from_millis(50)).with_cost(2.5);
    let output = provider.generate(3, &GenerationPrompt::new("a rogue")).await.unwrap();
    assert_eq!(output.index, 3);
    assert_eq!(output.cost, 2.5);
    assert_eq!(output.content["prompt"], "a rogue");
    assert_eq!(provider.calls(), 1);
  }

  #[tokio::test]
  async fn rejects_blank_prompts() {
    let provider = SimulatedProvider::new(Duration::ZERO);
    let err = provider.generate(0, &GenerationPrompt::new("  ")).await.unwrap_err();
    assert!(!err.is_transient());
  }
}
