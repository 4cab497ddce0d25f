use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RateLimiterConfig;

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitResult {
  pub allowed: bool,
  pub limit: u32,
  pub remaining: u32,
  pub reset_time: DateTime<Utc>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterKind {
  SlidingWindow,
  TokenBucket,
}

pub trait RateLimiter: Send + Sync {
  fn kind(&self) -> LimiterKind;

  fn config(&self) -> &RateLimiterConfig;

  /// Takes a grant for `identifier` if one is available.
  fn check_limit(&self, identifier: &str) -> RateLimitResult;

  /// Same answer as `check_limit` without consuming anything.
  fn get_status(&self, identifier: &str) -> RateLimitResult;

  fn reset(&self, identifier: &str);

  /// Gives the last grant back when the outcome is configured to be skipped.
  fn record_outcome(&self, identifier: &str, succeeded: bool);

  /// Drops identifiers idle for at least two windows. Returns how many went.
  fn purge_stale(&self) -> usize;

  fn tracked_identifiers(&self) -> usize;
}

fn wall_clock_after(delay: Duration) -> DateTime<Utc> {
  Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

fn should_refund(config: &RateLimiterConfig, succeeded: bool) -> bool {
  (succeeded && config.skip_successful_requests) || (!succeeded && config.skip_failed_requests)
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
  count: u32,
  window_start: Instant,
  last_seen: Instant,
}

/// Fixed window counter keyed by identifier.
pub struct SlidingWindowLimiter {
  config: RateLimiterConfig,
  entries: DashMap<String, WindowEntry>,
}

impl SlidingWindowLimiter {
  pub fn new(config: RateLimiterConfig) -> Self {
    Self {
      config,
      entries: DashMap::new(),
    }
  }

  fn result_for(&self, entry: &WindowEntry, now: Instant, allowed: bool) -> RateLimitResult {
    let window = self.config.window();
    let until_reset = (entry.window_start + window).saturating_duration_since(now);
    RateLimitResult {
      allowed,
      limit: self.config.max_requests,
      remaining: self.config.max_requests.saturating_sub(entry.count),
      reset_time: wall_clock_after(until_reset),
      retry_after: if allowed { None } else { Some(until_reset) },
    }
  }
}

impl RateLimiter for SlidingWindowLimiter {
  fn kind(&self) -> LimiterKind {
    LimiterKind::SlidingWindow
  }

  fn config(&self) -> &RateLimiterConfig {
    &self.config
  }

  fn check_limit(&self, identifier: &str) -> RateLimitResult {
    let now = Instant::now();
    let window = self.config.window();
    let mut entry = self.entries.entry(identifier.to_string()).or_insert(WindowEntry {
      count: 0,
      window_start: now,
      last_seen: now,
    });

    if now >= entry.window_start + window {
      entry.count = 0;
      entry.window_start = now;
    }
    entry.last_seen = now;

    if entry.count >= self.config.max_requests {
      debug!("Rate limit hit for {}", identifier);
      return self.result_for(&entry, now, false);
    }
    entry.count += 1;
    self.result_for(&entry, now, true)
  }

  fn get_status(&self, identifier: &str) -> RateLimitResult {
    let now = Instant::now();
    let fresh = WindowEntry {
      count: 0,
      window_start: now,
      last_seen: now,
    };
    let mut entry = self.entries.get(identifier).map(|e| *e).unwrap_or(fresh);
    if now >= entry.window_start + self.config.window() {
      entry = fresh;
    }
    let allowed = entry.count < self.config.max_requests;
    self.result_for(&entry, now, allowed)
  }

  fn reset(&self, identifier: &str) {
    self.entries.remove(identifier);
  }

  fn record_outcome(&self, identifier: &str, succeeded: bool) {
    if !should_refund(&self.config, succeeded) {
      return;
    }
    if let Some(mut entry) = self.entries.get_mut(identifier) {
      entry.count = entry.count.saturating_sub(1);
    }
  }

  fn purge_stale(&self) -> usize {
    let now = Instant::now();
    let idle_limit = self.config.window() * 2;
    let before = self.entries.len();
    self.entries.retain(|_, entry| now.saturating_duration_since(entry.last_seen) < idle_limit);
    before - self.entries.len()
  }

  fn tracked_identifiers(&self) -> usize {
    self.entries.len()
  }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
  tokens: f64,
  last_refill: Instant,
  last_seen: Instant,
}

/// Token bucket holding `max_requests` tokens, refilled evenly across the window.
pub struct TokenBucketLimiter {
  config: RateLimiterConfig,
  buckets: DashMap<String, Bucket>,
}

impl TokenBucketLimiter {
  pub fn new(config: RateLimiterConfig) -> Self {
    Self {
      config,
      buckets: DashMap::new(),
    }
  }

  fn capacity(&self) -> f64 {
    self.config.max_requests as f64
  }

  /// Tokens per second.
  fn refill_rate(&self) -> f64 {
    self.capacity() / self.config.window().as_secs_f64()
  }

  fn refill(&self, bucket: &mut Bucket, now: Instant) {
    let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
    bucket.tokens = (bucket.tokens + elapsed * self.refill_rate()).min(self.capacity());
    bucket.last_refill = now;
  }

  fn full_bucket(&self, now: Instant) -> Bucket {
    Bucket {
      tokens: self.capacity(),
      last_refill: now,
      last_seen: now,
    }
  }

  fn result_for(&self, bucket: &Bucket, allowed: bool) -> RateLimitResult {
    let rate = self.refill_rate();
    let until_full = Duration::from_secs_f64(((self.capacity() - bucket.tokens) / rate).max(0.0));
    let retry_after = if allowed {
      None
    } else {
      Some(Duration::from_secs_f64(((1.0 - bucket.tokens) / rate).max(0.0)))
    };
    RateLimitResult {
      allowed,
      limit: self.config.max_requests,
      remaining: bucket.tokens.floor().max(0.0) as u32,
      reset_time: wall_clock_after(until_full),
      retry_after,
    }
  }
}

impl RateLimiter for TokenBucketLimiter {
  fn kind(&self) -> LimiterKind {
    LimiterKind::TokenBucket
  }

  fn config(&self) -> &RateLimiterConfig {
    &self.config
  }

  fn check_limit(&self, identifier: &str) -> RateLimitResult {
    let now = Instant::now();
    let mut bucket = self.buckets.entry(identifier.to_string()).or_insert_with(|| self.full_bucket(now));
    self.refill(&mut bucket, now);
    bucket.last_seen = now;

    if bucket.tokens >= 1.0 {
      bucket.tokens -= 1.0;
      self.result_for(&bucket, true)
    } else {
      debug!("Token bucket empty for {}", identifier);
      self.result_for(&bucket, false)
    }
  }

  fn get_status(&self, identifier: &str) -> RateLimitResult {
    let now = Instant::now();
    let mut bucket = self.buckets.get(identifier).map(|b| *b).unwrap_or_else(|| self.full_bucket(now));
    self.refill(&mut bucket, now);
    let allowed = bucket.tokens >= 1.0;
    self.result_for(&bucket, allowed)
  }

  fn reset(&self, identifier: &str) {
    self.buckets.remove(identifier);
  }

  fn record_outcome(&self, identifier: &str, succeeded: bool) {
    if !should_refund(&self.config, succeeded) {
      return;
    }
    if let Some(mut bucket) = self.buckets.get_mut(identifier) {
      bucket.tokens = (bucket.tokens + 1.0).min(self.capacity());
    }
  }

  fn purge_stale(&self) -> usize {
    let now = Instant::now();
    let idle_limit = self.config.window() * 2;
    let before = self.buckets.len();
    self.buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) < idle_limit);
    before - self.buckets.len()
  }

  fn tracked_identifiers(&self) -> usize {
    self.buckets.len()
  }
}

pub fn build_limiter(kind: LimiterKind, config: RateLimiterConfig) -> Arc<dyn RateLimiter> {
  match kind {
    LimiterKind::SlidingWindow => Arc::new(SlidingWindowLimiter::new(config)),
    LimiterKind::TokenBucket => Arc::new(TokenBucketLimiter::new(config)),
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct LimiterSummary {
  pub name: String,
  pub kind: LimiterKind,
  pub tracked_identifiers: usize,
}

/// Named limiters shared by every call site that asks for the same name and kind.
#[derive(Default)]
pub struct RateLimiterRegistry {
  limiters: DashMap<(LimiterKind, String), Arc<dyn RateLimiter>>,
}

impl RateLimiterRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the limiter registered under `name`, creating it with `config`
  /// on first use. Later configs for an existing name are ignored.
  pub fn get_or_create(&self, name: &str, kind: LimiterKind, config: RateLimiterConfig) -> Arc<dyn RateLimiter> {
    self
      .limiters
      .entry((kind, name.to_string()))
      .or_insert_with(|| {
        info!("Registering {:?} rate limiter '{}' ({} req / {}ms)", kind, name, config.max_requests, config.window_ms);
        build_limiter(kind, config)
      })
      .value()
      .clone()
  }

  pub fn get(&self, name: &str, kind: LimiterKind) -> Option<Arc<dyn RateLimiter>> {
    self.limiters.get(&(kind, name.to_string())).map(|l| l.value().clone())
  }

  pub fn sweep(&self) -> usize {
    self.limiters.iter().map(|l| l.value().purge_stale()).sum()
  }

  pub fn summaries(&self) -> Vec<LimiterSummary> {
    let mut summaries: Vec<LimiterSummary> = self
      .limiters
      .iter()
      .map(|l| LimiterSummary {
        name: l.key().1.clone(),
        kind: l.key().0,
        tracked_identifiers: l.value().tracked_identifiers(),
      })
      .collect();
    summaries.sort_by(|a, b| a.name.cmp(&b.name));
    summaries
  }

  /// Periodically purges idle identifiers until `shutdown` fires.
  pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    let registry = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.tick().await;
      loop {
        tokio::select! {
          _ = shutdown.cancelled() => break,
          _ = ticker.tick() => {
            let purged = registry.sweep();
            if purged > 0 {
              debug!("Rate limiter sweep purged {} idle identifiers", purged);
            }
          }
        }
      }
    })
  }
}
