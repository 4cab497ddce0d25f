use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use prometheus::{GaugeVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MetricsConfig;

/// Metric names recorded by the queue subsystem.
pub mod names {
  pub const API_REQUESTS: &str = "api.requests";
  pub const API_ERRORS: &str = "api.errors";
  pub const API_COST: &str = "api.cost";
  pub const API_LATENCY_MS: &str = "api.latency_ms";
  pub const RATE_LIMITED: &str = "api.rate_limited";
  pub const JOB_DURATION_MS: &str = "job.duration_ms";
  pub const JOB_COMPLETED: &str = "job.completed";
  pub const JOB_FAILED: &str = "job.failed";
  pub const JOB_RETRIED: &str = "job.retried";
  pub const QUEUE_SIZE: &str = "queue.size";
  pub const QUEUE_ERROR_RATE: &str = "queue.error_rate";
  pub const WORKERS_ACTIVE: &str = "workers.active";
}

pub type Tags = BTreeMap<String, String>;

pub fn tags<const N: usize>(pairs: [(&str, &str); N]) -> Tags {
  pairs.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
  pub timestamp: DateTime<Utc>,
  pub value: f64,
  pub tags: Tags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
  pub name: String,
  pub unit: String,
  pub points: VecDeque<MetricPoint>,
}

impl TimeSeries {
  fn new(name: &str, unit: &str) -> Self {
    Self {
      name: name.to_string(),
      unit: unit.to_string(),
      points: VecDeque::new(),
    }
  }

  pub fn latest(&self) -> Option<&MetricPoint> {
    self.points.back()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
  GreaterThan,
  GreaterThanOrEqual,
  LessThan,
  LessThanOrEqual,
  Equal,
}

impl AlertCondition {
  pub fn is_breached(self, value: f64, threshold: f64) -> bool {
    match self {
      AlertCondition::GreaterThan => value > threshold,
      AlertCondition::GreaterThanOrEqual => value >= threshold,
      AlertCondition::LessThan => value < threshold,
      AlertCondition::LessThanOrEqual => value <= threshold,
      AlertCondition::Equal => (value - threshold).abs() < f64::EPSILON,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
  pub id: String,
  pub metric_name: String,
  pub condition: AlertCondition,
  pub threshold: f64,
  /// How long the condition must hold continuously before the rule fires.
  pub duration: Duration,
  pub enabled: bool,
}

impl AlertRule {
  pub fn new(id: impl Into<String>, metric_name: impl Into<String>, condition: AlertCondition, threshold: f64) -> Self {
    Self {
      id: id.into(),
      metric_name: metric_name.into(),
      condition,
      threshold,
      duration: Duration::ZERO,
      enabled: true,
    }
  }

  pub fn sustained_for(mut self, duration: Duration) -> Self {
    self.duration = duration;
    self
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
  pub id: Uuid,
  pub rule_id: String,
  pub metric_name: String,
  pub condition: AlertCondition,
  pub threshold: f64,
  pub value: f64,
  pub triggered_at: DateTime<Utc>,
  pub resolved: bool,
  pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum AlertEvaluationError {
  #[error("metric {0} reported a non-finite value")]
  NonFinite(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedMetric {
  pub name: String,
  pub unit: String,
  pub count: usize,
  pub sum: f64,
  pub avg: f64,
  pub min: f64,
  pub max: f64,
  pub window_end: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApiUsageView {
  pub total_requests: f64,
  pub failed_requests: f64,
  pub rate_limited: f64,
  pub error_rate: f64,
  pub requests_by_provider: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CostView {
  pub total_cost: f64,
  pub average_cost_per_request: f64,
  pub cost_by_provider: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceView {
  pub average_latency_ms: f64,
  pub p95_latency_ms: f64,
  pub max_latency_ms: f64,
  pub average_job_duration_ms: f64,
  pub jobs_completed: f64,
  pub jobs_failed: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DerivedViews {
  pub api_usage: ApiUsageView,
  pub cost: CostView,
  pub performance: PerformanceView,
  pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsExport {
  pub prometheus: String,
  pub json: serde_json::Value,
  pub views: DerivedViews,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MetricsCleanup {
  pub points_removed: usize,
  pub alerts_removed: usize,
}

const RESOLVED_ALERT_TTL_HOURS: i64 = 24;

pub struct MetricsCollector {
  config: MetricsConfig,
  series: DashMap<String, TimeSeries>,
  /// Raw values recorded since the last aggregation pass.
  buffer: Mutex<HashMap<String, (String, Vec<f64>)>>,
  aggregates: DashMap<String, AggregatedMetric>,
  rules: RwLock<Vec<AlertRule>>,
  breach_started: Mutex<HashMap<String, Instant>>,
  alerts: Mutex<Vec<Alert>>,
  alert_tx: broadcast::Sender<Alert>,
  views: Mutex<Option<(Instant, DerivedViews)>>,
}

impl MetricsCollector {
  pub fn new(config: MetricsConfig) -> Self {
    let (alert_tx, _) = broadcast::channel(256);
    Self {
      config,
      series: DashMap::new(),
      buffer: Mutex::new(HashMap::new()),
      aggregates: DashMap::new(),
      rules: RwLock::new(Vec::new()),
      breach_started: Mutex::new(HashMap::new()),
      alerts: Mutex::new(Vec::new()),
      alert_tx,
      views: Mutex::new(None),
    }
  }

  pub fn config(&self) -> &MetricsConfig {
    &self.config
  }

  pub fn record(&self, name: &str, value: f64, unit: &str) {
    self.record_metric(name, value, unit, Tags::new());
  }

  pub fn record_metric(&self, name: &str, value: f64, unit: &str, tags: Tags) {
    let now = Utc::now();
    self.push_point(name, unit, MetricPoint { timestamp: now, value, tags });

    self
      .buffer
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .entry(name.to_string())
      .or_insert_with(|| (unit.to_string(), Vec::new()))
      .1
      .push(value);

    if let Err(e) = self.evaluate_alerts(name, value, now) {
      warn!("Alert evaluation skipped: {}", e);
    }
  }

  fn push_point(&self, name: &str, unit: &str, point: MetricPoint) {
    let mut series = self.series.entry(name.to_string()).or_insert_with(|| TimeSeries::new(name, unit));
    series.points.push_back(point);
    while series.points.len() > self.config.max_points_per_series {
      series.points.pop_front();
    }
  }

  pub fn series(&self, name: &str) -> Option<TimeSeries> {
    self.series.get(name).map(|s| s.value().clone())
  }

  pub fn series_names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.series.iter().map(|s| s.key().clone()).collect();
    names.sort();
    names
  }

  /// Folds every buffered value into sum/avg/min/max and clears the buffer.
  pub fn aggregate(&self) -> Vec<AggregatedMetric> {
    let drained = std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner));
    let now = Utc::now();
    let mut folded = Vec::with_capacity(drained.len());

    for (name, (unit, values)) in drained {
      if values.is_empty() {
        continue;
      }
      let sum: f64 = values.iter().sum();
      let aggregate = AggregatedMetric {
        count: values.len(),
        sum,
        avg: sum / values.len() as f64,
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        window_end: now,
        name: name.clone(),
        unit: unit.clone(),
      };
      for (suffix, value) in [("sum", aggregate.sum), ("avg", aggregate.avg), ("max", aggregate.max), ("min", aggregate.min)] {
        self.push_point(
          &format!("{}.{}", name, suffix),
          &unit,
          MetricPoint { timestamp: now, value, tags: Tags::new() },
        );
      }
      self.aggregates.insert(name, aggregate.clone());
      folded.push(aggregate);
    }

    folded.sort_by(|a, b| a.name.cmp(&b.name));
    debug!("Aggregated {} metrics", folded.len());
    folded
  }

  pub fn latest_aggregate(&self, name: &str) -> Option<AggregatedMetric> {
    self.aggregates.get(name).map(|a| a.value().clone())
  }

  pub fn add_rule(&self, rule: AlertRule) {
    let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
    rules.retain(|r| r.id != rule.id);
    rules.push(rule);
  }

  pub fn remove_rule(&self, rule_id: &str) -> bool {
    let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
    let before = rules.len();
    rules.retain(|r| r.id != rule_id);
    self.breach_started.lock().unwrap_or_else(PoisonError::into_inner).remove(rule_id);
    rules.len() != before
  }

  pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> bool {
    let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
    match rules.iter_mut().find(|r| r.id == rule_id) {
      Some(rule) => {
        rule.enabled = enabled;
        true
      }
      None => false,
    }
  }

  pub fn rules(&self) -> Vec<AlertRule> {
    self.rules.read().unwrap_or_else(PoisonError::into_inner).clone()
  }

  fn evaluate_alerts(&self, name: &str, value: f64, now: DateTime<Utc>) -> Result<(), AlertEvaluationError> {
    let matching: Vec<AlertRule> = self
      .rules
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
      .filter(|r| r.enabled && r.metric_name == name)
      .cloned()
      .collect();
    if matching.is_empty() {
      return Ok(());
    }
    if !value.is_finite() {
      return Err(AlertEvaluationError::NonFinite(name.to_string()));
    }

    let observed = Instant::now();
    let mut breaches = self.breach_started.lock().unwrap_or_else(PoisonError::into_inner);
    for rule in matching {
      if !rule.condition.is_breached(value, rule.threshold) {
        breaches.remove(&rule.id);
        continue;
      }
      let since = *breaches.entry(rule.id.clone()).or_insert(observed);
      if observed.duration_since(since) < rule.duration {
        continue;
      }

      let mut alerts = self.alerts.lock().unwrap_or_else(PoisonError::into_inner);
      if alerts.iter().any(|a| a.rule_id == rule.id && !a.resolved) {
        continue;
      }
      let alert = Alert {
        id: Uuid::new_v4(),
        rule_id: rule.id.clone(),
        metric_name: rule.metric_name.clone(),
        condition: rule.condition,
        threshold: rule.threshold,
        value,
        triggered_at: now,
        resolved: false,
        resolved_at: None,
      };
      warn!(
        "Alert {} fired: {} = {} ({:?} {})",
        rule.id, rule.metric_name, value, rule.condition, rule.threshold
      );
      alerts.push(alert.clone());
      let _ = self.alert_tx.send(alert);
    }
    Ok(())
  }

  pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
    self.alert_tx.subscribe()
  }

  pub fn active_alerts(&self) -> Vec<Alert> {
    self
      .alerts
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
      .filter(|a| !a.resolved)
      .cloned()
      .collect()
  }

  pub fn alert_history(&self) -> Vec<Alert> {
    self.alerts.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }

  pub fn resolve_alert(&self, alert_id: Uuid) -> bool {
    let mut alerts = self.alerts.lock().unwrap_or_else(PoisonError::into_inner);
    match alerts.iter_mut().find(|a| a.id == alert_id && !a.resolved) {
      Some(alert) => {
        alert.resolved = true;
        alert.resolved_at = Some(Utc::now());
        info!("Alert {} resolved", alert.rule_id);
        true
      }
      None => false,
    }
  }

  /// Drops points past retention and resolved alerts older than a day.
  pub fn cleanup(&self) -> MetricsCleanup {
    let now = Utc::now();
    let retention = chrono::Duration::from_std(self.config.retention).unwrap_or_else(|_| chrono::Duration::days(1));
    let cutoff = now - retention;

    let mut points_removed = 0;
    for mut series in self.series.iter_mut() {
      let before = series.points.len();
      series.points.retain(|p| p.timestamp >= cutoff);
      points_removed += before - series.points.len();
    }
    self.series.retain(|_, s| !s.points.is_empty());

    let alert_cutoff = now - chrono::Duration::hours(RESOLVED_ALERT_TTL_HOURS);
    let mut alerts = self.alerts.lock().unwrap_or_else(PoisonError::into_inner);
    let before = alerts.len();
    alerts.retain(|a| !(a.resolved && a.resolved_at.is_some_and(|at| at < alert_cutoff)));
    let alerts_removed = before - alerts.len();

    MetricsCleanup { points_removed, alerts_removed }
  }

  fn values(&self, name: &str) -> Vec<(f64, Tags)> {
    self
      .series
      .get(name)
      .map(|s| s.points.iter().map(|p| (p.value, p.tags.clone())).collect())
      .unwrap_or_default()
  }

  fn compute_views(&self) -> DerivedViews {
    let requests = self.values(names::API_REQUESTS);
    let errors = self.values(names::API_ERRORS);
    let rate_limited = self.values(names::RATE_LIMITED);
    let costs = self.values(names::API_COST);
    let mut latencies: Vec<f64> = self.values(names::API_LATENCY_MS).into_iter().map(|(v, _)| v).collect();
    let durations: Vec<f64> = self.values(names::JOB_DURATION_MS).into_iter().map(|(v, _)| v).collect();

    let total_requests = total(&requests);
    let failed_requests = total(&errors);
    let total_cost = total(&costs);

    latencies.sort_by(|a, b| a.total_cmp(b));
    let p95_latency_ms = if latencies.is_empty() {
      0.0
    } else {
      let rank = ((latencies.len() as f64) * 0.95).ceil() as usize;
      latencies[rank.clamp(1, latencies.len()) - 1]
    };

    DerivedViews {
      api_usage: ApiUsageView {
        total_requests,
        failed_requests,
        rate_limited: total(&rate_limited),
        error_rate: if total_requests > 0.0 { failed_requests / total_requests } else { 0.0 },
        requests_by_provider: group_by_provider(&requests),
      },
      cost: CostView {
        total_cost,
        average_cost_per_request: if total_requests > 0.0 { total_cost / total_requests } else { 0.0 },
        cost_by_provider: group_by_provider(&costs),
      },
      performance: PerformanceView {
        average_latency_ms: mean(&latencies),
        p95_latency_ms,
        max_latency_ms: latencies.last().copied().unwrap_or(0.0),
        average_job_duration_ms: mean(&durations),
        jobs_completed: total(&self.values(names::JOB_COMPLETED)),
        jobs_failed: total(&self.values(names::JOB_FAILED)),
      },
      computed_at: Utc::now(),
    }
  }

  /// Derived views, recomputed at most once per cache TTL.
  pub fn views(&self) -> DerivedViews {
    let mut cached = self.views.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some((at, views)) = cached.as_ref() {
      if at.elapsed() < self.config.view_cache_ttl {
        return views.clone();
      }
    }
    let views = self.compute_views();
    *cached = Some((Instant::now(), views.clone()));
    views
  }

  pub fn api_usage(&self) -> ApiUsageView {
    self.views().api_usage
  }

  pub fn cost(&self) -> CostView {
    self.views().cost
  }

  pub fn performance(&self) -> PerformanceView {
    self.views().performance
  }

  /// Latest value per tag set of every series, in the Prometheus text format.
  pub fn render_prometheus(&self) -> String {
    let registry = Registry::new();
    for name in self.series_names() {
      let Some(series) = self.series(&name) else {
        continue;
      };
      if let Err(e) = register_series(&registry, &series) {
        warn!("Series {} left out of the Prometheus export: {}", series.name, e);
      }
    }
    TextEncoder::new()
      .encode_to_string(&registry.gather())
      .unwrap_or_else(|e| format!("# Error encoding metrics: {}", e))
  }

  pub fn export_metrics(&self) -> MetricsExport {
    let mut series_json = serde_json::Map::new();
    for name in self.series_names() {
      let Some(series) = self.series(&name) else {
        continue;
      };
      series_json.insert(
        series.name.clone(),
        json!({
          "unit": series.unit,
          "points": series.points.len(),
          "latest": series.latest().map(|p| p.value),
        }),
      );
    }

    let aggregates: BTreeMap<String, AggregatedMetric> =
      self.aggregates.iter().map(|a| (a.key().clone(), a.value().clone())).collect();
    let views = self.views();
    let json = json!({
      "timestamp": Utc::now(),
      "series": series_json,
      "aggregates": aggregates,
      "active_alerts": self.active_alerts(),
      "views": views,
    });

    MetricsExport {
      prometheus: self.render_prometheus(),
      json,
      views,
    }
  }

  /// Runs `aggregate` every `aggregation_interval` until `shutdown` fires.
  pub fn spawn_aggregation(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
    let collector = self.clone();
    let period = self.config.aggregation_interval;
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.tick().await;
      loop {
        tokio::select! {
          _ = shutdown.cancelled() => break,
          _ = ticker.tick() => {
            collector.aggregate();
          }
        }
      }
    })
  }
}

fn group_by_provider(points: &[(f64, Tags)]) -> BTreeMap<String, f64> {
  let mut grouped = BTreeMap::new();
  for (value, tags) in points {
    let provider = tags.get("provider").cloned().unwrap_or_else(|| "unknown".to_string());
    *grouped.entry(provider).or_insert(0.0) += value;
  }
  grouped
}

fn total(points: &[(f64, Tags)]) -> f64 {
  points.iter().map(|(v, _)| v).sum()
}

fn mean(values: &[f64]) -> f64 {
  if values.is_empty() {
    0.0
  } else {
    values.iter().sum::<f64>() / values.len() as f64
  }
}

const PROMETHEUS_NAMESPACE: &str = "genq";

/// One gauge per series, one child per distinct tag set holding its latest value.
fn register_series(registry: &Registry, series: &TimeSeries) -> prometheus::Result<()> {
  let mut latest: BTreeMap<Vec<(String, String)>, f64> = BTreeMap::new();
  for point in &series.points {
    let labels = point.tags.iter().map(|(k, v)| (prometheus_ident(k), v.clone())).collect();
    latest.insert(labels, point.value);
  }
  let mut label_names: Vec<String> = latest.keys().flatten().map(|(k, _)| k.clone()).collect();
  label_names.sort();
  label_names.dedup();
  let label_refs: Vec<&str> = label_names.iter().map(String::as_str).collect();

  let gauge = GaugeVec::new(
    Opts::new(prometheus_ident(&series.name), format!("{} ({})", series.name, series.unit))
      .namespace(PROMETHEUS_NAMESPACE),
    label_refs.as_slice(),
  )?;
  for (labels, value) in &latest {
    let values: Vec<&str> = label_names
      .iter()
      .map(|name| labels.iter().find(|(k, _)| k == name).map_or("", |(_, v)| v.as_str()))
      .collect();
    gauge.get_metric_with_label_values(values.as_slice())?.set(*value);
  }
  registry.register(Box::new(gauge))
}

/// Maps a dotted metric or tag name onto `[a-zA-Z_][a-zA-Z0-9_]*`.
fn prometheus_ident(name: &str) -> String {
  let mut ident: String = name
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
    .collect();
  if !ident.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
    ident.insert(0, '_');
  }
  ident
}
