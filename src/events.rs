use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;
use uuid::Uuid;

use crate::models::{JobError, JobStatus};
use crate::queue_manager::{AlertEvent, SystemMetrics};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum QueueEvent {
  JobStarted {
    job_id: Uuid,
    worker_id: String,
    attempt: u32,
  },
  JobCompleted {
    job_id: Uuid,
    worker_id: String,
    duration_ms: u64,
    outputs: usize,
  },
  JobFailed {
    job_id: Uuid,
    worker_id: String,
    status: JobStatus,
    error: JobError,
  },
  JobRetried {
    job_id: Uuid,
    worker_id: String,
    attempt: u32,
    delay_ms: u64,
    reason: String,
  },
  SystemStarted {
    workers: usize,
    at: DateTime<Utc>,
  },
  SystemStopped {
    at: DateTime<Utc>,
  },
  WorkersScaled {
    from: usize,
    to: usize,
  },
  Alert(AlertEvent),
  MetricsUpdated(Box<SystemMetrics>),
  CleanupCompleted {
    jobs_removed: usize,
    points_removed: usize,
    alerts_removed: usize,
  },
}

impl QueueEvent {
  pub fn name(&self) -> &'static str {
    match self {
      QueueEvent::JobStarted { .. } => "jobStarted",
      QueueEvent::JobCompleted { .. } => "jobCompleted",
      QueueEvent::JobFailed { .. } => "jobFailed",
      QueueEvent::JobRetried { .. } => "jobRetried",
      QueueEvent::SystemStarted { .. } => "systemStarted",
      QueueEvent::SystemStopped { .. } => "systemStopped",
      QueueEvent::WorkersScaled { .. } => "workersScaled",
      QueueEvent::Alert(_) => "alert",
      QueueEvent::MetricsUpdated(_) => "metricsUpdated",
      QueueEvent::CleanupCompleted { .. } => "cleanupCompleted",
    }
  }
}

/// Fan-out of queue events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
  tx: broadcast::Sender<QueueEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity.max(1));
    Self { tx }
  }

  /// Publishing with nobody listening is not an error.
  pub fn publish(&self, event: QueueEvent) {
    let _ = self.tx.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
    self.tx.subscribe()
  }

  /// Subscription as a stream; lagged receivers skip what they missed.
  pub fn stream(&self) -> impl Stream<Item = QueueEvent> + Send + 'static {
    BroadcastStream::new(self.tx.subscribe()).filter_map(|item| async move {
      match item {
        Ok(event) => Some(event),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
          warn!("Event subscriber lagged, skipped {} events", skipped);
          None
        }
      }
    })
  }

  pub fn subscriber_count(&self) -> usize {
    self.tx.receiver_count()
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(1024)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn every_subscriber_sees_each_event() {
    let bus = EventBus::new(16);
    let mut first = bus.subscribe();
    let stream = bus.stream();
    tokio::pin!(stream);

    bus.publish(QueueEvent::WorkersScaled { from: 1, to: 3 });

    assert_eq!(first.recv().await.unwrap().name(), "workersScaled");
    let streamed = stream.next().await.unwrap();
    assert!(matches!(streamed, QueueEvent::WorkersScaled { from: 1, to: 3 }));
  }

  #[test]
  fn publishing_without_subscribers_is_fine() {
    let bus = EventBus::default();
    bus.publish(QueueEvent::SystemStopped { at: Utc::now() });
    assert_eq!(bus.subscriber_count(), 0);
  }
}
