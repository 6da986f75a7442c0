//! Outcome logger: best-effort publication of engagement outcomes.
//!
//! Events go to a durable JetStream stream. Each publish opens its own
//! connection; nothing is held between displays. Failures are logged and
//! dropped, and [`OutcomeSink::submit`] never waits on the broker.

use crate::config::Queue;
use crate::model::{EngagementOutcome, EngagementState};
use anyhow::{Context, Result};
use async_nats::jetstream::{self, stream::StorageType};
use async_nats::{ConnectOptions, HeaderMap};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Receives one outcome per display. Implementations must return immediately.
pub trait OutcomeSink: Send + Sync {
    fn submit(&self, outcome: EngagementOutcome);
}

/// Wire event consumed by the activity report pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutcomeEvent {
    /// Constant id of this log stream, not the displayed message.
    pub message_id: i64,
    pub email: String,
    #[serde(rename = "zona")]
    pub zone: u8,
    #[serde(rename = "estado")]
    pub state: EngagementState,
    /// UTC, second precision.
    pub timestamp: String,
}

impl OutcomeEvent {
    pub fn new(log_stream_id: i64, identity: &str, outcome: &EngagementOutcome) -> Self {
        Self {
            message_id: log_stream_id,
            email: identity.to_string(),
            zone: outcome.zone,
            state: outcome.state,
            timestamp: outcome.timestamp.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NatsOutcomeLogger {
    queue: Queue,
    identity: String,
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl NatsOutcomeLogger {
    pub fn new(queue: Queue, identity: String) -> Self {
        Self {
            queue,
            identity,
            pending: Arc::default(),
        }
    }

    /// Wait for publishes still in flight. Used before the process exits.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = match self.pending.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(?err, "outcome publish task failed");
            }
        }
    }

    pub fn event_for(&self, outcome: &EngagementOutcome) -> OutcomeEvent {
        OutcomeEvent::new(self.queue.log_stream_id, &self.identity, outcome)
    }

    /// Connect, ensure the stream, publish one event and wait for the stream ack.
    pub async fn publish(&self, event: &OutcomeEvent) -> Result<()> {
        let mut options = ConnectOptions::new()
            .name("popcast-agent")
            .connection_timeout(self.queue.connect_timeout());
        if let (Some(user), Some(pass)) = (&self.queue.username, &self.queue.password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }
        let client = options
            .connect(self.queue.url.as_str())
            .await
            .context("failed to connect to NATS")?;
        let js = jetstream::new(client);

        js.get_or_create_stream(jetstream::stream::Config {
            name: self.queue.stream.clone(),
            subjects: vec![self.queue.subject.clone()],
            storage: StorageType::File,
            ..Default::default()
        })
        .await
        .context("failed to ensure outcome stream")?;

        let payload = serde_json::to_vec(event)?;
        let mut headers = HeaderMap::new();
        headers.insert("Nats-Msg-Id", Uuid::new_v4().to_string().as_str());

        let ack = js
            .publish_with_headers(self.queue.subject.clone(), headers, payload.into())
            .await
            .context("failed to publish outcome")?;
        ack.await.context("outcome not acknowledged by stream")?;
        Ok(())
    }
}

impl OutcomeSink for NatsOutcomeLogger {
    fn submit(&self, outcome: EngagementOutcome) {
        let event = self.event_for(&outcome);
        let logger = self.clone();
        let handle = tokio::spawn(async move {
            match logger.publish(&event).await {
                Ok(()) => info!(zone = event.zone, state = event.state.as_str(), "outcome published"),
                Err(err) => warn!(?err, zone = event.zone, state = event.state.as_str(), "failed to publish outcome"),
            }
        });
        if let Ok(mut pending) = self.pending.lock() {
            pending.retain(|h| !h.is_finished());
            pending.push(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn queue() -> Queue {
        Queue {
            // Nothing listens here; connections fail fast.
            url: "nats://127.0.0.1:1".into(),
            username: None,
            password: None,
            stream: "ACTIVITY".into(),
            subject: "activity_queue".into(),
            log_stream_id: 1,
            connect_timeout_secs: 1,
        }
    }

    fn outcome() -> EngagementOutcome {
        EngagementOutcome {
            message_id: 7,
            state: EngagementState::Read,
            zone: 4,
            timestamp: Utc.with_ymd_and_hms(2026, 10, 18, 15, 4, 5).unwrap(),
        }
    }

    #[test]
    fn event_uses_wire_names() {
        let logger = NatsOutcomeLogger::new(queue(), "luis.salazar".into());
        let event = logger.event_for(&outcome());
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "message_id": 1,
                "email": "luis.salazar",
                "zona": 4,
                "estado": "Leído",
                "timestamp": "2026-10-18T15:04:05Z"
            })
        );
    }

    #[tokio::test]
    async fn publish_failure_is_an_error_not_a_panic() {
        let logger = NatsOutcomeLogger::new(queue(), "luis".into());
        let event = logger.event_for(&outcome());
        assert!(logger.publish(&event).await.is_err());
    }

    #[tokio::test]
    async fn submit_returns_immediately_when_broker_is_down() {
        let logger = NatsOutcomeLogger::new(queue(), "luis".into());
        logger.submit(outcome());
        logger.drain().await;
        assert!(logger.pending.lock().unwrap().is_empty());
    }
}
