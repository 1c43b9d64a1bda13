//! Timed publish loop emitting sequenced message envelopes
//!
//! Builds a [`MessageEnvelope`] on a fixed interval, serializes it to JSON,
//! and publishes it at QoS 1 through a [`MessageSink`]. Publish failures are
//! logged and the loop keeps ticking; only the shutdown signal stops it.

use crate::session::{MessageSink, QoS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Interval between publish ticks
pub const PUBLISH_INTERVAL: Duration = Duration::from_secs(5);

/// Fixed demonstration payload: a geographic polygon descriptor
pub const POLYGON_DESCRIPTOR: &str =
    "{'type': 'Polygon','Coordinates': [[[30, 10], [10, 10], [10, 0], [20, 40]]]}";

/// Wire payload published on every tick
///
/// The sequence counter starts at 0, increments per publish, and resets only
/// on process restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message: String,
    pub sequence: u64,
}

/// Publish loop running until the shutdown signal flips
pub struct PublishLoop<S> {
    sink: Arc<S>,
    topic: String,
    interval: Duration,
    sequence: u64,
}

impl<S: MessageSink> PublishLoop<S> {
    pub fn new(sink: Arc<S>, topic: impl Into<String>) -> Self {
        Self::with_interval(sink, topic, PUBLISH_INTERVAL)
    }

    /// Build a loop with an explicit tick interval
    pub fn with_interval(sink: Arc<S>, topic: impl Into<String>, interval: Duration) -> Self {
        Self {
            sink,
            topic: topic.into(),
            interval,
            sequence: 0,
        }
    }

    /// Run the loop; the first envelope publishes immediately
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            topic = %self.topic,
            interval_ms = self.interval.as_millis() as u64,
            "Starting publish loop"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.publish_tick().await,
            }
        }

        info!(published = self.sequence, "Publish loop stopped");
    }

    /// Publish one envelope and advance the sequence counter
    ///
    /// The counter advances once the publish call has been issued, whether or
    /// not the broker acknowledges it.
    async fn publish_tick(&mut self) {
        let envelope = MessageEnvelope {
            message: POLYGON_DESCRIPTOR.to_string(),
            sequence: self.sequence,
        };

        let json = match serde_json::to_string(&envelope) {
            Ok(json) => json,
            Err(error) => {
                error!(error = %error, "Failed to serialize message envelope");
                return;
            }
        };

        match self
            .sink
            .publish(&self.topic, json.clone().into_bytes(), QoS::AtLeastOnce)
            .await
        {
            Ok(()) => info!(topic = %self.topic, payload = %json, "Published topic"),
            Err(error) => {
                warn!(
                    topic = %self.topic,
                    sequence = envelope.sequence,
                    error = %error,
                    "Publish failed, continuing"
                );
            }
        }

        self.sequence += 1;
    }
}
