//! Subscription handler logging inbound messages
//!
//! Registers the operator-facing callbacks on the session: one message
//! callback logging topic and payload, one acknowledgment callback logging
//! the granted QoS. After the SUBACK the handler performs no active work;
//! delivery runs entirely on the session's dispatch task.

use crate::session::{MqttSession, QoS, SessionError};
use tracing::info;

pub struct SubscriptionHandler;

impl SubscriptionHandler {
    /// Subscribe to the topic at QoS 1 with the logging callbacks
    pub async fn attach(session: &MqttSession, topic: &str) -> Result<(), SessionError> {
        session
            .subscribe(
                topic,
                QoS::AtLeastOnce,
                Box::new(|topic, payload| {
                    info!(
                        topic = %topic,
                        payload = %String::from_utf8_lossy(payload),
                        "Received a new message"
                    );
                }),
                Box::new(|granted| {
                    info!(granted = ?granted, "Subscription acknowledged, granted QoS");
                }),
            )
            .await
    }
}
