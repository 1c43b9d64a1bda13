//! Mock implementations for testing

use crate::session::{MessageSink, QoS, SessionError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

pub type PublishedMessage = (String, Vec<u8>, QoS);

/// In-memory message sink recording every publish call
#[derive(Debug, Default)]
pub struct RecordingSink {
    published: Mutex<Vec<PublishedMessage>>,
    should_fail: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish call fail after recording it
    pub fn set_failing(&self, failing: bool) {
        self.should_fail.store(failing, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    pub async fn published_count(&self) -> usize {
        self.published.lock().await.len()
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), SessionError> {
        self.published
            .lock()
            .await
            .push((topic.to_string(), payload, qos));

        if self.should_fail.load(Ordering::SeqCst) {
            Err(SessionError::PublishFailed(
                "mock publish failure".to_string().into(),
            ))
        } else {
            Ok(())
        }
    }
}
