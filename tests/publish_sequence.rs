//! Publish loop behavior exercised through the public API with the mock sink

use gpsthing::publisher::{MessageEnvelope, PublishLoop, POLYGON_DESCRIPTOR};
use gpsthing::session::QoS;
use gpsthing::testing::RecordingSink;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

async fn run_until_published(
    sink: Arc<RecordingSink>,
    count: usize,
) -> Vec<(String, Vec<u8>, QoS)> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let publish_loop =
        PublishLoop::with_interval(sink.clone(), "sdk/test/Python", Duration::from_millis(5));
    let handle = tokio::spawn(publish_loop.run(shutdown_rx));

    tokio::time::timeout(Duration::from_secs(5), async {
        while sink.published_count().await < count {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("publish loop should reach the expected tick count");

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    sink.published().await
}

#[tokio::test]
async fn envelopes_carry_monotonic_sequences_from_zero() {
    let sink = Arc::new(RecordingSink::new());
    let published = run_until_published(sink, 3).await;

    for (index, (topic, payload, qos)) in published.iter().take(3).enumerate() {
        assert_eq!(topic, "sdk/test/Python");
        assert_eq!(*qos, QoS::AtLeastOnce);

        let envelope: MessageEnvelope = serde_json::from_slice(payload).unwrap();
        assert_eq!(envelope.sequence, index as u64);
        assert_eq!(envelope.message, POLYGON_DESCRIPTOR);
    }
}

#[tokio::test]
async fn wire_payload_is_a_json_object_with_message_and_sequence() {
    let sink = Arc::new(RecordingSink::new());
    let published = run_until_published(sink, 1).await;

    let value: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
    let object = value.as_object().expect("payload should be a JSON object");
    assert_eq!(object.len(), 2);
    assert!(object["message"].is_string());
    assert!(object["sequence"].is_u64());
}

#[tokio::test]
async fn failed_publishes_still_advance_the_sequence() {
    let sink = Arc::new(RecordingSink::new());
    sink.set_failing(true);
    let published = run_until_published(sink, 4).await;

    let last: MessageEnvelope = serde_json::from_slice(&published[3].1).unwrap();
    assert_eq!(last.sequence, 3);
}
