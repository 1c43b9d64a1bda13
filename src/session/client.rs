//! Impure I/O operations for the MQTT session
//!
//! This module owns the rumqttc client and its event loop: connection
//! establishment with ConnAck confirmation, the reconnection supervisor with
//! exponential backoff, offline publish queueing with paced draining, and the
//! publish/subscribe operations exposed to the control loops.

use super::connection::{
    configure_mqtt_options, load_tls_materials, SessionError, SessionState, TlsMaterials,
    TransportTuning,
};
use super::events::{
    route_mqtt_event, spawn_dispatch_task, EventRoute, MessageCallback, MessageDispatcher,
    SubAckCallback,
};
use super::MessageSink;
use crate::config::ValidatedConfig;
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Request channel capacity between the client handle and the event loop
const CLIENT_CHANNEL_CAPACITY: usize = 10;

/// A publish buffered while the transport is offline
#[derive(Debug, Clone)]
struct QueuedPublish {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
}

/// MQTT session wrapping the rumqttc client and event loop
///
/// Create with [`MqttSession::new`], call [`connect`](MqttSession::connect)
/// once, then share the session by reference between the publish loop and the
/// subscription handler. Reconnection after an established connection drops
/// is handled internally; only terminal failures surface to the caller.
pub struct MqttSession {
    config: ValidatedConfig,
    tls: TlsMaterials,
    tuning: TransportTuning,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: std::sync::Mutex<Option<EventLoop>>,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    supervisor_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    dispatcher: Arc<Mutex<MessageDispatcher>>,
    offline_queue: Arc<Mutex<VecDeque<QueuedPublish>>>,
    draining: Arc<AtomicBool>,
}

impl MqttSession {
    /// Build a session from validated configuration with default tuning
    ///
    /// Reads the PEM credential files; does not touch the network.
    pub fn new(config: &ValidatedConfig) -> Result<Self, SessionError> {
        Self::with_tuning(config, TransportTuning::default())
    }

    /// Build a session with explicit transport tuning
    pub fn with_tuning(
        config: &ValidatedConfig,
        tuning: TransportTuning,
    ) -> Result<Self, SessionError> {
        let tls = load_tls_materials(config)?;
        let options = configure_mqtt_options(config, &tls);
        let (client, event_loop) = AsyncClient::new(options, CLIENT_CHANNEL_CAPACITY);

        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(MqttSession {
            config: config.clone(),
            tls,
            tuning,
            client: Arc::new(Mutex::new(client)),
            event_loop: std::sync::Mutex::new(Some(event_loop)),
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            supervisor_handle: std::sync::Mutex::new(None),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            dispatcher: Arc::new(Mutex::new(MessageDispatcher::new())),
            offline_queue: Arc::new(Mutex::new(VecDeque::new())),
            draining: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Connect to the broker
    ///
    /// Spawns the event-loop supervisor and blocks until the broker
    /// acknowledges the connection or the connect timeout elapses.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        let event_loop = self
            .event_loop
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .ok_or_else(|| {
                SessionError::ConnectionFailed("event loop already started".to_string())
            })?;

        let _ = self.state_tx.send(SessionState::Connecting);

        let supervisor = Supervisor {
            config: self.config.clone(),
            tls: self.tls.clone(),
            tuning: self.tuning.clone(),
            client: self.client.clone(),
            subscriptions: self.subscriptions.clone(),
            dispatcher: self.dispatcher.clone(),
            offline_queue: self.offline_queue.clone(),
            draining: self.draining.clone(),
        };
        let state_tx = self.state_tx.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            supervisor.run(event_loop, state_tx, shutdown_rx).await;
        });
        if let Ok(mut guard) = self.supervisor_handle.lock() {
            *guard = Some(handle);
        }

        Self::wait_for_connection_ack(self.state_rx.clone(), self.tuning.connect_timeout).await
    }

    /// Wait for the supervisor to report Connected, a terminal failure, or the
    /// connect timeout
    async fn wait_for_connection_ack(
        mut state_rx: watch::Receiver<SessionState>,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let wait = tokio::time::timeout(timeout, async {
            loop {
                let state = state_rx.borrow().clone();
                match state {
                    SessionState::Connected => return Ok(()),
                    SessionState::Failed(reason) => {
                        return Err(SessionError::ConnectionRejected(reason));
                    }
                    SessionState::Connecting | SessionState::Disconnected => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(SessionError::ConnectionFailed(
                        "state channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        match wait {
            Ok(result) => result,
            Err(_) => Err(SessionError::ConnectTimeout(timeout)),
        }
    }

    /// Current session state
    pub fn connection_state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    /// Watch channel receiving every session state transition
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Number of publishes buffered while the transport is offline
    pub async fn offline_backlog(&self) -> usize {
        self.offline_queue.lock().await.len()
    }

    /// Publish a payload to a topic
    ///
    /// While the transport is offline the payload is buffered, not dropped;
    /// the queue drains at the configured pace once the connection returns.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> Result<(), SessionError> {
        match self.connection_state() {
            SessionState::Connected => {}
            SessionState::Failed(reason) => {
                return Err(SessionError::ConnectionFailed(reason));
            }
            SessionState::Connecting | SessionState::Disconnected => {
                return self.enqueue_offline(topic, payload, qos).await;
            }
        }

        let client = self.client.lock().await;
        let call = client.publish(topic.to_string(), qos, false, payload);
        match tokio::time::timeout(self.tuning.operation_timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(SessionError::PublishFailed(Box::new(error))),
            Err(_) => Err(SessionError::OperationTimeout(self.tuning.operation_timeout)),
        }
    }

    async fn enqueue_offline(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> Result<(), SessionError> {
        let mut queue = self.offline_queue.lock().await;
        if let Some(limit) = self.tuning.offline_queue_limit {
            while queue.len() >= limit.max(1) {
                queue.pop_front();
                warn!("Offline publish queue full - dropping oldest message");
            }
        }
        queue.push_back(QueuedPublish {
            topic: topic.to_string(),
            payload,
            qos,
        });
        debug!(topic = %topic, backlog = queue.len(), "Transport offline - publish queued");
        Ok(())
    }

    /// Subscribe to a topic, registering the message and acknowledgment
    /// callbacks
    ///
    /// The message callback fires once per inbound message with (topic,
    /// payload); the acknowledgment callback fires once with the granted QoS.
    /// Subscriptions are re-issued automatically after every reconnect. When
    /// called while the transport is offline the SUBSCRIBE itself is deferred
    /// to the next ConnAck.
    pub async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        on_message: MessageCallback,
        on_suback: SubAckCallback,
    ) -> Result<(), SessionError> {
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (suback_tx, suback_rx) = mpsc::unbounded_channel();
        self.dispatcher
            .lock()
            .await
            .set_channels(message_tx, suback_tx);
        // The dispatch task runs detached; it exits when the channels close
        let _ = spawn_dispatch_task(message_rx, suback_rx, on_message, on_suback);

        self.subscriptions
            .lock()
            .await
            .push((topic.to_string(), qos));

        if self.connection_state() != SessionState::Connected {
            debug!(topic = %topic, "Transport offline - subscription deferred to next ConnAck");
            return Ok(());
        }

        info!(topic = %topic, "Subscribing");
        let client = self.client.lock().await;
        let call = client.subscribe(topic.to_string(), qos);
        match tokio::time::timeout(self.tuning.operation_timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(SessionError::SubscribeFailed(Box::new(error))),
            Err(_) => Err(SessionError::OperationTimeout(self.tuning.operation_timeout)),
        }
    }

    /// Disconnect from the broker and stop the supervisor
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let _ = self.shutdown_tx.send(true);
        debug!("Sent shutdown signal to reconnection supervisor");

        {
            // Best effort: the broker may already be gone
            let client = self.client.lock().await;
            let _ = client.disconnect().await;
        }
        let _ = self.state_tx.send(SessionState::Disconnected);

        let handle = self
            .supervisor_handle
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            match tokio::time::timeout(self.tuning.connect_timeout, handle).await {
                Ok(Ok(())) => info!("Event loop task shut down gracefully"),
                Ok(Err(error)) if !error.is_cancelled() => {
                    warn!(error = %error, "Event loop task ended with error");
                }
                Err(_) => warn!("Event loop task did not stop within the disconnect timeout"),
                _ => {}
            }
        }

        info!("MQTT session disconnected");
        Ok(())
    }
}

#[async_trait]
impl MessageSink for MqttSession {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), SessionError> {
        MqttSession::publish(self, topic, payload, qos).await
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Ok(mut guard) = self.supervisor_handle.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

/// Shared handles for the event-loop supervisor task
struct Supervisor {
    config: ValidatedConfig,
    tls: TlsMaterials,
    tuning: TransportTuning,
    client: Arc<Mutex<AsyncClient>>,
    subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    dispatcher: Arc<Mutex<MessageDispatcher>>,
    offline_queue: Arc<Mutex<VecDeque<QueuedPublish>>>,
    draining: Arc<AtomicBool>,
}

impl Supervisor {
    /// Drive the event loop until shutdown or a terminal failure
    ///
    /// Transient network errors and broker disconnects trigger reconnection
    /// with exponential backoff; a rejected ConnAck is terminal.
    async fn run(
        self,
        mut event_loop: EventLoop,
        state_tx: watch::Sender<SessionState>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!(
            client_id = %self.config.client_id,
            "Starting MQTT event loop with reconnection supervisor"
        );
        let mut reconnect_attempts = 0u32;
        let mut connected_at: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping reconnection supervisor");
                        break;
                    }
                }

                event = event_loop.poll() => match event {
                    Ok(event) => match route_mqtt_event(&event) {
                        EventRoute::ConnectionAcknowledged => {
                            let _ = state_tx.send(SessionState::Connected);
                            connected_at = Some(Instant::now());
                            info!("MQTT connection established");
                            self.resubscribe().await;
                            self.spawn_drain_task();
                        }
                        EventRoute::ConnectionRefused(reason) => {
                            error!(reason = %reason, "Broker rejected the connection, giving up");
                            let _ = state_tx.send(SessionState::Failed(reason));
                            break;
                        }
                        EventRoute::MessageReceived(message) => {
                            debug!(topic = %message.topic, "Received MQTT message");
                            self.dispatcher.lock().await.forward_message(message);
                        }
                        EventRoute::SubscriptionConfirmed(granted) => {
                            debug!(granted = ?granted, "Subscription confirmed");
                            let first = granted.first().copied().flatten();
                            self.dispatcher.lock().await.forward_suback(first);
                        }
                        EventRoute::Disconnected => {
                            warn!("Broker disconnected the session");
                            if !self
                                .backoff_and_reconnect(
                                    &state_tx,
                                    &mut shutdown_rx,
                                    &mut reconnect_attempts,
                                    &mut connected_at,
                                    &mut event_loop,
                                )
                                .await
                            {
                                break;
                            }
                        }
                        EventRoute::InfrastructureEvent(event) => {
                            debug!(event = %event, "MQTT event");
                        }
                        EventRoute::OutgoingEvent => {}
                    },
                    Err(error) => {
                        warn!(error = %error, "MQTT event loop error");
                        if !self
                            .backoff_and_reconnect(
                                &state_tx,
                                &mut shutdown_rx,
                                &mut reconnect_attempts,
                                &mut connected_at,
                                &mut event_loop,
                            )
                            .await
                        {
                            break;
                        }
                    }
                }
            }
        }

        info!("MQTT event loop stopped");
    }

    /// Sleep out the backoff delay and rebuild the connection
    ///
    /// Returns false when the supervisor should stop instead of retrying.
    async fn backoff_and_reconnect(
        &self,
        state_tx: &watch::Sender<SessionState>,
        shutdown_rx: &mut watch::Receiver<bool>,
        attempts: &mut u32,
        connected_at: &mut Option<Instant>,
        event_loop: &mut EventLoop,
    ) -> bool {
        // A connection that stayed up past the stable threshold restarts the
        // backoff ladder from the base delay
        if let Some(at) = connected_at.take() {
            if self.tuning.reconnect.is_stable(at.elapsed()) {
                *attempts = 0;
            }
        }
        *attempts += 1;
        let delay = self.tuning.reconnect.backoff_delay(*attempts);
        let _ = state_tx.send(SessionState::Connecting);
        info!(
            attempt = *attempts,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting after backoff delay"
        );

        let shutdown = tokio::select! {
            changed = shutdown_rx.changed() => match changed {
                Ok(()) => *shutdown_rx.borrow(),
                Err(_) => true,
            },
            _ = tokio::time::sleep(delay) => false,
        };
        if shutdown {
            info!("Shutdown signal received during reconnection delay, stopping");
            return false;
        }

        let options = configure_mqtt_options(&self.config, &self.tls);
        let (new_client, new_event_loop) = AsyncClient::new(options, CLIENT_CHANNEL_CAPACITY);
        *event_loop = new_event_loop;
        *self.client.lock().await = new_client;
        debug!("Created new connection for reconnection attempt");
        true
    }

    /// Re-issue every recorded subscription after a (re)connect
    async fn resubscribe(&self) {
        let subscriptions = self.subscriptions.lock().await.clone();
        let client = self.client.lock().await;
        for (topic, qos) in subscriptions {
            if let Err(error) = client.subscribe(topic.clone(), qos).await {
                error!(topic = %topic, error = %error, "Failed to subscribe");
            } else {
                debug!(topic = %topic, "Subscribed");
            }
        }
    }

    /// Flush the offline queue at the configured draining pace
    fn spawn_drain_task(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            // A drain pass is already running
            return;
        }

        let client = self.client.clone();
        let queue = self.offline_queue.clone();
        let draining = self.draining.clone();
        let interval = self.tuning.draining_interval;

        tokio::spawn(async move {
            let backlog = queue.lock().await.len();
            if backlog > 0 {
                info!(backlog, "Draining offline publish queue");
            }
            loop {
                let next = queue.lock().await.pop_front();
                let Some(message) = next else { break };

                let result = {
                    let client = client.lock().await;
                    client
                        .publish(message.topic.clone(), message.qos, false, message.payload.clone())
                        .await
                };
                if let Err(error) = result {
                    warn!(error = %error, "Drain publish failed - message requeued");
                    queue.lock().await.push_front(message);
                    break;
                }
                tokio::time::sleep(interval).await;
            }
            draining.store(false, Ordering::SeqCst);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use std::path::PathBuf;

    fn test_config(dir: &tempfile::TempDir) -> ValidatedConfig {
        let write = |name: &str| -> PathBuf {
            let path = dir.path().join(name);
            std::fs::write(&path, b"-----BEGIN CERTIFICATE-----\ntest\n").unwrap();
            path
        };
        ValidatedConfig {
            endpoint: "localhost".to_string(),
            root_ca_path: write("root.pem"),
            certificate_path: Some(write("cert.pem")),
            private_key_path: Some(write("key.pem")),
            port: 8883,
            use_websocket: false,
            client_id: "test-client".to_string(),
            topic: "sdk/test/Python".to_string(),
            mode: Mode::Both,
            message: "Hello World!".to_string(),
        }
    }

    #[tokio::test]
    async fn test_state_is_disconnected_before_connect() {
        let dir = tempfile::tempdir().unwrap();
        let session = MqttSession::new(&test_config(&dir)).unwrap();
        assert_eq!(session.connection_state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_publish_while_offline_is_queued() {
        let dir = tempfile::tempdir().unwrap();
        let session = MqttSession::new(&test_config(&dir)).unwrap();

        session
            .publish("sdk/test/Python", b"one".to_vec(), QoS::AtLeastOnce)
            .await
            .unwrap();
        session
            .publish("sdk/test/Python", b"two".to_vec(), QoS::AtLeastOnce)
            .await
            .unwrap();

        assert_eq!(session.offline_backlog().await, 2);
        let queue = session.offline_queue.lock().await;
        assert_eq!(queue[0].payload, b"one");
        assert_eq!(queue[1].payload, b"two");
    }

    #[tokio::test]
    async fn test_offline_queue_limit_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let tuning = TransportTuning {
            offline_queue_limit: Some(2),
            ..TransportTuning::default()
        };
        let session = MqttSession::with_tuning(&test_config(&dir), tuning).unwrap();

        for payload in [b"one" as &[u8], b"two", b"three"] {
            session
                .publish("sdk/test/Python", payload.to_vec(), QoS::AtLeastOnce)
                .await
                .unwrap();
        }

        assert_eq!(session.offline_backlog().await, 2);
        let queue = session.offline_queue.lock().await;
        assert_eq!(queue[0].payload, b"two");
        assert_eq!(queue[1].payload, b"three");
    }

    #[tokio::test]
    async fn test_publish_after_terminal_failure_errors() {
        let dir = tempfile::tempdir().unwrap();
        let session = MqttSession::new(&test_config(&dir)).unwrap();
        session
            .state_tx
            .send(SessionState::Failed("NotAuthorized".to_string()))
            .unwrap();

        let result = session
            .publish("sdk/test/Python", b"payload".to_vec(), QoS::AtLeastOnce)
            .await;
        assert!(matches!(result, Err(SessionError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_subscribe_while_offline_is_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let session = MqttSession::new(&test_config(&dir)).unwrap();

        session
            .subscribe(
                "sdk/test/Python",
                QoS::AtLeastOnce,
                Box::new(|_, _| {}),
                Box::new(|_| {}),
            )
            .await
            .unwrap();

        let subscriptions = session.subscriptions.lock().await;
        assert_eq!(
            *subscriptions,
            vec![("sdk/test/Python".to_string(), QoS::AtLeastOnce)]
        );
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let dir = tempfile::tempdir().unwrap();
        let session = MqttSession::new(&test_config(&dir)).unwrap();
        assert!(session.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connection_ack_success() {
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(SessionState::Connected);
        });

        let result =
            MqttSession::wait_for_connection_ack(state_rx, Duration::from_millis(200)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connection_ack_timeout() {
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);

        // Keep the sender alive without ever signalling Connected
        let _handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(state_tx);
        });

        let result =
            MqttSession::wait_for_connection_ack(state_rx, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(SessionError::ConnectTimeout(_))));
    }

    #[tokio::test]
    async fn test_wait_for_connection_ack_rejection() {
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(SessionState::Failed("BadUserNamePassword".to_string()));
        });

        let result =
            MqttSession::wait_for_connection_ack(state_rx, Duration::from_millis(200)).await;
        match result {
            Err(SessionError::ConnectionRejected(reason)) => {
                assert!(reason.contains("BadUserNamePassword"));
            }
            other => panic!("Expected ConnectionRejected, got {other:?}"),
        }
    }
}
