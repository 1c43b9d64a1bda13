//! Pure event routing and inbound message dispatch
//!
//! The event-loop supervisor polls rumqttc and turns each raw event into an
//! [`EventRoute`]. Inbound traffic crosses to the subscriber through mpsc
//! channels owned by the [`MessageDispatcher`], keeping the transport's
//! polling task decoupled from user callbacks.

use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet, SubscribeReasonCode};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::Event;
use tokio::sync::mpsc;
use tracing::warn;

/// Callback invoked once per inbound message with (topic, payload)
pub type MessageCallback = Box<dyn Fn(&str, &[u8]) + Send + 'static>;

/// Callback invoked once when the broker grants the subscription
pub type SubAckCallback = Box<dyn FnOnce(Option<QoS>) + Send + 'static>;

/// An inbound message as forwarded to the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// ConnAck with success code - ready to publish/subscribe
    ConnectionAcknowledged,
    /// ConnAck with a failure code - terminal, surfaced to the caller
    ConnectionRefused(String),
    /// Message received on a subscribed topic
    MessageReceived(InboundMessage),
    /// Broker disconnected the client
    Disconnected,
    /// Subscription confirmed; granted QoS per filter, `None` on failure codes
    SubscriptionConfirmed(Vec<Option<QoS>>),
    /// Infrastructure event (PingResp, acks, etc.)
    InfrastructureEvent(String),
    /// Outgoing event, handled by the transport
    OutgoingEvent,
}

/// Route a raw MQTT event to the supervisor's handling branch (pure function)
pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(incoming) => match incoming {
            Packet::ConnAck(connack) => {
                if connack.code == ConnectReturnCode::Success {
                    EventRoute::ConnectionAcknowledged
                } else {
                    EventRoute::ConnectionRefused(format!("{:?}", connack.code))
                }
            }
            Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                topic: String::from_utf8_lossy(&publish.topic).to_string(),
                payload: publish.payload.to_vec(),
            }),
            Packet::Disconnect(_) => EventRoute::Disconnected,
            Packet::SubAck(suback) => {
                EventRoute::SubscriptionConfirmed(granted_qos(&suback.return_codes))
            }
            other => EventRoute::InfrastructureEvent(format!("{other:?}")),
        },
        Event::Outgoing(_) => EventRoute::OutgoingEvent,
    }
}

/// Map SUBACK reason codes to granted QoS levels (pure function)
pub fn granted_qos(codes: &[SubscribeReasonCode]) -> Vec<Option<QoS>> {
    codes
        .iter()
        .map(|code| match code {
            SubscribeReasonCode::Success(qos) => Some(*qos),
            _ => None,
        })
        .collect()
}

/// Forwards inbound traffic from the supervisor to the dispatch task
///
/// Senders are registered by `subscribe`; until then inbound traffic is
/// logged and dropped, never buffered.
pub struct MessageDispatcher {
    message_tx: Option<mpsc::UnboundedSender<InboundMessage>>,
    suback_tx: Option<mpsc::UnboundedSender<Option<QoS>>>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self {
            message_tx: None,
            suback_tx: None,
        }
    }

    pub fn set_channels(
        &mut self,
        message_tx: mpsc::UnboundedSender<InboundMessage>,
        suback_tx: mpsc::UnboundedSender<Option<QoS>>,
    ) {
        self.message_tx = Some(message_tx);
        self.suback_tx = Some(suback_tx);
    }

    /// Forward an inbound message to the dispatch task
    pub fn forward_message(&self, message: InboundMessage) {
        match &self.message_tx {
            Some(tx) => {
                if tx.send(message).is_err() {
                    warn!("Message dispatch task stopped - inbound message dropped");
                }
            }
            None => {
                warn!(
                    topic = %message.topic,
                    "Received message with no subscription handler registered - dropped"
                );
            }
        }
    }

    /// Forward a subscription acknowledgment to the dispatch task
    pub fn forward_suback(&self, granted: Option<QoS>) {
        if let Some(tx) = &self.suback_tx {
            let _ = tx.send(granted);
        }
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the dispatch task that drains the inbound channels and invokes the
/// registered callbacks, preserving single-consumer semantics per topic
pub fn spawn_dispatch_task(
    mut message_rx: mpsc::UnboundedReceiver<InboundMessage>,
    mut suback_rx: mpsc::UnboundedReceiver<Option<QoS>>,
    on_message: MessageCallback,
    on_suback: SubAckCallback,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut on_suback = Some(on_suback);
        loop {
            tokio::select! {
                // Deliver a pending acknowledgment ahead of teardown
                biased;
                granted = suback_rx.recv(), if on_suback.is_some() => {
                    // The acknowledgment callback fires at most once; once it
                    // has (or its channel closed unacknowledged) only the
                    // message branch stays armed.
                    if let (Some(callback), Some(granted)) = (on_suback.take(), granted) {
                        callback(granted);
                    }
                }
                message = message_rx.recv() => match message {
                    Some(message) => on_message(&message.topic, &message.payload),
                    // Supervisor gone; nothing further can arrive
                    None => break,
                },
            }
        }
    })
}
