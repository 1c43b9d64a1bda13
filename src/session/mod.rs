//! MQTT session layer
//!
//! Wraps the rumqttc client behind a session that owns connection
//! establishment, reconnection with backoff, offline publish queueing, and
//! subscription dispatch. The module separates pure functions from I/O:
//!
//! - [`connection`] - Pure session state, tuning knobs, and option wiring
//! - [`events`] - Pure event routing and inbound message dispatch
//! - [`client`] - Impure I/O operations and supervisor coordination
//!
//! # Usage
//!
//! ```rust,no_run
//! use gpsthing::config::{validate, ConnectionConfig};
//! use gpsthing::session::{MqttSession, QoS};
//! # async fn run(raw: ConnectionConfig) -> Result<(), Box<dyn std::error::Error>> {
//! let config = validate(raw)?;
//! let mut session = MqttSession::new(&config)?;
//! session.connect().await?;
//! session
//!     .publish(&config.topic, b"{}".to_vec(), QoS::AtLeastOnce)
//!     .await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;

pub mod client;
pub mod connection;
pub mod events;

// Re-export public types for convenience
pub use client::MqttSession;
pub use connection::{
    ReconnectPolicy, SessionError, SessionState, TlsMaterials, TransportTuning,
};
pub use events::{EventRoute, InboundMessage, MessageCallback, SubAckCallback};
pub use rumqttc::v5::mqttbytes::QoS;

/// Outbound publish seam between the control loops and the session
///
/// The publish loop depends on this trait rather than on [`MqttSession`]
/// directly, which keeps it testable with an in-memory sink.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Publish a payload to a topic at the given QoS
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), SessionError>;
}
