//! gpsthing - Bidirectional MQTT pub/sub client
//!
//! A small operational client pair for TLS-secured IoT endpoints: a publisher
//! that emits a sequenced JSON payload on a fixed interval, and a receiver
//! that subscribes to a topic and logs incoming messages.
//!
//! # Overview
//!
//! This crate provides:
//! - Credential validation with mutual-exclusion rules between certificate
//!   and websocket authentication
//! - An MQTT session wrapping rumqttc with reconnect backoff and offline
//!   publish queueing
//! - A cancellable timed publish loop with a monotonic sequence counter
//! - A subscription handler with message and acknowledgment callbacks
//!
//! # Quick Start
//!
//! ```rust
//! use gpsthing::publisher::{MessageEnvelope, POLYGON_DESCRIPTOR};
//!
//! let envelope = MessageEnvelope {
//!     message: POLYGON_DESCRIPTOR.to_string(),
//!     sequence: 0,
//! };
//!
//! // Envelopes serialize to the wire format {"message": ..., "sequence": ...}
//! let json = serde_json::to_string(&envelope).unwrap();
//! assert!(json.contains("\"sequence\":0"));
//! ```

pub mod config;
pub mod observability;
pub mod publisher;
pub mod receiver;
pub mod session;
pub mod testing;

// Re-export the operational surface
pub use config::{validate, ConfigError, ConnectionConfig, Mode, ValidatedConfig};
pub use publisher::{MessageEnvelope, PublishLoop};
pub use receiver::SubscriptionHandler;
pub use session::{MessageSink, MqttSession, QoS, SessionError, SessionState};
