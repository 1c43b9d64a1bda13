//! Testing utilities and mock implementations
//!
//! Provides a mock message sink so the publish loop can be tested without an
//! MQTT broker.

pub mod mocks;

pub use mocks::*;
