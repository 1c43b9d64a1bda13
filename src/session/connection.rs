//! Pure connection state management for the MQTT session
//!
//! This module contains the session state machine, transport tuning knobs,
//! credential material loading, and MQTT option construction. Everything here
//! is synchronous and side-effect free except [`load_tls_materials`], which
//! reads the PEM files named by the validated configuration.

use crate::config::ValidatedConfig;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Connection state for the MQTT session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// No connection attempt issued yet, or cleanly disconnected
    Disconnected,
    /// Waiting for the broker to acknowledge, including reconnect attempts
    Connecting,
    /// ConnAck received, ready for publish and subscribe operations
    Connected,
    /// Terminal failure surfaced to the caller (timeout, credential rejection)
    Failed(String),
}

/// Reconnection backoff policy
///
/// Delays double from `base` up to `max`. A connection that stays up for at
/// least `stable_threshold` resets the attempt counter, so a long-lived
/// session that drops starts over at the base delay.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    pub stable_threshold: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(32),
            stable_threshold: Duration::from_secs(20),
        }
    }
}

impl ReconnectPolicy {
    /// Backoff delay for the given attempt (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max)
    }

    /// True when a connection that lasted `connected_for` counts as stable
    pub fn is_stable(&self, connected_for: Duration) -> bool {
        connected_for >= self.stable_threshold
    }
}

/// Transport tuning applied to every session
#[derive(Debug, Clone)]
pub struct TransportTuning {
    pub reconnect: ReconnectPolicy,
    /// Offline publish queue depth; `None` queues without bound
    pub offline_queue_limit: Option<usize>,
    /// Pause between publishes while flushing the offline queue (2 Hz)
    pub draining_interval: Duration,
    /// Connect/disconnect timeout
    pub connect_timeout: Duration,
    /// Per-operation timeout for publish and subscribe calls
    pub operation_timeout: Duration,
}

impl Default for TransportTuning {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            offline_queue_limit: None,
            draining_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(5),
        }
    }
}

/// MQTT session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to read credential file {path}")]
    CredentialRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("connection not acknowledged within {0:?}")]
    ConnectTimeout(Duration),
    #[error("broker rejected connection: {0}")]
    ConnectionRejected(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("subscription failed")]
    SubscribeFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("operation timed out after {0:?}")]
    OperationTimeout(Duration),
}

/// PEM material handed to the rustls transport unparsed
#[derive(Clone)]
pub struct TlsMaterials {
    pub root_ca: Vec<u8>,
    /// Client certificate and private key for mutual TLS; absent in websocket mode
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

fn read_pem(path: &Path) -> Result<Vec<u8>, SessionError> {
    std::fs::read(path).map_err(|source| SessionError::CredentialRead {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the PEM files named by the validated configuration
///
/// Websocket mode loads the root CA only (server-auth TLS over the tunnel);
/// certificate mode additionally loads the client certificate and key.
pub fn load_tls_materials(config: &ValidatedConfig) -> Result<TlsMaterials, SessionError> {
    let root_ca = read_pem(&config.root_ca_path)?;

    let client_auth = if config.use_websocket {
        None
    } else {
        match (&config.certificate_path, &config.private_key_path) {
            (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
            // Validation guarantees both paths are present in certificate mode
            _ => None,
        }
    };

    Ok(TlsMaterials {
        root_ca,
        client_auth,
    })
}

/// Pure function to configure MQTT options from the validated configuration
///
/// Used for the initial connection and for every reconnection attempt.
pub fn configure_mqtt_options(config: &ValidatedConfig, tls: &TlsMaterials) -> MqttOptions {
    let mut options = if config.use_websocket {
        // The websocket transport takes the full URL as the broker address;
        // the port argument is carried for completeness but unused by rumqttc.
        let url = format!("wss://{}:{}/mqtt", config.endpoint, config.port);
        let mut options = MqttOptions::new(config.client_id.clone(), url, config.port);
        options.set_transport(Transport::wss(tls.root_ca.clone(), None, None));
        options
    } else {
        let mut options =
            MqttOptions::new(config.client_id.clone(), config.endpoint.clone(), config.port);
        options.set_transport(Transport::tls(
            tls.root_ca.clone(),
            tls.client_auth.clone(),
            None,
        ));
        options
    };

    options.set_keep_alive(Duration::from_secs(60));
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(use_websocket: bool) -> ValidatedConfig {
        ValidatedConfig {
            endpoint: "example.iot.local".to_string(),
            root_ca_path: PathBuf::from("root-ca.pem"),
            certificate_path: (!use_websocket).then(|| PathBuf::from("cert.pem")),
            private_key_path: (!use_websocket).then(|| PathBuf::from("key.pem")),
            port: if use_websocket { 443 } else { 8883 },
            use_websocket,
            client_id: "basicPubSub".to_string(),
            topic: "sdk/test/Python".to_string(),
            mode: crate::config::Mode::Both,
            message: "Hello World!".to_string(),
        }
    }

    fn dummy_materials(client_auth: bool) -> TlsMaterials {
        TlsMaterials {
            root_ca: b"-----BEGIN CERTIFICATE-----".to_vec(),
            client_auth: client_auth.then(|| (b"cert".to_vec(), b"key".to_vec())),
        }
    }

    #[test]
    fn test_reconnect_policy_defaults() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base, Duration::from_secs(1));
        assert_eq!(policy.max, Duration::from_secs(32));
        assert_eq!(policy.stable_threshold, Duration::from_secs(20));
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(4), Duration::from_secs(8));
        assert_eq!(policy.backoff_delay(5), Duration::from_secs(16));
        assert_eq!(policy.backoff_delay(6), Duration::from_secs(32));

        // Capped at max once the doubling passes it
        assert_eq!(policy.backoff_delay(7), Duration::from_secs(32));
        assert_eq!(policy.backoff_delay(100), Duration::from_secs(32));
    }

    #[test]
    fn test_stable_threshold() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.is_stable(Duration::from_secs(19)));
        assert!(policy.is_stable(Duration::from_secs(20)));
        assert!(policy.is_stable(Duration::from_secs(3600)));
    }

    #[test]
    fn test_transport_tuning_defaults() {
        let tuning = TransportTuning::default();
        assert_eq!(tuning.offline_queue_limit, None);
        assert_eq!(tuning.draining_interval, Duration::from_millis(500));
        assert_eq!(tuning.connect_timeout, Duration::from_secs(10));
        assert_eq!(tuning.operation_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_session_state_equality() {
        assert_eq!(SessionState::Connected, SessionState::Connected);
        assert_ne!(SessionState::Connected, SessionState::Connecting);
        assert_eq!(
            SessionState::Failed("nope".to_string()),
            SessionState::Failed("nope".to_string())
        );
    }

    #[test]
    fn test_configure_options_certificate_mode() {
        let options = configure_mqtt_options(&test_config(false), &dummy_materials(true));
        let (host, port) = options.broker_address();
        assert_eq!(host, "example.iot.local");
        assert_eq!(port, 8883);
    }

    #[test]
    fn test_configure_options_websocket_mode() {
        let options = configure_mqtt_options(&test_config(true), &dummy_materials(false));
        let (host, _) = options.broker_address();
        assert_eq!(host, "wss://example.iot.local:443/mqtt");
    }

    #[test]
    fn test_load_tls_materials_certificate_mode() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root.pem");
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&root, b"ROOT").unwrap();
        std::fs::write(&cert, b"CERT").unwrap();
        std::fs::write(&key, b"KEY").unwrap();

        let mut config = test_config(false);
        config.root_ca_path = root;
        config.certificate_path = Some(cert);
        config.private_key_path = Some(key);

        let materials = load_tls_materials(&config).unwrap();
        assert_eq!(materials.root_ca, b"ROOT");
        assert_eq!(
            materials.client_auth,
            Some((b"CERT".to_vec(), b"KEY".to_vec()))
        );
    }

    #[test]
    fn test_load_tls_materials_websocket_skips_client_auth() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(true);
        let path = dir.path().join("root.pem");
        std::fs::write(&path, b"ROOT").unwrap();
        config.root_ca_path = path;

        let materials = load_tls_materials(&config).unwrap();
        assert_eq!(materials.root_ca, b"ROOT");
        assert!(materials.client_auth.is_none());
    }

    #[test]
    fn test_load_tls_materials_missing_file() {
        let mut config = test_config(true);
        config.root_ca_path = PathBuf::from("/does/not/exist.pem");

        let result = load_tls_materials(&config);
        assert!(matches!(
            result,
            Err(SessionError::CredentialRead { .. })
        ));
    }
}
