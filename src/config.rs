//! Connection configuration and credential validation
//!
//! Holds the raw parameters collected from the CLI and the validation rules
//! that turn them into a [`ValidatedConfig`]. Validation is pure: it never
//! touches the network or the filesystem.

use std::path::PathBuf;
use thiserror::Error;

/// Operation mode for the client pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Publish,
    Subscribe,
    Both,
}

impl Mode {
    /// Parse a mode string as given on the command line
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "publish" => Some(Mode::Publish),
            "subscribe" => Some(Mode::Subscribe),
            "both" => Some(Mode::Both),
            _ => None,
        }
    }

    /// True when the publish loop should run
    pub fn publishes(&self) -> bool {
        matches!(self, Mode::Publish | Mode::Both)
    }

    /// True when the subscription handler should run
    pub fn subscribes(&self) -> bool {
        matches!(self, Mode::Subscribe | Mode::Both)
    }
}

/// Raw connection parameters, prior to validation
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Broker endpoint hostname
    pub endpoint: String,
    /// Root CA certificate file (PEM)
    pub root_ca_path: PathBuf,
    /// Client certificate file (PEM) for mutual TLS
    pub certificate_path: Option<PathBuf>,
    /// Client private key file (PEM) for mutual TLS
    pub private_key_path: Option<PathBuf>,
    /// Port override; defaulted during validation when unset
    pub port: Option<u16>,
    /// Use MQTT over a TLS websocket tunnel instead of mutual TLS
    pub use_websocket: bool,
    /// MQTT client identifier
    pub client_id: String,
    /// Topic to publish and/or subscribe to
    pub topic: String,
    /// Operation mode string, parsed during validation
    pub mode: String,
    /// Operator-supplied message string
    pub message: String,
}

/// Connection parameters after validation; immutable for the process lifetime
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedConfig {
    pub endpoint: String,
    pub root_ca_path: PathBuf,
    pub certificate_path: Option<PathBuf>,
    pub private_key_path: Option<PathBuf>,
    pub port: u16,
    pub use_websocket: bool,
    pub client_id: String,
    pub topic: String,
    pub mode: Mode,
    pub message: String,
}

/// Credential validation errors - fatal, reported to the operator, exit code 2
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown mode '{0}', must be one of: publish, subscribe, both")]
    InvalidMode(String),
    #[error("X.509 certificate authentication and WebSocket are mutually exclusive")]
    ConflictingAuth,
    #[error("missing credentials: certificate and private key are both required without --websocket")]
    MissingCredentials,
}

/// Default port for MQTT over a TLS websocket tunnel
const WEBSOCKET_PORT: u16 = 443;
/// Default port for MQTT over mutual TLS
const MUTUAL_TLS_PORT: u16 = 8883;

fn path_is_set(path: &Option<PathBuf>) -> bool {
    path.as_ref().is_some_and(|p| !p.as_os_str().is_empty())
}

/// Validate a raw [`ConnectionConfig`] into a [`ValidatedConfig`]
///
/// Rules, applied in order:
/// 1. `mode` must name a known [`Mode`]
/// 2. websocket and certificate authentication are mutually exclusive
/// 3. without websocket, certificate and private key must both be present
/// 4. an unset port defaults to 443 (websocket) or 8883 (mutual TLS);
///    explicit ports are never overridden
pub fn validate(config: ConnectionConfig) -> Result<ValidatedConfig, ConfigError> {
    let mode =
        Mode::parse(&config.mode).ok_or_else(|| ConfigError::InvalidMode(config.mode.clone()))?;

    let cert_set = path_is_set(&config.certificate_path);
    let key_set = path_is_set(&config.private_key_path);

    if config.use_websocket && cert_set && key_set {
        return Err(ConfigError::ConflictingAuth);
    }

    if !config.use_websocket && (!cert_set || !key_set) {
        return Err(ConfigError::MissingCredentials);
    }

    let port = config.port.unwrap_or(if config.use_websocket {
        WEBSOCKET_PORT
    } else {
        MUTUAL_TLS_PORT
    });

    Ok(ValidatedConfig {
        endpoint: config.endpoint,
        root_ca_path: config.root_ca_path,
        certificate_path: config.certificate_path,
        private_key_path: config.private_key_path,
        port,
        use_websocket: config.use_websocket,
        client_id: config.client_id,
        topic: config.topic,
        mode,
        message: config.message,
    })
}
