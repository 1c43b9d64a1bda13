//! gpsthing - Main Entry Point
//!
//! Validates the connection configuration, establishes the MQTT session, and
//! runs the publish loop and/or subscription handler until a shutdown signal.

use clap::Parser;
use gpsthing::config::{validate, ConnectionConfig, ValidatedConfig};
use gpsthing::observability::init_default_logging;
use gpsthing::publisher::PublishLoop;
use gpsthing::receiver::SubscriptionHandler;
use gpsthing::session::{MqttSession, SessionState};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Bidirectional MQTT pub/sub client for TLS-secured IoT endpoints
#[derive(Parser)]
#[command(name = "gpsthing")]
#[command(about = "Bidirectional MQTT pub/sub client for TLS-secured IoT endpoints")]
#[command(version)]
struct Cli {
    /// IoT endpoint hostname
    #[arg(short = 'e', long, env = "GPSTHING_ENDPOINT", value_name = "HOST")]
    endpoint: String,

    /// Root CA file path
    #[arg(
        short = 'r',
        long = "root-ca",
        env = "GPSTHING_ROOT_CA",
        value_name = "FILE"
    )]
    root_ca: PathBuf,

    /// Client certificate file path
    #[arg(short = 'c', long, value_name = "FILE")]
    cert: Option<PathBuf>,

    /// Private key file path
    #[arg(short = 'k', long, value_name = "FILE")]
    key: Option<PathBuf>,

    /// Port number override
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Use MQTT over WebSocket
    #[arg(short = 'w', long)]
    websocket: bool,

    /// Targeted client id
    #[arg(long = "client-id", default_value = "basicPubSub")]
    client_id: String,

    /// Targeted topic
    #[arg(short = 't', long, default_value = "sdk/test/Python")]
    topic: String,

    /// Operation mode: publish, subscribe, or both
    #[arg(short = 'm', long, default_value = "both")]
    mode: String,

    /// Message to publish
    #[arg(short = 'M', long, default_value = "Hello World!")]
    message: String,
}

impl Cli {
    fn into_config(self) -> ConnectionConfig {
        ConnectionConfig {
            endpoint: self.endpoint,
            root_ca_path: self.root_ca,
            certificate_path: self.cert,
            private_key_path: self.key,
            port: self.port,
            use_websocket: self.websocket,
            client_id: self.client_id,
            topic: self.topic,
            mode: self.mode,
            message: self.message,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();
    info!("Starting gpsthing v{}", env!("CARGO_PKG_VERSION"));

    let config = match validate(cli.into_config()) {
        Ok(config) => config,
        Err(error) => {
            error!(error = %error, "Invalid connection configuration");
            process::exit(2);
        }
    };

    if let Err(error) = run(config).await {
        error!(error = %error, "Client failed");
        process::exit(1);
    }

    info!("Shutdown complete");
}

async fn run(config: ValidatedConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut session = MqttSession::new(&config)?;

    info!(
        endpoint = %config.endpoint,
        port = config.port,
        websocket = config.use_websocket,
        client_id = %config.client_id,
        "Connecting to MQTT endpoint"
    );
    session.connect().await?;
    let session = Arc::new(session);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut publish_handle = None;

    if config.mode.publishes() {
        let publish_loop = PublishLoop::new(session.clone(), config.topic.clone());
        publish_handle = Some(tokio::spawn(publish_loop.run(shutdown_rx)));
    }

    if config.mode.subscribes() {
        SubscriptionHandler::attach(&session, &config.topic).await?;
    }

    // Run until a shutdown signal arrives or the session fails terminally
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let failure = tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
            None
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
            None
        }
        reason = watch_for_session_failure(session.state_changes()) => {
            error!(reason = %reason, "MQTT session permanently lost");
            Some(reason)
        }
    };

    let _ = shutdown_tx.send(true);
    if let Some(handle) = publish_handle {
        let _ = handle.await;
    }
    session.disconnect().await?;

    match failure {
        Some(reason) => Err(reason.into()),
        None => Ok(()),
    }
}

/// Resolve once the session reports a terminal failure
async fn watch_for_session_failure(
    mut state_rx: watch::Receiver<SessionState>,
) -> String {
    loop {
        if let SessionState::Failed(reason) = state_rx.borrow().clone() {
            return reason;
        }
        if state_rx.changed().await.is_err() {
            return "session state channel closed".to_string();
        }
    }
}
