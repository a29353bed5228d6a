//! remoteassist-core - Main entry point
//!
//! Composition root: wires the signaling transport, peer connector and
//! session manager together and runs until interrupted. UI and platform
//! capture layers sit on top of the library API; this binary only drives
//! the session core.

use clap::Parser;
use log::{error, info, warn};
use remoteassist_core::args::Args;
use remoteassist_core::session::negotiator::PeerConnector;
use remoteassist_core::session::peer::RtcPeerConnector;
use remoteassist_core::{Config, SessionManager, SignalingTransport, WebSocketSignaling};
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("REMOTEASSIST_LOG").unwrap_or_else(|_| log_level.to_string()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("remoteassist-core v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match args.load_config() {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };
    if let Some(url) = args.url {
        config.signaling.url = url;
    }
    if let Some(name) = args.device_name {
        config.device.device_name = name;
    }

    let signaling: Arc<dyn SignalingTransport> = Arc::new(WebSocketSignaling::new());
    let peers: Arc<dyn PeerConnector> = Arc::new(RtcPeerConnector::new(config.webrtc.clone()));
    let manager = SessionManager::new(config.clone(), signaling, peers);

    manager.connect_to_server(&config.signaling.url).await?;
    info!("Connected to signaling relay {}", config.signaling.url);

    // Surface state and quality transitions in the log for the lifetime of
    // the process.
    let mut state_rx = manager.subscribe_state();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            info!("Session state: {:?}", *state_rx.borrow());
        }
    });
    let mut quality_rx = manager.subscribe_quality();
    tokio::spawn(async move {
        while quality_rx.changed().await.is_ok() {
            info!("Connection quality: {}", quality_rx.borrow().as_str());
        }
    });

    if let Some(remote) = args.connect_to {
        match manager.create_session(&remote).await {
            Ok(session_id) => info!("Negotiating session {} with {}", session_id, remote),
            Err(e) => error!("Failed to start session with {}: {}", remote, e),
        }
    }

    signal::ctrl_c().await?;
    info!("Shutting down");
    let _ = manager.end_session().await;
    let _ = manager.disconnect_from_server().await;
    Ok(())
}
