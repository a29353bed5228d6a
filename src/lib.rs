//! remoteassist-core - remote assistance session core
//!
//! Session negotiation and adaptive-quality control for pairing a
//! controller device with a controlled device over a peer-to-peer
//! transport, negotiated through a signaling relay.

pub mod args;
pub mod config;
pub mod quality;
pub mod session;
pub mod signaling;

// Re-exports
pub use config::{Config, VideoCodec, WebRtcConfig};
pub use quality::{ConnectionQuality, NetworkMetrics, QualityMonitor, QualityPreset, VideoConfig};
pub use session::{RemoteDeviceInfo, RemoteEvent, SessionError, SessionManager, SessionState};
pub use signaling::{SignalingMessage, SignalingTransport, WebSocketSignaling};
