//! Configuration management for remoteassist-core

use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Video codec selection for the capture pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    VP8,
    VP9,
    AV1,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::VP8 => "vp8",
            VideoCodec::VP9 => "vp9",
            VideoCodec::AV1 => "av1",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Local device identity
    #[serde(default)]
    pub device: DeviceConfig,

    /// Signaling relay settings
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// WebRTC / ICE settings
    #[serde(default)]
    pub webrtc: WebRtcConfig,

    /// Session timing settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Video settings
    #[serde(default)]
    pub video: VideoSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable identifier announced to peers
    pub device_id: String,

    /// Human-readable name shown in approval dialogs
    pub device_name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            device_id: format!("device-{}", &suffix[..8]),
            device_name: "Unnamed device".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Relay WebSocket URL
    pub url: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "wss://localhost:8443/signaling".to_string(),
        }
    }
}

/// ICE server entry passed to the peer connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    /// STUN server host ("" disables)
    #[serde(default = "default_stun_host")]
    pub stun_host: String,

    #[serde(default = "default_stun_port")]
    pub stun_port: u16,

    /// TURN relay host ("" disables)
    #[serde(default)]
    pub turn_host: String,

    #[serde(default = "default_turn_port")]
    pub turn_port: u16,

    #[serde(default)]
    pub turn_username: String,

    #[serde(default)]
    pub turn_password: String,

    /// Use turns: scheme
    #[serde(default)]
    pub turn_tls: bool,

    /// udp or tcp
    #[serde(default = "default_turn_protocol")]
    pub turn_protocol: String,

    /// Explicit ICE server list, used when no stun/turn hosts are set
    #[serde(default)]
    pub ice_servers: Vec<IceServerConfig>,
}

fn default_stun_host() -> String {
    "stun.l.google.com".to_string()
}

fn default_stun_port() -> u16 {
    19302
}

fn default_turn_port() -> u16 {
    3478
}

fn default_turn_protocol() -> String {
    "udp".to_string()
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_host: default_stun_host(),
            stun_port: default_stun_port(),
            turn_host: String::new(),
            turn_port: default_turn_port(),
            turn_username: String::new(),
            turn_password: String::new(),
            turn_tls: false,
            turn_protocol: default_turn_protocol(),
            ice_servers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds between outgoing heartbeats
    pub heartbeat_interval_secs: u64,

    /// Seconds a session may sit in Connecting before it fails
    pub connect_timeout_secs: u64,

    /// Missed heartbeat intervals before the peer counts as unresponsive
    pub heartbeat_miss_limit: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10,
            connect_timeout_secs: 30,
            heartbeat_miss_limit: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VideoSettings {
    /// Codec requested from the capture side
    #[serde(default)]
    pub codec: VideoCodec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.session.heartbeat_interval_secs, 10);
        assert_eq!(config.session.connect_timeout_secs, 30);
        assert!(config.device.device_id.starts_with("device-"));
        assert_eq!(config.video.codec, VideoCodec::H264);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [device]
            device_id = "desk-01"
            device_name = "Office desktop"

            [session]
            heartbeat_interval_secs = 5
            connect_timeout_secs = 20
            heartbeat_miss_limit = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.device.device_id, "desk-01");
        assert_eq!(config.session.heartbeat_interval_secs, 5);
        // Untouched sections come from defaults.
        assert_eq!(config.webrtc.stun_port, 19302);
        assert_eq!(config.signaling.url, "wss://localhost:8443/signaling");
    }
}
