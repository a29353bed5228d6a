//! Signaling protocol
//!
//! Message shapes for SDP offer/answer exchange, ICE candidate
//! transmission and session control over the relay connection. One JSON
//! object per message, discriminated by a `type` field; every variant
//! carries the session id and a millisecond timestamp.

pub mod transport;

pub use transport::{SignalingTransport, WebSocketSignaling};

use crate::quality::VideoConfig;
use crate::session::SessionError;
use log::debug;
use serde::{Deserialize, Serialize};

/// Reason carried by a `SessionEnd` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndReason {
    UserInitiated,
    Timeout,
    NetworkLost,
    Superseded,
    Error,
}

/// Signaling message types exchanged through the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SignalingMessage {
    /// Controller asking the controlled device for a session.
    ConnectionRequest {
        session_id: String,
        timestamp: i64,
        device_id: String,
        device_name: String,
    },

    /// Controlled device's accept/decline answer to a request.
    ConnectionResponse {
        session_id: String,
        timestamp: i64,
        accepted: bool,
        device_id: String,
        device_name: String,
    },

    /// SDP offer from the controller.
    Offer {
        session_id: String,
        timestamp: i64,
        sdp: String,
    },

    /// SDP answer from the controlled device.
    Answer {
        session_id: String,
        timestamp: i64,
        sdp: String,
    },

    /// Trickled ICE candidate.
    IceCandidate {
        session_id: String,
        timestamp: i64,
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: Option<u16>,
        candidate: String,
    },

    /// Session terminated by the sending side.
    SessionEnd {
        session_id: String,
        timestamp: i64,
        reason: EndReason,
    },

    /// Periodic keepalive with a monotonically increasing sequence.
    Heartbeat {
        session_id: String,
        timestamp: i64,
        sequence: u64,
    },

    /// Peer-observed target video configuration (informational).
    QualityAdjustment {
        session_id: String,
        timestamp: i64,
        target_config: VideoConfig,
    },
}

impl SignalingMessage {
    /// Parse a signaling message from JSON.
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        serde_json::from_str(json)
            .map_err(|e| SessionError::SignalingError(format!("Invalid signaling message: {}", e)))
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, SessionError> {
        serde_json::to_string(self)
            .map_err(|e| SessionError::SignalingError(format!("Failed to serialize message: {}", e)))
    }

    /// Decode one wire frame. Unknown `type` values are ignored rather than
    /// treated as a parse failure, so newer relays can add message kinds.
    pub fn decode_frame(text: &str) -> Result<Option<Self>, SessionError> {
        match serde_json::from_str::<SignalingMessage>(text) {
            Ok(message) => Ok(Some(message)),
            Err(parse_err) => match serde_json::from_str::<serde_json::Value>(text) {
                Ok(value) if value.get("type").map_or(false, |t| t.is_string()) => {
                    debug!("Ignoring unrecognized signaling message: {}", parse_err);
                    Ok(None)
                }
                _ => Err(SessionError::SignalingError(format!(
                    "Invalid signaling message: {}",
                    parse_err
                ))),
            },
        }
    }

    pub fn connection_request(session_id: &str, device_id: &str, device_name: &str) -> Self {
        SignalingMessage::ConnectionRequest {
            session_id: session_id.to_string(),
            timestamp: now_millis(),
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
        }
    }

    pub fn connection_response(
        session_id: &str,
        accepted: bool,
        device_id: &str,
        device_name: &str,
    ) -> Self {
        SignalingMessage::ConnectionResponse {
            session_id: session_id.to_string(),
            timestamp: now_millis(),
            accepted,
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
        }
    }

    pub fn offer(session_id: &str, sdp: &str) -> Self {
        SignalingMessage::Offer {
            session_id: session_id.to_string(),
            timestamp: now_millis(),
            sdp: sdp.to_string(),
        }
    }

    pub fn answer(session_id: &str, sdp: &str) -> Self {
        SignalingMessage::Answer {
            session_id: session_id.to_string(),
            timestamp: now_millis(),
            sdp: sdp.to_string(),
        }
    }

    pub fn ice_candidate(
        session_id: &str,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
        candidate: String,
    ) -> Self {
        SignalingMessage::IceCandidate {
            session_id: session_id.to_string(),
            timestamp: now_millis(),
            sdp_mid,
            sdp_mline_index,
            candidate,
        }
    }

    pub fn session_end(session_id: &str, reason: EndReason) -> Self {
        SignalingMessage::SessionEnd {
            session_id: session_id.to_string(),
            timestamp: now_millis(),
            reason,
        }
    }

    pub fn heartbeat(session_id: &str, sequence: u64) -> Self {
        SignalingMessage::Heartbeat {
            session_id: session_id.to_string(),
            timestamp: now_millis(),
            sequence,
        }
    }

    pub fn quality_adjustment(session_id: &str, target_config: VideoConfig) -> Self {
        SignalingMessage::QualityAdjustment {
            session_id: session_id.to_string(),
            timestamp: now_millis(),
            target_config,
        }
    }

    /// The session this message belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            SignalingMessage::ConnectionRequest { session_id, .. }
            | SignalingMessage::ConnectionResponse { session_id, .. }
            | SignalingMessage::Offer { session_id, .. }
            | SignalingMessage::Answer { session_id, .. }
            | SignalingMessage::IceCandidate { session_id, .. }
            | SignalingMessage::SessionEnd { session_id, .. }
            | SignalingMessage::Heartbeat { session_id, .. }
            | SignalingMessage::QualityAdjustment { session_id, .. } => session_id,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SignalingMessage::ConnectionRequest { timestamp, .. }
            | SignalingMessage::ConnectionResponse { timestamp, .. }
            | SignalingMessage::Offer { timestamp, .. }
            | SignalingMessage::Answer { timestamp, .. }
            | SignalingMessage::IceCandidate { timestamp, .. }
            | SignalingMessage::SessionEnd { timestamp, .. }
            | SignalingMessage::Heartbeat { timestamp, .. }
            | SignalingMessage::QualityAdjustment { timestamp, .. } => *timestamp,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
