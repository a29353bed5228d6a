//! Session state and device identity types

use super::SessionErrorKind;
use crate::quality::ConnectionQuality;
use serde::{Deserialize, Serialize};

/// What a remote device can do once connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCapability {
    ScreenShare,
    RemoteInput,
    Audio,
    Clipboard,
    FileTransfer,
}

/// Identity and capabilities of the peer device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDeviceInfo {
    pub device_id: String,
    pub device_name: String,
    #[serde(default)]
    pub capabilities: Vec<DeviceCapability>,
}

impl RemoteDeviceInfo {
    pub fn new(device_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            capabilities: Vec::new(),
        }
    }

    /// Best-effort identity used before the peer has introduced itself.
    pub fn placeholder(device_id: &str) -> Self {
        Self::new(device_id, device_id)
    }
}

/// Why a session is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    UserRequested,
    NetworkInterrupted,
}

/// Why a session ended without a local `end_session` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    RemoteEnded,
    Declined,
    Timeout,
    NetworkLost,
    Superseded,
    Failed,
}

/// Connection lifecycle state, owned by the session manager and observed
/// read-only by everything else.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// No session.
    Idle,
    /// Transport and negotiator warming up.
    Initializing,
    /// Offer sent or awaiting the remote offer.
    Connecting {
        session_id: String,
        remote_device_id: Option<String>,
    },
    /// Controlled side waiting for the local user to accept.
    WaitingForApproval {
        session_id: String,
        requester_device_id: String,
        requester_device_name: String,
    },
    /// Active session; `quality` tracks the quality monitor feed.
    Connected {
        session_id: String,
        remote_device: RemoteDeviceInfo,
        connected_at: i64,
        quality: ConnectionQuality,
    },
    /// Suspended; the peer connection is retained but the data channel idles.
    Paused {
        session_id: String,
        reason: PauseReason,
    },
    Disconnected {
        session_id: Option<String>,
        reason: DisconnectReason,
        error_message: Option<String>,
    },
    Error {
        kind: SessionErrorKind,
        message: String,
        recoverable: bool,
    },
}

impl SessionState {
    /// Session id referenced by this state, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SessionState::Connecting { session_id, .. }
            | SessionState::WaitingForApproval { session_id, .. }
            | SessionState::Connected { session_id, .. }
            | SessionState::Paused { session_id, .. } => Some(session_id),
            SessionState::Disconnected { session_id, .. } => session_id.as_deref(),
            SessionState::Idle | SessionState::Initializing | SessionState::Error { .. } => None,
        }
    }

    /// True while a `RemoteSession` (or pending negotiation) exists.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting { .. }
                | SessionState::Connected { .. }
                | SessionState::Paused { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_accessor_covers_states() {
        assert_eq!(SessionState::Idle.session_id(), None);
        let state = SessionState::Connecting {
            session_id: "s-1".to_string(),
            remote_device_id: None,
        };
        assert_eq!(state.session_id(), Some("s-1"));
        let state = SessionState::Disconnected {
            session_id: Some("s-2".to_string()),
            reason: DisconnectReason::RemoteEnded,
            error_message: None,
        };
        assert_eq!(state.session_id(), Some("s-2"));
    }

    #[test]
    fn active_states_are_the_session_owning_ones() {
        assert!(SessionState::Connecting {
            session_id: "s".into(),
            remote_device_id: None
        }
        .is_active());
        assert!(!SessionState::Idle.is_active());
        assert!(!SessionState::Error {
            kind: SessionErrorKind::Timeout,
            message: "timed out".into(),
            recoverable: true
        }
        .is_active());
    }
}
