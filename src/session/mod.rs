//! Session negotiation core
//!
//! This module provides the connection lifecycle for remote assistance
//! sessions:
//! - Session state machine and reconnection
//! - SDP/ICE negotiation over a peer transport
//! - DataChannel event pipe for remote input
//! - Heartbeat and liveness tracking

pub mod events;
pub mod manager;
pub mod negotiator;
pub mod peer;
pub mod state;

pub use events::{EventPipe, GestureKind, RemoteEvent, TouchPhase};
pub use manager::SessionManager;
pub use state::{
    DeviceCapability, DisconnectReason, PauseReason, RemoteDeviceInfo, SessionState,
};

use std::error::Error;
use std::fmt;

/// Session-related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Signaling transport is not connected or the relay rejected us
    TransportUnavailable(String),
    /// Signaling send/decode failed
    SignalingError(String),
    /// Peer connection setup or negotiation failed
    NegotiationFailed(String),
    /// An offer/answer exchange is already in flight on this negotiator
    NegotiationInProgress,
    /// SDP processing failed
    SdpError(String),
    /// ICE candidate processing failed
    IceError(String),
    /// Data channel error
    DataChannelError(String),
    /// Message referenced a session we do not own
    SessionNotFound(String),
    /// Reconnect requested with no session to reconnect to
    NoPreviousSession,
    /// Operation is not valid in the current state
    InvalidState(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::TransportUnavailable(msg) => {
                write!(f, "Signaling transport unavailable: {}", msg)
            }
            SessionError::SignalingError(msg) => write!(f, "Signaling error: {}", msg),
            SessionError::NegotiationFailed(msg) => write!(f, "Negotiation failed: {}", msg),
            SessionError::NegotiationInProgress => {
                write!(f, "A negotiation call is already in flight")
            }
            SessionError::SdpError(msg) => write!(f, "SDP error: {}", msg),
            SessionError::IceError(msg) => write!(f, "ICE error: {}", msg),
            SessionError::DataChannelError(msg) => write!(f, "DataChannel error: {}", msg),
            SessionError::SessionNotFound(id) => write!(f, "Session not found: {}", id),
            SessionError::NoPreviousSession => write!(f, "No previous session to reconnect"),
            SessionError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl Error for SessionError {}

/// Coarse error category carried by [`SessionState::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    Transport,
    Negotiation,
    Protocol,
    Timeout,
    Internal,
}

impl SessionError {
    pub fn kind(&self) -> SessionErrorKind {
        match self {
            SessionError::TransportUnavailable(_) | SessionError::SignalingError(_) => {
                SessionErrorKind::Transport
            }
            SessionError::NegotiationFailed(_)
            | SessionError::NegotiationInProgress
            | SessionError::SdpError(_)
            | SessionError::IceError(_)
            | SessionError::DataChannelError(_) => SessionErrorKind::Negotiation,
            SessionError::SessionNotFound(_) => SessionErrorKind::Protocol,
            SessionError::NoPreviousSession | SessionError::InvalidState(_) => {
                SessionErrorKind::Internal
            }
        }
    }
}
