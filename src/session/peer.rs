//! webrtc-rs backed peer transport
//!
//! Production implementation of the peer transport seam on top of
//! RTCPeerConnection. Handles API construction, ICE server configuration
//! and the callback-to-event-channel wiring.

use super::negotiator::{
    DataChannel, IceCandidateInit, PeerConnectionState, PeerConnector, PeerEvent, PeerTransport,
    SdpKind, SessionDescription,
};
use super::SessionError;
use crate::config::{IceServerConfig, WebRtcConfig};
use async_trait::async_trait;
use bytes::Bytes;
use log::warn;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Builds RTCPeerConnection-backed transports from the configured ICE
/// settings.
pub struct RtcPeerConnector {
    config: WebRtcConfig,
}

impl RtcPeerConnector {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PeerConnector for RtcPeerConnector {
    async fn connect_peer(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerTransport>, SessionError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(|e| {
            SessionError::NegotiationFailed(format!("Failed to register codecs: {}", e))
        })?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            SessionError::NegotiationFailed(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(SettingEngine::default())
            .build();

        let ice_servers = effective_ice_servers(&self.config)
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            SessionError::NegotiationFailed(format!("Failed to create peer connection: {}", e))
        })?);

        let tx = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(json) => {
                            let _ = tx.send(PeerEvent::IceCandidate(IceCandidateInit {
                                candidate: json.candidate,
                                sdp_mid: json.sdp_mid,
                                sdp_mline_index: json.sdp_mline_index,
                            }));
                        }
                        Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                    }
                }
            })
        }));

        let tx = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(PeerEvent::StateChange(map_peer_state(state)));
            })
        }));

        // Channels created by the remote side surface here; locally created
        // ones are wired in create_data_channel.
        let tx = events.clone();
        peer_connection.on_data_channel(Box::new(move |channel| {
            let tx = tx.clone();
            Box::pin(async move {
                wire_channel_callbacks(&channel, &tx);
            })
        }));

        Ok(Arc::new(RtcPeerTransport {
            peer_connection,
            events,
        }))
    }
}

fn map_peer_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::New => PeerConnectionState::New,
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => PeerConnectionState::New,
    }
}

fn wire_channel_callbacks(channel: &Arc<RTCDataChannel>, events: &mpsc::UnboundedSender<PeerEvent>) {
    let label = channel.label().to_string();
    let tx = events.clone();
    channel.on_open(Box::new(move || {
        let tx = tx.clone();
        let label = label.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::ChannelOpen(label));
        })
    }));

    let tx = events.clone();
    channel.on_message(Box::new(move |message| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::ChannelMessage(message.data.to_vec()));
        })
    }));
}

/// Resolve the ICE server list: explicit servers win, otherwise stun/turn
/// host settings are assembled into server entries.
fn effective_ice_servers(config: &WebRtcConfig) -> Vec<IceServerConfig> {
    let mut servers = Vec::new();

    let has_stun = !config.stun_host.is_empty() && config.stun_port != 0;
    if has_stun {
        servers.push(IceServerConfig {
            urls: vec![format!("stun:{}:{}", config.stun_host, config.stun_port)],
            username: None,
            credential: None,
        });
    }

    if !config.turn_host.is_empty() {
        let scheme = if config.turn_tls { "turns" } else { "turn" };
        let transport = if config.turn_protocol.is_empty() {
            "udp"
        } else {
            config.turn_protocol.as_str()
        };
        let url = format!(
            "{}:{}:{}?transport={}",
            scheme, config.turn_host, config.turn_port, transport
        );

        let (username, credential) =
            if !config.turn_username.is_empty() && !config.turn_password.is_empty() {
                (
                    Some(config.turn_username.clone()),
                    Some(config.turn_password.clone()),
                )
            } else {
                (None, None)
            };

        servers.push(IceServerConfig {
            urls: vec![url],
            username,
            credential,
        });
    }

    if servers.is_empty() {
        return config.ice_servers.clone();
    }
    servers
}

/// One RTCPeerConnection behind the [`PeerTransport`] seam.
pub struct RtcPeerTransport {
    peer_connection: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, SessionError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(|e| SessionError::SdpError(format!("Invalid session description: {}", e)))
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| SessionError::SdpError(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| SessionError::SdpError(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), SessionError> {
        let rtc_desc = to_rtc_description(desc)?;
        self.peer_connection
            .set_local_description(rtc_desc)
            .await
            .map_err(|e| SessionError::SdpError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SessionError> {
        let rtc_desc = to_rtc_description(desc)?;
        self.peer_connection
            .set_remote_description(rtc_desc)
            .await
            .map_err(|e| SessionError::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn apply_ice_candidate(&self, candidate: &IceCandidateInit) -> Result<(), SessionError> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.peer_connection
            .add_ice_candidate(candidate_init)
            .await
            .map_err(|e| SessionError::IceError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
        protocol: &str,
    ) -> Result<Arc<dyn DataChannel>, SessionError> {
        let init = RTCDataChannelInit {
            ordered: Some(ordered),
            protocol: Some(protocol.to_string()),
            ..Default::default()
        };
        let channel = self
            .peer_connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| {
                SessionError::DataChannelError(format!("Failed to create data channel: {}", e))
            })?;
        wire_channel_callbacks(&channel, &self.events);
        Ok(Arc::new(RtcDataChannel { inner: channel }))
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.peer_connection.close().await.map_err(|e| {
            SessionError::NegotiationFailed(format!("Failed to close peer connection: {}", e))
        })
    }
}

/// RTCDataChannel behind the [`DataChannel`] seam.
pub struct RtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> String {
        self.inner.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, payload: &[u8]) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::DataChannelError(
                "channel is not open".to_string(),
            ));
        }
        self.inner
            .send(&Bytes::copy_from_slice(payload))
            .await
            .map(|_| ())
            .map_err(|e| SessionError::DataChannelError(format!("Send failed: {}", e)))
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.inner
            .close()
            .await
            .map_err(|e| SessionError::DataChannelError(format!("Close failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> WebRtcConfig {
        WebRtcConfig {
            stun_host: String::new(),
            stun_port: 0,
            turn_host: String::new(),
            turn_port: 3478,
            turn_username: String::new(),
            turn_password: String::new(),
            turn_tls: false,
            turn_protocol: String::new(),
            ice_servers: Vec::new(),
        }
    }

    #[test]
    fn stun_and_turn_settings_become_ice_servers() {
        let mut config = base_config();
        config.stun_host = "stun.example.org".to_string();
        config.stun_port = 19302;
        config.turn_host = "turn.example.org".to_string();
        config.turn_username = "user".to_string();
        config.turn_password = "secret".to_string();

        let servers = effective_ice_servers(&config);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.org:19302"]);
        assert_eq!(
            servers[1].urls,
            vec!["turn:turn.example.org:3478?transport=udp"]
        );
        assert_eq!(servers[1].username.as_deref(), Some("user"));
    }

    #[test]
    fn explicit_ice_servers_are_the_fallback() {
        let mut config = base_config();
        config.ice_servers = vec![IceServerConfig {
            urls: vec!["stun:fallback.example.org:3478".to_string()],
            username: None,
            credential: None,
        }];

        let servers = effective_ice_servers(&config);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec!["stun:fallback.example.org:3478"]);
    }
}
