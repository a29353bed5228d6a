//! Session lifecycle management
//!
//! The session manager owns at most one active session and drives the
//! whole lifecycle: signaling, offer/answer negotiation, heartbeats,
//! reconnection and quality adjustment. All state lives in a single actor
//! task; the public handle enqueues commands and awaits replies, so
//! concurrent callers and inbound signaling messages are serialized onto
//! one owner context. Negotiation calls that suspend run in spawned
//! continuation tasks and post their outcome back as internal events.

use super::events::{EventPipe, RemoteEvent};
use super::negotiator::{
    IceCandidateInit, Negotiator, PeerConnectionState, PeerConnector, PeerEvent,
    SessionDescription,
};
use super::state::{
    DisconnectReason, PauseReason, RemoteDeviceInfo, SessionState,
};
use super::{SessionError, SessionErrorKind};
use crate::config::Config;
use crate::quality::{ConnectionQuality, NetworkMetrics, QualityMonitor, VideoConfig};
use crate::signaling::{now_millis, EndReason, SignalingMessage, SignalingTransport};
use log::{debug, info, warn};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, Instant};
use uuid::Uuid;

/// Label of the data channel carrying remote input events.
const EVENT_CHANNEL_LABEL: &str = "events";

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    Connect { url: String, reply: Reply<()> },
    Disconnect { reply: Reply<()> },
    RequestConnection { remote_device_id: String, reply: Reply<String> },
    RespondToRequest { accept: bool, reply: Reply<()> },
    Create { remote_device_id: String, reply: Reply<String> },
    Join { session_id: String, remote_device: RemoteDeviceInfo, reply: Reply<()> },
    End { reply: Reply<()> },
    Reconnect { reply: Reply<String> },
    Pause { reply: Reply<()> },
    Resume { reply: Reply<()> },
    SendEvent { event: RemoteEvent, reply: Reply<()> },
    Internal(InternalEvent),
}

enum InternalEvent {
    OfferSent {
        session_id: String,
        result: Result<(), SessionError>,
        reply: Option<Reply<String>>,
    },
    AnswerSent {
        session_id: String,
        result: Result<(), SessionError>,
    },
    AnswerApplied {
        session_id: String,
        result: Result<(), SessionError>,
    },
    Peer {
        session_id: String,
        event: PeerEvent,
    },
    ConnectTimeout {
        session_id: String,
    },
    PeerSilent {
        session_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionRole {
    Controller,
    Controlled,
}

/// The one live session. Exactly one exists while the state is
/// Connecting/Connected/Paused; it is destroyed on any transition to
/// Idle/Disconnected.
struct RemoteSession {
    id: String,
    remote_device: RemoteDeviceInfo,
    role: SessionRole,
    negotiator: Arc<Negotiator>,
    pipe: EventPipe,
    event_forwarder: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    last_peer_heartbeat: Arc<SyncMutex<Instant>>,
    connected_at: Option<i64>,
}

/// Controlled-side record held between `join_session` and the inbound
/// offer.
struct PendingSession {
    id: String,
    remote_device: RemoteDeviceInfo,
    negotiator: Arc<Negotiator>,
    pipe: EventPipe,
    event_forwarder: JoinHandle<()>,
}

struct OutboundRequest {
    session_id: String,
    remote_device_id: String,
}

struct PendingApproval {
    session_id: String,
    requester: RemoteDeviceInfo,
}

/// Public handle to the session actor.
pub struct SessionManager {
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<SessionState>,
    monitor: Arc<QualityMonitor>,
    events_rx: SyncMutex<Option<mpsc::UnboundedReceiver<RemoteEvent>>>,
}

impl SessionManager {
    pub fn new(
        config: Config,
        signaling: Arc<dyn SignalingTransport>,
        peers: Arc<dyn PeerConnector>,
    ) -> Self {
        let monitor = Arc::new(QualityMonitor::new(config.video.codec));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let actor = SessionActor {
            config,
            signaling,
            peers,
            monitor: monitor.clone(),
            state_tx,
            commands_tx: commands_tx.clone(),
            events_tx,
            active: None,
            pending: HashMap::new(),
            outbound_request: None,
            pending_approval: None,
            last_remote_device_id: None,
        };
        tokio::spawn(actor.run(commands_rx));

        Self {
            commands: commands_tx,
            state_rx,
            monitor,
            events_rx: SyncMutex::new(Some(events_rx)),
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(build(tx)).map_err(|_| {
            SessionError::InvalidState("session manager task has stopped".to_string())
        })?;
        rx.await.map_err(|_| {
            SessionError::InvalidState("session manager dropped the request".to_string())
        })?
    }

    /// Open the signaling relay connection. Does not change session state.
    pub async fn connect_to_server(&self, url: &str) -> Result<(), SessionError> {
        self.request(|reply| Command::Connect { url: url.to_string(), reply }).await
    }

    /// Close the signaling relay connection.
    pub async fn disconnect_from_server(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Ask a remote device for a session. The offer flow starts once the
    /// peer accepts.
    pub async fn request_connection(&self, remote_device_id: &str) -> Result<String, SessionError> {
        self.request(|reply| Command::RequestConnection {
            remote_device_id: remote_device_id.to_string(),
            reply,
        })
        .await
    }

    /// Accept or decline the connection request currently awaiting approval.
    pub async fn respond_to_request(&self, accept: bool) -> Result<(), SessionError> {
        self.request(|reply| Command::RespondToRequest { accept, reply }).await
    }

    /// Controller role: negotiate a session with the given device. Returns
    /// the new session id once the offer is on the wire.
    pub async fn create_session(&self, remote_device_id: &str) -> Result<String, SessionError> {
        self.request(|reply| Command::Create {
            remote_device_id: remote_device_id.to_string(),
            reply,
        })
        .await
    }

    /// Controlled role: prepare for the given session and wait for the
    /// controller's offer.
    pub async fn join_session(
        &self,
        session_id: &str,
        remote_device: RemoteDeviceInfo,
    ) -> Result<(), SessionError> {
        self.request(|reply| Command::Join {
            session_id: session_id.to_string(),
            remote_device,
            reply,
        })
        .await
    }

    /// End the active session. Succeeds trivially when none exists.
    pub async fn end_session(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::End { reply }).await
    }

    /// Tear the current session down completely, then renegotiate with the
    /// same remote device under a fresh session id.
    pub async fn reconnect_session(&self) -> Result<String, SessionError> {
        self.request(|reply| Command::Reconnect { reply }).await
    }

    pub async fn pause_session(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Pause { reply }).await
    }

    pub async fn resume_session(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Resume { reply }).await
    }

    /// Send a remote input event over the session data channel.
    pub async fn send_event(&self, event: RemoteEvent) -> Result<(), SessionError> {
        self.request(|reply| Command::SendEvent { event, reply }).await
    }

    /// Feed one metrics sample into the quality monitor.
    pub fn feed_metrics(&self, sample: NetworkMetrics) {
        self.monitor.record_sample(sample);
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn subscribe_quality(&self) -> watch::Receiver<ConnectionQuality> {
        self.monitor.subscribe_quality()
    }

    pub fn subscribe_recommended_config(&self) -> watch::Receiver<VideoConfig> {
        self.monitor.subscribe_config()
    }

    pub fn current_state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    /// Inbound remote events, in data channel delivery order. Can be taken
    /// once.
    pub fn take_event_stream(&self) -> Option<mpsc::UnboundedReceiver<RemoteEvent>> {
        self.events_rx.lock().take()
    }
}

struct SessionActor {
    config: Config,
    signaling: Arc<dyn SignalingTransport>,
    peers: Arc<dyn PeerConnector>,
    monitor: Arc<QualityMonitor>,
    state_tx: watch::Sender<SessionState>,
    commands_tx: mpsc::UnboundedSender<Command>,
    events_tx: mpsc::UnboundedSender<RemoteEvent>,
    active: Option<RemoteSession>,
    pending: HashMap<String, PendingSession>,
    outbound_request: Option<OutboundRequest>,
    pending_approval: Option<PendingApproval>,
    last_remote_device_id: Option<String>,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut signaling_rx = self.signaling.subscribe();
        let mut quality_rx = self.monitor.subscribe_quality();
        let mut config_rx = self.monitor.subscribe_config();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                inbound = signaling_rx.recv() => match inbound {
                    Ok(message) => self.handle_signaling(message).await,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Signaling receiver lagged by {} messages", n);
                    }
                    Err(RecvError::Closed) => {
                        signaling_rx = self.signaling.subscribe();
                    }
                },
                changed = quality_rx.changed() => {
                    if changed.is_ok() {
                        let quality = *quality_rx.borrow_and_update();
                        self.on_quality_changed(quality);
                    }
                }
                changed = config_rx.changed() => {
                    if changed.is_ok() {
                        let config = *config_rx.borrow_and_update();
                        self.on_recommended_config(config);
                    }
                }
            }
        }

        // Handle dropped: release whatever is still alive.
        self.teardown_all().await;
    }

    fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!("Session state: {:?} -> {:?}", current, state);
                *current = state;
                true
            }
        });
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { url, reply } => {
                let _ = reply.send(self.signaling.connect(&url).await);
            }
            Command::Disconnect { reply } => {
                let _ = reply.send(self.signaling.disconnect().await);
            }
            Command::RequestConnection { remote_device_id, reply } => {
                self.handle_request_connection(remote_device_id, reply).await;
            }
            Command::RespondToRequest { accept, reply } => {
                self.handle_respond(accept, reply).await;
            }
            Command::Create { remote_device_id, reply } => {
                self.handle_create(remote_device_id, reply).await;
            }
            Command::Join { session_id, remote_device, reply } => {
                self.handle_join(session_id, remote_device, reply).await;
            }
            Command::End { reply } => self.handle_end(reply).await,
            Command::Reconnect { reply } => self.handle_reconnect(reply).await,
            Command::Pause { reply } => self.handle_pause(reply),
            Command::Resume { reply } => self.handle_resume(reply),
            Command::SendEvent { event, reply } => self.handle_send_event(event, reply).await,
            Command::Internal(event) => self.handle_internal(event).await,
        }
    }

    async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::OfferSent { session_id, result, reply } => {
                self.handle_offer_sent(session_id, result, reply).await;
            }
            InternalEvent::AnswerSent { session_id, result } => {
                self.handle_answer_sent(session_id, result).await;
            }
            InternalEvent::AnswerApplied { session_id, result } => {
                self.handle_answer_applied(session_id, result);
            }
            InternalEvent::Peer { session_id, event } => {
                self.handle_peer_event(session_id, event).await;
            }
            InternalEvent::ConnectTimeout { session_id } => {
                self.handle_connect_timeout(session_id).await;
            }
            InternalEvent::PeerSilent { session_id } => self.handle_peer_silent(session_id),
        }
    }

    // ---- local API -------------------------------------------------------

    async fn handle_create(&mut self, remote_device_id: String, reply: Reply<String>) {
        if self.active.is_some() || !self.pending.is_empty() {
            let _ = reply.send(Err(SessionError::InvalidState(
                "a session is already active".to_string(),
            )));
            return;
        }
        if !self.signaling.is_connected() {
            let _ = reply.send(Err(SessionError::TransportUnavailable(
                "signaling transport is not connected".to_string(),
            )));
            return;
        }
        let session_id = generate_session_id();
        let remote_device = RemoteDeviceInfo::placeholder(&remote_device_id);
        self.start_offer_flow(session_id, remote_device, Some(reply)).await;
    }

    /// Create the negotiator and session record, then run the offer
    /// exchange off the owner task. The reply fires from the completion
    /// event so a returned session id always corresponds to an offer on
    /// the wire.
    async fn start_offer_flow(
        &mut self,
        session_id: String,
        remote_device: RemoteDeviceInfo,
        reply: Option<Reply<String>>,
    ) {
        self.set_state(SessionState::Initializing);
        let (negotiator, pipe, forwarder) = match self.build_peer(&session_id).await {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Failed to initialize session {}: {}", session_id, e);
                self.set_state(SessionState::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                    recoverable: true,
                });
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
                return;
            }
        };

        self.last_remote_device_id = Some(remote_device.device_id.clone());
        self.active = Some(RemoteSession {
            id: session_id.clone(),
            remote_device,
            role: SessionRole::Controller,
            negotiator: negotiator.clone(),
            pipe,
            event_forwarder: forwarder,
            heartbeat: None,
            watchdog: None,
            last_peer_heartbeat: Arc::new(SyncMutex::new(Instant::now())),
            connected_at: None,
        });

        let signaling = self.signaling.clone();
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let result = async {
                let offer = negotiator.create_offer().await?;
                let sdp = offer.sdp.clone();
                negotiator.set_local_description(offer).await?;
                signaling.send(&SignalingMessage::offer(&session_id, &sdp)).await
            }
            .await;
            let _ = commands.send(Command::Internal(InternalEvent::OfferSent {
                session_id,
                result,
                reply,
            }));
        });
    }

    async fn handle_offer_sent(
        &mut self,
        session_id: String,
        result: Result<(), SessionError>,
        reply: Option<Reply<String>>,
    ) {
        let is_current = self
            .active
            .as_ref()
            .map(|s| s.id == session_id)
            .unwrap_or(false);
        if !is_current {
            debug!("Discarding offer outcome for superseded session {}", session_id);
            if let Some(reply) = reply {
                let _ = reply.send(Err(SessionError::SessionNotFound(session_id)));
            }
            return;
        }

        match result {
            Ok(()) => {
                info!("Offer sent for session {}", session_id);
                let remote_device_id = self
                    .active
                    .as_ref()
                    .map(|s| s.remote_device.device_id.clone());
                self.set_state(SessionState::Connecting {
                    session_id: session_id.clone(),
                    remote_device_id,
                });
                self.spawn_connect_timeout(&session_id);
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(session_id));
                }
            }
            Err(e) => {
                warn!("Offer negotiation failed for session {}: {}", session_id, e);
                self.teardown_all().await;
                self.monitor.reset();
                self.set_state(SessionState::Error {
                    kind: SessionErrorKind::Negotiation,
                    message: e.to_string(),
                    recoverable: true,
                });
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
            }
        }
    }

    async fn handle_join(
        &mut self,
        session_id: String,
        remote_device: RemoteDeviceInfo,
        reply: Reply<()>,
    ) {
        if self.active.is_some() || self.pending.contains_key(&session_id) {
            let _ = reply.send(Err(SessionError::InvalidState(
                "a session is already active".to_string(),
            )));
            return;
        }
        if !self.signaling.is_connected() {
            let _ = reply.send(Err(SessionError::TransportUnavailable(
                "signaling transport is not connected".to_string(),
            )));
            return;
        }

        self.set_state(SessionState::Initializing);
        match self.build_peer(&session_id).await {
            Ok((negotiator, pipe, forwarder)) => {
                self.last_remote_device_id = Some(remote_device.device_id.clone());
                let remote_device_id = remote_device.device_id.clone();
                self.pending.insert(
                    session_id.clone(),
                    PendingSession {
                        id: session_id.clone(),
                        remote_device,
                        negotiator,
                        pipe,
                        event_forwarder: forwarder,
                    },
                );
                self.set_state(SessionState::Connecting {
                    session_id: session_id.clone(),
                    remote_device_id: Some(remote_device_id),
                });
                self.spawn_connect_timeout(&session_id);
                info!("Joined session {}, awaiting offer", session_id);
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                warn!("Failed to join session {}: {}", session_id, e);
                self.set_state(SessionState::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                    recoverable: true,
                });
                let _ = reply.send(Err(e));
            }
        }
    }

    async fn handle_end(&mut self, reply: Reply<()>) {
        if let Some(session) = &self.active {
            let message = SignalingMessage::session_end(&session.id, EndReason::UserInitiated);
            if let Err(e) = self.signaling.send(&message).await {
                debug!("SessionEnd notify failed: {}", e);
            }
        }
        self.teardown_all().await;
        self.monitor.reset();
        self.set_state(SessionState::Idle);
        let _ = reply.send(Ok(()));
    }

    async fn handle_reconnect(&mut self, reply: Reply<String>) {
        let remote_device = self
            .active
            .as_ref()
            .map(|s| s.remote_device.clone())
            .or_else(|| {
                self.last_remote_device_id
                    .as_deref()
                    .map(RemoteDeviceInfo::placeholder)
            });
        let Some(remote_device) = remote_device else {
            let _ = reply.send(Err(SessionError::NoPreviousSession));
            return;
        };
        if !self.signaling.is_connected() {
            let _ = reply.send(Err(SessionError::TransportUnavailable(
                "signaling transport is not connected".to_string(),
            )));
            return;
        }

        if let Some(session) = &self.active {
            let message = SignalingMessage::session_end(&session.id, EndReason::Superseded);
            if let Err(e) = self.signaling.send(&message).await {
                debug!("SessionEnd notify failed: {}", e);
            }
        }
        // The old lineage is fully torn down, negotiator included, before
        // the new negotiation starts. Full renegotiation, not ICE restart.
        self.teardown_all().await;
        self.monitor.reset();

        let session_id = generate_session_id();
        info!(
            "Reconnecting to {} with session {}",
            remote_device.device_id, session_id
        );
        self.start_offer_flow(session_id, remote_device, Some(reply)).await;
    }

    async fn handle_request_connection(&mut self, remote_device_id: String, reply: Reply<String>) {
        if self.active.is_some() || !self.pending.is_empty() {
            let _ = reply.send(Err(SessionError::InvalidState(
                "a session is already active".to_string(),
            )));
            return;
        }
        if !self.signaling.is_connected() {
            let _ = reply.send(Err(SessionError::TransportUnavailable(
                "signaling transport is not connected".to_string(),
            )));
            return;
        }

        let session_id = generate_session_id();
        let message = SignalingMessage::connection_request(
            &session_id,
            &self.config.device.device_id,
            &self.config.device.device_name,
        );
        match self.signaling.send(&message).await {
            Ok(()) => {
                info!("Requested session {} with {}", session_id, remote_device_id);
                self.outbound_request = Some(OutboundRequest {
                    session_id: session_id.clone(),
                    remote_device_id,
                });
                let _ = reply.send(Ok(session_id));
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    async fn handle_respond(&mut self, accept: bool, reply: Reply<()>) {
        let Some(approval) = self.pending_approval.take() else {
            let _ = reply.send(Err(SessionError::InvalidState(
                "no connection request awaiting approval".to_string(),
            )));
            return;
        };

        let response = SignalingMessage::connection_response(
            &approval.session_id,
            accept,
            &self.config.device.device_id,
            &self.config.device.device_name,
        );
        if let Err(e) = self.signaling.send(&response).await {
            self.pending_approval = Some(approval);
            let _ = reply.send(Err(e));
            return;
        }

        if accept {
            info!(
                "Accepted connection request from {}",
                approval.requester.device_id
            );
            self.handle_join(approval.session_id, approval.requester, reply).await;
        } else {
            info!(
                "Declined connection request from {}",
                approval.requester.device_id
            );
            self.set_state(SessionState::Idle);
            let _ = reply.send(Ok(()));
        }
    }

    fn handle_pause(&mut self, reply: Reply<()>) {
        match self.state() {
            SessionState::Connected { session_id, .. } => {
                info!("Session {} paused by user", session_id);
                self.set_state(SessionState::Paused {
                    session_id,
                    reason: PauseReason::UserRequested,
                });
                let _ = reply.send(Ok(()));
            }
            _ => {
                let _ = reply.send(Err(SessionError::InvalidState(
                    "no connected session to pause".to_string(),
                )));
            }
        }
    }

    fn handle_resume(&mut self, reply: Reply<()>) {
        if matches!(self.state(), SessionState::Paused { .. }) {
            self.mark_connected();
            let _ = reply.send(Ok(()));
        } else {
            let _ = reply.send(Err(SessionError::InvalidState(
                "session is not paused".to_string(),
            )));
        }
    }

    async fn handle_send_event(&mut self, event: RemoteEvent, reply: Reply<()>) {
        let Some(session) = self.active.as_ref() else {
            let _ = reply.send(Err(SessionError::InvalidState(
                "no active session".to_string(),
            )));
            return;
        };
        if !matches!(self.state(), SessionState::Connected { .. }) {
            let _ = reply.send(Err(SessionError::InvalidState(
                "session is not connected".to_string(),
            )));
            return;
        }
        let _ = reply.send(session.pipe.send(&event).await);
    }

    // ---- inbound signaling ----------------------------------------------

    async fn handle_signaling(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::Offer { session_id, sdp, .. } => {
                self.handle_remote_offer(session_id, sdp);
            }
            SignalingMessage::Answer { session_id, sdp, .. } => {
                self.handle_remote_answer(session_id, sdp);
            }
            SignalingMessage::IceCandidate {
                session_id,
                sdp_mid,
                sdp_mline_index,
                candidate,
                ..
            } => {
                self.handle_remote_candidate(session_id, sdp_mid, sdp_mline_index, candidate);
            }
            SignalingMessage::SessionEnd { session_id, reason, .. } => {
                self.handle_remote_end(session_id, reason).await;
            }
            SignalingMessage::Heartbeat { session_id, sequence, .. } => {
                self.handle_peer_heartbeat(session_id, sequence);
            }
            SignalingMessage::QualityAdjustment { session_id, target_config, .. } => {
                self.handle_peer_quality(session_id, target_config);
            }
            SignalingMessage::ConnectionRequest {
                session_id,
                device_id,
                device_name,
                ..
            } => {
                self.handle_connection_request(session_id, device_id, device_name);
            }
            SignalingMessage::ConnectionResponse {
                session_id,
                accepted,
                device_name,
                ..
            } => {
                self.handle_connection_response(session_id, accepted, device_name).await;
            }
        }
    }

    /// An offer is only valid against a pending session created by
    /// `join_session`. Duplicate or late offers are logged and dropped.
    fn handle_remote_offer(&mut self, session_id: String, sdp: String) {
        let Some(pending) = self.pending.get(&session_id) else {
            warn!("Ignoring offer for unknown session {}", session_id);
            return;
        };

        let negotiator = pending.negotiator.clone();
        let signaling = self.signaling.clone();
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let result = async {
                negotiator
                    .set_remote_description(SessionDescription::offer(sdp))
                    .await?;
                let answer = negotiator.create_answer().await?;
                let answer_sdp = answer.sdp.clone();
                negotiator.set_local_description(answer).await?;
                signaling
                    .send(&SignalingMessage::answer(&session_id, &answer_sdp))
                    .await
            }
            .await;
            let _ = commands.send(Command::Internal(InternalEvent::AnswerSent {
                session_id,
                result,
            }));
        });
    }

    async fn handle_answer_sent(&mut self, session_id: String, result: Result<(), SessionError>) {
        let Some(pending) = self.pending.remove(&session_id) else {
            debug!("Discarding answer outcome for discarded session {}", session_id);
            return;
        };

        match result {
            Ok(()) => {
                info!("Answer sent for session {}", session_id);
                self.active = Some(RemoteSession {
                    id: pending.id,
                    remote_device: pending.remote_device,
                    role: SessionRole::Controlled,
                    negotiator: pending.negotiator,
                    pipe: pending.pipe,
                    event_forwarder: pending.event_forwarder,
                    heartbeat: None,
                    watchdog: None,
                    last_peer_heartbeat: Arc::new(SyncMutex::new(Instant::now())),
                    connected_at: None,
                });
                self.mark_connected();
            }
            Err(e) => {
                warn!("Answer negotiation failed for session {}: {}", session_id, e);
                pending.event_forwarder.abort();
                let _ = pending.negotiator.close().await;
                self.set_state(SessionState::Error {
                    kind: SessionErrorKind::Negotiation,
                    message: e.to_string(),
                    recoverable: true,
                });
            }
        }
    }

    /// An answer is only valid for the active controller-side session.
    fn handle_remote_answer(&mut self, session_id: String, sdp: String) {
        let Some(session) = self.active.as_ref().filter(|s| s.id == session_id) else {
            warn!("Ignoring answer for unknown session {}", session_id);
            return;
        };

        let negotiator = session.negotiator.clone();
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let result = negotiator
                .set_remote_description(SessionDescription::answer(sdp))
                .await;
            let _ = commands.send(Command::Internal(InternalEvent::AnswerApplied {
                session_id,
                result,
            }));
        });
    }

    fn handle_answer_applied(&mut self, session_id: String, result: Result<(), SessionError>) {
        let is_current = self
            .active
            .as_ref()
            .map(|s| s.id == session_id)
            .unwrap_or(false);
        if !is_current {
            debug!("Discarding answer outcome for superseded session {}", session_id);
            return;
        }

        match result {
            Ok(()) => {
                if matches!(self.state(), SessionState::Connecting { .. }) {
                    self.mark_connected();
                } else {
                    debug!("Answer applied for session {} outside Connecting", session_id);
                }
            }
            // No transition: the caller decides whether to retry via
            // reconnect_session.
            Err(e) => warn!("Failed to apply remote answer for session {}: {}", session_id, e),
        }
    }

    /// Candidates route to whichever negotiator owns the session; the
    /// negotiator buffers them if the remote description is not set yet.
    fn handle_remote_candidate(
        &mut self,
        session_id: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
        candidate: String,
    ) {
        let negotiator = if let Some(session) =
            self.active.as_ref().filter(|s| s.id == session_id)
        {
            session.negotiator.clone()
        } else if let Some(pending) = self.pending.get(&session_id) {
            pending.negotiator.clone()
        } else {
            warn!("Dropping ICE candidate for unknown session {}", session_id);
            return;
        };

        let init = IceCandidateInit {
            candidate,
            sdp_mid,
            sdp_mline_index,
        };
        tokio::spawn(async move {
            if let Err(e) = negotiator.add_ice_candidate(init).await {
                warn!("Failed to apply remote ICE candidate: {}", e);
            }
        });
    }

    async fn handle_remote_end(&mut self, session_id: String, reason: EndReason) {
        let known = self
            .active
            .as_ref()
            .map(|s| s.id == session_id)
            .unwrap_or(false)
            || self.pending.contains_key(&session_id);
        if !known {
            warn!("Ignoring session end for unknown session {}", session_id);
            return;
        }

        info!("Session {} ended by remote peer: {:?}", session_id, reason);
        self.teardown_all().await;
        self.monitor.reset();
        self.set_state(SessionState::Disconnected {
            session_id: Some(session_id),
            reason: disconnect_reason(reason),
            error_message: None,
        });
    }

    fn handle_peer_heartbeat(&mut self, session_id: String, sequence: u64) {
        let mut resumed = false;
        if let Some(session) = self.active.as_ref().filter(|s| s.id == session_id) {
            debug!("Heartbeat {} from peer for session {}", sequence, session_id);
            *session.last_peer_heartbeat.lock() = Instant::now();
            resumed = matches!(
                self.state(),
                SessionState::Paused {
                    reason: PauseReason::NetworkInterrupted,
                    ..
                }
            );
        } else {
            debug!("Ignoring heartbeat for unknown session {}", session_id);
            return;
        }

        if resumed {
            info!("Peer heartbeats resumed for session {}", session_id);
            self.mark_connected();
        }
    }

    /// Peer-observed quality is telemetry only; local capture follows the
    /// local quality monitor.
    fn handle_peer_quality(&self, session_id: String, target_config: VideoConfig) {
        let known = self
            .active
            .as_ref()
            .map(|s| s.id == session_id)
            .unwrap_or(false)
            || self.pending.contains_key(&session_id);
        if !known {
            warn!("Dropping quality adjustment for unknown session {}", session_id);
            return;
        }
        info!(
            "Peer requests {}x{} @{}fps for session {}",
            target_config.width, target_config.height, target_config.frame_rate, session_id
        );
    }

    fn handle_connection_request(
        &mut self,
        session_id: String,
        device_id: String,
        device_name: String,
    ) {
        if !matches!(self.state(), SessionState::Idle) {
            info!("Declining connection request from {}: busy", device_id);
            let response = SignalingMessage::connection_response(
                &session_id,
                false,
                &self.config.device.device_id,
                &self.config.device.device_name,
            );
            let signaling = self.signaling.clone();
            tokio::spawn(async move {
                if let Err(e) = signaling.send(&response).await {
                    warn!("Failed to send decline: {}", e);
                }
            });
            return;
        }

        info!("Connection request from {} ({})", device_name, device_id);
        self.pending_approval = Some(PendingApproval {
            session_id: session_id.clone(),
            requester: RemoteDeviceInfo::new(device_id.clone(), device_name.clone()),
        });
        self.set_state(SessionState::WaitingForApproval {
            session_id,
            requester_device_id: device_id,
            requester_device_name: device_name,
        });
    }

    async fn handle_connection_response(
        &mut self,
        session_id: String,
        accepted: bool,
        device_name: String,
    ) {
        let matches_request = self
            .outbound_request
            .as_ref()
            .map(|r| r.session_id == session_id)
            .unwrap_or(false);
        if !matches_request {
            warn!("Ignoring connection response for unknown session {}", session_id);
            return;
        }
        let Some(request) = self.outbound_request.take() else {
            return;
        };

        if accepted {
            info!("{} accepted session {}", device_name, session_id);
            let remote_device = RemoteDeviceInfo::new(request.remote_device_id, device_name);
            self.start_offer_flow(session_id, remote_device, None).await;
        } else {
            info!("{} declined session {}", device_name, session_id);
            self.set_state(SessionState::Disconnected {
                session_id: Some(session_id),
                reason: DisconnectReason::Declined,
                error_message: None,
            });
        }
    }

    // ---- internal events -------------------------------------------------

    async fn handle_peer_event(&mut self, session_id: String, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                let known = self
                    .active
                    .as_ref()
                    .map(|s| s.id == session_id)
                    .unwrap_or(false)
                    || self.pending.contains_key(&session_id);
                if !known {
                    debug!("Discarding local candidate for dead session {}", session_id);
                    return;
                }
                let message = SignalingMessage::ice_candidate(
                    &session_id,
                    candidate.sdp_mid,
                    candidate.sdp_mline_index,
                    candidate.candidate,
                );
                let signaling = self.signaling.clone();
                tokio::spawn(async move {
                    if let Err(e) = signaling.send(&message).await {
                        warn!("Failed to forward ICE candidate: {}", e);
                    }
                });
            }
            PeerEvent::StateChange(peer_state) => {
                self.handle_peer_state(session_id, peer_state).await;
            }
            PeerEvent::ChannelOpen(label) => {
                debug!("Data channel '{}' open for session {}", label, session_id);
            }
            PeerEvent::ChannelMessage(payload) => {
                let is_active = self
                    .active
                    .as_ref()
                    .map(|s| s.id == session_id)
                    .unwrap_or(false);
                if !is_active {
                    return;
                }
                match RemoteEvent::decode(&payload) {
                    Ok(event) => {
                        let _ = self.events_tx.send(event);
                    }
                    Err(e) => warn!("Dropping undecodable data channel message: {}", e),
                }
            }
        }
    }

    async fn handle_peer_state(&mut self, session_id: String, peer_state: PeerConnectionState) {
        let is_active = self
            .active
            .as_ref()
            .map(|s| s.id == session_id)
            .unwrap_or(false);
        if !is_active {
            debug!("Peer state {:?} for inactive session {}", peer_state, session_id);
            return;
        }

        match peer_state {
            PeerConnectionState::Disconnected => {
                if matches!(self.state(), SessionState::Connected { .. }) {
                    info!("Peer transport interrupted for session {}", session_id);
                    self.set_state(SessionState::Paused {
                        session_id,
                        reason: PauseReason::NetworkInterrupted,
                    });
                }
            }
            PeerConnectionState::Connected => {
                if matches!(
                    self.state(),
                    SessionState::Paused {
                        reason: PauseReason::NetworkInterrupted,
                        ..
                    }
                ) {
                    info!("Peer transport recovered for session {}", session_id);
                    self.mark_connected();
                }
            }
            PeerConnectionState::Failed => {
                warn!("Peer connection failed for session {}", session_id);
                self.teardown_all().await;
                self.monitor.reset();
                self.set_state(SessionState::Error {
                    kind: SessionErrorKind::Negotiation,
                    message: "peer connection failed".to_string(),
                    recoverable: true,
                });
            }
            _ => debug!("Peer state {:?} for session {}", peer_state, session_id),
        }
    }

    async fn handle_connect_timeout(&mut self, session_id: String) {
        let timed_out = match self.state() {
            SessionState::Connecting { session_id: current, .. } => current == session_id,
            _ => false,
        };
        if timed_out {
            info!("Session {} timed out waiting for the peer", session_id);
            self.teardown_all().await;
            self.monitor.reset();
            self.set_state(SessionState::Error {
                kind: SessionErrorKind::Timeout,
                message: "negotiation timed out before the peer answered".to_string(),
                recoverable: true,
            });
            return;
        }

        // A pending entry can outlive its place in the state machine when
        // another session took over; discard it quietly.
        if let Some(pending) = self.pending.remove(&session_id) {
            debug!("Discarding stale pending session {}", session_id);
            pending.event_forwarder.abort();
            let _ = pending.negotiator.close().await;
        }
    }

    fn handle_peer_silent(&mut self, session_id: String) {
        let silence = match self.active.as_ref().filter(|s| s.id == session_id) {
            Some(session) => session.last_peer_heartbeat.lock().elapsed(),
            None => return,
        };
        let limit = Duration::from_secs(
            self.config.session.heartbeat_interval_secs
                * u64::from(self.config.session.heartbeat_miss_limit),
        );
        if silence <= limit {
            return;
        }

        if matches!(self.state(), SessionState::Connected { .. }) {
            warn!(
                "No heartbeat from peer for {:?} on session {}",
                silence, session_id
            );
            self.set_state(SessionState::Paused {
                session_id,
                reason: PauseReason::NetworkInterrupted,
            });
        }
    }

    // ---- quality fan-in --------------------------------------------------

    fn on_quality_changed(&self, quality: ConnectionQuality) {
        if let SessionState::Connected {
            session_id,
            remote_device,
            connected_at,
            ..
        } = self.state()
        {
            self.set_state(SessionState::Connected {
                session_id,
                remote_device,
                connected_at,
                quality,
            });
        }
    }

    fn on_recommended_config(&self, config: VideoConfig) {
        let Some(session) = self.active.as_ref() else {
            return;
        };
        if !matches!(self.state(), SessionState::Connected { .. }) {
            return;
        }
        info!(
            "Requesting peer video config {}x{} @{}fps for session {}",
            config.width, config.height, config.frame_rate, session.id
        );
        let message = SignalingMessage::quality_adjustment(&session.id, config);
        let signaling = self.signaling.clone();
        tokio::spawn(async move {
            if let Err(e) = signaling.send(&message).await {
                warn!("Failed to send quality adjustment: {}", e);
            }
        });
    }

    // ---- plumbing --------------------------------------------------------

    /// Create a peer transport, its negotiator and the event data channel.
    /// The forwarder task tags every peer event with the owning session id,
    /// so candidate routing never guesses.
    async fn build_peer(
        &self,
        session_id: &str,
    ) -> Result<(Arc<Negotiator>, EventPipe, JoinHandle<()>), SessionError> {
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        let transport = self.peers.connect_peer(peer_tx).await?;
        let negotiator = Arc::new(Negotiator::new(transport));
        let channel = negotiator
            .create_data_channel(EVENT_CHANNEL_LABEL, true, "")
            .await?;

        let commands = self.commands_tx.clone();
        let sid = session_id.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = peer_rx.recv().await {
                let forwarded = commands.send(Command::Internal(InternalEvent::Peer {
                    session_id: sid.clone(),
                    event,
                }));
                if forwarded.is_err() {
                    break;
                }
            }
        });

        Ok((negotiator, EventPipe::new(channel), forwarder))
    }

    /// Transition to Connected and start the heartbeat and watchdog loops
    /// if they are not already running.
    fn mark_connected(&mut self) {
        let heartbeat_period =
            Duration::from_secs(self.config.session.heartbeat_interval_secs);
        let miss_limit = self.config.session.heartbeat_miss_limit;
        let quality = self.monitor.current_quality();
        let signaling = self.signaling.clone();
        let commands = self.commands_tx.clone();

        let state = {
            let Some(session) = self.active.as_mut() else {
                return;
            };
            *session.last_peer_heartbeat.lock() = Instant::now();
            let connected_at = *session.connected_at.get_or_insert_with(now_millis);
            if session.heartbeat.is_none() {
                session.heartbeat = Some(spawn_heartbeat(
                    signaling,
                    session.id.clone(),
                    heartbeat_period,
                ));
            }
            if session.watchdog.is_none() {
                session.watchdog = Some(spawn_watchdog(
                    commands,
                    session.id.clone(),
                    session.last_peer_heartbeat.clone(),
                    heartbeat_period,
                    miss_limit,
                ));
            }
            info!("Session {} connected ({:?})", session.id, session.role);
            SessionState::Connected {
                session_id: session.id.clone(),
                remote_device: session.remote_device.clone(),
                connected_at,
                quality,
            }
        };
        self.set_state(state);
    }

    fn spawn_connect_timeout(&self, session_id: &str) {
        let commands = self.commands_tx.clone();
        let session_id = session_id.to_string();
        let timeout = Duration::from_secs(self.config.session.connect_timeout_secs);
        tokio::spawn(async move {
            sleep(timeout).await;
            let _ = commands.send(Command::Internal(InternalEvent::ConnectTimeout {
                session_id,
            }));
        });
    }

    /// Release the active session, every pending session and all their
    /// background tasks. No emissions survive this call.
    async fn teardown_all(&mut self) {
        if let Some(session) = self.active.take() {
            if let Some(heartbeat) = session.heartbeat {
                heartbeat.abort();
            }
            if let Some(watchdog) = session.watchdog {
                watchdog.abort();
            }
            session.event_forwarder.abort();
            let _ = session.pipe.close().await;
            let _ = session.negotiator.close().await;
            debug!("Session {} torn down", session.id);
        }
        for (_, pending) in self.pending.drain() {
            pending.event_forwarder.abort();
            let _ = pending.pipe.close().await;
            let _ = pending.negotiator.close().await;
            debug!("Pending session {} discarded", pending.id);
        }
        self.pending_approval = None;
        self.outbound_request = None;
    }
}

fn disconnect_reason(reason: EndReason) -> DisconnectReason {
    match reason {
        EndReason::UserInitiated => DisconnectReason::RemoteEnded,
        EndReason::Timeout => DisconnectReason::Timeout,
        EndReason::NetworkLost => DisconnectReason::NetworkLost,
        EndReason::Superseded => DisconnectReason::Superseded,
        EndReason::Error => DisconnectReason::Failed,
    }
}

/// Session ids are a millisecond timestamp plus a random suffix. Collisions
/// are accepted as negligible; these are not security tokens.
fn generate_session_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", now_millis(), &suffix[..8])
}

fn spawn_heartbeat(
    signaling: Arc<dyn SignalingTransport>,
    session_id: String,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        // Consume the immediate first tick so heartbeats start one period in.
        ticker.tick().await;
        let mut sequence: u64 = 0;
        loop {
            ticker.tick().await;
            sequence += 1;
            let message = SignalingMessage::heartbeat(&session_id, sequence);
            if let Err(e) = signaling.send(&message).await {
                debug!("Heartbeat {} send failed for session {}: {}", sequence, session_id, e);
            }
        }
    })
}

fn spawn_watchdog(
    commands: mpsc::UnboundedSender<Command>,
    session_id: String,
    last_seen: Arc<SyncMutex<Instant>>,
    period: Duration,
    miss_limit: u32,
) -> JoinHandle<()> {
    let limit = period * miss_limit;
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let silence = last_seen.lock().elapsed();
            if silence > limit {
                let notified = commands.send(Command::Internal(InternalEvent::PeerSilent {
                    session_id: session_id.clone(),
                }));
                if notified.is_err() {
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::negotiator::{DataChannel, PeerTransport};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::broadcast;
    use tokio::time::timeout;

    struct MockSignaling {
        inbound: broadcast::Sender<SignalingMessage>,
        sent: SyncMutex<Vec<SignalingMessage>>,
        connected: AtomicBool,
    }

    impl MockSignaling {
        fn new() -> Self {
            let (inbound, _) = broadcast::channel(64);
            Self {
                inbound,
                sent: SyncMutex::new(Vec::new()),
                connected: AtomicBool::new(false),
            }
        }

        fn inject(&self, message: SignalingMessage) {
            self.inbound.send(message).expect("actor subscribed");
        }

        fn sent_messages(&self) -> Vec<SignalingMessage> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl SignalingTransport for MockSignaling {
        async fn connect(&self, _url: &str) -> Result<(), SessionError> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), SessionError> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&self, message: &SignalingMessage) -> Result<(), SessionError> {
            if !self.is_connected() {
                return Err(SessionError::TransportUnavailable(
                    "not connected".to_string(),
                ));
            }
            self.sent.lock().push(message.clone());
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<SignalingMessage> {
            self.inbound.subscribe()
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    struct MockChannel {
        open: AtomicBool,
        sent: SyncMutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl DataChannel for MockChannel {
        fn label(&self) -> String {
            EVENT_CHANNEL_LABEL.to_string()
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn send(&self, payload: &[u8]) -> Result<(), SessionError> {
            if !self.is_open() {
                return Err(SessionError::DataChannelError("closed".to_string()));
            }
            self.sent.lock().push(payload.to_vec());
            Ok(())
        }

        async fn close(&self) -> Result<(), SessionError> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockPeer {
        events: mpsc::UnboundedSender<PeerEvent>,
        channel: Arc<MockChannel>,
        applied_candidates: SyncMutex<Vec<IceCandidateInit>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl PeerTransport for MockPeer {
        async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
            Ok(SessionDescription::offer("v=0 mock-offer"))
        }

        async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
            Ok(SessionDescription::answer("v=0 mock-answer"))
        }

        async fn set_local_description(
            &self,
            _desc: SessionDescription,
        ) -> Result<(), SessionError> {
            Ok(())
        }

        async fn set_remote_description(
            &self,
            _desc: SessionDescription,
        ) -> Result<(), SessionError> {
            Ok(())
        }

        async fn apply_ice_candidate(
            &self,
            candidate: &IceCandidateInit,
        ) -> Result<(), SessionError> {
            self.applied_candidates.lock().push(candidate.clone());
            Ok(())
        }

        async fn create_data_channel(
            &self,
            _label: &str,
            _ordered: bool,
            _protocol: &str,
        ) -> Result<Arc<dyn DataChannel>, SessionError> {
            Ok(self.channel.clone())
        }

        async fn close(&self) -> Result<(), SessionError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockConnector {
        peers: SyncMutex<Vec<Arc<MockPeer>>>,
    }

    impl MockConnector {
        fn peer(&self, index: usize) -> Arc<MockPeer> {
            self.peers.lock()[index].clone()
        }

        fn peer_count(&self) -> usize {
            self.peers.lock().len()
        }
    }

    #[async_trait]
    impl PeerConnector for MockConnector {
        async fn connect_peer(
            &self,
            events: mpsc::UnboundedSender<PeerEvent>,
        ) -> Result<Arc<dyn PeerTransport>, SessionError> {
            let peer = Arc::new(MockPeer {
                events,
                channel: Arc::new(MockChannel {
                    open: AtomicBool::new(true),
                    sent: SyncMutex::new(Vec::new()),
                }),
                applied_candidates: SyncMutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            });
            self.peers.lock().push(peer.clone());
            Ok(peer as Arc<dyn PeerTransport>)
        }
    }

    fn fixture_with(config: Config) -> (SessionManager, Arc<MockSignaling>, Arc<MockConnector>) {
        let signaling = Arc::new(MockSignaling::new());
        let connector = Arc::new(MockConnector::default());
        let manager = SessionManager::new(
            config,
            signaling.clone() as Arc<dyn SignalingTransport>,
            connector.clone() as Arc<dyn PeerConnector>,
        );
        (manager, signaling, connector)
    }

    fn fixture() -> (SessionManager, Arc<MockSignaling>, Arc<MockConnector>) {
        fixture_with(Config::default())
    }

    async fn wait_for_state(
        manager: &SessionManager,
        predicate: impl Fn(&SessionState) -> bool,
    ) -> SessionState {
        let mut rx = manager.subscribe_state();
        let state = timeout(Duration::from_secs(5), rx.wait_for(|s| predicate(s)))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed")
            .clone();
        state
    }

    async fn connected_controller(
        manager: &SessionManager,
        signaling: &MockSignaling,
    ) -> String {
        manager.connect_to_server("wss://relay.test/ws").await.unwrap();
        let session_id = manager.create_session("device-b").await.unwrap();
        signaling.inject(SignalingMessage::answer(&session_id, "v=0 remote-answer"));
        wait_for_state(manager, |s| matches!(s, SessionState::Connected { .. })).await;
        session_id
    }

    #[tokio::test]
    async fn create_session_requires_transport() {
        let (manager, _signaling, _connector) = fixture();
        let result = manager.create_session("device-b").await;
        assert!(matches!(result, Err(SessionError::TransportUnavailable(_))));
        assert_eq!(manager.current_state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn controller_happy_path() {
        let (manager, signaling, _connector) = fixture();
        manager.connect_to_server("wss://relay.test/ws").await.unwrap();

        let session_id = manager.create_session("device-b").await.unwrap();
        match manager.current_state() {
            SessionState::Connecting { session_id: current, remote_device_id } => {
                assert_eq!(current, session_id);
                assert_eq!(remote_device_id.as_deref(), Some("device-b"));
            }
            other => panic!("Expected Connecting, got {:?}", other),
        }
        assert!(signaling.sent_messages().iter().any(|m| matches!(
            m,
            SignalingMessage::Offer { session_id: id, .. } if *id == session_id
        )));

        signaling.inject(SignalingMessage::answer(&session_id, "v=0 remote-answer"));
        let state =
            wait_for_state(&manager, |s| matches!(s, SessionState::Connected { .. })).await;
        match state {
            SessionState::Connected { session_id: current, quality, .. } => {
                assert_eq!(current, session_id);
                assert_eq!(quality, ConnectionQuality::Good);
            }
            other => panic!("Expected Connected, got {:?}", other),
        }

        manager.end_session().await.unwrap();
        assert_eq!(manager.current_state(), SessionState::Idle);
        assert!(signaling.sent_messages().iter().any(|m| matches!(
            m,
            SignalingMessage::SessionEnd { reason: EndReason::UserInitiated, .. }
        )));
    }

    #[tokio::test]
    async fn controlled_happy_path() {
        let (manager, signaling, _connector) = fixture();
        manager.connect_to_server("wss://relay.test/ws").await.unwrap();

        let session_id = "1700000000-aabbccdd";
        manager
            .join_session(session_id, RemoteDeviceInfo::new("device-a", "Controller"))
            .await
            .unwrap();
        assert!(matches!(
            manager.current_state(),
            SessionState::Connecting { .. }
        ));

        signaling.inject(SignalingMessage::offer(session_id, "v=0 remote-offer"));
        wait_for_state(&manager, |s| matches!(s, SessionState::Connected { .. })).await;

        assert!(signaling.sent_messages().iter().any(|m| matches!(
            m,
            SignalingMessage::Answer { session_id: id, .. } if id == session_id
        )));
    }

    #[tokio::test]
    async fn end_session_is_idempotent() {
        let (manager, signaling, _connector) = fixture();
        manager.connect_to_server("wss://relay.test/ws").await.unwrap();

        // With no session at all.
        manager.end_session().await.unwrap();
        manager.end_session().await.unwrap();
        assert_eq!(manager.current_state(), SessionState::Idle);

        // Twice in a row after a real session.
        connected_controller(&manager, &signaling).await;
        manager.end_session().await.unwrap();
        manager.end_session().await.unwrap();
        assert_eq!(manager.current_state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn unknown_session_messages_are_dropped() {
        let (manager, signaling, connector) = fixture();
        manager.connect_to_server("wss://relay.test/ws").await.unwrap();
        let session_id = manager.create_session("device-b").await.unwrap();

        signaling.inject(SignalingMessage::ice_candidate(
            "some-other-session",
            Some("0".to_string()),
            Some(0),
            "candidate:bogus".to_string(),
        ));
        signaling.inject(SignalingMessage::session_end(
            "some-other-session",
            EndReason::UserInitiated,
        ));
        // The real answer arrives after the strays; surviving to Connected
        // proves they changed nothing.
        signaling.inject(SignalingMessage::answer(&session_id, "v=0 remote-answer"));

        wait_for_state(&manager, |s| matches!(s, SessionState::Connected { .. })).await;
        assert!(connector.peer(0).applied_candidates.lock().is_empty());
    }

    #[tokio::test]
    async fn remote_session_end_disconnects() {
        let (manager, signaling, connector) = fixture();
        let session_id = connected_controller(&manager, &signaling).await;

        signaling.inject(SignalingMessage::session_end(&session_id, EndReason::UserInitiated));
        let state = wait_for_state(&manager, |s| {
            matches!(s, SessionState::Disconnected { .. })
        })
        .await;
        match state {
            SessionState::Disconnected { session_id: ended, reason, .. } => {
                assert_eq!(ended.as_deref(), Some(session_id.as_str()));
                assert_eq!(reason, DisconnectReason::RemoteEnded);
            }
            other => panic!("Expected Disconnected, got {:?}", other),
        }
        assert!(connector.peer(0).closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn reconnect_supersedes_old_session() {
        let (manager, signaling, connector) = fixture();
        let old_id = connected_controller(&manager, &signaling).await;

        let new_id = manager.reconnect_session().await.unwrap();
        assert_ne!(old_id, new_id);
        assert_eq!(connector.peer_count(), 2);
        assert!(connector.peer(0).closed.load(Ordering::SeqCst));
        assert!(matches!(
            manager.current_state(),
            SessionState::Connecting { .. }
        ));

        let sent = signaling.sent_messages();
        assert!(sent.iter().any(|m| matches!(
            m,
            SignalingMessage::SessionEnd { session_id: id, reason: EndReason::Superseded, .. }
                if *id == old_id
        )));
        assert!(sent.iter().any(|m| matches!(
            m,
            SignalingMessage::Offer { session_id: id, .. } if *id == new_id
        )));
    }

    #[tokio::test]
    async fn reconnect_without_history_fails() {
        let (manager, _signaling, _connector) = fixture();
        manager.connect_to_server("wss://relay.test/ws").await.unwrap();
        let result = manager.reconnect_session().await;
        assert_eq!(result, Err(SessionError::NoPreviousSession));
    }

    #[tokio::test]
    async fn approval_flow_accept_joins_session() {
        let (manager, signaling, _connector) = fixture();
        manager.connect_to_server("wss://relay.test/ws").await.unwrap();

        signaling.inject(SignalingMessage::connection_request(
            "1700000000-req00001",
            "device-a",
            "Alice's laptop",
        ));
        let state = wait_for_state(&manager, |s| {
            matches!(s, SessionState::WaitingForApproval { .. })
        })
        .await;
        match state {
            SessionState::WaitingForApproval { requester_device_name, .. } => {
                assert_eq!(requester_device_name, "Alice's laptop");
            }
            other => panic!("Expected WaitingForApproval, got {:?}", other),
        }

        manager.respond_to_request(true).await.unwrap();
        assert!(matches!(
            manager.current_state(),
            SessionState::Connecting { .. }
        ));
        assert!(signaling.sent_messages().iter().any(|m| matches!(
            m,
            SignalingMessage::ConnectionResponse { accepted: true, .. }
        )));

        signaling.inject(SignalingMessage::offer("1700000000-req00001", "v=0 remote-offer"));
        wait_for_state(&manager, |s| matches!(s, SessionState::Connected { .. })).await;
    }

    #[tokio::test]
    async fn approval_flow_decline_returns_to_idle() {
        let (manager, signaling, _connector) = fixture();
        manager.connect_to_server("wss://relay.test/ws").await.unwrap();

        signaling.inject(SignalingMessage::connection_request(
            "1700000000-req00002",
            "device-a",
            "Alice's laptop",
        ));
        wait_for_state(&manager, |s| {
            matches!(s, SessionState::WaitingForApproval { .. })
        })
        .await;

        manager.respond_to_request(false).await.unwrap();
        assert_eq!(manager.current_state(), SessionState::Idle);
        assert!(signaling.sent_messages().iter().any(|m| matches!(
            m,
            SignalingMessage::ConnectionResponse { accepted: false, .. }
        )));
    }

    #[tokio::test]
    async fn accepted_connection_request_starts_offer_flow() {
        let (manager, signaling, _connector) = fixture();
        manager.connect_to_server("wss://relay.test/ws").await.unwrap();

        let session_id = manager.request_connection("device-b").await.unwrap();
        assert_eq!(manager.current_state(), SessionState::Idle);

        signaling.inject(SignalingMessage::connection_response(
            &session_id,
            true,
            "device-b",
            "Bob's desktop",
        ));
        let state =
            wait_for_state(&manager, |s| matches!(s, SessionState::Connecting { .. })).await;
        assert_eq!(state.session_id(), Some(session_id.as_str()));
        assert!(signaling.sent_messages().iter().any(|m| matches!(
            m,
            SignalingMessage::Offer { session_id: id, .. } if *id == session_id
        )));
    }

    #[tokio::test]
    async fn pause_blocks_events_until_resume() {
        let (manager, signaling, connector) = fixture();
        connected_controller(&manager, &signaling).await;

        let event = RemoteEvent::Key { keycode: 65, pressed: true };
        manager.send_event(event.clone()).await.unwrap();

        manager.pause_session().await.unwrap();
        assert!(matches!(
            manager.current_state(),
            SessionState::Paused { reason: PauseReason::UserRequested, .. }
        ));
        let result = manager.send_event(event.clone()).await;
        assert!(matches!(result, Err(SessionError::InvalidState(_))));

        manager.resume_session().await.unwrap();
        manager.send_event(event).await.unwrap();
        assert_eq!(connector.peer(0).channel.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn inbound_channel_messages_become_events() {
        let (manager, signaling, connector) = fixture();
        let mut events = manager.take_event_stream().unwrap();
        connected_controller(&manager, &signaling).await;

        let event = RemoteEvent::Scroll { x: 0.5, y: 0.5, delta_x: 0.0, delta_y: -2.0 };
        connector
            .peer(0)
            .events
            .send(PeerEvent::ChannelMessage(event.encode().unwrap()))
            .unwrap();

        let received = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed");
        assert_eq!(received, event);
    }

    #[tokio::test(start_paused = true)]
    async fn connecting_times_out_into_recoverable_error() {
        let mut config = Config::default();
        config.session.connect_timeout_secs = 1;
        let (manager, signaling, _connector) = fixture_with(config);
        manager.connect_to_server("wss://relay.test/ws").await.unwrap();

        manager.create_session("device-b").await.unwrap();
        let state = wait_for_state(&manager, |s| matches!(s, SessionState::Error { .. })).await;
        match state {
            SessionState::Error { kind, recoverable, .. } => {
                assert_eq!(kind, SessionErrorKind::Timeout);
                assert!(recoverable);
            }
            other => panic!("Expected Error, got {:?}", other),
        }
        // The peer never answered; nothing but the offer went out.
        assert!(!signaling
            .sent_messages()
            .iter()
            .any(|m| matches!(m, SignalingMessage::Heartbeat { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_flow_while_connected() {
        let mut config = Config::default();
        config.session.heartbeat_interval_secs = 1;
        let (manager, signaling, _connector) = fixture_with(config);
        connected_controller(&manager, &signaling).await;

        sleep(Duration::from_millis(2_500)).await;

        let sequences: Vec<u64> = signaling
            .sent_messages()
            .iter()
            .filter_map(|m| match m {
                SignalingMessage::Heartbeat { sequence, .. } => Some(*sequence),
                _ => None,
            })
            .collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn missed_heartbeats_pause_then_resume() {
        let mut config = Config::default();
        config.session.heartbeat_interval_secs = 1;
        config.session.heartbeat_miss_limit = 3;
        let (manager, signaling, _connector) = fixture_with(config);
        let session_id = connected_controller(&manager, &signaling).await;

        // No peer heartbeats arrive; the watchdog declares the peer silent.
        sleep(Duration::from_secs(5)).await;
        let state = wait_for_state(&manager, |s| matches!(s, SessionState::Paused { .. })).await;
        assert!(matches!(
            state,
            SessionState::Paused { reason: PauseReason::NetworkInterrupted, .. }
        ));

        // A late heartbeat brings the session back.
        signaling.inject(SignalingMessage::heartbeat(&session_id, 9));
        wait_for_state(&manager, |s| matches!(s, SessionState::Connected { .. })).await;
    }
}
