//! Peer connection negotiation
//!
//! Wraps a peer transport and enforces the SDP/ICE ordering contract:
//! candidates that arrive before the remote description is applied are
//! buffered and flushed in arrival order once it lands. Applying a
//! candidate before the remote description exists is undefined behavior in
//! the underlying transport, so the buffer is mandatory, not an
//! optimization.

use super::SessionError;
use async_trait::async_trait;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Which half of the offer/answer exchange a description is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An SDP payload plus its role in the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A host/network path descriptor for the peer-to-peer route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidateInit {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Peer transport connection state, as reported by the implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Event emitted by a peer transport. Each transport is created with its
/// own event sender, so events are tagged with the owning session by
/// construction rather than looked up after the fact.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Locally gathered ICE candidate, ready to trickle to the peer.
    IceCandidate(IceCandidateInit),
    StateChange(PeerConnectionState),
    ChannelOpen(String),
    ChannelMessage(Vec<u8>),
}

/// A reliable, ordered message channel multiplexed over the peer
/// connection.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    async fn send(&self, payload: &[u8]) -> Result<(), SessionError>;

    async fn close(&self) -> Result<(), SessionError>;
}

/// The raw peer-to-peer transport underneath a [`Negotiator`]. All
/// operations may suspend for as long as the underlying stack needs.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, SessionError>;

    async fn create_answer(&self) -> Result<SessionDescription, SessionError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), SessionError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SessionError>;

    /// Apply a candidate directly. Callers must go through
    /// [`Negotiator::add_ice_candidate`] so the ordering contract holds.
    async fn apply_ice_candidate(&self, candidate: &IceCandidateInit) -> Result<(), SessionError>;

    async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
        protocol: &str,
    ) -> Result<Arc<dyn DataChannel>, SessionError>;

    async fn close(&self) -> Result<(), SessionError>;
}

/// Creates peer transports. Events for each transport are delivered on the
/// sender handed over at creation time.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect_peer(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerTransport>, SessionError>;
}

struct CandidateBuffer {
    remote_set: bool,
    queued: Vec<IceCandidateInit>,
}

/// Negotiation wrapper for one peer connection. Each instance is owned by
/// exactly one session and never shared between sessions.
pub struct Negotiator {
    transport: Arc<dyn PeerTransport>,
    candidates: Mutex<CandidateBuffer>,
    exchange: Mutex<()>,
    local_set: AtomicBool,
    closed: AtomicBool,
}

impl Negotiator {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            transport,
            candidates: Mutex::new(CandidateBuffer {
                remote_set: false,
                queued: Vec::new(),
            }),
            exchange: Mutex::new(()),
            local_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::InvalidState(
                "negotiator is closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Create an SDP offer. Only one offer/answer call may be in flight at
    /// a time on a given negotiator.
    pub async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
        self.ensure_open()?;
        let _guard = self
            .exchange
            .try_lock()
            .map_err(|_| SessionError::NegotiationInProgress)?;
        self.transport.create_offer().await
    }

    /// Create an SDP answer; same exclusivity rules as [`Self::create_offer`].
    pub async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
        self.ensure_open()?;
        let _guard = self
            .exchange
            .try_lock()
            .map_err(|_| SessionError::NegotiationInProgress)?;
        self.transport.create_answer().await
    }

    pub async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.transport.set_local_description(desc).await?;
        self.local_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Apply the remote description, then flush every buffered candidate in
    /// arrival order. The buffer lock is held across the flush so a
    /// concurrently arriving candidate cannot jump the queue or apply
    /// twice.
    pub async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.transport.set_remote_description(desc).await?;

        let mut buffer = self.candidates.lock().await;
        buffer.remote_set = true;
        let queued = std::mem::take(&mut buffer.queued);
        if !queued.is_empty() {
            debug!("Flushing {} buffered ICE candidates", queued.len());
        }
        for candidate in &queued {
            self.transport.apply_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Apply a remote candidate now, or buffer it until the remote
    /// description is available.
    pub async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), SessionError> {
        self.ensure_open()?;
        let mut buffer = self.candidates.lock().await;
        if buffer.remote_set {
            self.transport.apply_ice_candidate(&candidate).await
        } else {
            debug!("Buffering ICE candidate until remote description is set");
            buffer.queued.push(candidate);
            Ok(())
        }
    }

    pub async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
        protocol: &str,
    ) -> Result<Arc<dyn DataChannel>, SessionError> {
        self.ensure_open()?;
        self.transport.create_data_channel(label, ordered, protocol).await
    }

    /// Release the underlying transport. Safe to call multiple times; the
    /// candidate queue is cleared and both description flags reset.
    pub async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut buffer = self.candidates.lock().await;
            buffer.queued.clear();
            buffer.remote_set = false;
        }
        self.local_set.store(false, Ordering::SeqCst);
        self.transport.close().await
    }

    pub fn local_description_set(&self) -> bool {
        self.local_set.load(Ordering::SeqCst)
    }

    pub async fn remote_description_set(&self) -> bool {
        self.candidates.lock().await.remote_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct StubTransport {
        applied: SyncMutex<Vec<IceCandidateInit>>,
        closed: AtomicBool,
        offer_gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl PeerTransport for StubTransport {
        async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
            if let Some(gate) = &self.offer_gate {
                gate.notified().await;
            }
            Ok(SessionDescription::offer("v=0 stub-offer"))
        }

        async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
            Ok(SessionDescription::answer("v=0 stub-answer"))
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
            self.applied.lock().push(candidate.clone());
            Ok(())
        }

        async fn create_data_channel(
            &self,
            _label: &str,
            _ordered: bool,
            _protocol: &str,
        ) -> Result<Arc<dyn DataChannel>, SessionError> {
            Err(SessionError::DataChannelError("not supported".to_string()))
        }

        async fn close(&self) -> Result<(), SessionError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn candidate(n: u32) -> IceCandidateInit {
        IceCandidateInit {
            candidate: format!("candidate:{}", n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn candidates_buffer_until_remote_description() {
        let transport = Arc::new(StubTransport::default());
        let negotiator = Negotiator::new(transport.clone());

        negotiator.add_ice_candidate(candidate(1)).await.unwrap();
        negotiator.add_ice_candidate(candidate(2)).await.unwrap();
        negotiator.add_ice_candidate(candidate(3)).await.unwrap();
        assert!(transport.applied.lock().is_empty());

        negotiator
            .set_remote_description(SessionDescription::answer("v=0 remote"))
            .await
            .unwrap();

        let applied = transport.applied.lock().clone();
        assert_eq!(applied, vec![candidate(1), candidate(2), candidate(3)]);
        assert!(negotiator.remote_description_set().await);
    }

    #[tokio::test]
    async fn candidates_after_remote_description_apply_directly() {
        let transport = Arc::new(StubTransport::default());
        let negotiator = Negotiator::new(transport.clone());

        negotiator
            .set_remote_description(SessionDescription::answer("v=0 remote"))
            .await
            .unwrap();
        negotiator.add_ice_candidate(candidate(7)).await.unwrap();

        // Applied exactly once, never re-flushed.
        assert_eq!(transport.applied.lock().clone(), vec![candidate(7)]);
    }

    #[tokio::test]
    async fn concurrent_offer_calls_are_rejected() {
        let gate = Arc::new(Notify::new());
        let transport = Arc::new(StubTransport {
            offer_gate: Some(gate.clone()),
            ..Default::default()
        });
        let negotiator = Arc::new(Negotiator::new(transport));

        let first = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.create_offer().await })
        };
        tokio::task::yield_now().await;

        let second = negotiator.create_offer().await;
        assert_eq!(second, Err(SessionError::NegotiationInProgress));

        gate.notify_one();
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_clears_state() {
        let transport = Arc::new(StubTransport::default());
        let negotiator = Negotiator::new(transport.clone());

        negotiator
            .set_local_description(SessionDescription::offer("v=0 local"))
            .await
            .unwrap();
        negotiator.add_ice_candidate(candidate(1)).await.unwrap();

        negotiator.close().await.unwrap();
        negotiator.close().await.unwrap();
        assert!(transport.closed.load(Ordering::SeqCst));
        assert!(!negotiator.local_description_set());

        // Every operation on a closed negotiator is an error.
        let result = negotiator.add_ice_candidate(candidate(2)).await;
        assert!(matches!(result, Err(SessionError::InvalidState(_))));
        assert!(matches!(
            negotiator.create_offer().await,
            Err(SessionError::InvalidState(_))
        ));
    }
}
