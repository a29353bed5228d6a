//! Data channel event pipe
//!
//! Serializes remote input events for the session data channel and decodes
//! them on the way in. The channel is reliable and ordered, so delivery
//! order is the emission order; this layer adds nothing but the codec.

use super::negotiator::DataChannel;
use super::SessionError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Touch contact lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TouchPhase {
    Down,
    Move,
    Up,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GestureKind {
    Tap,
    LongPress,
    Pinch,
    Swipe,
}

/// Remote input event union carried over the data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RemoteEvent {
    Touch {
        phase: TouchPhase,
        x: f32,
        y: f32,
        #[serde(default)]
        pointer: u32,
    },
    Key {
        keycode: u32,
        pressed: bool,
    },
    Scroll {
        x: f32,
        y: f32,
        delta_x: f32,
        delta_y: f32,
    },
    Gesture {
        kind: GestureKind,
        x: f32,
        y: f32,
        #[serde(default = "default_scale")]
        scale: f32,
    },
}

fn default_scale() -> f32 {
    1.0
}

impl RemoteEvent {
    pub fn encode(&self) -> Result<Vec<u8>, SessionError> {
        serde_json::to_vec(self)
            .map_err(|e| SessionError::DataChannelError(format!("Failed to encode event: {}", e)))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, SessionError> {
        serde_json::from_slice(payload)
            .map_err(|e| SessionError::DataChannelError(format!("Failed to decode event: {}", e)))
    }
}

/// Event send half over one session data channel. Receiving is handled by
/// the session manager, which decodes inbound channel messages into an
/// ordered stream.
#[derive(Clone)]
pub struct EventPipe {
    channel: Arc<dyn DataChannel>,
}

impl EventPipe {
    pub fn new(channel: Arc<dyn DataChannel>) -> Self {
        Self { channel }
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Encode and send one event. Failures are reported to the caller and
    /// never retried here.
    pub async fn send(&self, event: &RemoteEvent) -> Result<(), SessionError> {
        if !self.channel.is_open() {
            return Err(SessionError::DataChannelError(
                "channel is not open".to_string(),
            ));
        }
        self.channel.send(&event.encode()?).await
    }

    pub async fn close(&self) -> Result<(), SessionError> {
        self.channel.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubChannel {
        open: AtomicBool,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl StubChannel {
        fn new(open: bool) -> Arc<Self> {
            Arc::new(Self {
                open: AtomicBool::new(open),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl DataChannel for StubChannel {
        fn label(&self) -> String {
            "events".to_string()
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn send(&self, payload: &[u8]) -> Result<(), SessionError> {
            self.sent.lock().push(payload.to_vec());
            Ok(())
        }

        async fn close(&self) -> Result<(), SessionError> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn events_roundtrip() {
        let events = vec![
            RemoteEvent::Touch {
                phase: TouchPhase::Down,
                x: 0.25,
                y: 0.75,
                pointer: 1,
            },
            RemoteEvent::Key {
                keycode: 0xff0d,
                pressed: true,
            },
            RemoteEvent::Scroll {
                x: 0.5,
                y: 0.5,
                delta_x: 0.0,
                delta_y: -3.0,
            },
            RemoteEvent::Gesture {
                kind: GestureKind::Pinch,
                x: 0.5,
                y: 0.5,
                scale: 1.4,
            },
        ];

        for event in events {
            let decoded = RemoteEvent::decode(&event.encode().unwrap()).unwrap();
            assert_eq!(decoded, event);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(RemoteEvent::decode(b"\x00\x01\x02").is_err());
        assert!(RemoteEvent::decode(b"{\"type\":\"warp\"}").is_err());
    }

    #[tokio::test]
    async fn send_requires_open_channel() {
        let channel = StubChannel::new(false);
        let pipe = EventPipe::new(channel.clone());
        let event = RemoteEvent::Key {
            keycode: 65,
            pressed: false,
        };

        let result = pipe.send(&event).await;
        assert!(matches!(result, Err(SessionError::DataChannelError(_))));
        assert!(channel.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn send_encodes_onto_the_channel() {
        let channel = StubChannel::new(true);
        let pipe = EventPipe::new(channel.clone());
        let event = RemoteEvent::Touch {
            phase: TouchPhase::Move,
            x: 0.1,
            y: 0.9,
            pointer: 0,
        };

        pipe.send(&event).await.unwrap();
        let sent = channel.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(RemoteEvent::decode(&sent[0]).unwrap(), event);
    }
}
