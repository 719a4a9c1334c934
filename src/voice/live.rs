//! Streaming session adapter: the duplex channel to the interpretation engine.
//!
//! ```text
//! Closed ──open()──▸ Opening ──handshake ok──▸ Open ──close()──▸ Closing ──▸ Closed
//!                       └──handshake failed──▸ Closed ◂── remote close / transport error
//! ```
//!
//! Outbound audio and text go through one queue drained by a single writer
//! task, so concurrent callers can never interleave partial frames. Sends
//! outside `Open` are dropped without error: a send racing a teardown must
//! not resurrect the session.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::pipeline::SessionConfig;
use super::VoiceEvent;
use crate::error::{Result, SessionError};

/// State of the engine channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// Outbound message for the engine writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Raw PCM16 audio at the input sample rate.
    Audio(Vec<u8>),
    /// Text to translate and speak.
    Text(String),
    /// No more audio will follow.
    AudioStreamEnd,
    /// Close the connection.
    Close,
}

/// The two queue ends produced by a successful engine handshake.
pub struct EngineLink {
    pub outbound: mpsc::UnboundedSender<OutboundMessage>,
    pub events: mpsc::Receiver<VoiceEvent>,
}

/// Transport that can perform the engine handshake.
///
/// Implementations must not leave anything running when they return an
/// error, and must not spawn their I/O tasks before the handshake succeeds.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(&self, session_id: &str, config: &SessionConfig) -> Result<EngineLink>;
}

/// Handle for pushing content into an open engine session.
#[derive(Clone)]
pub struct LiveSession {
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    state: Arc<Mutex<ConnectionState>>,
    session_id: Arc<str>,
}

/// Receiving half of an engine session, drained by the orchestrator.
pub struct LiveEvents {
    events: mpsc::Receiver<VoiceEvent>,
    state: Arc<Mutex<ConnectionState>>,
    finished: bool,
}

impl LiveSession {
    /// Perform the handshake and return the send handle plus the event queue.
    ///
    /// On failure nothing stays registered and the error is always
    /// [`SessionError::HandshakeFailure`].
    pub async fn open(
        connector: &dyn EngineConnector,
        session_id: &str,
        config: &SessionConfig,
    ) -> Result<(Self, LiveEvents)> {
        let state = Arc::new(Mutex::new(ConnectionState::Opening));
        tracing::debug!(session_id = %session_id, "Opening engine session");

        let link = match connector.connect(session_id, config).await {
            Ok(link) => link,
            Err(e) => {
                *state.lock() = ConnectionState::Closed;
                let message = match e {
                    SessionError::HandshakeFailure { message } => message,
                    other => other.to_string(),
                };
                tracing::warn!(session_id = %session_id, error = %message, "Engine handshake failed");
                return Err(SessionError::HandshakeFailure { message });
            }
        };

        *state.lock() = ConnectionState::Open;
        tracing::info!(session_id = %session_id, "Engine session open");

        Ok((
            Self {
                outbound: link.outbound,
                state: Arc::clone(&state),
                session_id: Arc::from(session_id),
            },
            LiveEvents {
                events: link.events,
                state,
                finished: false,
            },
        ))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Queue one encoded chunk. Never blocks; dropped unless `Open`.
    pub fn send_audio(&self, pcm: Vec<u8>) {
        if pcm.is_empty() {
            return;
        }
        self.push(OutboundMessage::Audio(pcm));
    }

    /// Queue text for translate-and-speak. Never blocks; dropped unless `Open`.
    pub fn send_text(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        self.push(OutboundMessage::Text(text.to_string()));
    }

    fn push(&self, message: OutboundMessage) {
        // Hold the state lock so a concurrent close() cannot slip in between
        // the state check and the enqueue.
        let state = self.state.lock();
        if *state != ConnectionState::Open {
            tracing::trace!(session_id = %self.session_id, state = ?*state, "Dropping send on non-open session");
            return;
        }
        if self.outbound.send(message).is_err() {
            tracing::debug!(session_id = %self.session_id, "Engine writer gone, dropping send");
        }
    }

    /// Close the channel. Closing a closed handle is a no-op.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Open {
                return;
            }
            *state = ConnectionState::Closing;
            let _ = self.outbound.send(OutboundMessage::AudioStreamEnd);
            let _ = self.outbound.send(OutboundMessage::Close);
            *state = ConnectionState::Closed;
        }
        tracing::info!(session_id = %self.session_id, "Engine session closed");
    }
}

impl LiveEvents {
    /// Next inbound event.
    ///
    /// A dropped transport surfaces once as [`VoiceEvent::Closed`]; after
    /// `Closed` or `Error` the adapter is in the `Closed` state.
    pub async fn recv(&mut self) -> Option<VoiceEvent> {
        if self.finished {
            return None;
        }
        let event = self.events.recv().await.unwrap_or(VoiceEvent::Closed);
        if matches!(
            event,
            VoiceEvent::Closed | VoiceEvent::Error { .. } | VoiceEvent::TransportError { .. }
        ) {
            *self.state.lock() = ConnectionState::Closed;
            self.finished = true;
        }
        Some(event)
    }
}
