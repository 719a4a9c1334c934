//! Duplex real-time interpretation session core.
//!
//! A Speaker session captures audio, streams it to the interpretation engine
//! and publishes its transcript to the broadcast relay. A Listener session
//! never captures: it forwards relayed text for translate-and-speak and
//! plays the synthesized audio back without gaps.
//!
//! ## Design
//! - [`codec`] and [`activity`] are pure per-frame transforms
//! - [`live`] owns the engine channel; [`gemini_live`] speaks its wire protocol
//! - [`playback`] schedules decoded audio back to back on the output clock
//! - [`interrupt`] turns remote and local barge-in into scheduler flushes
//! - [`session`] composes everything into one start/stop lifecycle

pub mod activity;
pub mod capture;
pub mod codec;
#[cfg(feature = "cpal-audio")]
pub mod device;
pub mod gemini_live;
pub mod interrupt;
pub mod live;
pub mod pipeline;
pub mod playback;
pub mod role;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

// ── Shared voice event type ──────────────────────────────────────

/// Which transcript stream a piece of text belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptChannel {
    /// What was said (the Speaker's own words, or relayed source text).
    Input,
    /// The translation.
    Output,
}

/// Inbound event from the interpretation engine.
///
/// Engine connectors push these into the queue that the session
/// orchestrator drains; there are no free-standing callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    /// Engine setup completed.
    SetupComplete,
    /// Transcription text on one of the two channels.
    Transcript {
        channel: TranscriptChannel,
        text: String,
    },
    /// Synthesized audio chunk (PCM16, 24kHz mono).
    Audio { data: Vec<u8> },
    /// The engine finished a response turn.
    TurnComplete,
    /// The engine detected new speech and abandoned its current response.
    Interrupted,
    /// Error reported by the engine itself.
    Error { message: String },
    /// The connection to the engine failed mid-session.
    TransportError { message: String },
    /// The engine closed the channel.
    Closed,
}

pub use activity::{ActivityConfig, ActivityDetector, ActivityUpdate};
pub use capture::{Acquisition, AudioFrame, CaptureHandle, CaptureProvider, SourceKind};
pub use codec::DecodedBuffer;
pub use gemini_live::GeminiLiveConnector;
pub use live::{ConnectionState, EngineConnector, EngineLink, LiveEvents, LiveSession};
pub use pipeline::{CaptureRequest, LanguageCode, PlaybackPolicy, SessionConfig, TargetLanguage};
pub use playback::{AudioOutput, PlaybackHandle, PlaybackScheduler};
pub use role::Role;
pub use session::{SessionNotice, SessionOrchestrator, SessionState, TranscriptionEvent};
