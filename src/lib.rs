//! Duplex real-time speech interpretation.
//!
//! A [`voice::SessionOrchestrator`] runs one interpretation session at a
//! time, either as a Speaker (captures audio, streams it to Gemini Live and
//! publishes its transcript) or as a Listener (receives relayed text and
//! plays the translated speech).

pub mod config;
pub mod error;
pub mod relay;
pub mod voice;

pub use config::Config;
pub use error::{Result, SessionError};
