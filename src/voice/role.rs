//! Participant role and the state machine that gates local capture.
//!
//! ```text
//! Idle ──begin()──▸ Configuring ──handshake_complete()──▸ Capturing  (Speaker)
//!   ▲                                               └──▸ Relaying   (Listener)
//!   └──────────────────────── reset() ◂──────────────────────────┘
//! ```
//!
//! Opening a capture source needs a [`CaptureGate`], and the only way to get
//! one is the `Capturing` transition. A Listener session never holds a gate,
//! so the capture path cannot be reached from it at all.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Which side of the interpretation a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Produces source audio.
    #[default]
    Speaker,
    /// Receives relayed text and plays synthesized speech.
    Listener,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Speaker => "speaker",
            Self::Listener => "listener",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    Idle,
    Configuring,
    Capturing,
    Relaying,
}

/// Capability to open local capture sources. Minted only for Speakers.
#[derive(Debug)]
pub struct CaptureGate {
    _private: (),
}

/// Capability to subscribe to the broadcast relay. Minted only for Listeners.
#[derive(Debug)]
pub struct RelayGate {
    _private: (),
}

/// What a session may do once the remote handshake has completed.
#[derive(Debug)]
pub enum SessionMode {
    Capturing(CaptureGate),
    Relaying(RelayGate),
}

#[derive(Debug)]
pub struct RoleMachine {
    role: Role,
    state: RoleState,
}

impl RoleMachine {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: RoleState::Idle,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> RoleState {
        self.state
    }

    /// Change role. Only allowed while idle.
    pub fn set_role(&mut self, role: Role) -> Result<()> {
        if self.state != RoleState::Idle {
            return Err(SessionError::RoleLocked {
                state: format!("{:?}", self.state).to_lowercase(),
            });
        }
        self.role = role;
        Ok(())
    }

    /// Enter `Configuring` at session start.
    pub fn begin(&mut self) -> Result<()> {
        if self.state != RoleState::Idle {
            return Err(SessionError::AlreadyActive);
        }
        self.state = RoleState::Configuring;
        Ok(())
    }

    /// The remote handshake completed; pick the capture or relay path.
    pub fn handshake_complete(&mut self) -> Result<SessionMode> {
        if self.state != RoleState::Configuring {
            return Err(SessionError::Cancelled);
        }
        match self.role {
            Role::Speaker => {
                self.state = RoleState::Capturing;
                Ok(SessionMode::Capturing(CaptureGate { _private: () }))
            }
            Role::Listener => {
                self.state = RoleState::Relaying;
                Ok(SessionMode::Relaying(RelayGate { _private: () }))
            }
        }
    }

    /// Back to `Idle` from any state.
    pub fn reset(&mut self) {
        self.state = RoleState::Idle;
    }
}
