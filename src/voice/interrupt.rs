//! Barge-in handling: turns interruption triggers into playback flushes.
//!
//! Two triggers exist. The engine reports that it abandoned its current
//! response (remote), or the local Speaker starts talking again while
//! translated audio is still queued (local, optional). Both end in exactly
//! one [`PlaybackScheduler::flush_all`].

use super::activity::ActivityUpdate;
use super::pipeline::PlaybackPolicy;
use super::playback::PlaybackScheduler;
use super::role::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptTrigger {
    Remote,
    LocalSpeech,
}

impl InterruptTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::LocalSpeech => "local_speech",
        }
    }
}

#[derive(Debug)]
pub struct InterruptionController {
    local_barge_in: bool,
    interruptions: u64,
}

impl InterruptionController {
    pub fn new(role: Role, policy: &PlaybackPolicy) -> Self {
        Self {
            // Listeners never capture, so they have no local speech to react to.
            local_barge_in: role == Role::Speaker && policy.local_barge_in,
            interruptions: 0,
        }
    }

    /// The engine reported an interruption. Returns the number of items flushed.
    pub fn on_remote_interrupt(&mut self, scheduler: &mut PlaybackScheduler) -> usize {
        self.flush(InterruptTrigger::Remote, scheduler)
    }

    /// Feed the detector result for a local frame.
    ///
    /// Flushes on the silent → active edge when local barge-in is enabled.
    /// Returns `None` if this update did not trigger.
    pub fn on_activity(
        &mut self,
        update: &ActivityUpdate,
        scheduler: &mut PlaybackScheduler,
    ) -> Option<usize> {
        if !self.local_barge_in || !update.became_active {
            return None;
        }
        Some(self.flush(InterruptTrigger::LocalSpeech, scheduler))
    }

    fn flush(&mut self, trigger: InterruptTrigger, scheduler: &mut PlaybackScheduler) -> usize {
        self.interruptions += 1;
        let flushed = scheduler.flush_all();
        tracing::debug!(trigger = trigger.as_str(), flushed, "Playback interrupted");
        flushed
    }

    pub fn local_barge_in(&self) -> bool {
        self.local_barge_in
    }

    /// Triggers handled so far.
    pub fn interruptions(&self) -> u64 {
        self.interruptions
    }
}
