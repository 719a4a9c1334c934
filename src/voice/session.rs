//! Session orchestrator: one start/stop lifecycle over every voice component.
//!
//! ```text
//! Idle ──start()──▸ Connecting ──handshake ok──▸ Active ──stop() / engine error──▸ Idle
//!                       └──── handshake failed / stop() ────────────────────────▸ Idle
//! ```
//!
//! All mutable session state sits in one [`SessionContext`] behind a single
//! lock that is never held across an await. Engine events, capture frames
//! and relayed texts are each pumped by one task; every pump carries the
//! generation it was started for and becomes a no-op once that generation
//! has been torn down.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::activity::{ActivityConfig, ActivityDetector};
use super::capture::{CaptureGraph, CaptureProvider, FrameStream};
use super::codec;
use super::interrupt::InterruptionController;
use super::live::{EngineConnector, LiveEvents, LiveSession};
use super::pipeline::SessionConfig;
use super::playback::{AudioOutput, PlaybackScheduler};
use super::role::{CaptureGate, RelayGate, Role, RoleMachine, SessionMode};
use super::{TranscriptChannel, VoiceEvent};
use crate::error::{Result, SessionError};
use crate::relay::{BroadcastRelay, RelaySubscription};

/// Capacity of the notice broadcast.
const NOTICE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Handshake in flight.
    Connecting,
    Active,
    Terminating,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Terminating => "terminating",
        }
    }
}

/// One line of the session transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionEvent {
    pub text: String,
    pub channel: TranscriptChannel,
    /// Monotonic time since the session started.
    pub at: Duration,
}

/// Broadcast to UI observers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    StateChanged(SessionState),
    Transcript(TranscriptionEvent),
    /// Local speech activity flipped.
    Activity { active: bool },
    /// The session is back to idle. `cause` is set when it did not end by `stop()`.
    Ended { cause: Option<String> },
}

// ── Process-wide slot ────────────────────────────────────────────

/// Held by whichever orchestrator has a non-idle session. Capture devices
/// and the output clock are process-wide, so only one session may run.
pub(crate) struct SessionSlot(AtomicBool);

impl SessionSlot {
    pub(crate) const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    fn claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.0.store(false, Ordering::Release);
    }
}

static PROCESS_SLOT: SessionSlot = SessionSlot::new();

// ── Shared state ─────────────────────────────────────────────────

/// Everything a running session mutates.
struct SessionContext {
    role: Role,
    config: SessionConfig,
    live: LiveSession,
    scheduler: PlaybackScheduler,
    detector: ActivityDetector,
    controller: InterruptionController,
    capture: Option<CaptureGraph>,
    /// Speaker only: ordered queue of input transcripts for the relay.
    publisher: Option<mpsc::UnboundedSender<String>>,
}

impl SessionContext {
    fn play(&mut self, data: &[u8]) {
        if self.role == Role::Speaker && !self.config.policy.speaker_hears_translation {
            tracing::trace!(bytes = data.len(), "Speaker self-monitoring off, dropping audio");
            return;
        }
        match codec::decode(data, self.config.output_sample_rate, 1) {
            Ok(buffer) => {
                self.scheduler.enqueue(&buffer);
            }
            Err(e) => tracing::warn!(error = %e, "Dropping undecodable audio chunk"),
        }
    }
}

struct Inner {
    state: SessionState,
    role: RoleMachine,
    /// Bumped at every start and every teardown.
    generation: u64,
    session_id: Option<String>,
    started_at: Option<Instant>,
    cancel: Option<CancellationToken>,
    transcripts: Vec<TranscriptionEvent>,
    ctx: Option<SessionContext>,
}

struct Shared {
    inner: Mutex<Inner>,
    notices: broadcast::Sender<SessionNotice>,
    slot: &'static SessionSlot,
}

impl Shared {
    fn notify(&self, notice: SessionNotice) {
        let _ = self.notices.send(notice);
    }

    /// Run `f` on the live context of `generation`, if it is still current.
    fn with_context<R>(&self, generation: u64, f: impl FnOnce(&mut SessionContext) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return None;
        }
        inner.ctx.as_mut().map(f)
    }

    fn record(&self, generation: u64, channel: TranscriptChannel, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let event = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            let at = inner.started_at.map(|t| t.elapsed()).unwrap_or_default();
            let event = TranscriptionEvent {
                text: text.to_string(),
                channel,
                at,
            };
            inner.transcripts.push(event.clone());
            event
        };
        self.notify(SessionNotice::Transcript(event));
    }

    /// Release everything and return to `Idle`.
    ///
    /// With `Some(generation)` only that session is torn down. Returns
    /// `false` if there was nothing to stop.
    fn teardown(&self, generation: Option<u64>, cause: Option<String>) -> bool {
        let session_id = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Idle {
                return false;
            }
            if generation.is_some_and(|g| g != inner.generation) {
                return false;
            }
            inner.state = SessionState::Terminating;
            inner.generation += 1;
            if let Some(token) = inner.cancel.take() {
                token.cancel();
            }
            if let Some(mut ctx) = inner.ctx.take() {
                ctx.live.close();
                ctx.scheduler.flush_all();
                if let Some(mut graph) = ctx.capture.take() {
                    graph.stop_all();
                }
            }
            inner.role.reset();
            inner.state = SessionState::Idle;
            self.slot.release();
            inner.session_id.clone().unwrap_or_default()
        };

        match &cause {
            Some(cause) => tracing::warn!(session_id = %session_id, cause = %cause, "Interpretation session ended"),
            None => tracing::info!(session_id = %session_id, "Interpretation session stopped"),
        }
        self.notify(SessionNotice::StateChanged(SessionState::Terminating));
        self.notify(SessionNotice::StateChanged(SessionState::Idle));
        self.notify(SessionNotice::Ended { cause });
        true
    }
}

// ── Orchestrator ─────────────────────────────────────────────────

/// Owns the audio devices and at most one interpretation session at a time.
pub struct SessionOrchestrator {
    connector: Arc<dyn EngineConnector>,
    capture: Arc<dyn CaptureProvider>,
    output: Arc<dyn AudioOutput>,
    relay: Arc<dyn BroadcastRelay>,
    activity: ActivityConfig,
    shared: Arc<Shared>,
}

impl SessionOrchestrator {
    pub fn new(
        connector: Arc<dyn EngineConnector>,
        capture: Arc<dyn CaptureProvider>,
        output: Arc<dyn AudioOutput>,
        relay: Arc<dyn BroadcastRelay>,
    ) -> Self {
        Self::with_slot(connector, capture, output, relay, &PROCESS_SLOT)
    }

    pub(crate) fn with_slot(
        connector: Arc<dyn EngineConnector>,
        capture: Arc<dyn CaptureProvider>,
        output: Arc<dyn AudioOutput>,
        relay: Arc<dyn BroadcastRelay>,
        slot: &'static SessionSlot,
    ) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            connector,
            capture,
            output,
            relay,
            activity: ActivityConfig::default(),
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: SessionState::Idle,
                    role: RoleMachine::new(Role::Speaker),
                    generation: 0,
                    session_id: None,
                    started_at: None,
                    cancel: None,
                    transcripts: Vec::new(),
                    ctx: None,
                }),
                notices,
                slot,
            }),
        }
    }

    pub fn with_activity(mut self, activity: ActivityConfig) -> Self {
        self.activity = activity;
        self
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    pub fn role(&self) -> Role {
        self.shared.inner.lock().role.role()
    }

    /// Id of the current or most recent session.
    pub fn session_id(&self) -> Option<String> {
        self.shared.inner.lock().session_id.clone()
    }

    /// Transcript of the current or most recent session.
    pub fn transcripts(&self) -> Vec<TranscriptionEvent> {
        self.shared.inner.lock().transcripts.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.shared.notices.subscribe()
    }

    /// Start a session. Returns once the session is fully active.
    ///
    /// Any error is reported after the session has been torn down again.
    pub async fn start(&self, role: Role, config: SessionConfig) -> Result<()> {
        config.validate()?;

        let (generation, token, session_id) = {
            let mut inner = self.shared.inner.lock();
            if inner.state != SessionState::Idle {
                return Err(SessionError::AlreadyActive);
            }
            if !self.shared.slot.claim() {
                tracing::warn!(role = %role, "Another interpretation session is running in this process");
                return Err(SessionError::AlreadyActive);
            }
            if let Err(e) = inner.role.set_role(role).and_then(|()| inner.role.begin()) {
                inner.role.reset();
                self.shared.slot.release();
                return Err(e);
            }
            inner.generation += 1;
            let token = CancellationToken::new();
            let session_id = uuid::Uuid::new_v4().to_string();
            inner.cancel = Some(token.clone());
            inner.session_id = Some(session_id.clone());
            inner.started_at = Some(Instant::now());
            inner.transcripts.clear();
            inner.state = SessionState::Connecting;
            (inner.generation, token, session_id)
        };

        tracing::info!(
            session_id = %session_id,
            role = %role,
            target = config.target_language.as_str(),
            voice = %config.voice_id,
            "Starting interpretation session"
        );
        self.shared.notify(SessionNotice::StateChanged(SessionState::Connecting));

        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => Err(SessionError::Cancelled),
            result = LiveSession::open(&*self.connector, &session_id, &config) => result,
        };
        let (live, events) = match opened {
            Ok(opened) => opened,
            Err(e) => return Err(self.fail(generation, e)),
        };

        let mode = match self.activate(generation, role, &config, &live) {
            Ok(mode) => mode,
            Err(e) => {
                live.close();
                return Err(self.fail(generation, e));
            }
        };
        self.shared.notify(SessionNotice::StateChanged(SessionState::Active));

        tokio::spawn(pump_events(
            Arc::clone(&self.shared),
            events,
            token.clone(),
            generation,
        ));

        let attached = match mode {
            SessionMode::Capturing(gate) => self.attach_capture(&gate, &config, &token, generation).await,
            SessionMode::Relaying(gate) => self.attach_relay(&gate, &token, generation).await,
        };
        if let Err(e) = attached {
            return Err(self.fail(generation, e));
        }

        tracing::info!(session_id = %session_id, role = %role, "Interpretation session active");
        Ok(())
    }

    /// Stop the session. Safe to call in any state, any number of times.
    pub fn stop(&self) {
        self.shared.teardown(None, None);
    }

    /// Tear down `generation` because of `error`, unless `stop()` got there first.
    fn fail(&self, generation: u64, error: SessionError) -> SessionError {
        if error == SessionError::Cancelled {
            return error;
        }
        if self.shared.teardown(Some(generation), Some(error.to_string())) {
            error
        } else {
            SessionError::Cancelled
        }
    }

    /// Install the session context after a successful handshake.
    fn activate(
        &self,
        generation: u64,
        role: Role,
        config: &SessionConfig,
        live: &LiveSession,
    ) -> Result<SessionMode> {
        let mut inner = self.shared.inner.lock();
        if inner.generation != generation {
            return Err(SessionError::Cancelled);
        }
        let mode = inner.role.handshake_complete()?;

        let (publisher, published) = match role {
            Role::Speaker => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            }
            Role::Listener => (None, None),
        };
        if let Some(rx) = published {
            tokio::spawn(publish_transcripts(Arc::clone(&self.relay), rx));
        }

        inner.ctx = Some(SessionContext {
            role,
            config: config.clone(),
            live: live.clone(),
            scheduler: PlaybackScheduler::new(Arc::clone(&self.output)).with_pan(config.policy.output_pan),
            detector: ActivityDetector::new(self.activity),
            controller: InterruptionController::new(role, &config.policy),
            capture: None,
            publisher,
        });
        inner.state = SessionState::Active;
        Ok(mode)
    }

    async fn attach_capture(
        &self,
        gate: &CaptureGate,
        config: &SessionConfig,
        token: &CancellationToken,
        generation: u64,
    ) -> Result<()> {
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => Err(SessionError::Cancelled),
            result = CaptureGraph::open(gate, &*self.capture, config.capture, config.input_sample_rate) => result,
        };
        let (graph, frames) = opened?;

        // If the session went away meanwhile the closure is dropped
        // unused and the graph stops itself.
        self.shared
            .with_context(generation, move |ctx| ctx.capture = Some(graph))
            .ok_or(SessionError::Cancelled)?;

        tokio::spawn(pump_frames(
            Arc::clone(&self.shared),
            frames,
            token.clone(),
            generation,
        ));
        Ok(())
    }

    async fn attach_relay(&self, _gate: &RelayGate, token: &CancellationToken, generation: u64) -> Result<()> {
        let subscribed = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(SessionError::Cancelled),
            result = self.relay.subscribe() => result,
        };
        let subscription = subscribed.map_err(|e| SessionError::Relay {
            message: format!("{e:#}"),
        })?;

        self.shared
            .with_context(generation, |_| ())
            .ok_or(SessionError::Cancelled)?;

        tokio::spawn(pump_relay(
            Arc::clone(&self.shared),
            subscription,
            token.clone(),
            generation,
        ));
        Ok(())
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        self.shared.teardown(None, None);
    }
}

// ── Pumps ────────────────────────────────────────────────────────

async fn pump_events(shared: Arc<Shared>, mut events: LiveEvents, token: CancellationToken, generation: u64) {
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };

        match event {
            VoiceEvent::Transcript { channel, text } => {
                shared.record(generation, channel, &text);
                if channel == TranscriptChannel::Input {
                    shared.with_context(generation, |ctx| {
                        if let Some(publisher) = &ctx.publisher {
                            let _ = publisher.send(text);
                        }
                    });
                }
            }
            VoiceEvent::Audio { data } => {
                shared.with_context(generation, |ctx| ctx.play(&data));
            }
            VoiceEvent::Interrupted => {
                shared.with_context(generation, |ctx| ctx.controller.on_remote_interrupt(&mut ctx.scheduler));
            }
            VoiceEvent::TurnComplete | VoiceEvent::SetupComplete => {}
            VoiceEvent::Error { message } => {
                shared.teardown(Some(generation), Some(format!("Interpretation engine error: {message}")));
                break;
            }
            VoiceEvent::TransportError { message } => {
                shared.teardown(Some(generation), Some(SessionError::Transport { message }.to_string()));
                break;
            }
            VoiceEvent::Closed => {
                shared.teardown(Some(generation), Some("Interpretation engine closed the session".into()));
                break;
            }
        }
    }
    tracing::debug!(generation, "Engine event pump finished");
}

async fn pump_frames(shared: Arc<Shared>, mut frames: FrameStream, token: CancellationToken, generation: u64) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            frame = frames.next_frame() => frame,
        };
        let Some(frame) = frame else { break };

        let edge = shared.with_context(generation, |ctx| {
            let update = ctx.detector.update(&frame.samples);
            ctx.controller.on_activity(&update, &mut ctx.scheduler);
            ctx.live.send_audio(codec::encode(&frame.samples));
            (update.became_active || update.became_silent).then_some(update.active)
        });
        match edge {
            None => break,
            Some(Some(active)) => shared.notify(SessionNotice::Activity { active }),
            Some(None) => {}
        }
    }
    tracing::debug!(generation, "Capture pump finished");
}

async fn pump_relay(
    shared: Arc<Shared>,
    mut subscription: RelaySubscription,
    token: CancellationToken,
    generation: u64,
) {
    loop {
        let text = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            text = subscription.recv() => text,
        };
        let Some(text) = text else { break };

        if shared.with_context(generation, |ctx| ctx.live.send_text(&text)).is_none() {
            break;
        }
        shared.record(generation, TranscriptChannel::Input, &text);
    }
    tracing::debug!(generation, "Relay pump finished");
}

/// Publishes a Speaker's input transcripts in order until the session drops its sender.
async fn publish_transcripts(relay: Arc<dyn BroadcastRelay>, mut texts: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = texts.recv().await {
        if let Err(e) = relay.publish(&text).await {
            tracing::warn!(error = %e, "Relay publish failed");
        }
    }
}
