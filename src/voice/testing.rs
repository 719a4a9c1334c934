//! In-memory engine, capture and output doubles shared by the voice tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

use super::capture::{Acquisition, CaptureHandle, CaptureProvider, SampleSink, SourceKind};
use super::codec::DecodedBuffer;
use super::live::{EngineConnector, EngineLink, OutboundMessage};
use super::pipeline::SessionConfig;
use super::playback::AudioOutput;
use super::VoiceEvent;
use crate::error::{Result, SessionError};

// ── Engine ───────────────────────────────────────────────────────

/// Scripted engine: records what the session sends, emits what the test says.
#[derive(Default)]
pub struct FakeEngine {
    failure: Option<String>,
    hold: Option<Arc<Notify>>,
    connects: AtomicUsize,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<OutboundMessage>>>,
    outbound_log: Mutex<Vec<OutboundMessage>>,
    events_tx: Mutex<Option<mpsc::Sender<VoiceEvent>>>,
    configs: Mutex<Vec<SessionConfig>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every handshake fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Handshakes wait until the returned `Notify` is signalled.
    pub fn held() -> (Self, Arc<Notify>) {
        let notify = Arc::new(Notify::new());
        (
            Self {
                hold: Some(Arc::clone(&notify)),
                ..Self::default()
            },
            notify,
        )
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_config(&self) -> Option<SessionConfig> {
        self.configs.lock().last().cloned()
    }

    /// Everything sent through the latest link so far, in order.
    pub fn outbound(&self) -> Vec<OutboundMessage> {
        let mut log = self.outbound_log.lock();
        if let Some(rx) = self.outbound_rx.lock().as_mut() {
            while let Ok(msg) = rx.try_recv() {
                log.push(msg);
            }
        }
        log.clone()
    }

    pub fn emit(&self, event: VoiceEvent) {
        if let Some(tx) = self.events_tx.lock().as_ref() {
            let _ = tx.try_send(event);
        }
    }

    /// Drop the engine side of the event queue.
    pub fn disconnect(&self) {
        self.events_tx.lock().take();
    }
}

#[async_trait]
impl EngineConnector for FakeEngine {
    async fn connect(&self, _session_id: &str, config: &SessionConfig) -> Result<EngineLink> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.configs.lock().push(config.clone());
        if let Some(hold) = &self.hold {
            hold.notified().await;
        }
        if let Some(message) = &self.failure {
            return Err(SessionError::HandshakeFailure {
                message: message.clone(),
            });
        }

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::channel(64);
        *self.outbound_rx.lock() = Some(outbound_rx);
        self.outbound_log.lock().clear();
        *self.events_tx.lock() = Some(events_tx);
        Ok(EngineLink { outbound, events })
    }
}

// ── Output ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct StartedVoice {
    pub id: u64,
    pub at: f64,
    pub duration: f64,
    pub pan: f32,
}

/// Output device with a hand-driven clock.
#[derive(Default)]
pub struct FakeOutput {
    now: Mutex<f64>,
    next_id: AtomicU64,
    started: Mutex<Vec<StartedVoice>>,
    stopped: Mutex<Vec<u64>>,
}

impl FakeOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_time(&self, seconds: f64) {
        *self.now.lock() = seconds;
    }

    pub fn started(&self) -> Vec<StartedVoice> {
        self.started.lock().clone()
    }

    pub fn stopped(&self) -> Vec<u64> {
        self.stopped.lock().clone()
    }
}

impl AudioOutput for FakeOutput {
    fn current_time(&self) -> f64 {
        *self.now.lock()
    }

    fn start(&self, buffer: &DecodedBuffer, at: f64, pan: f32) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.started.lock().push(StartedVoice {
            id,
            at,
            duration: buffer.duration_secs(),
            pan,
        });
        id
    }

    fn stop(&self, id: u64) {
        self.stopped.lock().push(id);
    }
}

// ── Capture ──────────────────────────────────────────────────────

#[derive(Default)]
struct CaptureState {
    sinks: HashMap<SourceKind, SampleSink>,
    running: usize,
}

/// Capture backend that acquires every source unless told otherwise.
#[derive(Default)]
pub struct FakeCapture {
    refusals: HashMap<SourceKind, Option<String>>,
    /// Sources whose permission prompt never answers.
    prompts: HashSet<SourceKind>,
    acquires: AtomicUsize,
    state: Arc<Mutex<CaptureState>>,
}

struct FakeHandle {
    kind: SourceKind,
    state: Arc<Mutex<CaptureState>>,
    stopped: bool,
}

impl CaptureHandle for FakeHandle {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let mut state = self.state.lock();
        state.running -= 1;
        state.sinks.remove(&self.kind);
    }
}

impl FakeCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decline(mut self, kind: SourceKind, reason: &str) -> Self {
        self.refusals.insert(kind, Some(reason.to_string()));
        self
    }

    pub fn unsupported(mut self, kind: SourceKind) -> Self {
        self.refusals.insert(kind, None);
        self
    }

    pub fn prompt_forever(mut self, kind: SourceKind) -> Self {
        self.prompts.insert(kind);
        self
    }

    /// Number of `acquire` calls, successful or not.
    pub fn acquire_count(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    /// Sources currently running.
    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    /// Deliver samples as if the device callback fired. Returns `false` if
    /// the source is not running or the block was dropped.
    pub fn push(&self, kind: SourceKind, samples: Vec<f32>) -> bool {
        let sink = self.state.lock().sinks.get(&kind).cloned();
        sink.map(|sink| sink.push(samples)).unwrap_or(false)
    }
}

#[async_trait]
impl CaptureProvider for FakeCapture {
    async fn acquire(&self, kind: SourceKind, _sample_rate: u32, sink: SampleSink) -> Acquisition {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        if self.prompts.contains(&kind) {
            return std::future::pending::<Acquisition>().await;
        }
        match self.refusals.get(&kind) {
            Some(Some(reason)) => Acquisition::Declined(reason.clone()),
            Some(None) => Acquisition::Unsupported,
            None => {
                let mut state = self.state.lock();
                state.sinks.insert(kind, sink);
                state.running += 1;
                Acquisition::Acquired(Box::new(FakeHandle {
                    kind,
                    state: Arc::clone(&self.state),
                    stopped: false,
                }))
            }
        }
    }
}
