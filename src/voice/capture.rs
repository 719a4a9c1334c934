//! Capture sources and the mixing graph that turns them into fixed-size frames.
//!
//! Every source is optional. Acquisition reports one [`Acquisition`] per
//! source and the graph only needs one of them to succeed; a declined
//! system-audio share still leaves a working microphone session.

use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::mpsc;

use super::pipeline::CaptureRequest;
use super::role::CaptureGate;
use crate::error::{Result, SessionError};

/// Samples per captured frame.
pub const FRAME_SIZE: usize = 4096;

/// A source may run this many frames ahead of a silent peer before the
/// peer is treated as contributing silence.
const MAX_LAG_FRAMES: usize = 4;

/// Capacity of the shared source → mixer queue, in blocks.
const BLOCK_QUEUE_CAPACITY: usize = 256;

/// A fixed-size block of mono samples at the capture rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Microphone,
    /// Loopback / shared system audio.
    SystemAudio,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Microphone => "microphone",
            Self::SystemAudio => "system_audio",
        }
    }
}

/// A running capture source. Dropping it without `stop()` is a leak the
/// graph never does.
pub trait CaptureHandle: Send {
    fn kind(&self) -> SourceKind;
    fn stop(&mut self);
}

/// Outcome of asking the platform for one capture source.
pub enum Acquisition {
    Acquired(Box<dyn CaptureHandle>),
    /// The user or the platform refused (permission prompt declined, device busy).
    Declined(String),
    /// The platform has no such source.
    Unsupported,
}

impl std::fmt::Debug for Acquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Acquired(handle) => write!(f, "Acquired({})", handle.kind().as_str()),
            Self::Declined(reason) => write!(f, "Declined({reason})"),
            Self::Unsupported => f.write_str("Unsupported"),
        }
    }
}

/// Block of raw samples from one source.
#[derive(Debug)]
pub struct SourceBlock {
    pub source: usize,
    pub samples: Vec<f32>,
}

/// Where a source's capture callback delivers samples.
///
/// `push` never blocks, so it is safe to call from a real-time audio
/// callback. Blocks are dropped if the session falls behind.
#[derive(Clone)]
pub struct SampleSink {
    source: usize,
    tx: mpsc::Sender<SourceBlock>,
}

impl SampleSink {
    /// Returns `false` if the block was dropped.
    pub fn push(&self, samples: Vec<f32>) -> bool {
        if samples.is_empty() {
            return true;
        }
        self.tx
            .try_send(SourceBlock {
                source: self.source,
                samples,
            })
            .is_ok()
    }
}

/// Platform capture backend.
#[async_trait]
pub trait CaptureProvider: Send + Sync {
    /// Ask for one source delivering mono samples at `sample_rate`.
    ///
    /// May suspend while a permission prompt is open.
    async fn acquire(&self, kind: SourceKind, sample_rate: u32, sink: SampleSink) -> Acquisition;
}

// ── Mixer ────────────────────────────────────────────────────────

/// Sums per-source sample queues into fixed-size mono frames.
pub struct FrameMixer {
    frame_size: usize,
    queues: Vec<VecDeque<f32>>,
    live: Vec<bool>,
}

impl FrameMixer {
    pub fn new(frame_size: usize, sources: usize) -> Self {
        Self {
            frame_size: frame_size.max(1),
            queues: vec![VecDeque::new(); sources],
            live: vec![true; sources],
        }
    }

    /// Stop waiting for a source that will never deliver.
    pub fn retire(&mut self, source: usize) {
        if let Some(live) = self.live.get_mut(source) {
            *live = false;
        }
        if let Some(queue) = self.queues.get_mut(source) {
            queue.clear();
        }
    }

    pub fn push(&mut self, source: usize, samples: &[f32]) {
        if !self.live.get(source).copied().unwrap_or(false) {
            return;
        }
        self.queues[source].extend(samples.iter().copied());
    }

    /// Next mixed frame, if every live source has contributed enough.
    pub fn pop_frame(&mut self) -> Option<Vec<f32>> {
        let live: Vec<usize> = (0..self.queues.len()).filter(|&i| self.live[i]).collect();
        if live.is_empty() {
            return None;
        }

        let all_ready = live
            .iter()
            .all(|&i| self.queues[i].len() >= self.frame_size);
        let one_overrun = live
            .iter()
            .any(|&i| self.queues[i].len() >= self.frame_size * MAX_LAG_FRAMES);
        if !all_ready && !one_overrun {
            return None;
        }

        let mut frame = vec![0.0f32; self.frame_size];
        for &i in &live {
            let queue = &mut self.queues[i];
            for slot in frame.iter_mut() {
                match queue.pop_front() {
                    Some(sample) => *slot += sample,
                    None => break,
                }
            }
        }
        if live.len() > 1 {
            for sample in &mut frame {
                *sample = sample.clamp(-1.0, 1.0);
            }
        }
        Some(frame)
    }
}

// ── Capture graph ────────────────────────────────────────────────

/// The running capture sources of a Speaker session.
pub struct CaptureGraph {
    handles: Vec<Box<dyn CaptureHandle>>,
}

/// Mixed frames coming out of a [`CaptureGraph`], in capture order.
pub struct FrameStream {
    blocks: mpsc::Receiver<SourceBlock>,
    mixer: FrameMixer,
    sample_rate: u32,
    pending: VecDeque<Vec<f32>>,
}

impl CaptureGraph {
    /// Acquire every requested source and wire them into one mixer.
    ///
    /// Fails with [`SessionError::PermissionDenied`] only when no source at
    /// all could be acquired.
    pub async fn open(
        _gate: &CaptureGate,
        provider: &dyn CaptureProvider,
        request: CaptureRequest,
        sample_rate: u32,
    ) -> Result<(Self, FrameStream)> {
        let mut kinds = Vec::new();
        if request.microphone {
            kinds.push(SourceKind::Microphone);
        }
        if request.system_audio {
            kinds.push(SourceKind::SystemAudio);
        }
        if kinds.is_empty() {
            return Err(SessionError::PermissionDenied {
                message: "no capture source requested".into(),
            });
        }

        let (tx, blocks) = mpsc::channel(BLOCK_QUEUE_CAPACITY);
        let mut mixer = FrameMixer::new(FRAME_SIZE, kinds.len());
        // Owns every acquired source from the start so an abandoned open
        // (cancelled mid-prompt) still stops them on drop.
        let mut graph = Self { handles: Vec::new() };
        let mut refusals = Vec::new();

        for (index, kind) in kinds.iter().copied().enumerate() {
            let sink = SampleSink {
                source: index,
                tx: tx.clone(),
            };
            match provider.acquire(kind, sample_rate, sink).await {
                Acquisition::Acquired(handle) => {
                    tracing::info!(source = kind.as_str(), "Capture source acquired");
                    graph.handles.push(handle);
                }
                Acquisition::Declined(reason) => {
                    tracing::warn!(source = kind.as_str(), reason = %reason, "Capture source declined");
                    mixer.retire(index);
                    refusals.push(format!("{}: {reason}", kind.as_str()));
                }
                Acquisition::Unsupported => {
                    tracing::warn!(source = kind.as_str(), "Capture source unsupported");
                    mixer.retire(index);
                    refusals.push(format!("{}: unsupported", kind.as_str()));
                }
            }
        }

        if graph.handles.is_empty() {
            return Err(SessionError::PermissionDenied {
                message: refusals.join("; "),
            });
        }

        Ok((
            graph,
            FrameStream {
                blocks,
                mixer,
                sample_rate,
                pending: VecDeque::new(),
            },
        ))
    }

    pub fn sources(&self) -> Vec<SourceKind> {
        self.handles.iter().map(|h| h.kind()).collect()
    }

    /// Stop and release every source.
    pub fn stop_all(&mut self) {
        for mut handle in self.handles.drain(..) {
            handle.stop();
            tracing::debug!(source = handle.kind().as_str(), "Capture source stopped");
        }
    }
}

impl Drop for CaptureGraph {
    fn drop(&mut self) {
        self.stop_all();
    }
}

impl FrameStream {
    /// Next mixed frame, or `None` once every source has gone away.
    pub async fn next_frame(&mut self) -> Option<AudioFrame> {
        loop {
            if let Some(samples) = self.pending.pop_front() {
                return Some(AudioFrame {
                    samples,
                    sample_rate: self.sample_rate,
                });
            }
            let block = self.blocks.recv().await?;
            self.mixer.push(block.source, &block.samples);
            while let Some(frame) = self.mixer.pop_frame() {
                self.pending.push_back(frame);
            }
        }
    }
}
