//! Gap-free playback of synthesized audio on the output clock.
//!
//! Each decoded chunk starts at `max(now, last_end)`: back to back with the
//! previous chunk while the stream keeps up, and never in the past when it
//! falls behind. A flush stops everything, moves `last_end` to `now` and
//! opens a new epoch, so audio queued after an interruption can never pile
//! up into a burst of stale speech.

use std::collections::VecDeque;
use std::sync::Arc;

use super::codec::DecodedBuffer;

/// Audio output device with its own monotonic clock.
///
/// `start` schedules a buffer to begin at an absolute time on that clock and
/// returns an id that `stop` accepts. Stopping an unknown or finished id is
/// a no-op.
pub trait AudioOutput: Send + Sync {
    /// Seconds on the output clock.
    fn current_time(&self) -> f64;
    fn start(&self, buffer: &DecodedBuffer, at: f64, pan: f32) -> u64;
    fn stop(&self, id: u64);
}

/// A scheduled item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackHandle {
    pub id: u64,
    pub start: f64,
    pub end: f64,
    pub epoch: u64,
}

pub struct PlaybackScheduler {
    output: Arc<dyn AudioOutput>,
    pan: f32,
    last_end: f64,
    epoch: u64,
    active: VecDeque<PlaybackHandle>,
}

impl PlaybackScheduler {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        let now = output.current_time();
        Self {
            output,
            pan: 0.0,
            last_end: now,
            epoch: 0,
            active: VecDeque::new(),
        }
    }

    pub fn with_pan(mut self, pan: f32) -> Self {
        self.pan = pan.clamp(-1.0, 1.0);
        self
    }

    /// Schedule `buffer` right after everything already queued.
    ///
    /// Returns `None` for an empty buffer.
    pub fn enqueue(&mut self, buffer: &DecodedBuffer) -> Option<PlaybackHandle> {
        if buffer.is_empty() {
            return None;
        }
        let now = self.output.current_time();
        self.retire_elapsed(now);

        let start = now.max(self.last_end);
        let end = start + buffer.duration_secs();
        let id = self.output.start(buffer, start, self.pan);
        self.last_end = end;

        let handle = PlaybackHandle {
            id,
            start,
            end,
            epoch: self.epoch,
        };
        self.active.push_back(handle);
        tracing::trace!(id, start, end, epoch = self.epoch, "Playback scheduled");
        Some(handle)
    }

    /// Stop every active or pending item and start a new epoch.
    ///
    /// Returns how many items were stopped.
    pub fn flush_all(&mut self) -> usize {
        let stopped = self.active.len();
        for handle in self.active.drain(..) {
            self.output.stop(handle.id);
        }
        self.last_end = self.output.current_time();
        self.epoch += 1;
        if stopped > 0 {
            tracing::debug!(stopped, epoch = self.epoch, "Playback flushed");
        }
        stopped
    }

    fn retire_elapsed(&mut self, now: f64) {
        self.active.retain(|handle| handle.end > now);
    }

    /// Items that have not finished playing yet.
    pub fn pending(&mut self) -> usize {
        let now = self.output.current_time();
        self.retire_elapsed(now);
        self.active.len()
    }

    pub fn last_end(&self) -> f64 {
        self.last_end
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::testing::FakeOutput;

    const EPS: f64 = 1e-9;

    fn chunk(ms: u32) -> DecodedBuffer {
        let frames = (24_000 * ms / 1000) as usize;
        DecodedBuffer {
            sample_rate: 24_000,
            channels: vec![vec![0.1; frames]],
        }
    }

    #[test]
    fn three_chunks_play_back_to_back() {
        let output = FakeOutput::new();
        let mut scheduler = PlaybackScheduler::new(output.clone());

        let starts: Vec<f64> = (0..3)
            .map(|_| scheduler.enqueue(&chunk(500)).unwrap().start)
            .collect();

        assert!((starts[0] - 0.0).abs() < EPS);
        assert!((starts[1] - 0.5).abs() < EPS);
        assert!((starts[2] - 1.0).abs() < EPS);
        assert!((scheduler.last_end() - 1.5).abs() < EPS);
    }

    #[test]
    fn items_never_overlap_or_gap_while_stream_keeps_up() {
        let output = FakeOutput::new();
        let mut scheduler = PlaybackScheduler::new(output.clone());

        let mut previous: Option<PlaybackHandle> = None;
        for (i, ms) in [120, 40, 300, 80].into_iter().enumerate() {
            output.set_time(i as f64 * 0.01);
            let handle = scheduler.enqueue(&chunk(ms)).unwrap();
            if let Some(prev) = previous {
                assert!((handle.start - prev.end).abs() < EPS);
            }
            previous = Some(handle);
        }
    }

    #[test]
    fn late_chunk_starts_now_not_in_the_past() {
        let output = FakeOutput::new();
        let mut scheduler = PlaybackScheduler::new(output.clone());
        scheduler.enqueue(&chunk(500)).unwrap();

        output.set_time(2.0);
        let handle = scheduler.enqueue(&chunk(500)).unwrap();
        assert!((handle.start - 2.0).abs() < EPS);
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn flush_stops_everything_and_prevents_burst() {
        let output = FakeOutput::new();
        let mut scheduler = PlaybackScheduler::new(output.clone());
        let ids: Vec<u64> = (0..3)
            .map(|_| scheduler.enqueue(&chunk(500)).unwrap().id)
            .collect();

        output.set_time(0.2);
        assert_eq!(scheduler.flush_all(), 3);
        assert_eq!(output.stopped(), ids);
        assert_eq!(scheduler.epoch(), 1);

        let handle = scheduler.enqueue(&chunk(500)).unwrap();
        assert!((handle.start - 0.2).abs() < EPS);
        assert_eq!(handle.epoch, 1);
    }

    #[test]
    fn flushing_empty_queue_is_a_noop() {
        let output = FakeOutput::new();
        let mut scheduler = PlaybackScheduler::new(output.clone());
        assert_eq!(scheduler.flush_all(), 0);
        assert!(output.stopped().is_empty());
    }

    #[test]
    fn empty_buffer_is_not_scheduled() {
        let output = FakeOutput::new();
        let mut scheduler = PlaybackScheduler::new(output.clone());
        assert!(scheduler.enqueue(&DecodedBuffer::empty(24_000, 1)).is_none());
        assert!(output.started().is_empty());
    }

    #[test]
    fn pan_is_applied_to_every_item() {
        let output = FakeOutput::new();
        let mut scheduler = PlaybackScheduler::new(output.clone()).with_pan(-1.0);
        scheduler.enqueue(&chunk(100)).unwrap();
        scheduler.enqueue(&chunk(100)).unwrap();
        assert!(output.started().iter().all(|voice| voice.pan == -1.0));
    }
}
