//! Energy-based speech activity detection with debounce.
//!
//! The detector is advisory: it classifies frames for UI hints and local
//! barge-in, but never decides whether a frame is sent. Every captured frame
//! is still encoded and streamed regardless of the reported state.

use std::time::{Duration, Instant};

/// Default RMS threshold in normalized amplitude.
pub const DEFAULT_ACTIVITY_THRESHOLD: f32 = 0.015;

/// Default quiet period before activity is reported as ended.
pub const DEFAULT_SILENCE_DEBOUNCE: Duration = Duration::from_millis(2500);

/// Time source for the detector, swappable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Detector tuning.
#[derive(Debug, Clone, Copy)]
pub struct ActivityConfig {
    /// Frames with RMS strictly above this count as activity.
    pub threshold: f32,
    /// How long no frame may exceed the threshold before reporting silence.
    pub debounce: Duration,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_ACTIVITY_THRESHOLD,
            debounce: DEFAULT_SILENCE_DEBOUNCE,
        }
    }
}

/// Result of feeding one frame to the detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityUpdate {
    /// Debounced activity state after this frame.
    pub active: bool,
    /// RMS energy of the frame.
    pub rms: f32,
    /// The state flipped from silent to active on this frame.
    pub became_active: bool,
    /// The state flipped from active to silent on this frame.
    pub became_silent: bool,
}

/// Root-mean-square energy of a frame. Empty frames have zero energy.
pub fn rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f64 = frame.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / frame.len() as f64).sqrt() as f32
}

pub struct ActivityDetector<C: Clock = SystemClock> {
    config: ActivityConfig,
    last_active: Option<Instant>,
    active: bool,
    clock: C,
}

impl ActivityDetector<SystemClock> {
    pub fn new(config: ActivityConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> ActivityDetector<C> {
    pub fn with_clock(config: ActivityConfig, clock: C) -> Self {
        Self {
            config,
            last_active: None,
            active: false,
            clock,
        }
    }

    /// Classify one captured frame.
    pub fn update(&mut self, frame: &[f32]) -> ActivityUpdate {
        let now = self.clock.now();
        let level = rms(frame);

        if level > self.config.threshold {
            self.last_active = Some(now);
        }

        let was_active = self.active;
        self.active = match self.last_active {
            Some(at) => now.saturating_duration_since(at) < self.config.debounce,
            None => false,
        };

        ActivityUpdate {
            active: self.active,
            rms: level,
            became_active: self.active && !was_active,
            became_silent: was_active && !self.active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Forget any previous activity.
    pub fn reset(&mut self) {
        self.last_active = None;
        self.active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone)]
    struct ManualClock {
        now: Arc<parking_lot::Mutex<Instant>>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                now: Arc::new(parking_lot::Mutex::new(Instant::now())),
            }
        }

        fn advance(&self, by: Duration) {
            *self.now.lock() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock()
        }
    }

    fn tone(amplitude: f32) -> Vec<f32> {
        // Square wave: RMS equals the amplitude.
        (0..4096)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    #[test]
    fn rms_of_square_wave_is_amplitude() {
        assert!((rms(&tone(0.2)) - 0.2).abs() < 1e-5);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn loud_frames_activate_immediately_and_hold_through_debounce() {
        let clock = ManualClock::new();
        let mut detector = ActivityDetector::with_clock(ActivityConfig::default(), clock.clone());

        let first = detector.update(&tone(0.2));
        assert!(first.active);
        assert!(first.became_active);

        clock.advance(Duration::from_millis(10));
        let second = detector.update(&tone(0.2));
        assert!(second.active);
        assert!(!second.became_active);

        clock.advance(Duration::from_millis(2489));
        assert!(detector.update(&tone(0.0)).active);

        clock.advance(Duration::from_millis(11));
        let ended = detector.update(&tone(0.0));
        assert!(!ended.active);
        assert!(ended.became_silent);
    }

    #[test]
    fn single_quiet_frame_does_not_flip_state() {
        let clock = ManualClock::new();
        let mut detector = ActivityDetector::with_clock(ActivityConfig::default(), clock.clone());

        detector.update(&tone(0.2));
        clock.advance(Duration::from_millis(100));
        let quiet = detector.update(&tone(0.001));
        assert!(quiet.active);
        assert!(!quiet.became_silent);
    }

    #[test]
    fn quiet_input_never_activates() {
        let mut detector = ActivityDetector::with_clock(ActivityConfig::default(), ManualClock::new());
        let update = detector.update(&tone(0.01));
        assert!(!update.active);
        assert!(!update.became_active);
    }

    #[test]
    fn reset_clears_state() {
        let mut detector = ActivityDetector::with_clock(ActivityConfig::default(), ManualClock::new());
        detector.update(&tone(0.5));
        assert!(detector.is_active());
        detector.reset();
        assert!(!detector.is_active());
    }
}
