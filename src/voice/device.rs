//! Native audio devices via CPAL: microphone capture and speaker output.
//!
//! Capture opens the default input device at its native format, downmixes
//! to mono and resamples to the requested rate before handing samples to
//! the session. Output runs one stream for the whole process and mixes
//! scheduled voices against a frame counter, which doubles as the output
//! clock.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use parking_lot::Mutex;
use std::sync::Arc;

use super::capture::{Acquisition, CaptureHandle, CaptureProvider, SampleSink, SourceKind};
use super::codec::DecodedBuffer;
use super::playback::AudioOutput;

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only touched by its owner (one capture handle or
/// the output), never shared between threads.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

// ── Sample conversion ────────────────────────────────────────────

/// Convert interleaved device samples to mono f32, reusing `out`.
pub fn downmix_into<T>(data: &[T], channels: usize, out: &mut Vec<f32>)
where
    T: Sample,
    f32: FromSample<T>,
{
    out.clear();
    if channels <= 1 {
        out.extend(data.iter().map(|&s| f32::from_sample(s)));
        return;
    }
    out.extend(data.chunks_exact(channels).map(|frame| {
        frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() / channels as f32
    }));
}

/// Linear-interpolation resampler.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round().max(1.0) as usize;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx] + (samples[next] - samples[idx]) * frac
        })
        .collect()
}

/// Equal-power stereo gains for `pan` in [-1, 1].
pub fn pan_gains(pan: f32) -> (f32, f32) {
    let angle = (pan.clamp(-1.0, 1.0) + 1.0) * std::f32::consts::FRAC_PI_4;
    (angle.cos(), angle.sin())
}

// ── Capture ──────────────────────────────────────────────────────

/// Microphone capture on the default input device. System audio is not
/// available through CPAL and reports `Unsupported`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalCaptureProvider;

struct CpalCaptureHandle {
    kind: SourceKind,
    stream: Option<SendableStream>,
}

impl CaptureHandle for CpalCaptureHandle {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.0.pause() {
                tracing::debug!(error = %e, "Failed to pause capture stream");
            }
        }
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    target_rate: u32,
    sink: SampleSink,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let native_rate = config.sample_rate.0;
    let mut mono: Vec<f32> = Vec::new();
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            // The block handed to the sink is the only per-callback allocation.
            downmix_into(data, channels, &mut mono);
            if !sink.push(resample_linear(&mono, native_rate, target_rate)) {
                tracing::trace!("Capture block dropped");
            }
        },
        |err| tracing::warn!(error = %err, "Audio input stream error"),
        None,
    )
}

fn open_microphone(sample_rate: u32, sink: SampleSink) -> Result<cpal::Stream, String> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| "no input device available".to_string())?;
    let supported = device
        .default_input_config()
        .map_err(|e| format!("failed to query input config: {e}"))?;
    let config: cpal::StreamConfig = supported.config();

    tracing::info!(
        device = %device.name().unwrap_or_default(),
        channels = config.channels,
        native_rate = config.sample_rate.0,
        target_rate = sample_rate,
        "Opening microphone"
    );

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_input::<f32>(&device, &config, sample_rate, sink),
        SampleFormat::I16 => build_input::<i16>(&device, &config, sample_rate, sink),
        SampleFormat::U16 => build_input::<u16>(&device, &config, sample_rate, sink),
        fmt => return Err(format!("unsupported input sample format: {fmt:?}")),
    }
    .map_err(|e| format!("failed to build input stream: {e}"))?;

    stream
        .play()
        .map_err(|e| format!("failed to start input stream: {e}"))?;
    Ok(stream)
}

#[async_trait]
impl CaptureProvider for CpalCaptureProvider {
    async fn acquire(&self, kind: SourceKind, sample_rate: u32, sink: SampleSink) -> Acquisition {
        match kind {
            SourceKind::SystemAudio => Acquisition::Unsupported,
            SourceKind::Microphone => match open_microphone(sample_rate, sink) {
                Ok(stream) => Acquisition::Acquired(Box::new(CpalCaptureHandle {
                    kind,
                    stream: Some(SendableStream(stream)),
                })),
                Err(reason) => Acquisition::Declined(reason),
            },
        }
    }
}

// ── Output ───────────────────────────────────────────────────────

struct Voice {
    id: u64,
    start_frame: u64,
    samples: Vec<f32>,
    gains: (f32, f32),
}

#[derive(Default)]
struct Timeline {
    frames_played: u64,
    next_id: u64,
    voices: Vec<Voice>,
}

impl Timeline {
    /// Mix the next `frames` output frames as interleaved stereo.
    fn render(&mut self, out: &mut [f32], channels: usize) {
        let frames = out.len() / channels.max(1);
        out.iter_mut().for_each(|s| *s = 0.0);

        for voice in &self.voices {
            for i in 0..frames {
                let t = self.frames_played + i as u64;
                if t < voice.start_frame {
                    continue;
                }
                let Some(&sample) = voice.samples.get((t - voice.start_frame) as usize) else {
                    break;
                };
                let frame = &mut out[i * channels..(i + 1) * channels];
                if channels >= 2 {
                    frame[0] += sample * voice.gains.0;
                    frame[1] += sample * voice.gains.1;
                } else {
                    frame[0] += sample;
                }
            }
        }

        self.frames_played += frames as u64;
        let now = self.frames_played;
        self.voices
            .retain(|v| v.start_frame + v.samples.len() as u64 > now);
        out.iter_mut().for_each(|s| *s = s.clamp(-1.0, 1.0));
    }
}

/// Default output device with a mixing timeline.
pub struct CpalOutput {
    rate: u32,
    timeline: Arc<Mutex<Timeline>>,
    _stream: Mutex<SendableStream>,
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    timeline: Arc<Mutex<Timeline>>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            scratch.resize(data.len(), 0.0);
            timeline.lock().render(&mut scratch, channels);
            for (dst, &src) in data.iter_mut().zip(scratch.iter()) {
                *dst = T::from_sample(src);
            }
        },
        |err| tracing::warn!(error = %err, "Audio output stream error"),
        None,
    )
}

impl CpalOutput {
    pub fn new() -> anyhow::Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow::anyhow!("No output device available"))?;
        let supported = device.default_output_config()?;
        let config: cpal::StreamConfig = supported.config();
        let timeline = Arc::new(Mutex::new(Timeline::default()));

        tracing::info!(
            device = %device.name().unwrap_or_default(),
            channels = config.channels,
            rate = config.sample_rate.0,
            "Opening audio output"
        );

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_output::<f32>(&device, &config, Arc::clone(&timeline))?,
            SampleFormat::I16 => build_output::<i16>(&device, &config, Arc::clone(&timeline))?,
            SampleFormat::U16 => build_output::<u16>(&device, &config, Arc::clone(&timeline))?,
            fmt => anyhow::bail!("Unsupported output sample format: {fmt:?}"),
        };
        stream.play()?;

        Ok(Self {
            rate: config.sample_rate.0,
            timeline,
            _stream: Mutex::new(SendableStream(stream)),
        })
    }
}

impl AudioOutput for CpalOutput {
    fn current_time(&self) -> f64 {
        self.timeline.lock().frames_played as f64 / self.rate as f64
    }

    fn start(&self, buffer: &DecodedBuffer, at: f64, pan: f32) -> u64 {
        let mono = match buffer.channels.len() {
            0 => Vec::new(),
            1 => buffer.channels[0].clone(),
            n => (0..buffer.frames())
                .map(|i| buffer.channels.iter().map(|c| c[i]).sum::<f32>() / n as f32)
                .collect(),
        };
        let samples = resample_linear(&mono, buffer.sample_rate, self.rate);
        let start_frame = (at.max(0.0) * self.rate as f64).round() as u64;

        let mut timeline = self.timeline.lock();
        let id = timeline.next_id;
        timeline.next_id += 1;
        timeline.voices.push(Voice {
            id,
            start_frame,
            samples,
            gains: pan_gains(pan),
        });
        id
    }

    fn stop(&self, id: u64) {
        self.timeline.lock().voices.retain(|v| v.id != id);
    }
}
