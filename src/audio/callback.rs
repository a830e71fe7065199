//! PlaybackCallback - the real-time data and error handlers
//!
//! Backends move one `PlaybackCallback` into each stream they open and
//! call it from the platform's audio thread whenever frames are needed.
//!
//! # Real-Time Safety
//! `on_audio_ready` is:
//! - Lock-free (EngineConfig is read through atomics)
//! - Allocation-free (oscillators, tuner and trace ring are pre-built)
//! - Log-free (diagnostics go through the rtrb trace ring)
//!
//! # Per-cycle flow
//! ```text
//! platform audio thread
//!   └─> PlaybackCallback::on_audio_ready()
//!       ├─> buffer size: LatencyTuner::tune() or fixed burst multiple
//!       ├─> TraceWriter::record() [underruns, buffer size]
//!       ├─> SineOscillator::render() or zero fill
//!       └─> latency::estimate() -> LatencyCell
//! ```

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::{ToneConfig, TunerConfig};
use crate::engine::restart::{RestartRequest, RestartSignal};
use crate::error::{AudioError, ErrorCode};

use super::format::{OutputBuffer, Sample};
use super::latency::{self, LatencyCell};
use super::oscillator::SineOscillator;
use super::stream::{MonotonicClock, OutputStream};
use super::trace::{CallbackTrace, TraceWriter};
use super::tuner::{LatencyTuner, TuneAction};

/// How the buffer size is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSizeMode {
    /// LatencyTuner adjusts the size every callback
    Automatic,
    /// Fixed multiple of the burst size
    Bursts(i32),
}

impl BufferSizeMode {
    /// Zero or a negative count selects automatic tuning.
    pub fn from_bursts(bursts: i32) -> Self {
        if bursts <= 0 {
            BufferSizeMode::Automatic
        } else {
            BufferSizeMode::Bursts(bursts)
        }
    }

    pub fn as_bursts(self) -> i32 {
        match self {
            BufferSizeMode::Automatic => 0,
            BufferSizeMode::Bursts(bursts) => bursts,
        }
    }
}

/// Desired engine state, written by the control context and read by the
/// callback every cycle.
#[derive(Debug)]
pub struct EngineConfig {
    device_id: AtomicI32,
    buffer_size_in_bursts: AtomicI32,
    tone_on: AtomicBool,
    tuner_reset: AtomicBool,
}

impl EngineConfig {
    pub fn new(device_id: i32, mode: BufferSizeMode, tone_on: bool) -> Self {
        Self {
            device_id: AtomicI32::new(device_id),
            buffer_size_in_bursts: AtomicI32::new(mode.as_bursts()),
            tone_on: AtomicBool::new(tone_on),
            tuner_reset: AtomicBool::new(false),
        }
    }

    pub fn device_id(&self) -> i32 {
        self.device_id.load(Ordering::Relaxed)
    }

    pub fn set_device_id(&self, device_id: i32) {
        self.device_id.store(device_id, Ordering::Relaxed);
    }

    #[inline]
    pub fn buffer_size_mode(&self) -> BufferSizeMode {
        BufferSizeMode::from_bursts(self.buffer_size_in_bursts.load(Ordering::Relaxed))
    }

    pub fn set_buffer_size_mode(&self, mode: BufferSizeMode) {
        self.buffer_size_in_bursts
            .store(mode.as_bursts(), Ordering::Relaxed);
    }

    #[inline]
    pub fn is_tone_on(&self) -> bool {
        self.tone_on.load(Ordering::Relaxed)
    }

    pub fn set_tone_on(&self, tone_on: bool) {
        self.tone_on.store(tone_on, Ordering::Relaxed);
    }

    /// Ask the next automatic-mode callback to reset the tuner.
    pub fn request_tuner_reset(&self) {
        self.tuner_reset.store(true, Ordering::Relaxed);
    }

    #[inline]
    fn take_tuner_reset(&self) -> bool {
        self.tuner_reset.swap(false, Ordering::Relaxed)
    }
}

/// Data callback return directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackResult {
    Continue,
    Stop,
}

/// Error-notification side of the callback.
///
/// Device loss is never handled here: it posts a restart request to the
/// restart worker and returns. A disconnect raised while a restart is
/// already queued or running is dropped on the spot. Nothing is logged;
/// outcomes are counted in the [`RestartSignal`] and reported by the
/// control side. Cloneable so backends with separate error closures can
/// hold their own copy.
#[derive(Clone)]
pub struct StreamErrorHandler {
    restart_tx: mpsc::Sender<RestartRequest>,
    signal: Arc<RestartSignal>,
}

impl StreamErrorHandler {
    pub fn new(restart_tx: mpsc::Sender<RestartRequest>, signal: Arc<RestartSignal>) -> Self {
        Self { restart_tx, signal }
    }

    pub fn on_error(&self, error: AudioError) {
        match error {
            AudioError::Disconnected => self.request_restart(),
            other => self.signal.record_stream_error(other.code()),
        }
    }

    fn request_restart(&self) {
        if !self.signal.try_claim() {
            self.signal.record_dropped();
            return;
        }
        match self.restart_tx.try_send(RestartRequest::DeviceDisconnected) {
            Ok(()) => self.signal.record_queued(),
            // A request is still queued; it keeps the claim
            Err(TrySendError::Full(_)) => self.signal.record_dropped(),
            Err(TrySendError::Closed(_)) => {
                self.signal.release();
                self.signal.record_rejected();
            }
        }
    }
}

/// Everything a callback needs, bundled by the stream controller.
pub struct CallbackContext {
    pub config: Arc<EngineConfig>,
    pub latency: Arc<LatencyCell>,
    pub timestamps_supported: Arc<AtomicBool>,
    pub clock: Arc<dyn MonotonicClock>,
    pub tone: ToneConfig,
    pub tuner: TunerConfig,
    pub trace: TraceWriter,
    pub errors: StreamErrorHandler,
}

/// Real-time handler bound to one stream.
pub struct PlaybackCallback {
    config: Arc<EngineConfig>,
    latency: Arc<LatencyCell>,
    timestamps_supported: Arc<AtomicBool>,
    clock: Arc<dyn MonotonicClock>,
    tone: ToneConfig,
    prepared_sample_rate: i32,
    right: SineOscillator,
    left: SineOscillator,
    tuner: LatencyTuner,
    trace: TraceWriter,
    errors: StreamErrorHandler,
}

impl PlaybackCallback {
    pub fn new(ctx: CallbackContext) -> Self {
        Self {
            config: ctx.config,
            latency: ctx.latency,
            timestamps_supported: ctx.timestamps_supported,
            clock: ctx.clock,
            prepared_sample_rate: 0,
            right: SineOscillator::new(ctx.tone.right_frequency_hz, 1, ctx.tone.amplitude),
            left: SineOscillator::new(ctx.tone.left_frequency_hz, 1, ctx.tone.amplitude),
            tone: ctx.tone,
            tuner: LatencyTuner::new(ctx.tuner),
            trace: ctx.trace,
            errors: ctx.errors,
        }
    }

    /// Called whenever the platform needs more frames.
    ///
    /// `stream` is the handle that issued this callback; `buffer` holds
    /// interleaved samples for every channel.
    pub fn on_audio_ready(
        &mut self,
        stream: &mut dyn OutputStream,
        buffer: OutputBuffer<'_>,
    ) -> CallbackResult {
        let channels = stream.channel_count().max(1) as usize;
        let num_frames = buffer.len() / channels;

        let mut buffer_size = stream.buffer_size_in_frames();

        let tuning = match self.config.buffer_size_mode() {
            BufferSizeMode::Automatic => {
                let action = if self.config.take_tuner_reset() {
                    self.tuner.reset(stream)
                } else {
                    self.tuner.tune(stream)
                };
                if action != TuneAction::Idle {
                    buffer_size = stream.buffer_size_in_frames();
                }
                action
            }
            BufferSizeMode::Bursts(bursts) => {
                let target = bursts.saturating_mul(stream.frames_per_burst());
                if buffer_size != target {
                    let _ = stream.set_buffer_size_in_frames(target);
                    // The platform may clamp the request
                    buffer_size = stream.buffer_size_in_frames();
                }
                TuneAction::Idle
            }
        };

        let underruns = stream.xrun_count().unwrap_or(-1);
        self.trace.record(CallbackTrace {
            num_frames: num_frames as i32,
            underruns,
            buffer_size,
            tuning,
        });

        self.prepare_oscillators(stream.sample_rate());
        let tone_on = self.config.is_tone_on();
        match buffer {
            OutputBuffer::F32(samples) => self.fill(samples, channels, num_frames, tone_on),
            OutputBuffer::I16(samples) => self.fill(samples, channels, num_frames, tone_on),
        }

        if self.timestamps_supported.load(Ordering::Relaxed) {
            // No timestamp yet right after start; keep the previous value
            if let Ok(millis) = latency::estimate(stream, self.clock.as_ref()) {
                self.latency.store(millis);
            }
        }

        CallbackResult::Continue
    }

    /// Called by the platform when the stream fails.
    pub fn on_error(&mut self, error: AudioError) {
        self.errors.on_error(error);
    }

    /// A copy of the error handler for backends that report errors
    /// outside the data callback.
    pub fn error_handler(&self) -> StreamErrorHandler {
        self.errors.clone()
    }

    fn prepare_oscillators(&mut self, sample_rate: i32) {
        if sample_rate == self.prepared_sample_rate || sample_rate <= 0 {
            return;
        }
        self.right =
            SineOscillator::new(self.tone.right_frequency_hz, sample_rate, self.tone.amplitude);
        self.left =
            SineOscillator::new(self.tone.left_frequency_hz, sample_rate, self.tone.amplitude);
        self.prepared_sample_rate = sample_rate;
    }

    fn fill<S: Sample>(&mut self, samples: &mut [S], channels: usize, frames: usize, tone_on: bool) {
        if tone_on {
            self.right.render(samples, channels, frames);
            if channels == 2 {
                if let Some(left_channel) = samples.get_mut(1..) {
                    self.left.render(left_channel, channels, frames);
                }
            }
        } else {
            let len = (frames * channels).min(samples.len());
            samples[..len].fill(S::default());
        }
    }
}
