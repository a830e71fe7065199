//! In-process audio platform driven by the caller.
//!
//! Streams render only when pumped, opens can fail or block on request, and
//! device loss is injected explicitly. Used by the test suites and by the
//! CLI when no real output is wanted.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::audio::{
    CallbackResult, FrameTimestamp, MonotonicClock, OutputBuffer, OutputStream, PlaybackCallback,
    SampleFormat, StreamErrorHandler,
};
use crate::error::AudioError;

use super::{AudioPlatform, PlatformStream, StreamRequest};

/// Device id reported when the request leaves the choice to the platform.
pub const DEFAULT_DEVICE_ID: i32 = 1;

const DEFAULT_SAMPLE_RATE: i32 = 48_000;
const DEFAULT_FRAMES_PER_BURST: i32 = 192;
const DEFAULT_CAPACITY_BURSTS: i32 = 16;

/// Deterministic backend used by tests and the CLI's dry-run mode.
///
/// No audio leaves the process: the callback runs only when a caller pumps
/// frames through [`SimulatedControls::pump`]. Every open and close is
/// counted, opens can be made to fail or block, and disconnects can be
/// injected.
pub struct SimulatedBackend {
    shared: Arc<Shared>,
    clock: Arc<ManualClock>,
}

/// Test-side handle onto a [`SimulatedBackend`].
#[derive(Clone)]
pub struct SimulatedControls {
    shared: Arc<Shared>,
    clock: Arc<ManualClock>,
}

/// Rendered samples returned by [`SimulatedControls::pump`].
#[derive(Debug, Clone, PartialEq)]
pub enum RenderedBuffer {
    F32(Vec<f32>),
    I16(Vec<i16>),
}

impl RenderedBuffer {
    pub fn len(&self) -> usize {
        match self {
            RenderedBuffer::F32(samples) => samples.len(),
            RenderedBuffer::I16(samples) => samples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_silent(&self) -> bool {
        match self {
            RenderedBuffer::F32(samples) => samples.iter().all(|&s| s == 0.0),
            RenderedBuffer::I16(samples) => samples.iter().all(|&s| s == 0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DeviceSettings {
    sample_rate: i32,
    frames_per_burst: i32,
    capacity_in_frames: i32,
    timestamps_supported: bool,
    xruns_supported: bool,
}

#[derive(Default)]
struct OpenGate {
    held: bool,
    waiting: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    Started,
    Stopped,
    Disconnected,
    Closed,
}

struct Shared {
    opens: AtomicUsize,
    closes: AtomicUsize,
    fail_next_open: AtomicBool,
    settings: Mutex<DeviceSettings>,
    gate: Mutex<OpenGate>,
    gate_changed: Condvar,
    current: Mutex<Option<Arc<Mutex<StreamCore>>>>,
}

/// Properties and counters of one simulated stream, as the callback sees them.
struct SimulatedProps {
    device_id: i32,
    format: SampleFormat,
    channel_count: i32,
    settings: DeviceSettings,
    buffer_size: i32,
    frames_written: i64,
    xruns: i32,
    timestamp: Option<FrameTimestamp>,
}

struct StreamCore {
    props: SimulatedProps,
    state: StreamState,
    callback: PlaybackCallback,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                opens: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                fail_next_open: AtomicBool::new(false),
                settings: Mutex::new(DeviceSettings {
                    sample_rate: DEFAULT_SAMPLE_RATE,
                    frames_per_burst: DEFAULT_FRAMES_PER_BURST,
                    capacity_in_frames: DEFAULT_FRAMES_PER_BURST * DEFAULT_CAPACITY_BURSTS,
                    timestamps_supported: true,
                    xruns_supported: true,
                }),
                gate: Mutex::new(OpenGate::default()),
                gate_changed: Condvar::new(),
                current: Mutex::new(None),
            }),
            clock: Arc::new(ManualClock::new(0)),
        }
    }

    pub fn controls(&self) -> SimulatedControls {
        SimulatedControls {
            shared: Arc::clone(&self.shared),
            clock: Arc::clone(&self.clock),
        }
    }

    fn wait_at_gate(&self) {
        let mut gate = lock(&self.shared.gate);
        if !gate.held {
            return;
        }
        gate.waiting += 1;
        self.shared.gate_changed.notify_all();
        while gate.held {
            gate = self
                .shared
                .gate_changed
                .wait(gate)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        gate.waiting -= 1;
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioPlatform for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn open_stream(
        &self,
        request: &StreamRequest,
        callback: PlaybackCallback,
    ) -> Result<Box<dyn PlatformStream>, AudioError> {
        self.wait_at_gate();
        self.shared.opens.fetch_add(1, Ordering::SeqCst);

        if self.shared.fail_next_open.swap(false, Ordering::SeqCst) {
            return Err(AudioError::StreamOpenFailed {
                reason: "simulated open failure".to_string(),
            });
        }

        let settings = *lock(&self.shared.settings);
        let device_id = if request.device_id == 0 {
            DEFAULT_DEVICE_ID
        } else {
            request.device_id
        };
        let core = Arc::new(Mutex::new(StreamCore {
            props: SimulatedProps {
                device_id,
                format: request.format,
                channel_count: request.channel_count,
                settings,
                // Platforms usually open with a deep default buffer
                buffer_size: settings.capacity_in_frames,
                frames_written: 0,
                xruns: 0,
                timestamp: None,
            },
            state: StreamState::Open,
            callback,
        }));
        *lock(&self.shared.current) = Some(Arc::clone(&core));

        tracing::debug!(device_id, format = ?request.format, "[Simulated] Stream opened");
        Ok(Box::new(SimulatedStream {
            core,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn clock(&self) -> Arc<dyn MonotonicClock> {
        self.clock.clone()
    }
}

impl SimulatedControls {
    pub fn opens(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// Make the next open attempt fail.
    pub fn fail_next_open(&self) {
        self.shared.fail_next_open.store(true, Ordering::SeqCst);
    }

    /// Block every open attempt until [`release_opens`](Self::release_opens).
    pub fn hold_opens(&self) {
        lock(&self.shared.gate).held = true;
    }

    pub fn release_opens(&self) {
        lock(&self.shared.gate).held = false;
        self.shared.gate_changed.notify_all();
    }

    /// Wait until an open attempt is parked at the gate.
    pub fn wait_for_blocked_open(&self, timeout: Duration) -> bool {
        let gate = lock(&self.shared.gate);
        let (gate, _) = self
            .shared
            .gate_changed
            .wait_timeout_while(gate, timeout, |gate| gate.waiting == 0)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        gate.waiting > 0
    }

    /// Capacity applied to streams opened from now on.
    pub fn set_buffer_capacity(&self, frames: i32) {
        lock(&self.shared.settings).capacity_in_frames = frames;
    }

    /// Timestamp support of streams opened from now on.
    pub fn set_timestamps_supported(&self, supported: bool) {
        lock(&self.shared.settings).timestamps_supported = supported;
    }

    /// Underrun reporting of streams opened from now on.
    pub fn set_xruns_supported(&self, supported: bool) {
        lock(&self.shared.settings).xruns_supported = supported;
    }

    pub fn clock(&self) -> Arc<ManualClock> {
        Arc::clone(&self.clock)
    }

    pub fn is_running(&self) -> bool {
        self.with_current(|core| core.state == StreamState::Started)
            .unwrap_or(false)
    }

    pub fn buffer_size(&self) -> Option<i32> {
        self.with_current(|core| core.props.buffer_size)
    }

    pub fn device_id(&self) -> Option<i32> {
        self.with_current(|core| core.props.device_id)
    }

    pub fn set_xruns(&self, xruns: i32) {
        self.with_current(|core| core.props.xruns = xruns);
    }

    pub fn set_timestamp(&self, timestamp: FrameTimestamp) {
        self.with_current(|core| core.props.timestamp = Some(timestamp));
    }

    pub fn frames_written(&self) -> Option<i64> {
        self.with_current(|core| core.props.frames_written)
    }

    /// Run the data callback once for `frames` frames.
    ///
    /// Returns `None` when no stream is running.
    pub fn pump(&self, frames: usize) -> Option<RenderedBuffer> {
        let core = lock(&self.shared.current).clone()?;
        let mut core = lock(&core);
        if core.state != StreamState::Started {
            return None;
        }

        let StreamCore {
            props, callback, ..
        } = &mut *core;
        let samples = frames * props.channel_count.max(1) as usize;
        let (rendered, result) = match props.format {
            SampleFormat::F32 => {
                let mut buffer = vec![f32::NAN; samples];
                let result = callback.on_audio_ready(props, OutputBuffer::F32(&mut buffer));
                (RenderedBuffer::F32(buffer), result)
            }
            SampleFormat::I16 => {
                let mut buffer = vec![i16::MIN; samples];
                let result = callback.on_audio_ready(props, OutputBuffer::I16(&mut buffer));
                (RenderedBuffer::I16(buffer), result)
            }
        };
        props.frames_written += frames as i64;

        if result == CallbackResult::Stop {
            core.state = StreamState::Stopped;
        }
        Some(rendered)
    }

    /// Simulate the output device going away.
    pub fn disconnect(&self) -> bool {
        let Some(core) = lock(&self.shared.current).clone() else {
            return false;
        };
        let mut core = lock(&core);
        if core.state == StreamState::Closed {
            return false;
        }
        core.state = StreamState::Disconnected;
        core.callback.on_error(AudioError::Disconnected);
        true
    }

    /// The error handler of the open stream, kept so a late notification
    /// from a stream that has since been replaced can be replayed.
    pub fn error_handler(&self) -> Option<StreamErrorHandler> {
        self.with_current(|core| core.callback.error_handler())
    }

    fn with_current<R>(&self, f: impl FnOnce(&mut StreamCore) -> R) -> Option<R> {
        let core = lock(&self.shared.current).clone()?;
        let mut core = lock(&core);
        if core.state == StreamState::Closed {
            return None;
        }
        Some(f(&mut core))
    }
}

impl OutputStream for SimulatedProps {
    fn sample_rate(&self) -> i32 {
        self.settings.sample_rate
    }

    fn channel_count(&self) -> i32 {
        self.channel_count
    }

    fn format(&self) -> SampleFormat {
        self.format
    }

    fn device_id(&self) -> i32 {
        self.device_id
    }

    fn frames_per_burst(&mut self) -> i32 {
        self.settings.frames_per_burst
    }

    fn buffer_size_in_frames(&self) -> i32 {
        self.buffer_size
    }

    fn buffer_capacity_in_frames(&self) -> i32 {
        self.settings.capacity_in_frames
    }

    fn set_buffer_size_in_frames(&mut self, frames: i32) -> Result<i32, AudioError> {
        self.buffer_size = frames.clamp(1, self.settings.capacity_in_frames.max(1));
        Ok(self.buffer_size)
    }

    fn xrun_count(&mut self) -> Result<i32, AudioError> {
        if self.settings.xruns_supported {
            Ok(self.xruns)
        } else {
            Err(AudioError::Unimplemented {
                operation: "xrun_count",
            })
        }
    }

    fn frames_written(&mut self) -> i64 {
        self.frames_written
    }

    fn timestamp(&mut self) -> Result<FrameTimestamp, AudioError> {
        if !self.settings.timestamps_supported {
            return Err(AudioError::Unimplemented {
                operation: "timestamp",
            });
        }
        self.timestamp.ok_or(AudioError::TimestampUnavailable)
    }
}

/// Control-side handle returned by [`SimulatedBackend::open_stream`].
struct SimulatedStream {
    core: Arc<Mutex<StreamCore>>,
    shared: Arc<Shared>,
}

impl SimulatedStream {
    fn core(&self) -> MutexGuard<'_, StreamCore> {
        lock(&self.core)
    }

    fn transition(&mut self, to: StreamState) -> Result<(), AudioError> {
        let mut core = self.core();
        match core.state {
            StreamState::Disconnected => Err(AudioError::Disconnected),
            StreamState::Closed => Err(AudioError::NoActiveStream),
            _ => {
                core.state = to;
                Ok(())
            }
        }
    }
}

impl OutputStream for SimulatedStream {
    fn sample_rate(&self) -> i32 {
        self.core().props.sample_rate()
    }

    fn channel_count(&self) -> i32 {
        self.core().props.channel_count()
    }

    fn format(&self) -> SampleFormat {
        self.core().props.format()
    }

    fn device_id(&self) -> i32 {
        self.core().props.device_id()
    }

    fn frames_per_burst(&mut self) -> i32 {
        self.core().props.frames_per_burst()
    }

    fn buffer_size_in_frames(&self) -> i32 {
        self.core().props.buffer_size_in_frames()
    }

    fn buffer_capacity_in_frames(&self) -> i32 {
        self.core().props.buffer_capacity_in_frames()
    }

    fn set_buffer_size_in_frames(&mut self, frames: i32) -> Result<i32, AudioError> {
        self.core().props.set_buffer_size_in_frames(frames)
    }

    fn xrun_count(&mut self) -> Result<i32, AudioError> {
        self.core().props.xrun_count()
    }

    fn frames_written(&mut self) -> i64 {
        self.core().props.frames_written()
    }

    fn timestamp(&mut self) -> Result<FrameTimestamp, AudioError> {
        self.core().props.timestamp()
    }
}

impl PlatformStream for SimulatedStream {
    fn request_start(&mut self) -> Result<(), AudioError> {
        self.transition(StreamState::Started)
    }

    fn request_stop(&mut self) -> Result<(), AudioError> {
        self.transition(StreamState::Stopped)
    }

    fn close(&mut self) -> Result<(), AudioError> {
        {
            let mut core = self.core();
            if core.state == StreamState::Closed {
                return Ok(());
            }
            core.state = StreamState::Closed;
        }
        self.shared.closes.fetch_add(1, Ordering::SeqCst);

        let mut current = lock(&self.shared.current);
        if current
            .as_ref()
            .is_some_and(|core| Arc::ptr_eq(core, &self.core))
        {
            *current = None;
        }
        Ok(())
    }
}

impl Drop for SimulatedStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Manually driven monotonic clock.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicI64,
}

impl ManualClock {
    pub fn new(nanos: i64) -> Self {
        Self {
            nanos: AtomicI64::new(nanos),
        }
    }

    pub fn set(&self, nanos: i64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }

    pub fn advance(&self, nanos: i64) {
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl MonotonicClock for ManualClock {
    fn now_nanos(&self) -> i64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{
        trace_channel, BufferSizeMode, CallbackContext, EngineConfig, LatencyCell, CHANNEL_COUNT,
    };
    use crate::engine::restart::RestartSignal;
    use crate::config::{ToneConfig, TunerConfig};
    use crate::engine::backend::SharingMode;
    use tokio::sync::mpsc;

    fn callback() -> PlaybackCallback {
        let (trace, _reader) = trace_channel(4);
        let (restart_tx, _restart_rx) = mpsc::channel(1);
        PlaybackCallback::new(CallbackContext {
            config: Arc::new(EngineConfig::new(0, BufferSizeMode::Automatic, false)),
            latency: Arc::new(LatencyCell::new()),
            timestamps_supported: Arc::new(AtomicBool::new(false)),
            clock: Arc::new(ManualClock::new(0)),
            tone: ToneConfig::default(),
            tuner: TunerConfig::default(),
            trace,
            errors: StreamErrorHandler::new(restart_tx, Arc::new(RestartSignal::new())),
        })
    }

    fn request(device_id: i32) -> StreamRequest {
        StreamRequest {
            device_id,
            channel_count: CHANNEL_COUNT,
            format: SampleFormat::F32,
            sharing_mode: SharingMode::Exclusive,
            low_latency: true,
        }
    }

    #[test]
    fn test_open_counts_and_assigns_default_device() {
        let backend = SimulatedBackend::new();
        let controls = backend.controls();

        let stream = backend.open_stream(&request(0), callback()).unwrap();
        assert_eq!(controls.opens(), 1);
        assert_eq!(stream.device_id(), DEFAULT_DEVICE_ID);
        assert_eq!(stream.buffer_capacity_in_frames(), 192 * 16);
    }

    #[test]
    fn test_fail_next_open_is_one_shot() {
        let backend = SimulatedBackend::new();
        let controls = backend.controls();
        controls.fail_next_open();

        assert!(backend.open_stream(&request(0), callback()).is_err());
        assert!(backend.open_stream(&request(0), callback()).is_ok());
        assert_eq!(controls.opens(), 2);
    }

    #[test]
    fn test_pump_requires_started_stream() {
        let backend = SimulatedBackend::new();
        let controls = backend.controls();
        let mut stream = backend.open_stream(&request(2), callback()).unwrap();

        assert!(controls.pump(64).is_none());
        stream.request_start().unwrap();
        let rendered = controls.pump(64).unwrap();
        assert_eq!(rendered.len(), 128);
        assert!(rendered.is_silent());
        assert_eq!(controls.frames_written(), Some(64));
    }

    #[test]
    fn test_close_is_counted_once() {
        let backend = SimulatedBackend::new();
        let controls = backend.controls();
        let mut stream = backend.open_stream(&request(0), callback()).unwrap();

        stream.close().unwrap();
        stream.close().unwrap();
        drop(stream);
        assert_eq!(controls.closes(), 1);
        assert!(controls.buffer_size().is_none());
    }

    #[test]
    fn test_disconnected_stream_refuses_start() {
        let backend = SimulatedBackend::new();
        let controls = backend.controls();
        let mut stream = backend.open_stream(&request(0), callback()).unwrap();

        assert!(controls.disconnect());
        assert_eq!(stream.request_start(), Err(AudioError::Disconnected));
        assert!(stream.close().is_ok());
    }

    #[test]
    fn test_buffer_size_clamped_to_capacity() {
        let backend = SimulatedBackend::new();
        backend.controls().set_buffer_capacity(500);
        let mut stream = backend.open_stream(&request(0), callback()).unwrap();

        assert_eq!(stream.set_buffer_size_in_frames(960), Ok(500));
        assert_eq!(stream.buffer_size_in_frames(), 500);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(5);
        clock.advance(10);
        assert_eq!(clock.now_nanos(), 15);
        clock.set(-1);
        assert_eq!(clock.now_nanos(), -1);
    }
}
