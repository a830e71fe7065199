//! CPAL-based audio backend for desktop platforms (Linux, macOS, Windows)
//!
//! `cpal::Stream` is not `Send`, so each stream lives on its own thread and
//! the control side talks to it through a command channel. Properties the
//! data callback needs are shared through atomics.
//!
//! Differences from a low-latency mobile stream:
//! - The buffer is fixed at one burst, clamped to the device's supported
//!   range; resizing is not supported. When the device reports no range the
//!   host picks the size, reported as 0 until the first callback shows it
//! - Underruns are not reported, so automatic tuning stays inert
//! - Presentation timestamps come from cpal's callback/playback instants

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use once_cell::sync::Lazy;
use tokio::sync::{mpsc, oneshot};

use crate::audio::{
    FrameTimestamp, MonotonicClock, OutputStream, PlaybackCallback, Sample, SampleFormat,
};
use crate::error::AudioError;

use super::{AudioPlatform, PlatformStream, StreamRequest};

static CLOCK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic nanoseconds since the first use of the clock in this process.
#[derive(Debug, Default)]
pub struct InstantClock {
    _unit: (),
}

impl MonotonicClock for InstantClock {
    fn now_nanos(&self) -> i64 {
        CLOCK_EPOCH.elapsed().as_nanos() as i64
    }
}

/// CPAL-based audio backend.
pub struct CpalBackend {
    frames_per_burst: u32,
    clock: Arc<InstantClock>,
}

impl CpalBackend {
    /// Create a CPAL backend that asks for `frames_per_burst`-frame callbacks.
    pub fn new(frames_per_burst: u32) -> Self {
        Self {
            frames_per_burst: frames_per_burst.max(1),
            clock: Arc::new(InstantClock::default()),
        }
    }
}

impl AudioPlatform for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn open_stream(
        &self,
        request: &StreamRequest,
        callback: PlaybackCallback,
    ) -> Result<Box<dyn PlatformStream>, AudioError> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let request = request.clone();
        let frames_per_burst = self.frames_per_burst;
        let clock = Arc::clone(&self.clock);

        let thread = std::thread::Builder::new()
            .name("cpal-output".to_string())
            .spawn(move || {
                stream_thread(request, frames_per_burst, clock, callback, command_rx, ready_tx)
            })?;

        match ready_rx.blocking_recv() {
            Ok(Ok(state)) => Ok(Box::new(CpalStream {
                state: StreamState(state),
                commands: command_tx,
                thread: Some(thread),
            })),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::StreamOpenFailed {
                    reason: "stream thread exited before opening".to_string(),
                })
            }
        }
    }

    fn clock(&self) -> Arc<dyn MonotonicClock> {
        self.clock.clone()
    }
}

type Reply = oneshot::Sender<Result<(), AudioError>>;

enum Command {
    Play(Reply),
    Pause(Reply),
    Close,
}

/// Stream properties plus the counters written by the data callback.
struct SharedState {
    device_id: i32,
    sample_rate: i32,
    channel_count: i32,
    format: SampleFormat,
    /// Frames per callback; fixed at open or observed when the host chose
    buffer_frames: AtomicI32,
    fixed_buffer: bool,
    frames_written: AtomicI64,
    timestamp_position: AtomicI64,
    timestamp_nanos: AtomicI64,
    has_timestamp: AtomicBool,
}

/// `OutputStream` view over the shared state, used by both sides.
struct StreamState(Arc<SharedState>);

impl OutputStream for StreamState {
    fn sample_rate(&self) -> i32 {
        self.0.sample_rate
    }

    fn channel_count(&self) -> i32 {
        self.0.channel_count
    }

    fn format(&self) -> SampleFormat {
        self.0.format
    }

    fn device_id(&self) -> i32 {
        self.0.device_id
    }

    fn frames_per_burst(&mut self) -> i32 {
        self.0.buffer_frames.load(Ordering::Acquire)
    }

    fn buffer_size_in_frames(&self) -> i32 {
        self.0.buffer_frames.load(Ordering::Acquire)
    }

    fn buffer_capacity_in_frames(&self) -> i32 {
        self.0.buffer_frames.load(Ordering::Acquire)
    }

    fn set_buffer_size_in_frames(&mut self, _frames: i32) -> Result<i32, AudioError> {
        Err(AudioError::Unimplemented {
            operation: "set_buffer_size_in_frames",
        })
    }

    fn xrun_count(&mut self) -> Result<i32, AudioError> {
        Err(AudioError::Unimplemented {
            operation: "xrun_count",
        })
    }

    fn frames_written(&mut self) -> i64 {
        self.0.frames_written.load(Ordering::Acquire)
    }

    fn timestamp(&mut self) -> Result<FrameTimestamp, AudioError> {
        if !self.0.has_timestamp.load(Ordering::Acquire) {
            return Err(AudioError::TimestampUnavailable);
        }
        Ok(FrameTimestamp {
            position: self.0.timestamp_position.load(Ordering::Acquire),
            nanos: self.0.timestamp_nanos.load(Ordering::Acquire),
        })
    }
}

/// Control-side handle; the `cpal::Stream` itself stays on its thread.
struct CpalStream {
    state: StreamState,
    commands: mpsc::UnboundedSender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl CpalStream {
    fn send(&self, make: impl FnOnce(Reply) -> Command) -> Result<(), AudioError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .map_err(|_| AudioError::NoActiveStream)?;
        reply_rx.blocking_recv().map_err(|_| AudioError::NoActiveStream)?
    }
}

impl OutputStream for CpalStream {
    fn sample_rate(&self) -> i32 {
        self.state.sample_rate()
    }

    fn channel_count(&self) -> i32 {
        self.state.channel_count()
    }

    fn format(&self) -> SampleFormat {
        self.state.format()
    }

    fn device_id(&self) -> i32 {
        self.state.device_id()
    }

    fn frames_per_burst(&mut self) -> i32 {
        self.state.frames_per_burst()
    }

    fn buffer_size_in_frames(&self) -> i32 {
        self.state.buffer_size_in_frames()
    }

    fn buffer_capacity_in_frames(&self) -> i32 {
        self.state.buffer_capacity_in_frames()
    }

    fn set_buffer_size_in_frames(&mut self, frames: i32) -> Result<i32, AudioError> {
        self.state.set_buffer_size_in_frames(frames)
    }

    fn xrun_count(&mut self) -> Result<i32, AudioError> {
        self.state.xrun_count()
    }

    fn frames_written(&mut self) -> i64 {
        self.state.frames_written()
    }

    fn timestamp(&mut self) -> Result<FrameTimestamp, AudioError> {
        self.state.timestamp()
    }
}

impl PlatformStream for CpalStream {
    fn request_start(&mut self) -> Result<(), AudioError> {
        self.send(Command::Play)
    }

    fn request_stop(&mut self) -> Result<(), AudioError> {
        self.send(Command::Pause)
    }

    fn close(&mut self) -> Result<(), AudioError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let _ = self.commands.send(Command::Close);
        thread.join().map_err(|_| AudioError::StreamCloseFailed {
            reason: "stream thread panicked".to_string(),
        })
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Body of the thread that owns one `cpal::Stream`.
fn stream_thread(
    request: StreamRequest,
    frames_per_burst: u32,
    clock: Arc<InstantClock>,
    callback: PlaybackCallback,
    mut commands: mpsc::UnboundedReceiver<Command>,
    ready: oneshot::Sender<Result<Arc<SharedState>, AudioError>>,
) {
    let (stream, shared) = match build(&request, frames_per_burst, clock, callback) {
        Ok(built) => built,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    if ready.send(Ok(Arc::clone(&shared))).is_err() {
        return;
    }

    // A dropped handle ends the loop as well
    while let Some(command) = commands.blocking_recv() {
        match command {
            Command::Play(reply) => {
                let _ = reply.send(stream.play().map_err(|e| AudioError::StreamStartFailed {
                    reason: e.to_string(),
                }));
            }
            Command::Pause(reply) => {
                let _ = reply.send(stream.pause().map_err(|e| AudioError::StreamStopFailed {
                    reason: e.to_string(),
                }));
            }
            Command::Close => break,
        }
    }

    drop(stream);
    tracing::debug!(device_id = shared.device_id, "[CpalBackend] Stream thread exiting");
}

fn build(
    request: &StreamRequest,
    frames_per_burst: u32,
    clock: Arc<InstantClock>,
    callback: PlaybackCallback,
) -> Result<(cpal::Stream, Arc<SharedState>), AudioError> {
    let host = cpal::default_host();
    let device = select_device(&host, request.device_id)?;
    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::StreamOpenFailed {
            reason: format!("Failed to get default output config: {:?}", e),
        })?;

    let fixed_frames = fixed_buffer_frames(supported.buffer_size(), frames_per_burst);
    let buffer_size = match fixed_frames {
        Some(frames) => {
            if frames != frames_per_burst {
                tracing::info!(
                    requested = frames_per_burst,
                    applied = frames,
                    "[CpalBackend] Burst clamped to device buffer range"
                );
            }
            cpal::BufferSize::Fixed(frames)
        }
        None => {
            tracing::warn!(
                frames_per_burst,
                "[CpalBackend] Device reports no buffer range, host picks the size"
            );
            cpal::BufferSize::Default
        }
    };
    let config = cpal::StreamConfig {
        channels: request.channel_count as u16,
        sample_rate: supported.sample_rate(),
        buffer_size,
    };

    let shared = Arc::new(SharedState {
        device_id: request.device_id,
        sample_rate: config.sample_rate.0 as i32,
        channel_count: request.channel_count,
        format: request.format,
        buffer_frames: AtomicI32::new(fixed_frames.map_or(0, |frames| frames as i32)),
        fixed_buffer: fixed_frames.is_some(),
        frames_written: AtomicI64::new(0),
        timestamp_position: AtomicI64::new(0),
        timestamp_nanos: AtomicI64::new(0),
        has_timestamp: AtomicBool::new(false),
    });

    let stream = match request.format {
        SampleFormat::F32 => {
            build_stream::<f32>(&device, &config, Arc::clone(&shared), clock, callback)
        }
        SampleFormat::I16 => {
            build_stream::<i16>(&device, &config, Arc::clone(&shared), clock, callback)
        }
    }?;

    tracing::info!(
        device = device.name().unwrap_or_default(),
        sample_rate = shared.sample_rate,
        ?buffer_size,
        "[CpalBackend] Output stream opened"
    );
    Ok((stream, shared))
}

/// Callback size to request, or `None` when the host must choose.
///
/// The burst is clamped into the device's range so the reported size is
/// the one actually requested.
fn fixed_buffer_frames(supported: &cpal::SupportedBufferSize, burst: u32) -> Option<u32> {
    match supported {
        cpal::SupportedBufferSize::Range { min, max } if min <= max => {
            Some(burst.clamp(*min, *max))
        }
        _ => None,
    }
}

/// Device 0 is the host default; device N is the Nth output device.
fn select_device(host: &cpal::Host, device_id: i32) -> Result<cpal::Device, AudioError> {
    if device_id <= 0 {
        return host
            .default_output_device()
            .ok_or_else(|| AudioError::StreamOpenFailed {
                reason: "No default output device found".to_string(),
            });
    }

    host.output_devices()
        .map_err(|e| AudioError::StreamOpenFailed {
            reason: format!("Failed to enumerate output devices: {:?}", e),
        })?
        .nth((device_id - 1) as usize)
        .ok_or_else(|| AudioError::StreamOpenFailed {
            reason: format!("No output device with id {}", device_id),
        })
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: Arc<SharedState>,
    clock: Arc<InstantClock>,
    mut callback: PlaybackCallback,
) -> Result<cpal::Stream, AudioError>
where
    T: Sample + cpal::SizedSample,
{
    let errors = callback.error_handler();
    let err_fn = move |err: cpal::StreamError| match err {
        cpal::StreamError::DeviceNotAvailable => errors.on_error(AudioError::Disconnected),
        cpal::StreamError::BackendSpecific { err } => {
            errors.on_error(AudioError::HardwareError {
                details: err.description,
            })
        }
    };

    let channels = config.channels.max(1) as i64;
    let mut view = StreamState(Arc::clone(&shared));

    device
        .build_output_stream(
            config,
            move |data: &mut [T], info: &cpal::OutputCallbackInfo| {
                let position = shared.frames_written.load(Ordering::Relaxed);
                let timestamp = info.timestamp();
                if let Some(ahead) = timestamp.playback.duration_since(&timestamp.callback) {
                    let presented = clock.now_nanos() + ahead.as_nanos() as i64;
                    shared.timestamp_position.store(position, Ordering::Release);
                    shared.timestamp_nanos.store(presented, Ordering::Release);
                    shared.has_timestamp.store(true, Ordering::Release);
                }

                let frames = data.len() as i64 / channels;
                if !shared.fixed_buffer {
                    shared.buffer_frames.store(frames as i32, Ordering::Release);
                }
                callback.on_audio_ready(&mut view, T::output_buffer(data));
                shared
                    .frames_written
                    .store(position + frames, Ordering::Release);
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamOpenFailed {
            reason: format!("{:?}", e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_inside_range_is_kept() {
        let range = cpal::SupportedBufferSize::Range { min: 64, max: 4096 };
        assert_eq!(fixed_buffer_frames(&range, 192), Some(192));
    }

    #[test]
    fn test_burst_clamped_to_device_range() {
        let range = cpal::SupportedBufferSize::Range { min: 256, max: 4096 };
        assert_eq!(fixed_buffer_frames(&range, 192), Some(256));

        let range = cpal::SupportedBufferSize::Range { min: 16, max: 128 };
        assert_eq!(fixed_buffer_frames(&range, 192), Some(128));
    }

    #[test]
    fn test_unknown_range_leaves_size_to_host() {
        assert_eq!(
            fixed_buffer_frames(&cpal::SupportedBufferSize::Unknown, 192),
            None
        );
    }

    #[test]
    fn test_host_chosen_size_reported_as_unknown_until_observed() {
        let shared = Arc::new(SharedState {
            device_id: 0,
            sample_rate: 48_000,
            channel_count: 2,
            format: SampleFormat::F32,
            buffer_frames: AtomicI32::new(0),
            fixed_buffer: false,
            frames_written: AtomicI64::new(0),
            timestamp_position: AtomicI64::new(0),
            timestamp_nanos: AtomicI64::new(0),
            has_timestamp: AtomicBool::new(false),
        });
        let mut state = StreamState(Arc::clone(&shared));
        assert_eq!(state.buffer_size_in_frames(), 0);

        shared.buffer_frames.store(441, Ordering::Release);
        assert_eq!(state.frames_per_burst(), 441);
        assert_eq!(state.buffer_capacity_in_frames(), 441);
    }
}
