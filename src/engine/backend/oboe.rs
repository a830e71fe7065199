//! Oboe backend for Android (AAudio / OpenSL ES).
//!
//! Streams are opened stereo, low-latency and exclusive (Oboe falls back to
//! shared when exclusive access is refused). Oboe hands the callback typed
//! stereo frames; they are rendered through a scratch buffer allocated at
//! open so the callback itself never allocates.

use std::sync::Arc;

use oboe::{
    AudioOutputCallback, AudioOutputStreamSafe, AudioStream, AudioStreamAsync, AudioStreamBase,
    AudioStreamBuilder, AudioStreamSafe, ChannelCount, DataCallbackResult, Output,
    PerformanceMode, Stereo, Unspecified,
};

use crate::audio::stream::NANOS_PER_SECOND;
use crate::audio::{
    FrameTimestamp, MonotonicClock, OutputStream, PlaybackCallback, Sample, SampleFormat,
    CHANNEL_COUNT,
};
use crate::error::AudioError;

use super::{AudioPlatform, PlatformStream, SharingMode, StreamRequest};

/// Largest callback the scratch buffer covers; any excess frames are silenced.
const SCRATCH_FRAMES: usize = 8192;

/// `CLOCK_MONOTONIC`, the time base of Oboe's presentation timestamps.
#[derive(Debug, Default)]
pub struct OboeClock {
    _unit: (),
}

impl MonotonicClock for OboeClock {
    fn now_nanos(&self) -> i64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid, writable timespec for the duration of the call
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        if rc != 0 {
            return 0;
        }
        ts.tv_sec as i64 * NANOS_PER_SECOND + ts.tv_nsec as i64
    }
}

/// Android backend driving Oboe output streams.
pub struct OboeBackend {
    clock: Arc<OboeClock>,
}

impl OboeBackend {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(OboeClock::default()),
        }
    }
}

impl Default for OboeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioPlatform for OboeBackend {
    fn name(&self) -> &'static str {
        "oboe"
    }

    fn open_stream(
        &self,
        request: &StreamRequest,
        callback: PlaybackCallback,
    ) -> Result<Box<dyn PlatformStream>, AudioError> {
        if request.channel_count != CHANNEL_COUNT {
            return Err(AudioError::InvalidStreamProperty {
                name: "channel_count",
                value: request.channel_count as i64,
            });
        }

        match request.format {
            SampleFormat::F32 => {
                let stream = base_builder(request)
                    .set_format::<f32>()
                    .set_channel_count::<Stereo>()
                    .set_callback(OboeCallback::<f32>::new(callback))
                    .open_stream()
                    .map_err(open_failed)?;
                Ok(Box::new(OboeStream {
                    stream,
                    format: SampleFormat::F32,
                }))
            }
            SampleFormat::I16 => {
                let stream = base_builder(request)
                    .set_format::<i16>()
                    .set_channel_count::<Stereo>()
                    .set_callback(OboeCallback::<i16>::new(callback))
                    .open_stream()
                    .map_err(open_failed)?;
                Ok(Box::new(OboeStream {
                    stream,
                    format: SampleFormat::I16,
                }))
            }
        }
    }

    fn clock(&self) -> Arc<dyn MonotonicClock> {
        self.clock.clone()
    }
}

fn base_builder(request: &StreamRequest) -> AudioStreamBuilder<Output, Unspecified, Unspecified> {
    let sharing_mode = match request.sharing_mode {
        SharingMode::Exclusive => oboe::SharingMode::Exclusive,
        SharingMode::Shared => oboe::SharingMode::Shared,
    };
    let performance_mode = if request.low_latency {
        PerformanceMode::LowLatency
    } else {
        PerformanceMode::None
    };

    AudioStreamBuilder::default()
        .set_performance_mode(performance_mode)
        .set_sharing_mode(sharing_mode)
        .set_device_id(request.device_id)
        .set_direction::<Output>()
}

fn open_failed(err: oboe::Error) -> AudioError {
    AudioError::StreamOpenFailed {
        reason: format!("Output stream: {:?}", err),
    }
}

fn map_error(err: oboe::Error, operation: &'static str) -> AudioError {
    match err {
        oboe::Error::Disconnected => AudioError::Disconnected,
        oboe::Error::Unimplemented => AudioError::Unimplemented { operation },
        other => AudioError::HardwareError {
            details: format!("{}: {:?}", operation, other),
        },
    }
}

/// Oboe data callback wrapping the engine's [`PlaybackCallback`].
struct OboeCallback<T> {
    callback: PlaybackCallback,
    scratch: Vec<T>,
}

impl<T: Sample> OboeCallback<T> {
    fn new(callback: PlaybackCallback) -> Self {
        Self {
            callback,
            scratch: vec![T::default(); SCRATCH_FRAMES * CHANNEL_COUNT as usize],
        }
    }

    fn render(
        &mut self,
        stream: &mut dyn AudioOutputStreamSafe,
        frames: &mut [(T, T)],
    ) -> DataCallbackResult {
        // Real-time audio callback - NO ALLOCATIONS, LOCKS, OR BLOCKING!
        let rendered = frames.len().min(SCRATCH_FRAMES);
        let samples = &mut self.scratch[..rendered * CHANNEL_COUNT as usize];

        let mut view = CallbackView {
            stream,
            format: T::FORMAT,
        };
        self.callback
            .on_audio_ready(&mut view, T::output_buffer(samples));

        for (frame, pair) in frames.iter_mut().zip(samples.chunks_exact(2)) {
            *frame = (pair[0], pair[1]);
        }
        for frame in frames[rendered..].iter_mut() {
            *frame = (T::default(), T::default());
        }

        DataCallbackResult::Continue
    }
}

impl AudioOutputCallback for OboeCallback<f32> {
    type FrameType = (f32, Stereo);

    fn on_error_after_close(
        &mut self,
        _stream: &mut dyn AudioOutputStreamSafe,
        error: oboe::Error,
    ) {
        self.callback.on_error(map_error(error, "stream"));
    }

    fn on_audio_ready(
        &mut self,
        stream: &mut dyn AudioOutputStreamSafe,
        frames: &mut [(f32, f32)],
    ) -> DataCallbackResult {
        self.render(stream, frames)
    }
}

impl AudioOutputCallback for OboeCallback<i16> {
    type FrameType = (i16, Stereo);

    fn on_error_after_close(
        &mut self,
        _stream: &mut dyn AudioOutputStreamSafe,
        error: oboe::Error,
    ) {
        self.callback.on_error(map_error(error, "stream"));
    }

    fn on_audio_ready(
        &mut self,
        stream: &mut dyn AudioOutputStreamSafe,
        frames: &mut [(i16, i16)],
    ) -> DataCallbackResult {
        self.render(stream, frames)
    }
}

/// The stream Oboe passes into the data callback, seen as an `OutputStream`.
struct CallbackView<'a> {
    stream: &'a mut dyn AudioOutputStreamSafe,
    format: SampleFormat,
}

impl OutputStream for CallbackView<'_> {
    fn sample_rate(&self) -> i32 {
        self.stream.get_sample_rate()
    }

    fn channel_count(&self) -> i32 {
        channel_count(self.stream.get_channel_count())
    }

    fn format(&self) -> SampleFormat {
        self.format
    }

    fn device_id(&self) -> i32 {
        self.stream.get_device_id()
    }

    fn frames_per_burst(&mut self) -> i32 {
        self.stream.get_frames_per_burst()
    }

    fn buffer_size_in_frames(&self) -> i32 {
        self.stream.get_buffer_size_in_frames()
    }

    fn buffer_capacity_in_frames(&self) -> i32 {
        self.stream.get_buffer_capacity_in_frames()
    }

    fn set_buffer_size_in_frames(&mut self, frames: i32) -> Result<i32, AudioError> {
        self.stream
            .set_buffer_size_in_frames(frames)
            .map_err(|e| map_error(e, "set_buffer_size_in_frames"))
    }

    fn xrun_count(&mut self) -> Result<i32, AudioError> {
        self.stream
            .get_xrun_count()
            .map_err(|e| map_error(e, "get_xrun_count"))
    }

    fn frames_written(&mut self) -> i64 {
        self.stream.get_frames_written()
    }

    fn timestamp(&mut self) -> Result<FrameTimestamp, AudioError> {
        self.stream
            .get_timestamp(libc::CLOCK_MONOTONIC)
            .map(|ts| FrameTimestamp {
                position: ts.position,
                nanos: ts.timestamp,
            })
            .map_err(|e| map_error(e, "get_timestamp"))
    }
}

/// Control-side handle to an open Oboe stream.
struct OboeStream<F: AudioOutputCallback> {
    stream: AudioStreamAsync<Output, F>,
    format: SampleFormat,
}

impl<F: AudioOutputCallback> OutputStream for OboeStream<F> {
    fn sample_rate(&self) -> i32 {
        self.stream.get_sample_rate()
    }

    fn channel_count(&self) -> i32 {
        channel_count(self.stream.get_channel_count())
    }

    fn format(&self) -> SampleFormat {
        self.format
    }

    fn device_id(&self) -> i32 {
        self.stream.get_device_id()
    }

    fn frames_per_burst(&mut self) -> i32 {
        self.stream.get_frames_per_burst()
    }

    fn buffer_size_in_frames(&self) -> i32 {
        self.stream.get_buffer_size_in_frames()
    }

    fn buffer_capacity_in_frames(&self) -> i32 {
        self.stream.get_buffer_capacity_in_frames()
    }

    fn set_buffer_size_in_frames(&mut self, frames: i32) -> Result<i32, AudioError> {
        self.stream
            .set_buffer_size_in_frames(frames)
            .map_err(|e| map_error(e, "set_buffer_size_in_frames"))
    }

    fn xrun_count(&mut self) -> Result<i32, AudioError> {
        self.stream
            .get_xrun_count()
            .map_err(|e| map_error(e, "get_xrun_count"))
    }

    fn frames_written(&mut self) -> i64 {
        self.stream.get_frames_written()
    }

    fn timestamp(&mut self) -> Result<FrameTimestamp, AudioError> {
        self.stream
            .get_timestamp(libc::CLOCK_MONOTONIC)
            .map(|ts| FrameTimestamp {
                position: ts.position,
                nanos: ts.timestamp,
            })
            .map_err(|e| map_error(e, "get_timestamp"))
    }
}

impl<F> PlatformStream for OboeStream<F>
where
    F: AudioOutputCallback + Send,
    AudioStreamAsync<Output, F>: Send,
{
    fn request_start(&mut self) -> Result<(), AudioError> {
        self.stream
            .request_start()
            .map_err(|e| AudioError::StreamStartFailed {
                reason: format!("{:?}", e),
            })
    }

    fn request_stop(&mut self) -> Result<(), AudioError> {
        self.stream
            .request_stop()
            .map_err(|e| AudioError::StreamStopFailed {
                reason: format!("{:?}", e),
            })
    }

    fn close(&mut self) -> Result<(), AudioError> {
        self.stream
            .close()
            .map_err(|e| AudioError::StreamCloseFailed {
                reason: format!("{:?}", e),
            })
    }
}

fn channel_count(count: ChannelCount) -> i32 {
    match count {
        ChannelCount::Mono => 1,
        _ => CHANNEL_COUNT,
    }
}
