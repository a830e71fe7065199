//! The view of a live output stream that real-time code is allowed to touch.
//!
//! Backends implement [`OutputStream`] over whatever native handle the
//! platform passes into its data callback. Every method must be
//! non-blocking: they are called from the audio thread.

use crate::error::AudioError;

use super::format::SampleFormat;

pub const NANOS_PER_SECOND: i64 = 1_000_000_000;
pub const NANOS_PER_MILLISECOND: i64 = 1_000_000;

/// A frame index paired with the monotonic time it was presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTimestamp {
    /// Index of a frame that has already been presented
    pub position: i64,
    /// Monotonic clock time of that presentation, in nanoseconds
    pub nanos: i64,
}

/// Accessors a platform stream exposes to the data callback.
pub trait OutputStream {
    fn sample_rate(&self) -> i32;
    fn channel_count(&self) -> i32;
    fn format(&self) -> SampleFormat;
    fn device_id(&self) -> i32;

    /// Hardware-determined minimum chunk size in frames.
    fn frames_per_burst(&mut self) -> i32;

    fn buffer_size_in_frames(&self) -> i32;
    fn buffer_capacity_in_frames(&self) -> i32;

    /// Request a new buffer size. The platform may clamp it; the returned
    /// value is the size actually applied.
    fn set_buffer_size_in_frames(&mut self, frames: i32) -> Result<i32, AudioError>;

    /// Cumulative underrun count since the stream started.
    fn xrun_count(&mut self) -> Result<i32, AudioError>;

    /// Index of the next frame to be written.
    fn frames_written(&mut self) -> i64;

    /// Latest presentation timestamp on the monotonic clock.
    fn timestamp(&mut self) -> Result<FrameTimestamp, AudioError>;
}

/// Monotonic clock in the same time base as the platform's timestamps.
pub trait MonotonicClock: Send + Sync {
    fn now_nanos(&self) -> i64;
}
