//! Backend abstractions for the playback engine.
//!
//! A backend opens platform output streams, binds a [`PlaybackCallback`] to
//! each, and supplies the monotonic clock its presentation timestamps use.

use std::sync::Arc;

use serde::Serialize;

use crate::audio::{MonotonicClock, OutputStream, PlaybackCallback, SampleFormat};
use crate::config::AppConfig;
use crate::error::AudioError;

/// How the stream shares the output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SharingMode {
    /// Request exclusive access; platforms fall back to shared if refused
    Exclusive,
    Shared,
}

/// Everything a backend needs to open one output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    /// 0 lets the platform choose
    pub device_id: i32,
    pub channel_count: i32,
    pub format: SampleFormat,
    pub sharing_mode: SharingMode,
    pub low_latency: bool,
}

/// Snapshot of an open stream's properties.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInfo {
    pub backend: &'static str,
    pub device_id: i32,
    pub sample_rate: i32,
    pub channel_count: i32,
    pub format: SampleFormat,
    pub frames_per_burst: i32,
    pub buffer_size_in_frames: i32,
    pub buffer_capacity_in_frames: i32,
    pub timestamps_supported: bool,
}

/// Control-side handle to an open platform stream.
///
/// Dropping a handle without calling `close` must still release it.
pub trait PlatformStream: OutputStream + Send {
    fn request_start(&mut self) -> Result<(), AudioError>;
    fn request_stop(&mut self) -> Result<(), AudioError>;
    fn close(&mut self) -> Result<(), AudioError>;
}

/// Trait implemented by platform-specific audio backends.
pub trait AudioPlatform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open (but do not start) an output stream that calls `callback`.
    fn open_stream(
        &self,
        request: &StreamRequest,
        callback: PlaybackCallback,
    ) -> Result<Box<dyn PlatformStream>, AudioError>;

    /// Clock sharing a time base with this backend's timestamps.
    fn clock(&self) -> Arc<dyn MonotonicClock>;
}

#[cfg(target_os = "android")]
mod oboe;
#[cfg(target_os = "android")]
pub use self::oboe::{OboeBackend, OboeClock};

#[cfg(not(target_os = "android"))]
mod cpal;
#[cfg(not(target_os = "android"))]
pub use self::cpal::{CpalBackend, InstantClock};

mod simulated;
pub use simulated::{
    ManualClock, RenderedBuffer, SimulatedBackend, SimulatedControls, DEFAULT_DEVICE_ID,
};

/// Platform backend for the current target.
pub fn default_platform(config: &AppConfig) -> Arc<dyn AudioPlatform> {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "android")] {
            let _ = config;
            Arc::new(OboeBackend::new())
        } else {
            Arc::new(CpalBackend::new(config.stream.desktop_frames_per_burst))
        }
    }
}
