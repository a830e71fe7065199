//! Output latency estimation from hardware presentation timestamps
//!
//! How the estimate works:
//!
//! 1. Ask the stream when a known frame was presented to the hardware.
//! 2. Extrapolate, at the stream's fixed sample rate, when the *next*
//!    frame to be written will be presented.
//! 3. Assume that next frame is written right now.
//! 4. latency = next presentation time - now.
//!
//! The result can be negative for a moment (clock jitter, bursty writes);
//! callers display it as-is.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::AudioError;

use super::stream::{
    FrameTimestamp, MonotonicClock, OutputStream, NANOS_PER_MILLISECOND, NANOS_PER_SECOND,
};

/// Pure latency arithmetic.
///
/// # Arguments
/// * `timestamp` - A presented frame and its presentation time
/// * `frames_written` - Index of the next frame to be written
/// * `sample_rate` - Stream sample rate in Hz (must be > 0)
/// * `now_nanos` - Current monotonic time, taken as the write time
///
/// # Returns
/// Latency in milliseconds between writing the next frame and its presentation
pub fn latency_millis(
    timestamp: FrameTimestamp,
    frames_written: i64,
    sample_rate: i32,
    now_nanos: i64,
) -> Result<f64, AudioError> {
    if sample_rate <= 0 {
        return Err(AudioError::InvalidStreamProperty {
            name: "sample_rate",
            value: sample_rate as i64,
        });
    }

    let frame_index_delta = frames_written - timestamp.position;
    let frame_time_delta = frame_index_delta * NANOS_PER_SECOND / sample_rate as i64;
    let next_frame_presentation_time = timestamp.nanos + frame_time_delta;

    Ok((next_frame_presentation_time - now_nanos) as f64 / NANOS_PER_MILLISECOND as f64)
}

/// Estimate the current output latency of a live stream.
///
/// # Errors
/// `TimestampUnavailable` when the hardware has not produced a timestamp
/// yet. This is expected shortly after start and is not fatal.
pub fn estimate(
    stream: &mut dyn OutputStream,
    clock: &dyn MonotonicClock,
) -> Result<f64, AudioError> {
    let timestamp = stream
        .timestamp()
        .map_err(|_| AudioError::TimestampUnavailable)?;
    let frames_written = stream.frames_written();
    latency_millis(
        timestamp,
        frames_written,
        stream.sample_rate(),
        clock.now_nanos(),
    )
}

/// Latest latency estimate, shared between the audio thread (single
/// writer) and any observer.
#[derive(Debug, Default)]
pub struct LatencyCell {
    bits: AtomicU64,
}

impl LatencyCell {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn store(&self, millis: f64) {
        self.bits.store(millis.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.store(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ten_millisecond_frame_delta() {
        // 480 frames at 48 kHz = 10,000,000 ns
        let ts = FrameTimestamp {
            position: 1000,
            nanos: 5_000_000_000,
        };
        let latency = latency_millis(ts, 1480, 48000, 5_000_000_000).unwrap();
        assert_eq!(latency, 10.0);
    }

    #[test]
    fn test_elapsed_time_reduces_latency() {
        let ts = FrameTimestamp {
            position: 0,
            nanos: 1_000_000_000,
        };
        // 960 frames ahead = 20 ms; 4 ms have passed since the timestamp
        let latency = latency_millis(ts, 960, 48000, 1_004_000_000).unwrap();
        assert_eq!(latency, 16.0);
    }

    #[test]
    fn test_latency_can_be_negative() {
        let ts = FrameTimestamp {
            position: 0,
            nanos: 0,
        };
        let latency = latency_millis(ts, 441, 44100, 15_000_000).unwrap();
        assert_eq!(latency, -5.0);
    }

    #[test]
    fn test_fractional_millis() {
        let ts = FrameTimestamp {
            position: 0,
            nanos: 0,
        };
        // 1 frame at 48 kHz = 20833 ns (integer division)
        let latency = latency_millis(ts, 1, 48000, 0).unwrap();
        assert_eq!(latency, 0.020833);
    }

    #[test]
    fn test_invalid_sample_rate() {
        let ts = FrameTimestamp {
            position: 0,
            nanos: 0,
        };
        let result = latency_millis(ts, 100, 0, 0);
        assert!(matches!(
            result,
            Err(AudioError::InvalidStreamProperty {
                name: "sample_rate",
                ..
            })
        ));
    }

    #[test]
    fn test_latency_cell_roundtrip() {
        let cell = LatencyCell::new();
        assert_eq!(cell.load(), 0.0);

        cell.store(-3.25);
        assert_eq!(cell.load(), -3.25);

        cell.reset();
        assert_eq!(cell.load(), 0.0);
    }
}
