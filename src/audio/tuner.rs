//! LatencyTuner - automatic buffer size tuning
//!
//! Seeks the smallest buffer that plays without underruns:
//! - Starts at one burst (set by the stream controller at open)
//! - Grows by one burst each time the underrun counter moves
//! - After a long underrun-free stretch, tries one burst less
//!
//! Any size that has underrun raises a floor the tuner never shrinks
//! below again, so the buffer converges instead of oscillating.
//!
//! Runs inside the data callback: no allocation, no locks, at most one
//! buffer size request per step.

use serde::Serialize;

use crate::config::TunerConfig;

use super::stream::OutputStream;

/// What a single tuning step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TuneAction {
    /// Nothing to do this step
    Idle,
    /// Buffer grew after new underruns
    Grew { from: i32, to: i32 },
    /// Buffer shrank after a quiet stretch
    Shrank { from: i32, to: i32 },
    /// Underruns observed but the buffer is already at its ceiling
    AtMaximum,
    /// Buffer dropped back to one burst after a reset request
    Reset { to: i32 },
    /// The stream cannot report underruns; tuning is disabled
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunerState {
    WarmingUp { remaining: u32 },
    Active,
    Unsupported,
}

/// Per-stream buffer size tuner.
#[derive(Debug)]
pub struct LatencyTuner {
    config: TunerConfig,
    state: TunerState,
    previous_xruns: i32,
    quiet_callbacks: u32,
    /// Smallest buffer size not yet known to underrun
    floor_frames: i32,
}

impl LatencyTuner {
    pub fn new(config: TunerConfig) -> Self {
        Self {
            state: TunerState::WarmingUp {
                remaining: config.warmup_callbacks,
            },
            config,
            previous_xruns: 0,
            quiet_callbacks: 0,
            floor_frames: 0,
        }
    }

    /// Forget everything learned and restart from one burst.
    pub fn reset(&mut self, stream: &mut dyn OutputStream) -> TuneAction {
        *self = Self::new(self.config.clone());
        let burst = stream.frames_per_burst();
        match stream.set_buffer_size_in_frames(burst) {
            Ok(actual) => TuneAction::Reset { to: actual },
            Err(_) => TuneAction::Idle,
        }
    }

    /// Run one tuning step against the live stream.
    pub fn tune(&mut self, stream: &mut dyn OutputStream) -> TuneAction {
        match self.state {
            TunerState::Unsupported => return TuneAction::Unsupported,
            TunerState::WarmingUp { remaining } if remaining > 0 => {
                self.state = TunerState::WarmingUp {
                    remaining: remaining - 1,
                };
                return TuneAction::Idle;
            }
            TunerState::WarmingUp { .. } => {
                // Warm-up glitches are not counted against the buffer
                return match stream.xrun_count() {
                    Ok(xruns) => {
                        self.previous_xruns = xruns;
                        self.state = TunerState::Active;
                        TuneAction::Idle
                    }
                    Err(_) => {
                        self.state = TunerState::Unsupported;
                        TuneAction::Unsupported
                    }
                };
            }
            TunerState::Active => {}
        }

        let xruns = match stream.xrun_count() {
            Ok(count) => count,
            Err(_) => {
                self.state = TunerState::Unsupported;
                return TuneAction::Unsupported;
            }
        };

        let burst = stream.frames_per_burst();
        if burst <= 0 {
            return TuneAction::Idle;
        }
        let current = stream.buffer_size_in_frames();

        if xruns > self.previous_xruns {
            self.previous_xruns = xruns;
            self.quiet_callbacks = 0;
            self.floor_frames = self.floor_frames.max(current + burst);

            let ceiling = self.ceiling(stream, burst);
            let requested = current + burst;
            if requested > ceiling {
                return TuneAction::AtMaximum;
            }
            return match stream.set_buffer_size_in_frames(requested) {
                Ok(actual) if actual > current => TuneAction::Grew {
                    from: current,
                    to: actual,
                },
                Ok(_) => TuneAction::AtMaximum,
                Err(_) => TuneAction::Idle,
            };
        }

        if self.config.shrink_after_quiet_callbacks == 0 {
            return TuneAction::Idle;
        }
        self.quiet_callbacks += 1;
        if self.quiet_callbacks < self.config.shrink_after_quiet_callbacks {
            return TuneAction::Idle;
        }
        self.quiet_callbacks = 0;

        let requested = current - burst;
        if requested < burst || requested < self.floor_frames {
            return TuneAction::Idle;
        }
        match stream.set_buffer_size_in_frames(requested) {
            Ok(actual) if actual < current => TuneAction::Shrank {
                from: current,
                to: actual,
            },
            _ => TuneAction::Idle,
        }
    }

    fn ceiling(&self, stream: &dyn OutputStream, burst: i32) -> i32 {
        let configured = burst.saturating_mul(self.config.max_bursts.max(1));
        let capacity = stream.buffer_capacity_in_frames();
        if capacity > 0 {
            configured.min(capacity)
        } else {
            configured
        }
    }

    /// Smallest buffer size the tuner will still consider.
    pub fn floor_frames(&self) -> i32 {
        self.floor_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::SampleFormat;
    use crate::audio::stream::FrameTimestamp;
    use crate::error::AudioError;

    struct FakeStream {
        burst: i32,
        buffer_size: i32,
        capacity: i32,
        xruns: Option<i32>,
        set_calls: u32,
    }

    impl FakeStream {
        fn new(burst: i32, capacity: i32) -> Self {
            Self {
                burst,
                buffer_size: burst,
                capacity,
                xruns: Some(0),
                set_calls: 0,
            }
        }
    }

    impl OutputStream for FakeStream {
        fn sample_rate(&self) -> i32 {
            48000
        }
        fn channel_count(&self) -> i32 {
            2
        }
        fn format(&self) -> SampleFormat {
            SampleFormat::F32
        }
        fn device_id(&self) -> i32 {
            1
        }
        fn frames_per_burst(&mut self) -> i32 {
            self.burst
        }
        fn buffer_size_in_frames(&self) -> i32 {
            self.buffer_size
        }
        fn buffer_capacity_in_frames(&self) -> i32 {
            self.capacity
        }
        fn set_buffer_size_in_frames(&mut self, frames: i32) -> Result<i32, AudioError> {
            self.set_calls += 1;
            self.buffer_size = frames.clamp(1, self.capacity);
            Ok(self.buffer_size)
        }
        fn xrun_count(&mut self) -> Result<i32, AudioError> {
            self.xruns.ok_or(AudioError::Unimplemented {
                operation: "xrun_count",
            })
        }
        fn frames_written(&mut self) -> i64 {
            0
        }
        fn timestamp(&mut self) -> Result<FrameTimestamp, AudioError> {
            Err(AudioError::TimestampUnavailable)
        }
    }

    fn config(warmup: u32, shrink_after: u32) -> TunerConfig {
        TunerConfig {
            warmup_callbacks: warmup,
            shrink_after_quiet_callbacks: shrink_after,
            max_bursts: 8,
        }
    }

    fn add_xrun(stream: &mut FakeStream) {
        stream.xruns = stream.xruns.map(|n| n + 1);
    }

    #[test]
    fn test_warmup_ignores_startup_underruns() {
        let mut stream = FakeStream::new(96, 2000);
        let mut tuner = LatencyTuner::new(config(3, 0));

        for _ in 0..3 {
            add_xrun(&mut stream);
            assert_eq!(tuner.tune(&mut stream), TuneAction::Idle);
        }
        // Baseline captured here, including the warm-up underruns
        assert_eq!(tuner.tune(&mut stream), TuneAction::Idle);
        assert_eq!(tuner.tune(&mut stream), TuneAction::Idle);
        assert_eq!(stream.buffer_size, 96);
        assert_eq!(stream.set_calls, 0);
    }

    #[test]
    fn test_sustained_underruns_grow_buffer() {
        let mut stream = FakeStream::new(96, 2000);
        let mut tuner = LatencyTuner::new(config(0, 0));
        tuner.tune(&mut stream);

        for step in 1..=4 {
            add_xrun(&mut stream);
            let action = tuner.tune(&mut stream);
            assert_eq!(
                action,
                TuneAction::Grew {
                    from: 96 * step,
                    to: 96 * (step + 1)
                }
            );
        }
        assert_eq!(stream.buffer_size, 96 * 5);
    }

    #[test]
    fn test_growth_stops_at_ceiling() {
        let mut stream = FakeStream::new(100, 250);
        let mut tuner = LatencyTuner::new(config(0, 0));
        tuner.tune(&mut stream);

        add_xrun(&mut stream);
        assert_eq!(
            tuner.tune(&mut stream),
            TuneAction::Grew { from: 100, to: 200 }
        );
        add_xrun(&mut stream);
        assert_eq!(tuner.tune(&mut stream), TuneAction::AtMaximum);
        assert_eq!(stream.buffer_size, 200);
    }

    #[test]
    fn test_one_request_per_step() {
        let mut stream = FakeStream::new(64, 4096);
        let mut tuner = LatencyTuner::new(config(0, 1));
        tuner.tune(&mut stream);

        stream.xruns = Some(10);
        stream.set_calls = 0;
        tuner.tune(&mut stream);
        assert_eq!(stream.set_calls, 1);
    }

    #[test]
    fn test_shrinks_after_quiet_stretch_but_not_below_floor() {
        let mut stream = FakeStream::new(100, 2000);
        let mut tuner = LatencyTuner::new(config(0, 5));
        tuner.tune(&mut stream);

        // Underrun at 100 frames: floor becomes 200
        add_xrun(&mut stream);
        tuner.tune(&mut stream);
        // Underrun at 200 frames: floor becomes 300
        add_xrun(&mut stream);
        tuner.tune(&mut stream);
        // Underrun at 300 frames: floor becomes 400
        add_xrun(&mut stream);
        tuner.tune(&mut stream);
        assert_eq!(stream.buffer_size, 400);
        assert_eq!(tuner.floor_frames(), 400);

        // Quiet period: 400 - 100 = 300 < floor 400, so no shrink
        for _ in 0..20 {
            assert_eq!(tuner.tune(&mut stream), TuneAction::Idle);
        }
        assert_eq!(stream.buffer_size, 400);
    }

    #[test]
    fn test_no_oscillation_under_steady_load() {
        let mut stream = FakeStream::new(100, 2000);
        let mut tuner = LatencyTuner::new(config(0, 3));
        tuner.tune(&mut stream);

        // Manually oversize the buffer, then let it shrink
        stream.buffer_size = 500;
        let mut sizes = Vec::new();
        for _ in 0..30 {
            // Anything below 300 frames underruns
            if stream.buffer_size < 300 {
                add_xrun(&mut stream);
            }
            tuner.tune(&mut stream);
            sizes.push(stream.buffer_size);
        }

        // Converges to 300 and stays there
        assert_eq!(*sizes.last().unwrap(), 300);
        let tail = &sizes[sizes.len() - 10..];
        assert!(tail.iter().all(|&size| size == 300), "sizes: {:?}", sizes);
    }

    #[test]
    fn test_unsupported_xruns_disable_tuning() {
        let mut stream = FakeStream::new(96, 2000);
        stream.xruns = None;
        let mut tuner = LatencyTuner::new(config(0, 1));

        assert_eq!(tuner.tune(&mut stream), TuneAction::Unsupported);
        assert_eq!(tuner.tune(&mut stream), TuneAction::Unsupported);
        assert_eq!(stream.set_calls, 0);
    }

    #[test]
    fn test_reset_returns_to_one_burst() {
        let mut stream = FakeStream::new(96, 2000);
        let mut tuner = LatencyTuner::new(config(0, 0));
        tuner.tune(&mut stream);
        add_xrun(&mut stream);
        tuner.tune(&mut stream);
        assert_eq!(stream.buffer_size, 192);

        assert_eq!(tuner.reset(&mut stream), TuneAction::Reset { to: 96 });
        assert_eq!(tuner.floor_frames(), 0);
        assert_eq!(stream.buffer_size, 96);
    }
}
