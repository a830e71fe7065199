//! Sine oscillator used as the engine's frame renderer
//!
//! Each oscillator owns one channel of the interleaved output. The phase
//! carries over between `render` calls so consecutive buffers join without
//! clicks. Rendering performs no allocation and is safe for the audio thread.

use std::f64::consts::TAU;

use super::format::Sample;

/// Phase-accumulating sine generator writing one channel of an interleaved buffer.
#[derive(Debug, Clone)]
pub struct SineOscillator {
    phase: f64,
    phase_increment: f64,
    amplitude: f64,
}

impl SineOscillator {
    /// Create an oscillator for the given stream sample rate.
    ///
    /// # Arguments
    /// * `frequency_hz` - Tone frequency
    /// * `sample_rate` - Stream sample rate in Hz (must be > 0)
    /// * `amplitude` - Peak amplitude in [0.0, 1.0]
    pub fn new(frequency_hz: f64, sample_rate: i32, amplitude: f64) -> Self {
        let sample_rate = sample_rate.max(1) as f64;
        Self {
            phase: 0.0,
            phase_increment: frequency_hz * TAU / sample_rate,
            amplitude: amplitude.clamp(0.0, 1.0),
        }
    }

    /// Write `frame_count` samples starting at `buffer[0]`, advancing by
    /// `stride` samples per frame.
    ///
    /// Samples between the strided positions are left untouched. Writing
    /// stops early if the buffer runs out.
    pub fn render<S: Sample>(&mut self, buffer: &mut [S], stride: usize, frame_count: usize) {
        for slot in buffer.iter_mut().step_by(stride.max(1)).take(frame_count) {
            *slot = S::from_normalized((self.phase.sin() * self.amplitude) as f32);
            self.advance();
        }
    }

    #[inline]
    fn advance(&mut self) {
        self.phase += self.phase_increment;
        if self.phase >= TAU {
            self.phase -= TAU;
        }
    }

    pub fn phase(&self) -> f64 {
        self.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_respects_stride() {
        let mut osc = SineOscillator::new(1000.0, 48000, 0.5);
        let mut buffer = [9.0f32; 8];

        osc.render(&mut buffer, 2, 4);

        // Odd slots belong to the other channel and must be untouched
        for i in (1..8).step_by(2) {
            assert_eq!(buffer[i], 9.0, "slot {} should be untouched", i);
        }
        // First sample is sin(0) = 0
        assert_eq!(buffer[0], 0.0);
        assert!(buffer[2] > 0.0);
    }

    #[test]
    fn test_amplitude_bounds() {
        let mut osc = SineOscillator::new(440.0, 48000, 0.25);
        let mut buffer = [0.0f32; 4800];

        osc.render(&mut buffer, 1, 4800);

        let peak = buffer.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
        assert!(peak <= 0.25 + f32::EPSILON);
        assert!(peak > 0.24, "peak {} should approach amplitude", peak);
    }

    #[test]
    fn test_phase_continues_between_renders() {
        let mut split = SineOscillator::new(660.0, 44100, 0.25);
        let mut whole = split.clone();

        let mut first = [0.0f32; 32];
        let mut second = [0.0f32; 32];
        split.render(&mut first, 1, 32);
        split.render(&mut second, 1, 32);

        let mut combined = [0.0f32; 64];
        whole.render(&mut combined, 1, 64);

        assert_eq!(&combined[..32], &first[..]);
        assert_eq!(&combined[32..], &second[..]);
    }

    #[test]
    fn test_phase_wraps() {
        let mut osc = SineOscillator::new(12000.0, 48000, 1.0);
        let mut buffer = [0.0f32; 1000];
        osc.render(&mut buffer, 1, 1000);
        assert!(osc.phase() >= 0.0 && osc.phase() < TAU);
    }

    #[test]
    fn test_render_i16() {
        let mut osc = SineOscillator::new(1000.0, 8000, 1.0);
        let mut buffer = [0i16; 4];
        osc.render(&mut buffer, 1, 4);
        // sin(pi/4 * k) at full scale: 0, 0.707, 1.0, 0.707
        assert_eq!(buffer[0], 0);
        assert!(buffer[2] > 32000);
    }

    #[test]
    fn test_render_stops_at_buffer_end() {
        let mut osc = SineOscillator::new(440.0, 48000, 0.5);
        let mut buffer = [0.0f32; 6];
        // Asking for more frames than fit must not panic
        osc.render(&mut buffer[1..], 2, 100);
    }
}
