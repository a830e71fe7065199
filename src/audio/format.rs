//! Sample formats and the interleaved output buffer handed to the callback.

use serde::{Deserialize, Serialize};

/// The engine always plays stereo.
pub const CHANNEL_COUNT: i32 = 2;

/// PCM sample formats the engine can render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// 32-bit float in [-1.0, 1.0]
    F32,
    /// Signed 16-bit integer
    I16,
}

impl SampleFormat {
    /// Width of one sample in bytes.
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::F32 => std::mem::size_of::<f32>(),
            SampleFormat::I16 => std::mem::size_of::<i16>(),
        }
    }
}

/// A PCM sample type the frame renderer can write.
pub trait Sample: Copy + Default + Send + 'static {
    const FORMAT: SampleFormat;

    /// Convert a normalized value in [-1.0, 1.0].
    fn from_normalized(value: f32) -> Self;

    /// Wrap a platform buffer of this sample type.
    fn output_buffer(samples: &mut [Self]) -> OutputBuffer<'_>;
}

impl Sample for f32 {
    const FORMAT: SampleFormat = SampleFormat::F32;

    #[inline]
    fn from_normalized(value: f32) -> Self {
        value
    }

    #[inline]
    fn output_buffer(samples: &mut [Self]) -> OutputBuffer<'_> {
        OutputBuffer::F32(samples)
    }
}

impl Sample for i16 {
    const FORMAT: SampleFormat = SampleFormat::I16;

    #[inline]
    fn from_normalized(value: f32) -> Self {
        (value.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
    }

    #[inline]
    fn output_buffer(samples: &mut [Self]) -> OutputBuffer<'_> {
        OutputBuffer::I16(samples)
    }
}

/// Interleaved output buffer supplied by the platform for one callback.
pub enum OutputBuffer<'a> {
    F32(&'a mut [f32]),
    I16(&'a mut [i16]),
}

impl OutputBuffer<'_> {
    pub fn format(&self) -> SampleFormat {
        match self {
            OutputBuffer::F32(_) => SampleFormat::F32,
            OutputBuffer::I16(_) => SampleFormat::I16,
        }
    }

    /// Number of samples (not frames) in the buffer.
    pub fn len(&self) -> usize {
        match self {
            OutputBuffer::F32(samples) => samples.len(),
            OutputBuffer::I16(samples) => samples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the buffer in bytes.
    pub fn byte_len(&self) -> usize {
        self.len() * self.format().bytes_per_sample()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_per_sample() {
        assert_eq!(SampleFormat::F32.bytes_per_sample(), 4);
        assert_eq!(SampleFormat::I16.bytes_per_sample(), 2);
    }

    #[test]
    fn test_i16_conversion_clamps() {
        assert_eq!(i16::from_normalized(0.0), 0);
        assert_eq!(i16::from_normalized(1.0), i16::MAX);
        assert_eq!(i16::from_normalized(2.0), i16::MAX);
        assert_eq!(i16::from_normalized(-1.0), -i16::MAX);
    }

    #[test]
    fn test_output_buffer_byte_len() {
        let mut floats = [0.0f32; 8];
        let buffer = OutputBuffer::F32(&mut floats);
        assert_eq!(buffer.format(), SampleFormat::F32);
        assert_eq!(buffer.byte_len(), 32);

        let mut ints = [0i16; 8];
        let buffer = i16::output_buffer(&mut ints);
        assert_eq!(buffer.format(), SampleFormat::I16);
        assert_eq!(buffer.byte_len(), 16);
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&SampleFormat::I16).unwrap();
        assert_eq!(json, "\"i16\"");
        let parsed: SampleFormat = serde_json::from_str("\"f32\"").unwrap();
        assert_eq!(parsed, SampleFormat::F32);
    }
}
