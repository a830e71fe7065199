// Audio module - real-time side of the playback engine

pub mod callback;
pub mod format;
pub mod latency;
pub mod oscillator;
pub mod stream;
pub mod trace;
pub mod tuner;

// Re-export commonly used types for convenience
pub use callback::{
    BufferSizeMode, CallbackContext, CallbackResult, EngineConfig, PlaybackCallback,
    StreamErrorHandler,
};
pub use format::{OutputBuffer, Sample, SampleFormat, CHANNEL_COUNT};
pub use latency::LatencyCell;
pub use oscillator::SineOscillator;
pub use stream::{FrameTimestamp, MonotonicClock, OutputStream};
pub use trace::{trace_channel, CallbackTrace, TraceReader, TraceWriter};
pub use tuner::{LatencyTuner, TuneAction};
