// Audio error types and constants

use crate::error::ErrorCode;
use log::error;
use std::fmt;

/// Audio error code constants
///
/// These constants provide a single source of truth for error codes
/// shared with the host application across the FFI boundary.
///
/// Error code range: 2001-2012
pub struct AudioErrorCodes {}

impl AudioErrorCodes {
    /// Platform refused to open an output stream
    pub const STREAM_OPEN_FAILED: i32 = 2001;

    /// Stream opened but could not be started
    pub const STREAM_START_FAILED: i32 = 2002;

    /// Stream stop request failed
    pub const STREAM_STOP_FAILED: i32 = 2003;

    /// Stream close request failed
    pub const STREAM_CLOSE_FAILED: i32 = 2004;

    /// Output device disappeared mid-stream
    pub const DISCONNECTED: i32 = 2005;

    /// No presentation timestamp available yet
    pub const TIMESTAMP_UNAVAILABLE: i32 = 2006;

    /// Platform does not implement the requested operation
    pub const UNIMPLEMENTED: i32 = 2007;

    /// A stream restart is already running
    pub const RESTART_IN_PROGRESS: i32 = 2008;

    /// Operation needs an open stream but none is installed
    pub const NO_ACTIVE_STREAM: i32 = 2009;

    /// Stream reported a property value the engine cannot use
    pub const INVALID_STREAM_PROPERTY: i32 = 2010;

    /// Mutex/RwLock was poisoned
    pub const LOCK_POISONED: i32 = 2011;

    /// Any other hardware or host error
    pub const HARDWARE_ERROR: i32 = 2012;
}

/// Log an audio error with structured context
///
/// Emits one line carrying the numeric code, the component and the
/// human-readable message. Never call this from the data callback.
pub fn log_audio_error(err: &AudioError, context: &str) {
    error!(
        "Audio error in {}: code={}, component=PlaybackEngine, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Audio-related errors
///
/// These errors cover stream lifecycle, device loss, latency measurement
/// and restart coordination.
///
/// Error code range: 2001-2012
#[derive(Debug, Clone, PartialEq)]
pub enum AudioError {
    /// Platform refused to open an output stream
    StreamOpenFailed { reason: String },

    /// Stream opened but could not be started
    StreamStartFailed { reason: String },

    /// Stream stop request failed
    StreamStopFailed { reason: String },

    /// Stream close request failed
    StreamCloseFailed { reason: String },

    /// Output device disappeared mid-stream
    Disconnected,

    /// No presentation timestamp available yet (normal right after start)
    TimestampUnavailable,

    /// Platform does not implement the requested operation
    Unimplemented { operation: &'static str },

    /// Stream start refused while a restart is rebuilding the stream
    RestartInProgress,

    /// Operation needs an open stream but none is installed
    NoActiveStream,

    /// Stream reported a property value the engine cannot use
    InvalidStreamProperty { name: &'static str, value: i64 },

    /// Mutex/RwLock was poisoned
    LockPoisoned { component: String },

    /// Any other hardware or host error
    HardwareError { details: String },
}

impl ErrorCode for AudioError {
    fn code(&self) -> i32 {
        match self {
            AudioError::StreamOpenFailed { .. } => AudioErrorCodes::STREAM_OPEN_FAILED,
            AudioError::StreamStartFailed { .. } => AudioErrorCodes::STREAM_START_FAILED,
            AudioError::StreamStopFailed { .. } => AudioErrorCodes::STREAM_STOP_FAILED,
            AudioError::StreamCloseFailed { .. } => AudioErrorCodes::STREAM_CLOSE_FAILED,
            AudioError::Disconnected => AudioErrorCodes::DISCONNECTED,
            AudioError::TimestampUnavailable => AudioErrorCodes::TIMESTAMP_UNAVAILABLE,
            AudioError::Unimplemented { .. } => AudioErrorCodes::UNIMPLEMENTED,
            AudioError::RestartInProgress => AudioErrorCodes::RESTART_IN_PROGRESS,
            AudioError::NoActiveStream => AudioErrorCodes::NO_ACTIVE_STREAM,
            AudioError::InvalidStreamProperty { .. } => AudioErrorCodes::INVALID_STREAM_PROPERTY,
            AudioError::LockPoisoned { .. } => AudioErrorCodes::LOCK_POISONED,
            AudioError::HardwareError { .. } => AudioErrorCodes::HARDWARE_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            AudioError::StreamOpenFailed { reason } => {
                format!("Failed to open output stream: {}", reason)
            }
            AudioError::StreamStartFailed { reason } => {
                format!("Failed to start output stream: {}", reason)
            }
            AudioError::StreamStopFailed { reason } => {
                format!("Failed to stop output stream: {}", reason)
            }
            AudioError::StreamCloseFailed { reason } => {
                format!("Failed to close output stream: {}", reason)
            }
            AudioError::Disconnected => "Output device disconnected".to_string(),
            AudioError::TimestampUnavailable => {
                "Presentation timestamp not available yet".to_string()
            }
            AudioError::Unimplemented { operation } => {
                format!("Operation not supported by this platform: {}", operation)
            }
            AudioError::RestartInProgress => {
                "Stream restart already in progress".to_string()
            }
            AudioError::NoActiveStream => "No output stream is open".to_string(),
            AudioError::InvalidStreamProperty { name, value } => {
                format!("Stream reported invalid {}: {}", name, value)
            }
            AudioError::LockPoisoned { component } => {
                format!("Lock poisoned on {}", component)
            }
            AudioError::HardwareError { details } => {
                format!("Hardware error: {}", details)
            }
        }
    }
}

impl fmt::Display for AudioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AudioError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for AudioError {}

impl From<std::io::Error> for AudioError {
    fn from(err: std::io::Error) -> Self {
        AudioError::HardwareError {
            details: err.to_string(),
        }
    }
}
