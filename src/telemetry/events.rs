//! Engine event types exposed to subscribers and the CLI.

use serde::{Deserialize, Serialize};

/// Telemetry event emitted by the playback engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineEvent {
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub kind: EngineEventKind,
}

/// Lifecycle and configuration changes reported by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EngineEventKind {
    StreamOpened {
        device_id: i32,
        sample_rate: i32,
        frames_per_burst: i32,
        buffer_size_in_frames: i32,
        timestamps_supported: bool,
    },
    StreamOpenFailed {
        code: i32,
        reason: String,
    },
    StreamClosed {
        device_id: i32,
    },
    DeviceDisconnected,
    RestartCompleted,
    RestartDropped,
    DeviceRequested {
        device_id: i32,
    },
    BufferModeChanged {
        /// 0 = automatic tuning
        bursts: i32,
    },
    ToneToggled {
        enabled: bool,
    },
    TunerReset,
    Latency {
        avg_ms: f64,
        max_ms: f64,
        sample_count: usize,
    },
}
