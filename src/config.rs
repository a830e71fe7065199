//! Configuration management for the playback engine
//!
//! Loads stream, tone, tuner and diagnostics settings from a JSON file so
//! they can be adjusted without recompilation. Every section has defaults
//! and missing fields fall back to them.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::audio::format::SampleFormat;

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub stream: StreamConfig,
    pub tone: ToneConfig,
    pub tuner: TunerConfig,
    pub diagnostics: DiagnosticsConfig,
}

/// Output stream request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Device to open (0 = platform default)
    pub device_id: i32,
    /// Buffer size in bursts (0 or negative = automatic tuning)
    pub buffer_size_in_bursts: i32,
    /// Sample format requested from the platform
    pub sample_format: SampleFormat,
    /// Burst size used by backends that cannot report one
    pub desktop_frames_per_burst: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            buffer_size_in_bursts: 0,
            sample_format: SampleFormat::F32,
            desktop_frames_per_burst: 256,
        }
    }
}

/// Test tone parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneConfig {
    pub left_frequency_hz: f64,
    pub right_frequency_hz: f64,
    /// Peak amplitude in [0.0, 1.0]
    pub amplitude: f64,
    /// Whether the tone plays as soon as the stream starts
    pub enabled: bool,
}

impl Default for ToneConfig {
    fn default() -> Self {
        Self {
            left_frequency_hz: 440.0,
            right_frequency_hz: 660.0,
            amplitude: 0.25,
            enabled: false,
        }
    }
}

/// Automatic buffer size tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    /// Callbacks ignored after start while the stream settles
    pub warmup_callbacks: u32,
    /// Consecutive underrun-free callbacks before trying one burst less
    /// (0 disables shrinking)
    pub shrink_after_quiet_callbacks: u32,
    /// Upper bound on the tuned buffer size, in bursts
    pub max_bursts: i32,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            warmup_callbacks: 8,
            shrink_after_quiet_callbacks: 4000,
            max_bursts: 16,
        }
    }
}

/// Diagnostics plumbing sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Capacity of the lock-free callback trace ring
    pub trace_capacity: usize,
    /// Number of engine events kept for snapshots
    pub telemetry_history: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            trace_capacity: 256,
            telemetry_history: 64,
        }
    }
}

impl AppConfig {
    /// Load configuration from JSON file
    ///
    /// # Arguments
    /// * `path` - Path to JSON config file
    ///
    /// # Returns
    /// The parsed configuration, or the defaults when the file is missing
    /// or holds invalid JSON (a warning is logged either way).
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("[Config] Loaded configuration from {:?}", path.as_ref());
                    config
                }
                Err(err) => {
                    tracing::warn!(
                        "[Config] Failed to parse JSON from {:?}: {}. Using defaults.",
                        path.as_ref(),
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                tracing::warn!(
                    "[Config] Failed to read config file {:?}: {}. Using defaults.",
                    path.as_ref(),
                    err
                );
                Self::default()
            }
        }
    }

    /// Android builds ship without a config file on disk; use defaults.
    #[cfg(target_os = "android")]
    pub fn load_android() -> Self {
        tracing::info!("[Config] Using default configuration on Android");
        Self::default()
    }

    /// Load configuration for non-Android platforms
    #[cfg(not(target_os = "android"))]
    pub fn load() -> Self {
        Self::load_from_file("assets/engine_config.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.stream.device_id, 0);
        assert_eq!(config.stream.buffer_size_in_bursts, 0);
        assert_eq!(config.stream.sample_format, SampleFormat::F32);
        assert_eq!(config.tone.left_frequency_hz, 440.0);
        assert_eq!(config.tone.right_frequency_hz, 660.0);
        assert_eq!(config.tone.amplitude, 0.25);
        assert!(!config.tone.enabled);
        assert_eq!(config.tuner.max_bursts, 16);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "stream": { "buffer_size_in_bursts": 3, "sample_format": "i16" } }"#;
        let parsed: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(parsed.stream.buffer_size_in_bursts, 3);
        assert_eq!(parsed.stream.sample_format, SampleFormat::I16);
        assert_eq!(parsed.stream.desktop_frames_per_burst, 256);
        assert_eq!(parsed.tone.right_frequency_hz, 660.0);
        assert_eq!(parsed.diagnostics.trace_capacity, 256);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = AppConfig::load_from_file("/nonexistent/engine_config.json");
        assert_eq!(config.tuner.warmup_callbacks, 8);
    }

    #[test]
    fn test_invalid_json_falls_back_to_defaults() {
        let path = std::env::temp_dir().join(format!(
            "tone_engine_bad_config_{}.json",
            std::process::id()
        ));
        {
            let mut file = fs::File::create(&path).unwrap();
            file.write_all(b"{ not json").unwrap();
        }

        let config = AppConfig::load_from_file(&path);
        assert_eq!(config.stream.desktop_frames_per_burst, 256);

        let _ = fs::remove_file(&path);
    }
}
