//! PlaybackEngine: the public face of the tone engine.
//!
//! Composes the stream controller, the restart worker and the shared
//! [`EngineConfig`]. Setters only touch atomics, except `set_device_id`,
//! which may restart the stream on the calling thread.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::audio::{BufferSizeMode, CallbackTrace, EngineConfig};
use crate::config::AppConfig;
use crate::error::AudioError;
use crate::telemetry::{EngineEvent, EngineEventKind, TelemetryCollector, TelemetrySnapshot};

use super::backend::{default_platform, AudioPlatform, StreamInfo};
use super::controller::{RestartOutcome, StreamController};
use super::restart::{restart_channel, RestartWorker};

/// Low-latency stereo tone player with automatic recovery from device loss.
///
/// # Example
/// ```ignore
/// let engine = PlaybackEngine::new(AppConfig::load())?;
/// engine.start()?;
/// engine.set_tone_on(true);
/// println!("{:.2} ms", engine.current_output_latency_millis());
/// ```
pub struct PlaybackEngine {
    controller: Arc<StreamController>,
    config: Arc<EngineConfig>,
    telemetry: Arc<TelemetryCollector>,
    worker: RestartWorker,
}

impl PlaybackEngine {
    /// Create an engine on the current platform's default backend.
    pub fn new(app_config: AppConfig) -> Result<Self, AudioError> {
        let platform = default_platform(&app_config);
        Self::with_platform(platform, app_config)
    }

    /// Create an engine on an explicit backend. No stream is opened yet.
    pub fn with_platform(
        platform: Arc<dyn AudioPlatform>,
        app_config: AppConfig,
    ) -> Result<Self, AudioError> {
        let config = Arc::new(EngineConfig::new(
            app_config.stream.device_id,
            BufferSizeMode::from_bursts(app_config.stream.buffer_size_in_bursts),
            app_config.tone.enabled,
        ));
        let telemetry = Arc::new(TelemetryCollector::new(
            256,
            app_config.diagnostics.telemetry_history,
        ));
        let (restart_tx, restart_rx) = restart_channel();

        let controller = Arc::new(StreamController::new(
            platform,
            Arc::clone(&config),
            app_config,
            Arc::clone(&telemetry),
            restart_tx,
        ));
        let worker = RestartWorker::spawn(Arc::downgrade(&controller), restart_rx)?;

        Ok(Self {
            controller,
            config,
            telemetry,
            worker,
        })
    }

    /// Open and start the output stream.
    ///
    /// Fails with [`AudioError::RestartInProgress`] while a restart is
    /// rebuilding the stream.
    pub fn start(&self) -> Result<StreamInfo, AudioError> {
        self.controller.start()
    }

    /// Stop and close the output stream. Safe to call repeatedly.
    pub fn close(&self) {
        self.controller.close();
    }

    /// Tear down and recreate the stream; dropped if one is already running.
    pub fn restart(&self) -> Result<RestartOutcome, AudioError> {
        self.controller.restart()
    }

    /// Select the output device (0 = platform default).
    ///
    /// Returns `None` when the live stream already plays on that device.
    pub fn set_device_id(&self, device_id: i32) -> Result<Option<RestartOutcome>, AudioError> {
        self.controller.set_device_id(device_id)
    }

    /// Takes effect on the next callback.
    pub fn set_tone_on(&self, tone_on: bool) {
        self.config.set_tone_on(tone_on);
        self.telemetry
            .publish(EngineEventKind::ToneToggled { enabled: tone_on });
    }

    /// Fix the buffer at `bursts` bursts, or tune automatically when
    /// `bursts <= 0`.
    pub fn set_buffer_size_in_bursts(&self, bursts: i32) {
        let mode = BufferSizeMode::from_bursts(bursts);
        self.config.set_buffer_size_mode(mode);
        tracing::debug!(?mode, "[PlaybackEngine] Buffer size mode changed");
        self.telemetry.publish(EngineEventKind::BufferModeChanged {
            bursts: mode.as_bursts(),
        });
    }

    pub fn buffer_size_mode(&self) -> BufferSizeMode {
        self.config.buffer_size_mode()
    }

    pub fn is_tone_on(&self) -> bool {
        self.config.is_tone_on()
    }

    /// Most recent latency estimate; 0.0 until the stream produces one.
    pub fn current_output_latency_millis(&self) -> f64 {
        self.controller.latency().load()
    }

    /// Publish the current latency into the telemetry rolling window.
    pub fn sample_latency(&self) -> f64 {
        let latency = self.current_output_latency_millis();
        self.telemetry.record_latency(latency);
        latency
    }

    /// Restart automatic tuning from one burst on the next callback.
    pub fn reset_latency_tuner(&self) {
        self.config.request_tuner_reset();
        self.telemetry.publish(EngineEventKind::TunerReset);
    }

    pub fn stream_info(&self) -> Option<StreamInfo> {
        self.controller.stream_info()
    }

    pub fn is_running(&self) -> bool {
        self.controller.is_open()
    }

    /// A restart is queued for the worker or rebuilding the stream.
    pub fn restart_in_progress(&self) -> bool {
        self.controller.restart_in_progress()
    }

    pub fn drain_callback_traces(&self) -> Vec<CallbackTrace> {
        self.controller.drain_callback_traces()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.telemetry.subscribe()
    }

    pub fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        // Closing drops the callback's restart sender; with the controller's
        // own sender gone too, the worker's queue closes and it exits
        self.controller.shutdown();
        self.worker.join();
        tracing::debug!("[PlaybackEngine] Shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::backend::SimulatedBackend;

    fn engine() -> PlaybackEngine {
        PlaybackEngine::with_platform(Arc::new(SimulatedBackend::new()), AppConfig::default())
            .unwrap()
    }

    #[test]
    fn test_defaults_follow_app_config() {
        let mut app_config = AppConfig::default();
        app_config.stream.buffer_size_in_bursts = 2;
        app_config.tone.enabled = true;
        let engine =
            PlaybackEngine::with_platform(Arc::new(SimulatedBackend::new()), app_config).unwrap();

        assert_eq!(engine.buffer_size_mode(), BufferSizeMode::Bursts(2));
        assert!(engine.is_tone_on());
        assert!(!engine.is_running());
    }

    #[test]
    fn test_setters_publish_events() {
        let engine = engine();
        let mut events = engine.subscribe_events();

        engine.set_tone_on(true);
        engine.set_buffer_size_in_bursts(-3);
        engine.reset_latency_tuner();

        assert_eq!(
            events.try_recv().unwrap().kind,
            EngineEventKind::ToneToggled { enabled: true }
        );
        assert_eq!(
            events.try_recv().unwrap().kind,
            EngineEventKind::BufferModeChanged { bursts: 0 }
        );
        assert_eq!(events.try_recv().unwrap().kind, EngineEventKind::TunerReset);
        assert_eq!(engine.buffer_size_mode(), BufferSizeMode::Automatic);
    }

    #[test]
    fn test_latency_is_zero_before_start() {
        let engine = engine();
        assert_eq!(engine.current_output_latency_millis(), 0.0);
        assert_eq!(engine.sample_latency(), 0.0);
        assert!(engine.stream_info().is_none());
        assert!(engine.drain_callback_traces().is_empty());
    }

    #[test]
    fn test_drop_with_open_stream_joins_worker() {
        let engine = engine();
        engine.start().unwrap();
        drop(engine);
    }
}
