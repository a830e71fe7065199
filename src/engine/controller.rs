//! StreamController: owns the hardware stream lifecycle.
//!
//! open → configure → start → (callbacks) → stop → close, plus the restart
//! protocol used after device loss or a device change. Only control-context
//! code calls into this type; the audio thread never sees it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::audio::{
    trace_channel, CallbackContext, CallbackTrace, EngineConfig, LatencyCell, PlaybackCallback,
    StreamErrorHandler, TraceReader, CHANNEL_COUNT,
};
use crate::config::AppConfig;
use crate::error::{log_audio_error, AudioError, ErrorCode};
use crate::telemetry::{EngineEventKind, TelemetryCollector};

use super::backend::{AudioPlatform, PlatformStream, SharingMode, StreamInfo, StreamRequest};
use super::restart::{NotificationReport, RestartRequest, RestartSignal};

/// Result of a restart attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    /// Stream closed and reopened
    Completed,
    /// Another restart held the guard; nothing was done
    Dropped,
}

/// A started stream and the reader for its callback traces.
struct ActiveStream {
    handle: Box<dyn PlatformStream>,
    info: StreamInfo,
    traces: TraceReader,
}

/// Owns the single output stream and rebuilds it on demand.
pub struct StreamController {
    platform: Arc<dyn AudioPlatform>,
    config: Arc<EngineConfig>,
    app_config: AppConfig,
    latency: Arc<LatencyCell>,
    telemetry: Arc<TelemetryCollector>,
    restart_signal: Arc<RestartSignal>,
    restart_tx: Mutex<Option<mpsc::Sender<RestartRequest>>>,
    stream: Mutex<Option<ActiveStream>>,
    shutting_down: AtomicBool,
}

impl StreamController {
    pub fn new(
        platform: Arc<dyn AudioPlatform>,
        config: Arc<EngineConfig>,
        app_config: AppConfig,
        telemetry: Arc<TelemetryCollector>,
        restart_tx: mpsc::Sender<RestartRequest>,
    ) -> Self {
        Self {
            platform,
            config,
            app_config,
            latency: Arc::new(LatencyCell::new()),
            telemetry,
            restart_signal: Arc::new(RestartSignal::new()),
            restart_tx: Mutex::new(Some(restart_tx)),
            stream: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Open and start a stream unless a restart is running.
    ///
    /// Holds the restart guard while opening.
    pub fn start(&self) -> Result<StreamInfo, AudioError> {
        let Some(_permit) = self.restart_signal.guard().try_acquire() else {
            let err = AudioError::RestartInProgress;
            log_audio_error(&err, "start_stream");
            return Err(err);
        };
        self.open()
    }

    /// Open, configure and start a stream for the current configuration.
    ///
    /// Any stream already open is closed first. On failure nothing is
    /// installed and the error is logged, published and returned.
    pub fn open(&self) -> Result<StreamInfo, AudioError> {
        let mut slot = self.lock_stream()?;
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(self.report_open_failure(AudioError::StreamOpenFailed {
                reason: "engine is shutting down".to_string(),
            }));
        }
        self.close_locked(&mut slot);

        let errors = self.error_handler()?;
        let (trace_writer, trace_reader) =
            trace_channel(self.app_config.diagnostics.trace_capacity);
        let timestamps_supported = Arc::new(AtomicBool::new(false));
        self.latency.reset();

        let callback = PlaybackCallback::new(CallbackContext {
            config: Arc::clone(&self.config),
            latency: Arc::clone(&self.latency),
            timestamps_supported: Arc::clone(&timestamps_supported),
            clock: self.platform.clock(),
            tone: self.app_config.tone.clone(),
            tuner: self.app_config.tuner.clone(),
            trace: trace_writer,
            errors,
        });

        let request = self.stream_request();
        let mut handle = self
            .platform
            .open_stream(&request, callback)
            .map_err(|err| self.report_open_failure(err))?;

        let info = configure(handle.as_mut(), self.platform.name());
        timestamps_supported.store(info.timestamps_supported, Ordering::Relaxed);

        if let Err(err) = handle.request_start() {
            if let Err(close_err) = handle.close() {
                log_audio_error(&close_err, "open_stream.close_after_failed_start");
            }
            let err = match err {
                AudioError::StreamStartFailed { .. } => err,
                other => AudioError::StreamStartFailed {
                    reason: other.to_string(),
                },
            };
            return Err(self.report_open_failure(err));
        }

        tracing::info!(
            backend = info.backend,
            device_id = info.device_id,
            sample_rate = info.sample_rate,
            frames_per_burst = info.frames_per_burst,
            buffer_size = info.buffer_size_in_frames,
            timestamps = info.timestamps_supported,
            "[StreamController] Stream started"
        );
        self.telemetry.publish(EngineEventKind::StreamOpened {
            device_id: info.device_id,
            sample_rate: info.sample_rate,
            frames_per_burst: info.frames_per_burst,
            buffer_size_in_frames: info.buffer_size_in_frames,
            timestamps_supported: info.timestamps_supported,
        });

        *slot = Some(ActiveStream {
            handle,
            info: info.clone(),
            traces: trace_reader,
        });
        Ok(info)
    }

    /// Stop and close the stream if one is open. Never fails.
    pub fn close(&self) {
        let mut slot = self
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.close_locked(&mut slot);
    }

    /// Close then reopen the stream, unless another restart is running.
    pub fn restart(&self) -> Result<RestartOutcome, AudioError> {
        let Some(_permit) = self.restart_signal.guard().try_acquire() else {
            tracing::warn!("[StreamController] Restart already in progress, request dropped");
            self.telemetry.publish(EngineEventKind::RestartDropped);
            return Ok(RestartOutcome::Dropped);
        };

        self.close();
        self.open()?;
        self.telemetry.publish(EngineEventKind::RestartCompleted);
        Ok(RestartOutcome::Completed)
    }

    /// Record the requested device and restart when it differs from the
    /// live stream's device. With no live stream a restart is attempted.
    ///
    /// Returns `None` when no restart was needed.
    pub fn set_device_id(&self, device_id: i32) -> Result<Option<RestartOutcome>, AudioError> {
        self.config.set_device_id(device_id);
        self.telemetry
            .publish(EngineEventKind::DeviceRequested { device_id });

        let live_device = self
            .lock_stream()?
            .as_ref()
            .map(|active| active.handle.device_id());
        if live_device == Some(device_id) {
            return Ok(None);
        }

        tracing::info!(
            requested = device_id,
            live = ?live_device,
            "[StreamController] Device changed, restarting stream"
        );
        self.restart().map(Some)
    }

    /// Properties of the live stream, with the buffer size read fresh.
    pub fn stream_info(&self) -> Option<StreamInfo> {
        let slot = self.lock_stream().ok()?;
        slot.as_ref().map(|active| StreamInfo {
            buffer_size_in_frames: active.handle.buffer_size_in_frames(),
            ..active.info.clone()
        })
    }

    pub fn is_open(&self) -> bool {
        self.lock_stream()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    pub fn latency(&self) -> &Arc<LatencyCell> {
        &self.latency
    }

    /// A restart is queued for the worker or running.
    pub fn restart_in_progress(&self) -> bool {
        self.restart_signal.is_busy()
    }

    pub fn restart_signal(&self) -> &Arc<RestartSignal> {
        &self.restart_signal
    }

    /// Log and publish what the stream error handlers recorded since the
    /// last report. The handlers run on audio threads and never log.
    pub fn report_stream_notifications(&self) -> NotificationReport {
        let report = self.restart_signal.take_report();
        if report.queued > 0 {
            tracing::info!(
                count = report.queued,
                "[StreamController] Output device disconnected, restart queued"
            );
        }
        if report.dropped > 0 {
            tracing::info!(
                count = report.dropped,
                "[StreamController] Disconnects dropped, restart already queued or running"
            );
            self.telemetry.publish(EngineEventKind::RestartDropped);
        }
        if report.rejected > 0 {
            tracing::warn!(
                count = report.rejected,
                "[StreamController] Disconnects ignored, restart worker stopped"
            );
        }
        if report.stream_errors > 0 {
            tracing::warn!(
                count = report.stream_errors,
                last_code = report.last_error_code,
                "[StreamController] Stream reported errors"
            );
        }
        report
    }

    /// Take every callback trace recorded since the last drain.
    pub fn drain_callback_traces(&self) -> Vec<CallbackTrace> {
        let traces = match self.lock_stream() {
            Ok(mut slot) => slot
                .as_mut()
                .map(|active| active.traces.drain())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        self.report_stream_notifications();
        if let Some(last) = traces.last() {
            tracing::trace!(
                count = traces.len(),
                underruns = last.underruns,
                buffer_size = last.buffer_size,
                tuning = ?last.tuning,
                "[StreamController] Drained callback traces"
            );
        }
        traces
    }

    pub fn publish(&self, kind: EngineEventKind) {
        self.telemetry.publish(kind);
    }

    /// Refuse further opens and drop the controller's restart sender so the
    /// restart worker can exit once the stream is closed.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.restart_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.close();
    }

    fn close_locked(&self, slot: &mut Option<ActiveStream>) {
        let Some(mut active) = slot.take() else {
            return;
        };

        // Both steps run even if the first fails
        if let Err(err) = active.handle.request_stop() {
            log_audio_error(&err, "close_stream.request_stop");
        }
        if let Err(err) = active.handle.close() {
            log_audio_error(&err, "close_stream.close");
        }

        self.report_stream_notifications();
        let leftover = active.traces.drain();
        let dropped = active.traces.dropped();
        tracing::info!(
            device_id = active.info.device_id,
            undrained_traces = leftover.len(),
            dropped_traces = dropped,
            "[StreamController] Stream closed"
        );
        self.telemetry.publish(EngineEventKind::StreamClosed {
            device_id: active.info.device_id,
        });
    }

    fn stream_request(&self) -> StreamRequest {
        StreamRequest {
            device_id: self.config.device_id(),
            channel_count: CHANNEL_COUNT,
            format: self.app_config.stream.sample_format,
            sharing_mode: SharingMode::Exclusive,
            low_latency: true,
        }
    }

    fn error_handler(&self) -> Result<StreamErrorHandler, AudioError> {
        let guard = self
            .restart_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => Ok(StreamErrorHandler::new(
                tx.clone(),
                Arc::clone(&self.restart_signal),
            )),
            None => Err(self.report_open_failure(AudioError::StreamOpenFailed {
                reason: "restart worker stopped".to_string(),
            })),
        }
    }

    fn report_open_failure(&self, err: AudioError) -> AudioError {
        log_audio_error(&err, "open_stream");
        self.telemetry.publish(EngineEventKind::StreamOpenFailed {
            code: err.code(),
            reason: err.message(),
        });
        err
    }

    fn lock_stream(&self) -> Result<MutexGuard<'_, Option<ActiveStream>>, AudioError> {
        self.stream.lock().map_err(|_| {
            let err = AudioError::LockPoisoned {
                component: "stream_controller".to_string(),
            };
            log_audio_error(&err, "lock_stream");
            err
        })
    }
}

/// Apply the post-open settings and capture the stream's properties.
///
/// The buffer starts at one burst; the tuner or the fixed burst count takes
/// it from there.
fn configure(handle: &mut dyn PlatformStream, backend: &'static str) -> StreamInfo {
    let frames_per_burst = handle.frames_per_burst();
    let buffer_size_in_frames = match handle.set_buffer_size_in_frames(frames_per_burst) {
        Ok(actual) => actual,
        Err(err) => {
            log_audio_error(&err, "open_stream.set_buffer_size");
            handle.buffer_size_in_frames()
        }
    };

    // A query that fails for any reason other than lack of support still
    // means the platform can produce timestamps later
    let timestamps_supported = !matches!(handle.timestamp(), Err(AudioError::Unimplemented { .. }));

    StreamInfo {
        backend,
        device_id: handle.device_id(),
        sample_rate: handle.sample_rate(),
        channel_count: handle.channel_count(),
        format: handle.format(),
        frames_per_burst,
        buffer_size_in_frames,
        buffer_capacity_in_frames: handle.buffer_capacity_in_frames(),
        timestamps_supported,
    }
}
