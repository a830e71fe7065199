//! Restart worker: recreates the stream after device loss.
//!
//! The platform's error callback must not close or reopen its own stream,
//! so it only posts a [`RestartRequest`]. This worker owns the receiving
//! end, blocks on it outside any async runtime, and runs the controller's
//! restart protocol for each request.
//!
//! [`RestartSignal`] is shared by the controller, every stream error handler
//! and this worker. A disconnect reaches the queue only when no restart is
//! queued or running; any other notification is counted and dropped where
//! it was raised, then reported from the control side.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Weak;
use std::thread::JoinHandle;

use tokio::sync::mpsc;

use crate::error::{log_audio_error, AudioError};
use crate::telemetry::EngineEventKind;

use super::controller::{RestartOutcome, StreamController};

/// Queued requests beyond this are dropped at the sender.
pub const RESTART_QUEUE_CAPACITY: usize = 1;

/// Why a restart was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartRequest {
    DeviceDisconnected,
}

pub fn restart_channel() -> (mpsc::Sender<RestartRequest>, mpsc::Receiver<RestartRequest>) {
    mpsc::channel(RESTART_QUEUE_CAPACITY)
}

/// Mutual exclusion for the restart protocol.
///
/// Never blocks: a caller that loses the race is told so and moves on.
#[derive(Debug, Default)]
pub struct RestartGuard {
    busy: AtomicBool,
}

impl RestartGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<RestartPermit<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RestartPermit { guard: self })
    }

    pub fn is_held(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the [`RestartGuard`] when dropped.
#[must_use]
pub struct RestartPermit<'a> {
    guard: &'a RestartGuard,
}

impl Drop for RestartPermit<'_> {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}

/// Restart state visible to the real-time error path.
///
/// Every method is lock-free and allocation-free.
#[derive(Debug, Default)]
pub struct RestartSignal {
    guard: RestartGuard,
    pending: AtomicBool,
    queued: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    stream_errors: AtomicU64,
    last_error_code: AtomicI32,
}

/// Notifications seen by the error handlers since the last report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotificationReport {
    /// Disconnects that queued a restart
    pub queued: u64,
    /// Disconnects dropped because a restart was already queued or running
    pub dropped: u64,
    /// Disconnects raised after the worker stopped
    pub rejected: u64,
    /// Non-disconnect stream errors
    pub stream_errors: u64,
    /// Code of the latest non-disconnect error, 0 if none
    pub last_error_code: i32,
}

impl NotificationReport {
    pub fn is_empty(&self) -> bool {
        self.queued == 0 && self.dropped == 0 && self.rejected == 0 && self.stream_errors == 0
    }
}

impl RestartSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(&self) -> &RestartGuard {
        &self.guard
    }

    /// Claim the single restart slot for a disconnect notification.
    ///
    /// Fails while a restart is queued, held by the worker or running on
    /// the control side.
    pub fn try_claim(&self) -> bool {
        !self.guard.is_held()
            && self
                .pending
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Free the slot once the claimed restart has run (or can never run).
    pub fn release(&self) {
        self.pending.store(false, Ordering::Release);
    }

    /// A restart is queued, waiting for the worker, or running.
    pub fn is_busy(&self) -> bool {
        self.guard.is_held() || self.pending.load(Ordering::Acquire)
    }

    pub fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_error(&self, code: i32) {
        self.last_error_code.store(code, Ordering::Relaxed);
        self.stream_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Take and reset the counters.
    pub fn take_report(&self) -> NotificationReport {
        NotificationReport {
            queued: self.queued.swap(0, Ordering::Relaxed),
            dropped: self.dropped.swap(0, Ordering::Relaxed),
            rejected: self.rejected.swap(0, Ordering::Relaxed),
            stream_errors: self.stream_errors.swap(0, Ordering::Relaxed),
            last_error_code: self.last_error_code.swap(0, Ordering::Relaxed),
        }
    }
}

/// Background thread servicing restart requests.
///
/// Exits once every sender is gone or the controller has been dropped.
pub struct RestartWorker {
    handle: Option<JoinHandle<()>>,
}

impl RestartWorker {
    pub fn spawn(
        controller: Weak<StreamController>,
        mut requests: mpsc::Receiver<RestartRequest>,
    ) -> Result<Self, AudioError> {
        let handle = std::thread::Builder::new()
            .name("stream-restart".to_string())
            .spawn(move || {
                while let Some(request) = requests.blocking_recv() {
                    let Some(controller) = controller.upgrade() else {
                        break;
                    };
                    controller.report_stream_notifications();
                    tracing::info!(?request, "[RestartWorker] Restarting stream");
                    if request == RestartRequest::DeviceDisconnected {
                        controller.publish(EngineEventKind::DeviceDisconnected);
                    }

                    match controller.restart() {
                        Ok(RestartOutcome::Completed) => {
                            tracing::info!("[RestartWorker] Stream restarted")
                        }
                        Ok(RestartOutcome::Dropped) => {}
                        Err(err) => log_audio_error(&err, "restart_worker"),
                    }

                    // Disconnects raised during the restart were dropped at
                    // the source; report them before accepting new ones
                    controller.restart_signal().release();
                    controller.report_stream_notifications();
                }
                tracing::debug!("[RestartWorker] Exiting");
            })?;

        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Wait for the worker to exit. Its senders must already be dropped.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("[RestartWorker] Worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_admits_one_holder() {
        let guard = RestartGuard::new();
        let permit = guard.try_acquire();
        assert!(permit.is_some());
        assert!(guard.try_acquire().is_none());
        assert!(guard.is_held());

        drop(permit);
        assert!(!guard.is_held());
        assert!(guard.try_acquire().is_some());
    }

    #[test]
    fn test_signal_claims_once_until_released() {
        let signal = RestartSignal::new();

        assert!(signal.try_claim());
        assert!(!signal.try_claim());
        assert!(signal.is_busy());

        signal.release();
        assert!(!signal.is_busy());
        assert!(signal.try_claim());
    }

    #[test]
    fn test_signal_refuses_claim_while_guard_held() {
        let signal = RestartSignal::new();
        let permit = signal.guard().try_acquire();

        assert!(!signal.try_claim());
        assert!(signal.is_busy());

        drop(permit);
        assert!(signal.try_claim());
    }

    #[test]
    fn test_report_resets_counters() {
        let signal = RestartSignal::new();
        signal.record_queued();
        signal.record_dropped();
        signal.record_dropped();
        signal.record_stream_error(2012);

        let report = signal.take_report();
        assert_eq!(report.queued, 1);
        assert_eq!(report.dropped, 2);
        assert_eq!(report.stream_errors, 1);
        assert_eq!(report.last_error_code, 2012);

        assert!(signal.take_report().is_empty());
    }
}
