//! Engine telemetry collector and helpers.
//!
//! The collector fans engine events out over an async broadcast stream and
//! keeps a bounded history for snapshots. Only control-context code
//! publishes here; the audio thread reports through the trace ring instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;

pub mod events;

pub use events::{EngineEvent, EngineEventKind};

/// Snapshot of collector state for CLI reporting.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TelemetrySnapshot {
    pub recent: Vec<EngineEvent>,
    pub total_events: u64,
    pub dropped_events: u64,
}

/// Broadcast-based collector retaining a bounded history of events.
pub struct TelemetryCollector {
    tx: broadcast::Sender<EngineEvent>,
    history: Mutex<VecDeque<EngineEvent>>,
    history_capacity: usize,
    total_events: AtomicU64,
    dropped_history: AtomicU64,
    latency: Mutex<LatencyTracker>,
}

impl TelemetryCollector {
    pub fn new(buffer: usize, history_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
            total_events: AtomicU64::new(0),
            dropped_history: AtomicU64::new(0),
            latency: Mutex::new(LatencyTracker::new(32)),
        }
    }

    pub fn publish(&self, kind: EngineEventKind) {
        let event = EngineEvent {
            timestamp_ms: now_timestamp_ms(),
            kind,
        };
        self.total_events.fetch_add(1, Ordering::Relaxed);
        if self.history_capacity > 0 {
            let mut history = lock(&self.history);
            if history.len() == self.history_capacity {
                history.pop_front();
                self.dropped_history.fetch_add(1, Ordering::Relaxed);
            }
            history.push_back(event.clone());
        }

        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    /// Fold one latency reading into the rolling window and publish the
    /// updated average and maximum.
    pub fn record_latency(&self, latency_ms: f64) {
        let (avg_ms, max_ms, sample_count) = lock(&self.latency).observe(latency_ms);
        self.publish(EngineEventKind::Latency {
            avg_ms,
            max_ms,
            sample_count,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let history = lock(&self.history);
        TelemetrySnapshot {
            recent: history.iter().cloned().collect(),
            total_events: self.total_events.load(Ordering::Relaxed),
            dropped_events: self.dropped_history.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new(256, 64)
    }
}

/// Rolling window of latency readings.
struct LatencyTracker {
    samples: VecDeque<f64>,
    max_samples: usize,
}

impl LatencyTracker {
    fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    fn observe(&mut self, value: f64) -> (f64, f64, usize) {
        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);

        let count = self.samples.len();
        let sum: f64 = self.samples.iter().sum();
        let max = self
            .samples
            .iter()
            .copied()
            .fold(f64::MIN, f64::max);
        (sum / count as f64, max, count)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn now_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_preserves_order_within_history() {
        let collector = TelemetryCollector::new(8, 3);
        collector.publish(EngineEventKind::DeviceRequested { device_id: 4 });
        collector.publish(EngineEventKind::RestartCompleted);
        collector.publish(EngineEventKind::ToneToggled { enabled: true });

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.recent.len(), 3);
        assert_eq!(
            snapshot.recent[0].kind,
            EngineEventKind::DeviceRequested { device_id: 4 }
        );
        assert_eq!(
            snapshot.recent[2].kind,
            EngineEventKind::ToneToggled { enabled: true }
        );
    }

    #[test]
    fn collector_drops_history_when_full() {
        let collector = TelemetryCollector::new(8, 2);
        collector.publish(EngineEventKind::RestartCompleted);
        collector.publish(EngineEventKind::RestartDropped);
        collector.publish(EngineEventKind::TunerReset);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.recent.len(), 2);
        assert_eq!(snapshot.total_events, 3);
        assert_eq!(snapshot.dropped_events, 1);
        assert_eq!(snapshot.recent[0].kind, EngineEventKind::RestartDropped);
    }

    #[test]
    fn subscribers_receive_published_events() {
        let collector = TelemetryCollector::new(8, 0);
        let mut rx = collector.subscribe();

        collector.publish(EngineEventKind::DeviceDisconnected);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EngineEventKind::DeviceDisconnected);
        assert!(collector.snapshot().recent.is_empty());
    }

    #[test]
    fn latency_tracker_reports_average_and_peak() {
        let collector = TelemetryCollector::new(8, 8);
        collector.record_latency(10.0);
        collector.record_latency(-2.0);
        collector.record_latency(4.0);

        let snapshot = collector.snapshot();
        let last = snapshot.recent.last().unwrap();
        assert_eq!(
            last.kind,
            EngineEventKind::Latency {
                avg_ms: 4.0,
                max_ms: 10.0,
                sample_count: 3
            }
        );
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = EngineEvent {
            timestamp_ms: 7,
            kind: EngineEventKind::BufferModeChanged { bursts: 2 },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["timestamp_ms"], 7);
        assert_eq!(json["type"], "buffer_mode_changed");
        assert_eq!(json["payload"]["bursts"], 2);
    }
}
