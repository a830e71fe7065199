// CallbackTrace - non-blocking diagnostics out of the data callback
//
// Logging from the audio thread risks audible glitches, so the callback
// pushes one small Copy record per cycle into a lock-free SPSC ring
// buffer (rtrb). The control context drains the ring and logs it.
//
// Flow:
// 1. Callback pushes a CallbackTrace (dropped if the ring is full)
// 2. Control thread calls TraceReader::drain() at its own pace
// 3. Drained records are logged at trace level and handed to the caller

use rtrb::{Consumer, Producer, RingBuffer};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::tuner::TuneAction;

/// Snapshot of one data callback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CallbackTrace {
    /// Frames requested by the platform
    pub num_frames: i32,
    /// Cumulative underrun count, or -1 when the platform cannot report it
    pub underruns: i32,
    /// Buffer size in frames after tuning
    pub buffer_size: i32,
    /// What the tuner did this cycle
    pub tuning: TuneAction,
}

/// Audio-thread side of the trace ring.
pub struct TraceWriter {
    producer: Producer<CallbackTrace>,
    dropped: Arc<AtomicU64>,
}

impl TraceWriter {
    /// Push without blocking; a full ring counts the record as dropped.
    #[inline]
    pub fn record(&mut self, trace: CallbackTrace) {
        if self.producer.push(trace).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Control-side reader of the trace ring.
pub struct TraceReader {
    consumer: Consumer<CallbackTrace>,
    dropped: Arc<AtomicU64>,
}

impl TraceReader {
    /// Take every record currently queued.
    pub fn drain(&mut self) -> Vec<CallbackTrace> {
        let mut traces = Vec::with_capacity(self.consumer.slots());
        while let Ok(trace) = self.consumer.pop() {
            tracing::trace!(
                num_frames = trace.num_frames,
                underruns = trace.underruns,
                buffer_size = trace.buffer_size,
                tuning = ?trace.tuning,
                "callback"
            );
            traces.push(trace);
        }
        traces
    }

    /// Records lost because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Create a trace ring with room for `capacity` records.
pub fn trace_channel(capacity: usize) -> (TraceWriter, TraceReader) {
    let (producer, consumer) = RingBuffer::new(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        TraceWriter {
            producer,
            dropped: Arc::clone(&dropped),
        },
        TraceReader { consumer, dropped },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(num_frames: i32) -> CallbackTrace {
        CallbackTrace {
            num_frames,
            underruns: 0,
            buffer_size: 192,
            tuning: TuneAction::Idle,
        }
    }

    #[test]
    fn test_drain_returns_in_order() {
        let (mut writer, mut reader) = trace_channel(8);
        writer.record(trace(1));
        writer.record(trace(2));
        writer.record(trace(3));

        let drained = reader.drain();
        assert_eq!(
            drained.iter().map(|t| t.num_frames).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(reader.drain().is_empty());
    }

    #[test]
    fn test_full_ring_drops_without_blocking() {
        let (mut writer, mut reader) = trace_channel(2);
        for i in 0..5 {
            writer.record(trace(i));
        }

        assert_eq!(reader.dropped(), 3);
        assert_eq!(reader.drain().len(), 2);
    }
}
