//! Per-consumer counters. Cheap atomics, read for the stop-time snapshot
//! and by tests.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    processed: AtomicU64,
    errors: AtomicU64,
    replays_scheduled: AtomicU64,
    in_flight: AtomicI64,
}

impl ConsumerMetrics {
    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay_scheduled(&self) {
        self.replays_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            replays_scheduled: self.replays_scheduled.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub errors: u64,
    pub replays_scheduled: u64,
    pub in_flight: i64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} errors={} replays={} in_flight={}",
            self.processed, self.errors, self.replays_scheduled, self.in_flight
        )
    }
}
