use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tracing::warn;

static POISON_REPORTED: AtomicBool = AtomicBool::new(false);

fn report_poison(operation: &'static str) {
    if !POISON_REPORTED.swap(true, Ordering::Relaxed) {
        warn!(operation, "metrics lock poisoned; recovered inner value");
    }
}

/// Observed rate of ticks or frames over one measurement interval.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateSnapshot {
    pub rate_hz: f32,
    pub avg_duration_ms: f32,
    pub count: u32,
}

#[derive(Debug, Default)]
struct Published {
    latest: Option<RateSnapshot>,
    intervals: u64,
}

/// Shared view of the most recent measurement published by a scheduler.
#[derive(Clone, Debug, Default)]
pub struct MetricsHandle {
    published: Arc<RwLock<Published>>,
}

impl MetricsHandle {
    /// Latest measurement, or all zeroes before the first interval closes.
    pub fn snapshot(&self) -> RateSnapshot {
        self.latest().unwrap_or_default()
    }

    pub fn latest(&self) -> Option<RateSnapshot> {
        self.read().latest
    }

    /// Number of measurement intervals published so far.
    pub fn intervals_published(&self) -> u64 {
        self.read().intervals
    }

    pub(crate) fn publish(&self, snapshot: RateSnapshot) {
        let mut published = self.write();
        published.latest = Some(snapshot);
        published.intervals = published.intervals.saturating_add(1);
    }

    fn read(&self) -> RwLockReadGuard<'_, Published> {
        self.published.read().unwrap_or_else(|poisoned| {
            report_poison("read");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, Published> {
        self.published.write().unwrap_or_else(|poisoned| {
            report_poison("write");
            poisoned.into_inner()
        })
    }
}

#[derive(Debug)]
pub(crate) struct RateAccumulator {
    interval_start: Instant,
    interval: Duration,
    count: u32,
    duration_sum: Duration,
}

impl RateAccumulator {
    pub(crate) fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval_start: now,
            interval,
            count: 0,
            duration_sum: Duration::ZERO,
        }
    }

    pub(crate) fn record(&mut self, duration: Duration) {
        self.count = self.count.saturating_add(1);
        self.duration_sum = self.duration_sum.saturating_add(duration);
    }

    pub(crate) fn maybe_snapshot(&mut self, now: Instant) -> Option<RateSnapshot> {
        let elapsed = now.saturating_duration_since(self.interval_start);
        if elapsed < self.interval {
            return None;
        }

        let elapsed_seconds = elapsed.as_secs_f32().max(f32::EPSILON);
        let avg_duration_ms = if self.count == 0 {
            0.0
        } else {
            (self.duration_sum.as_secs_f32() / self.count as f32) * 1000.0
        };

        let snapshot = RateSnapshot {
            rate_hz: self.count as f32 / elapsed_seconds,
            avg_duration_ms,
            count: self.count,
        };

        self.interval_start = now;
        self.count = 0;
        self.duration_sum = Duration::ZERO;

        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn poison(handle: &MetricsHandle) {
        let published = Arc::clone(&handle.published);
        let _ = thread::spawn(move || {
            let _guard = published.write().expect("write guard");
            panic!("poison metrics lock");
        })
        .join();
        assert!(handle.published.is_poisoned());
    }

    #[test]
    fn snapshot_computes_expected_values() {
        let base = Instant::now();
        let mut accumulator = RateAccumulator::new(Duration::from_secs(1), base);

        for _ in 0..4 {
            accumulator.record(Duration::from_millis(2));
        }

        let snapshot = accumulator
            .maybe_snapshot(base + Duration::from_secs(2))
            .expect("snapshot should be emitted");

        assert!((snapshot.rate_hz - 2.0).abs() < 0.05);
        assert!((snapshot.avg_duration_ms - 2.0).abs() < 0.001);
        assert_eq!(snapshot.count, 4);
    }

    #[test]
    fn snapshot_not_emitted_before_interval() {
        let base = Instant::now();
        let mut accumulator = RateAccumulator::new(Duration::from_secs(1), base);
        accumulator.record(Duration::from_millis(16));

        assert!(accumulator
            .maybe_snapshot(base + Duration::from_millis(500))
            .is_none());
    }

    #[test]
    fn snapshot_resets_counters() {
        let base = Instant::now();
        let mut accumulator = RateAccumulator::new(Duration::from_secs(1), base);
        accumulator.record(Duration::from_millis(5));
        let _ = accumulator.maybe_snapshot(base + Duration::from_secs(1));

        let next = accumulator
            .maybe_snapshot(base + Duration::from_secs(2))
            .expect("second snapshot");
        assert_eq!(next.count, 0);
        assert_eq!(next.avg_duration_ms, 0.0);
    }

    #[test]
    fn handle_reports_nothing_until_first_publish() {
        let handle = MetricsHandle::default();
        assert_eq!(handle.latest(), None);
        assert_eq!(handle.snapshot(), RateSnapshot::default());
        assert_eq!(handle.intervals_published(), 0);

        let measured = RateSnapshot {
            rate_hz: 59.8,
            avg_duration_ms: 0.7,
            count: 60,
        };
        handle.publish(measured);
        handle.clone().publish(measured);
        assert_eq!(handle.latest(), Some(measured));
        assert_eq!(handle.intervals_published(), 2);
    }

    #[test]
    fn poisoned_handle_still_reads_and_publishes() {
        let handle = MetricsHandle::default();
        poison(&handle);
        assert_eq!(handle.latest(), None);

        let measured = RateSnapshot {
            rate_hz: 144.0,
            avg_duration_ms: 6.9,
            count: 144,
        };
        handle.publish(measured);
        assert_eq!(handle.snapshot(), measured);
        assert_eq!(handle.intervals_published(), 1);
    }
}
