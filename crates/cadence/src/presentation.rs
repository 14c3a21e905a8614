use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::{interval_for_hz, normalize_non_zero_duration, ConfigError};
use crate::metrics::{MetricsHandle, RateAccumulator};
use crate::work::{FrameContext, PresentWork, WorkError, WorkId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented { failed_units: usize },
    /// Too soon after the last accepted attempt; nothing ran.
    Skipped { remaining: Duration },
}

impl PresentOutcome {
    pub fn is_presented(&self) -> bool {
        matches!(self, Self::Presented { .. })
    }
}

/// Paces draw attempts against a maximum frequency.
///
/// Has no thread of its own: the owner calls [`try_present`] as often as it
/// likes and attempts closer together than `1 / max_hz` are dropped.
///
/// [`try_present`]: PresentationScheduler::try_present
pub struct PresentationScheduler {
    label: String,
    max_hz: f64,
    min_interval: Duration,
    units: Vec<(WorkId, PresentWork)>,
    next_id: u64,
    last_presented: Option<Instant>,
    frames: u64,
    accumulator: Option<RateAccumulator>,
    metrics_log_interval: Duration,
    metrics: MetricsHandle,
}

impl PresentationScheduler {
    pub fn new(max_hz: f64) -> Result<Self, ConfigError> {
        let min_interval = interval_for_hz("max_hz", max_hz)?;
        Ok(Self {
            label: format!("{max_hz}hz"),
            max_hz,
            min_interval,
            units: Vec::new(),
            next_id: 1,
            last_presented: None,
            frames: 0,
            accumulator: None,
            metrics_log_interval: Duration::from_secs(1),
            metrics: MetricsHandle::default(),
        })
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_metrics_log_interval(mut self, interval: Duration) -> Self {
        self.metrics_log_interval = normalize_non_zero_duration(interval, Duration::from_secs(1));
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn max_hz(&self) -> f64 {
        self.max_hz
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames
    }

    pub fn metrics(&self) -> MetricsHandle {
        self.metrics.clone()
    }

    pub fn register<F>(&mut self, work: F) -> WorkId
    where
        F: FnMut(&FrameContext) -> Result<(), WorkError> + 'static,
    {
        let id = WorkId(self.next_id);
        self.next_id += 1;
        self.units.push((id, Box::new(work)));
        id
    }

    pub fn remove(&mut self, id: WorkId) -> bool {
        let before = self.units.len();
        self.units.retain(|(unit_id, _)| *unit_id != id);
        self.units.len() != before
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.time_until_due(now).is_zero()
    }

    pub fn time_until_due(&self, now: Instant) -> Duration {
        match self.last_presented {
            Some(last) => compute_cap_sleep(now.saturating_duration_since(last), self.min_interval),
            None => Duration::ZERO,
        }
    }

    /// Runs every unit in order if at least `1 / max_hz` has passed since the
    /// last accepted attempt. Unit failures are logged and counted, never
    /// propagated, and never stop the remaining units.
    pub fn try_present(&mut self, now: Instant) -> PresentOutcome {
        let remaining = self.time_until_due(now);
        if !remaining.is_zero() {
            return PresentOutcome::Skipped { remaining };
        }

        let since_last = self
            .last_presented
            .map(|last| now.saturating_duration_since(last));
        self.last_presented = Some(now);
        let ctx = FrameContext {
            frame: self.frames,
            now,
            since_last,
        };
        self.frames += 1;

        let mut failed_units = 0;
        for (id, unit) in &mut self.units {
            if let Err(error) = unit(&ctx) {
                failed_units += 1;
                warn!(
                    presenter = %self.label,
                    frame = ctx.frame,
                    work = %id,
                    error = %error,
                    "present_unit_failed"
                );
            }
        }

        self.record_frame(now, since_last);
        PresentOutcome::Presented { failed_units }
    }

    fn record_frame(&mut self, now: Instant, since_last: Option<Duration>) {
        let interval = self.metrics_log_interval;
        let accumulator = self
            .accumulator
            .get_or_insert_with(|| RateAccumulator::new(interval, now));
        if let Some(frame_dt) = since_last {
            accumulator.record(frame_dt);
        }
        if let Some(snapshot) = accumulator.maybe_snapshot(now) {
            self.metrics.publish(snapshot);
            info!(
                presenter = %self.label,
                fps = snapshot.rate_hz,
                frame_time_ms = snapshot.avg_duration_ms,
                "present_metrics"
            );
        }
    }
}

fn compute_cap_sleep(elapsed: Duration, target: Duration) -> Duration {
    if elapsed < target {
        target - elapsed
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn rejects_non_positive_max_hz() {
        assert!(PresentationScheduler::new(0.0).is_err());
        assert!(PresentationScheduler::new(-60.0).is_err());
    }

    #[test]
    fn min_interval_for_60hz_is_expected() {
        let presenter = PresentationScheduler::new(60.0).expect("presenter");
        assert!((presenter.min_interval().as_secs_f64() - (1.0 / 60.0)).abs() < 0.000_001);
    }

    #[test]
    fn compute_cap_sleep_zero_when_over_budget() {
        assert_eq!(compute_cap_sleep(ms(20), ms(16)), Duration::ZERO);
    }

    #[test]
    fn compute_cap_sleep_positive_when_under_budget() {
        assert_eq!(compute_cap_sleep(ms(5), ms(16)), ms(11));
    }

    #[test]
    fn first_attempt_is_accepted() {
        let mut presenter = PresentationScheduler::new(60.0).expect("presenter");
        assert!(presenter.is_due(Instant::now()));
        assert!(presenter.try_present(Instant::now()).is_presented());
    }

    #[test]
    fn second_attempt_within_interval_is_skipped() {
        let mut presenter = PresentationScheduler::new(100.0).expect("presenter");
        let runs = Rc::new(RefCell::new(0));
        let r = Rc::clone(&runs);
        presenter.register(move |_| {
            *r.borrow_mut() += 1;
            Ok(())
        });

        let t0 = Instant::now();
        assert!(presenter.try_present(t0).is_presented());
        assert_eq!(
            presenter.try_present(t0 + ms(4)),
            PresentOutcome::Skipped { remaining: ms(6) }
        );
        assert_eq!(*runs.borrow(), 1);

        assert!(presenter.try_present(t0 + ms(10)).is_presented());
        assert_eq!(*runs.borrow(), 2);
        assert_eq!(presenter.frames_presented(), 2);
    }

    #[test]
    fn skipped_attempt_does_not_move_the_window() {
        let mut presenter = PresentationScheduler::new(100.0).expect("presenter");
        let t0 = Instant::now();
        presenter.try_present(t0);
        presenter.try_present(t0 + ms(9));
        assert!(presenter.try_present(t0 + ms(10)).is_presented());
    }

    #[test]
    fn failing_unit_does_not_stop_the_rest() {
        let mut presenter = PresentationScheduler::new(60.0).expect("presenter");
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = Rc::clone(&order);
        presenter.register(move |_| {
            o.borrow_mut().push("first");
            Err(WorkError::msg("shader missing"))
        });
        let o = Rc::clone(&order);
        presenter.register(move |_| {
            o.borrow_mut().push("second");
            Ok(())
        });

        let t0 = Instant::now();
        assert_eq!(
            presenter.try_present(t0),
            PresentOutcome::Presented { failed_units: 1 }
        );
        presenter.try_present(t0 + Duration::from_secs(1));

        assert_eq!(
            *order.borrow(),
            vec!["first", "second", "first", "second"]
        );
        assert_eq!(presenter.unit_count(), 2);
    }

    #[test]
    fn frame_context_reports_gap_since_last_frame() {
        let mut presenter = PresentationScheduler::new(50.0).expect("presenter");
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        presenter.register(move |ctx| {
            s.borrow_mut().push((ctx.frame, ctx.since_last));
            Ok(())
        });

        let t0 = Instant::now();
        presenter.try_present(t0);
        presenter.try_present(t0 + ms(25));

        assert_eq!(*seen.borrow(), vec![(0, None), (1, Some(ms(25)))]);
    }

    #[test]
    fn removed_unit_stops_running() {
        let mut presenter = PresentationScheduler::new(60.0).expect("presenter");
        let runs = Rc::new(RefCell::new(0));
        let r = Rc::clone(&runs);
        let id = presenter.register(move |_| {
            *r.borrow_mut() += 1;
            Ok(())
        });

        let t0 = Instant::now();
        presenter.try_present(t0);
        assert!(presenter.remove(id));
        presenter.try_present(t0 + Duration::from_secs(1));
        assert_eq!(*runs.borrow(), 1);
    }

    #[test]
    fn time_until_due_counts_down() {
        let mut presenter = PresentationScheduler::new(100.0).expect("presenter");
        let t0 = Instant::now();
        presenter.try_present(t0);
        assert_eq!(presenter.time_until_due(t0 + ms(3)), ms(7));
        assert_eq!(presenter.time_until_due(t0 + ms(30)), Duration::ZERO);
    }
}
