//! Process-level orchestration of fixed-rate schedulers and presentation
//! targets.
//!
//! The coordinator starts every registered [`FixedRateScheduler`], then runs
//! a poll/present loop on the calling thread until every target reports that
//! it should close, and finally stops the schedulers in registration order.
//! Failures inside targets or their work units are logged and never end the
//! loop early.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CadenceConfig;
use crate::presentation::{PresentOutcome, PresentationScheduler};
use crate::scheduler::{FixedRateScheduler, SchedulerError};
use crate::work::WorkError;

/// A surface the coordinator presents to, such as a window.
pub trait PresentationTarget {
    fn label(&self) -> &str {
        "target"
    }

    fn should_close(&self) -> bool;

    /// Called right before the target's presentation units run.
    fn make_current(&mut self) -> Result<(), WorkError>;

    /// Called right after the target's presentation units ran.
    fn present(&mut self) -> Result<(), WorkError>;
}

/// Source of external input drained once per loop iteration.
pub trait EventPump {
    fn poll_events(&mut self);
}

/// `Idle` until `run` starts the schedulers, `Running` while the loop is
/// active, and `ShuttingDown` once it has exited. `ShuttingDown` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Running,
    ShuttingDown,
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("failed to start scheduler {label}: {source}")]
    StartScheduler {
        label: String,
        #[source]
        source: SchedulerError,
    },
    #[error("coordinator has already shut down")]
    AlreadyShutDown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: u64,
    pub frames_presented: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(usize);

struct ManagedTarget {
    target: Box<dyn PresentationTarget>,
    presenter: PresentationScheduler,
    close_logged: bool,
}

pub struct Coordinator {
    max_idle_sleep: Duration,
    state: CoordinatorState,
    schedulers: Vec<Arc<FixedRateScheduler>>,
    targets: Vec<ManagedTarget>,
    pumps: Vec<Box<dyn EventPump>>,
}

impl Coordinator {
    pub fn new(max_idle_sleep: Duration) -> Self {
        Self {
            max_idle_sleep,
            state: CoordinatorState::Idle,
            schedulers: Vec::new(),
            targets: Vec::new(),
            pumps: Vec::new(),
        }
    }

    pub fn from_config(config: &CadenceConfig) -> Self {
        Self::new(config.max_idle_sleep())
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn add_scheduler(&mut self, scheduler: Arc<FixedRateScheduler>) {
        self.schedulers.push(scheduler);
    }

    pub fn add_target<T>(&mut self, target: T, presenter: PresentationScheduler) -> TargetId
    where
        T: PresentationTarget + 'static,
    {
        self.targets.push(ManagedTarget {
            target: Box::new(target),
            presenter,
            close_logged: false,
        });
        TargetId(self.targets.len() - 1)
    }

    pub fn presenter_mut(&mut self, id: TargetId) -> Option<&mut PresentationScheduler> {
        self.targets.get_mut(id.0).map(|managed| &mut managed.presenter)
    }

    pub fn add_event_pump<P>(&mut self, pump: P)
    where
        P: EventPump + 'static,
    {
        self.pumps.push(Box::new(pump));
    }

    pub fn all_targets_closed(&self) -> bool {
        self.targets
            .iter()
            .all(|managed| managed.target.should_close())
    }

    /// Runs until every target should close.
    ///
    /// Fails if a scheduler cannot start, in which case the ones already
    /// started are stopped again and the coordinator stays `Idle`. A
    /// coordinator runs at most once; later calls return `AlreadyShutDown`.
    pub fn run(&mut self) -> Result<RunSummary, CoordinatorError> {
        if self.state == CoordinatorState::ShuttingDown {
            return Err(CoordinatorError::AlreadyShutDown);
        }
        self.start_schedulers()?;
        if self.targets.is_empty() {
            warn!("coordinator_has_no_targets");
        }

        let mut summary = RunSummary::default();
        while !self.all_targets_closed() {
            let presented = self.run_iteration();
            summary.iterations += 1;
            summary.frames_presented += presented as u64;

            if presented == 0 {
                let sleep = self.idle_sleep(Instant::now());
                if !sleep.is_zero() {
                    thread::sleep(sleep);
                }
            }
        }
        info!(reason = "all_targets_closed", "shutdown_requested");

        self.shutdown();
        info!(
            iterations = summary.iterations,
            frames_presented = summary.frames_presented,
            "coordinator_finished"
        );
        Ok(summary)
    }

    fn start_schedulers(&mut self) -> Result<(), CoordinatorError> {
        for (index, scheduler) in self.schedulers.iter().enumerate() {
            if let Err(source) = scheduler.start() {
                for started in &self.schedulers[..index] {
                    started.stop();
                }
                return Err(CoordinatorError::StartScheduler {
                    label: scheduler.label().to_string(),
                    source,
                });
            }
        }
        self.set_state(CoordinatorState::Running);
        Ok(())
    }

    /// Polls input once, then gives every open target a chance to present.
    /// Returns how many targets presented.
    fn run_iteration(&mut self) -> usize {
        for pump in &mut self.pumps {
            pump.poll_events();
        }

        let now = Instant::now();
        let mut presented = 0;
        for managed in &mut self.targets {
            if managed.target.should_close() {
                if !managed.close_logged {
                    managed.close_logged = true;
                    info!(target_label = managed.target.label(), "target_closed");
                }
                continue;
            }
            if !managed.presenter.is_due(now) {
                continue;
            }

            if let Err(error) = managed.target.make_current() {
                warn!(
                    target_label = managed.target.label(),
                    error = %error,
                    "target_make_current_failed"
                );
                continue;
            }
            if let PresentOutcome::Presented { failed_units } = managed.presenter.try_present(now)
            {
                if failed_units > 0 {
                    debug!(
                        target_label = managed.target.label(),
                        failed_units, "frame_presented_with_failures"
                    );
                }
            }
            if let Err(error) = managed.target.present() {
                warn!(
                    target_label = managed.target.label(),
                    error = %error,
                    "target_present_failed"
                );
            }
            presented += 1;
        }
        presented
    }

    /// Time until the soonest open target is due, bounded by `max_idle_sleep`.
    fn idle_sleep(&self, now: Instant) -> Duration {
        self.targets
            .iter()
            .filter(|managed| !managed.target.should_close())
            .map(|managed| managed.presenter.time_until_due(now))
            .min()
            .unwrap_or(Duration::ZERO)
            .min(self.max_idle_sleep)
    }

    fn shutdown(&mut self) {
        self.set_state(CoordinatorState::ShuttingDown);
        for scheduler in &self.schedulers {
            scheduler.stop();
        }
    }

    fn set_state(&mut self, next: CoordinatorState) {
        if self.state != next {
            info!(from = ?self.state, to = ?next, "coordinator_state");
            self.state = next;
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if self.state == CoordinatorState::Running {
            self.shutdown();
        }
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("state", &self.state)
            .field("schedulers", &self.schedulers.len())
            .field("targets", &self.targets.len())
            .field("pumps", &self.pumps.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::sync::Mutex;

    use super::*;
    use crate::math::Vec2;
    use crate::temporal::Transform2D;
    use crate::work::WorkStatus;

    #[derive(Default)]
    struct FakeCounters {
        make_current_calls: Cell<u32>,
        presents: Cell<u32>,
        running_seen: Cell<bool>,
    }

    struct FakeTarget {
        label: &'static str,
        close_after: u32,
        fail_make_current: Cell<u32>,
        counters: Rc<FakeCounters>,
        watch: Option<Arc<FixedRateScheduler>>,
    }

    impl FakeTarget {
        fn new(label: &'static str, close_after: u32) -> (Self, Rc<FakeCounters>) {
            let counters = Rc::new(FakeCounters::default());
            (
                Self {
                    label,
                    close_after,
                    fail_make_current: Cell::new(0),
                    counters: Rc::clone(&counters),
                    watch: None,
                },
                counters,
            )
        }
    }

    impl PresentationTarget for FakeTarget {
        fn label(&self) -> &str {
            self.label
        }

        fn should_close(&self) -> bool {
            self.counters.presents.get() >= self.close_after
        }

        fn make_current(&mut self) -> Result<(), WorkError> {
            let calls = &self.counters.make_current_calls;
            calls.set(calls.get() + 1);
            if let Some(scheduler) = &self.watch {
                self.counters.running_seen.set(scheduler.is_running());
            }
            let failures_left = self.fail_make_current.get();
            if failures_left > 0 {
                self.fail_make_current.set(failures_left - 1);
                return Err(WorkError::msg("context lost"));
            }
            Ok(())
        }

        fn present(&mut self) -> Result<(), WorkError> {
            let presents = &self.counters.presents;
            presents.set(presents.get() + 1);
            Ok(())
        }
    }

    struct CountingPump(Rc<Cell<u64>>);

    impl EventPump for CountingPump {
        fn poll_events(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    fn presenter(max_hz: f64) -> PresentationScheduler {
        PresentationScheduler::new(max_hz).expect("presenter")
    }

    #[test]
    fn runs_until_every_target_closes_then_stops_schedulers() {
        let scheduler = Arc::new(FixedRateScheduler::new(500.0).expect("scheduler"));
        let (mut target, counters) = FakeTarget::new("main", 3);
        target.watch = Some(Arc::clone(&scheduler));

        let mut coordinator = Coordinator::new(Duration::from_millis(1));
        coordinator.add_scheduler(Arc::clone(&scheduler));
        coordinator.add_target(target, presenter(1000.0));
        assert_eq!(coordinator.state(), CoordinatorState::Idle);

        let summary = coordinator.run().expect("run");

        assert_eq!(summary.frames_presented, 3);
        assert_eq!(counters.presents.get(), 3);
        assert!(counters.running_seen.get());
        assert!(!scheduler.is_running());
        assert_eq!(coordinator.state(), CoordinatorState::ShuttingDown);
    }

    #[test]
    fn closed_targets_are_skipped() {
        let (closed, closed_counters) = FakeTarget::new("closed", 0);
        let (open, open_counters) = FakeTarget::new("open", 2);

        let mut coordinator = Coordinator::new(Duration::from_millis(1));
        coordinator.add_target(closed, presenter(1000.0));
        coordinator.add_target(open, presenter(1000.0));
        coordinator.run().expect("run");

        assert_eq!(closed_counters.make_current_calls.get(), 0);
        assert_eq!(open_counters.presents.get(), 2);
    }

    #[test]
    fn make_current_failure_skips_frame_without_ending_loop() {
        let (target, counters) = FakeTarget::new("flaky", 1);
        target.fail_make_current.set(2);

        let mut coordinator = Coordinator::new(Duration::from_millis(1));
        let id = coordinator.add_target(target, presenter(1000.0));
        let frames = Rc::new(Cell::new(0));
        let f = Rc::clone(&frames);
        coordinator
            .presenter_mut(id)
            .expect("presenter")
            .register(move |_| {
                f.set(f.get() + 1);
                Ok(())
            });

        let summary = coordinator.run().expect("run");

        assert_eq!(counters.make_current_calls.get(), 3);
        assert_eq!(frames.get(), 1);
        assert_eq!(summary.frames_presented, 1);
    }

    #[test]
    fn failing_presentation_unit_does_not_end_loop() {
        let (target, counters) = FakeTarget::new("main", 3);
        let mut coordinator = Coordinator::new(Duration::from_millis(1));
        let id = coordinator.add_target(target, presenter(1000.0));
        coordinator
            .presenter_mut(id)
            .expect("presenter")
            .register(|_| Err(WorkError::msg("draw failed")));

        coordinator.run().expect("run");
        assert_eq!(counters.presents.get(), 3);
    }

    #[test]
    fn event_pumps_are_polled_every_iteration() {
        let (target, _counters) = FakeTarget::new("main", 2);
        let polls = Rc::new(Cell::new(0));

        let mut coordinator = Coordinator::new(Duration::from_millis(1));
        coordinator.add_target(target, presenter(200.0));
        coordinator.add_event_pump(CountingPump(Rc::clone(&polls)));
        let summary = coordinator.run().expect("run");

        assert!(summary.iterations >= 2);
        assert_eq!(polls.get(), summary.iterations);
    }

    #[test]
    fn run_without_targets_starts_and_stops_schedulers() {
        let scheduler = Arc::new(FixedRateScheduler::new(100.0).expect("scheduler"));
        let mut coordinator = Coordinator::new(Duration::from_millis(1));
        coordinator.add_scheduler(Arc::clone(&scheduler));

        let summary = coordinator.run().expect("run");
        assert_eq!(summary, RunSummary::default());
        assert!(!scheduler.is_running());
    }

    #[test]
    fn shutting_down_is_terminal() {
        let scheduler = Arc::new(FixedRateScheduler::new(100.0).expect("scheduler"));
        let (target, counters) = FakeTarget::new("main", 1);
        let mut coordinator = Coordinator::new(Duration::from_millis(1));
        coordinator.add_scheduler(Arc::clone(&scheduler));
        coordinator.add_target(target, presenter(1000.0));

        coordinator.run().expect("first run");
        assert_eq!(coordinator.state(), CoordinatorState::ShuttingDown);

        assert!(matches!(
            coordinator.run(),
            Err(CoordinatorError::AlreadyShutDown)
        ));
        assert_eq!(coordinator.state(), CoordinatorState::ShuttingDown);
        assert!(!scheduler.is_running());
        assert_eq!(counters.presents.get(), 1);
    }

    #[test]
    fn idle_sleep_is_bounded_by_config() {
        let (target, _counters) = FakeTarget::new("main", 10);
        let mut coordinator = Coordinator::new(Duration::from_millis(2));
        let id = coordinator.add_target(target, presenter(10.0));
        let now = Instant::now();
        coordinator
            .presenter_mut(id)
            .expect("presenter")
            .try_present(now);

        assert_eq!(coordinator.idle_sleep(now), Duration::from_millis(2));
    }

    #[test]
    fn presentation_unit_reads_interpolated_pose() {
        let scheduler = Arc::new(FixedRateScheduler::new(100.0).expect("scheduler"));
        let transform = Arc::new(Mutex::new(Transform2D::new()));

        let t = Arc::clone(&transform);
        scheduler.register_recurring(move |ctx| {
            let mut transform = t.lock().expect("transform");
            transform.snapshot();
            if ctx.tick == 0 {
                transform.translate_by(Vec2::new(1.0, 0.0));
            }
            Ok(WorkStatus::Continue)
        });

        let drawn = Rc::new(RefCell::new(Vec::new()));
        let mut presenter = presenter(1000.0);
        let (s, t, d) = (
            Arc::clone(&scheduler),
            Arc::clone(&transform),
            Rc::clone(&drawn),
        );
        presenter.register(move |ctx| {
            let alpha = s.alpha(ctx.now);
            let pose = t.lock().expect("transform").interpolate(alpha);
            d.borrow_mut().push((alpha, pose.position));
            Ok(())
        });

        let t0 = Instant::now();
        scheduler.step(t0);
        presenter.try_present(t0 + Duration::from_millis(5));
        presenter.try_present(t0 + Duration::from_millis(12));

        let drawn = drawn.borrow();
        assert_eq!(drawn.len(), 2);
        let (alpha, position) = drawn[0];
        assert!((alpha - 0.5).abs() < 1.0e-4);
        assert!((position.x - 0.5).abs() < 1.0e-3);
        assert_eq!(drawn[1], (1.0, Vec2::new(1.0, 0.0)));
    }
}
