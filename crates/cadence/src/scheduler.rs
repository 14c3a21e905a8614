//! Fixed-rate execution of simulation work on a dedicated thread.
//!
//! A [`FixedRateScheduler`] owns two collections of work: recurring units,
//! run once per tick in registration order until they finish or fail, and
//! one-shot units, drained and run once at the start of the next tick.
//!
//! Both collections sit behind one short-held mutex. A tick copies what it
//! needs and releases the lock before running anything, so a unit may
//! register or remove work (including itself) without deadlocking. Removals
//! requested while a tick is running take effect from the next tick.
//!
//! The scheduler also answers [`FixedRateScheduler::alpha`], the fraction of
//! the current tick interval that has elapsed, which presentation code feeds
//! to [`crate::TemporalState::interpolate`].

use std::fmt;
use std::io;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{interval_for_hz, normalize_non_zero_duration, ConfigError};
use crate::metrics::{MetricsHandle, RateAccumulator};
use crate::work::{
    OneShotWork, RecurringWork, TickContext, WorkError, WorkId, WorkResult, WorkStatus,
};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn execution thread for scheduler {label}: {source}")]
    Spawn {
        label: String,
        #[source]
        source: io::Error,
    },
    #[error("scheduler {label} cannot be started from its own stopping execution thread")]
    StartWhileStopping { label: String },
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub label: String,
    pub hz: f64,
    pub metrics_log_interval: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            label: "fixed".to_string(),
            hz: 60.0,
            metrics_log_interval: Duration::from_secs(1),
        }
    }
}

/// Work done by a single call to [`FixedRateScheduler::step`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub one_shots_run: usize,
    pub recurring_run: usize,
    pub deregistered: usize,
}

pub struct FixedRateScheduler {
    shared: Arc<Shared>,
    hz: f64,
    metrics_log_interval: Duration,
    metrics: MetricsHandle,
    control: Arc<WorkerControl>,
}

struct Worker {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

enum WorkerState {
    Idle,
    Running(Worker),
    /// Signalled to exit; `thread` may still be finishing its current tick.
    Stopping { thread: ThreadId },
}

/// Lifecycle of the execution thread. Callers that find it `Stopping` wait
/// on `changed` until the thread has exited.
struct WorkerControl {
    state: Mutex<WorkerState>,
    changed: Condvar,
}

impl WorkerControl {
    fn new() -> Self {
        Self {
            state: Mutex::new(WorkerState::Idle),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        lock_or_recover(&self.state, "worker")
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, WorkerState>) -> MutexGuard<'a, WorkerState> {
        match self.changed.wait(guard) {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(lock = "worker", "scheduler lock poisoned; recovered inner value");
                poisoned.into_inner()
            }
        }
    }

    /// Marks `thread` as exited unless a newer thread has already taken over.
    fn finish(&self, thread: ThreadId) {
        let mut state = self.lock();
        if matches!(*state, WorkerState::Stopping { thread: stopping } if stopping == thread) {
            *state = WorkerState::Idle;
            self.changed.notify_all();
        }
    }
}

impl FixedRateScheduler {
    pub fn new(hz: f64) -> Result<Self, SchedulerError> {
        Self::with_options(SchedulerOptions {
            label: format!("{hz}hz"),
            hz,
            ..SchedulerOptions::default()
        })
    }

    pub fn with_options(options: SchedulerOptions) -> Result<Self, SchedulerError> {
        let interval = interval_for_hz("hz", options.hz)?;
        let metrics_log_interval =
            normalize_non_zero_duration(options.metrics_log_interval, Duration::from_secs(1));
        Ok(Self {
            shared: Arc::new(Shared {
                label: options.label,
                interval,
                queue: Mutex::new(WorkQueue::default()),
                last_tick: Mutex::new(None),
                ticks: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
            }),
            hz: options.hz,
            metrics_log_interval,
            metrics: MetricsHandle::default(),
            control: Arc::new(WorkerControl::new()),
        })
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn hz(&self) -> f64 {
        self.hz
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn metrics(&self) -> MetricsHandle {
        self.metrics.clone()
    }

    pub fn register_recurring<F>(&self, work: F) -> WorkId
    where
        F: FnMut(&TickContext) -> WorkResult + Send + 'static,
    {
        self.shared.register_recurring(Box::new(work))
    }

    pub fn register_one_shot<F>(&self, work: F)
    where
        F: FnOnce(&TickContext) -> Result<(), WorkError> + Send + 'static,
    {
        self.shared.register_one_shot(Box::new(work));
    }

    /// Returns false if `id` was not registered as recurring work.
    pub fn remove(&self, id: WorkId) -> bool {
        self.shared.remove(id)
    }

    pub fn recurring_count(&self) -> usize {
        lock_or_recover(&self.shared.queue, "queue").recurring.len()
    }

    pub fn pending_one_shots(&self) -> usize {
        lock_or_recover(&self.shared.queue, "queue").one_shot.len()
    }

    pub fn tick_count(&self) -> u64 {
        self.shared.ticks.load(Ordering::Acquire)
    }

    /// Blend fraction for `now`, clamped to `[0, 1]`.
    ///
    /// Returns 1.0 until the scheduler has been started or stepped.
    pub fn alpha(&self, now: Instant) -> f32 {
        self.shared.alpha(now)
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.control.lock(), WorkerState::Running(_))
    }

    /// Spawns the execution thread. Does nothing if it is already running.
    ///
    /// If a `stop` is in progress on another thread, waits for the previous
    /// execution thread to exit first, so at most one is ever active.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let current = thread::current().id();
        let mut state = self.control.lock();
        loop {
            let stopping = match &*state {
                WorkerState::Idle => break,
                WorkerState::Running(_) => {
                    debug!(scheduler = %self.shared.label, "scheduler_already_running");
                    return Ok(());
                }
                WorkerState::Stopping { thread } => *thread,
            };
            if stopping == current {
                return Err(SchedulerError::StartWhileStopping {
                    label: self.shared.label.clone(),
                });
            }
            state = self.control.wait(state);
        }

        let start = Instant::now();
        *lock_or_recover(&self.shared.last_tick, "last_tick") = Some(start);

        let (stop_tx, stop_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let control = Arc::clone(&self.control);
        let metrics = self.metrics.clone();
        let metrics_log_interval = self.metrics_log_interval;
        let thread = thread::Builder::new()
            .name(format!("cadence-{}", self.shared.label))
            .spawn(move || {
                run_worker(shared, stop_rx, start, metrics, metrics_log_interval);
                control.finish(thread::current().id());
            })
            .map_err(|source| SchedulerError::Spawn {
                label: self.shared.label.clone(),
                source,
            })?;
        *state = WorkerState::Running(Worker { stop_tx, thread });

        info!(
            scheduler = %self.shared.label,
            hz = self.hz,
            interval_us = self.shared.interval.as_micros() as u64,
            "scheduler_started"
        );
        Ok(())
    }

    /// Signals the execution thread and waits for it to exit.
    ///
    /// A tick in progress runs to completion first. Once this returns no
    /// registered unit runs again until the next `start`, including when
    /// several threads call `stop` at once. Does nothing if the scheduler is
    /// not running. When called from one of this scheduler's own units the
    /// thread cannot wait for itself, so this only signals it.
    pub fn stop(&self) {
        let current = thread::current().id();
        let mut state = self.control.lock();
        let worker = loop {
            match mem::replace(&mut *state, WorkerState::Idle) {
                WorkerState::Idle => return,
                WorkerState::Running(worker) => break worker,
                WorkerState::Stopping { thread } => {
                    *state = WorkerState::Stopping { thread };
                    if thread == current {
                        return;
                    }
                    state = self.control.wait(state);
                }
            }
        };

        let worker_thread = worker.thread.thread().id();
        *state = WorkerState::Stopping {
            thread: worker_thread,
        };
        drop(state);

        let _ = worker.stop_tx.send(());
        if worker_thread == current {
            warn!(scheduler = %self.shared.label, "scheduler_stop_from_own_thread");
            return;
        }

        if worker.thread.join().is_err() {
            error!(scheduler = %self.shared.label, "scheduler_thread_panicked");
        }
        self.control.finish(worker_thread);
        info!(
            scheduler = %self.shared.label,
            ticks = self.tick_count(),
            "scheduler_stopped"
        );
    }

    /// Runs one tick synchronously on the caller's thread, stamped at `now`.
    ///
    /// Intended for headless stepping and tests; the per-tick rules are the
    /// same as on the execution thread.
    pub fn step(&self, now: Instant) -> TickReport {
        self.shared.run_tick(now)
    }
}

impl Drop for FixedRateScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for FixedRateScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedRateScheduler")
            .field("label", &self.shared.label)
            .field("hz", &self.hz)
            .field("interval", &self.shared.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Cloneable access to a scheduler's work collections and clock.
///
/// Work units capture a handle to register follow-up work, remove other
/// units or read `alpha` without owning the scheduler itself.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    pub fn register_recurring<F>(&self, work: F) -> WorkId
    where
        F: FnMut(&TickContext) -> WorkResult + Send + 'static,
    {
        self.shared.register_recurring(Box::new(work))
    }

    pub fn register_one_shot<F>(&self, work: F)
    where
        F: FnOnce(&TickContext) -> Result<(), WorkError> + Send + 'static,
    {
        self.shared.register_one_shot(Box::new(work));
    }

    pub fn remove(&self, id: WorkId) -> bool {
        self.shared.remove(id)
    }

    pub fn alpha(&self, now: Instant) -> f32 {
        self.shared.alpha(now)
    }
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("label", &self.shared.label)
            .finish()
    }
}

/// `(now - last_tick) / interval`, clamped to `[0, 1]`.
///
/// A zero interval yields 1.0 so callers render the current pose.
pub fn blend_fraction(now: Instant, last_tick: Instant, interval: Duration) -> f32 {
    if interval.is_zero() {
        return 1.0;
    }
    let elapsed = now.saturating_duration_since(last_tick);
    let ratio = elapsed.as_secs_f64() / interval.as_secs_f64();
    ratio.clamp(0.0, 1.0) as f32
}

type SharedUnit = Arc<Mutex<RecurringWork>>;

#[derive(Clone)]
struct RecurringEntry {
    id: WorkId,
    unit: SharedUnit,
}

#[derive(Default)]
struct WorkQueue {
    recurring: Vec<RecurringEntry>,
    one_shot: Vec<OneShotWork>,
}

struct Shared {
    label: String,
    interval: Duration,
    queue: Mutex<WorkQueue>,
    last_tick: Mutex<Option<Instant>>,
    ticks: AtomicU64,
    next_id: AtomicU64,
}

impl Shared {
    fn register_recurring(&self, work: RecurringWork) -> WorkId {
        let id = WorkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock_or_recover(&self.queue, "queue")
            .recurring
            .push(RecurringEntry {
                id,
                unit: Arc::new(Mutex::new(work)),
            });
        debug!(scheduler = %self.label, work = %id, "work_unit_registered");
        id
    }

    fn register_one_shot(&self, work: OneShotWork) {
        lock_or_recover(&self.queue, "queue").one_shot.push(work);
    }

    fn remove(&self, id: WorkId) -> bool {
        let mut queue = lock_or_recover(&self.queue, "queue");
        let before = queue.recurring.len();
        queue.recurring.retain(|entry| entry.id != id);
        let removed = queue.recurring.len() != before;
        if removed {
            debug!(scheduler = %self.label, work = %id, "work_unit_removed");
        }
        removed
    }

    fn alpha(&self, now: Instant) -> f32 {
        match *lock_or_recover(&self.last_tick, "last_tick") {
            Some(last_tick) => blend_fraction(now, last_tick, self.interval),
            None => 1.0,
        }
    }

    fn run_tick(&self, now: Instant) -> TickReport {
        *lock_or_recover(&self.last_tick, "last_tick") = Some(now);
        let tick = self.ticks.fetch_add(1, Ordering::AcqRel);
        let ctx = TickContext {
            tick,
            now,
            interval: self.interval,
        };

        let one_shots = mem::take(&mut lock_or_recover(&self.queue, "queue").one_shot);
        let one_shots_run = one_shots.len();
        for work in one_shots {
            let outcome = panic::catch_unwind(AssertUnwindSafe(move || work(&ctx)))
                .unwrap_or_else(|payload| Err(WorkError::from_panic(payload)));
            if let Err(error) = outcome {
                warn!(scheduler = %self.label, tick, error = %error, "one_shot_failed");
            }
        }

        let recurring = lock_or_recover(&self.queue, "queue").recurring.clone();
        let mut finished = Vec::new();
        for entry in &recurring {
            let outcome = {
                let mut unit = lock_or_recover(&entry.unit, "work_unit");
                panic::catch_unwind(AssertUnwindSafe(|| (&mut *unit)(&ctx)))
                    .unwrap_or_else(|payload| Err(WorkError::from_panic(payload)))
            };
            match outcome {
                Ok(WorkStatus::Continue) => {}
                Ok(WorkStatus::Done) => {
                    debug!(scheduler = %self.label, tick, work = %entry.id, "work_unit_done");
                    finished.push(entry.id);
                }
                Err(error) => {
                    warn!(
                        scheduler = %self.label,
                        tick,
                        work = %entry.id,
                        error = %error,
                        "work_unit_failed"
                    );
                    finished.push(entry.id);
                }
            }
        }

        if !finished.is_empty() {
            lock_or_recover(&self.queue, "queue")
                .recurring
                .retain(|entry| !finished.contains(&entry.id));
        }

        TickReport {
            tick,
            one_shots_run,
            recurring_run: recurring.len(),
            deregistered: finished.len(),
        }
    }
}

fn run_worker(
    shared: Arc<Shared>,
    stop_rx: Receiver<()>,
    start: Instant,
    metrics: MetricsHandle,
    metrics_log_interval: Duration,
) {
    let interval = shared.interval;
    let mut deadline = start + interval;
    let mut accumulator = RateAccumulator::new(metrics_log_interval, start);

    loop {
        let wait = deadline.saturating_duration_since(Instant::now());
        match stop_rx.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => {
                if Instant::now() < deadline {
                    continue;
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let tick_start = Instant::now();
        shared.run_tick(tick_start);
        let tick_end = Instant::now();
        accumulator.record(tick_end.saturating_duration_since(tick_start));

        if let Some(snapshot) = accumulator.maybe_snapshot(tick_end) {
            metrics.publish(snapshot);
            info!(
                scheduler = %shared.label,
                observed_hz = snapshot.rate_hz,
                avg_tick_ms = snapshot.avg_duration_ms,
                ticks = snapshot.count,
                "tick_metrics"
            );
        }

        let plan = plan_next_deadline(deadline, tick_end, interval);
        if plan.dropped_ticks > 0 {
            warn!(
                scheduler = %shared.label,
                dropped_ticks = plan.dropped_ticks,
                "tick_backlog_dropped"
            );
        }
        deadline = plan.deadline;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeadlinePlan {
    deadline: Instant,
    dropped_ticks: u32,
}

/// Next deadline on the fixed grid. When the grid has moved past `now`, only
/// the latest missed point is kept (and fires immediately); earlier ones are
/// dropped rather than replayed back to back.
fn plan_next_deadline(deadline: Instant, now: Instant, interval: Duration) -> DeadlinePlan {
    let next = deadline + interval;
    if next >= now {
        return DeadlinePlan {
            deadline: next,
            dropped_ticks: 0,
        };
    }

    let behind = now.duration_since(next);
    let skipped = behind.as_nanos() / interval.as_nanos().max(1);
    let skipped = u32::try_from(skipped).unwrap_or(u32::MAX);
    DeadlinePlan {
        deadline: next + interval.saturating_mul(skipped),
        dropped_ticks: skipped,
    }
}

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, lock: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(lock, "scheduler lock poisoned; recovered inner value");
            poisoned.into_inner()
        }
    }
}
