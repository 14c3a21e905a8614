pub(crate) mod bootstrap;
mod spinner;
mod window;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use cadence::{
    CadenceConfig, ConfigError, Coordinator, CoordinatorError, FixedRateScheduler, MetricsHandle,
    PresentationScheduler, RunSummary, SchedulerError, SchedulerOptions, WorkError, WorkStatus,
};
use thiserror::Error;
use tracing::info;
use winit::error::EventLoopError;
use winit::event_loop::EventLoop;

use spinner::{draw_quad, Spinner};
use window::{SharedSurface, SurfaceError, WindowSurface, WindowTarget, WinitPump};

const WINDOW_TITLE: &str = "Cadence Demo";
const WINDOW_WIDTH: u32 = 960;
const WINDOW_HEIGHT: u32 = 540;
const TITLE_REFRESH_FRAMES: u64 = 30;

#[derive(Debug, Error)]
pub(crate) enum DemoError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error("failed to create event loop: {0}")]
    CreateEventLoop(#[source] EventLoopError),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
}

pub(crate) fn run(config: CadenceConfig) -> Result<RunSummary, DemoError> {
    let event_loop = EventLoop::new().map_err(DemoError::CreateEventLoop)?;
    let surface: SharedSurface = Rc::new(RefCell::new(WindowSurface::open(
        &event_loop,
        WINDOW_TITLE,
        WINDOW_WIDTH,
        WINDOW_HEIGHT,
    )?));

    let simulation = Arc::new(FixedRateScheduler::with_options(SchedulerOptions {
        label: "sim".to_string(),
        hz: config.tick_hz,
        metrics_log_interval: config.metrics_log_interval(),
    })?);
    let spinner = Arc::new(Mutex::new(Spinner::new()));
    register_simulation(&simulation, Arc::clone(&spinner));

    let mut presenter = PresentationScheduler::new(config.max_present_hz)?
        .with_label("main_window")
        .with_metrics_log_interval(config.metrics_log_interval());
    register_presentation(&mut presenter, &simulation, spinner, Rc::clone(&surface));

    let mut coordinator = Coordinator::from_config(&config);
    coordinator.add_scheduler(Arc::clone(&simulation));
    coordinator.add_target(WindowTarget::new(Rc::clone(&surface)), presenter);
    coordinator.add_event_pump(WinitPump::new(event_loop, surface));

    info!(
        tick_hz = config.tick_hz,
        max_present_hz = config.max_present_hz,
        "demo_ready"
    );
    Ok(coordinator.run()?)
}

fn register_simulation(simulation: &FixedRateScheduler, spinner: Arc<Mutex<Spinner>>) {
    simulation.register_one_shot(|ctx| {
        info!(tick = ctx.tick, "simulation_started");
        Ok(())
    });
    simulation.register_recurring(move |ctx| {
        let mut spinner = spinner
            .lock()
            .map_err(|_| WorkError::msg("spinner state poisoned"))?;
        spinner.tick(ctx)?;
        Ok(WorkStatus::Continue)
    });
}

fn register_presentation(
    presenter: &mut PresentationScheduler,
    simulation: &FixedRateScheduler,
    spinner: Arc<Mutex<Spinner>>,
    surface: SharedSurface,
) {
    let clock = simulation.handle();
    let draw_surface = Rc::clone(&surface);
    presenter.register(move |ctx| {
        let alpha = clock.alpha(ctx.now);
        let model = spinner
            .lock()
            .map_err(|_| WorkError::msg("spinner state poisoned"))?
            .transform
            .interpolated_matrix(alpha);
        let mut surface = draw_surface.borrow_mut();
        let (width, height) = (surface.width(), surface.height());
        draw_quad(surface.frame_mut(), width, height, &model);
        Ok(())
    });

    let tick_metrics = simulation.metrics();
    let frame_metrics = presenter.metrics();
    presenter.register(move |ctx| {
        if ctx.frame % TITLE_REFRESH_FRAMES == 0 {
            surface
                .borrow()
                .set_title(&format_title(&tick_metrics, &frame_metrics));
        }
        Ok(())
    });
}

fn format_title(tick_metrics: &MetricsHandle, frame_metrics: &MetricsHandle) -> String {
    let frames = frame_metrics.latest();
    format!(
        "{WINDOW_TITLE} | TPS: {} | FPS: {} | Frame: {}",
        format_measured(tick_metrics.latest().map(|ticks| ticks.rate_hz), 1),
        format_measured(frames.map(|frames| frames.rate_hz), 1),
        format_measured(frames.map(|frames| frames.avg_duration_ms), 2),
    )
}

fn format_measured(value: Option<f32>, precision: usize) -> String {
    match value {
        Some(value) => format!("{value:.precision$}"),
        None => "--".to_string(),
    }
}
