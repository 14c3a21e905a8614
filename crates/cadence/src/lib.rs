pub mod config;
pub mod coordinator;
pub mod math;
pub mod metrics;
pub mod presentation;
pub mod scheduler;
pub mod temporal;
pub mod work;

pub use config::{
    interval_for_hz, CadenceConfig, ConfigError, CONFIG_PATH_ENV_VAR, MAX_PRESENT_HZ_ENV_VAR,
    TICK_HZ_ENV_VAR,
};
pub use coordinator::{
    Coordinator, CoordinatorError, CoordinatorState, EventPump, PresentationTarget, RunSummary,
    TargetId,
};
pub use math::{lerp, lerp_angle, wrap_angle, Mat3, Mat4, Vec2, Vec3};
pub use metrics::{MetricsHandle, RateSnapshot};
pub use presentation::{PresentOutcome, PresentationScheduler};
pub use scheduler::{
    blend_fraction, FixedRateScheduler, SchedulerError, SchedulerHandle, SchedulerOptions,
    TickReport,
};
pub use temporal::{Pose, Pose2D, Pose3D, TemporalState, Transform2D, Transform3D};
pub use work::{FrameContext, TickContext, WorkError, WorkId, WorkResult, WorkStatus};
