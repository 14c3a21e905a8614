use std::error::Error as StdError;
use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkId(pub(crate) u64);

impl WorkId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "work#{}", self.0)
    }
}

/// What a recurring unit wants after a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    Continue,
    /// Deregister without reporting a failure.
    Done,
}

#[derive(Debug, Error)]
pub enum WorkError {
    #[error("{0}")]
    Message(String),
    #[error("work unit panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

impl WorkError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&'static str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked(message)
    }
}

pub type WorkResult = Result<WorkStatus, WorkError>;

/// Passed to every unit run by a fixed-rate scheduler.
#[derive(Debug, Clone, Copy)]
pub struct TickContext {
    /// Zero-based count of ticks run by this scheduler.
    pub tick: u64,
    pub now: Instant,
    /// Nominal tick interval. Use this as the simulation step, not wall time.
    pub interval: Duration,
}

impl TickContext {
    pub fn dt_seconds(&self) -> f32 {
        self.interval.as_secs_f32()
    }
}

/// Passed to every unit run by an accepted presentation attempt.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    pub frame: u64,
    pub now: Instant,
    /// Time since the previous accepted presentation, if any.
    pub since_last: Option<Duration>,
}

pub type RecurringWork = Box<dyn FnMut(&TickContext) -> WorkResult + Send>;
pub type OneShotWork = Box<dyn FnOnce(&TickContext) -> Result<(), WorkError> + Send>;
pub type PresentWork = Box<dyn FnMut(&FrameContext) -> Result<(), WorkError>>;

#[cfg(test)]
mod tests {
    use std::panic;

    use super::*;

    #[test]
    fn panic_payloads_become_messages() {
        let payload = panic::catch_unwind(|| panic!("boom")).expect_err("should panic");
        let error = WorkError::from_panic(payload);
        assert_eq!(error.to_string(), "work unit panicked: boom");

        let payload =
            panic::catch_unwind(|| panic!("{} {}", "formatted", 7)).expect_err("should panic");
        let error = WorkError::from_panic(payload);
        assert_eq!(error.to_string(), "work unit panicked: formatted 7");
    }

    #[test]
    fn boxed_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        let boxed: Box<dyn StdError + Send + Sync> = Box::new(io);
        let error = WorkError::from(boxed);
        assert_eq!(error.to_string(), "disk");
    }
}
