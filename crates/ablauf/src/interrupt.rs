//! Suspension interrupts
//!
//! A replay cycle ends in one of two ways short of completion: a step
//! suspends the workflow (sleep, wait, pause) or something actually fails.
//! Interrupts are tagged variants on the replay outcome channel rather than
//! error subclasses, so error-handling paths cannot swallow them.

use crate::error::EngineError;

/// Tagged sentinel that suspends a replay cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interrupt {
    /// Sleep until `wake_at` (ms epoch). Thrown by `sleep`/`sleep_until` and
    /// by `run` steps with a pending retry.
    Sleep { step: String, wake_at: i64 },

    /// Wait for an external event, optionally bounded by `timeout_at`.
    Wait {
        step: String,
        timeout_at: Option<i64>,
    },

    /// The instance is paused.
    Pause,
}

impl Interrupt {
    /// Name of the step that raised the interrupt, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::Sleep { step, .. } | Self::Wait { step, .. } => Some(step),
            Self::Pause => None,
        }
    }
}

/// Outcome channel threaded through step-context methods and out of `run`.
///
/// `?` inside a workflow body propagates both suspensions and failures; the
/// runner matches on the variant to decide whether to set an alarm or persist
/// an error.
#[derive(Debug)]
pub enum RunError {
    /// Flow control: the workflow suspends and will be replayed later.
    Suspend(Interrupt),

    /// A domain error; the workflow transitions to `errored` with the
    /// serialized envelope preserved.
    Fail(EngineError),

    /// An arbitrary user error; the workflow transitions to `errored` with
    /// the message as-is.
    Other(anyhow::Error),
}

/// Result alias for workflow bodies and step-context methods.
pub type RunResult<T> = Result<T, RunError>;

impl From<Interrupt> for RunError {
    fn from(interrupt: Interrupt) -> Self {
        Self::Suspend(interrupt)
    }
}

impl From<EngineError> for RunError {
    fn from(err: EngineError) -> Self {
        Self::Fail(err)
    }
}

impl From<anyhow::Error> for RunError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err)
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Suspend(Interrupt::Sleep { step, wake_at }) => {
                write!(f, "suspended: step {step:?} sleeping until {wake_at}")
            }
            Self::Suspend(Interrupt::Wait { step, timeout_at }) => match timeout_at {
                Some(at) => write!(f, "suspended: step {step:?} waiting until {at}"),
                None => write!(f, "suspended: step {step:?} waiting"),
            },
            Self::Suspend(Interrupt::Pause) => write!(f, "suspended: paused"),
            Self::Fail(err) => write!(f, "{err}"),
            Self::Other(err) => write!(f, "{err}"),
        }
    }
}
