//! Planner errors.

use thiserror::Error;

pub type PlanResult<T> = Result<T, PlanError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    /// The driver could not observe live state. Retried on the next tick.
    #[error("platform unavailable: {0}")]
    PlatformUnavailable(String),

    /// Policy values are out of range. Blocks planning until the
    /// application's configuration changes.
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
}
