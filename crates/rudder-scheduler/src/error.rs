//! Scheduler error types.

use rudder_controller::ControllerError;
use rudder_core::{PlatformKind, ProviderError};
use rudder_planner::PlanError;
use rudder_state::StateError;
use thiserror::Error;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("application not found: {0}")]
    ApplicationNotFound(String),

    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("no driver registered for platform {0}")]
    UnsupportedPlatform(PlatformKind),

    #[error("revision {requested} is not available; latest is {latest}")]
    RevisionUnavailable { requested: String, latest: String },

    /// The deployment is active but its controller is not reachable.
    #[error("controller for deployment {0} is not running")]
    ControllerUnavailable(String),

    #[error("concurrency conflict on {0}: retry budget exhausted")]
    Conflict(String),

    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Controller(#[from] ControllerError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
