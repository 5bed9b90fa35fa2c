//! Controller errors.

use rudder_state::StateError;
use thiserror::Error;

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("deployment {0} is missing from the state store")]
    Missing(String),

    /// The deployment record or its lease moved to another owner.
    #[error("deployment {0} is owned by another controller")]
    Superseded(String),

    /// Compare-and-swap kept failing after re-reading.
    #[error("concurrency conflict on {0}: retry budget exhausted")]
    Conflict(String),
}
