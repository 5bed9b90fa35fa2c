//! Record envelope for the Rudder state store.

use serde::{Deserialize, Serialize};

/// A stored record together with its version.
///
/// Versions start at 1 and increase by one on every successful write.
/// Compare-and-swap callers pass the version they read; `None` means the
/// record must not exist yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u64,
    pub record: T,
}

impl<T> Versioned<T> {
    pub fn new(version: u64, record: T) -> Self {
        Self { version, record }
    }

    pub fn into_record(self) -> T {
        self.record
    }
}

/// Outcome of atomically creating a deployment and claiming the
/// application's active marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Deployment stored at version 1 and marker claimed.
    Created,
    /// The marker changed since it was read. Re-read and retry.
    Conflict,
    /// Another deployment is already active for the application.
    Occupied(String),
}
