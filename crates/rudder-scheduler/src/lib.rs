//! rudder-scheduler — the top-level reconciliation loop.
//!
//! Runs one evaluation task per registered application and one controller
//! task per active deployment. The scheduler:
//!
//! - Fetches desired state on a polling cadence or on config-changed events
//! - Re-observes live state on a slower drift cadence
//! - Plans and creates deployments, claiming the application's active
//!   marker with compare-and-swap
//! - Routes approve / cancel commands to the owning controller
//! - Resumes unfinished deployments after a restart
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   ├── StateStore (applications, deployments, markers, evaluations)
//!   ├── DesiredStateProvider
//!   ├── DriverRegistry → PlatformDriver per platform
//!   ├── Per-application slot
//!   │     └── evaluation task (ticks, drift, events, triggers)
//!   └── Per-deployment slot
//!         └── DeploymentController task + command channel
//! ```

pub mod error;
mod evaluate;
pub mod scheduler;
mod worker;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{RecoveryReport, Scheduler, TriggerOutcome};
