//! rudder-controller — executes one deployment's pipeline.
//!
//! A [`DeploymentController`] is a task that owns a single deployment
//! record. It runs stages strictly in ordinal order, retries failed
//! attempts on a persisted schedule, pauses at approval gates, honours
//! cancellation and the deployment-wide deadline, and synthesizes a
//! rollback when a failed deployment has auto-rollback enabled.
//!
//! Every transition is committed to the state store with compare-and-swap
//! before it is handed to the reporter. A controller stopped by shutdown
//! writes nothing further to the deployment, so a new controller can
//! resume from the last committed record. A commit that finds the record
//! changed by someone else is never retried: the controller stops.

pub mod command;
pub mod controller;
pub mod error;

pub use command::{CommandOutcome, CommandSender, ControlCommand, channel};
pub use controller::{ControllerExit, DeploymentController};
pub use error::{ControllerError, ControllerResult};
