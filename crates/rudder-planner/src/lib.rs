//! rudder-planner — turns a desired/live diff into a pipeline.
//!
//! - **`validate`** — numeric policy checks against driver bounds
//! - **`template`** — stage sequences for quick sync, canary and blue-green
//! - **`planner`** — diff classification and path selection

pub mod error;
pub mod planner;
pub mod template;
pub mod validate;

pub use error::{PlanError, PlanResult};
pub use planner::{PipelinePlan, PlanOptions, PlanOutcome, Planner};
pub use validate::validate_policy;
