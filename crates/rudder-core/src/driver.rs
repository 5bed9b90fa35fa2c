//! Platform driver capability interface.
//!
//! A driver wraps one target platform's control API. Adding a platform
//! means implementing the whole [`PlatformDriver`] trait; the core never
//! branches on platform kind beyond picking the driver.
//!
//! `apply_stage` must be safe to call more than once for the same StageRun:
//! after a crash the controller cannot know whether an in-flight call took
//! effect and simply retries it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::*;

/// Errors reported by a platform driver.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("platform unavailable: {0}")]
    Unavailable(String),

    #[error("stage failed: {0}")]
    StageFailed(String),

    #[error("stage type {0} is not supported by this driver")]
    Unsupported(StageKind),
}

/// Everything a driver needs to execute one attempt of a StageRun.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub application_id: ApplicationId,
    pub deployment_id: DeploymentId,
    pub ordinal: u32,
    pub attempt: u32,
    pub desired: DesiredStateSnapshot,
    pub running_revision: Option<Revision>,
}

/// Output of a successful stage call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutput {
    pub message: Option<String>,
}

impl StageOutput {
    pub fn message(msg: impl Into<String>) -> Self {
        Self {
            message: Some(msg.into()),
        }
    }
}

/// Numeric limits a driver accepts for policy values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverBounds {
    pub max_wait_secs: u64,
    pub max_analysis_secs: u64,
    pub max_stage_timeout_secs: u64,
    pub max_attempts: u32,
    pub max_backoff_ms: u64,
    pub max_replicas: u32,
}

impl Default for DriverBounds {
    fn default() -> Self {
        Self {
            max_wait_secs: 24 * 3600,
            max_analysis_secs: 6 * 3600,
            max_stage_timeout_secs: 6 * 3600,
            max_attempts: 10,
            max_backoff_ms: 10 * 60 * 1000,
            max_replicas: 1000,
        }
    }
}

/// Capability set every target platform must provide.
#[async_trait]
pub trait PlatformDriver: Send + Sync {
    /// Platform this driver handles.
    fn kind(&self) -> PlatformKind;

    /// Limits for policy values on this platform.
    fn bounds(&self) -> DriverBounds {
        DriverBounds::default()
    }

    /// Observe the live state of an application.
    async fn live_state(&self, app: &Application) -> Result<LiveStateSnapshot, DriverError>;

    /// Compare desired against live state.
    fn diff(&self, desired: &DesiredStateSnapshot, live: &LiveStateSnapshot) -> DiffResult;

    /// Execute one attempt of a stage. Must be idempotent.
    async fn apply_stage(
        &self,
        ctx: &StageContext,
        stage: &Stage,
    ) -> Result<StageOutput, DriverError>;

    /// Best-effort abort of an in-flight `apply_stage` call.
    async fn cancel(&self, ctx: &StageContext);

    /// Stages that undo a failed deployment, in execution order.
    fn rollback_stages(&self, deployment: &Deployment) -> Vec<Stage> {
        default_rollback_stages(deployment)
    }
}

/// Undo every workload-mutating stage that ran (succeeded or failed part way),
/// most recent first. A deployment that never touched the workload still gets
/// a single rollback to the previously running revision.
pub fn default_rollback_stages(deployment: &Deployment) -> Vec<Stage> {
    let restore_revision = deployment.running_revision.clone();
    let mut stages: Vec<Stage> = deployment
        .pipeline
        .iter()
        .rev()
        .filter(|s| s.kind().mutates_workload())
        .filter(|s| matches!(s.status, StageStatus::Succeeded | StageStatus::Failed))
        .map(|s| Stage::Rollback {
            undo_ordinal: Some(s.ordinal),
            restore_revision: restore_revision.clone(),
        })
        .collect();

    if stages.is_empty() {
        stages.push(Stage::Rollback {
            undo_ordinal: None,
            restore_revision,
        });
    }
    stages
}

/// Drivers indexed by the platform they handle.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<PlatformKind, Arc<dyn PlatformDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver, replacing any previous one for the same platform.
    pub fn register(&mut self, driver: Arc<dyn PlatformDriver>) {
        self.drivers.insert(driver.kind(), driver);
    }

    pub fn with(mut self, driver: Arc<dyn PlatformDriver>) -> Self {
        self.register(driver);
        self
    }

    pub fn get(&self, kind: PlatformKind) -> Option<Arc<dyn PlatformDriver>> {
        self.drivers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<PlatformKind> {
        self.drivers.keys().copied().collect()
    }
}
