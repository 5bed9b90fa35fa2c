//! Planner — decides whether an application needs a deployment and
//! which pipeline it gets.
//!
//! Path selection:
//! - empty diff → [`PlanOutcome::NoChange`] (or a quick sync when forced)
//! - config-only diff with quick sync enabled → quick sync
//! - any other diff → the progressive template when one is configured,
//!   quick sync otherwise

use rudder_core::{
    Application, DesiredStateSnapshot, Diff, DiffClass, DiffResult, DriverBounds,
    LiveStateSnapshot, PipelinePath, PlatformDriver, Revision, Stage, StageRun,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PlanError, PlanResult};
use crate::template;
use crate::validate::validate_policy;

/// Caller-supplied planning switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanOptions {
    /// Plan a quick sync even when the diff is empty (manual trigger).
    pub force: bool,
}

impl PlanOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

/// An ordered, numbered stage sequence ready to become a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePlan {
    pub path: PipelinePath,
    pub stages: Vec<StageRun>,
    pub summary: String,
    /// `None` when a sync was forced over an empty diff.
    pub diff: Option<Diff>,
    /// Revision the platform reported as running when the plan was made.
    pub live_revision: Option<Revision>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    Plan(PipelinePlan),
    NoChange,
}

/// Stateless pipeline planner.
#[derive(Debug, Clone, Copy, Default)]
pub struct Planner;

impl Planner {
    pub fn new() -> Self {
        Self
    }

    /// Observe live state through `driver`, then plan against it.
    pub async fn plan(
        &self,
        app: &Application,
        desired: &DesiredStateSnapshot,
        driver: &dyn PlatformDriver,
        options: PlanOptions,
    ) -> PlanResult<PlanOutcome> {
        let bounds = driver.bounds();
        validate_policy(&app.policy, &bounds)?;

        let live = driver
            .live_state(app)
            .await
            .map_err(|e| PlanError::PlatformUnavailable(e.to_string()))?;
        let diff = driver.diff(desired, &live);
        self.plan_diff(app, &bounds, diff, &live, options)
    }

    /// Plan from an already computed diff.
    pub fn plan_diff(
        &self,
        app: &Application,
        bounds: &DriverBounds,
        diff: DiffResult,
        live: &LiveStateSnapshot,
        options: PlanOptions,
    ) -> PlanResult<PlanOutcome> {
        validate_policy(&app.policy, bounds)?;
        let policy = &app.policy;

        let diff = match diff {
            DiffResult::NoChange if !options.force => {
                debug!(application = %app.id, "desired state matches live state");
                return Ok(PlanOutcome::NoChange);
            }
            DiffResult::NoChange => None,
            DiffResult::Changed(diff) => Some(diff),
        };

        if let Some(replicas) = diff.as_ref().and_then(|d| d.target_replicas)
            && replicas > bounds.max_replicas
        {
            return Err(PlanError::InvalidPolicy(format!(
                "target replicas {replicas} exceed driver limit {}",
                bounds.max_replicas
            )));
        }

        // Forced syncs over an empty diff are always quick syncs.
        let progressive = match (&diff, &policy.progressive) {
            (None, _) | (_, None) => None,
            (Some(d), Some(_)) if d.class == DiffClass::ConfigOnly && policy.quick_sync => None,
            (Some(_), Some(cfg)) => Some(cfg),
        };

        let (path, stages) = match progressive {
            Some(cfg) => (
                PipelinePath::Progressive,
                template::progressive(
                    cfg,
                    &policy.approval,
                    diff.as_ref().and_then(|d| d.target_replicas),
                ),
            ),
            None => (PipelinePath::QuickSync, template::quick_sync()),
        };

        let stages: Vec<StageRun> = stages
            .into_iter()
            .enumerate()
            .map(|(i, stage)| {
                let timeout = stage_timeout(&stage, policy.stage_timeout_secs);
                StageRun::new(i as u32, stage, policy.retry, timeout)
            })
            .collect();

        let summary = summarize(path, diff.as_ref(), &stages);
        info!(
            application = %app.id,
            ?path,
            stages = stages.len(),
            %summary,
            "pipeline planned"
        );

        Ok(PlanOutcome::Plan(PipelinePlan {
            path,
            stages,
            summary,
            diff,
            live_revision: live.revision.clone(),
        }))
    }
}

/// Timeout for one stage attempt. Timed stages get their own duration on
/// top of the driver call budget; approval gates never time out.
fn stage_timeout(stage: &Stage, base: u64) -> u64 {
    match stage {
        Stage::Wait { duration_secs } | Stage::Analysis { duration_secs } => {
            duration_secs.saturating_add(base)
        }
        Stage::ManualApproval { .. } => 0,
        _ => base,
    }
}

fn summarize(path: PipelinePath, diff: Option<&Diff>, stages: &[StageRun]) -> String {
    let what = match diff {
        None => "forced sync".to_string(),
        Some(d) if d.changes.is_empty() => format!("{:?} change", d.class),
        Some(d) => format!("{:?} change in {}", d.class, d.changes.join(", ")),
    };
    let pipeline: Vec<String> = stages.iter().map(|s| s.kind().to_string()).collect();
    let path = match path {
        PipelinePath::QuickSync => "quick sync",
        PipelinePath::Progressive => "progressive",
    };
    format!("{what}; {path}: {}", pipeline.join(" → "))
}
