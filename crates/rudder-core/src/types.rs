//! Domain types shared across Rudder crates.
//!
//! These types describe applications, desired/live snapshots, deployments
//! and their pipelines. All of them serialize to JSON for storage in the
//! state store and for the HTTP API.

use serde::{Deserialize, Serialize};

use crate::clock::epoch_millis;

/// Unique identifier for a registered application.
pub type ApplicationId = String;

/// Unique identifier for a deployment.
pub type DeploymentId = String;

/// Content-addressed revision of a desired-state snapshot (e.g. a commit hash).
pub type Revision = String;

// ── Application ────────────────────────────────────────────────────

/// Target platform kind. Selects the platform driver that handles an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    Kubernetes,
    CloudRun,
    Lambda,
    Ecs,
    Local,
}

impl std::fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlatformKind::Kubernetes => "kubernetes",
            PlatformKind::CloudRun => "cloud_run",
            PlatformKind::Lambda => "lambda",
            PlatformKind::Ecs => "ecs",
            PlatformKind::Local => "local",
        };
        f.write_str(s)
    }
}

/// A registered application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Application {
    pub id: ApplicationId,
    pub project_id: String,
    pub name: String,
    pub platform: PlatformKind,
    #[serde(default)]
    pub policy: DeploymentPolicy,
    /// Soft-deleted applications keep their deployment history.
    #[serde(default)]
    pub deleted: bool,
    /// Unix timestamp (seconds) of registration.
    #[serde(default)]
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last update.
    #[serde(default)]
    pub updated_at: u64,
}

/// Deployment policy attached to an application.
///
/// Selects the pipeline template and carries the numeric knobs the planner
/// copies into every StageRun.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeploymentPolicy {
    /// Config-only changes may be applied with a single SYNC stage.
    pub quick_sync: bool,
    /// Progressive pipeline. Workload changes always use it when present.
    pub progressive: Option<ProgressiveConfig>,
    pub approval: ApprovalPolicy,
    /// Run a synthesized rollback when the deployment fails.
    pub auto_rollback: bool,
    pub retry: RetryPolicy,
    /// Per-stage driver call timeout.
    pub stage_timeout_secs: u64,
    /// Whole-deployment timeout. Zero disables it.
    pub deployment_timeout_secs: u64,
    /// Free-form class used by operators to group applications.
    pub concurrency_class: String,
}

impl Default for DeploymentPolicy {
    fn default() -> Self {
        Self {
            quick_sync: true,
            progressive: None,
            approval: ApprovalPolicy::default(),
            auto_rollback: true,
            retry: RetryPolicy::default(),
            stage_timeout_secs: 300,
            deployment_timeout_secs: 3600,
            concurrency_class: "default".to_string(),
        }
    }
}

/// Progressive delivery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressiveStrategy {
    /// Shift traffic to the new version in steps, analysing in between.
    Canary,
    /// Bring up a full parallel set, analyse, then switch the primary.
    BlueGreen,
}

/// Parameters of the progressive pipeline template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProgressiveConfig {
    pub strategy: ProgressiveStrategy,
    /// Canary traffic percentages, strictly increasing, ending at 100.
    pub canary_steps: Vec<u32>,
    /// Duration of each ANALYSIS stage.
    pub analysis_secs: u64,
    /// Optional WAIT after the final rollout, before CLEANUP.
    pub bake_secs: Option<u64>,
}

impl Default for ProgressiveConfig {
    fn default() -> Self {
        Self {
            strategy: ProgressiveStrategy::Canary,
            canary_steps: vec![25, 100],
            analysis_secs: 300,
            bake_secs: None,
        }
    }
}

/// Manual approval requirements.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApprovalPolicy {
    pub required: bool,
    /// Allowed approvers. Empty means anyone.
    pub approvers: Vec<String>,
}

/// Retry policy for a single StageRun.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for every further one.
    pub backoff_ms: u64,
    /// Upper bound for the doubled delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the attempt following `attempt` (1-based).
    pub fn backoff_after(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(20);
        self.backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms.max(self.backoff_ms))
    }
}

// ── Snapshots ──────────────────────────────────────────────────────

/// Desired configuration of an application at one revision.
///
/// Two snapshots with the same revision are byte-identical.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesiredStateSnapshot {
    pub application_id: ApplicationId,
    pub revision: Revision,
    /// Platform-specific payload, opaque to the core.
    pub payload: serde_json::Value,
}

/// Live state as observed by a platform driver. Best-effort and possibly stale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiveStateSnapshot {
    pub application_id: ApplicationId,
    /// Revision the platform reports as currently running, if any.
    pub revision: Option<Revision>,
    pub payload: serde_json::Value,
    /// Unix timestamp (milliseconds) of the observation.
    pub observed_at: u64,
}

/// Classification of a desired/live difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffClass {
    /// No workload image/version change.
    ConfigOnly,
    /// The workload itself changes.
    Workload,
}

/// A non-empty difference between desired and live state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub class: DiffClass,
    /// Human-readable change summary, one entry per changed path.
    pub changes: Vec<String>,
    /// Desired replica count, when the driver knows it.
    pub target_replicas: Option<u32>,
}

/// Result of diffing desired against live state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiffResult {
    NoChange,
    Changed(Diff),
}

// ── Stages ─────────────────────────────────────────────────────────

/// Stage type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageKind {
    Wait,
    Analysis,
    Rollout,
    PrimarySwitch,
    Cleanup,
    ManualApproval,
    Rollback,
    Sync,
}

impl StageKind {
    /// Stages whose driver call changes what the platform runs.
    pub fn mutates_workload(self) -> bool {
        matches!(
            self,
            StageKind::Rollout | StageKind::PrimarySwitch | StageKind::Sync
        )
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageKind::Wait => "WAIT",
            StageKind::Analysis => "ANALYSIS",
            StageKind::Rollout => "ROLLOUT",
            StageKind::PrimarySwitch => "PRIMARY_SWITCH",
            StageKind::Cleanup => "CLEANUP",
            StageKind::ManualApproval => "MANUAL_APPROVAL",
            StageKind::Rollback => "ROLLBACK",
            StageKind::Sync => "SYNC",
        };
        f.write_str(s)
    }
}

/// A stage and its parameters, captured at plan time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Wait {
        duration_secs: u64,
    },
    Analysis {
        duration_secs: u64,
    },
    Rollout {
        canary_percent: u32,
        target_replicas: Option<u32>,
    },
    PrimarySwitch,
    Cleanup,
    ManualApproval {
        #[serde(default)]
        approvers: Vec<String>,
    },
    Rollback {
        /// Ordinal of the stage being undone, if the rollback targets one.
        undo_ordinal: Option<u32>,
        /// Revision to restore, when known.
        restore_revision: Option<Revision>,
    },
    Sync {
        prune: bool,
    },
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Wait { .. } => StageKind::Wait,
            Stage::Analysis { .. } => StageKind::Analysis,
            Stage::Rollout { .. } => StageKind::Rollout,
            Stage::PrimarySwitch => StageKind::PrimarySwitch,
            Stage::Cleanup => StageKind::Cleanup,
            Stage::ManualApproval { .. } => StageKind::ManualApproval,
            Stage::Rollback { .. } => StageKind::Rollback,
            Stage::Sync { .. } => StageKind::Sync,
        }
    }
}

/// Lifecycle status of a StageRun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StageStatus {
    pub fn is_finished(self) -> bool {
        !matches!(self, StageStatus::NotStarted | StageStatus::Running)
    }
}

/// One unit of pipeline work inside a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRun {
    /// Stable 0-based position within the pipeline.
    pub ordinal: u32,
    pub stage: Stage,
    pub status: StageStatus,
    /// Attempts started so far.
    pub attempt: u32,
    pub retry: RetryPolicy,
    pub timeout_secs: u64,
    /// Unix timestamp (milliseconds) at which the next attempt may start.
    /// Set while the stage is waiting out a retry backoff.
    #[serde(default)]
    pub retry_at: Option<u64>,
    /// Last driver error or output, kept for operator inspection.
    #[serde(default)]
    pub diagnostics: Option<String>,
    #[serde(default)]
    pub approved_by: Option<String>,
    #[serde(default)]
    pub started_at: Option<u64>,
    #[serde(default)]
    pub completed_at: Option<u64>,
}

impl StageRun {
    pub fn new(ordinal: u32, stage: Stage, retry: RetryPolicy, timeout_secs: u64) -> Self {
        Self {
            ordinal,
            stage,
            status: StageStatus::NotStarted,
            attempt: 0,
            retry,
            timeout_secs,
            retry_at: None,
            diagnostics: None,
            approved_by: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn kind(&self) -> StageKind {
        self.stage.kind()
    }

    pub fn attempts_left(&self) -> bool {
        self.attempt < self.retry.max_attempts
    }
}

// ── Deployment ─────────────────────────────────────────────────────

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Pending,
    Planned,
    Running,
    PausedForApproval,
    Succeeded,
    Failed,
    Cancelled,
    RolledBack,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Succeeded
                | DeploymentStatus::Failed
                | DeploymentStatus::Cancelled
                | DeploymentStatus::RolledBack
        )
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentStatus::Pending => "PENDING",
            DeploymentStatus::Planned => "PLANNED",
            DeploymentStatus::Running => "RUNNING",
            DeploymentStatus::PausedForApproval => "PAUSED_FOR_APPROVAL",
            DeploymentStatus::Succeeded => "SUCCEEDED",
            DeploymentStatus::Failed => "FAILED",
            DeploymentStatus::Cancelled => "CANCELLED",
            DeploymentStatus::RolledBack => "ROLLED_BACK",
        };
        f.write_str(s)
    }
}

/// Why a deployment failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    StageExecution,
    Timeout,
    Rollback,
    Planning,
}

/// Operator-visible failure record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub ordinal: Option<u32>,
    pub message: String,
}

/// Which pipeline template produced a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePath {
    QuickSync,
    Progressive,
}

/// One attempt to move an application to a desired revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub application_id: ApplicationId,
    pub platform: PlatformKind,
    /// Revision that caused this deployment.
    pub trigger_revision: Revision,
    /// Desired snapshot the pipeline drives towards.
    pub desired: DesiredStateSnapshot,
    /// Revision running before this deployment started, if known.
    pub running_revision: Option<Revision>,
    pub status: DeploymentStatus,
    pub path: PipelinePath,
    pub pipeline: Vec<StageRun>,
    /// Copied from the policy at plan time.
    pub auto_rollback: bool,
    /// Copied from the policy at plan time. Zero disables the deadline.
    pub timeout_secs: u64,
    /// True while a synthesized rollback sequence is still to be run.
    #[serde(default)]
    pub rolling_back: bool,
    /// Why the deployment failed. Kept when a rollback fails afterwards.
    #[serde(default)]
    pub failure: Option<Failure>,
    #[serde(default)]
    pub rollback_failure: Option<Failure>,
    /// Short description of the diff that was planned.
    pub summary: String,
    /// Unix timestamp (milliseconds).
    pub created_at: u64,
    #[serde(default)]
    pub started_at: Option<u64>,
    #[serde(default)]
    pub completed_at: Option<u64>,
}

impl Deployment {
    /// Ordinal of the first StageRun that has not finished, if any.
    ///
    /// After a failure this points at the first appended rollback stage.
    pub fn next_unfinished(&self) -> Option<u32> {
        self.pipeline
            .iter()
            .find(|s| !s.status.is_finished())
            .map(|s| s.ordinal)
    }

    pub fn stage(&self, ordinal: u32) -> Option<&StageRun> {
        self.pipeline.get(ordinal as usize)
    }

    pub fn stage_mut(&mut self, ordinal: u32) -> Option<&mut StageRun> {
        self.pipeline.get_mut(ordinal as usize)
    }

    /// Whether the controller still has work to do for this deployment.
    pub fn needs_driving(&self) -> bool {
        !self.status.is_terminal() || self.rolling_back
    }

    /// Mark every stage that has not finished as cancelled.
    pub fn cancel_remaining(&mut self) {
        let now = epoch_millis();
        for stage in &mut self.pipeline {
            if !stage.status.is_finished() {
                stage.status = StageStatus::Cancelled;
                stage.retry_at = None;
                stage.completed_at = Some(now);
            }
        }
    }
}

// ── Application evaluation ─────────────────────────────────────────

/// Operator-visible sync state of an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Unknown,
    Synced,
    OutOfSync,
    Deploying,
    InvalidConfig {
        reason: String,
    },
    InvalidPolicy {
        reason: String,
    },
    PlatformUnavailable {
        reason: String,
    },
}

impl SyncState {
    /// Planning is blocked until configuration changes.
    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            SyncState::InvalidConfig { .. } | SyncState::InvalidPolicy { .. }
        )
    }
}

/// Per-application evaluation marker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub application_id: ApplicationId,
    /// Last revision that was planned (deployed, found in sync, or blocked).
    pub last_evaluated_revision: Option<Revision>,
    /// Revision that arrived while a deployment was active.
    pub queued_revision: Option<Revision>,
    pub sync_state: SyncState,
    /// Most recent deployment created for the application.
    #[serde(default)]
    pub last_deployment: Option<LastDeployment>,
    /// Unix timestamp (milliseconds) of the last evaluation.
    pub updated_at: u64,
}

/// Outcome of an application's most recent deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastDeployment {
    pub deployment_id: DeploymentId,
    pub revision: Revision,
    pub status: DeploymentStatus,
}

impl LastDeployment {
    pub fn of(deployment: &Deployment) -> Self {
        Self {
            deployment_id: deployment.id.clone(),
            revision: deployment.trigger_revision.clone(),
            status: deployment.status,
        }
    }

    /// Whether this deployment targeted `revision` and ended without
    /// succeeding.
    pub fn failed(&self, revision: &Revision) -> bool {
        &self.revision == revision
            && self.status.is_terminal()
            && self.status != DeploymentStatus::Succeeded
    }
}

/// Application-level "active deployment" marker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveMarker {
    pub application_id: ApplicationId,
    pub deployment_id: Option<DeploymentId>,
    /// Scheduler instance driving `deployment_id`.
    #[serde(default)]
    pub lease: Option<Lease>,
}

impl ActiveMarker {
    /// Whether a lease held by someone other than `owner` is still live at
    /// `now` (Unix milliseconds).
    pub fn leased_to_other(&self, owner: &str, now: u64) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|l| l.owner != owner && l.expires_at > now)
    }
}

/// Time-limited claim on the right to drive an application's active
/// deployment. The holder renews it while its controller runs; once it
/// lapses another scheduler may take the deployment over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    /// Unix timestamp (milliseconds).
    pub expires_at: u64,
}

// ── Reporting ──────────────────────────────────────────────────────

/// What changed in a transition event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Transition {
    Deployment {
        from: DeploymentStatus,
        to: DeploymentStatus,
    },
    Stage {
        ordinal: u32,
        from: StageStatus,
        to: StageStatus,
    },
}

/// A committed state transition, emitted to the reporter after persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub deployment_id: DeploymentId,
    pub application_id: ApplicationId,
    pub transition: Transition,
    /// Unix timestamp (milliseconds).
    pub at: u64,
}

/// Compute the transition events between two versions of a deployment.
pub fn transitions_between(old: &Deployment, new: &Deployment) -> Vec<TransitionEvent> {
    let at = epoch_millis();
    let event = |transition| TransitionEvent {
        deployment_id: new.id.clone(),
        application_id: new.application_id.clone(),
        transition,
        at,
    };

    let mut events = Vec::new();
    for stage in &new.pipeline {
        let from = old
            .stage(stage.ordinal)
            .map(|s| s.status)
            .unwrap_or(StageStatus::NotStarted);
        if from != stage.status {
            events.push(event(Transition::Stage {
                ordinal: stage.ordinal,
                from,
                to: stage.status,
            }));
        }
    }
    if old.status != new.status {
        events.push(event(Transition::Deployment {
            from: old.status,
            to: new.status,
        }));
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(pipeline: Vec<StageRun>) -> Deployment {
        Deployment {
            id: "d-1".to_string(),
            application_id: "app".to_string(),
            platform: PlatformKind::Local,
            trigger_revision: "r1".to_string(),
            desired: DesiredStateSnapshot {
                application_id: "app".to_string(),
                revision: "r1".to_string(),
                payload: serde_json::json!({}),
            },
            running_revision: None,
            status: DeploymentStatus::Running,
            path: PipelinePath::Progressive,
            pipeline,
            auto_rollback: false,
            timeout_secs: 0,
            rolling_back: false,
            failure: None,
            rollback_failure: None,
            summary: String::new(),
            created_at: 0,
            started_at: None,
            completed_at: None,
        }
    }

    fn run(ordinal: u32, status: StageStatus) -> StageRun {
        let mut s = StageRun::new(ordinal, Stage::Cleanup, RetryPolicy::default(), 10);
        s.status = status;
        s
    }

    #[test]
    fn next_unfinished_skips_passed_stages() {
        let d = deployment(vec![
            run(0, StageStatus::Succeeded),
            run(1, StageStatus::Skipped),
            run(2, StageStatus::NotStarted),
        ]);
        assert_eq!(d.next_unfinished(), Some(2));

        let done = deployment(vec![run(0, StageStatus::Succeeded)]);
        assert_eq!(done.next_unfinished(), None);
    }

    #[test]
    fn next_unfinished_passes_over_failed_stages() {
        let d = deployment(vec![
            run(0, StageStatus::Failed),
            run(1, StageStatus::Skipped),
            run(2, StageStatus::NotStarted),
        ]);
        assert_eq!(d.next_unfinished(), Some(2));
    }

    #[test]
    fn terminal_statuses() {
        assert!(DeploymentStatus::Succeeded.is_terminal());
        assert!(DeploymentStatus::Failed.is_terminal());
        assert!(DeploymentStatus::Cancelled.is_terminal());
        assert!(DeploymentStatus::RolledBack.is_terminal());
        assert!(!DeploymentStatus::PausedForApproval.is_terminal());
        assert!(!DeploymentStatus::Planned.is_terminal());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            max_attempts: 5,
            backoff_ms: 100,
            max_backoff_ms: 350,
        };
        assert_eq!(retry.backoff_after(1), 100);
        assert_eq!(retry.backoff_after(2), 200);
        assert_eq!(retry.backoff_after(3), 350);
        assert_eq!(retry.backoff_after(30), 350);
    }

    #[test]
    fn cancel_remaining_leaves_finished_stages() {
        let mut d = deployment(vec![
            run(0, StageStatus::Succeeded),
            run(1, StageStatus::Running),
            run(2, StageStatus::NotStarted),
        ]);
        d.cancel_remaining();
        assert_eq!(d.pipeline[0].status, StageStatus::Succeeded);
        assert_eq!(d.pipeline[1].status, StageStatus::Cancelled);
        assert_eq!(d.pipeline[2].status, StageStatus::Cancelled);
    }

    #[test]
    fn transitions_report_stages_before_deployment() {
        let old = deployment(vec![run(0, StageStatus::Running)]);
        let mut new = old.clone();
        new.pipeline[0].status = StageStatus::Succeeded;
        new.status = DeploymentStatus::Succeeded;

        let events = transitions_between(&old, &new);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0].transition,
            Transition::Stage { ordinal: 0, .. }
        ));
        assert_eq!(
            events[1].transition,
            Transition::Deployment {
                from: DeploymentStatus::Running,
                to: DeploymentStatus::Succeeded,
            }
        );
    }

    #[test]
    fn stage_serializes_with_type_tag() {
        let stage = Stage::Rollout {
            canary_percent: 25,
            target_replicas: None,
        };
        let json = serde_json::to_value(&stage).unwrap();
        assert_eq!(json["type"], "ROLLOUT");
        assert_eq!(json["canary_percent"], 25);
    }

    #[test]
    fn lease_blocks_other_owners_until_it_lapses() {
        let marker = ActiveMarker {
            application_id: "app".to_string(),
            deployment_id: Some("d-1".to_string()),
            lease: Some(Lease {
                owner: "a".to_string(),
                expires_at: 1_000,
            }),
        };
        assert!(marker.leased_to_other("b", 999));
        assert!(!marker.leased_to_other("a", 999));
        assert!(!marker.leased_to_other("b", 1_000));
        assert!(!ActiveMarker::default().leased_to_other("b", 0));
    }

    #[test]
    fn last_deployment_failed_only_for_unsuccessful_end_of_same_revision() {
        let mut d = deployment(vec![]);
        d.status = DeploymentStatus::RolledBack;
        let last = LastDeployment::of(&d);
        assert!(last.failed(&"r1".to_string()));
        assert!(!last.failed(&"r2".to_string()));

        d.status = DeploymentStatus::Succeeded;
        assert!(!LastDeployment::of(&d).failed(&"r1".to_string()));
        d.status = DeploymentStatus::Running;
        assert!(!LastDeployment::of(&d).failed(&"r1".to_string()));
    }
}
