//! Test doubles for the collaborator traits.
//!
//! Enabled by the `test-util` feature. These are in-memory, scriptable
//! stand-ins for a repository-backed provider, a real platform, and an
//! observability sink.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::clock::epoch_millis;
use crate::driver::{DriverBounds, DriverError, PlatformDriver, StageContext, StageOutput};
use crate::reporter::Reporter;
use crate::source::{DesiredStateProvider, ProviderError};
use crate::types::*;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Provider returning whatever snapshot (or error) was last set per application.
#[derive(Default)]
pub struct StaticProvider {
    entries: Mutex<HashMap<ApplicationId, Result<DesiredStateSnapshot, ProviderError>>>,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, application_id: &str, revision: &str, payload: serde_json::Value) {
        lock(&self.entries).insert(
            application_id.to_string(),
            Ok(DesiredStateSnapshot {
                application_id: application_id.to_string(),
                revision: revision.to_string(),
                payload,
            }),
        );
    }

    pub fn set_error(&self, application_id: &str, error: ProviderError) {
        lock(&self.entries).insert(application_id.to_string(), Err(error));
    }
}

#[async_trait]
impl DesiredStateProvider for StaticProvider {
    async fn snapshot(&self, application_id: &str) -> Result<DesiredStateSnapshot, ProviderError> {
        lock(&self.entries)
            .get(application_id)
            .cloned()
            .unwrap_or_else(|| Err(ProviderError::NotFound(application_id.to_string())))
    }
}

/// Scripted behaviour of the next call for a stage kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    Fail(String),
    /// Never returns; only a timeout or cancellation ends the call.
    Hang,
}

/// A recorded `apply_stage` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedStage {
    pub deployment_id: DeploymentId,
    pub ordinal: u32,
    pub attempt: u32,
    pub kind: StageKind,
}

#[derive(Default)]
struct DriverState {
    live: HashMap<ApplicationId, LiveStateSnapshot>,
    previous: HashMap<ApplicationId, LiveStateSnapshot>,
    script: HashMap<StageKind, VecDeque<Behavior>>,
    unavailable: bool,
    applied: Vec<AppliedStage>,
    cancels: u32,
}

/// In-memory platform driver with scriptable failures.
///
/// A change of the payload's `image` field is workload-affecting; any other
/// payload change is config-only.
pub struct ScriptedDriver {
    kind: PlatformKind,
    bounds: DriverBounds,
    state: Mutex<DriverState>,
}

impl ScriptedDriver {
    pub fn new(kind: PlatformKind) -> Self {
        Self {
            kind,
            bounds: DriverBounds::default(),
            state: Mutex::new(DriverState::default()),
        }
    }

    pub fn shared(kind: PlatformKind) -> Arc<Self> {
        Arc::new(Self::new(kind))
    }

    pub fn with_bounds(mut self, bounds: DriverBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn set_live(&self, application_id: &str, revision: Option<&str>, payload: serde_json::Value) {
        lock(&self.state).live.insert(
            application_id.to_string(),
            LiveStateSnapshot {
                application_id: application_id.to_string(),
                revision: revision.map(str::to_string),
                payload,
                observed_at: epoch_millis(),
            },
        );
    }

    pub fn live(&self, application_id: &str) -> Option<LiveStateSnapshot> {
        lock(&self.state).live.get(application_id).cloned()
    }

    /// Make the next `times` calls for `kind` fail.
    pub fn fail_times(&self, kind: StageKind, times: usize) {
        let mut state = lock(&self.state);
        let queue = state.script.entry(kind).or_default();
        for i in 0..times {
            queue.push_back(Behavior::Fail(format!("scripted {kind} failure #{}", i + 1)));
        }
    }

    /// Make the next call for `kind` hang.
    pub fn hang_once(&self, kind: StageKind) {
        lock(&self.state)
            .script
            .entry(kind)
            .or_default()
            .push_back(Behavior::Hang);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    pub fn applied(&self) -> Vec<AppliedStage> {
        lock(&self.state).applied.clone()
    }

    pub fn applied_kinds(&self, deployment_id: &str) -> Vec<StageKind> {
        lock(&self.state)
            .applied
            .iter()
            .filter(|a| a.deployment_id == deployment_id)
            .map(|a| a.kind)
            .collect()
    }

    pub fn cancels(&self) -> u32 {
        lock(&self.state).cancels
    }

    fn promote(state: &mut DriverState, ctx: &StageContext) {
        let next = LiveStateSnapshot {
            application_id: ctx.application_id.clone(),
            revision: Some(ctx.desired.revision.clone()),
            payload: ctx.desired.payload.clone(),
            observed_at: epoch_millis(),
        };
        if let Some(old) = state.live.insert(ctx.application_id.clone(), next)
            && old.revision.as_deref() != Some(ctx.desired.revision.as_str())
        {
            state.previous.insert(ctx.application_id.clone(), old);
        }
    }
}

#[async_trait]
impl PlatformDriver for ScriptedDriver {
    fn kind(&self) -> PlatformKind {
        self.kind
    }

    fn bounds(&self) -> DriverBounds {
        self.bounds
    }

    async fn live_state(&self, app: &Application) -> Result<LiveStateSnapshot, DriverError> {
        let state = lock(&self.state);
        if state.unavailable {
            return Err(DriverError::Unavailable("scripted outage".to_string()));
        }
        Ok(state.live.get(&app.id).cloned().unwrap_or(LiveStateSnapshot {
            application_id: app.id.clone(),
            revision: None,
            payload: serde_json::Value::Null,
            observed_at: epoch_millis(),
        }))
    }

    fn diff(&self, desired: &DesiredStateSnapshot, live: &LiveStateSnapshot) -> DiffResult {
        if desired.payload == live.payload {
            return DiffResult::NoChange;
        }
        let class = if desired.payload.get("image") != live.payload.get("image") {
            DiffClass::Workload
        } else {
            DiffClass::ConfigOnly
        };
        DiffResult::Changed(Diff {
            class,
            changes: vec!["payload".to_string()],
            target_replicas: desired
                .payload
                .get("replicas")
                .and_then(serde_json::Value::as_u64)
                .map(|r| r as u32),
        })
    }

    async fn apply_stage(
        &self,
        ctx: &StageContext,
        stage: &Stage,
    ) -> Result<StageOutput, DriverError> {
        let behavior = {
            let mut state = lock(&self.state);
            state.applied.push(AppliedStage {
                deployment_id: ctx.deployment_id.clone(),
                ordinal: ctx.ordinal,
                attempt: ctx.attempt,
                kind: stage.kind(),
            });
            state
                .script
                .get_mut(&stage.kind())
                .and_then(VecDeque::pop_front)
        };

        match behavior {
            Some(Behavior::Fail(msg)) => return Err(DriverError::StageFailed(msg)),
            Some(Behavior::Hang) => std::future::pending::<()>().await,
            None => {}
        }

        let mut state = lock(&self.state);
        match stage {
            Stage::Sync { .. } | Stage::PrimarySwitch => Self::promote(&mut state, ctx),
            Stage::Rollout { canary_percent, .. } if *canary_percent >= 100 => {
                Self::promote(&mut state, ctx)
            }
            Stage::Rollback { .. } => {
                if let Some(previous) = state.previous.remove(&ctx.application_id) {
                    state.live.insert(ctx.application_id.clone(), previous);
                }
            }
            _ => {}
        }
        Ok(StageOutput::message(format!("{} applied", stage.kind())))
    }

    async fn cancel(&self, _ctx: &StageContext) {
        lock(&self.state).cancels += 1;
    }
}

/// Reporter that keeps every event in memory.
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<TransitionEvent>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TransitionEvent> {
        lock(&self.events).clone()
    }

    /// Deployment-level status sequence for one deployment, starting state included.
    pub fn deployment_statuses(&self, deployment_id: &str) -> Vec<DeploymentStatus> {
        let events = lock(&self.events);
        let mut statuses = Vec::new();
        for event in events.iter().filter(|e| e.deployment_id == deployment_id) {
            if let Transition::Deployment { from, to } = event.transition {
                if statuses.is_empty() {
                    statuses.push(from);
                }
                statuses.push(to);
            }
        }
        statuses
    }
}

impl Reporter for RecordingReporter {
    fn report(&self, event: &TransitionEvent) {
        lock(&self.events).push(event.clone());
    }
}
