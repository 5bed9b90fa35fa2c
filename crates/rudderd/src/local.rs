//! Local platform driver.
//!
//! Keeps each application's live state in memory. Useful for running the
//! agent standalone against a directory of manifests, and as the reference
//! for what a real driver has to provide.
//!
//! The `workload` table of a manifest is the workload; changing it is
//! workload-affecting. Changes anywhere else are config-only.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rudder_core::clock::epoch_millis;
use rudder_core::{
    Application, ApplicationId, DesiredStateSnapshot, Diff, DiffClass, DiffResult, DriverError,
    LiveStateSnapshot, PlatformDriver, PlatformKind, Revision, Stage, StageContext, StageOutput,
};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const WORKLOAD_KEY: &str = "workload";

#[derive(Debug, Default)]
struct LocalApp {
    live: Option<LiveStateSnapshot>,
    /// Live state replaced by the last promotion, restored by ROLLBACK.
    previous: Option<LiveStateSnapshot>,
    /// Canary traffic share of a revision that is not yet primary.
    canary: Option<(Revision, u32)>,
}

/// In-memory driver for the `local` platform.
#[derive(Debug, Default)]
pub struct LocalDriver {
    apps: RwLock<HashMap<ApplicationId, LocalApp>>,
}

impl LocalDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Revision currently live for `application_id`.
    pub async fn live_revision(&self, application_id: &str) -> Option<Revision> {
        self.apps
            .read()
            .await
            .get(application_id)
            .and_then(|a| a.live.as_ref())
            .and_then(|l| l.revision.clone())
    }

    /// Canary share of a revision being rolled out, if any.
    pub async fn canary(&self, application_id: &str) -> Option<(Revision, u32)> {
        self.apps
            .read()
            .await
            .get(application_id)
            .and_then(|a| a.canary.clone())
    }

    async fn promote(&self, ctx: &StageContext) {
        let mut apps = self.apps.write().await;
        let app = apps.entry(ctx.application_id.clone()).or_default();
        let next = LiveStateSnapshot {
            application_id: ctx.application_id.clone(),
            revision: Some(ctx.desired.revision.clone()),
            payload: ctx.desired.payload.clone(),
            observed_at: epoch_millis(),
        };
        let replaced = app.live.replace(next);
        if replaced
            .as_ref()
            .is_some_and(|old| old.revision.as_ref() != Some(&ctx.desired.revision))
        {
            app.previous = replaced;
        }
        app.canary = None;
        info!(application = %ctx.application_id, revision = %ctx.desired.revision, "revision promoted");
    }
}

/// Top-level keys whose values differ between two payloads.
fn changed_keys(desired: &Value, live: &Value) -> Vec<String> {
    let empty = serde_json::Map::new();
    let desired = desired.as_object().unwrap_or(&empty);
    let live = live.as_object().unwrap_or(&empty);
    let mut keys: Vec<String> = desired
        .keys()
        .chain(live.keys())
        .filter(|k| desired.get(*k) != live.get(*k))
        .cloned()
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

#[async_trait]
impl PlatformDriver for LocalDriver {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Local
    }

    async fn live_state(&self, app: &Application) -> Result<LiveStateSnapshot, DriverError> {
        let apps = self.apps.read().await;
        Ok(apps
            .get(&app.id)
            .and_then(|a| a.live.clone())
            .unwrap_or_else(|| LiveStateSnapshot {
                application_id: app.id.clone(),
                revision: None,
                payload: Value::Object(serde_json::Map::new()),
                observed_at: epoch_millis(),
            }))
    }

    fn diff(&self, desired: &DesiredStateSnapshot, live: &LiveStateSnapshot) -> DiffResult {
        let changes = changed_keys(&desired.payload, &live.payload);
        if changes.is_empty() {
            return DiffResult::NoChange;
        }
        let class = if changes.iter().any(|k| k == WORKLOAD_KEY) {
            DiffClass::Workload
        } else {
            DiffClass::ConfigOnly
        };
        let target_replicas = desired
            .payload
            .get(WORKLOAD_KEY)
            .and_then(|w| w.get("replicas"))
            .and_then(Value::as_u64)
            .and_then(|r| u32::try_from(r).ok());
        DiffResult::Changed(Diff {
            class,
            changes,
            target_replicas,
        })
    }

    async fn apply_stage(
        &self,
        ctx: &StageContext,
        stage: &Stage,
    ) -> Result<StageOutput, DriverError> {
        debug!(
            application = %ctx.application_id,
            deployment = %ctx.deployment_id,
            ordinal = ctx.ordinal,
            attempt = ctx.attempt,
            kind = %stage.kind(),
            "applying stage"
        );
        match stage {
            Stage::Sync { .. } | Stage::PrimarySwitch => {
                self.promote(ctx).await;
                Ok(StageOutput::message(format!("{} is live", ctx.desired.revision)))
            }
            Stage::Rollout { canary_percent, .. } if *canary_percent >= 100 => {
                self.promote(ctx).await;
                Ok(StageOutput::message(format!("{} at 100%", ctx.desired.revision)))
            }
            Stage::Rollout { canary_percent, .. } => {
                let mut apps = self.apps.write().await;
                let app = apps.entry(ctx.application_id.clone()).or_default();
                app.canary = Some((ctx.desired.revision.clone(), *canary_percent));
                Ok(StageOutput::message(format!(
                    "{} at {canary_percent}%",
                    ctx.desired.revision
                )))
            }
            Stage::Analysis { duration_secs } => {
                tokio::time::sleep(Duration::from_secs(*duration_secs)).await;
                Ok(StageOutput::message("analysis passed"))
            }
            Stage::Cleanup => {
                if let Some(app) = self.apps.write().await.get_mut(&ctx.application_id) {
                    app.canary = None;
                }
                Ok(StageOutput::message("cleaned up"))
            }
            Stage::Rollback { .. } => {
                let mut apps = self.apps.write().await;
                let app = apps.entry(ctx.application_id.clone()).or_default();
                app.canary = None;
                let promoted = app
                    .live
                    .as_ref()
                    .is_some_and(|l| l.revision.as_ref() == Some(&ctx.desired.revision));
                if promoted && let Some(previous) = app.previous.take() {
                    app.live = Some(previous);
                }
                warn!(application = %ctx.application_id, deployment = %ctx.deployment_id, "rolled back");
                Ok(StageOutput::message("previous revision restored"))
            }
            Stage::Wait { .. } | Stage::ManualApproval { .. } => {
                Err(DriverError::Unsupported(stage.kind()))
            }
        }
    }

    async fn cancel(&self, ctx: &StageContext) {
        if let Some(app) = self.apps.write().await.get_mut(&ctx.application_id) {
            app.canary = None;
        }
        debug!(application = %ctx.application_id, ordinal = ctx.ordinal, "stage cancelled");
    }
}
