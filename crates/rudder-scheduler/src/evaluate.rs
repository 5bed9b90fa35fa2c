//! Application evaluation: fetch, compare, plan, create.
//!
//! Runs only on the application's own task. Creating a deployment still
//! goes through the store's compare-and-swap on the active marker, so two
//! schedulers sharing a store cannot both start one. The creator's lease
//! is written with the marker in the same transaction.

use rudder_core::clock::epoch_millis;
use rudder_core::{
    Application, Deployment, DeploymentId, DeploymentStatus, DesiredStateSnapshot,
    EvaluationRecord, LastDeployment, ProviderError, Revision, SyncState, Transition,
    TransitionEvent,
};
use rudder_planner::{PipelinePlan, PlanError, PlanOptions, PlanOutcome};
use rudder_state::{CreateOutcome, Versioned};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::{CAS_ATTEMPTS, Scheduler, TriggerOutcome};
use crate::worker::Reason;

/// Result of planning an application against its latest snapshot.
enum Planned {
    Created(DeploymentId),
    InSync,
    /// Another deployment holds the marker. `queued` is false when it
    /// already targets the same revision.
    Occupied { active: DeploymentId, queued: bool },
}

impl Scheduler {
    /// Evaluate one application.
    ///
    /// A revision already evaluated is only re-planned on a config change,
    /// on a drift tick, or when the last evaluation could not complete.
    pub(crate) async fn evaluate(&self, application_id: &str, reason: Reason) -> SchedulerResult<()> {
        let Some(app) = self
            .store
            .get_application(application_id)?
            .map(Versioned::into_record)
            .filter(|a| !a.deleted)
        else {
            debug!(application = %application_id, "application removed; skipping evaluation");
            return Ok(());
        };
        self.adopt_lapsed(application_id).await?;
        let record = self.evaluation(application_id)?;

        let snapshot = match self.provider.snapshot(application_id).await {
            Ok(snapshot) => snapshot,
            Err(ProviderError::InvalidConfig(reason)) => {
                error!(application = %application_id, %reason, "desired state is invalid");
                self.update_evaluation(application_id, |r| {
                    r.sync_state = SyncState::InvalidConfig {
                        reason: reason.clone(),
                    };
                })?;
                return Ok(());
            }
            Err(e) => {
                warn!(application = %application_id, error = %e, "desired state fetch failed; retrying next tick");
                return Ok(());
            }
        };

        let unseen = record.last_evaluated_revision.as_ref() != Some(&snapshot.revision);
        let incomplete = matches!(
            record.sync_state,
            SyncState::Unknown | SyncState::InvalidConfig { .. } | SyncState::PlatformUnavailable { .. }
        );
        let failed = !unseen
            && record
                .last_deployment
                .as_ref()
                .is_some_and(|last| last.failed(&snapshot.revision));
        if failed && record.sync_state == SyncState::Deploying {
            self.update_evaluation(application_id, |r| r.sync_state = SyncState::OutOfSync)?;
        }
        let proceed = unseen
            || incomplete
            || match reason {
                Reason::ConfigChanged => true,
                Reason::Drift => !record.sync_state.is_blocked() && !failed,
                Reason::DeploymentFinished => record.sync_state == SyncState::Deploying && !failed,
                Reason::Poll => false,
            };
        if !proceed {
            return Ok(());
        }

        if let Some(active) = self.active_deployment(application_id)? {
            self.queue_behind(&active, &snapshot.revision)?;
            return Ok(());
        }

        debug!(
            application = %application_id,
            revision = %snapshot.revision,
            ?reason,
            "evaluating application"
        );
        match self.plan_and_create(&app, snapshot, PlanOptions::default()).await {
            Ok(_) | Err(SchedulerError::Plan(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Manual trigger: deploy the latest revision even over an empty diff.
    pub(crate) async fn trigger(
        &self,
        application_id: &str,
        revision: Option<Revision>,
    ) -> SchedulerResult<TriggerOutcome> {
        let app = self.get_application(application_id)?;
        let snapshot = self.provider.snapshot(application_id).await?;
        if let Some(requested) = revision
            && requested != snapshot.revision
        {
            return Err(SchedulerError::RevisionUnavailable {
                requested,
                latest: snapshot.revision,
            });
        }

        let revision = snapshot.revision.clone();
        if let Some(active) = self.active_deployment(application_id)? {
            let queued = self.queue_behind(&active, &revision)?;
            return Ok(occupied(active.id, queued, revision));
        }

        info!(application = %application_id, %revision, "manual deployment triggered");
        match self.plan_and_create(&app, snapshot, PlanOptions::forced()).await? {
            Planned::Created(deployment_id) => Ok(TriggerOutcome::Created { deployment_id }),
            Planned::Occupied { active, queued } => Ok(occupied(active, queued, revision)),
            Planned::InSync => Err(SchedulerError::Conflict(format!(
                "forced plan of {application_id} produced no pipeline"
            ))),
        }
    }

    /// Plan `snapshot` and, if there is a diff, create and start the
    /// deployment. Planning failures are recorded on the evaluation
    /// marker and returned as [`SchedulerError::Plan`].
    async fn plan_and_create(
        &self,
        app: &Application,
        snapshot: DesiredStateSnapshot,
        options: PlanOptions,
    ) -> SchedulerResult<Planned> {
        let driver = self
            .drivers
            .get(app.platform)
            .ok_or(SchedulerError::UnsupportedPlatform(app.platform))?;
        let revision = snapshot.revision.clone();

        let plan = match self
            .planner
            .plan(app, &snapshot, driver.as_ref(), options)
            .await
        {
            Ok(PlanOutcome::Plan(plan)) => plan,
            Ok(PlanOutcome::NoChange) => {
                debug!(application = %app.id, %revision, "live state matches desired state");
                self.update_evaluation(&app.id, |r| {
                    r.last_evaluated_revision = Some(revision.clone());
                    r.queued_revision = None;
                    r.sync_state = SyncState::Synced;
                })?;
                return Ok(Planned::InSync);
            }
            Err(e) => {
                self.record_plan_error(&app.id, &revision, &e)?;
                return Err(e.into());
            }
        };

        let deployment = new_deployment(app, snapshot, plan);
        if let Some(active) = self.insert_deployment(&deployment)? {
            let queued = match self.store.get_deployment(&active)? {
                Some(holder) => self.queue_behind(&holder.record, &revision)?,
                None => false,
            };
            return Ok(Planned::Occupied { active, queued });
        }

        info!(
            application = %app.id,
            deployment = %deployment.id,
            %revision,
            path = ?deployment.path,
            stages = deployment.pipeline.len(),
            summary = %deployment.summary,
            "deployment created"
        );
        self.reporter.report(&TransitionEvent {
            deployment_id: deployment.id.clone(),
            application_id: app.id.clone(),
            transition: Transition::Deployment {
                from: DeploymentStatus::Pending,
                to: DeploymentStatus::Planned,
            },
            at: epoch_millis(),
        });

        let id = deployment.id.clone();
        let last = LastDeployment::of(&deployment);
        self.spawn_controller(Versioned::new(1, deployment)).await?;
        self.update_evaluation(&app.id, |r| {
            r.last_evaluated_revision = Some(revision.clone());
            r.queued_revision = None;
            r.sync_state = SyncState::Deploying;
            // A fast controller may have recorded the outcome already.
            if r
                .last_deployment
                .as_ref()
                .is_none_or(|l| l.deployment_id != last.deployment_id)
            {
                r.last_deployment = Some(last.clone());
            }
        })?;
        Ok(Planned::Created(id))
    }

    fn record_plan_error(
        &self,
        application_id: &str,
        revision: &Revision,
        err: &PlanError,
    ) -> SchedulerResult<()> {
        match err {
            PlanError::InvalidPolicy(reason) => {
                error!(application = %application_id, %revision, %reason, "invalid deployment policy; planning blocked");
                self.update_evaluation(application_id, |r| {
                    r.last_evaluated_revision = Some(revision.clone());
                    r.queued_revision = None;
                    r.sync_state = SyncState::InvalidPolicy {
                        reason: reason.clone(),
                    };
                })
            }
            PlanError::PlatformUnavailable(reason) => {
                warn!(application = %application_id, %revision, %reason, "platform unavailable; retrying next tick");
                self.update_evaluation(application_id, |r| {
                    r.sync_state = SyncState::PlatformUnavailable {
                        reason: reason.clone(),
                    };
                })
            }
        }
    }

    /// Store `deployment` and claim the active marker. Returns the id of
    /// the deployment that holds the marker when it is already taken.
    fn insert_deployment(&self, deployment: &Deployment) -> SchedulerResult<Option<DeploymentId>> {
        let app = &deployment.application_id;
        for _ in 0..CAS_ATTEMPTS {
            let marker_version = self.store.get_active_marker(app)?.map(|m| m.version);
            match self
                .store
                .create_deployment(deployment, marker_version, Some(self.new_lease()))?
            {
                CreateOutcome::Created => return Ok(None),
                CreateOutcome::Occupied(active) => return Ok(Some(active)),
                CreateOutcome::Conflict => {
                    debug!(application = %app, "active marker changed; retrying");
                }
            }
        }
        Err(SchedulerError::Conflict(format!("active marker of {app}")))
    }

    /// The deployment currently holding the application's active marker.
    fn active_deployment(&self, application_id: &str) -> SchedulerResult<Option<Deployment>> {
        let Some(active) = self
            .store
            .get_active_marker(application_id)?
            .and_then(|m| m.record.deployment_id)
        else {
            return Ok(None);
        };
        Ok(self.store.get_deployment(&active)?.map(Versioned::into_record))
    }

    /// Queue `revision` until `active` finishes. Returns false when
    /// `active` already deploys that revision.
    fn queue_behind(&self, active: &Deployment, revision: &Revision) -> SchedulerResult<bool> {
        if &active.trigger_revision == revision {
            return Ok(false);
        }
        let application_id = &active.application_id;
        if self.evaluation(application_id)?.queued_revision.as_ref() != Some(revision) {
            info!(
                application = %application_id,
                deployment = %active.id,
                %revision,
                "revision queued behind active deployment"
            );
            self.update_evaluation(application_id, |r| {
                r.queued_revision = Some(revision.clone());
                r.sync_state = SyncState::Deploying;
            })?;
        }
        Ok(true)
    }

    /// Resume the application's active deployment when it has no
    /// controller anywhere: its lease lapsed without being renewed.
    async fn adopt_lapsed(&self, application_id: &str) -> SchedulerResult<()> {
        if !self.is_running() {
            return Ok(());
        }
        let Some(active) = self
            .store
            .get_active_marker(application_id)?
            .and_then(|m| m.record.deployment_id)
        else {
            return Ok(());
        };
        if self.is_driving(&active).await {
            return Ok(());
        }
        let Some(deployment) = self
            .store
            .get_deployment(&active)?
            .filter(|d| d.record.needs_driving())
        else {
            return Ok(());
        };
        if !self.claim(&deployment.record)? {
            return Ok(());
        }
        warn!(
            application = %application_id,
            deployment = %active,
            "lease lapsed; taking over deployment"
        );
        self.spawn_controller(deployment).await
    }

    /// Record the outcome of a finished deployment on its application's
    /// evaluation marker, unless a newer deployment was recorded since.
    pub(crate) fn record_finished(&self, deployment_id: &str) -> SchedulerResult<()> {
        let Some(deployment) = self.store.get_deployment(deployment_id)? else {
            return Ok(());
        };
        let finished = LastDeployment::of(&deployment.record);
        self.update_evaluation(&deployment.record.application_id, |r| {
            let newer = r
                .last_deployment
                .as_ref()
                .is_some_and(|l| l.deployment_id != finished.deployment_id && !l.status.is_terminal());
            if !newer {
                r.last_deployment = Some(finished.clone());
            }
        })
    }

    /// Read-modify-write the evaluation marker with compare-and-swap.
    fn update_evaluation(
        &self,
        application_id: &str,
        mut apply: impl FnMut(&mut EvaluationRecord),
    ) -> SchedulerResult<()> {
        for _ in 0..CAS_ATTEMPTS {
            let current = self.store.get_evaluation(application_id)?;
            let expected = current.as_ref().map(|c| c.version);
            let mut record = current.map(Versioned::into_record).unwrap_or_else(|| EvaluationRecord {
                application_id: application_id.to_string(),
                ..Default::default()
            });
            apply(&mut record);
            record.updated_at = epoch_millis();
            if self.store.cas_evaluation(expected, &record)? {
                return Ok(());
            }
        }
        Err(SchedulerError::Conflict(format!(
            "evaluation marker of {application_id}"
        )))
    }
}

fn occupied(active: DeploymentId, queued: bool, revision: Revision) -> TriggerOutcome {
    if queued {
        TriggerOutcome::Queued {
            active_deployment_id: active,
            revision,
        }
    } else {
        TriggerOutcome::AlreadyActive {
            deployment_id: active,
        }
    }
}

fn new_deployment(app: &Application, snapshot: DesiredStateSnapshot, plan: PipelinePlan) -> Deployment {
    Deployment {
        id: Uuid::now_v7().to_string(),
        application_id: app.id.clone(),
        platform: app.platform,
        trigger_revision: snapshot.revision.clone(),
        desired: snapshot,
        running_revision: plan.live_revision,
        status: DeploymentStatus::Planned,
        path: plan.path,
        pipeline: plan.stages,
        auto_rollback: app.policy.auto_rollback,
        timeout_secs: app.policy.deployment_timeout_secs,
        rolling_back: false,
        failure: None,
        rollback_failure: None,
        summary: plan.summary,
        created_at: epoch_millis(),
        started_at: None,
        completed_at: None,
    }
}
