//! Scheduler — owns the per-application evaluation tasks and the
//! per-deployment controller tasks.
//!
//! Every registered application gets one evaluation task, so at most one
//! evaluation per application runs at any time. Deployments created by an
//! evaluation get a [`DeploymentController`] task and a command channel;
//! operator commands are routed through that channel.
//!
//! Several schedulers may share one store. Each has an instance id and
//! drives only deployments whose active-marker lease it holds. A lease
//! that lapses (its holder died without shutting down) is claimed by the
//! next scheduler that evaluates the application.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rudder_controller::{
    CommandOutcome, CommandSender, ControllerError, ControllerExit, DeploymentController, channel,
};
use rudder_core::clock::{epoch_millis, epoch_secs};
use rudder_core::config::SchedulerConfig;
use rudder_core::{
    ActiveMarker, Application, ApplicationId, Deployment, DeploymentId, DesiredStateProvider,
    DriverRegistry, EvaluationRecord, Lease, Reporter, Revision,
};
use rudder_planner::Planner;
use rudder_state::{StateStore, Versioned};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{SchedulerError, SchedulerResult};
use crate::worker::{self, AppEvent};

/// Compare-and-swap attempts before a conflict is reported as an error.
pub(crate) const CAS_ATTEMPTS: usize = 8;

/// Capacity of an application task's event channel.
const EVENT_BUFFER: usize = 32;

/// Delay before a failed controller is restarted, doubled per failure.
const RESTART_BACKOFF: Duration = Duration::from_millis(100);
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(5);

/// Result of a manual deployment trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// A new deployment was created.
    Created { deployment_id: DeploymentId },
    /// A deployment of the requested revision is already active.
    AlreadyActive { deployment_id: DeploymentId },
    /// Another deployment is active; the revision runs after it finishes.
    Queued {
        active_deployment_id: DeploymentId,
        revision: Revision,
    },
}

/// What [`Scheduler::recover`] found in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Deployments whose controllers were restarted.
    pub resumed: Vec<DeploymentId>,
    /// Applications whose marker pointed at a finished deployment.
    pub released_markers: Vec<ApplicationId>,
    /// Unfinished deployments leased to another live scheduler.
    pub owned_elsewhere: Vec<DeploymentId>,
}

/// Handle to one application's evaluation task.
struct AppSlot {
    events: mpsc::Sender<AppEvent>,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Handle to one running deployment controller.
struct ControllerSlot {
    application_id: ApplicationId,
    commands: CommandSender,
    handle: JoinHandle<()>,
}

/// The application scheduler.
///
/// Cheap to clone; clones share the same tasks and state.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) store: StateStore,
    pub(crate) provider: Arc<dyn DesiredStateProvider>,
    pub(crate) drivers: DriverRegistry,
    pub(crate) planner: Planner,
    pub(crate) reporter: Arc<dyn Reporter>,
    pub(crate) config: SchedulerConfig,
    instance_id: Arc<str>,
    apps: Arc<RwLock<HashMap<ApplicationId, AppSlot>>>,
    controllers: Arc<RwLock<HashMap<DeploymentId, ControllerSlot>>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    running: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        store: StateStore,
        provider: Arc<dyn DesiredStateProvider>,
        drivers: DriverRegistry,
        reporter: Arc<dyn Reporter>,
        config: SchedulerConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            provider,
            drivers,
            planner: Planner::new(),
            reporter,
            config,
            instance_id: Uuid::now_v7().to_string().into(),
            apps: Arc::new(RwLock::new(HashMap::new())),
            controllers: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx: Arc::new(shutdown_tx),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Owner name written into the leases this scheduler takes.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.config.lease_ttl_secs.max(1))
    }

    pub(crate) fn new_lease(&self) -> Lease {
        Lease {
            owner: self.instance_id.to_string(),
            expires_at: epoch_millis() + self.lease_ttl().as_millis() as u64,
        }
    }

    /// Recover unfinished work, then start an evaluation task for every
    /// registered application.
    pub async fn start(&self) -> SchedulerResult<RecoveryReport> {
        let report = self.recover().await?;

        self.running.store(true, Ordering::SeqCst);
        for app in self.store.list_applications()? {
            if !app.record.deleted {
                self.spawn_application(&app.record.id).await;
            }
        }

        info!(
            instance = %self.instance_id,
            resumed = report.resumed.len(),
            released = report.released_markers.len(),
            owned_elsewhere = report.owned_elsewhere.len(),
            "scheduler started"
        );
        Ok(report)
    }

    /// Release stale active markers and restart a controller for every
    /// deployment that still needs driving and is not leased to another
    /// live scheduler.
    pub async fn recover(&self) -> SchedulerResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for app in self.store.list_applications()? {
            let app_id = app.record.id;
            let Some(marker) = self.store.get_active_marker(&app_id)? else {
                continue;
            };
            let Some(active) = marker.record.deployment_id.as_deref() else {
                continue;
            };
            let live = self
                .store
                .get_deployment(active)?
                .is_some_and(|d| d.record.needs_driving());
            if live {
                continue;
            }
            let released = ActiveMarker {
                application_id: app_id.clone(),
                deployment_id: None,
                lease: None,
            };
            if self.store.cas_active_marker(Some(marker.version), &released)? {
                warn!(application = %app_id, deployment = %active, "released stale active marker");
                report.released_markers.push(app_id);
            }
        }

        for deployment in self.store.list_unfinished_deployments()? {
            let id = deployment.record.id.clone();
            if self.is_driving(&id).await {
                continue;
            }
            if !self.claim(&deployment.record)? {
                info!(deployment = %id, "deployment is leased to another scheduler; not resuming");
                report.owned_elsewhere.push(id);
                continue;
            }
            info!(
                deployment = %id,
                application = %deployment.record.application_id,
                status = %deployment.record.status,
                "resuming deployment"
            );
            self.spawn_controller(deployment).await?;
            report.resumed.push(id);
        }

        Ok(report)
    }

    /// Take the lease on `deployment`'s active marker. Returns false when
    /// another live scheduler holds it or the marker names a different
    /// deployment.
    pub(crate) fn claim(&self, deployment: &Deployment) -> SchedulerResult<bool> {
        let app = &deployment.application_id;
        for _ in 0..CAS_ATTEMPTS {
            let current = self.store.get_active_marker(app)?;
            let expected = current.as_ref().map(|m| m.version);
            if let Some(marker) = current.map(Versioned::into_record) {
                let other = marker
                    .deployment_id
                    .as_ref()
                    .is_some_and(|active| active != &deployment.id);
                if other || marker.leased_to_other(&self.instance_id, epoch_millis()) {
                    return Ok(false);
                }
            }
            let claimed = ActiveMarker {
                application_id: app.clone(),
                deployment_id: Some(deployment.id.clone()),
                lease: Some(self.new_lease()),
            };
            if self.store.cas_active_marker(expected, &claimed)? {
                return Ok(true);
            }
        }
        Err(SchedulerError::Conflict(format!("active marker of {app}")))
    }

    // ── Applications ───────────────────────────────────────────────

    /// Insert or update an application and schedule its evaluation.
    ///
    /// The creation timestamp of an existing record is kept. A deleted
    /// application is revived.
    pub async fn register_application(&self, mut app: Application) -> SchedulerResult<()> {
        if self.drivers.get(app.platform).is_none() {
            return Err(SchedulerError::UnsupportedPlatform(app.platform));
        }

        let now = epoch_secs();
        match self.store.get_application(&app.id)? {
            Some(existing) => app.created_at = existing.record.created_at,
            None => app.created_at = now,
        }
        app.updated_at = now;
        app.deleted = false;
        self.store.put_application(&app)?;
        info!(application = %app.id, platform = %app.platform, "application registered");

        if self.running.load(Ordering::SeqCst)
            && !self.send_event(&app.id, AppEvent::ConfigChanged).await
        {
            self.spawn_application(&app.id).await;
        }
        Ok(())
    }

    /// Soft-delete an application: stop its evaluation task and cancel
    /// its active deployment. Its history is kept.
    pub async fn remove_application(&self, application_id: &str) -> SchedulerResult<()> {
        let Some(stored) = self.store.get_application(application_id)? else {
            return Err(SchedulerError::ApplicationNotFound(application_id.to_string()));
        };
        let mut app = stored.record;
        if !app.deleted {
            app.deleted = true;
            app.updated_at = epoch_secs();
            self.store.put_application(&app)?;
        }

        if let Some(slot) = self.apps.write().await.remove(application_id) {
            let _ = slot.stop_tx.send(true);
            let _ = slot.handle.await;
        }

        if let Some(marker) = self.store.get_active_marker(application_id)?
            && let Some(active) = marker.record.deployment_id
        {
            let outcome = self.cancel_deployment(&active).await?;
            info!(application = %application_id, deployment = %active, ?outcome, "cancelled active deployment of removed application");
        }

        info!(application = %application_id, "application removed");
        Ok(())
    }

    /// Re-evaluate an application now, even if its revision is unchanged.
    pub async fn notify_config_changed(&self, application_id: &str) -> SchedulerResult<()> {
        if self.send_event(application_id, AppEvent::ConfigChanged).await {
            Ok(())
        } else {
            Err(SchedulerError::ApplicationNotFound(application_id.to_string()))
        }
    }

    pub fn get_application(&self, application_id: &str) -> SchedulerResult<Application> {
        self.store
            .get_application(application_id)?
            .map(Versioned::into_record)
            .filter(|a| !a.deleted)
            .ok_or_else(|| SchedulerError::ApplicationNotFound(application_id.to_string()))
    }

    pub fn list_applications(&self) -> SchedulerResult<Vec<Application>> {
        Ok(self
            .store
            .list_applications()?
            .into_iter()
            .map(Versioned::into_record)
            .filter(|a| !a.deleted)
            .collect())
    }

    pub fn evaluation(&self, application_id: &str) -> SchedulerResult<EvaluationRecord> {
        Ok(self
            .store
            .get_evaluation(application_id)?
            .map(Versioned::into_record)
            .unwrap_or_else(|| EvaluationRecord {
                application_id: application_id.to_string(),
                ..Default::default()
            }))
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Deploy `revision` (or the latest revision when `None`) regardless of
    /// the diff. Runs on the application's evaluation task.
    pub async fn trigger_deployment(
        &self,
        application_id: &str,
        revision: Option<Revision>,
    ) -> SchedulerResult<TriggerOutcome> {
        let events = self
            .apps
            .read()
            .await
            .get(application_id)
            .map(|slot| slot.events.clone())
            .ok_or_else(|| SchedulerError::ApplicationNotFound(application_id.to_string()))?;

        let (reply, rx) = oneshot::channel();
        events
            .send(AppEvent::Trigger { revision, reply })
            .await
            .map_err(|_| SchedulerError::ShuttingDown)?;
        rx.await.map_err(|_| SchedulerError::ShuttingDown)?
    }

    pub fn get_deployment(&self, deployment_id: &str) -> SchedulerResult<Deployment> {
        self.store
            .get_deployment(deployment_id)?
            .map(Versioned::into_record)
            .ok_or_else(|| SchedulerError::DeploymentNotFound(deployment_id.to_string()))
    }

    /// Deployments of one application, newest first.
    pub fn list_deployments(&self, application_id: &str) -> SchedulerResult<Vec<Deployment>> {
        let mut deployments: Vec<Deployment> = self
            .store
            .list_deployments_for_application(application_id)?
            .into_iter()
            .map(Versioned::into_record)
            .collect();
        deployments.reverse();
        Ok(deployments)
    }

    pub async fn approve_stage(
        &self,
        deployment_id: &str,
        ordinal: u32,
        approver: &str,
    ) -> SchedulerResult<CommandOutcome> {
        if let Some(commands) = self.commands_for(deployment_id).await
            && let Some(outcome) = commands.approve(ordinal, approver).await
        {
            return Ok(outcome);
        }
        self.without_controller(deployment_id)
    }

    pub async fn cancel_deployment(&self, deployment_id: &str) -> SchedulerResult<CommandOutcome> {
        if let Some(commands) = self.commands_for(deployment_id).await
            && let Some(outcome) = commands.cancel().await
        {
            return Ok(outcome);
        }
        self.without_controller(deployment_id)
    }

    /// Answer a command for a deployment that has no live controller.
    fn without_controller(&self, deployment_id: &str) -> SchedulerResult<CommandOutcome> {
        let deployment = self.get_deployment(deployment_id)?;
        if deployment.needs_driving() {
            Err(SchedulerError::ControllerUnavailable(deployment_id.to_string()))
        } else {
            Ok(CommandOutcome::NoOp)
        }
    }

    async fn commands_for(&self, deployment_id: &str) -> Option<CommandSender> {
        self.controllers
            .read()
            .await
            .get(deployment_id)
            .map(|slot| slot.commands.clone())
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether this scheduler runs a controller for `deployment_id`.
    pub(crate) async fn is_driving(&self, deployment_id: &str) -> bool {
        self.controllers.read().await.contains_key(deployment_id)
    }

    /// Number of controllers currently running.
    pub async fn active_controllers(&self) -> usize {
        self.controllers.read().await.len()
    }

    /// Stop every evaluation task and controller, waiting for them to exit.
    /// Unfinished deployments stay persisted and resume on the next start.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let apps: Vec<AppSlot> = self.apps.write().await.drain().map(|(_, s)| s).collect();
        for slot in apps {
            let _ = slot.stop_tx.send(true);
            let _ = slot.handle.await;
        }

        let controllers: Vec<(DeploymentId, ControllerSlot)> =
            self.controllers.write().await.drain().collect();
        for (id, slot) in controllers {
            if let Err(e) = slot.handle.await {
                error!(deployment = %id, application = %slot.application_id, error = %e, "controller task panicked");
            }
        }
        info!("scheduler stopped");
    }

    // ── Tasks ──────────────────────────────────────────────────────

    async fn spawn_application(&self, application_id: &str) {
        let mut apps = self.apps.write().await;
        if apps.contains_key(application_id) {
            return;
        }
        let (events, rx) = mpsc::channel(EVENT_BUFFER);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(worker::run(
            self.clone(),
            application_id.to_string(),
            rx,
            stop_rx,
        ));
        apps.insert(
            application_id.to_string(),
            AppSlot {
                events,
                stop_tx,
                handle,
            },
        );
        debug!(application = %application_id, "evaluation task started");
    }

    /// Deliver `event` to an application's task. Returns `false` when the
    /// application has no running task.
    async fn send_event(&self, application_id: &str, event: AppEvent) -> bool {
        let events = self
            .apps
            .read()
            .await
            .get(application_id)
            .map(|slot| slot.events.clone());
        match events {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Start a controller for `deployment`. The caller must hold its lease.
    ///
    /// A controller that fails is restarted from the stored record with a
    /// growing delay. When it finishes, the outcome is recorded on the
    /// evaluation marker and the owning application is re-evaluated so a
    /// queued revision is picked up.
    pub(crate) async fn spawn_controller(
        &self,
        deployment: Versioned<Deployment>,
    ) -> SchedulerResult<()> {
        let platform = deployment.record.platform;
        let driver = self
            .drivers
            .get(platform)
            .ok_or(SchedulerError::UnsupportedPlatform(platform))?;

        let id = deployment.record.id.clone();
        let application_id = deployment.record.application_id.clone();
        let (commands, rx) = channel();
        let controller = DeploymentController::new(
            self.store.clone(),
            driver,
            self.reporter.clone(),
            deployment,
            rx,
            self.shutdown_tx.subscribe(),
        )
        .with_lease(self.instance_id.to_string(), self.lease_ttl());

        // The slot is inserted before the task can remove it.
        let mut controllers = self.controllers.write().await;
        let scheduler = self.clone();
        let task_id = id.clone();
        let task_app = application_id.clone();
        let handle = tokio::spawn(async move {
            let exit = scheduler.supervise(controller).await;
            scheduler.controllers.write().await.remove(&task_id);
            if let ControllerExit::Finished(status) = exit {
                debug!(deployment = %task_id, %status, "controller exited");
                if let Err(e) = scheduler.record_finished(&task_id) {
                    error!(deployment = %task_id, error = %e, "could not record deployment outcome");
                }
                scheduler
                    .send_event(&task_app, AppEvent::DeploymentFinished(task_id))
                    .await;
            }
        });
        controllers.insert(
            id,
            ControllerSlot {
                application_id,
                commands,
                handle,
            },
        );
        Ok(())
    }

    /// Run `controller`, restarting it after errors until it exits.
    async fn supervise(&self, mut controller: DeploymentController) -> ControllerExit {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut backoff = RESTART_BACKOFF;
        loop {
            let err = match controller.run().await {
                Ok(exit) => return exit,
                Err(e) => e,
            };
            let id = controller.deployment().id.clone();
            error!(
                deployment = %id,
                error = %err,
                backoff_ms = backoff.as_millis() as u64,
                "controller failed; restarting from the stored record"
            );
            loop {
                if !pause(&mut shutdown, backoff).await {
                    return ControllerExit::Shutdown;
                }
                backoff = (backoff * 2).min(MAX_RESTART_BACKOFF);
                match controller.reload() {
                    Ok(()) => break,
                    Err(ControllerError::Missing(_)) => {
                        error!(deployment = %id, "deployment vanished from the store; controller abandoned");
                        return ControllerExit::Superseded;
                    }
                    Err(e) => warn!(deployment = %id, error = %e, "reload failed; retrying"),
                }
            }
        }
    }
}

/// Sleep for `delay`. Returns false if shutdown was requested first.
async fn pause(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}
