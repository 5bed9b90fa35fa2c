//! Deployment controller — drives one deployment to a terminal status.
//!
//! The controller is re-entrant: every loop iteration reads the committed
//! record and decides the next step from it alone. That is what makes
//! crash recovery a plain restart of the same loop.
//!
//! Stage handling:
//! - `MANUAL_APPROVAL` pauses the deployment until an approval command.
//! - `WAIT` is a timer measured from the stage's persisted start.
//! - every other kind is a driver call bounded by the stage timeout.
//!
//! A driver stage that is `RUNNING` with no scheduled retry when the loop
//! reaches it was in flight when the previous controller stopped; that
//! attempt counts as failed.
//!
//! Only one controller may write a deployment. A controller started with
//! [`DeploymentController::with_lease`] keeps renewing the lease on the
//! application's active marker and stops as soon as the lease or the
//! deployment record is taken by someone else.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use rudder_core::clock::epoch_millis;
use rudder_core::{
    ActiveMarker, Deployment, DeploymentStatus, DriverError, Failure, FailureKind, Lease,
    PlatformDriver, Reporter, RetryPolicy, Stage, StageContext, StageKind, StageOutput,
    StageRun, StageStatus, transitions_between,
};
use rudder_state::{StateStore, Versioned};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::command::{CommandOutcome, ControlCommand};
use crate::error::{ControllerError, ControllerResult};

/// Compare-and-swap attempts before a conflict is reported as an error.
const CAS_ATTEMPTS: usize = 8;

/// How long a best-effort driver cancel may take.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Fallback stage settings for synthesized rollback stages.
const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 300;

/// Why [`DeploymentController::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerExit {
    /// The deployment reached a terminal status and needs no more work.
    Finished(DeploymentStatus),
    /// Shutdown was requested. The deployment can be resumed.
    Shutdown,
    /// Another controller owns the deployment now. Nothing was written
    /// after that was detected.
    Superseded,
}

/// Something that ended a wait before the stage finished on its own.
#[derive(Debug)]
enum Wake {
    Elapsed,
    Approved,
    Deadline,
    Cancel(oneshot::Sender<CommandOutcome>),
    Shutdown,
}

/// Lease held on the application's active marker.
struct LeaseHold {
    owner: String,
    ttl: Duration,
    renew_at: Instant,
}

/// Executes one deployment's pipeline.
pub struct DeploymentController {
    store: StateStore,
    driver: Arc<dyn PlatformDriver>,
    reporter: Arc<dyn Reporter>,
    current: Versioned<Deployment>,
    commands: mpsc::Receiver<ControlCommand>,
    commands_open: bool,
    shutdown: watch::Receiver<bool>,
    lease: Option<LeaseHold>,
}

impl DeploymentController {
    pub fn new(
        store: StateStore,
        driver: Arc<dyn PlatformDriver>,
        reporter: Arc<dyn Reporter>,
        deployment: Versioned<Deployment>,
        commands: mpsc::Receiver<ControlCommand>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            driver,
            reporter,
            current: deployment,
            commands,
            commands_open: true,
            shutdown,
            lease: None,
        }
    }

    /// Hold the active-marker lease as `owner`, renewing it every third
    /// of `ttl`.
    pub fn with_lease(mut self, owner: impl Into<String>, ttl: Duration) -> Self {
        self.lease = Some(LeaseHold {
            owner: owner.into(),
            ttl,
            renew_at: Instant::now() + ttl / 3,
        });
        self
    }

    pub fn deployment(&self) -> &Deployment {
        &self.current.record
    }

    /// Replace the in-memory record with the committed one. Used to
    /// resume after [`run`](Self::run) returned an error.
    pub fn reload(&mut self) -> ControllerResult<()> {
        let id = &self.current.record.id;
        self.current = self
            .store
            .get_deployment(id)?
            .ok_or_else(|| ControllerError::Missing(id.clone()))?;
        Ok(())
    }

    /// Drive the deployment until it is finished, shutdown is requested,
    /// or another controller takes it over.
    ///
    /// After an error the controller can be [reloaded](Self::reload) and
    /// run again.
    pub async fn run(&mut self) -> ControllerResult<ControllerExit> {
        info!(
            deployment = %self.current.record.id,
            application = %self.current.record.application_id,
            status = %self.current.record.status,
            "deployment controller started"
        );

        let exit = loop {
            if *self.shutdown.borrow() {
                break ControllerExit::Shutdown;
            }
            match self.advance().await {
                Ok(Some(exit)) => break exit,
                Ok(None) => {}
                Err(ControllerError::Superseded(id)) => {
                    warn!(deployment = %id, "deployment taken over elsewhere; controller stopping");
                    break ControllerExit::Superseded;
                }
                Err(e) => return Err(e),
            }
        };

        if let ControllerExit::Finished(status) = exit {
            // Anything still queued arrived after the deployment finished.
            self.commands.close();
            while let Ok(cmd) = self.commands.try_recv() {
                let reply = match cmd {
                    ControlCommand::Approve { reply, .. } | ControlCommand::Cancel { reply } => reply,
                };
                let _ = reply.send(CommandOutcome::NoOp);
            }
            info!(deployment = %self.current.record.id, %status, "deployment finished");
        } else if exit == ControllerExit::Shutdown {
            if let Err(e) = self.drop_lease() {
                warn!(deployment = %self.current.record.id, error = %e, "could not drop lease on shutdown");
            }
            debug!(deployment = %self.current.record.id, "controller stopped for shutdown");
        }
        Ok(exit)
    }

    async fn advance(&mut self) -> ControllerResult<Option<ControllerExit>> {
        if self.renew_at().is_some_and(|at| at <= Instant::now()) {
            self.renew_lease()?;
        }
        if !self.current.record.needs_driving() {
            self.release_marker()?;
            return Ok(Some(ControllerExit::Finished(self.current.record.status)));
        }
        self.step().await
    }

    /// Advance the deployment by one step.
    async fn step(&mut self) -> ControllerResult<Option<ControllerExit>> {
        let deployment = &self.current.record;

        if matches!(
            deployment.status,
            DeploymentStatus::Pending | DeploymentStatus::Planned
        ) {
            let now = epoch_millis();
            self.commit(|d| {
                d.status = DeploymentStatus::Running;
                d.started_at.get_or_insert(now);
            })?;
            return Ok(None);
        }

        let Some(ordinal) = deployment.next_unfinished() else {
            self.complete()?;
            return Ok(None);
        };

        if self.deadline().is_some_and(|at| at <= Instant::now()) {
            self.timed_out(ordinal)?;
            return Ok(None);
        }

        let kind = self.stage(ordinal)?.kind();
        match kind {
            StageKind::ManualApproval if self.current.record.rolling_back => {
                let now = epoch_millis();
                self.commit(|d| {
                    if let Some(s) = d.stage_mut(ordinal) {
                        s.status = StageStatus::Skipped;
                        s.completed_at = Some(now);
                    }
                })?;
                Ok(None)
            }
            StageKind::ManualApproval => self.await_approval(ordinal).await,
            StageKind::Wait => self.run_wait(ordinal).await,
            _ => self.run_driver_stage(ordinal).await,
        }
    }

    // ── Stage kinds ────────────────────────────────────────────────

    async fn await_approval(&mut self, ordinal: u32) -> ControllerResult<Option<ControllerExit>> {
        if self.current.record.status != DeploymentStatus::PausedForApproval {
            let now = epoch_millis();
            self.commit(|d| {
                d.status = DeploymentStatus::PausedForApproval;
                if let Some(s) = d.stage_mut(ordinal) {
                    s.status = StageStatus::Running;
                    s.started_at.get_or_insert(now);
                }
            })?;
            info!(deployment = %self.current.record.id, ordinal, "awaiting approval");
        }

        let wake = self.wait_until(None).await?;
        self.interrupted(wake, ordinal, None).await
    }

    async fn run_wait(&mut self, ordinal: u32) -> ControllerResult<Option<ControllerExit>> {
        let run = self.stage(ordinal)?;
        let Stage::Wait { duration_secs } = run.stage else {
            return Ok(None);
        };

        let started = match run.started_at {
            Some(at) => at,
            None => {
                let now = epoch_millis();
                self.commit(|d| {
                    if let Some(s) = d.stage_mut(ordinal) {
                        s.status = StageStatus::Running;
                        s.attempt = s.attempt.max(1);
                        s.started_at = Some(now);
                    }
                })?;
                now
            }
        };

        let until = instant_at(started.saturating_add(duration_secs.saturating_mul(1000)));
        match self.wait_until(Some(until)).await? {
            Wake::Elapsed => {
                let now = epoch_millis();
                self.commit(|d| {
                    if let Some(s) = d.stage_mut(ordinal) {
                        s.status = StageStatus::Succeeded;
                        s.completed_at = Some(now);
                    }
                })?;
                Ok(None)
            }
            wake => self.interrupted(wake, ordinal, None).await,
        }
    }

    async fn run_driver_stage(&mut self, ordinal: u32) -> ControllerResult<Option<ControllerExit>> {
        let run = self.stage(ordinal)?;
        if run.status == StageStatus::Running {
            match run.retry_at {
                Some(at) => match self.wait_until(Some(instant_at(at))).await? {
                    Wake::Elapsed => {}
                    wake => return self.interrupted(wake, ordinal, None).await,
                },
                None => {
                    warn!(
                        deployment = %self.current.record.id,
                        ordinal,
                        attempt = run.attempt,
                        "stage was in flight when the controller stopped"
                    );
                    self.attempt_failed(ordinal, "attempt outcome unknown after restart".to_string())?;
                    return Ok(None);
                }
            }
        }

        // The attempt number is durable before the driver is called.
        let now = epoch_millis();
        self.commit(|d| {
            if let Some(s) = d.stage_mut(ordinal) {
                s.status = StageStatus::Running;
                s.attempt += 1;
                s.retry_at = None;
                s.started_at.get_or_insert(now);
            }
        })?;

        let run = self.stage(ordinal)?;
        let ctx = self.context(&run);
        info!(
            deployment = %ctx.deployment_id,
            ordinal,
            stage = %run.kind(),
            attempt = run.attempt,
            "stage attempt started"
        );

        let call = {
            let driver = self.driver.clone();
            let ctx = ctx.clone();
            let stage = run.stage.clone();
            let limit = (run.timeout_secs > 0).then(|| Duration::from_secs(run.timeout_secs));
            async move { call_driver(driver.as_ref(), &ctx, &stage, limit).await }
        };
        tokio::pin!(call);

        let result = loop {
            let deadline = self.deadline();
            let renew = self.renew_at();
            tokio::select! {
                result = &mut call => break Ok(result),
                _ = sleep_until_opt(deadline) => break Err(Wake::Deadline),
                _ = sleep_until_opt(renew) => {
                    if let Err(e) = self.renew_lease() {
                        self.abort(&ctx).await;
                        return Err(e);
                    }
                }
                _ = self.shutdown.changed() => break Err(Wake::Shutdown),
                cmd = self.commands.recv(), if self.commands_open => {
                    if let Some(wake) = self.on_command(cmd).await? {
                        break Err(wake);
                    }
                }
            }
        };

        match result {
            Ok(Ok(output)) => {
                let now = epoch_millis();
                let StageOutput { message } = output;
                self.commit(|d| {
                    if let Some(s) = d.stage_mut(ordinal) {
                        s.status = StageStatus::Succeeded;
                        s.completed_at = Some(now);
                        s.diagnostics = message.clone();
                    }
                })?;
                Ok(None)
            }
            Ok(Err(e)) => {
                self.attempt_failed(ordinal, e.to_string())?;
                Ok(None)
            }
            Err(wake) => self.interrupted(wake, ordinal, Some(&ctx)).await,
        }
    }

    // ── Waiting and commands ───────────────────────────────────────

    /// Wait for `until`, serving commands meanwhile.
    async fn wait_until(&mut self, until: Option<Instant>) -> ControllerResult<Wake> {
        loop {
            let deadline = self.deadline();
            let renew = self.renew_at();
            tokio::select! {
                _ = sleep_until_opt(until) => return Ok(Wake::Elapsed),
                _ = sleep_until_opt(deadline) => return Ok(Wake::Deadline),
                _ = sleep_until_opt(renew) => self.renew_lease()?,
                _ = self.shutdown.changed() => return Ok(Wake::Shutdown),
                cmd = self.commands.recv(), if self.commands_open => {
                    if let Some(wake) = self.on_command(cmd).await? {
                        return Ok(wake);
                    }
                }
            }
        }
    }

    /// Answer a command. Returns a wake reason when the command ends the
    /// current wait.
    async fn on_command(&mut self, cmd: Option<ControlCommand>) -> ControllerResult<Option<Wake>> {
        match cmd {
            None => {
                self.commands_open = false;
                Ok(None)
            }
            Some(ControlCommand::Cancel { reply }) => {
                if self.current.record.status.is_terminal() {
                    let _ = reply.send(CommandOutcome::NoOp);
                    return Ok(None);
                }
                Ok(Some(Wake::Cancel(reply)))
            }
            Some(ControlCommand::Approve {
                ordinal,
                approver,
                reply,
            }) => {
                let outcome = self.approve(ordinal, &approver)?;
                let applied = outcome == CommandOutcome::Applied;
                let _ = reply.send(outcome);
                Ok(applied.then_some(Wake::Approved))
            }
        }
    }

    /// Handle a wake that interrupted `ordinal`.
    async fn interrupted(
        &mut self,
        wake: Wake,
        ordinal: u32,
        in_flight: Option<&StageContext>,
    ) -> ControllerResult<Option<ControllerExit>> {
        match wake {
            Wake::Elapsed | Wake::Approved => Ok(None),
            Wake::Shutdown => Ok(Some(ControllerExit::Shutdown)),
            Wake::Deadline => {
                if let Some(ctx) = in_flight {
                    self.abort(ctx).await;
                }
                self.timed_out(ordinal)?;
                Ok(None)
            }
            Wake::Cancel(reply) => {
                if let Some(ctx) = in_flight {
                    self.abort(ctx).await;
                }
                let now = epoch_millis();
                self.commit(|d| {
                    d.cancel_remaining();
                    d.status = DeploymentStatus::Cancelled;
                    d.completed_at = Some(now);
                })?;
                info!(deployment = %self.current.record.id, ordinal, "deployment cancelled");
                let _ = reply.send(CommandOutcome::Applied);
                Ok(None)
            }
        }
    }

    fn approve(&mut self, ordinal: u32, approver: &str) -> ControllerResult<CommandOutcome> {
        let deployment = &self.current.record;
        if deployment.status.is_terminal() {
            return Ok(CommandOutcome::NoOp);
        }
        let Some(run) = deployment.stage(ordinal) else {
            return Ok(CommandOutcome::Rejected(format!(
                "deployment has no stage {ordinal}"
            )));
        };
        let Stage::ManualApproval { approvers } = &run.stage else {
            return Ok(CommandOutcome::Rejected(format!(
                "stage {ordinal} is {}, not an approval gate",
                run.kind()
            )));
        };
        if run.status.is_finished() {
            debug!(deployment = %deployment.id, ordinal, "stale approval ignored");
            return Ok(CommandOutcome::NoOp);
        }
        if deployment.status != DeploymentStatus::PausedForApproval
            || deployment.next_unfinished() != Some(ordinal)
        {
            return Ok(CommandOutcome::Rejected(format!(
                "stage {ordinal} is not awaiting approval"
            )));
        }
        if !approvers.is_empty() && !approvers.iter().any(|a| a == approver) {
            return Ok(CommandOutcome::Rejected(format!(
                "{approver} is not an allowed approver for stage {ordinal}"
            )));
        }

        let now = epoch_millis();
        self.commit(|d| {
            d.status = DeploymentStatus::Running;
            if let Some(s) = d.stage_mut(ordinal) {
                s.status = StageStatus::Succeeded;
                s.approved_by = Some(approver.to_string());
                s.completed_at = Some(now);
            }
        })?;
        info!(deployment = %self.current.record.id, ordinal, %approver, "stage approved");
        Ok(CommandOutcome::Applied)
    }

    // ── Failure handling ───────────────────────────────────────────

    /// Record a failed attempt: schedule a retry, or fail the stage.
    fn attempt_failed(&mut self, ordinal: u32, message: String) -> ControllerResult<()> {
        let run = self.stage(ordinal)?;
        if run.attempts_left() {
            let backoff = run.retry.backoff_after(run.attempt);
            let retry_at = epoch_millis() + backoff;
            warn!(
                deployment = %self.current.record.id,
                ordinal,
                attempt = run.attempt,
                backoff_ms = backoff,
                error = %message,
                "stage attempt failed, retry scheduled"
            );
            self.commit(|d| {
                if let Some(s) = d.stage_mut(ordinal) {
                    s.retry_at = Some(retry_at);
                    s.diagnostics = Some(message.clone());
                }
            })
        } else {
            error!(
                deployment = %self.current.record.id,
                ordinal,
                attempts = run.attempt,
                error = %message,
                "stage failed, retries exhausted"
            );
            self.fail(FailureKind::StageExecution, ordinal, message)
        }
    }

    fn timed_out(&mut self, ordinal: u32) -> ControllerResult<()> {
        let message = format!(
            "deployment exceeded its {}s timeout",
            self.current.record.timeout_secs
        );
        error!(deployment = %self.current.record.id, ordinal, "{message}");
        self.fail(FailureKind::Timeout, ordinal, message)
    }

    /// Fail the deployment at `ordinal`. Starts a rollback when enabled;
    /// a failure during rollback is terminal.
    fn fail(&mut self, kind: FailureKind, ordinal: u32, message: String) -> ControllerResult<()> {
        let now = epoch_millis();
        let fail_stage = |d: &mut Deployment| {
            if let Some(s) = d.stage_mut(ordinal)
                && !s.status.is_finished()
            {
                s.status = StageStatus::Failed;
                s.retry_at = None;
                s.completed_at = Some(now);
                s.diagnostics = Some(message.clone());
            }
        };

        if self.current.record.rolling_back {
            self.commit(|d| {
                fail_stage(d);
                d.cancel_remaining();
                d.rolling_back = false;
                d.rollback_failure = Some(Failure {
                    kind: FailureKind::Rollback,
                    ordinal: Some(ordinal),
                    message: format!("rollback failed: {message}"),
                });
                d.completed_at = Some(now);
            })?;
            error!(deployment = %self.current.record.id, ordinal, "rollback failed; operator action required");
            return Ok(());
        }

        let driver = self.driver.clone();
        let planned = self.current.record.pipeline.len();
        self.commit(|d| {
            fail_stage(d);
            for s in d.pipeline.iter_mut().filter(|s| !s.status.is_finished()) {
                s.status = StageStatus::Skipped;
                s.retry_at = None;
            }
            d.status = DeploymentStatus::Failed;
            d.failure = Some(Failure {
                kind,
                ordinal: Some(ordinal),
                message: message.clone(),
            });

            if d.auto_rollback {
                let (retry, timeout) = rollback_settings(d);
                let base = d.pipeline.len() as u32;
                let stages = driver.rollback_stages(d);
                d.rolling_back = !stages.is_empty();
                d.pipeline.extend(
                    stages
                        .into_iter()
                        .enumerate()
                        .map(|(i, stage)| StageRun::new(base + i as u32, stage, retry, timeout)),
                );
            }
            if !d.rolling_back {
                d.completed_at = Some(now);
            }
        })?;

        if self.current.record.rolling_back {
            info!(
                deployment = %self.current.record.id,
                stages = self.current.record.pipeline.len() - planned,
                "starting rollback"
            );
        }
        Ok(())
    }

    fn complete(&mut self) -> ControllerResult<()> {
        let now = epoch_millis();
        let rolled_back = self.current.record.rolling_back;
        self.commit(|d| {
            d.status = if rolled_back {
                DeploymentStatus::RolledBack
            } else {
                DeploymentStatus::Succeeded
            };
            d.rolling_back = false;
            d.completed_at = Some(now);
        })
    }

    /// Best-effort abort of an in-flight driver call.
    async fn abort(&self, ctx: &StageContext) {
        if tokio::time::timeout(CANCEL_GRACE, self.driver.cancel(ctx))
            .await
            .is_err()
        {
            warn!(deployment = %ctx.deployment_id, ordinal = ctx.ordinal, "driver cancel timed out");
        }
    }

    // ── Persistence ────────────────────────────────────────────────

    /// Apply `mutate` to the record and persist it with compare-and-swap,
    /// then report the committed transitions.
    ///
    /// A version mismatch means another writer owns the deployment. The
    /// mutation was decided on a record that no longer exists, so it is
    /// dropped and [`ControllerError::Superseded`] is returned.
    fn commit(&mut self, mutate: impl FnOnce(&mut Deployment)) -> ControllerResult<()> {
        let mut next = self.current.record.clone();
        mutate(&mut next);
        match self.store.update_deployment(self.current.version, &next)? {
            Some(version) => {
                let events = transitions_between(&self.current.record, &next);
                self.current = Versioned::new(version, next);
                for event in &events {
                    self.reporter.report(event);
                }
                Ok(())
            }
            None => Err(ControllerError::Superseded(self.current.record.id.clone())),
        }
    }

    fn renew_at(&self) -> Option<Instant> {
        self.lease.as_ref().map(|hold| hold.renew_at)
    }

    /// Extend the lease. Fails with [`ControllerError::Superseded`] when
    /// the marker no longer names this deployment or another owner holds
    /// it.
    fn renew_lease(&mut self) -> ControllerResult<()> {
        let Some(hold) = self.lease.as_mut() else {
            return Ok(());
        };
        let deployment = &self.current.record;
        for _ in 0..CAS_ATTEMPTS {
            let marker = self
                .store
                .get_active_marker(&deployment.application_id)?
                .filter(|m| m.record.deployment_id.as_deref() == Some(deployment.id.as_str()))
                .filter(|m| m.record.lease.as_ref().is_none_or(|l| l.owner == hold.owner));
            let Some(marker) = marker else {
                return Err(ControllerError::Superseded(deployment.id.clone()));
            };
            let renewed = ActiveMarker {
                lease: Some(Lease {
                    owner: hold.owner.clone(),
                    expires_at: epoch_millis() + hold.ttl.as_millis() as u64,
                }),
                ..marker.record
            };
            if self.store.cas_active_marker(Some(marker.version), &renewed)? {
                hold.renew_at = Instant::now() + hold.ttl / 3;
                debug!(deployment = %deployment.id, "lease renewed");
                return Ok(());
            }
        }
        Err(ControllerError::Conflict(format!(
            "active marker of {}",
            deployment.application_id
        )))
    }

    /// Give up the lease so the next scheduler can resume at once.
    fn drop_lease(&mut self) -> ControllerResult<()> {
        let Some(hold) = self.lease.take() else {
            return Ok(());
        };
        let deployment = &self.current.record;
        let Some(marker) = self.store.get_active_marker(&deployment.application_id)? else {
            return Ok(());
        };
        let ours = marker.record.deployment_id.as_deref() == Some(deployment.id.as_str())
            && marker.record.lease.as_ref().is_some_and(|l| l.owner == hold.owner);
        if ours {
            let dropped = ActiveMarker {
                lease: None,
                ..marker.record
            };
            self.store.cas_active_marker(Some(marker.version), &dropped)?;
        }
        Ok(())
    }

    /// Clear the application's active marker if it still points here.
    fn release_marker(&self) -> ControllerResult<()> {
        let deployment = &self.current.record;
        for _ in 0..CAS_ATTEMPTS {
            let Some(marker) = self.store.get_active_marker(&deployment.application_id)? else {
                return Ok(());
            };
            if marker.record.deployment_id.as_deref() != Some(deployment.id.as_str()) {
                return Ok(());
            }
            let released = ActiveMarker {
                application_id: deployment.application_id.clone(),
                deployment_id: None,
                lease: None,
            };
            if self.store.cas_active_marker(Some(marker.version), &released)? {
                debug!(deployment = %deployment.id, "active marker released");
                return Ok(());
            }
        }
        Err(ControllerError::Conflict(format!(
            "active marker of {}",
            deployment.application_id
        )))
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn stage(&self, ordinal: u32) -> ControllerResult<StageRun> {
        self.current
            .record
            .stage(ordinal)
            .cloned()
            .ok_or_else(|| ControllerError::Missing(format!("{}#{ordinal}", self.current.record.id)))
    }

    fn context(&self, run: &StageRun) -> StageContext {
        let d = &self.current.record;
        StageContext {
            application_id: d.application_id.clone(),
            deployment_id: d.id.clone(),
            ordinal: run.ordinal,
            attempt: run.attempt,
            desired: d.desired.clone(),
            running_revision: d.running_revision.clone(),
        }
    }

    /// Deployment-wide deadline. Not enforced while rolling back.
    fn deadline(&self) -> Option<Instant> {
        let d = &self.current.record;
        if d.rolling_back || d.timeout_secs == 0 {
            return None;
        }
        let started = d.started_at?;
        Some(instant_at(
            started.saturating_add(d.timeout_secs.saturating_mul(1000)),
        ))
    }
}

async fn call_driver(
    driver: &dyn PlatformDriver,
    ctx: &StageContext,
    stage: &Stage,
    limit: Option<Duration>,
) -> Result<StageOutput, DriverError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, driver.apply_stage(ctx, stage))
            .await
            .unwrap_or_else(|_| {
                Err(DriverError::StageFailed(format!(
                    "stage timed out after {}s",
                    limit.as_secs()
                )))
            }),
        None => driver.apply_stage(ctx, stage).await,
    }
}

/// Retry policy and timeout for synthesized rollback stages, taken from
/// the first workload stage of the plan.
fn rollback_settings(d: &Deployment) -> (RetryPolicy, u64) {
    d.pipeline
        .iter()
        .find(|s| s.kind().mutates_workload() || s.kind() == StageKind::Cleanup)
        .map(|s| (s.retry, s.timeout_secs))
        .unwrap_or((RetryPolicy::default(), DEFAULT_STAGE_TIMEOUT_SECS))
}

/// Tokio instant at which the wall clock reads `epoch_ms`.
fn instant_at(epoch_ms: u64) -> Instant {
    Instant::now() + Duration::from_millis(epoch_ms.saturating_sub(epoch_millis()))
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{self, CommandSender};
    use rudder_core::testing::{RecordingReporter, ScriptedDriver};
    use rudder_core::*;
    use rudder_state::CreateOutcome;
    use serde_json::json;
    use tokio::task::JoinHandle;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_ms: 10,
            max_backoff_ms: 40,
        }
    }

    fn deployment(id: &str, stages: Vec<Stage>) -> Deployment {
        Deployment {
            id: id.to_string(),
            application_id: "web".to_string(),
            platform: PlatformKind::Kubernetes,
            trigger_revision: "r2".to_string(),
            desired: DesiredStateSnapshot {
                application_id: "web".to_string(),
                revision: "r2".to_string(),
                payload: json!({"image": "web:v2"}),
            },
            running_revision: Some("r1".to_string()),
            status: DeploymentStatus::Planned,
            path: PipelinePath::Progressive,
            pipeline: stages
                .into_iter()
                .enumerate()
                .map(|(i, stage)| StageRun::new(i as u32, stage, fast_retry(3), 30))
                .collect(),
            auto_rollback: true,
            timeout_secs: 3600,
            rolling_back: false,
            failure: None,
            rollback_failure: None,
            summary: "test".to_string(),
            created_at: epoch_millis(),
            started_at: None,
            completed_at: None,
        }
    }

    fn rollout(canary_percent: u32) -> Stage {
        Stage::Rollout {
            canary_percent,
            target_replicas: None,
        }
    }

    fn approval(approvers: &[&str]) -> Stage {
        Stage::ManualApproval {
            approvers: approvers.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn canary() -> Vec<Stage> {
        vec![
            rollout(25),
            Stage::Analysis { duration_secs: 300 },
            rollout(100),
            Stage::Cleanup,
        ]
    }

    struct Harness {
        store: StateStore,
        driver: Arc<ScriptedDriver>,
        reporter: Arc<RecordingReporter>,
        shutdown_tx: watch::Sender<bool>,
    }

    impl Harness {
        fn new() -> Self {
            let driver = ScriptedDriver::shared(PlatformKind::Kubernetes);
            driver.set_live("web", Some("r1"), json!({"image": "web:v1"}));
            let (shutdown_tx, _) = watch::channel(false);
            Self {
                store: StateStore::open_in_memory().unwrap(),
                driver,
                reporter: Arc::new(RecordingReporter::new()),
                shutdown_tx,
            }
        }

        fn insert(&self, deployment: &Deployment) {
            assert_eq!(
                self.store.create_deployment(deployment, None, None).unwrap(),
                CreateOutcome::Created
            );
        }

        fn controller(&self, id: &str) -> (CommandSender, DeploymentController) {
            let record = self.store.get_deployment(id).unwrap().unwrap();
            let (tx, rx) = command::channel();
            let controller = DeploymentController::new(
                self.store.clone(),
                self.driver.clone(),
                self.reporter.clone(),
                record,
                rx,
                self.shutdown_tx.subscribe(),
            );
            (tx, controller)
        }

        fn start(&self, id: &str) -> (CommandSender, JoinHandle<ControllerResult<ControllerExit>>) {
            let (tx, controller) = self.controller(id);
            (tx, spawn(controller))
        }

        fn lease(&self) -> Option<Lease> {
            self.store
                .get_active_marker("web")
                .unwrap()
                .and_then(|m| m.record.lease)
        }

        fn load(&self, id: &str) -> Deployment {
            self.store.get_deployment(id).unwrap().unwrap().record
        }

        async fn wait_for(&self, id: &str, pred: impl Fn(&Deployment) -> bool) -> Deployment {
            for _ in 0..500 {
                let d = self.load(id);
                if pred(&d) {
                    return d;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("deployment {id} never reached the expected state: {:?}", self.load(id));
        }

        fn marker(&self) -> Option<String> {
            self.store
                .get_active_marker("web")
                .unwrap()
                .and_then(|m| m.record.deployment_id)
        }
    }

    fn spawn(mut controller: DeploymentController) -> JoinHandle<ControllerResult<ControllerExit>> {
        tokio::spawn(async move { controller.run().await })
    }

    async fn finish(handle: JoinHandle<ControllerResult<ControllerExit>>) -> ControllerExit {
        handle.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn quick_sync_succeeds_and_releases_marker() {
        let h = Harness::new();
        h.insert(&deployment("d-1", vec![Stage::Sync { prune: false }]));
        assert_eq!(h.marker().as_deref(), Some("d-1"));

        let (_tx, handle) = h.start("d-1");
        assert_eq!(
            finish(handle).await,
            ControllerExit::Finished(DeploymentStatus::Succeeded)
        );

        assert_eq!(
            h.reporter.deployment_statuses("d-1"),
            vec![
                DeploymentStatus::Planned,
                DeploymentStatus::Running,
                DeploymentStatus::Succeeded
            ]
        );
        let d = h.load("d-1");
        assert!(d.started_at.is_some());
        assert!(d.completed_at.is_some());
        assert_eq!(h.marker(), None);
        assert_eq!(h.driver.live("web").unwrap().revision.as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn stages_run_strictly_in_order() {
        let h = Harness::new();
        h.insert(&deployment("d-1", canary()));

        let (_tx, handle) = h.start("d-1");
        assert_eq!(
            finish(handle).await,
            ControllerExit::Finished(DeploymentStatus::Succeeded)
        );
        assert_eq!(
            h.driver.applied_kinds("d-1"),
            vec![
                StageKind::Rollout,
                StageKind::Analysis,
                StageKind::Rollout,
                StageKind::Cleanup
            ]
        );

        let mut passed = std::collections::HashSet::new();
        for event in h.reporter.events() {
            if let Transition::Stage { ordinal, to, .. } = event.transition {
                if to == StageStatus::Running {
                    assert!(ordinal == 0 || passed.contains(&(ordinal - 1)));
                }
                if matches!(to, StageStatus::Succeeded | StageStatus::Skipped) {
                    passed.insert(ordinal);
                }
            }
        }
        assert_eq!(passed.len(), 4);
    }

    #[tokio::test]
    async fn failed_attempts_are_retried_until_success() {
        let h = Harness::new();
        h.driver.fail_times(StageKind::Analysis, 2);
        h.insert(&deployment("d-1", canary()));

        let (_tx, handle) = h.start("d-1");
        assert_eq!(
            finish(handle).await,
            ControllerExit::Finished(DeploymentStatus::Succeeded)
        );

        let analysis = h.load("d-1").pipeline[1].clone();
        assert_eq!(analysis.attempt, 3);
        assert_eq!(analysis.status, StageStatus::Succeeded);
        assert_eq!(analysis.retry_at, None);
    }

    #[tokio::test]
    async fn exhausted_rollout_rolls_back() {
        let h = Harness::new();
        h.driver.fail_times(StageKind::Rollout, 3);
        h.insert(&deployment("d-1", canary()));

        let (_tx, handle) = h.start("d-1");
        assert_eq!(
            finish(handle).await,
            ControllerExit::Finished(DeploymentStatus::RolledBack)
        );

        assert_eq!(
            h.reporter.deployment_statuses("d-1"),
            vec![
                DeploymentStatus::Planned,
                DeploymentStatus::Running,
                DeploymentStatus::Failed,
                DeploymentStatus::RolledBack
            ]
        );
        let d = h.load("d-1");
        assert_eq!(d.pipeline[0].status, StageStatus::Failed);
        assert_eq!(d.pipeline[0].attempt, 3);
        assert!(d.pipeline[0].diagnostics.is_some());
        for run in &d.pipeline[1..4] {
            assert_eq!(run.status, StageStatus::Skipped);
        }
        assert_eq!(d.pipeline.len(), 5);
        assert_eq!(d.pipeline[4].kind(), StageKind::Rollback);
        assert_eq!(d.pipeline[4].status, StageStatus::Succeeded);
        assert_eq!(d.failure.unwrap().kind, FailureKind::StageExecution);
        assert!(!d.rolling_back);
        assert_eq!(h.marker(), None);
    }

    #[tokio::test]
    async fn failure_without_auto_rollback_is_terminal() {
        let h = Harness::new();
        h.driver.fail_times(StageKind::Rollout, 3);
        let mut d = deployment("d-1", canary());
        d.auto_rollback = false;
        h.insert(&d);

        let (_tx, handle) = h.start("d-1");
        assert_eq!(
            finish(handle).await,
            ControllerExit::Finished(DeploymentStatus::Failed)
        );
        let d = h.load("d-1");
        assert_eq!(d.pipeline.len(), 4);
        assert!(d.completed_at.is_some());
        assert!(!h.driver.applied_kinds("d-1").contains(&StageKind::Rollback));
        assert_eq!(h.marker(), None);
    }

    #[tokio::test]
    async fn rollback_failure_stays_failed() {
        let h = Harness::new();
        h.driver.fail_times(StageKind::Rollout, 3);
        h.driver.fail_times(StageKind::Rollback, 3);
        h.insert(&deployment("d-1", canary()));

        let (_tx, handle) = h.start("d-1");
        assert_eq!(
            finish(handle).await,
            ControllerExit::Finished(DeploymentStatus::Failed)
        );
        let d = h.load("d-1");
        let cause = d.failure.unwrap();
        assert_eq!(cause.kind, FailureKind::StageExecution);
        assert_eq!(cause.ordinal, Some(0));
        let rollback = d.rollback_failure.unwrap();
        assert_eq!(rollback.kind, FailureKind::Rollback);
        assert_eq!(rollback.ordinal, Some(4));
        assert!(!d.rolling_back);
        assert_eq!(d.pipeline[4].attempt, 3);
        assert_eq!(h.marker(), None);
    }

    #[tokio::test]
    async fn approvals_are_checked_and_idempotent() {
        let h = Harness::new();
        h.insert(&deployment(
            "d-1",
            vec![rollout(100), approval(&["alice"]), approval(&[]), Stage::Cleanup],
        ));

        let (tx, handle) = h.start("d-1");
        h.wait_for("d-1", |d| d.status == DeploymentStatus::PausedForApproval)
            .await;

        assert!(matches!(
            tx.approve(1, "mallory").await,
            Some(CommandOutcome::Rejected(_))
        ));
        assert!(matches!(
            tx.approve(0, "alice").await,
            Some(CommandOutcome::Rejected(_))
        ));
        assert!(matches!(
            tx.approve(2, "alice").await,
            Some(CommandOutcome::Rejected(_))
        ));
        assert_eq!(tx.approve(1, "alice").await, Some(CommandOutcome::Applied));
        assert_eq!(tx.approve(1, "alice").await, Some(CommandOutcome::NoOp));

        let paused = h
            .wait_for("d-1", |d| {
                d.status == DeploymentStatus::PausedForApproval && d.next_unfinished() == Some(2)
            })
            .await;
        assert_eq!(paused.pipeline[1].approved_by.as_deref(), Some("alice"));
        assert_eq!(tx.approve(2, "bob").await, Some(CommandOutcome::Applied));

        assert_eq!(
            finish(handle).await,
            ControllerExit::Finished(DeploymentStatus::Succeeded)
        );
        assert_eq!(
            h.reporter.deployment_statuses("d-1"),
            vec![
                DeploymentStatus::Planned,
                DeploymentStatus::Running,
                DeploymentStatus::PausedForApproval,
                DeploymentStatus::Running,
                DeploymentStatus::PausedForApproval,
                DeploymentStatus::Running,
                DeploymentStatus::Succeeded
            ]
        );
    }

    #[tokio::test]
    async fn cancel_while_paused_cancels_remaining_stages() {
        let h = Harness::new();
        h.insert(&deployment(
            "d-1",
            vec![
                rollout(25),
                Stage::Analysis { duration_secs: 300 },
                approval(&[]),
                rollout(100),
                Stage::Cleanup,
            ],
        ));

        let (tx, handle) = h.start("d-1");
        h.wait_for("d-1", |d| d.status == DeploymentStatus::PausedForApproval)
            .await;
        assert_eq!(tx.cancel().await, Some(CommandOutcome::Applied));
        assert_eq!(
            finish(handle).await,
            ControllerExit::Finished(DeploymentStatus::Cancelled)
        );

        let d = h.load("d-1");
        for run in &d.pipeline[2..] {
            assert_eq!(run.status, StageStatus::Cancelled);
        }
        assert_eq!(
            h.driver.applied_kinds("d-1"),
            vec![StageKind::Rollout, StageKind::Analysis]
        );
        assert_eq!(h.marker(), None);
        assert_eq!(tx.cancel().await, None);
    }

    #[tokio::test]
    async fn cancel_aborts_in_flight_stage() {
        let h = Harness::new();
        h.driver.hang_once(StageKind::Rollout);
        h.insert(&deployment("d-1", canary()));

        let (tx, handle) = h.start("d-1");
        h.wait_for("d-1", |d| d.pipeline[0].status == StageStatus::Running)
            .await;
        assert_eq!(tx.cancel().await, Some(CommandOutcome::Applied));
        assert_eq!(
            finish(handle).await,
            ControllerExit::Finished(DeploymentStatus::Cancelled)
        );
        assert_eq!(h.driver.cancels(), 1);
        assert_eq!(h.load("d-1").pipeline[0].status, StageStatus::Cancelled);
    }

    #[tokio::test]
    async fn stage_timeout_counts_as_failed_attempt() {
        let h = Harness::new();
        h.driver.hang_once(StageKind::Sync);
        let mut d = deployment("d-1", vec![Stage::Sync { prune: false }]);
        d.pipeline[0].timeout_secs = 1;
        h.insert(&d);

        let (_tx, handle) = h.start("d-1");
        assert_eq!(
            finish(handle).await,
            ControllerExit::Finished(DeploymentStatus::Succeeded)
        );
        assert_eq!(h.load("d-1").pipeline[0].attempt, 2);
    }

    #[tokio::test]
    async fn deployment_deadline_fails_and_rolls_back() {
        let h = Harness::new();
        h.driver.hang_once(StageKind::Rollout);
        let mut d = deployment("d-1", canary());
        d.timeout_secs = 1;
        h.insert(&d);

        let (_tx, handle) = h.start("d-1");
        assert_eq!(
            finish(handle).await,
            ControllerExit::Finished(DeploymentStatus::RolledBack)
        );
        let d = h.load("d-1");
        assert_eq!(d.failure.unwrap().kind, FailureKind::Timeout);
        assert_eq!(d.pipeline[0].status, StageStatus::Failed);
        assert_eq!(h.driver.cancels(), 1);
    }

    #[tokio::test]
    async fn in_flight_attempt_is_retried_after_restart() {
        let h = Harness::new();
        let mut d = deployment("d-1", vec![Stage::Sync { prune: false }]);
        h.insert(&d);

        // Persisted state of a controller that died inside the driver call.
        d.status = DeploymentStatus::Running;
        d.started_at = Some(epoch_millis());
        d.pipeline[0].status = StageStatus::Running;
        d.pipeline[0].attempt = 1;
        assert_eq!(h.store.update_deployment(1, &d).unwrap(), Some(2));

        let (_tx, handle) = h.start("d-1");
        assert_eq!(
            finish(handle).await,
            ControllerExit::Finished(DeploymentStatus::Succeeded)
        );
        let applied = h.driver.applied();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].attempt, 2);
        assert_eq!(h.load("d-1").pipeline[0].attempt, 2);
    }

    #[tokio::test]
    async fn in_flight_last_attempt_fails_after_restart() {
        let h = Harness::new();
        let mut d = deployment("d-1", vec![Stage::Sync { prune: false }]);
        d.auto_rollback = false;
        d.pipeline[0].retry = fast_retry(1);
        h.insert(&d);

        d.status = DeploymentStatus::Running;
        d.started_at = Some(epoch_millis());
        d.pipeline[0].status = StageStatus::Running;
        d.pipeline[0].attempt = 1;
        h.store.update_deployment(1, &d).unwrap();

        let (_tx, handle) = h.start("d-1");
        assert_eq!(
            finish(handle).await,
            ControllerExit::Finished(DeploymentStatus::Failed)
        );
        assert!(h.driver.applied().is_empty());
    }

    #[tokio::test]
    async fn shutdown_leaves_deployment_resumable() {
        let mut h = Harness::new();
        h.insert(&deployment("d-1", vec![rollout(100), approval(&[]), Stage::Cleanup]));

        let (_tx, handle) = h.start("d-1");
        h.wait_for("d-1", |d| d.status == DeploymentStatus::PausedForApproval)
            .await;
        h.shutdown_tx.send(true).unwrap();
        assert_eq!(finish(handle).await, ControllerExit::Shutdown);
        assert_eq!(h.load("d-1").status, DeploymentStatus::PausedForApproval);
        assert_eq!(h.marker().as_deref(), Some("d-1"));

        // Restart with a fresh shutdown signal.
        h.shutdown_tx = watch::channel(false).0;
        let (tx, handle) = h.start("d-1");
        assert_eq!(tx.approve(1, "ops").await, Some(CommandOutcome::Applied));
        assert_eq!(
            finish(handle).await,
            ControllerExit::Finished(DeploymentStatus::Succeeded)
        );

        let statuses = h.reporter.deployment_statuses("d-1");
        let terminal = statuses.iter().filter(|s| s.is_terminal()).count();
        assert_eq!(terminal, 1);
        assert_eq!(
            h.driver.applied_kinds("d-1"),
            vec![StageKind::Rollout, StageKind::Cleanup]
        );
    }

    #[tokio::test]
    async fn foreign_write_stops_controller_without_reporting() {
        let h = Harness::new();
        h.insert(&deployment("d-1", vec![approval(&[]), Stage::Cleanup]));

        let (tx, handle) = h.start("d-1");
        h.wait_for("d-1", |d| d.status == DeploymentStatus::PausedForApproval)
            .await;

        // Another writer finishes the deployment behind the controller's back.
        let stored = h.store.get_deployment("d-1").unwrap().unwrap();
        let mut other = stored.record.clone();
        other.cancel_remaining();
        other.status = DeploymentStatus::Cancelled;
        h.store.update_deployment(stored.version, &other).unwrap().unwrap();

        assert_eq!(tx.approve(0, "ops").await, None);
        assert_eq!(finish(handle).await, ControllerExit::Superseded);

        let d = h.load("d-1");
        assert_eq!(d.status, DeploymentStatus::Cancelled);
        assert_eq!(d.pipeline[0].approved_by, None);
        assert_eq!(
            h.reporter.deployment_statuses("d-1"),
            vec![
                DeploymentStatus::Planned,
                DeploymentStatus::Running,
                DeploymentStatus::PausedForApproval
            ]
        );
        assert!(h.driver.applied_kinds("d-1").is_empty());
    }

    #[tokio::test]
    async fn lease_is_renewed_and_losing_it_stops_controller() {
        let h = Harness::new();
        let d = deployment("d-1", vec![approval(&[]), Stage::Cleanup]);
        let granted = Lease {
            owner: "sched-a".to_string(),
            expires_at: epoch_millis() + 300,
        };
        h.store
            .create_deployment(&d, None, Some(granted.clone()))
            .unwrap();

        let (_tx, controller) = h.controller("d-1");
        let handle = spawn(controller.with_lease("sched-a", Duration::from_millis(300)));
        h.wait_for("d-1", |d| d.status == DeploymentStatus::PausedForApproval)
            .await;
        for _ in 0..100 {
            if h.lease().is_some_and(|l| l.expires_at > granted.expires_at) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.lease().unwrap().expires_at > granted.expires_at);

        // A second scheduler takes the deployment over.
        loop {
            let marker = h.store.get_active_marker("web").unwrap().unwrap();
            let stolen = ActiveMarker {
                lease: Some(Lease {
                    owner: "sched-b".to_string(),
                    expires_at: epoch_millis() + 60_000,
                }),
                ..marker.record
            };
            if h.store.cas_active_marker(Some(marker.version), &stolen).unwrap() {
                break;
            }
        }

        assert_eq!(finish(handle).await, ControllerExit::Superseded);
        assert_eq!(h.lease().unwrap().owner, "sched-b");
        assert_eq!(h.marker().as_deref(), Some("d-1"));
        assert_eq!(h.load("d-1").status, DeploymentStatus::PausedForApproval);
    }

    #[tokio::test]
    async fn shutdown_drops_lease_but_keeps_marker() {
        let h = Harness::new();
        let d = deployment("d-1", vec![approval(&[])]);
        let lease = Lease {
            owner: "sched-a".to_string(),
            expires_at: epoch_millis() + 60_000,
        };
        h.store.create_deployment(&d, None, Some(lease)).unwrap();

        let (_tx, controller) = h.controller("d-1");
        let handle = spawn(controller.with_lease("sched-a", Duration::from_secs(60)));
        h.wait_for("d-1", |d| d.status == DeploymentStatus::PausedForApproval)
            .await;
        h.shutdown_tx.send(true).unwrap();

        assert_eq!(finish(handle).await, ControllerExit::Shutdown);
        assert_eq!(h.lease(), None);
        assert_eq!(h.marker().as_deref(), Some("d-1"));
    }

    #[tokio::test]
    async fn reload_after_store_error_resumes_deployment() {
        let h = Harness::new();
        h.insert(&deployment("d-1", vec![approval(&[]), Stage::Cleanup]));

        let (tx, mut controller) = h.controller("d-1");
        let handle = tokio::spawn(async move {
            let first = controller.run().await;
            assert!(matches!(first, Err(ControllerError::State(_))), "{first:?}");
            controller.reload().unwrap();
            controller.run().await
        });
        h.wait_for("d-1", |d| d.status == DeploymentStatus::PausedForApproval)
            .await;

        h.store.fail_next_writes(1);
        assert_eq!(tx.approve(0, "ops").await, None);
        assert_eq!(tx.approve(0, "ops").await, Some(CommandOutcome::Applied));
        assert_eq!(
            finish(handle).await,
            ControllerExit::Finished(DeploymentStatus::Succeeded)
        );

        let statuses = h.reporter.deployment_statuses("d-1");
        let terminal = statuses.iter().filter(|s| s.is_terminal()).count();
        assert_eq!(terminal, 1);
        assert_eq!(h.marker(), None);
    }
}
