//! Per-application evaluation task.

use std::time::Duration;

use rudder_core::{ApplicationId, DeploymentId, Revision};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tracing::{debug, error, info};

use crate::error::SchedulerResult;
use crate::scheduler::{Scheduler, TriggerOutcome};

/// Events delivered to an application's task.
#[derive(Debug)]
pub(crate) enum AppEvent {
    /// The application record changed or a sync was requested.
    ConfigChanged,
    /// A controller of this application reached a terminal status.
    DeploymentFinished(DeploymentId),
    /// Manual trigger, answered on `reply`.
    Trigger {
        revision: Option<Revision>,
        reply: oneshot::Sender<SchedulerResult<TriggerOutcome>>,
    },
}

/// What started an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reason {
    Poll,
    Drift,
    ConfigChanged,
    DeploymentFinished,
}

/// Evaluate `application_id` on every poll tick, drift tick and event
/// until `stop` fires or the event channel closes.
///
/// The first poll tick fires immediately. Drift ticks start one drift
/// interval after the loop starts.
pub(crate) async fn run(
    scheduler: Scheduler,
    application_id: ApplicationId,
    mut events: mpsc::Receiver<AppEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let poll_every = Duration::from_secs(scheduler.config.poll_interval_secs.max(1));
    let drift_every = Duration::from_secs(scheduler.config.drift_interval_secs.max(1));

    let mut poll = interval(poll_every);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut drift = interval_at(Instant::now() + drift_every, drift_every);
    drift.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(application = %application_id, "evaluation loop started");

    loop {
        let reason = tokio::select! {
            _ = poll.tick() => Reason::Poll,
            _ = drift.tick() => Reason::Drift,
            event = events.recv() => match event {
                Some(AppEvent::ConfigChanged) => Reason::ConfigChanged,
                Some(AppEvent::DeploymentFinished(deployment)) => {
                    debug!(application = %application_id, %deployment, "deployment finished");
                    Reason::DeploymentFinished
                }
                Some(AppEvent::Trigger { revision, reply }) => {
                    let result = scheduler.trigger(&application_id, revision).await;
                    if let Err(e) = &result {
                        error!(application = %application_id, error = %e, "manual trigger failed");
                    }
                    let _ = reply.send(result);
                    continue;
                }
                None => break,
            },
            _ = stop.changed() => break,
        };

        if let Err(e) = scheduler.evaluate(&application_id, reason).await {
            error!(application = %application_id, ?reason, error = %e, "evaluation failed");
        }
    }

    debug!(application = %application_id, "evaluation loop stopped");
}
