//! Reporter sinks for committed state transitions.
//!
//! Reporting happens after the state store commit and is fire-and-forget:
//! a reporter must never block, and a dropped event never rolls back a
//! committed transition.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::types::{Transition, TransitionEvent};

/// Receives the append-only stream of transition events.
pub trait Reporter: Send + Sync {
    fn report(&self, event: &TransitionEvent);
}

/// Logs every transition through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, event: &TransitionEvent) {
        match event.transition {
            Transition::Deployment { from, to } => info!(
                deployment = %event.deployment_id,
                application = %event.application_id,
                %from,
                %to,
                "deployment transition"
            ),
            Transition::Stage { ordinal, from, to } => debug!(
                deployment = %event.deployment_id,
                ordinal,
                ?from,
                ?to,
                "stage transition"
            ),
        }
    }
}

/// Forwards events into a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::Sender<TransitionEvent>,
}

impl ChannelReporter {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TransitionEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl Reporter for ChannelReporter {
    fn report(&self, event: &TransitionEvent) {
        if let Err(e) = self.tx.try_send(event.clone()) {
            debug!(deployment = %event.deployment_id, error = %e, "transition event dropped");
        }
    }
}

/// Sends every event to each inner reporter.
#[derive(Clone, Default)]
pub struct FanoutReporter {
    sinks: Vec<Arc<dyn Reporter>>,
}

impl FanoutReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn Reporter>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl Reporter for FanoutReporter {
    fn report(&self, event: &TransitionEvent) {
        for sink in &self.sinks {
            sink.report(event);
        }
    }
}
