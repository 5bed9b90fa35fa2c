//! Commands routed to a running controller.
//!
//! Each controller owns the receiving end of a bounded channel. A command
//! carries a oneshot reply that is answered once the resulting state has
//! been committed.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// Capacity of a controller's command channel.
pub const COMMAND_BUFFER: usize = 16;

#[derive(Debug)]
pub enum ControlCommand {
    Approve {
        ordinal: u32,
        approver: String,
        reply: oneshot::Sender<CommandOutcome>,
    },
    Cancel {
        reply: oneshot::Sender<CommandOutcome>,
    },
}

/// Result of a command, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// The command changed the deployment.
    Applied,
    /// Duplicate or stale command; nothing changed.
    NoOp,
    /// The command is not valid for the deployment's current state.
    Rejected(String),
}

/// Sending half of a controller's command channel.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<ControlCommand>,
}

/// Create a command channel for one controller.
pub fn channel() -> (CommandSender, mpsc::Receiver<ControlCommand>) {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    (CommandSender { tx }, rx)
}

impl CommandSender {
    /// Returns `None` when the controller has already exited.
    pub async fn approve(&self, ordinal: u32, approver: &str) -> Option<CommandOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControlCommand::Approve {
                ordinal,
                approver: approver.to_string(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Returns `None` when the controller has already exited.
    pub async fn cancel(&self) -> Option<CommandOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ControlCommand::Cancel { reply }).await.ok()?;
        rx.await.ok()
    }
}
