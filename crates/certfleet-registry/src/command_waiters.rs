//! In-flight command tracker
//!
//! Routes command results arriving on the push channel back to the callers
//! blocked on them.

use certfleet_proto::CommandResult;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Tracks commands whose callers are waiting for a result
#[derive(Clone)]
pub struct CommandWaiters {
    /// Maps command id -> oneshot sender for the result
    waiters: Arc<DashMap<Uuid, oneshot::Sender<CommandResult>>>,
}

impl CommandWaiters {
    pub fn new() -> Self {
        Self {
            waiters: Arc::new(DashMap::new()),
        }
    }

    /// Register a caller waiting for a command result
    /// Returns a receiver that resolves when the result arrives
    pub fn register(&self, command_id: Uuid) -> oneshot::Receiver<CommandResult> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(command_id, tx);
        debug!("Registered waiter for command {}", command_id);
        rx
    }

    /// Deliver a result to the waiting caller
    /// Returns true if delivered, false if nobody was waiting
    pub fn fulfill(&self, command_id: Uuid, result: CommandResult) -> bool {
        if let Some((_, tx)) = self.waiters.remove(&command_id) {
            debug!("Routing result for command {}", command_id);
            if tx.send(result).is_err() {
                warn!(
                    "Failed to deliver result for command {} - waiter dropped",
                    command_id
                );
                return false;
            }
            return true;
        }
        debug!("No waiter for command {}", command_id);
        false
    }

    /// Drop a waiter (e.g., on timeout or dispatch failure)
    pub fn cancel(&self, command_id: Uuid) {
        if self.waiters.remove(&command_id).is_some() {
            debug!("Cancelled waiter for command {}", command_id);
        }
    }

    /// Number of callers currently waiting
    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }
}

impl Default for CommandWaiters {
    fn default() -> Self {
        Self::new()
    }
}
