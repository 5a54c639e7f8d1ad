//! Manager-side entry points that move alerts through their lifecycle.

use thiserror::Error;

use super::{AlertBroadcast, AlertQueue, Operation};
use crate::coord::CoordError;
use crate::db::{AlertDefinition, Comment, DbError, RunningStatus, Store};

/// Dispatch error types.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Store error: {0}")]
    Store(#[from] DbError),
    #[error("Coordination error: {0}")]
    Coord(#[from] CoordError),
    #[error("alert {0} is {1} and cannot be {2}")]
    InvalidState(String, RunningStatus, &'static str),
    #[error("{0} is required")]
    MissingField(&'static str),
}

/// Registers alerts and requests changes from their owners.
///
/// Every request lands in the store first; the queue and broadcast only
/// nudge executors, and the watcher sweep recovers anything they miss.
#[derive(Clone)]
pub struct AlertDispatcher {
    store: Store,
    queue: AlertQueue,
    broadcast: AlertBroadcast,
}

impl AlertDispatcher {
    pub fn new(store: Store, queue: AlertQueue, broadcast: AlertBroadcast) -> Self {
        Self { store, queue, broadcast }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Register a new alert as `adding` and hand it to the queue.
    pub async fn create_alert(&self, definition: &AlertDefinition) -> Result<String, DispatchError> {
        let alert_id = self.store.register_alert(definition)?;
        self.queue.enqueue(&alert_id).await?;
        tracing::info!("AlertDispatcher: created alert {} ({})", alert_id, definition.alert_name);
        Ok(alert_id)
    }

    /// Ask the owner to reload the alert's configuration.
    pub async fn request_update(&self, alert_id: &str) -> Result<(), DispatchError> {
        self.mark(alert_id, RunningStatus::Updating, "updated")?;
        self.broadcast.broadcast(alert_id, Operation::Updating).await?;
        tracing::info!("AlertDispatcher: requested update of {}", alert_id);
        Ok(())
    }

    /// Ask the owner to delete the alert.
    pub async fn request_delete(&self, alert_id: &str) -> Result<(), DispatchError> {
        self.mark(alert_id, RunningStatus::Deleting, "deleted")?;
        self.broadcast.broadcast(alert_id, Operation::Deleting).await?;
        tracing::info!("AlertDispatcher: requested delete of {}", alert_id);
        Ok(())
    }

    /// Store a comment on `history_id` and tell the owning runner about it.
    /// Returns the owning alert id with the stored comment.
    pub async fn request_comment(
        &self,
        history_id: &str,
        addresser: &str,
        content: &str,
    ) -> Result<(String, Comment), DispatchError> {
        if addresser.trim().is_empty() {
            return Err(DispatchError::MissingField("addresser"));
        }
        if content.trim().is_empty() {
            return Err(DispatchError::MissingField("content"));
        }

        let history = self.store.get_history(history_id)?;
        let alert = self.store.get_alert(&history.alert_id)?;
        if alert.running_status != RunningStatus::Running {
            return Err(DispatchError::InvalidState(alert.alert_id, alert.running_status, "commented"));
        }

        let comment = Comment::new(addresser, content, history_id);
        self.store.create_comment(&comment)?;

        self.broadcast
            .broadcast(
                &alert.alert_id,
                Operation::Commenting {
                    history_id: history_id.to_string(),
                },
            )
            .await?;
        tracing::info!("AlertDispatcher: comment {} on {} of {}", comment.comment_id, history_id, alert.alert_id);
        Ok((alert.alert_id, comment))
    }

    /// Only alerts that exist and are not already on their way out can be
    /// marked; a pending delete is never downgraded to an update.
    fn mark(&self, alert_id: &str, status: RunningStatus, verb: &'static str) -> Result<(), DispatchError> {
        let alert = self.store.get_alert(alert_id)?;
        if alert.running_status == RunningStatus::Deleting {
            return Err(DispatchError::InvalidState(alert.alert_id, alert.running_status, verb));
        }
        self.store.set_running_status(alert_id, status)?;
        Ok(())
    }
}
