//! Executor: hosts the alert runners of one worker process.
//!
//! Every operation re-validates ownership against the relational store before
//! touching the local runner map; the store is the source of truth.

mod alert_config;
mod alive;
mod broadcast_receiver;
mod evaluate;
mod health;
mod receiver;
mod runner;
mod status;

pub use alive::{AliveError, AliveReporter, ExecutorInfo};
pub use broadcast_receiver::BroadcastReceiver;
pub use health::HealthChecker;
pub use receiver::AlertReceiver;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::adapter::{MetricSource, Notifier};
use crate::config::Timings;
use crate::db::{DbError, Ownership, RunnerInfo, RunningStatus, Store};
use crate::dispatch::Operation;
use runner::{AlertRunner, RunnerContext, RunnerHandle, Signal};

/// Capacity of the status-dirty channel between runners and the health checker.
const DIRTY_BUFFER: usize = 1024;

/// Executor error types.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("alert {0} is already running here")]
    AlreadyRunning(String),
    #[error("alert {0} is not running here")]
    NotRunning(String),
    #[error("precondition failed for alert {0}: {1}")]
    PreconditionFailed(String, String),
    #[error("Store error: {0}")]
    Store(#[from] DbError),
}

pub struct Executor {
    name: String,
    store: Store,
    ctx: RunnerContext,
    runners: Mutex<HashMap<String, RunnerHandle>>,
}

impl Executor {
    /// Create an executor. The returned receiver carries the dirty signals
    /// runners raise; hand it to the [`HealthChecker`].
    pub fn new(
        name: &str,
        store: Store,
        metrics: Arc<dyn MetricSource>,
        notifier: Arc<dyn Notifier>,
        timings: &Timings,
    ) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (dirty, dirty_rx) = mpsc::channel(DIRTY_BUFFER);
        let ctx = RunnerContext {
            store: store.clone(),
            metrics,
            notifier,
            dirty,
            tick: timings.tick,
            metric_timeout: timings.metric_timeout,
        };

        let executor = Arc::new(Self {
            name: name.to_string(),
            store,
            ctx,
            runners: Mutex::new(HashMap::new()),
        });
        (executor, dirty_rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RunnerHandle>> {
        self.runners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle(&self, alert_id: &str) -> Result<RunnerHandle, ExecutorError> {
        self.lock()
            .get(alert_id)
            .cloned()
            .ok_or_else(|| ExecutorError::NotRunning(alert_id.to_string()))
    }

    fn precondition(alert_id: &str, e: DbError) -> ExecutorError {
        match e {
            DbError::PreconditionFailed(msg) => ExecutorError::PreconditionFailed(alert_id.to_string(), msg),
            other => ExecutorError::Store(other),
        }
    }

    pub fn task_count(&self) -> usize {
        self.lock().len()
    }

    pub fn alert_ids(&self) -> HashSet<String> {
        self.lock().keys().cloned().collect()
    }

    /// Snapshots of every local runner.
    pub fn runners(&self) -> Vec<RunnerInfo> {
        let handles: Vec<RunnerHandle> = self.lock().values().cloned().collect();
        handles.iter().map(RunnerHandle::snapshot).collect()
    }

    /// Claim an unassigned `adding` or `migrating` alert and start its runner.
    pub fn start(&self, alert_id: &str) -> Result<(), ExecutorError> {
        if self.lock().contains_key(alert_id) {
            return Err(ExecutorError::AlreadyRunning(alert_id.to_string()));
        }

        let alert = self.store.get_alert(alert_id)?;
        let claimable = matches!(alert.running_status, RunningStatus::Adding | RunningStatus::Migrating);
        if !claimable || !alert.executor_id.is_empty() {
            return Err(ExecutorError::PreconditionFailed(
                alert_id.to_string(),
                format!("{} on '{}' should not be dispatched", alert.running_status, alert.executor_id),
            ));
        }

        self.store
            .transition_alert(
                alert_id,
                Ownership::unassigned(alert.running_status),
                Ownership::new(RunningStatus::Running, &self.name),
            )
            .map_err(|e| Self::precondition(alert_id, e))?;

        let handle = AlertRunner::spawn(alert_id, alert.running_status, self.ctx.clone());
        self.lock().insert(alert_id.to_string(), handle);

        tracing::info!("Executor: started alert {} ({})", alert_id, alert.running_status);
        Ok(())
    }

    /// Delete a `deleting` alert owned here and stop its runner.
    pub async fn stop(&self, alert_id: &str) -> Result<(), ExecutorError> {
        self.handle(alert_id)?;

        let deleted = self
            .store
            .delete_alerts(&[alert_id.to_string()], RunningStatus::Deleting, Some(&self.name))?;
        if deleted == 0 {
            return Err(ExecutorError::PreconditionFailed(
                alert_id.to_string(),
                "not deleting on this executor".to_string(),
            ));
        }

        let handle = self.lock().remove(alert_id);
        if let Some(handle) = handle {
            handle.send(Signal::Stop).await;
        }

        tracing::info!("Executor: stopped and deleted alert {}", alert_id);
        Ok(())
    }

    /// Return an `updating` alert owned here to `running` and reload its runner.
    pub async fn update(&self, alert_id: &str) -> Result<(), ExecutorError> {
        let handle = self.handle(alert_id)?;

        self.store
            .transition_alert(
                alert_id,
                Ownership::new(RunningStatus::Updating, &self.name),
                Ownership::new(RunningStatus::Running, &self.name),
            )
            .map_err(|e| Self::precondition(alert_id, e))?;

        handle.send(Signal::Update).await;
        tracing::info!("Executor: updated alert {}", alert_id);
        Ok(())
    }

    /// Forward a comment to a `running` alert owned here.
    pub async fn comment(&self, alert_id: &str, history_id: &str) -> Result<(), ExecutorError> {
        let handle = self.handle(alert_id)?;

        let alert = self.store.get_alert(alert_id)?;
        if alert.running_status != RunningStatus::Running || alert.executor_id != self.name {
            return Err(ExecutorError::PreconditionFailed(
                alert_id.to_string(),
                format!("{} on '{}' cannot be commented", alert.running_status, alert.executor_id),
            ));
        }

        handle.send(Signal::Comment(history_id.to_string())).await;
        tracing::debug!("Executor: commented alert {} with {}", alert_id, history_id);
        Ok(())
    }

    /// Dispatch a broadcast operation.
    pub async fn process(&self, alert_id: &str, operation: &Operation) -> Result<(), ExecutorError> {
        match operation {
            Operation::Deleting => self.stop(alert_id).await,
            Operation::Updating => self.update(alert_id).await,
            Operation::Commenting { history_id } => self.comment(alert_id, history_id).await,
        }
    }

    /// Stop a runner locally without touching the store.
    pub async fn terminate(&self, alert_id: &str) -> bool {
        let handle = self.lock().remove(alert_id);
        match handle {
            Some(handle) => {
                handle.send(Signal::Stop).await;
                tracing::info!("Executor: terminated runner {}", alert_id);
                true
            }
            None => false,
        }
    }

    /// Stop every local runner without touching the store.
    pub async fn stop_all(&self) {
        let handles: Vec<RunnerHandle> = self.lock().drain().map(|(_, h)| h).collect();
        let count = handles.len();
        for handle in handles {
            handle.send(Signal::Stop).await;
        }
        tracing::info!("Executor: stopped {} runners", count);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::adapter::fake::{FakeMetricSource, FakeNotifier};
    use crate::db::tests::{sample_definition, temp_store};
    use crate::db::HistoryEvent;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    pub(crate) fn executor(name: &str) -> (NamedTempFile, Store, Arc<Executor>, mpsc::Receiver<()>) {
        let (tmp, store) = temp_store();
        let (executor, dirty_rx) = Executor::new(
            name,
            store.clone(),
            Arc::new(FakeMetricSource::default()),
            Arc::new(FakeNotifier::default()),
            &Timings::default(),
        );
        (tmp, store, executor, dirty_rx)
    }

    #[tokio::test]
    async fn test_start_claims_once() {
        let (_tmp, store, executor, _dirty) = executor("e1");
        let alert_id = store.register_alert(&sample_definition()).unwrap();

        executor.start(&alert_id).unwrap();
        let alert = store.get_alert(&alert_id).unwrap();
        assert_eq!(alert.running_status, RunningStatus::Running);
        assert_eq!(alert.executor_id, "e1");
        assert_eq!(executor.task_count(), 1);

        assert!(matches!(executor.start(&alert_id), Err(ExecutorError::AlreadyRunning(_))));

        // Another executor sharing the store cannot claim it.
        let (other, _rx) = Executor::new(
            "e2",
            store.clone(),
            Arc::new(FakeMetricSource::default()),
            Arc::new(FakeNotifier::default()),
            &Timings::default(),
        );
        assert!(matches!(other.start(&alert_id), Err(ExecutorError::PreconditionFailed(..))));
        assert_eq!(other.task_count(), 0);
        executor.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_requires_deleting() {
        let (_tmp, store, executor, _dirty) = executor("e1");
        let alert_id = store.register_alert(&sample_definition()).unwrap();
        executor.start(&alert_id).unwrap();

        assert!(matches!(executor.stop(&alert_id).await, Err(ExecutorError::PreconditionFailed(..))));
        assert_eq!(executor.task_count(), 1);

        store.set_running_status(&alert_id, RunningStatus::Deleting).unwrap();
        executor.stop(&alert_id).await.unwrap();
        assert_eq!(executor.task_count(), 0);
        assert!(matches!(store.get_alert(&alert_id), Err(DbError::NotFound)));

        assert!(matches!(executor.stop(&alert_id).await, Err(ExecutorError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_update_and_comment_guards() {
        let (_tmp, store, executor, _dirty) = executor("e1");
        let alert_id = store.register_alert(&sample_definition()).unwrap();
        executor.start(&alert_id).unwrap();

        assert!(matches!(executor.update(&alert_id).await, Err(ExecutorError::PreconditionFailed(..))));
        store.set_running_status(&alert_id, RunningStatus::Updating).unwrap();
        assert!(matches!(executor.comment(&alert_id, "hs-1").await, Err(ExecutorError::PreconditionFailed(..))));

        executor.update(&alert_id).await.unwrap();
        assert_eq!(store.get_alert(&alert_id).unwrap().running_status, RunningStatus::Running);

        executor.comment(&alert_id, "hs-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let histories = store.list_histories(&alert_id).unwrap();
        assert!(histories.iter().any(|h| h.event == HistoryEvent::Commented && h.content == "hs-1"));
        executor.stop_all().await;
    }

    #[tokio::test]
    async fn test_terminate_leaves_store_untouched() {
        let (_tmp, store, executor, _dirty) = executor("e1");
        let alert_id = store.register_alert(&sample_definition()).unwrap();
        executor.start(&alert_id).unwrap();

        assert!(executor.terminate(&alert_id).await);
        assert!(!executor.terminate(&alert_id).await);
        assert_eq!(executor.task_count(), 0);
        assert_eq!(store.get_alert(&alert_id).unwrap().executor_id, "e1");
    }
}
