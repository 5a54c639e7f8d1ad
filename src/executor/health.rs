//! Executor-side status persistence and ownership reconciliation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use super::Executor;
use crate::db::{DbError, RunningStatus, Store};

/// Writes runner snapshots back to the store and drops runners the store
/// no longer assigns to this executor.
///
/// Dirty signals only set a flag; the short flush timer writes when the flag
/// is set, and the long tick writes unconditionally before reconciling.
pub struct HealthChecker {
    executor: Arc<Executor>,
    store: Store,
    dirty: mpsc::Receiver<()>,
    flush_period: Duration,
    check_period: Duration,
}

impl HealthChecker {
    pub fn new(
        executor: Arc<Executor>,
        store: Store,
        dirty: mpsc::Receiver<()>,
        flush_period: Duration,
        check_period: Duration,
    ) -> Self {
        Self {
            executor,
            store,
            dirty,
            flush_period,
            check_period,
        }
    }

    pub async fn run(mut self) {
        let mut flush = tokio::time::interval_at(Instant::now() + self.flush_period, self.flush_period);
        flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut check = tokio::time::interval_at(Instant::now() + self.check_period, self.check_period);
        check.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut pending = false;
        let mut dirty_open = true;

        tracing::info!(
            "HealthChecker: flushing every {:?}, reconciling every {:?}",
            self.flush_period,
            self.check_period
        );

        loop {
            tokio::select! {
                signal = self.dirty.recv(), if dirty_open => {
                    match signal {
                        Some(()) => pending = true,
                        None => dirty_open = false,
                    }
                }
                _ = flush.tick() => {
                    if pending {
                        pending = false;
                        self.write_status();
                    }
                }
                _ = check.tick() => {
                    pending = false;
                    self.write_status();
                    if let Err(e) = self.reconcile().await {
                        tracing::error!("HealthChecker: reconcile failed: {}", e);
                    }
                }
            }
        }
    }

    /// Persist every local runner's status. Returns the rows written.
    pub fn write_status(&self) -> usize {
        let runners = self.executor.runners();
        match self.store.update_alert_status(&runners, self.executor.name()) {
            Ok(written) => {
                tracing::debug!("HealthChecker: wrote {} of {} runner statuses", written, runners.len());
                written
            }
            Err(e) => {
                tracing::error!("HealthChecker: status write failed: {}", e);
                0
            }
        }
    }

    /// Terminate local runners whose alert is not `running` here in the
    /// store. Returns the terminated ids.
    pub async fn reconcile(&self) -> Result<Vec<String>, DbError> {
        let owned: HashSet<String> = self
            .store
            .query_alerts(self.executor.name(), RunningStatus::Running)?
            .into_iter()
            .map(|a| a.alert_id)
            .collect();

        let mut wild: Vec<String> = self.executor.alert_ids().difference(&owned).cloned().collect();
        wild.sort();

        for alert_id in &wild {
            tracing::warn!("HealthChecker: terminating wild runner {}", alert_id);
            self.executor.terminate(alert_id).await;
        }
        Ok(wild)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::sample_definition;
    use crate::db::Ownership;
    use crate::executor::tests::executor;

    #[tokio::test]
    async fn test_reconcile_terminates_wild_runners() {
        let (_tmp, store, executor, dirty) = executor("e1");
        let kept = store.register_alert(&sample_definition()).unwrap();
        let lost = store.register_alert(&sample_definition()).unwrap();
        let pending = store.register_alert(&sample_definition()).unwrap();
        for alert_id in [&kept, &lost, &pending] {
            executor.start(alert_id).unwrap();
        }

        // The watcher took `lost` away while this executor kept running it.
        store
            .transition_alert(
                &lost,
                Ownership::new(RunningStatus::Running, "e1"),
                Ownership::unassigned(RunningStatus::Migrating),
            )
            .unwrap();
        // An update whose broadcast never arrived: only `running` rows count
        // as owned, so the runner goes and the row waits for the watcher sweep.
        store.set_running_status(&pending, RunningStatus::Updating).unwrap();

        let checker = HealthChecker::new(
            executor.clone(),
            store.clone(),
            dirty,
            Duration::from_secs(1),
            Duration::from_secs(30),
        );
        let mut expected = vec![lost.clone(), pending.clone()];
        expected.sort();
        assert_eq!(checker.reconcile().await.unwrap(), expected);
        assert_eq!(executor.alert_ids(), HashSet::from([kept.clone()]));
        assert_eq!(store.get_alert(&lost).unwrap().running_status, RunningStatus::Migrating);

        let row = store.get_alert(&pending).unwrap();
        assert_eq!(row.running_status, RunningStatus::Updating);
        assert_eq!(row.executor_id, "e1");

        assert!(checker.reconcile().await.unwrap().is_empty());
        executor.stop_all().await;
    }

    #[tokio::test]
    async fn test_write_status_skips_foreign_rows() {
        let (_tmp, store, executor, dirty) = executor("e1");
        let mine = store.register_alert(&sample_definition()).unwrap();
        let gone = store.register_alert(&sample_definition()).unwrap();
        executor.start(&mine).unwrap();
        executor.start(&gone).unwrap();
        store.set_running_status(&gone, RunningStatus::Deleting).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let checker = HealthChecker::new(
            executor.clone(),
            store.clone(),
            dirty,
            Duration::from_secs(1),
            Duration::from_secs(30),
        );
        assert_eq!(checker.write_status(), 1);
        assert!(store.get_alert(&mine).unwrap().alert_status.contains("\"version\""));
        assert!(store.get_alert(&gone).unwrap().alert_status.is_empty());
        executor.stop_all().await;
    }
}
