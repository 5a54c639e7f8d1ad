use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

use super::ExecutorWatcher;
use crate::db::{DbError, RunningStatus, Store};
use crate::dispatch::AlertQueue;

/// Periodic sweep that unsticks alerts whose lifecycle state has not moved
/// within the timeout.
pub struct HealthChecker {
    store: Store,
    queue: AlertQueue,
    watcher: Arc<ExecutorWatcher>,
    period: Duration,
    stuck_timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        store: Store,
        queue: AlertQueue,
        watcher: Arc<ExecutorWatcher>,
        period: Duration,
        stuck_timeout: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            watcher,
            period,
            stuck_timeout,
        }
    }

    pub async fn run(&self) {
        let mut interval = tokio::time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            for status in RunningStatus::ALL {
                if let Err(e) = self.sweep(status).await {
                    tracing::error!("WatcherHealth: sweeping {} alerts failed: {}", status, e);
                }
            }
        }
    }

    /// Recover every alert stuck in `status`. Returns how many were acted on.
    pub async fn sweep(&self, status: RunningStatus) -> Result<usize, DbError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.stuck_timeout).unwrap_or_else(|_| chrono::Duration::zero());
        let stuck = self.store.get_timeout_alerts(status, cutoff)?;
        if stuck.is_empty() {
            return Ok(0);
        }

        if status == RunningStatus::Deleting {
            let ids: Vec<String> = stuck.into_iter().map(|a| a.alert_id).collect();
            let deleted = self.store.delete_alerts(&ids, RunningStatus::Deleting, None)?;
            tracing::info!("WatcherHealth: deleted {} stuck alerts", deleted);
            return Ok(deleted);
        }

        let (next, stale_before) = match status {
            // Only rows still stale; a runner may have written since the query.
            RunningStatus::Running => (RunningStatus::Migrating, Some(cutoff)),
            RunningStatus::Adding | RunningStatus::Updating => (RunningStatus::Adding, None),
            RunningStatus::Migrating => (RunningStatus::Migrating, None),
            RunningStatus::Deleting => return Ok(0),
        };

        let mut recovered = 0;
        for alert in stuck {
            let rows = match self.store.reset_alert(&alert.alert_id, status, next, stale_before) {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::error!("WatcherHealth: resetting {} failed: {}", alert.alert_id, e);
                    continue;
                }
            };
            if rows == 0 {
                continue;
            }
            recovered += 1;

            if self.watcher.member_count() == 0 {
                tracing::debug!("WatcherHealth: no executors alive, {} stays {}", alert.alert_id, next);
                continue;
            }
            self.queue.write_back(&alert.alert_id).await;
        }

        if recovered > 0 {
            tracing::info!("WatcherHealth: recovered {} alerts stuck in {}", recovered, status);
        }
        Ok(recovered)
    }
}
