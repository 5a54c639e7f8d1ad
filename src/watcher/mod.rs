//! Executor membership and recovery of alerts whose owner went away.

mod health;

pub use health::HealthChecker;

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::coord::{CoordError, Coordinator, WatchEvent, EXECUTOR_PREFIX};
use crate::db::Store;
use crate::dispatch::AlertQueue;
use crate::executor::ExecutorInfo;

/// Tracks live executors through their registry keys and migrates the
/// alerts of any executor whose key disappears.
pub struct ExecutorWatcher {
    store: Store,
    queue: AlertQueue,
    coord: Arc<dyn Coordinator>,
    members: Mutex<BTreeMap<String, ExecutorInfo>>,
    retry_delay: Duration,
}

impl ExecutorWatcher {
    pub fn new(store: Store, queue: AlertQueue, coord: Arc<dyn Coordinator>, retry_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue,
            coord,
            members: Mutex::new(BTreeMap::new()),
            retry_delay,
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ExecutorInfo>> {
        self.members.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn member_count(&self) -> usize {
        self.lock().len()
    }

    pub fn members(&self) -> Vec<ExecutorInfo> {
        self.lock().values().cloned().collect()
    }

    fn name_of(key: &str) -> &str {
        key.strip_prefix(EXECUTOR_PREFIX).unwrap_or(key)
    }

    fn upsert(&self, key: &str, raw: &str) {
        let name = Self::name_of(key).to_string();
        let info = serde_json::from_str::<ExecutorInfo>(raw).unwrap_or_else(|e| {
            tracing::warn!("ExecutorWatcher: malformed registration for {}: {}", name, e);
            ExecutorInfo {
                name: name.clone(),
                task_count: 0,
            }
        });
        if self.lock().insert(name.clone(), info).is_none() {
            tracing::info!("ExecutorWatcher: executor {} joined", name);
        }
    }

    /// Replace the membership view with a full listing. Members missing
    /// from the listing left while no watch was open and are migrated.
    pub async fn init_executors(&self) -> Result<usize, CoordError> {
        let listed = self.coord.list(EXECUTOR_PREFIX).await?;
        let departed: Vec<String> = {
            let mut members = self.lock();
            let alive: HashSet<&str> = listed.iter().map(|kv| Self::name_of(&kv.key)).collect();
            let departed = members.keys().filter(|name| !alive.contains(name.as_str())).cloned().collect();
            members.clear();
            departed
        };
        for kv in &listed {
            self.upsert(&kv.key, &kv.value);
        }
        tracing::info!("ExecutorWatcher: {} executors alive", listed.len());

        for name in &departed {
            tracing::warn!("ExecutorWatcher: executor {} left while unwatched", name);
            self.migrate(name).await;
        }
        Ok(listed.len())
    }

    /// Move every alert running on `executor` back to the queue.
    /// Returns the number of alerts re-queued.
    pub async fn migrate(&self, executor: &str) -> usize {
        let alert_ids = match self.store.migrate_executor_alerts(executor) {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!("ExecutorWatcher: migrating alerts of {} failed: {}", executor, e);
                return 0;
            }
        };

        let mut queued = 0;
        for alert_id in &alert_ids {
            if self.queue.write_back(alert_id).await {
                queued += 1;
            }
        }
        tracing::info!(
            "ExecutorWatcher: migrated {} alerts of {} ({} queued)",
            alert_ids.len(),
            executor,
            queued
        );
        queued
    }

    async fn handle(&self, event: WatchEvent) {
        match event {
            WatchEvent::Put(kv) => self.upsert(&kv.key, &kv.value),
            WatchEvent::Delete { key } => {
                let name = Self::name_of(&key).to_string();
                self.lock().remove(&name);
                tracing::warn!("ExecutorWatcher: executor {} left", name);
                self.migrate(&name).await;
            }
        }
    }

    /// Runs until the task is dropped. The watch is opened before the full
    /// listing so no change between the two is missed.
    pub async fn run(&self) {
        loop {
            match self.coord.watch(EXECUTOR_PREFIX).await {
                Ok(mut events) => {
                    if let Err(e) = self.init_executors().await {
                        tracing::error!("ExecutorWatcher: listing executors failed: {}", e);
                    }
                    while let Some(event) = events.recv().await {
                        self.handle(event).await;
                    }
                    tracing::warn!("ExecutorWatcher: watch closed");
                }
                Err(e) => tracing::error!("ExecutorWatcher: watch failed: {}", e),
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryCoordinator;
    use crate::db::tests::{sample_definition, temp_store};
    use crate::db::{Ownership, RunningStatus};

    #[tokio::test]
    async fn test_departed_executor_alerts_are_requeued() {
        let (_tmp, store) = temp_store();
        let coord = MemoryCoordinator::new();
        let queue = AlertQueue::new(coord.clone(), "al-job", 1);
        let watcher = ExecutorWatcher::new(store.clone(), queue, coord.clone(), Duration::from_millis(10));

        let mut owned = Vec::new();
        for _ in 0..2 {
            let alert_id = store.register_alert(&sample_definition()).unwrap();
            store
                .transition_alert(
                    &alert_id,
                    Ownership::unassigned(RunningStatus::Adding),
                    Ownership::new(RunningStatus::Running, "e1"),
                )
                .unwrap();
            owned.push(alert_id);
        }
        let elsewhere = store.register_alert(&sample_definition()).unwrap();
        store
            .transition_alert(
                &elsewhere,
                Ownership::unassigned(RunningStatus::Adding),
                Ownership::new(RunningStatus::Running, "e2"),
            )
            .unwrap();

        coord
            .put("alert-executors/e1", r#"{"Name":"e1","TaskCount":2}"#, None)
            .await
            .unwrap();
        let running = watcher.clone();
        let task = tokio::spawn(async move { running.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        coord
            .put("alert-executors/e2", r#"{"Name":"e2","TaskCount":1}"#, None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(watcher.member_count(), 2);

        coord.delete("alert-executors/e1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(watcher.members(), vec![ExecutorInfo { name: "e2".to_string(), task_count: 1 }]);

        for alert_id in &owned {
            let alert = store.get_alert(alert_id).unwrap();
            assert_eq!(alert.running_status, RunningStatus::Migrating);
            assert!(alert.executor_id.is_empty());
        }
        assert_eq!(store.get_alert(&elsewhere).unwrap().executor_id, "e2");

        let mut requeued = vec![coord.dequeue("al-job-0").await.unwrap(), coord.dequeue("al-job-0").await.unwrap()];
        requeued.sort();
        owned.sort();
        assert_eq!(requeued, owned);
        task.abort();
    }

    #[tokio::test]
    async fn test_init_executors_replaces_view() {
        let (_tmp, store) = temp_store();
        let coord = MemoryCoordinator::new();
        let queue = AlertQueue::new(coord.clone(), "al-job", 1);
        let watcher = ExecutorWatcher::new(store, queue, coord.clone(), Duration::from_millis(10));

        coord.put("alert-executors/e1", "garbage", None).await.unwrap();
        assert_eq!(watcher.init_executors().await.unwrap(), 1);
        assert_eq!(watcher.members()[0].name, "e1");

        coord.delete("alert-executors/e1").await.unwrap();
        assert_eq!(watcher.init_executors().await.unwrap(), 0);
        assert_eq!(watcher.member_count(), 0);
    }

    #[tokio::test]
    async fn test_relist_migrates_executors_gone_unseen() {
        let (_tmp, store) = temp_store();
        let coord = MemoryCoordinator::new();
        let queue = AlertQueue::new(coord.clone(), "al-job", 1);
        let watcher = ExecutorWatcher::new(store.clone(), queue, coord.clone(), Duration::from_millis(10));

        let alert_id = store.register_alert(&sample_definition()).unwrap();
        store
            .transition_alert(
                &alert_id,
                Ownership::unassigned(RunningStatus::Adding),
                Ownership::new(RunningStatus::Running, "e1"),
            )
            .unwrap();
        coord
            .put("alert-executors/e1", r#"{"Name":"e1","TaskCount":1}"#, None)
            .await
            .unwrap();
        watcher.init_executors().await.unwrap();

        // The delete event is never handled; only the next listing sees it.
        coord.delete("alert-executors/e1").await.unwrap();
        assert_eq!(watcher.init_executors().await.unwrap(), 0);

        let alert = store.get_alert(&alert_id).unwrap();
        assert_eq!(alert.running_status, RunningStatus::Migrating);
        assert!(alert.executor_id.is_empty());
        assert_eq!(coord.dequeue("al-job-0").await.unwrap(), alert_id);
    }
}
