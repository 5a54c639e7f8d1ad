use std::sync::Arc;
use std::time::Duration;

use super::{Executor, ExecutorError};
use crate::coord::{Coordinator, WatchEvent, BROADCAST_PREFIX};
use crate::dispatch::BroadcastMessage;

/// Watches operation broadcasts and applies those addressed to local runners.
pub struct BroadcastReceiver {
    executor: Arc<Executor>,
    coord: Arc<dyn Coordinator>,
    retry_delay: Duration,
}

impl BroadcastReceiver {
    pub fn new(executor: Arc<Executor>, coord: Arc<dyn Coordinator>, retry_delay: Duration) -> Self {
        Self {
            executor,
            coord,
            retry_delay,
        }
    }

    /// Runs until the task is dropped. A failed or closed watch is
    /// re-established after the retry delay.
    pub async fn run(&self) {
        loop {
            match self.coord.watch(BROADCAST_PREFIX).await {
                Ok(mut events) => {
                    tracing::info!("BroadcastReceiver: watching {}", BROADCAST_PREFIX);
                    while let Some(event) = events.recv().await {
                        if let WatchEvent::Put(kv) = event {
                            self.handle(&kv.value).await;
                        }
                    }
                    tracing::warn!("BroadcastReceiver: watch closed");
                }
                Err(e) => tracing::error!("BroadcastReceiver: watch failed: {}", e),
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    async fn handle(&self, raw: &str) {
        let message: BroadcastMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("BroadcastReceiver: ignoring malformed broadcast {:?}: {}", raw, e);
                return;
            }
        };

        match self.executor.process(&message.alert_id, &message.operation).await {
            Ok(()) => {}
            // Every executor sees every broadcast; most are for someone else.
            Err(ExecutorError::NotRunning(_)) => {}
            Err(e) => tracing::warn!(
                "BroadcastReceiver: {} on {} dropped: {}",
                message.operation,
                message.alert_id,
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryCoordinator;
    use crate::db::tests::sample_definition;
    use crate::db::{DbError, RunningStatus};
    use crate::dispatch::{AlertBroadcast, Operation};
    use crate::executor::tests::executor;

    #[tokio::test]
    async fn test_delete_broadcast_stops_runner() {
        let (_tmp, store, executor, _dirty) = executor("e1");
        let coord = MemoryCoordinator::new();
        let receiver = BroadcastReceiver::new(executor.clone(), coord.clone(), Duration::from_millis(10));
        let task = tokio::spawn(async move { receiver.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let alert_id = store.register_alert(&sample_definition()).unwrap();
        executor.start(&alert_id).unwrap();

        let broadcast = AlertBroadcast::new(coord.clone(), Duration::from_secs(10));
        coord.put("al-broadcast/junk", "{not json", None).await.unwrap();
        broadcast.broadcast("al-elsewhere", Operation::Updating).await.unwrap();

        store.set_running_status(&alert_id, RunningStatus::Deleting).unwrap();
        broadcast.broadcast(&alert_id, Operation::Deleting).await.unwrap();

        for _ in 0..50 {
            if executor.task_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(executor.task_count(), 0);
        assert!(matches!(store.get_alert(&alert_id), Err(DbError::NotFound)));
        task.abort();
    }
}
