use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::coord::{CoordError, Coordinator};

/// Deadline for re-queueing one alert during recovery.
const WRITE_BACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Alert ids waiting for an executor, spread over `<prefix>-<i>` shards.
#[derive(Clone)]
pub struct AlertQueue {
    coord: Arc<dyn Coordinator>,
    topics: Vec<String>,
}

impl AlertQueue {
    pub fn new(coord: Arc<dyn Coordinator>, prefix: &str, shards: usize) -> Self {
        let topics = (0..shards.max(1)).map(|i| format!("{}-{}", prefix, i)).collect();
        Self { coord, topics }
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.coord
    }

    /// Push an alert id onto a shard chosen uniformly at random.
    pub async fn enqueue(&self, alert_id: &str) -> Result<(), CoordError> {
        let shard = rand::thread_rng().gen_range(0..self.topics.len());
        self.coord.enqueue(&self.topics[shard], alert_id).await?;
        tracing::debug!("AlertQueue: {} -> {}", alert_id, self.topics[shard]);
        Ok(())
    }

    /// Re-queue an alert that lost its owner. Failures are logged; the
    /// watcher sweep picks the alert up again later.
    pub async fn write_back(&self, alert_id: &str) -> bool {
        match tokio::time::timeout(WRITE_BACK_TIMEOUT, self.enqueue(alert_id)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!("AlertQueue: write back of {} failed: {}", alert_id, e);
                false
            }
            Err(_) => {
                tracing::error!("AlertQueue: write back of {} timed out", alert_id);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryCoordinator;

    #[tokio::test]
    async fn test_enqueue_lands_on_a_shard() {
        let coord = MemoryCoordinator::new();
        let queue = AlertQueue::new(coord.clone(), "al-job", 3);
        assert_eq!(queue.topics(), ["al-job-0", "al-job-1", "al-job-2"]);

        queue.enqueue("al-1").await.unwrap();
        assert!(queue.write_back("al-2").await);

        let mut seen = Vec::new();
        for topic in queue.topics() {
            while let Ok(Ok(id)) = tokio::time::timeout(Duration::from_millis(20), coord.dequeue(topic)).await {
                seen.push(id);
            }
        }
        seen.sort();
        assert_eq!(seen, vec!["al-1", "al-2"]);
    }
}
