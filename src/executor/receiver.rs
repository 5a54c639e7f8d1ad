//! Pulls alert ids from the queue shards and starts them.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::Executor;
use crate::dispatch::AlertQueue;

/// Capacity of the channel between shard consumers and workers.
const DISPATCH_BUFFER: usize = 1000;

pub struct AlertReceiver {
    executor: Arc<Executor>,
    queue: AlertQueue,
    workers: usize,
    retry_delay: Duration,
}

impl AlertReceiver {
    pub fn new(executor: Arc<Executor>, queue: AlertQueue, workers: usize, retry_delay: Duration) -> Self {
        Self {
            executor,
            queue,
            workers: workers.max(1),
            retry_delay,
        }
    }

    /// Spawn one consumer per shard and the worker pool.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let (tx, rx) = mpsc::channel::<String>(DISPATCH_BUFFER);
        let mut tasks = Vec::with_capacity(self.queue.topics().len() + self.workers);

        for topic in self.queue.topics() {
            tasks.push(tokio::spawn(consume(
                self.queue.clone(),
                topic.clone(),
                tx.clone(),
                self.retry_delay,
            )));
        }

        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..self.workers {
            tasks.push(tokio::spawn(work(worker, self.executor.clone(), rx.clone())));
        }

        tracing::info!(
            "AlertReceiver: consuming {} shards with {} workers",
            self.queue.topics().len(),
            self.workers
        );
        tasks
    }
}

async fn consume(queue: AlertQueue, topic: String, tx: mpsc::Sender<String>, retry_delay: Duration) {
    let coord = queue.coordinator().clone();
    loop {
        match coord.dequeue(&topic).await {
            Ok(alert_id) => {
                tracing::debug!("AlertReceiver: received {} from {}", alert_id, topic);
                if tx.send(alert_id).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::error!("AlertReceiver: dequeue from {} failed: {}", topic, e);
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

async fn work(worker: usize, executor: Arc<Executor>, rx: Arc<Mutex<mpsc::Receiver<String>>>) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(alert_id) = next else { return };

        if let Err(e) = executor.start(&alert_id) {
            tracing::warn!("AlertReceiver[{}]: dropping {}: {}", worker, alert_id, e);
        }
    }
}
