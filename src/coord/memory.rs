//! In-process coordination backend.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;

use super::{CoordError, Coordinator, KeyValue, LeaseId, WatchEvent, WATCH_BUFFER};

const REAP_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Default)]
struct State {
    next_lease: LeaseId,
    leases: HashMap<LeaseId, Instant>,
    kv: BTreeMap<String, (String, Option<LeaseId>)>,
    queues: HashMap<String, VecDeque<String>>,
}

/// Coordination store living in this process. Valid only when every role
/// shares the process, as in standalone mode and tests.
pub struct MemoryCoordinator {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
    queued: Notify,
}

impl MemoryCoordinator {
    /// Create the store and start its lease reaper on the current runtime.
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let coord = Arc::new(Self {
            state: Mutex::new(State::default()),
            events,
            queued: Notify::new(),
        });

        tokio::spawn(run_reaper(Arc::downgrade(&coord)));
        coord
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop expired leases and the keys bound to them.
    fn reap(&self) {
        let now = Instant::now();
        let removed: Vec<String> = {
            let mut state = self.lock();
            let expired: Vec<LeaseId> = state
                .leases
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            if expired.is_empty() {
                return;
            }
            for id in &expired {
                state.leases.remove(id);
            }

            let keys: Vec<String> = state
                .kv
                .iter()
                .filter(|(_, (_, lease))| lease.map_or(false, |l| expired.contains(&l)))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &keys {
                state.kv.remove(key);
            }
            keys
        };

        for key in removed {
            tracing::debug!("MemoryCoordinator: lease expired for {}", key);
            let _ = self.events.send(WatchEvent::Delete { key });
        }
    }
}

async fn run_reaper(coord: Weak<MemoryCoordinator>) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        match coord.upgrade() {
            Some(coord) => coord.reap(),
            None => break,
        }
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, CoordError> {
        let mut state = self.lock();
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(id, Instant::now() + ttl);
        Ok(id)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), CoordError> {
        self.reap();
        {
            let mut state = self.lock();
            if let Some(id) = lease {
                if !state.leases.contains_key(&id) {
                    return Err(CoordError::LeaseNotFound(id));
                }
            }
            state.kv.insert(key.to_string(), (value.to_string(), lease));
        }

        let _ = self.events.send(WatchEvent::Put(KeyValue {
            key: key.to_string(),
            value: value.to_string(),
        }));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CoordError> {
        self.reap();
        Ok(self.lock().kv.get(key).map(|(v, _)| v.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>, CoordError> {
        self.reap();
        let state = self.lock();
        Ok(state
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, _))| KeyValue {
                key: k.clone(),
                value: v.clone(),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<bool, CoordError> {
        let removed = self.lock().kv.remove(key).is_some();
        if removed {
            let _ = self.events.send(WatchEvent::Delete { key: key.to_string() });
        }
        Ok(removed)
    }

    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, CoordError> {
        let mut events = self.events.subscribe();
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if !event.key().starts_with(&prefix) {
                            continue;
                        }
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("MemoryCoordinator: watch on {} dropped {} events, closing", prefix, n);
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }

    async fn enqueue(&self, topic: &str, value: &str) -> Result<(), CoordError> {
        self.lock()
            .queues
            .entry(topic.to_string())
            .or_default()
            .push_back(value.to_string());
        self.queued.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self, topic: &str) -> Result<String, CoordError> {
        loop {
            let notified = self.queued.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.lock().queues.get_mut(topic).and_then(|q| q.pop_front()) {
                return Ok(value);
            }

            notified.await;
        }
    }
}
