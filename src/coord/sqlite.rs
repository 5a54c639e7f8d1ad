//! Coordination backend on tables of the shared SQLite file.
//!
//! Every process opening the same file sees the same leases, keys and queue
//! topics. Watches and dequeues poll; expired leases are reaped by whichever
//! process touches the store first.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

use super::{CoordError, Coordinator, KeyValue, LeaseId, WatchEvent, WATCH_BUFFER};
use crate::db::open_connection;

/// Events older than this are pruned; watchers poll far more often.
const EVENT_RETENTION_MS: i64 = 60_000;

#[derive(Clone)]
pub struct SqliteCoordinator {
    conn: Arc<Mutex<Connection>>,
    poll: Duration,
}

impl SqliteCoordinator {
    pub fn new<P: AsRef<Path>>(path: P, poll: Duration) -> Result<Self, CoordError> {
        let conn = open_connection(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            poll,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_dequeue(&self, topic: &str) -> Result<Option<String>, CoordError> {
        let conn = self.lock();
        let value = conn
            .query_row(
                "DELETE FROM coord_queue
                 WHERE id = (SELECT id FROM coord_queue WHERE topic = ?1 ORDER BY id LIMIT 1)
                 RETURNING value",
                params![topic],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn poll_events(&self, prefix: &str, after: i64) -> Result<Vec<(i64, WatchEvent)>, CoordError> {
        let conn = self.lock();
        reap(&conn)?;

        let mut stmt = conn.prepare(
            "SELECT revision, key, value, kind FROM coord_event
             WHERE revision > ?1 AND substr(key, 1, ?2) = ?3
             ORDER BY revision",
        )?;
        let events = stmt
            .query_map(params![after, prefix.len() as i64, prefix], |row| {
                let revision: i64 = row.get(0)?;
                let key: String = row.get(1)?;
                let value: String = row.get(2)?;
                let kind: String = row.get(3)?;
                let event = if kind == "delete" {
                    WatchEvent::Delete { key }
                } else {
                    WatchEvent::Put(KeyValue { key, value })
                };
                Ok((revision, event))
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(events)
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn record_event(conn: &Connection, key: &str, value: &str, kind: &str) -> SqlResult<()> {
    conn.execute(
        "INSERT INTO coord_event (key, value, kind, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![key, value, kind, now_ms()],
    )?;
    Ok(())
}

/// Remove expired leases with their keys, recording a delete event per key.
fn reap(conn: &Connection) -> SqlResult<()> {
    let now = now_ms();
    let tx = conn.unchecked_transaction()?;

    let expired_keys = {
        let mut stmt = tx.prepare(
            "SELECT key FROM coord_kv
             WHERE lease_id IN (SELECT lease_id FROM coord_lease WHERE expires_at <= ?1)",
        )?;
        let keys = stmt
            .query_map(params![now], |row| row.get::<_, String>(0))?
            .collect::<SqlResult<Vec<_>>>()?;
        keys
    };

    for key in &expired_keys {
        tx.execute("DELETE FROM coord_kv WHERE key = ?1", params![key])?;
        record_event(&tx, key, "", "delete")?;
    }
    tx.execute("DELETE FROM coord_lease WHERE expires_at <= ?1", params![now])?;
    tx.execute(
        "DELETE FROM coord_event WHERE created_at < ?1",
        params![now - EVENT_RETENTION_MS],
    )?;

    tx.commit()
}

#[async_trait]
impl Coordinator for SqliteCoordinator {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, CoordError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO coord_lease (expires_at) VALUES (?1)",
            params![now_ms() + ttl.as_millis() as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), CoordError> {
        let conn = self.lock();
        reap(&conn)?;
        let tx = conn.unchecked_transaction()?;

        if let Some(id) = lease {
            let alive: Option<i64> = tx
                .query_row(
                    "SELECT lease_id FROM coord_lease WHERE lease_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            if alive.is_none() {
                return Err(CoordError::LeaseNotFound(id));
            }
        }

        tx.execute(
            "INSERT INTO coord_kv (key, value, lease_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, lease_id = excluded.lease_id",
            params![key, value, lease],
        )?;
        record_event(&tx, key, value, "put")?;
        tx.commit()?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CoordError> {
        let conn = self.lock();
        reap(&conn)?;
        let value = conn
            .query_row(
                "SELECT value FROM coord_kv WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>, CoordError> {
        let conn = self.lock();
        reap(&conn)?;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM coord_kv WHERE substr(key, 1, ?1) = ?2 ORDER BY key",
        )?;
        let kvs = stmt
            .query_map(params![prefix.len() as i64, prefix], |row| {
                Ok(KeyValue {
                    key: row.get(0)?,
                    value: row.get(1)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(kvs)
    }

    async fn delete(&self, key: &str) -> Result<bool, CoordError> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        let rows = tx.execute("DELETE FROM coord_kv WHERE key = ?1", params![key])?;
        if rows > 0 {
            record_event(&tx, key, "", "delete")?;
        }
        tx.commit()?;
        Ok(rows > 0)
    }

    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, CoordError> {
        let start: i64 = {
            let conn = self.lock();
            conn.query_row("SELECT COALESCE(MAX(revision), 0) FROM coord_event", [], |row| row.get(0))?
        };

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let coord = self.clone();
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            let mut revision = start;
            let mut interval = tokio::time::interval(coord.poll);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                if tx.is_closed() {
                    break;
                }

                let events = match coord.poll_events(&prefix, revision) {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::error!("SqliteCoordinator: watch on {} failed: {}", prefix, e);
                        continue;
                    }
                };

                for (rev, event) in events {
                    revision = rev;
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn enqueue(&self, topic: &str, value: &str) -> Result<(), CoordError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO coord_queue (topic, value) VALUES (?1, ?2)",
            params![topic, value],
        )?;
        Ok(())
    }

    async fn dequeue(&self, topic: &str) -> Result<String, CoordError> {
        loop {
            if let Some(value) = self.try_dequeue(topic)? {
                return Ok(value);
            }
            tokio::time::sleep(self.poll).await;
        }
    }
}
