//! Executor registration and heartbeat.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};

use super::Executor;
use crate::coord::{CoordError, Coordinator, EXECUTOR_PREFIX};

/// Value stored under `alert-executors/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutorInfo {
    pub name: String,
    pub task_count: usize,
}

#[derive(Error, Debug)]
pub enum AliveError {
    /// Our registration vanished; another process may hold the name.
    #[error("executor {0} is no longer registered")]
    Evicted(String),
    #[error("executor {0} is already registered")]
    Duplicate(String),
    #[error("Coordination error: {0}")]
    Coord(#[from] CoordError),
}

pub struct AliveReporter {
    executor: Arc<Executor>,
    coord: Arc<dyn Coordinator>,
    lease_ttl: Duration,
    period: Duration,
}

impl AliveReporter {
    pub fn new(executor: Arc<Executor>, coord: Arc<dyn Coordinator>, lease_ttl: Duration, period: Duration) -> Self {
        Self {
            executor,
            coord,
            lease_ttl,
            period,
        }
    }

    fn key(&self) -> String {
        format!("{}{}", EXECUTOR_PREFIX, self.executor.name())
    }

    fn info(&self) -> String {
        let info = ExecutorInfo {
            name: self.executor.name().to_string(),
            task_count: self.executor.task_count(),
        };
        serde_json::to_string(&info).unwrap_or_default()
    }

    pub async fn check_exist(&self) -> Result<bool, AliveError> {
        Ok(self.coord.get(&self.key()).await?.is_some())
    }

    async fn register(&self) -> Result<(), AliveError> {
        let lease = self.coord.grant(self.lease_ttl).await?;
        self.coord.put(&self.key(), &self.info(), Some(lease)).await?;
        Ok(())
    }

    /// First registration. Fails when the name is already taken.
    pub async fn heart_boot(&self) -> Result<(), AliveError> {
        if self.check_exist().await? {
            return Err(AliveError::Duplicate(self.executor.name().to_string()));
        }
        self.register().await?;
        tracing::info!("AliveReporter: registered {}", self.key());
        Ok(())
    }

    /// Refresh the registration forever. Returns only on eviction; transient
    /// coordination errors are logged and retried on the next beat.
    pub async fn heartbeat(&self) -> AliveError {
        let mut interval = tokio::time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            match self.check_exist().await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::error!("AliveReporter: {} evicted", self.key());
                    return AliveError::Evicted(self.executor.name().to_string());
                }
                Err(e) => {
                    tracing::error!("AliveReporter: existence check failed: {}", e);
                    continue;
                }
            }

            match self.register().await {
                Ok(()) => tracing::debug!(
                    "AliveReporter: heartbeat {} ({} tasks)",
                    self.key(),
                    self.executor.task_count()
                ),
                Err(e) => tracing::error!("AliveReporter: heartbeat failed: {}", e),
            }
        }
    }
}
