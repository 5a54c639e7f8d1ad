use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::coord::{CoordError, Coordinator, BROADCAST_PREFIX};

/// An operation requested of the executor that owns an alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Operation {
    Updating,
    Deleting,
    Commenting { history_id: String },
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Updating => f.write_str("updating"),
            Operation::Deleting => f.write_str("deleting"),
            Operation::Commenting { history_id } => write!(f, "commenting {}", history_id),
        }
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(' ') {
            None if s == "updating" => Ok(Operation::Updating),
            None if s == "deleting" => Ok(Operation::Deleting),
            Some(("commenting", history_id)) if !history_id.trim().is_empty() => Ok(Operation::Commenting {
                history_id: history_id.trim().to_string(),
            }),
            _ => Err(format!("unknown operation: {:?}", s)),
        }
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        op.to_string()
    }
}

impl TryFrom<String> for Operation {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Value stored under `al-broadcast/<alert_id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BroadcastMessage {
    pub alert_id: String,
    pub operation: Operation,
}

/// Publishes operations as short-lived keys every executor watches.
#[derive(Clone)]
pub struct AlertBroadcast {
    coord: Arc<dyn Coordinator>,
    ttl: Duration,
}

impl AlertBroadcast {
    pub fn new(coord: Arc<dyn Coordinator>, ttl: Duration) -> Self {
        Self { coord, ttl }
    }

    pub async fn broadcast(&self, alert_id: &str, operation: Operation) -> Result<(), CoordError> {
        let message = BroadcastMessage {
            alert_id: alert_id.to_string(),
            operation,
        };
        let value = serde_json::to_string(&message).unwrap_or_default();

        let lease = self.coord.grant(self.ttl).await?;
        self.coord
            .put(&format!("{}{}", BROADCAST_PREFIX, alert_id), &value, Some(lease))
            .await?;

        tracing::debug!("AlertBroadcast: {} -> {}", alert_id, message.operation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{MemoryCoordinator, WatchEvent};

    #[test]
    fn test_operation_wire_format() {
        assert_eq!("updating".parse::<Operation>(), Ok(Operation::Updating));
        assert_eq!("deleting".parse::<Operation>(), Ok(Operation::Deleting));
        assert_eq!(
            "commenting hs-7".parse::<Operation>(),
            Ok(Operation::Commenting {
                history_id: "hs-7".to_string()
            })
        );
        assert!("commenting".parse::<Operation>().is_err());
        assert!("commenting ".parse::<Operation>().is_err());
        assert!("running".parse::<Operation>().is_err());

        let msg: BroadcastMessage =
            serde_json::from_str(r#"{"AlertId":"al-1","Operation":"commenting hs-7"}"#).unwrap();
        assert_eq!(msg.alert_id, "al-1");
        assert_eq!(msg.operation.to_string(), "commenting hs-7");
    }

    #[tokio::test]
    async fn test_broadcast_puts_leased_key() {
        let coord = MemoryCoordinator::new();
        let mut events = coord.watch(BROADCAST_PREFIX).await.unwrap();
        let broadcast = AlertBroadcast::new(coord.clone(), Duration::from_secs(10));

        broadcast.broadcast("al-1", Operation::Deleting).await.unwrap();

        match events.recv().await {
            Some(WatchEvent::Put(kv)) => {
                assert_eq!(kv.key, "al-broadcast/al-1");
                let msg: BroadcastMessage = serde_json::from_str(&kv.value).unwrap();
                assert_eq!(msg.operation, Operation::Deleting);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
