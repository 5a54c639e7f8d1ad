//! Persisted evaluation state of one alert.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::adapter::TimeValue;

/// Level of a resource that is not alerting.
pub const CLEARED: &str = "cleared";

/// Bumped whenever the persisted layout changes; older blobs reset to empty.
pub const STATUS_VERSION: u32 = 1;

/// Samples of one resource as seen by a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedMetric {
    pub rule_name: String,
    pub resource_name: String,
    pub values: Vec<TimeValue>,
}

impl RecordedMetric {
    pub fn last(&self) -> Option<&TimeValue> {
        self.values.last()
    }
}

/// Triggers accumulated since the episode started.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedAlerts {
    pub cumulated_count: u32,
    pub first_alert_time: String,
    pub last_alert_time: String,
    pub last_alert_values: Vec<RecordedMetric>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResource {
    /// Severity label, or [`CLEARED`].
    pub current_level: String,
    pub positive_count: u32,
    pub cumulated_send_count: u32,
    /// Minutes.
    pub next_resend_interval: u32,
    pub next_sendable_time: DateTime<Utc>,
    #[serde(default)]
    pub aggregated_alerts: AggregatedAlerts,
}

impl StatusResource {
    pub fn cleared(next_resend_interval: u32, now: DateTime<Utc>) -> Self {
        Self {
            current_level: CLEARED.to_string(),
            positive_count: 0,
            cumulated_send_count: 0,
            next_resend_interval,
            next_sendable_time: now,
            aggregated_alerts: AggregatedAlerts::default(),
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.current_level == CLEARED
    }
}

/// Identifies one resource under one rule. Persisted as `"<rule_id> <resource>"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct StatusKey {
    pub rule_id: String,
    pub resource_name: String,
}

impl StatusKey {
    pub fn new(rule_id: &str, resource_name: &str) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            resource_name: resource_name.to_string(),
        }
    }
}

impl fmt::Display for StatusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.rule_id, self.resource_name)
    }
}

impl FromStr for StatusKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(' ') {
            Some((rule_id, resource_name)) if !rule_id.is_empty() => Ok(Self::new(rule_id, resource_name)),
            _ => Err(format!("malformed status key: {:?}", s)),
        }
    }
}

impl From<StatusKey> for String {
    fn from(key: StatusKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for StatusKey {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// The whole evaluation state of an alert; always serialized as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertStatus {
    pub version: u32,
    pub resource_status: BTreeMap<StatusKey, StatusResource>,
    pub update_time: DateTime<Utc>,
}

impl AlertStatus {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            version: STATUS_VERSION,
            resource_status: BTreeMap::new(),
            update_time: now,
        }
    }

    /// Decode a persisted blob. Empty, malformed or foreign-version blobs
    /// yield an empty status.
    pub fn parse(raw: &str, now: DateTime<Utc>) -> Self {
        if raw.trim().is_empty() {
            return Self::empty(now);
        }

        match serde_json::from_str::<AlertStatus>(raw) {
            Ok(status) if status.version == STATUS_VERSION => status,
            Ok(status) => {
                tracing::debug!("AlertStatus: discarding version {} status", status.version);
                Self::empty(now)
            }
            Err(e) => {
                tracing::debug!("AlertStatus: parse error, resetting: {}", e);
                Self::empty(now)
            }
        }
    }

    pub fn reset(&mut self) {
        self.resource_status.clear();
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_survives_serialization() {
        let now = Utc::now();
        let mut status = AlertStatus::empty(now);
        let mut res = StatusResource::cleared(2, now);
        res.current_level = "major".to_string();
        res.positive_count = 3;
        status
            .resource_status
            .insert(StatusKey::new("rl-1", "ns:pod a"), res.clone());

        let json = status.to_json();
        assert!(json.contains("\"rl-1 ns:pod a\""));

        let parsed = AlertStatus::parse(&json, Utc::now());
        assert_eq!(parsed, status);
    }

    #[test]
    fn test_malformed_status_resets() {
        let now = Utc::now();
        assert!(AlertStatus::parse("", now).resource_status.is_empty());
        assert!(AlertStatus::parse("{broken", now).resource_status.is_empty());
        assert!(AlertStatus::parse(r#"{"version":99,"resource_status":{},"update_time":"2024-01-01T00:00:00Z"}"#, now)
            .resource_status
            .is_empty());
        assert_eq!(AlertStatus::parse("{broken", now).update_time, now);
    }

    #[test]
    fn test_status_key_parsing() {
        assert_eq!("rl-1 node-1".parse::<StatusKey>(), Ok(StatusKey::new("rl-1", "node-1")));
        assert!("no-space".parse::<StatusKey>().is_err());
    }
}
