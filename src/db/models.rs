//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of an alert; together with `executor_id` it encodes ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunningStatus {
    Adding,
    Running,
    Updating,
    Deleting,
    Migrating,
}

impl RunningStatus {
    pub const ALL: [RunningStatus; 5] = [
        RunningStatus::Running,
        RunningStatus::Adding,
        RunningStatus::Updating,
        RunningStatus::Migrating,
        RunningStatus::Deleting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Adding => "adding",
            Self::Running => "running",
            Self::Updating => "updating",
            Self::Deleting => "deleting",
            Self::Migrating => "migrating",
        }
    }
}

impl fmt::Display for RunningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunningStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "adding" => Ok(Self::Adding),
            "running" => Ok(Self::Running),
            "updating" => Ok(Self::Updating),
            "deleting" => Ok(Self::Deleting),
            "migrating" => Ok(Self::Migrating),
            other => Err(format!("unknown running status: {}", other)),
        }
    }
}

/// An alert row as the execution engine sees it.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub alert_id: String,
    pub alert_name: String,
    pub disabled: bool,
    pub running_status: RunningStatus,
    /// Serialized `AlertStatus`; may be empty or malformed.
    pub alert_status: String,
    /// Empty when unassigned.
    pub executor_id: String,
    pub policy_id: String,
    pub rs_filter_id: String,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

/// Everything a runner needs to load, assembled from alert, filter, type,
/// policy and action rows.
#[derive(Debug, Clone, Default)]
pub struct AlertDetail {
    pub alert_id: String,
    pub alert_name: String,
    pub disabled: bool,
    pub alert_status: String,
    pub rs_type_name: String,
    pub rs_type_param: String,
    pub rs_filter_name: String,
    pub rs_filter_param: String,
    pub policy_config: String,
    pub available_start_time: String,
    pub available_end_time: String,
    pub nf_address_list_id: String,
}

/// One rule joined with its metric.
#[derive(Debug, Clone)]
pub struct RuleDetail {
    pub rule_id: String,
    pub rule_name: String,
    pub disabled: bool,
    pub monitor_periods: u32,
    pub severity: String,
    pub metrics_type: String,
    pub condition_type: String,
    pub thresholds: String,
    pub unit: String,
    pub consecutive_count: u32,
    pub inhibit: bool,
    pub metric_name: String,
    pub metric_param: String,
}

/// What happened, as recorded in the history table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEvent {
    Triggered,
    Resumed,
    SentSuccess,
    SentFailed,
    Commented,
}

impl HistoryEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triggered => "triggered",
            Self::Resumed => "resumed",
            Self::SentSuccess => "sent_success",
            Self::SentFailed => "sent_failed",
            Self::Commented => "commented",
        }
    }
}

impl FromStr for HistoryEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "triggered" => Ok(Self::Triggered),
            "resumed" => Ok(Self::Resumed),
            "sent_success" => Ok(Self::SentSuccess),
            "sent_failed" => Ok(Self::SentFailed),
            "commented" => Ok(Self::Commented),
            other => Err(format!("unknown history event: {}", other)),
        }
    }
}

/// An append-only history row.
#[derive(Debug, Clone, Serialize)]
pub struct History {
    pub history_id: String,
    pub history_name: String,
    pub event: HistoryEvent,
    pub content: String,
    pub notification_id: String,
    pub create_time: DateTime<Utc>,
    pub alert_id: String,
    pub rule_id: String,
    pub resource_name: String,
}

impl History {
    pub fn new(
        alert_id: &str,
        event: HistoryEvent,
        content: String,
        notification_id: &str,
        rule_id: &str,
        resource_name: &str,
    ) -> Self {
        Self {
            history_id: new_id("hs-"),
            history_name: String::new(),
            event,
            content,
            notification_id: notification_id.to_string(),
            create_time: Utc::now(),
            alert_id: alert_id.to_string(),
            rule_id: rule_id.to_string(),
            resource_name: resource_name.to_string(),
        }
    }
}

/// A remark left by an operator on a history row.
#[derive(Debug, Clone, Serialize)]
pub struct Comment {
    pub comment_id: String,
    pub addresser: String,
    pub content: String,
    pub history_id: String,
    pub create_time: DateTime<Utc>,
}

impl Comment {
    pub fn new(addresser: &str, content: &str, history_id: &str) -> Self {
        Self {
            comment_id: new_id("cm-"),
            addresser: addresser.to_string(),
            content: content.to_string(),
            history_id: history_id.to_string(),
            create_time: Utc::now(),
        }
    }
}

/// Snapshot of a local runner, written back by the executor health checker.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerInfo {
    pub alert_id: String,
    pub alert_status: String,
    pub update_time: DateTime<Utc>,
}

/// A full alert definition, registered by the manager in one transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertDefinition {
    pub alert_name: String,
    #[serde(default)]
    pub disabled: bool,
    pub resource: ResourceDefinition,
    pub policy: PolicyDefinition,
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
    /// Address list the notification service delivers to.
    #[serde(default)]
    pub nf_address_list_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub rs_type_name: String,
    #[serde(default)]
    pub rs_type_param: String,
    #[serde(default)]
    pub rs_filter_name: String,
    #[serde(default)]
    pub rs_filter_param: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyDefinition {
    #[serde(default)]
    pub policy_name: String,
    /// JSON map from severity to repeat policy.
    #[serde(default)]
    pub policy_config: String,
    #[serde(default)]
    pub available_start_time: String,
    #[serde(default)]
    pub available_end_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub rule_name: String,
    #[serde(default)]
    pub disabled: bool,
    pub monitor_periods: u32,
    pub severity: String,
    #[serde(default)]
    pub metrics_type: String,
    pub condition_type: String,
    pub thresholds: String,
    #[serde(default)]
    pub unit: String,
    pub consecutive_count: u32,
    #[serde(default)]
    pub inhibit: bool,
    pub metric_name: String,
    /// Scale factor applied to raw samples.
    #[serde(default = "default_metric_param")]
    pub metric_param: String,
}

fn default_metric_param() -> String {
    "1".to_string()
}

/// Generate a prefixed random identifier, e.g. `al-3f2a...`.
pub fn new_id(prefix: &str) -> String {
    format!("{}{}", prefix, uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_status_round_trips_through_str() {
        for status in RunningStatus::ALL {
            assert_eq!(status.as_str().parse::<RunningStatus>(), Ok(status));
        }
        assert!("paused".parse::<RunningStatus>().is_err());
    }

    #[test]
    fn test_rule_definition_defaults_scale_to_one() {
        let rule: RuleDefinition = serde_json::from_str(
            r#"{"rule_name":"cpu","monitor_periods":1,"severity":"major",
                "condition_type":">","thresholds":"90","consecutive_count":2,
                "metric_name":"cpu_usage"}"#,
        )
        .unwrap();
        assert_eq!(rule.metric_param, "1");
        assert!(!rule.disabled);
    }
}
