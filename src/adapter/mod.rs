//! Contracts of the metric and notification collaborators.
//!
//! The runner only sees the [`MetricSource`] and [`Notifier`] traits; the
//! HTTP implementations talk to the adapter and notification services.

mod http;

pub use http::{HttpMetricSource, HttpNotifier};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Adapter error types.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("rejected: {0}")]
    Rejected(String),
}

/// One metric query for a period bucket of an alert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricRequest {
    pub rs_type_name: String,
    pub rs_type_param: String,
    pub rs_filter_name: String,
    pub rs_filter_param: String,
    pub extra_query_params: String,
    pub metrics: Vec<String>,
    /// Metric name to the rules that consume it.
    pub metric_to_rule: BTreeMap<String, Vec<String>>,
}

/// A single sample; values arrive as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeValue {
    /// Unix seconds.
    pub time: i64,
    pub value: String,
}

/// Samples of one rule's metric, per resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceMetrics {
    pub rule_id: String,
    pub metric_name: String,
    #[serde(default)]
    pub resource_metric: HashMap<String, Vec<TimeValue>>,
}

/// Input of the email renderer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationParam {
    pub resource_name: String,
    pub rule_name: String,
    pub cumulated_count: u32,
    pub first_time: String,
    pub last_time: String,
    pub last_value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    pub title: String,
    pub content: String,
}

#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn fetch(&self, request: &MetricRequest) -> Result<Vec<ResourceMetrics>, AdapterError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Render an active (`resumed == false`) or resume notification.
    async fn render(&self, param: &NotificationParam, resumed: bool) -> Result<Email, AdapterError>;

    /// Deliver to an address list. Returns the notification id.
    async fn send(&self, address_list_id: &str, email: &Email) -> Result<String, AdapterError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_metrics_wire_format() {
        let raw = r#"[{"RuleId":"rl-1","MetricName":"cpu","ResourceMetric":{"node-1":[{"time":1,"value":"0.5"}]}}]"#;
        let parsed: Vec<ResourceMetrics> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed[0].rule_id, "rl-1");
        assert_eq!(parsed[0].resource_metric["node-1"][0].value, "0.5");
    }

    #[test]
    fn test_metric_request_is_snake_case() {
        let req = MetricRequest {
            metrics: vec!["cpu".to_string()],
            ..Default::default()
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("metric_to_rule").is_some());
        assert!(json.get("rs_filter_param").is_some());
    }
}
