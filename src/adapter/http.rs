//! HTTP clients for the adapter and notification services.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::{AdapterError, Email, MetricRequest, MetricSource, NotificationParam, Notifier, ResourceMetrics};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn build_client() -> Result<Client, AdapterError> {
    Ok(Client::builder().timeout(REQUEST_TIMEOUT).build()?)
}

fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// Fetches metric samples from `{base}/api/v1/metric`.
pub struct HttpMetricSource {
    client: Client,
    base_url: String,
}

impl HttpMetricSource {
    pub fn new(base_url: &str) -> Result<Self, AdapterError> {
        Ok(Self {
            client: build_client()?,
            base_url: trim_base(base_url),
        })
    }
}

#[async_trait]
impl MetricSource for HttpMetricSource {
    async fn fetch(&self, request: &MetricRequest) -> Result<Vec<ResourceMetrics>, AdapterError> {
        let param = serde_json::to_string(request)?;
        let url = format!("{}/api/v1/metric", self.base_url);
        tracing::debug!("HttpMetricSource: GET {} metric_param={}", url, param);

        let body = self
            .client
            .get(&url)
            .query(&[("metric_param", param.as_str())])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        Ok(serde_json::from_str(&body)?)
    }
}

/// Renders emails through the adapter and delivers them through the
/// notification service.
pub struct HttpNotifier {
    client: Client,
    adapter_url: String,
    notification_url: String,
}

#[derive(Deserialize)]
struct CreateNotificationResponse {
    notification_id: String,
}

impl HttpNotifier {
    pub fn new(adapter_url: &str, notification_url: &str) -> Result<Self, AdapterError> {
        Ok(Self {
            client: build_client()?,
            adapter_url: trim_base(adapter_url),
            notification_url: trim_base(notification_url),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn render(&self, param: &NotificationParam, resumed: bool) -> Result<Email, AdapterError> {
        let param = serde_json::to_string(param)?;
        let resumed = if resumed { "true" } else { "false" };
        let url = format!("{}/api/v1/email", self.adapter_url);

        let body = self
            .client
            .get(&url)
            .query(&[("notification_param", param.as_str()), ("resumed", resumed)])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        if body.trim().is_empty() {
            return Err(AdapterError::Rejected("empty email".to_string()));
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn send(&self, address_list_id: &str, email: &Email) -> Result<String, AdapterError> {
        let url = format!("{}/api/v1/notifications", self.notification_url);
        let address_info = serde_json::to_string(&[address_list_id])?;
        let payload = serde_json::json!({
            "content_type": "other",
            "title": email.title,
            "content": email.content,
            "address_info": address_info,
            "expired_days": 0,
        });

        let resp: CreateNotificationResponse = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(resp.notification_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_metric_source_errors() {
        let source = HttpMetricSource::new("http://256.256.256.256/").unwrap();
        let result = source.fetch(&MetricRequest::default()).await;
        assert!(matches!(result, Err(AdapterError::Http(_))));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        assert_eq!(trim_base("http://127.0.0.1:8080/"), "http://127.0.0.1:8080");
    }
}
