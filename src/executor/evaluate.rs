//! Threshold evaluation and repeat policy.
//!
//! Evaluation is pure: it mutates the status map and returns the side
//! effects (history rows, notifications) for the runner to perform after the
//! status lock is released.

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime, TimeZone, Utc};
use std::collections::BTreeMap;

use super::alert_config::{ConfigAlert, Policy, RepeatType, RuleInfo};
use super::status::{RecordedMetric, StatusKey, StatusResource};
use crate::adapter::{NotificationParam, ResourceMetrics};
use crate::db::HistoryEvent;

/// Clock readings for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct EvalClock {
    pub now: DateTime<Utc>,
    /// Wall-clock time of day compared against the policy window.
    pub time_of_day: NaiveTime,
    /// Tolerance when comparing against the next sendable time.
    pub slack: ChronoDuration,
}

impl EvalClock {
    pub fn now(tick: std::time::Duration) -> Self {
        Self {
            now: Utc::now(),
            time_of_day: Local::now().time(),
            slack: ChronoDuration::from_std(tick / 3).unwrap_or_else(|_| ChronoDuration::zero()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingNotification {
    pub rule_id: String,
    pub resource_name: String,
    pub param: NotificationParam,
    pub resumed: bool,
    /// History content recorded with the delivery outcome.
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Record {
        event: HistoryEvent,
        content: String,
        rule_id: String,
        resource_name: String,
    },
    Notify(PendingNotification),
}

#[derive(Debug, Default)]
pub struct Evaluation {
    pub effects: Vec<Effect>,
    /// A resource was triggered or resumed.
    pub changed: bool,
}

/// Whether the policy allows sending for this resource now.
pub fn check_sendable(policy: &Policy, status: &StatusResource, clock: &EvalClock) -> bool {
    match policy.repeat_type {
        RepeatType::NotRepeat => status.cumulated_send_count == 0,
        RepeatType::FixedMinutes | RepeatType::ExpMinutes => {
            status.cumulated_send_count < policy.max_send_count
                && status.next_sendable_time <= clock.now + clock.slack
        }
        RepeatType::Normal | RepeatType::Unknown => false,
    }
}

/// Account for one send attempt.
pub fn process_repeat(policy: &Policy, status: &mut StatusResource) {
    status.cumulated_send_count = status.cumulated_send_count.saturating_add(1);
    let interval = ChronoDuration::minutes(status.next_resend_interval as i64);
    match policy.repeat_type {
        RepeatType::FixedMinutes => {
            status.next_sendable_time += interval;
        }
        RepeatType::ExpMinutes => {
            status.next_sendable_time += interval;
            status.next_resend_interval = status.next_resend_interval.saturating_mul(2);
        }
        _ => {}
    }
}

/// `<scope>:<name>` is shown as `<name>`.
pub fn display_resource_name(name: &str) -> &str {
    name.split(':').nth(1).unwrap_or(name)
}

fn format_sample_time(unix_secs: i64) -> String {
    match Local.timestamp_opt(unix_secs, 0).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => unix_secs.to_string(),
    }
}

fn history_content(metric: &RecordedMetric) -> String {
    serde_json::to_string(metric).unwrap_or_default()
}

fn sample_value(metric: &RecordedMetric) -> Option<f64> {
    metric.last().and_then(|tv| tv.value.trim().parse().ok())
}

/// `triggered` is every sample of the rule over threshold in this batch.
fn push_aggregated(status: &mut StatusResource, metric: &RecordedMetric, triggered: &[RecordedMetric]) {
    let agg = &mut status.aggregated_alerts;
    agg.cumulated_count = agg.cumulated_count.saturating_add(1);
    if let Some(tv) = metric.last() {
        let alert_time = format_sample_time(tv.time);
        if agg.first_alert_time.is_empty() {
            agg.first_alert_time = alert_time.clone();
        }
        agg.last_alert_time = alert_time;
    }
    agg.last_alert_values = triggered.to_vec();
}

fn active_param(rule: &RuleInfo, resource_name: &str, status: &StatusResource) -> NotificationParam {
    let agg = &status.aggregated_alerts;
    let last_value = agg
        .last_alert_values
        .iter()
        .find(|m| m.resource_name == resource_name)
        .and_then(sample_value)
        .map(|v| rule.format_value(v))
        .unwrap_or_default();

    NotificationParam {
        resource_name: display_resource_name(resource_name).to_string(),
        rule_name: rule.rule_name.clone(),
        cumulated_count: agg.cumulated_count,
        first_time: agg.first_alert_time.clone(),
        last_time: agg.last_alert_time.clone(),
        last_value,
    }
}

fn resume_param(rule: &RuleInfo, previous: &StatusResource, metric: &RecordedMetric) -> NotificationParam {
    NotificationParam {
        resource_name: display_resource_name(&metric.resource_name).to_string(),
        rule_name: rule.rule_name.clone(),
        cumulated_count: 0,
        first_time: previous.aggregated_alerts.first_alert_time.clone(),
        last_time: metric.last().map(|tv| format_sample_time(tv.time)).unwrap_or_default(),
        last_value: sample_value(metric).map(|v| rule.format_value(v)).unwrap_or_default(),
    }
}

/// Evaluate one batch of samples for one rule against `statuses`.
///
/// Keys of the batch's rule are replaced by what this batch produced; keys
/// of other rules are left untouched.
pub fn evaluate(
    config: &ConfigAlert,
    statuses: &mut BTreeMap<StatusKey, StatusResource>,
    batch: &ResourceMetrics,
    clock: &EvalClock,
) -> Evaluation {
    let mut out = Evaluation::default();
    let rule_id = batch.rule_id.as_str();
    let Some(rule) = config.rules.get(rule_id) else {
        tracing::debug!("AlertRunner[{}]: samples for unknown rule {}", config.alert_id, rule_id);
        return out;
    };
    let policy = config.policy_for(&rule.severity);

    let mut triggered = Vec::new();
    let mut resumed = Vec::new();
    for (resource_name, values) in &batch.resource_metric {
        let metric = RecordedMetric {
            rule_name: rule.rule_name.clone(),
            resource_name: resource_name.clone(),
            values: values.clone(),
        };
        let Some(value) = sample_value(&metric) else {
            if !values.is_empty() {
                tracing::warn!("AlertRunner[{}]: ignoring unparseable sample for {}", config.alert_id, resource_name);
            }
            continue;
        };
        if rule.triggers(value) {
            triggered.push(metric);
        } else {
            resumed.push(metric);
        }
    }

    let previous_of = |key: &StatusKey| {
        statuses
            .get(key)
            .cloned()
            .unwrap_or_else(|| config.fresh_status(rule_id, clock.now))
    };

    let mut next: BTreeMap<StatusKey, StatusResource> = BTreeMap::new();

    for metric in &triggered {
        let key = StatusKey::new(rule_id, &metric.resource_name);
        let mut status = previous_of(&key);

        status.positive_count = status.positive_count.saturating_add(1);
        let alerting = status.positive_count >= rule.consecutive_count;

        if alerting && status.is_cleared() {
            status.current_level = rule.severity.clone();
            status.next_sendable_time = clock.now;
            out.changed = true;
            out.effects.push(Effect::Record {
                event: HistoryEvent::Triggered,
                content: history_content(metric),
                rule_id: rule_id.to_string(),
                resource_name: metric.resource_name.clone(),
            });
        }

        if alerting {
            push_aggregated(&mut status, metric, &triggered);

            if !config.window.contains(clock.time_of_day) {
                status.next_sendable_time = clock.now;
            } else if check_sendable(&policy, &status, clock) {
                out.effects.push(Effect::Notify(PendingNotification {
                    rule_id: rule_id.to_string(),
                    resource_name: metric.resource_name.clone(),
                    param: active_param(rule, &metric.resource_name, &status),
                    resumed: false,
                    content: history_content(metric),
                }));
                process_repeat(&policy, &mut status);
            }
        }

        next.insert(key, status);
    }

    for metric in &resumed {
        let key = StatusKey::new(rule_id, &metric.resource_name);
        let mut status = previous_of(&key);
        status.positive_count = 0;

        if !status.is_cleared() {
            let previous = status;
            status = config.fresh_status(rule_id, clock.now);
            out.changed = true;
            out.effects.push(Effect::Record {
                event: HistoryEvent::Resumed,
                content: history_content(metric),
                rule_id: rule_id.to_string(),
                resource_name: metric.resource_name.clone(),
            });

            if check_sendable(&policy, &previous, clock) {
                out.effects.push(Effect::Notify(PendingNotification {
                    rule_id: rule_id.to_string(),
                    resource_name: metric.resource_name.clone(),
                    param: resume_param(rule, &previous, metric),
                    resumed: true,
                    content: history_content(metric),
                }));
            }
        }

        next.insert(key, status);
    }

    statuses.retain(|key, _| key.rule_id != rule_id);
    statuses.extend(next);
    out
}
