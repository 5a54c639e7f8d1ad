//! Runner-local alert configuration, rebuilt from the store on every load.

use chrono::{DateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::time::Duration;

use super::status::StatusResource;
use crate::adapter::MetricRequest;
use crate::db::{AlertDetail, RuleDetail};

/// How notifications repeat while a resource stays alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepeatType {
    /// Accepted in configs but never sends.
    Normal,
    NotRepeat,
    FixedMinutes,
    ExpMinutes,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Repeat policy of one severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub repeat_type: RepeatType,
    /// Minutes until the next send.
    #[serde(default)]
    pub repeat_interval_initvalue: u32,
    #[serde(default)]
    pub max_send_count: u32,
}

impl Policy {
    const fn new(repeat_type: RepeatType, repeat_interval_initvalue: u32, max_send_count: u32) -> Self {
        Self {
            repeat_type,
            repeat_interval_initvalue,
            max_send_count,
        }
    }
}

/// Parse the per-severity policy map; unparseable configs fall back to the
/// built-in defaults.
pub fn parse_policies(raw: &str) -> HashMap<String, Policy> {
    match serde_json::from_str(raw) {
        Ok(policies) => policies,
        Err(e) => {
            tracing::debug!("AlertConfig: using default policies, config {:?} invalid: {}", raw, e);
            default_policies()
        }
    }
}

pub fn default_policies() -> HashMap<String, Policy> {
    HashMap::from([
        ("minor".to_string(), Policy::new(RepeatType::NotRepeat, 3, 3)),
        ("major".to_string(), Policy::new(RepeatType::ExpMinutes, 2, 5)),
        ("critical".to_string(), Policy::new(RepeatType::FixedMinutes, 1, 8)),
    ])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    GreaterThan,
    GreaterEqual,
    LessThan,
    LessEqual,
}

impl FromStr for CompareOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" => Ok(Self::GreaterThan),
            ">=" => Ok(Self::GreaterEqual),
            "<" => Ok(Self::LessThan),
            "<=" => Ok(Self::LessEqual),
            other => Err(format!("unknown condition type: {}", other)),
        }
    }
}

impl CompareOp {
    pub fn check(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::GreaterEqual => value >= threshold,
            Self::LessThan => value < threshold,
            Self::LessEqual => value <= threshold,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuleInfo {
    pub rule_id: String,
    pub rule_name: String,
    pub disabled: bool,
    pub severity: String,
    /// `None` never triggers.
    pub condition: Option<CompareOp>,
    pub threshold: f64,
    pub scale: f64,
    pub unit: String,
    pub consecutive_count: u32,
    pub inhibit: bool,
    pub metric_name: String,
}

impl RuleInfo {
    fn from_detail(d: &RuleDetail) -> Self {
        let condition = match d.condition_type.parse() {
            Ok(op) => Some(op),
            Err(e) => {
                tracing::warn!("AlertConfig: rule {} disabled for evaluation: {}", d.rule_id, e);
                None
            }
        };

        Self {
            rule_id: d.rule_id.clone(),
            rule_name: d.rule_name.clone(),
            disabled: d.disabled,
            severity: d.severity.clone(),
            condition,
            threshold: d.thresholds.trim().parse().unwrap_or(0.0),
            scale: d.metric_param.trim().parse().unwrap_or(1.0),
            unit: d.unit.clone(),
            consecutive_count: d.consecutive_count,
            inhibit: d.inhibit,
            metric_name: d.metric_name.clone(),
        }
    }

    /// Whether the scaled sample crosses the threshold.
    pub fn triggers(&self, raw_value: f64) -> bool {
        self.condition
            .map_or(false, |op| op.check(raw_value * self.scale, self.threshold))
    }

    pub fn format_value(&self, raw_value: f64) -> String {
        format!("{:.2}{}", raw_value * self.scale, self.unit)
    }
}

/// Daily window in which notifications may be sent. Inclusive on both ends;
/// a start after the end spans midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self {
            start: NaiveTime::MIN,
            end: end_of_day(),
        }
    }
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
}

impl TimeWindow {
    /// Empty or unparseable bounds default to the start / end of the day.
    pub fn parse(start: &str, end: &str) -> Self {
        let parse = |s: &str| NaiveTime::parse_from_str(s.trim(), "%H:%M:%S").ok();
        let default = Self::default();
        Self {
            start: parse(start).unwrap_or(default.start),
            end: parse(end).unwrap_or(default.end),
        }
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        let t = t.with_nanosecond(0).unwrap_or(t);
        if self.start <= self.end {
            self.start <= t && t <= self.end
        } else {
            t >= self.start || t <= self.end
        }
    }
}

/// Rules sharing one monitor period, sampled on a shared tick counter.
#[derive(Debug, Clone)]
pub struct PeriodBucket {
    pub period: u32,
    pub rule_ids: Vec<String>,
    tick_count: u32,
    tick_upper_bound: u32,
}

impl PeriodBucket {
    fn new(period: u32, tick: Duration) -> Self {
        let tick_secs = tick.as_secs().max(1);
        let upper = ((period as u64 * 60) / tick_secs).clamp(1, u32::MAX as u64) as u32;
        Self {
            period,
            rule_ids: Vec::new(),
            // The first tick after load samples immediately.
            tick_count: upper - 1,
            tick_upper_bound: upper,
        }
    }

    /// Advance one tick; returns whether this bucket is due.
    pub fn advance(&mut self) -> bool {
        self.tick_count = (self.tick_count + 1) % self.tick_upper_bound;
        self.tick_count == 0
    }
}

/// Everything a runner evaluates against.
#[derive(Debug, Clone, Default)]
pub struct ConfigAlert {
    pub alert_id: String,
    pub disabled: bool,
    pub rs_type_name: String,
    pub rs_type_param: String,
    pub rs_filter_name: String,
    pub rs_filter_param: String,
    pub policies: HashMap<String, Policy>,
    pub window: TimeWindow,
    pub rules: HashMap<String, RuleInfo>,
    pub buckets: Vec<PeriodBucket>,
    pub nf_address_list_id: String,
}

impl ConfigAlert {
    pub fn build(detail: &AlertDetail, rule_details: &[RuleDetail], tick: Duration) -> Self {
        let rules: HashMap<String, RuleInfo> = rule_details
            .iter()
            .map(|d| (d.rule_id.clone(), RuleInfo::from_detail(d)))
            .collect();

        let mut by_period: BTreeMap<u32, PeriodBucket> = BTreeMap::new();
        for d in rule_details {
            if d.disabled {
                continue;
            }
            by_period
                .entry(d.monitor_periods)
                .or_insert_with(|| PeriodBucket::new(d.monitor_periods, tick))
                .rule_ids
                .push(d.rule_id.clone());
        }

        Self {
            alert_id: detail.alert_id.clone(),
            disabled: detail.disabled,
            rs_type_name: detail.rs_type_name.clone(),
            rs_type_param: detail.rs_type_param.clone(),
            rs_filter_name: detail.rs_filter_name.clone(),
            rs_filter_param: detail.rs_filter_param.clone(),
            policies: parse_policies(&detail.policy_config),
            window: TimeWindow::parse(&detail.available_start_time, &detail.available_end_time),
            rules,
            buckets: by_period.into_values().collect(),
            nf_address_list_id: detail.nf_address_list_id.clone(),
        }
    }

    /// Policy of a severity; a missing entry never sends.
    pub fn policy_for(&self, severity: &str) -> Policy {
        self.policies.get(severity).copied().unwrap_or_default()
    }

    /// Status of a resource that has never alerted.
    pub fn fresh_status(&self, rule_id: &str, now: DateTime<Utc>) -> StatusResource {
        let interval = self
            .rules
            .get(rule_id)
            .map(|r| self.policy_for(&r.severity).repeat_interval_initvalue)
            .unwrap_or_default();
        StatusResource::cleared(interval, now)
    }

    /// Advance every bucket's counter and return the requests now due.
    pub fn due_requests(&mut self) -> Vec<MetricRequest> {
        let due: Vec<usize> = self
            .buckets
            .iter_mut()
            .enumerate()
            .filter_map(|(i, b)| b.advance().then_some(i))
            .collect();

        due.into_iter()
            .map(|i| self.metric_request(&self.buckets[i]))
            .collect()
    }

    fn metric_request(&self, bucket: &PeriodBucket) -> MetricRequest {
        let mut metrics = Vec::new();
        let mut metric_to_rule: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for rule_id in &bucket.rule_ids {
            let Some(rule) = self.rules.get(rule_id) else { continue };
            if !metric_to_rule.contains_key(&rule.metric_name) {
                metrics.push(rule.metric_name.clone());
            }
            metric_to_rule
                .entry(rule.metric_name.clone())
                .or_default()
                .push(rule_id.clone());
        }

        MetricRequest {
            rs_type_name: self.rs_type_name.clone(),
            rs_type_param: self.rs_type_param.clone(),
            rs_filter_name: self.rs_filter_name.clone(),
            rs_filter_param: self.rs_filter_param.clone(),
            extra_query_params: String::new(),
            metrics,
            metric_to_rule,
        }
    }
}
