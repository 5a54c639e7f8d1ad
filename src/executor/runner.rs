//! Per-alert evaluation task.

use chrono::Utc;
use futures::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use super::alert_config::ConfigAlert;
use super::evaluate::{evaluate, EvalClock, Effect, PendingNotification};
use super::status::AlertStatus;
use crate::adapter::{MetricSource, Notifier, ResourceMetrics};
use crate::db::{History, HistoryEvent, RunnerInfo, RunningStatus, Store};

/// Capacity of a runner's mailbox.
pub const SIGNAL_BUFFER: usize = 10;

/// Control messages for a runner, handled in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Exit; anything queued behind it is discarded.
    Stop,
    /// Reload configuration and reset the evaluation state.
    Update,
    /// Record a comment on the given history row.
    Comment(String),
}

/// Dependencies shared by every runner of an executor.
#[derive(Clone)]
pub struct RunnerContext {
    pub store: Store,
    pub metrics: Arc<dyn MetricSource>,
    pub notifier: Arc<dyn Notifier>,
    /// Raised when a runner's status changed in a way worth persisting soon.
    pub dirty: mpsc::Sender<()>,
    pub tick: Duration,
    pub metric_timeout: Duration,
}

type SharedStatus = Arc<Mutex<AlertStatus>>;

fn lock_status(status: &SharedStatus) -> MutexGuard<'_, AlertStatus> {
    status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The executor's grip on a running [`AlertRunner`].
#[derive(Clone)]
pub struct RunnerHandle {
    alert_id: String,
    signals: mpsc::Sender<Signal>,
    status: SharedStatus,
}

impl RunnerHandle {
    /// Deliver a signal; returns false when the runner has already exited.
    pub async fn send(&self, signal: Signal) -> bool {
        self.signals.send(signal).await.is_ok()
    }

    /// Serialized status and the time the runner last made progress.
    pub fn snapshot(&self) -> RunnerInfo {
        let status = lock_status(&self.status);
        RunnerInfo {
            alert_id: self.alert_id.clone(),
            alert_status: status.to_json(),
            update_time: status.update_time,
        }
    }
}

pub struct AlertRunner {
    alert_id: String,
    ctx: RunnerContext,
    /// `None` while the last load failed; ticks are skipped until an update.
    config: Option<ConfigAlert>,
    status: SharedStatus,
    signals: mpsc::Receiver<Signal>,
}

impl AlertRunner {
    /// Spawn the runner task. `initial` is the state the alert was claimed
    /// from: a fresh alert starts with an empty status, a migrated one keeps
    /// the persisted status.
    pub fn spawn(alert_id: &str, initial: RunningStatus, ctx: RunnerContext) -> RunnerHandle {
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let status = Arc::new(Mutex::new(AlertStatus::empty(Utc::now())));

        let runner = AlertRunner {
            alert_id: alert_id.to_string(),
            ctx,
            config: None,
            status: status.clone(),
            signals: rx,
        };
        tokio::spawn(runner.run(initial));

        RunnerHandle {
            alert_id: alert_id.to_string(),
            signals: tx,
            status,
        }
    }

    async fn run(mut self, initial: RunningStatus) {
        self.load();
        if initial == RunningStatus::Adding {
            self.reset_status();
        }
        self.touch();

        let tick = self.ctx.tick;
        let mut interval = tokio::time::interval_at(Instant::now() + tick, tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!("AlertRunner[{}]: started from {}", self.alert_id, initial);

        loop {
            tokio::select! {
                signal = self.signals.recv() => {
                    match signal {
                        Some(Signal::Stop) | None => {
                            while self.signals.try_recv().is_ok() {}
                            break;
                        }
                        Some(Signal::Update) => {
                            self.load();
                            self.reset_status();
                            self.touch();
                            tracing::info!("AlertRunner[{}]: reloaded", self.alert_id);
                        }
                        Some(Signal::Comment(history_id)) => {
                            self.record(HistoryEvent::Commented, history_id, "", "", "");
                            self.touch();
                        }
                    }
                }
                _ = interval.tick() => {
                    self.tick().await;
                    self.touch();
                }
            }
        }

        tracing::info!("AlertRunner[{}]: stopped", self.alert_id);
    }

    /// Rebuild configuration and status from the store.
    fn load(&mut self) {
        let detail = match self.ctx.store.query_alert_detail(&self.alert_id) {
            Ok(detail) => detail,
            Err(e) => {
                tracing::error!("AlertRunner[{}]: load failed: {}", self.alert_id, e);
                self.config = None;
                return;
            }
        };
        let rules = match self.ctx.store.query_rule_details(&self.alert_id) {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!("AlertRunner[{}]: loading rules failed: {}", self.alert_id, e);
                self.config = None;
                return;
            }
        };

        let config = ConfigAlert::build(&detail, &rules, self.ctx.tick);
        tracing::debug!(
            "AlertRunner[{}]: loaded {} rules in {} period buckets",
            self.alert_id,
            config.rules.len(),
            config.buckets.len()
        );
        self.config = Some(config);

        let mut status = lock_status(&self.status);
        let update_time = status.update_time;
        *status = AlertStatus::parse(&detail.alert_status, update_time);
    }

    fn reset_status(&self) {
        lock_status(&self.status).reset();
    }

    fn touch(&self) {
        lock_status(&self.status).update_time = Utc::now();
    }

    async fn tick(&mut self) {
        let Some(config) = self.config.as_mut() else { return };
        if config.disabled {
            return;
        }

        let requests = config.due_requests();
        if requests.is_empty() {
            return;
        }

        let timeout = self.ctx.metric_timeout;
        let fetches = requests.into_iter().map(|request| {
            let source = self.ctx.metrics.clone();
            let alert_id = self.alert_id.clone();
            async move {
                match tokio::time::timeout(timeout, source.fetch(&request)).await {
                    Ok(Ok(metrics)) => metrics,
                    Ok(Err(e)) => {
                        tracing::error!("AlertRunner[{}]: metric fetch failed: {}", alert_id, e);
                        Vec::new()
                    }
                    Err(_) => {
                        tracing::warn!("AlertRunner[{}]: metric fetch timed out after {:?}", alert_id, timeout);
                        Vec::new()
                    }
                }
            }
        });
        let batches: Vec<ResourceMetrics> = join_all(fetches).await.into_iter().flatten().collect();

        self.check_metrics(&batches).await;
    }

    async fn check_metrics(&self, batches: &[ResourceMetrics]) {
        let Some(config) = self.config.as_ref() else { return };
        let clock = EvalClock::now(self.ctx.tick);

        let mut effects = Vec::new();
        let mut changed = false;
        {
            let mut status = lock_status(&self.status);
            for batch in batches {
                let eval = evaluate(config, &mut status.resource_status, batch, &clock);
                changed |= eval.changed;
                effects.extend(eval.effects);
            }
        }

        for effect in effects {
            match effect {
                Effect::Record {
                    event,
                    content,
                    rule_id,
                    resource_name,
                } => self.record(event, content, "", &rule_id, &resource_name),
                Effect::Notify(pending) => self.notify(config, pending).await,
            }
        }

        if changed {
            // A full channel already holds a pending flush request.
            let _ = self.ctx.dirty.try_send(());
        }
    }

    async fn notify(&self, config: &ConfigAlert, pending: PendingNotification) {
        let outcome = match self.ctx.notifier.render(&pending.param, pending.resumed).await {
            Ok(email) => self.ctx.notifier.send(&config.nf_address_list_id, &email).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(notification_id) => {
                tracing::debug!(
                    "AlertRunner[{}]: notified {} {} ({})",
                    self.alert_id,
                    pending.rule_id,
                    pending.resource_name,
                    notification_id
                );
                self.record(
                    HistoryEvent::SentSuccess,
                    pending.content,
                    &notification_id,
                    &pending.rule_id,
                    &pending.resource_name,
                );
            }
            Err(e) => {
                tracing::error!(
                    "AlertRunner[{}]: notification for {} {} failed: {}",
                    self.alert_id,
                    pending.rule_id,
                    pending.resource_name,
                    e
                );
                self.record(
                    HistoryEvent::SentFailed,
                    pending.content,
                    "",
                    &pending.rule_id,
                    &pending.resource_name,
                );
            }
        }
    }

    fn record(&self, event: HistoryEvent, content: String, notification_id: &str, rule_id: &str, resource_name: &str) {
        let history = History::new(&self.alert_id, event, content, notification_id, rule_id, resource_name);
        if let Err(e) = self.ctx.store.create_history(&history) {
            tracing::error!("AlertRunner[{}]: writing {} history failed: {}", self.alert_id, event.as_str(), e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::adapter::fake::{FakeMetricSource, FakeNotifier};
    use crate::db::tests::{rename_alert, sample_definition, set_rule_thresholds, temp_store};
    use crate::db::Ownership;
    use std::sync::atomic::Ordering;
    use tempfile::NamedTempFile;

    pub(crate) struct Harness {
        pub _tmp: NamedTempFile,
        pub store: Store,
        pub metrics: Arc<FakeMetricSource>,
        pub notifier: Arc<FakeNotifier>,
        pub dirty_rx: mpsc::Receiver<()>,
        pub ctx: RunnerContext,
    }

    pub(crate) fn harness() -> Harness {
        let (tmp, store) = temp_store();
        let metrics = Arc::new(FakeMetricSource::default());
        let notifier = Arc::new(FakeNotifier::default());
        let (dirty, dirty_rx) = mpsc::channel(16);
        let ctx = RunnerContext {
            store: store.clone(),
            metrics: metrics.clone(),
            notifier: notifier.clone(),
            dirty,
            tick: Duration::from_secs(10),
            metric_timeout: Duration::from_secs(3),
        };
        Harness {
            _tmp: tmp,
            store,
            metrics,
            notifier,
            dirty_rx,
            ctx,
        }
    }

    fn running_alert(h: &Harness) -> String {
        let alert_id = h.store.register_alert(&sample_definition()).unwrap();
        h.store
            .transition_alert(
                &alert_id,
                Ownership::unassigned(RunningStatus::Adding),
                Ownership::new(RunningStatus::Running, "e1"),
            )
            .unwrap();
        alert_id
    }

    fn count(store: &Store, alert_id: &str, event: HistoryEvent) -> usize {
        store
            .list_histories(alert_id)
            .unwrap()
            .iter()
            .filter(|h| h.event == event)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_triggers_and_notifies() {
        let mut h = harness();
        let alert_id = running_alert(&h);
        h.metrics.set("node_cpu_utilisation", "node-1", 95.0);

        let handle = AlertRunner::spawn(&alert_id, RunningStatus::Adding, h.ctx.clone());

        // First tick samples, second tick six ticks later triggers.
        tokio::time::sleep(Duration::from_secs(75)).await;

        assert_eq!(count(&h.store, &alert_id, HistoryEvent::Triggered), 1);
        assert_eq!(count(&h.store, &alert_id, HistoryEvent::SentSuccess), 1);
        assert_eq!(h.notifier.sent_count(), 1);
        assert!(h.dirty_rx.try_recv().is_ok());

        let info = handle.snapshot();
        assert!(info.alert_status.contains("major"));

        assert!(handle.send(Signal::Stop).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_is_recorded() {
        let h = harness();
        let alert_id = running_alert(&h);
        h.metrics.set("node_cpu_utilisation", "node-1", 95.0);
        h.notifier.fail_send.store(true, Ordering::SeqCst);

        let handle = AlertRunner::spawn(&alert_id, RunningStatus::Adding, h.ctx.clone());
        tokio::time::sleep(Duration::from_secs(75)).await;

        assert_eq!(count(&h.store, &alert_id, HistoryEvent::SentFailed), 1);
        assert_eq!(count(&h.store, &alert_id, HistoryEvent::SentSuccess), 0);
        handle.send(Signal::Stop).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_metric_failure_skips_evaluation() {
        let h = harness();
        let alert_id = running_alert(&h);
        h.metrics.fail.store(true, Ordering::SeqCst);

        let handle = AlertRunner::spawn(&alert_id, RunningStatus::Adding, h.ctx.clone());
        tokio::time::sleep(Duration::from_secs(75)).await;

        assert!(h.metrics.calls.load(Ordering::SeqCst) >= 2);
        assert!(h.store.list_histories(&alert_id).unwrap().is_empty());
        handle.send(Signal::Stop).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_comment_and_stop() {
        let h = harness();
        let alert_id = running_alert(&h);
        let handle = AlertRunner::spawn(&alert_id, RunningStatus::Adding, h.ctx.clone());

        assert!(handle.send(Signal::Comment("hs-42".to_string())).await);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let histories = h.store.list_histories(&alert_id).unwrap();
        assert_eq!(histories.len(), 1);
        assert_eq!(histories[0].event, HistoryEvent::Commented);
        assert_eq!(histories[0].content, "hs-42");

        assert!(handle.send(Signal::Stop).await);
        handle.send(Signal::Comment("hs-43".to_string())).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.store.list_histories(&alert_id).unwrap().len(), 1);
        assert!(!handle.send(Signal::Update).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_migrated_runner_keeps_status() {
        let h = harness();
        let alert_id = running_alert(&h);
        let mut status = AlertStatus::empty(Utc::now());
        status.resource_status.insert(
            crate::executor::status::StatusKey::new("rl-x", "node-1"),
            crate::executor::status::StatusResource::cleared(2, Utc::now()),
        );
        let runners = vec![RunnerInfo {
            alert_id: alert_id.clone(),
            alert_status: status.to_json(),
            update_time: Utc::now(),
        }];
        h.store.update_alert_status(&runners, "e1").unwrap();

        let kept = AlertRunner::spawn(&alert_id, RunningStatus::Migrating, h.ctx.clone());
        let fresh = AlertRunner::spawn(&alert_id, RunningStatus::Adding, h.ctx.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(kept.snapshot().alert_status.contains("rl-x node-1"));
        assert!(!fresh.snapshot().alert_status.contains("rl-x node-1"));
        kept.send(Signal::Stop).await;
        fresh.send(Signal::Stop).await;
    }

    fn resource_count(handle: &RunnerHandle) -> usize {
        AlertStatus::parse(&handle.snapshot().alert_status, Utc::now()).resource_status.len()
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_resets_status_and_reloads_rules() {
        let h = harness();
        let alert_id = running_alert(&h);
        h.metrics.set("node_cpu_utilisation", "node-1", 95.0);

        let handle = AlertRunner::spawn(&alert_id, RunningStatus::Adding, h.ctx.clone());
        tokio::time::sleep(Duration::from_secs(75)).await;
        assert_eq!(count(&h.store, &alert_id, HistoryEvent::Triggered), 1);
        assert!(handle.snapshot().alert_status.contains("major"));

        set_rule_thresholds(&h.store, &alert_id, "99");
        assert!(handle.send(Signal::Update).await);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(resource_count(&handle), 0);

        // 95 is under the new threshold: sampled again, never re-triggered.
        let calls = h.metrics.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(130)).await;
        assert!(h.metrics.calls.load(Ordering::SeqCst) > calls);
        assert_eq!(count(&h.store, &alert_id, HistoryEvent::Triggered), 1);
        assert_eq!(count(&h.store, &alert_id, HistoryEvent::Resumed), 0);
        assert!(!handle.snapshot().alert_status.contains("major"));
        assert_eq!(h.notifier.sent_count(), 1);

        handle.send(Signal::Stop).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_load_skips_ticks_until_update() {
        let h = harness();
        let alert_id = running_alert(&h);
        h.metrics.set("node_cpu_utilisation", "node-1", 95.0);
        let hidden = format!("{}-hidden", alert_id);
        rename_alert(&h.store, &alert_id, &hidden);

        let handle = AlertRunner::spawn(&alert_id, RunningStatus::Adding, h.ctx.clone());
        tokio::time::sleep(Duration::from_secs(75)).await;
        assert_eq!(h.metrics.calls.load(Ordering::SeqCst), 0);
        assert!(h.store.list_histories(&alert_id).unwrap().is_empty());

        rename_alert(&h.store, &hidden, &alert_id);
        assert!(handle.send(Signal::Update).await);
        tokio::time::sleep(Duration::from_secs(75)).await;
        assert!(h.metrics.calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(count(&h.store, &alert_id, HistoryEvent::Triggered), 1);

        handle.send(Signal::Stop).await;
    }
}
