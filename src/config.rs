//! Configuration module for alertfleet.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Which set of services this process hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Executor,
    Watcher,
    Manager,
    /// Manager, watcher and a single executor in one process.
    Standalone,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executor => "executor",
            Self::Watcher => "watcher",
            Self::Manager => "manager",
            Self::Standalone => "standalone",
        }
    }

    pub fn runs_executor(&self) -> bool {
        matches!(self, Self::Executor | Self::Standalone)
    }

    pub fn runs_watcher(&self) -> bool {
        matches!(self, Self::Watcher | Self::Standalone)
    }

    pub fn runs_manager(&self) -> bool {
        matches!(self, Self::Manager | Self::Standalone)
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "executor" => Ok(Self::Executor),
            "watcher" => Ok(Self::Watcher),
            "manager" => Ok(Self::Manager),
            "standalone" => Ok(Self::Standalone),
            other => Err(format!("unknown run mode: {}", other)),
        }
    }
}

/// Backend for leases, watches and the work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordBackend {
    /// Tables in the shared SQLite file; usable across processes.
    Sqlite,
    /// In-process only; valid for standalone mode.
    Memory,
}

impl FromStr for CoordBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown coordination backend: {}", other)),
        }
    }
}

/// Timer periods and timeouts shared by every component.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Base evaluation tick of an alert runner.
    pub tick: Duration,
    /// Upper bound on one metric fetch for a period bucket.
    pub metric_timeout: Duration,
    /// Executor registration refresh period.
    pub heartbeat: Duration,
    /// Lease TTL of the executor registration.
    pub executor_lease: Duration,
    /// Lease TTL of an operation broadcast.
    pub broadcast_lease: Duration,
    /// Period of the executor and watcher health sweeps.
    pub health_check: Duration,
    /// Period of the debounced runner status flush.
    pub status_flush: Duration,
    /// Age after which a lifecycle state counts as stuck.
    pub stuck_timeout: Duration,
    /// Fixed delay before retrying a failed queue or watch call.
    pub retry_delay: Duration,
    /// Poll period of the SQLite coordination backend.
    pub coord_poll: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(10),
            metric_timeout: Duration::from_secs(3),
            heartbeat: Duration::from_secs(20),
            executor_lease: Duration::from_secs(30),
            broadcast_lease: Duration::from_secs(10),
            health_check: Duration::from_secs(30),
            status_flush: Duration::from_secs(1),
            stuck_timeout: Duration::from_secs(60),
            retry_delay: Duration::from_secs(3),
            coord_poll: Duration::from_millis(500),
        }
    }
}

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub run_mode: RunMode,
    /// HTTP port for the operations endpoints (default: 9201)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "alertfleet.db")
    pub db_path: String,
    pub coord_backend: CoordBackend,
    /// Identity of this executor in the registry keyspace.
    pub executor_name: String,
    /// Number of work queue shards.
    pub queue_num: usize,
    pub topic_prefix: String,
    /// Base URL of the metric / email rendering adapter.
    pub adapter_url: String,
    /// Base URL of the notification service.
    pub notification_url: String,
    /// Size of the worker pool that starts dequeued alerts.
    pub max_working_alerts: usize,
    pub timings: Timings,
}

pub const MIN_QUEUE_NUM: usize = 10;
pub const MAX_QUEUE_NUM: usize = 5000;

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Standalone,
            http_port: 9201,
            db_path: "alertfleet.db".to_string(),
            coord_backend: CoordBackend::Sqlite,
            executor_name: default_executor_name(),
            queue_num: MIN_QUEUE_NUM,
            topic_prefix: "al-job".to_string(),
            adapter_url: "http://127.0.0.1:8080".to_string(),
            notification_url: "http://127.0.0.1:9202".to_string(),
            max_working_alerts: 5,
            timings: Timings::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Unparseable values are ignored and the default is kept.
    ///
    /// Environment variables:
    /// - `ALERT_RUN_MODE`: executor | watcher | manager | standalone
    /// - `ALERT_HTTP_PORT`, `ALERT_DB_PATH`
    /// - `ALERT_COORD_BACKEND`: sqlite | memory
    /// - `ALERT_EXECUTOR_NAME` (falls back to `HOSTNAME`)
    /// - `ALERT_QUEUE_NUM` (clamped to 10..=5000), `ALERT_TOPIC_PREFIX`
    /// - `ALERT_ADAPTER_URL`, `ALERT_NOTIFICATION_URL`
    /// - `ALERT_MAX_WORKING_ALERTS`
    /// - `ALERT_<TIMER>_SECS` for every field of [`Timings`]
    pub fn load() -> Self {
        let mut cfg = Self::default();

        parse_var("ALERT_RUN_MODE", &mut cfg.run_mode);
        parse_var("ALERT_HTTP_PORT", &mut cfg.http_port);
        parse_var("ALERT_COORD_BACKEND", &mut cfg.coord_backend);
        parse_var("ALERT_QUEUE_NUM", &mut cfg.queue_num);
        parse_var("ALERT_MAX_WORKING_ALERTS", &mut cfg.max_working_alerts);

        if let Ok(db_path) = env::var("ALERT_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Ok(name) = env::var("ALERT_EXECUTOR_NAME") {
            if !name.is_empty() {
                cfg.executor_name = name;
            }
        }
        if let Ok(prefix) = env::var("ALERT_TOPIC_PREFIX") {
            cfg.topic_prefix = prefix;
        }
        if let Ok(url) = env::var("ALERT_ADAPTER_URL") {
            cfg.adapter_url = url;
        }
        if let Ok(url) = env::var("ALERT_NOTIFICATION_URL") {
            cfg.notification_url = url;
        }

        let t = &mut cfg.timings;
        parse_secs("ALERT_TICK_SECS", &mut t.tick);
        parse_secs("ALERT_METRIC_TIMEOUT_SECS", &mut t.metric_timeout);
        parse_secs("ALERT_HEARTBEAT_SECS", &mut t.heartbeat);
        parse_secs("ALERT_EXECUTOR_LEASE_SECS", &mut t.executor_lease);
        parse_secs("ALERT_BROADCAST_LEASE_SECS", &mut t.broadcast_lease);
        parse_secs("ALERT_HEALTH_CHECK_SECS", &mut t.health_check);
        parse_secs("ALERT_STATUS_FLUSH_SECS", &mut t.status_flush);
        parse_secs("ALERT_STUCK_TIMEOUT_SECS", &mut t.stuck_timeout);
        parse_secs("ALERT_RETRY_DELAY_SECS", &mut t.retry_delay);

        cfg.queue_num = clamp_queue_num(cfg.queue_num);
        cfg.max_working_alerts = cfg.max_working_alerts.max(1);
        cfg
    }
}

pub fn clamp_queue_num(n: usize) -> usize {
    n.clamp(MIN_QUEUE_NUM, MAX_QUEUE_NUM)
}

fn default_executor_name() -> String {
    match env::var("HOSTNAME") {
        Ok(host) if !host.is_empty() => host,
        _ => format!("executor-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
    }
}

fn parse_var<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = env::var(name) {
        match raw.parse() {
            Ok(v) => *target = v,
            Err(_) => tracing::warn!("Config: ignoring invalid value {:?} for {}", raw, name),
        }
    }
}

fn parse_secs(name: &str, target: &mut Duration) {
    let mut secs = target.as_secs_f64();
    parse_var(name, &mut secs);
    if secs <= 0.0 {
        return;
    }
    match Duration::try_from_secs_f64(secs) {
        Ok(d) => *target = d,
        Err(e) => tracing::warn!("Config: ignoring {} for {}: {}", secs, name, e),
    }
}
