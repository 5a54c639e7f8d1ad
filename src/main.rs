//! alertfleet - distributed alert execution engine
//!
//! One binary hosts any combination of the executor, watcher and manager
//! roles, selected by `ALERT_RUN_MODE`.

mod adapter;
mod config;
mod coord;
mod db;
mod dispatch;
mod executor;
mod watcher;
mod web;

use adapter::{HttpMetricSource, HttpNotifier};
use config::{AppConfig, CoordBackend, RunMode};
use coord::{Coordinator, MemoryCoordinator, SqliteCoordinator};
use db::Store;
use dispatch::{AlertBroadcast, AlertDispatcher, AlertQueue};
use executor::{AlertReceiver, AliveReporter, BroadcastReceiver, Executor};
use watcher::ExecutorWatcher;
use web::{AppState, Server};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("alertfleet=info".parse()?))
        .init();

    // Load configuration
    let cfg = AppConfig::load();
    tracing::info!("Starting alertfleet as {} on port {}...", cfg.run_mode.as_str(), cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Store::new(&cfg.db_path)?;
    tracing::info!("Database initialized successfully");

    let coord: Arc<dyn Coordinator> = match cfg.coord_backend {
        CoordBackend::Memory => {
            if cfg.run_mode != RunMode::Standalone {
                tracing::warn!("In-memory coordination is only visible to this process");
            }
            MemoryCoordinator::new()
        }
        CoordBackend::Sqlite => Arc::new(SqliteCoordinator::new(&cfg.db_path, cfg.timings.coord_poll)?),
    };
    let queue = AlertQueue::new(coord.clone(), &cfg.topic_prefix, cfg.queue_num);
    let timings = &cfg.timings;

    let mut state = AppState {
        run_mode: cfg.run_mode,
        executor: None,
        watcher: None,
        dispatcher: None,
    };

    // Manager
    if cfg.run_mode.runs_manager() {
        let broadcast = AlertBroadcast::new(coord.clone(), timings.broadcast_lease);
        state.dispatcher = Some(AlertDispatcher::new(store.clone(), queue.clone(), broadcast));
    }

    // Watcher
    if cfg.run_mode.runs_watcher() {
        let watcher = ExecutorWatcher::new(store.clone(), queue.clone(), coord.clone(), timings.retry_delay);
        let health = watcher::HealthChecker::new(
            store.clone(),
            queue.clone(),
            watcher.clone(),
            timings.health_check,
            timings.stuck_timeout,
        );

        let running = watcher.clone();
        tokio::spawn(async move { running.run().await });
        tokio::spawn(async move { health.run().await });
        state.watcher = Some(watcher);
    }

    // Executor
    let mut reporter = None;
    if cfg.run_mode.runs_executor() {
        let metrics = Arc::new(HttpMetricSource::new(&cfg.adapter_url)?);
        let notifier = Arc::new(HttpNotifier::new(&cfg.adapter_url, &cfg.notification_url)?);
        let (executor, dirty) = Executor::new(&cfg.executor_name, store.clone(), metrics, notifier, timings);

        let alive = AliveReporter::new(executor.clone(), coord.clone(), timings.executor_lease, timings.heartbeat);
        alive.heart_boot().await?;

        AlertReceiver::new(executor.clone(), queue.clone(), cfg.max_working_alerts, timings.retry_delay).start();

        let broadcasts = BroadcastReceiver::new(executor.clone(), coord.clone(), timings.retry_delay);
        tokio::spawn(async move { broadcasts.run().await });

        let health = executor::HealthChecker::new(
            executor.clone(),
            store.clone(),
            dirty,
            timings.status_flush,
            timings.health_check,
        );
        tokio::spawn(health.run());

        tracing::info!("Executor {} is up", executor.name());
        state.executor = Some(executor);
        reporter = Some(alive);
    }

    let heartbeat = async {
        match &reporter {
            Some(alive) => alive.heartbeat().await,
            None => std::future::pending().await,
        }
    };

    // Start web server
    let server = Server::new(cfg.http_port, state.clone());

    tokio::select! {
        res = server.start() => res?,
        evicted = heartbeat => {
            tracing::error!("{}; exiting for a clean restart", evicted);
            std::process::exit(1);
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down...");
        }
    }

    if let Some(executor) = &state.executor {
        executor.stop_all().await;
    }

    Ok(())
}
