//! Operations HTTP server.

mod handlers;

use crate::config::RunMode;
use crate::dispatch::AlertDispatcher;
use crate::executor::Executor;
use crate::watcher::ExecutorWatcher;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers. Each role present in the
/// process contributes its component and its routes.
#[derive(Clone)]
pub struct AppState {
    pub run_mode: RunMode,
    pub executor: Option<Arc<Executor>>,
    pub watcher: Option<Arc<ExecutorWatcher>>,
    pub dispatcher: Option<AlertDispatcher>,
}

pub struct Server {
    port: u16,
    state: AppState,
}

impl Server {
    pub fn new(port: u16, state: AppState) -> Self {
        Self { port, state }
    }

    /// Build the router for the roles present in the state.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        let mut router = Router::new().route("/healthz", get(handlers::handle_healthz));

        if self.state.executor.is_some() {
            router = router.route("/api/runners", get(handlers::handle_get_runners));
        }
        if self.state.watcher.is_some() {
            router = router.route("/api/executors", get(handlers::handle_get_executors));
        }
        if self.state.dispatcher.is_some() {
            router = router
                .route("/api/alerts", post(handlers::handle_create_alert))
                .route("/api/alerts/{id}", delete(handlers::handle_delete_alert))
                .route("/api/alerts/{id}/update", post(handlers::handle_update_alert))
                .route("/api/alerts/{id}/histories", get(handlers::handle_get_histories))
                .route(
                    "/api/histories/{id}/comments",
                    post(handlers::handle_comment).get(handlers::handle_get_comments),
                );
        }

        router
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Serve until the task is dropped.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
