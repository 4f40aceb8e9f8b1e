//! HTTP and WebSocket operator surface.
//!
//! JSON routes under `/api`, duplex terminals on `/ws/terminal`, the fleet
//! event stream on `/ws/events`, and `/health`.

mod error;
mod health;
mod routes;
mod ws;

pub use error::ApiError;
pub use ws::{TerminalIn, TerminalOut};

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::orchestration::InstanceManager;
use crate::storage::Database;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<InstanceManager>,
    pub db: Database,
    /// Quota for projects created without an explicit limit.
    pub default_max_parallelism: i64,
    /// Working directory of operator terminals that name none.
    pub terminal_root: PathBuf,
}

/// Build the daemon router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route(
            "/api/projects",
            post(routes::create_project).get(routes::list_projects),
        )
        .route(
            "/api/projects/{id}",
            get(routes::get_project).patch(routes::update_project),
        )
        .route(
            "/api/projects/{id}/tasks",
            post(routes::create_task).get(routes::list_tasks),
        )
        .route(
            "/api/projects/{id}/instances",
            post(routes::create_parent_instance),
        )
        .route("/api/projects/{id}/analyze", post(routes::analyze))
        .route("/api/projects/{id}/ready-tasks", get(routes::ready_tasks))
        .route("/api/projects/{id}/phases", get(routes::list_phases))
        .route(
            "/api/projects/{id}/phases/{phase}/quality-gate",
            post(routes::record_quality_gate),
        )
        .route(
            "/api/projects/{id}/estimate-dependencies",
            post(routes::estimate_dependencies),
        )
        .route("/api/tasks/{id}", delete(routes::delete_task))
        .route(
            "/api/tasks/{id}/dependencies/{dep}",
            post(routes::add_dependency).delete(routes::remove_dependency),
        )
        .route("/api/instances", get(routes::list_instances))
        .route(
            "/api/instances/{id}",
            get(routes::get_instance).delete(routes::delete_instance),
        )
        .route(
            "/api/instances/{id}/children",
            post(routes::create_child_instance),
        )
        .route(
            "/api/instances/{id}/terminate",
            post(routes::terminate_instance),
        )
        .route("/api/instances/{id}/progress", post(routes::report_progress))
        .route("/ws/terminal", get(ws::terminal_upgrade))
        .route("/ws/events", get(ws::events_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
