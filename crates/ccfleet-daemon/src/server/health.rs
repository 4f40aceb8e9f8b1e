//! Daemon health report.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

use crate::terminal::MultiplexerStats;

use super::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServingStatus {
    Serving,
    NotServing,
}

#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub status: ServingStatus,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: ServingStatus,
    pub version: &'static str,
    pub terminals: MultiplexerStats,
    pub components: Vec<ComponentHealth>,
}

async fn check_db(state: &AppState) -> ComponentHealth {
    match state.db.list_projects().await {
        Ok(projects) => ComponentHealth {
            name: "database",
            status: ServingStatus::Serving,
            message: format!("SQLite operational, {} project(s)", projects.len()),
        },
        Err(e) => ComponentHealth {
            name: "database",
            status: ServingStatus::NotServing,
            message: format!("Database query failed: {e}"),
        },
    }
}

/// `GET /health` — 200 while every component serves, 503 otherwise.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db = check_db(&state).await;
    let terminals = state.manager.terminals().stats().await;
    let terminal_health = ComponentHealth {
        name: "terminals",
        status: ServingStatus::Serving,
        message: format!("{} live session(s)", terminals.session_count),
    };

    let healthy = matches!(db.status, ServingStatus::Serving);
    let report = HealthReport {
        status: if healthy {
            ServingStatus::Serving
        } else {
            ServingStatus::NotServing
        },
        version: env!("CARGO_PKG_VERSION"),
        terminals,
        components: vec![db, terminal_health],
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}
