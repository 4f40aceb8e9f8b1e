//! HTTP error mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::orchestration::{ManagerError, RegistryError, SchedulerError};
use crate::storage::DatabaseError;

/// An error response: status code plus a message naming the entity and
/// the violated constraint.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, message = %self.message, "Request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

const fn database_status(e: &DatabaseError) -> StatusCode {
    match e {
        DatabaseError::NotFound(_) => StatusCode::NOT_FOUND,
        DatabaseError::Conflict(_) => StatusCode::CONFLICT,
        DatabaseError::Constraint(_) => StatusCode::UNPROCESSABLE_ENTITY,
        DatabaseError::Io(_)
        | DatabaseError::Connection(_)
        | DatabaseError::Migration(_)
        | DatabaseError::Query(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        Self::new(database_status(&e), e.to_string())
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        let status = match &e {
            RegistryError::ProjectNotFound { .. }
            | RegistryError::InstanceNotFound { .. }
            | RegistryError::ParentNotFound { .. }
            | RegistryError::TaskNotFound { .. } => StatusCode::NOT_FOUND,
            RegistryError::InvalidTransition { .. }
            | RegistryError::TaskAlreadyActive { .. }
            | RegistryError::WorktreePathInUse { .. }
            | RegistryError::HasActiveChildren { .. }
            | RegistryError::ActiveInstance { .. } => StatusCode::CONFLICT,
            RegistryError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            RegistryError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            RegistryError::Database(db) => database_status(db),
            RegistryError::InvalidData(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        let status = match &e {
            SchedulerError::ProjectNotFound { .. }
            | SchedulerError::TaskNotFound { .. }
            | SchedulerError::PhaseNotFound { .. } => StatusCode::NOT_FOUND,
            SchedulerError::CyclicDependency { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            SchedulerError::Validation { .. } => StatusCode::BAD_REQUEST,
            SchedulerError::Database(db) => database_status(db),
            SchedulerError::InvalidData(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<ManagerError> for ApiError {
    fn from(e: ManagerError) -> Self {
        match e {
            ManagerError::Registry(e) => e.into(),
            ManagerError::Scheduler(e) => e.into(),
            ManagerError::Database(e) => e.into(),
            ManagerError::TaskNotReady { .. } => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
            }
            ManagerError::TaskNotStartable { .. } => Self::new(StatusCode::CONFLICT, e.to_string()),
            ManagerError::Worktree(_)
            | ManagerError::Terminal(_)
            | ManagerError::WorktreeCreationFailed { .. }
            | ManagerError::ProcessSpawnFailed { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}
