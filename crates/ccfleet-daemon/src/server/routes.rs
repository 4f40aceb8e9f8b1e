//! JSON API handlers.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;

use crate::orchestration::InstanceStatus;
use crate::storage::{TaskDeletion, TaskParams, TaskType};

use super::AppState;
use super::error::ApiError;

type ApiResult<T> = Result<T, ApiError>;

// =========================================================================
// Projects and tasks
// =========================================================================

#[derive(Debug, Deserialize)]
pub struct CreateProject {
    pub id: Option<String>,
    pub name: String,
    pub working_directory: String,
    pub max_parallelism: Option<i64>,
}

/// `POST /api/projects`
pub async fn create_project(
    State(state): State<AppState>,
    Json(body): Json<CreateProject>,
) -> ApiResult<impl IntoResponse> {
    let max = body.max_parallelism.unwrap_or(state.default_max_parallelism);
    if max < 1 {
        return Err(ApiError::bad_request(format!(
            "max_parallelism must be at least 1, got {max}"
        )));
    }
    if body.name.trim().is_empty() || body.working_directory.trim().is_empty() {
        return Err(ApiError::bad_request(
            "name and working_directory must not be empty",
        ));
    }
    let id = body
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let project = state
        .db
        .create_project(&id, &body.name, &body.working_directory, max)
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// `GET /api/projects`
pub async fn list_projects(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.db.list_projects().await?))
}

/// `GET /api/projects/{id}`
pub async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.db.get_project(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateProject {
    pub max_parallelism: i64,
}

/// `PATCH /api/projects/{id}`
pub async fn update_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateProject>,
) -> ApiResult<impl IntoResponse> {
    if body.max_parallelism < 1 {
        return Err(ApiError::bad_request(format!(
            "max_parallelism must be at least 1, got {}",
            body.max_parallelism
        )));
    }
    state.db.set_max_parallelism(&id, body.max_parallelism).await?;
    Ok(Json(state.db.get_project(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateTask {
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub instruction: String,
    pub parent_task_id: Option<String>,
}

/// `POST /api/projects/{id}/tasks`
pub async fn create_task(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(body): Json<CreateTask>,
) -> ApiResult<impl IntoResponse> {
    state.db.get_project(&project_id).await?;
    if body.title.trim().is_empty() {
        return Err(ApiError::bad_request("title must not be empty"));
    }
    if let Some(parent) = &body.parent_task_id {
        let parent_task = state.db.get_task(parent).await?;
        if parent_task.project_id != project_id {
            return Err(ApiError::bad_request(format!(
                "parent task {parent} belongs to project {}",
                parent_task.project_id
            )));
        }
    }

    let id = body
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let task = state
        .db
        .create_task(&TaskParams {
            id: &id,
            project_id: &project_id,
            parent_task_id: body.parent_task_id.as_deref(),
            title: &body.title,
            description: &body.description,
            task_type: body.task_type.unwrap_or(TaskType::General).as_str(),
            priority: body.priority,
            instruction: &body.instruction,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// `GET /api/projects/{id}/tasks`
pub async fn list_tasks(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.db.get_project(&project_id).await?;
    Ok(Json(state.db.list_tasks(&project_id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ForceParam {
    #[serde(default)]
    pub force: bool,
}

/// `DELETE /api/tasks/{id}?force=`
pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ForceParam>,
) -> ApiResult<impl IntoResponse> {
    match state.db.delete_task(&id, params.force).await? {
        TaskDeletion::Deleted => Ok(StatusCode::NO_CONTENT),
        TaskDeletion::NotFound => Err(ApiError::not_found(format!("Task not found: {id}"))),
        TaskDeletion::HasChildren { count } => Err(ApiError::conflict(format!(
            "Task {id} has {count} child task(s); delete with force to remove the subtree"
        ))),
    }
}

// =========================================================================
// Scheduling
// =========================================================================

/// `POST /api/projects/{id}/analyze`
pub async fn analyze(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.scheduler().analyze(&project_id).await?))
}

/// `GET /api/projects/{id}/ready-tasks`
pub async fn ready_tasks(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state.manager.scheduler().ready_tasks(&project_id).await?,
    ))
}

/// `GET /api/projects/{id}/phases`
pub async fn list_phases(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.db.get_project(&project_id).await?;
    Ok(Json(
        state
            .manager
            .scheduler()
            .refresh_phase_status(&project_id)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct QualityGate {
    pub passed: bool,
}

/// `POST /api/projects/{id}/phases/{phase}/quality-gate`
pub async fn record_quality_gate(
    State(state): State<AppState>,
    Path((project_id, phase)): Path<(String, i64)>,
    Json(body): Json<QualityGate>,
) -> ApiResult<impl IntoResponse> {
    state
        .manager
        .scheduler()
        .record_quality_gate(&project_id, phase, body.passed)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/projects/{id}/estimate-dependencies`
pub async fn estimate_dependencies(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let added = state
        .manager
        .scheduler()
        .estimate_dependencies(&project_id)
        .await?;
    Ok(Json(json!({ "added": added })))
}

/// `POST /api/tasks/{id}/dependencies/{dep}`
pub async fn add_dependency(
    State(state): State<AppState>,
    Path((task_id, dep)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let added = state
        .manager
        .scheduler()
        .add_dependency(&task_id, &dep)
        .await?;
    let status = if added {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(json!({ "added": added }))))
}

/// `DELETE /api/tasks/{id}/dependencies/{dep}`
pub async fn remove_dependency(
    State(state): State<AppState>,
    Path((task_id, dep)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let removed = state
        .manager
        .scheduler()
        .remove_dependency(&task_id, &dep)
        .await?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!(
            "Dependency not found: {task_id} -> {dep}"
        )))
    }
}

// =========================================================================
// Instances
// =========================================================================

/// `POST /api/projects/{id}/instances`
pub async fn create_parent_instance(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let instance = state.manager.create_parent_instance(&project_id).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

#[derive(Debug, Deserialize)]
pub struct CreateChild {
    pub task_id: String,
    pub instruction: Option<String>,
}

/// `POST /api/instances/{id}/children`
pub async fn create_child_instance(
    State(state): State<AppState>,
    Path(parent_id): Path<String>,
    Json(body): Json<CreateChild>,
) -> ApiResult<impl IntoResponse> {
    let launch = state
        .manager
        .create_child_instance(&parent_id, &body.task_id, body.instruction.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(launch)))
}

/// `GET /api/instances/{id}`
pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.registry().get(&id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct InstanceFilter {
    pub project_id: Option<String>,
    pub status: Option<String>,
}

/// `GET /api/instances?project_id=&status=`
pub async fn list_instances(
    State(state): State<AppState>,
    Query(filter): Query<InstanceFilter>,
) -> ApiResult<impl IntoResponse> {
    let status = filter
        .status
        .as_deref()
        .map(str::parse::<InstanceStatus>)
        .transpose()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(
        state
            .manager
            .registry()
            .list(filter.project_id.as_deref(), status)
            .await?,
    ))
}

/// `POST /api/instances/{id}/terminate` with optional `{"force": bool}`.
pub async fn terminate_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let params: ForceParam = if body.is_empty() {
        ForceParam::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::bad_request(e.to_string()))?
    };
    Ok(Json(
        state.manager.terminate_instance(&id, params.force).await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct Progress {
    pub percent: i64,
}

/// `POST /api/instances/{id}/progress`
pub async fn report_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Progress>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.report_progress(&id, body.percent).await?))
}

/// `DELETE /api/instances/{id}`
pub async fn delete_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.manager.registry().delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
