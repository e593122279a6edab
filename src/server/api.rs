//! Management API - projects, actions and module uploads
//!
//! Authentication happens upstream; the caller's identity arrives in the
//! `x-owner-id` header. Resources owned by someone else read as missing.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

use super::error::ApiError;
use super::AppState;
use crate::error::Error;
use crate::invoker::RoutePattern;
use crate::model::{validate_methods, validate_name, Action, Method, ModuleConfig, Project};
use crate::sandbox::ENTRY_POINT;

/// Header carrying the authenticated owner id
pub const OWNER_HEADER: &str = "x-owner-id";

/// Tries at finding a free subdomain for a new project
const SUBDOMAIN_ATTEMPTS: u32 = 3;

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Authenticated caller
#[derive(Debug, Clone, Copy)]
pub struct Owner(pub Uuid);

impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> ApiResult<Self> {
        parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .map(Owner)
            .ok_or_else(|| ApiError(Error::Unauthorized("missing or invalid owner id".into())))
    }
}

#[derive(Debug, Deserialize)]
pub struct ProjectBody {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ActionBody {
    pub name: String,
    pub path: String,
    pub methods: Vec<Method>,
    #[serde(default)]
    pub config: ModuleConfig,
}

#[derive(Debug, Deserialize)]
pub struct OrderBody {
    pub ids: Vec<Uuid>,
}

pub fn router(max_module_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/projects", get(list_projects).post(create_project))
        .route(
            "/projects/{project_id}",
            get(get_project).put(update_project).delete(delete_project),
        )
        .route(
            "/projects/{project_id}/actions",
            get(list_actions).post(create_action),
        )
        .route("/projects/{project_id}/actions/order", post(reorder_actions))
        .route(
            "/projects/{project_id}/actions/{action_id}",
            get(get_action).put(update_action).delete(delete_action),
        )
        .route(
            "/projects/{project_id}/actions/{action_id}/module",
            post(upload_module).layer(DefaultBodyLimit::max(max_module_bytes)),
        )
}

async fn owned_project(state: &AppState, owner: Owner, project_id: Uuid) -> ApiResult<Project> {
    match state.projects.get_by_id(project_id).await? {
        Some(project) if project.owner_id == owner.0 => Ok(project),
        _ => Err(ApiError::not_found("project")),
    }
}

async fn owned_action(
    state: &AppState,
    owner: Owner,
    project_id: Uuid,
    action_id: Uuid,
) -> ApiResult<(Project, Action)> {
    let project = owned_project(state, owner, project_id).await?;
    match state.actions.get_by_id(action_id).await? {
        Some(action) if action.project_id == project.id => Ok((project, action)),
        _ => Err(ApiError::not_found("action")),
    }
}

fn validate_action_body(body: &ActionBody) -> ApiResult<String> {
    let name = validate_name(&body.name)?;
    validate_methods(&body.methods)?;
    RoutePattern::parse(&body.path)?;
    Ok(name)
}

async fn evict(state: &AppState, action_id: Uuid) {
    if let Err(e) = state.cache.remove(action_id).await {
        warn!(action_id = %action_id, error = %e, "Failed to evict cached module");
    }
}

/// Remove the blob and compiled form of an action whose record is already gone
async fn discard_module(state: &AppState, action: &Action) {
    evict(state, action.id).await;
    if action.has_module() {
        if let Err(e) = state
            .storage
            .delete(&state.module_bucket, &action.module_path)
            .await
        {
            warn!(
                action_id = %action.id,
                path = %action.module_path,
                error = %e,
                "Failed to delete module blob"
            );
        }
    }
}

// ---- Projects ----

async fn list_projects(State(state): State<AppState>, owner: Owner) -> ApiResult<Json<Vec<Project>>> {
    Ok(Json(state.projects.get_by_owner_id(owner.0).await?))
}

async fn create_project(
    State(state): State<AppState>,
    owner: Owner,
    Json(body): Json<ProjectBody>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    let name = validate_name(&body.name)?;

    // A fresh random suffix is drawn when the subdomain is taken
    let mut attempt = 1;
    let project = loop {
        let project = Project::new(owner.0, name.clone());
        match state.projects.create(&project).await {
            Ok(()) => break project,
            Err(Error::InvalidInput(_)) if attempt < SUBDOMAIN_ATTEMPTS => attempt += 1,
            Err(e) => return Err(e.into()),
        }
    };

    info!(project_id = %project.id, subdomain = %project.subdomain, "Project created");
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<AppState>,
    owner: Owner,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<Project>> {
    Ok(Json(owned_project(&state, owner, project_id).await?))
}

async fn update_project(
    State(state): State<AppState>,
    owner: Owner,
    Path(project_id): Path<Uuid>,
    Json(body): Json<ProjectBody>,
) -> ApiResult<Json<Project>> {
    let project = owned_project(&state, owner, project_id).await?;
    let name = validate_name(&body.name)?;
    state.projects.update_name(project.id, &name).await?;

    let project = owned_project(&state, owner, project_id).await?;
    Ok(Json(project))
}

async fn delete_project(
    State(state): State<AppState>,
    owner: Owner,
    Path(project_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let project = owned_project(&state, owner, project_id).await?;
    let actions = state.actions.get_by_project_id(project.id).await?;

    state.projects.delete_by_id(project.id).await?;
    for action in &actions {
        discard_module(&state, action).await;
    }

    info!(project_id = %project.id, "Project deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ---- Actions ----

async fn list_actions(
    State(state): State<AppState>,
    owner: Owner,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Action>>> {
    let project = owned_project(&state, owner, project_id).await?;
    Ok(Json(state.actions.get_by_project_id(project.id).await?))
}

async fn create_action(
    State(state): State<AppState>,
    owner: Owner,
    Path(project_id): Path<Uuid>,
    Json(body): Json<ActionBody>,
) -> ApiResult<(StatusCode, Json<Action>)> {
    let project = owned_project(&state, owner, project_id).await?;
    let name = validate_action_body(&body)?;

    let order = state.actions.count_by_project_id(project.id).await?;
    let order = i32::try_from(order).map_err(|_| ApiError::bad_request("too many actions"))?;
    let mut action = Action::new(project.id, name, body.path, body.methods, order);
    action.config = body.config;
    state.actions.create(&action).await?;

    info!(project_id = %project.id, action_id = %action.id, "Action created");
    Ok((StatusCode::CREATED, Json(action)))
}

async fn reorder_actions(
    State(state): State<AppState>,
    owner: Owner,
    Path(project_id): Path<Uuid>,
    Json(body): Json<OrderBody>,
) -> ApiResult<Json<Vec<Action>>> {
    let project = owned_project(&state, owner, project_id).await?;
    let current: HashSet<Uuid> = state
        .actions
        .get_by_project_id(project.id)
        .await?
        .into_iter()
        .map(|a| a.id)
        .collect();
    let requested: HashSet<Uuid> = body.ids.iter().copied().collect();

    if requested.len() != body.ids.len() || requested != current {
        return Err(ApiError::bad_request(
            "ids must list every action of the project exactly once",
        ));
    }

    state.actions.update_order(&body.ids).await?;
    Ok(Json(state.actions.get_by_project_id(project.id).await?))
}

async fn get_action(
    State(state): State<AppState>,
    owner: Owner,
    Path((project_id, action_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Action>> {
    let (_, action) = owned_action(&state, owner, project_id, action_id).await?;
    Ok(Json(action))
}

async fn update_action(
    State(state): State<AppState>,
    owner: Owner,
    Path((project_id, action_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<ActionBody>,
) -> ApiResult<Json<Action>> {
    let (_, action) = owned_action(&state, owner, project_id, action_id).await?;
    let name = validate_action_body(&body)?;

    state
        .actions
        .update_info(action.id, &name, &body.path, &body.methods, &body.config)
        .await?;
    // Cached entries carry the old instance configuration
    evict(&state, action.id).await;

    let (_, action) = owned_action(&state, owner, project_id, action_id).await?;
    Ok(Json(action))
}

async fn delete_action(
    State(state): State<AppState>,
    owner: Owner,
    Path((project_id, action_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    let (_, action) = owned_action(&state, owner, project_id, action_id).await?;

    state.actions.delete_by_id(action.id).await?;
    discard_module(&state, &action).await;

    info!(project_id = %project_id, action_id = %action.id, "Action deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn upload_module(
    State(state): State<AppState>,
    owner: Owner,
    Path((project_id, action_id)): Path<(Uuid, Uuid)>,
    body: Bytes,
) -> ApiResult<Json<Action>> {
    let (project, action) = owned_action(&state, owner, project_id, action_id).await?;

    // Reject modules that would only fail later at request time
    let runtime = state.runtime.clone();
    let capabilities = state.capabilities.clone();
    let bytes = body.clone();
    let module = tokio::task::spawn_blocking(move || runtime.compile(&bytes, &capabilities))
        .await
        .map_err(|e| Error::Internal(format!("compile task failed: {}", e)))?
        .map_err(|e| ApiError::bad_request(format!("module does not compile: {}", e)))?;
    if !module.has_entry_point(ENTRY_POINT) {
        return Err(ApiError::bad_request(format!(
            "module does not export a '{}' function",
            ENTRY_POINT
        )));
    }

    let module_path = Action::module_path_for(project.owner_id, project.id, action.id);
    state
        .storage
        .upload(&state.module_bucket, &module_path, &body)
        .await?;
    // The blob is replaced in place; nothing may keep serving the old one
    evict(&state, action.id).await;
    state
        .actions
        .update_module_path(action.id, &module_path)
        .await?;

    info!(
        project_id = %project.id,
        action_id = %action.id,
        bytes = body.len(),
        "Module uploaded"
    );

    let (_, action) = owned_action(&state, owner, project_id, action_id).await?;
    Ok(Json(action))
}
