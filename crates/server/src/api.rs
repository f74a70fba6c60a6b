//! # HTTP API
//!
//! Route handlers and the OpenAPI document. Turns stream as server-sent
//! events, one event per relay frame.

use std::convert::Infallible;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use kiln_core::agent::{PlanRequest, TurnError, TurnRequest};
use kiln_core::models::catalogue;
use kiln_core::state::is_unique_violation;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::{OpenApi, ToSchema};

use crate::SharedState;

// === Request / Response Types ===

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentRequest {
    /// Must be a non-empty string
    prompt: Option<Value>,
    #[serde(rename = "projectId")]
    project_id: String,
    /// Owner's email
    owner: String,
    terminal: Option<Value>,
    model: Option<String>,
    memory: Option<Value>,
    css_lib: Option<String>,
    framework: Option<String>,
    /// Reference image URLs
    images: Vec<Value>,
    fix: bool,
}

impl AgentRequest {
    fn into_turn(self) -> Result<TurnRequest, &'static str> {
        let prompt = match self.prompt {
            Some(Value::String(prompt)) if !prompt.trim().is_empty() => prompt,
            _ => return Err("Prompt is required and must be a string"),
        };
        Ok(TurnRequest {
            prompt,
            project_key: self.project_id,
            owner: self.owner,
            terminal: self.terminal,
            model: self.model,
            memory: self.memory,
            css_lib: self.css_lib,
            framework: self.framework,
            images: self.images,
            fix: self.fix,
        })
    }
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanApiRequest {
    input: String,
    /// Project to attach a clone screenshot to
    #[serde(rename = "projectId")]
    project_id: Option<String>,
    images: Vec<Value>,
    memory: Option<String>,
    css_library: Option<String>,
    framework: Option<String>,
    model: Option<String>,
}

impl From<PlanApiRequest> for PlanRequest {
    fn from(req: PlanApiRequest) -> Self {
        PlanRequest {
            input: req.input,
            images: req.images,
            memory: req.memory,
            css_library: req.css_library,
            framework: req.framework,
            model: req.model,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct PlanResponse {
    success: bool,
    title: String,
    message: String,
    plan: String,
    url: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    #[serde(rename = "projectId")]
    project_id: String,
    email: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SaveProjectRequest {
    #[serde(rename = "projectId")]
    project_id: String,
    owner: String,
    /// Whole project file map
    data: Value,
}

#[derive(Deserialize, ToSchema)]
pub struct CreateProjectRequest {
    email: String,
    #[serde(default)]
    name: Option<String>,
    /// Public project key
    key: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct ProjectResponse {
    success: bool,
    id: String,
    key: String,
    title: String,
}

#[derive(Serialize, ToSchema)]
pub struct ApiResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
}

impl ApiResponse {
    fn new(success: bool, message: impl Into<String>) -> Self {
        Self {
            success,
            message: message.into(),
            url: None,
        }
    }
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    name: String,
    provider: String,
    supports_tools: bool,
    fallback_eligible: bool,
}

// === OpenAPI Definition ===

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Kiln API",
        version = "1.0.0",
        description = "Conversational app generation: turns, plans, bundles and builds"
    ),
    paths(run_agent, create_plan, request_build, save_project, create_project, list_models),
    components(schemas(
        AgentRequest,
        PlanApiRequest,
        PlanResponse,
        BuildRequest,
        SaveProjectRequest,
        CreateProjectRequest,
        ProjectResponse,
        ApiResponse,
        ModelInfo
    )),
    tags(
        (name = "agent", description = "Conversational turns and planning"),
        (name = "projects", description = "Project bundles and builds"),
        (name = "models", description = "Model catalogue")
    )
)]
pub struct ApiDoc;

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/api/agent", post(run_agent))
        .route("/api/plan", post(create_plan))
        .route("/api/build", post(request_build))
        .route("/api/projects", post(create_project))
        .route("/api/projects/save", post(save_project))
        .route("/api/v1/models", get(list_models))
        .route("/api/v1/openapi.json", get(serve_openapi))
}

// === Handlers ===

fn server_error(e: &TurnError) -> Response {
    tracing::error!("Request failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::new(false, "Server error. Please try again later.")),
    )
        .into_response()
}

/// Run one conversational turn
#[utoipa::path(
    post,
    path = "/api/agent",
    tag = "agent",
    request_body = AgentRequest,
    responses(
        (status = 200, description = "Turn frames as text/event-stream, ending with [DONE]"),
        (status = 400, description = "Missing or invalid prompt")
    )
)]
async fn run_agent(State(state): State<SharedState>, Json(req): Json<AgentRequest>) -> Response {
    let request = match req.into_turn() {
        Ok(request) => request,
        Err(message) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response();
        }
    };

    let frames = state
        .service
        .start_turn(request)
        .map(|frame| Ok::<_, Infallible>(Event::default().data(frame.lines())));

    Sse::new(frames).keep_alive(KeepAlive::default()).into_response()
}

/// Draft a development plan
#[utoipa::path(
    post,
    path = "/api/plan",
    tag = "agent",
    request_body = PlanApiRequest,
    responses(
        (status = 200, description = "Plan draft", body = PlanResponse)
    )
)]
async fn create_plan(State(state): State<SharedState>, Json(mut req): Json<PlanApiRequest>) -> Json<PlanResponse> {
    let project_id = req.project_id.take();
    let draft = state.planner.create_plan(&req.into()).await;

    if let (Some(key), Some(url)) = (project_id, draft.screenshot_url.as_deref()) {
        if let Err(e) = state.service.remember_clone_screenshot(&key, url).await {
            tracing::warn!("Could not attach clone screenshot to {}: {}", key, e);
        }
    }

    Json(PlanResponse {
        success: true,
        title: draft.title,
        message: draft.message,
        plan: draft.plan,
        url: draft.url,
    })
}

/// Queue a build of the project's current bundle
#[utoipa::path(
    post,
    path = "/api/build",
    tag = "projects",
    request_body = BuildRequest,
    responses(
        (status = 200, description = "Build queued", body = ApiResponse),
        (status = 201, description = "A build for this project is already in flight", body = ApiResponse),
        (status = 400, description = "Unknown user or project, or no bundle yet", body = ApiResponse)
    )
)]
async fn request_build(State(state): State<SharedState>, Json(req): Json<BuildRequest>) -> Response {
    match state
        .service
        .request_build(&state.queue, &req.project_id, &req.email)
        .await
    {
        Ok(enqueued) if enqueued.existing => (
            StatusCode::CREATED,
            Json(ApiResponse::new(true, "Already building!")),
        )
            .into_response(),
        Ok(_) => (
            StatusCode::OK,
            Json(ApiResponse::new(true, "Build queued successfully")),
        )
            .into_response(),
        Err(e) if e.is_missing() => (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::new(false, "User or Project or Project url not found!")),
        )
            .into_response(),
        Err(e) => server_error(&e),
    }
}

/// Save a project's bundle
#[utoipa::path(
    post,
    path = "/api/projects/save",
    tag = "projects",
    request_body = SaveProjectRequest,
    responses(
        (status = 200, description = "Bundle saved", body = ApiResponse),
        (status = 404, description = "Unknown user or project", body = ApiResponse)
    )
)]
async fn save_project(State(state): State<SharedState>, Json(req): Json<SaveProjectRequest>) -> Response {
    match state
        .service
        .save_bundle(&req.project_id, &req.owner, &req.data)
        .await
    {
        Ok(url) => {
            let mut body = ApiResponse::new(true, "Project saved successfully");
            body.url = Some(url);
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) if e.is_missing() => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::new(false, "User or project not found!")),
        )
            .into_response(),
        Err(e) => server_error(&e),
    }
}

/// Create a project, registering its owner on first use
#[utoipa::path(
    post,
    path = "/api/projects",
    tag = "projects",
    request_body = CreateProjectRequest,
    responses(
        (status = 201, description = "Project created", body = ProjectResponse),
        (status = 409, description = "Project key already taken", body = ApiResponse),
        (status = 500, description = "Storage failure", body = ApiResponse)
    )
)]
async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<CreateProjectRequest>,
) -> Response {
    let name = req.name.as_deref().unwrap_or(&req.email);
    let title = req.title.as_deref().unwrap_or("New Project");

    let created = state
        .store
        .ensure_user(&req.email, name)
        .and_then(|owner| state.store.create_project(&req.key, &owner.id, title));
    match created {
        Ok(project) => (
            StatusCode::CREATED,
            Json(ProjectResponse {
                success: true,
                id: project.id,
                key: project.key,
                title: project.title,
            }),
        )
            .into_response(),
        Err(e) => {
            let (status, message) = create_failure(&e);
            if status == StatusCode::CONFLICT {
                tracing::warn!("Project key {} already taken", req.key);
            } else {
                tracing::error!("Could not create project {}: {:#}", req.key, e);
            }
            (status, Json(ApiResponse::new(false, message))).into_response()
        }
    }
}

/// Only a taken key is the caller's fault.
fn create_failure(e: &anyhow::Error) -> (StatusCode, &'static str) {
    if is_unique_violation(e) {
        (StatusCode::CONFLICT, "Project key already taken")
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Server error. Please try again later.",
        )
    }
}

/// List the model catalogue
#[utoipa::path(
    get,
    path = "/api/v1/models",
    tag = "models",
    responses(
        (status = 200, description = "Available models", body = Vec<ModelInfo>)
    )
)]
async fn list_models() -> Json<Vec<ModelInfo>> {
    let models = catalogue()
        .into_iter()
        .map(|model| ModelInfo {
            provider: model.provider.display_name().to_string(),
            name: model.name,
            supports_tools: model.supports_tools,
            fallback_eligible: model.fallback_eligible,
        })
        .collect();
    Json(models)
}

async fn serve_openapi() -> Response {
    match ApiDoc::openapi().to_json() {
        Ok(spec) => ([(header::CONTENT_TYPE, "application/json")], spec).into_response(),
        Err(e) => {
            tracing::error!("Failed to render OpenAPI document: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
