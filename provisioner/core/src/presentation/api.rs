use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

use crate::application::provisioning::{ProvisionError, ProvisionRequest, ProvisioningService};
use crate::application::status::{StatusError, StatusService};
use crate::application::validators::ValidationPipeline;
use crate::domain::backend::BackendError;
use crate::domain::instance::AgentRegistration;
use crate::domain::job::JobIdentifier;
use crate::domain::profile::Properties;

pub struct AppState {
    pub provisioning: Arc<ProvisioningService>,
    pub status: Arc<StatusService>,
    pub cluster_pipeline: ValidationPipeline,
}

pub fn app(provisioning: Arc<ProvisioningService>, status: Arc<StatusService>) -> Router {
    let state = Arc::new(AppState {
        provisioning,
        status,
        cluster_pipeline: ValidationPipeline::cluster(),
    });

    Router::new()
        .route("/health", get(health))
        .route("/api/profile/validate", post(validate_profile))
        .route("/api/cluster/validate", post(validate_cluster))
        .route("/api/agents", post(create_agent))
        .route("/api/agents/{name}", delete(delete_agent))
        .route("/api/agents/{name}/status", get(agent_status))
        .route("/api/agents/cleanup", post(cleanup_agents))
        .route("/api/status", get(cluster_status))
        .with_state(state)
}

#[derive(serde::Deserialize)]
pub struct CreateAgentRequest {
    #[serde(default)]
    pub profile_properties: Properties,
    #[serde(default)]
    pub cluster_properties: Properties,
    pub auto_register_key: Option<String>,
    pub environment: Option<String>,
    pub job_identifier: JobIdentifier,
}

#[derive(serde::Deserialize)]
pub struct CleanupRequest {
    #[serde(default)]
    pub known_agent_ids: Vec<String>,
    #[serde(default)]
    pub cluster_properties: Properties,
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn validate_profile(
    State(state): State<Arc<AppState>>,
    Json(properties): Json<Properties>,
) -> impl IntoResponse {
    Json(state.provisioning.validate_profile(&properties).await)
}

async fn validate_cluster(
    State(state): State<Arc<AppState>>,
    Json(properties): Json<Properties>,
) -> impl IntoResponse {
    Json(state.cluster_pipeline.run(&properties).await)
}

async fn create_agent(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateAgentRequest>,
) -> impl IntoResponse {
    let request = ProvisionRequest {
        profile: payload.profile_properties,
        cluster: payload.cluster_properties,
        registration: AgentRegistration {
            auto_register_key: payload.auto_register_key,
            environment: payload.environment,
        },
        job: payload.job_identifier,
    };
    match state.provisioning.provision(&request).await {
        Ok(instance) => (
            StatusCode::CREATED,
            Json(json!({ "id": instance.name, "service_id": instance.id })),
        ),
        Err(err) => provision_error_response(err),
    }
}

async fn delete_agent(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.provisioning.terminate(&name).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "deleted": name }))),
        Err(err) => backend_error_response(err),
    }
}

async fn agent_status(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.status.agent_report(&name).await {
        Ok(report) => (StatusCode::OK, Json(json!(report))),
        Err(err) => status_error_response(err),
    }
}

async fn cleanup_agents(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CleanupRequest>,
) -> impl IntoResponse {
    let settings = match state.provisioning.settings_for(&payload.cluster_properties) {
        Ok(settings) => settings,
        Err(err) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": err.to_string() })),
            )
        }
    };
    match state
        .provisioning
        .terminate_unregistered(&payload.known_agent_ids, &settings)
        .await
    {
        Ok(removed) => (StatusCode::OK, Json(json!({ "removed": removed }))),
        Err(err) => backend_error_response(err),
    }
}

async fn cluster_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.status.cluster_report().await {
        Ok(report) => (StatusCode::OK, Json(json!(report))),
        Err(err) => status_error_response(err),
    }
}

fn provision_error_response(error: ProvisionError) -> (StatusCode, Json<serde_json::Value>) {
    match error {
        ProvisionError::InvalidProfile(result) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "errors": result })),
        ),
        ProvisionError::InvalidSettings(err) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": err.to_string() })),
        ),
        ProvisionError::CapacityExceeded(err) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": err.to_string() })),
        ),
        ProvisionError::Backend(err) => backend_error_response(err),
    }
}

fn backend_error_response(error: BackendError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &error {
        BackendError::NotFound(_) => StatusCode::NOT_FOUND,
        BackendError::Rejected(_) | BackendError::UnsupportedVersion { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        BackendError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(json!({ "error": error.to_string() })))
}

fn status_error_response(error: StatusError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &error {
        StatusError::NotFound(_) => StatusCode::NOT_FOUND,
        StatusError::Backend(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(json!({ "error": error.to_string() })))
}
