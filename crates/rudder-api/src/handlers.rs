//! REST API handlers.
//!
//! Reads go straight to the state store through the scheduler; commands
//! are handed to the scheduler and answered once their effect is committed.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rudder_controller::CommandOutcome;
use rudder_core::clock::epoch_secs;
use rudder_core::config::ApplicationConfig;
use rudder_core::{Application, EvaluationRecord, ProviderError};
use rudder_planner::PlanError;
use rudder_scheduler::{SchedulerError, TriggerOutcome};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// HTTP status for a scheduler error.
fn status_of(err: &SchedulerError) -> StatusCode {
    match err {
        SchedulerError::ApplicationNotFound(_) | SchedulerError::DeploymentNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        SchedulerError::UnsupportedPlatform(_) => StatusCode::BAD_REQUEST,
        SchedulerError::RevisionUnavailable { .. } | SchedulerError::Conflict(_) => {
            StatusCode::CONFLICT
        }
        SchedulerError::Provider(ProviderError::NotFound(_)) => StatusCode::NOT_FOUND,
        SchedulerError::Provider(ProviderError::InvalidConfig(_))
        | SchedulerError::Plan(PlanError::InvalidPolicy(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        SchedulerError::Provider(ProviderError::TransientFetch(_))
        | SchedulerError::Plan(PlanError::PlatformUnavailable(_))
        | SchedulerError::ControllerUnavailable(_)
        | SchedulerError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        SchedulerError::State(_) | SchedulerError::Controller(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn scheduler_error(err: SchedulerError) -> Response {
    let status = status_of(&err);
    if status.is_server_error() {
        warn!(error = %err, %status, "request failed");
    }
    error_response(&err.to_string(), status)
}

fn command_response(outcome: CommandOutcome) -> Response {
    match outcome {
        CommandOutcome::Rejected(reason) => error_response(&reason, StatusCode::CONFLICT),
        outcome => ApiResponse::ok(outcome).into_response(),
    }
}

// ── Applications ───────────────────────────────────────────────

/// Application together with its evaluation marker.
#[derive(Serialize)]
pub struct ApplicationView {
    pub application: Application,
    pub evaluation: EvaluationRecord,
}

/// GET /api/v1/applications
pub async fn list_applications(State(state): State<ApiState>) -> Response {
    match state.scheduler.list_applications() {
        Ok(apps) => ApiResponse::ok(apps).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// POST /api/v1/applications
pub async fn register_application(
    State(state): State<ApiState>,
    Json(req): Json<ApplicationConfig>,
) -> Response {
    let app = req.to_application(epoch_secs());
    let id = app.id.clone();
    if let Err(e) = state.scheduler.register_application(app).await {
        return scheduler_error(e);
    }
    match state.scheduler.get_application(&id) {
        Ok(app) => (StatusCode::CREATED, ApiResponse::ok(app)).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// GET /api/v1/applications/{id}
pub async fn get_application(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let view = state.scheduler.get_application(&id).and_then(|application| {
        Ok(ApplicationView {
            application,
            evaluation: state.scheduler.evaluation(&id)?,
        })
    });
    match view {
        Ok(view) => ApiResponse::ok(view).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// DELETE /api/v1/applications/{id}
pub async fn remove_application(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Response {
    match state.scheduler.remove_application(&id).await {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// POST /api/v1/applications/{id}/sync
pub async fn sync_application(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.scheduler.notify_config_changed(&id).await {
        Ok(()) => (StatusCode::ACCEPTED, ApiResponse::ok("evaluation scheduled")).into_response(),
        Err(e) => scheduler_error(e),
    }
}

// ── Deployments ────────────────────────────────────────────────

/// GET /api/v1/applications/{id}/deployments
pub async fn list_deployments(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    if let Err(e) = state.scheduler.get_application(&id) {
        return scheduler_error(e);
    }
    match state.scheduler.list_deployments(&id) {
        Ok(deployments) => ApiResponse::ok(deployments).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// Trigger request body. An omitted revision means the latest one.
#[derive(Debug, Default, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub revision: Option<String>,
}

/// POST /api/v1/applications/{id}/deployments
pub async fn trigger_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<TriggerRequest>,
) -> Response {
    match state.scheduler.trigger_deployment(&id, req.revision).await {
        Ok(outcome) => {
            let status = match outcome {
                TriggerOutcome::Created { .. } => StatusCode::CREATED,
                TriggerOutcome::AlreadyActive { .. } => StatusCode::OK,
                TriggerOutcome::Queued { .. } => StatusCode::ACCEPTED,
            };
            (status, ApiResponse::ok(outcome)).into_response()
        }
        Err(e) => scheduler_error(e),
    }
}

/// GET /api/v1/deployments/{id}
pub async fn get_deployment(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.scheduler.get_deployment(&id) {
        Ok(deployment) => ApiResponse::ok(deployment).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// Approval request body.
#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub approver: String,
}

/// POST /api/v1/deployments/{id}/stages/{ordinal}/approve
pub async fn approve_stage(
    State(state): State<ApiState>,
    Path((id, ordinal)): Path<(String, u32)>,
    Json(req): Json<ApproveRequest>,
) -> Response {
    if req.approver.trim().is_empty() {
        return error_response("approver must not be empty", StatusCode::BAD_REQUEST);
    }
    match state.scheduler.approve_stage(&id, ordinal, &req.approver).await {
        Ok(outcome) => command_response(outcome),
        Err(e) => scheduler_error(e),
    }
}

/// POST /api/v1/deployments/{id}/cancel
pub async fn cancel_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Response {
    match state.scheduler.cancel_deployment(&id).await {
        Ok(outcome) => command_response(outcome),
        Err(e) => scheduler_error(e),
    }
}
