//! Modem control API handlers

use super::ApiState;
use crate::config::DaemonConfig;
use crate::error::{PowerError, RequestOutcome};
use crate::power::controller::StatusSnapshot;
use crate::power::PowerState;
use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

/// Error payload shared by all endpoints
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub status: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl ErrorResponse {
    pub fn with_type(status: StatusCode, message: String, error_type: Option<String>) -> Self {
        Self {
            status: status.as_u16(),
            message,
            error_type,
        }
    }
}

/// Simple success payload
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SuccessResponse {
    pub message: String,
}

/// Health check payload
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Outcome of an enable/disable request
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PowerRequestResponse {
    /// `already_done` or `in_progress`
    pub status: String,
    /// Power state right after the request was accepted
    pub state: PowerState,
}

/// Online transition request body
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct OnlineRequest {
    pub online: bool,
}

fn power_error(e: PowerError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        PowerError::Removed => StatusCode::SERVICE_UNAVAILABLE,
        PowerError::NotPowered | PowerError::SelftestFailed | PowerError::OnlineBusy => {
            StatusCode::CONFLICT
        }
        PowerError::Rejected(_) | PowerError::OnlineFailed | PowerError::Transport(_) => {
            StatusCode::BAD_GATEWAY
        }
    };
    (
        status,
        Json(ErrorResponse::with_type(
            status,
            e.to_string(),
            Some("/errors/modem-power".to_string()),
        )),
    )
}

fn outcome_response(outcome: RequestOutcome, state: PowerState) -> PowerRequestResponse {
    PowerRequestResponse {
        status: match outcome {
            RequestOutcome::AlreadyDone => "already_done".to_string(),
            RequestOutcome::InProgress => "in_progress".to_string(),
        },
        state,
    }
}

/// Health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Daemon is alive", body = HealthResponse),
    ),
    tag = "health"
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Current daemon configuration
#[utoipa::path(
    get,
    path = "/api/v1/config",
    responses(
        (status = 200, description = "Daemon configuration", body = DaemonConfig),
    ),
    tag = "config"
)]
pub async fn get_config(State(state): State<Arc<ApiState>>) -> Json<DaemonConfig> {
    Json(state.config.clone())
}

/// Modem power status snapshot
#[utoipa::path(
    get,
    path = "/api/v1/modem/status",
    responses(
        (status = 200, description = "Modem power status", body = StatusSnapshot),
    ),
    tag = "modem"
)]
pub async fn modem_status(State(state): State<Arc<ApiState>>) -> Json<StatusSnapshot> {
    Json(state.power.status().await)
}

/// Request modem power-on
#[utoipa::path(
    post,
    path = "/api/v1/modem/enable",
    responses(
        (status = 200, description = "Power-on accepted", body = PowerRequestResponse),
        (status = 503, description = "Controller removed", body = ErrorResponse),
    ),
    tag = "modem"
)]
pub async fn modem_enable(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<PowerRequestResponse>, (StatusCode, Json<ErrorResponse>)> {
    let outcome = state.power.enable().await.map_err(power_error)?;
    Ok(Json(outcome_response(outcome, state.power.state())))
}

/// Request graceful modem power-off
#[utoipa::path(
    post,
    path = "/api/v1/modem/disable",
    responses(
        (status = 200, description = "Power-off accepted", body = PowerRequestResponse),
        (status = 503, description = "Controller removed", body = ErrorResponse),
    ),
    tag = "modem"
)]
pub async fn modem_disable(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<PowerRequestResponse>, (StatusCode, Json<ErrorResponse>)> {
    let outcome = state.power.disable().await.map_err(power_error)?;
    Ok(Json(outcome_response(outcome, state.power.state())))
}

/// Request the RF-active (online) or RF-inactive state
#[utoipa::path(
    post,
    path = "/api/v1/modem/online",
    request_body = OnlineRequest,
    responses(
        (status = 200, description = "Transition confirmed", body = SuccessResponse),
        (status = 409, description = "Modem not ready for the transition", body = ErrorResponse),
        (status = 502, description = "Modem rejected the transition", body = ErrorResponse),
    ),
    tag = "modem"
)]
pub async fn modem_online(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<OnlineRequest>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)> {
    state
        .power
        .set_online(request.online)
        .await
        .map_err(power_error)?;
    Ok(Json(SuccessResponse {
        message: format!(
            "modem is now {}",
            if request.online { "online" } else { "offline" }
        ),
    }))
}
