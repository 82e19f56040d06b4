//! API routing

use super::{handlers, ws, ApiState};
use axum::{
    body::Body,
    extract::Request,
    http::{header::HeaderName, HeaderValue},
    middleware::{self as axum_middleware, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::get_config,
        handlers::modem_status,
        handlers::modem_enable,
        handlers::modem_disable,
        handlers::modem_online,
    ),
    components(
        schemas(
            crate::config::DaemonConfig,
            crate::power::controller::StatusSnapshot,
            crate::power::PowerState,
            crate::power::LinkState,
            crate::gpio::HardwareVariant,
            handlers::ErrorResponse,
            handlers::SuccessResponse,
            handlers::HealthResponse,
            handlers::PowerRequestResponse,
            handlers::OnlineRequest,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "config", description = "Configuration endpoints"),
        (name = "modem", description = "Modem power control endpoints")
    ),
    info(
        title = "CMT Modem Power Control Daemon (cmtd)",
        version = "0.1.0",
        description = "REST API for the modem power lifecycle controller",
    )
)]
struct ApiDoc;

/// Accept an inbound X-Request-Id or stamp a fresh one, and echo it back.
async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(request_id.clone());
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-request-id"), value);
    }
    response
}

/// Create the API router
pub fn create_router(state: Arc<ApiState>) -> Router {
    let openapi = ApiDoc::openapi();

    Router::new()
        // Health check
        .route("/health", get(handlers::health))
        // Configuration
        .route("/api/v1/config", get(handlers::get_config))
        // Modem power control
        .route("/api/v1/modem/status", get(handlers::modem_status))
        .route("/api/v1/modem/enable", post(handlers::modem_enable))
        .route("/api/v1/modem/disable", post(handlers::modem_disable))
        .route("/api/v1/modem/online", post(handlers::modem_online))
        // WebSocket events
        .route("/events", get(ws::events_handler))
        // State
        .with_state(state)
        // Swagger UI
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi))
        // Request ID middleware
        .layer(axum_middleware::from_fn(request_id_middleware))
        // CORS for local development
        .layer(CorsLayer::permissive())
}
