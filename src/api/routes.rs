use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post, patch},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::api::handlers::{auth, instances, internal, ops};
use crate::api::{state::AppState, websocket::websocket_handler};

const REQUEST_ID_HEADER: &str = "x-request-id";

fn build_cors_layer() -> CorsLayer {
    let mut origins: Vec<HeaderValue> = std::env::var("TUNNELHUB_CORS_ALLOWED_ORIGINS")
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .filter_map(|v| HeaderValue::from_str(v).ok())
                .collect()
        })
        .unwrap_or_default();

    if origins.is_empty() {
        origins.push(HeaderValue::from_static("http://localhost:5173"));
        origins.push(HeaderValue::from_static("http://127.0.0.1:5173"));
    }

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-internal-api-key"),
        ])
}

/// Wires the `/api/v1` surface (§6) plus the unauthenticated ops `/health`
/// probe and the `/ws` event stream upgrade.
/// Every response, success or error, carries the `x-request-id` the caller
/// sent (or one generated here) so `ErrorBody.requestId` (§7) can be
/// correlated back to an access log line.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer();
    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);

    let auth_routes = Router::new()
        .route("/auth/signup", post(auth::signup))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/logout-all", post(auth::logout_all))
        .route("/auth/me", get(auth::me));

    let instance_routes = Router::new()
        .route("/instances", get(instances::list).post(instances::create))
        .route("/instances/:id", patch(instances::rename).delete(instances::delete))
        .route("/instances/:id/heartbeat", post(instances::heartbeat))
        .route("/instances/:id/connect", post(instances::connect))
        .route("/instances/:id/disconnect", post(instances::disconnect))
        .route("/instances/:id/status-history", get(instances::status_history))
        .route("/instances/:id/health", get(instances::health));

    let internal_routes = Router::new()
        .route("/internal/validate-key", post(internal::validate_key))
        .route("/internal/instances/:id/tunnel-connected", post(internal::tunnel_connected))
        .route("/internal/instances/:id/tunnel-disconnected", post(internal::tunnel_disconnected));

    Router::new()
        .route("/health", get(ops::health))
        .route("/health/metrics", get(ops::metrics))
        .route("/ws", get(websocket_handler))
        .nest("/api/v1", auth_routes.merge(instance_routes).merge(internal_routes))
        .with_state(state)
        .layer(cors)
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
}
