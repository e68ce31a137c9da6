// REST API for the fleet registry and the kill handshake

pub mod error;
pub mod resolve;
pub mod workers;

#[cfg(test)]
mod integration_tests;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
};
use http::{StatusCode, header};
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{API_KEY_HEADER, ApiKeyAuth};
use crate::cancel::CancellationDispatcher;
use crate::error::FleetError;
use crate::fleet::Fleet;

#[derive(Clone)]
pub struct AppState {
    pub fleet: Arc<Fleet>,
    pub dispatcher: Arc<CancellationDispatcher>,
    pub auth: Arc<ApiKeyAuth>,
}

pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/workers", post(workers::register).get(workers::list))
        .route("/workers/{worker}", get(workers::get_worker))
        .route("/workers/{worker}/health", get(workers::health))
        .route("/workers/{worker}/heartbeat", post(workers::heartbeat))
        .route(
            "/workers/{worker}/executors",
            get(workers::list_executors).post(workers::assign),
        )
        .route("/workers/{worker}/{org}/{repo}/{build}", delete(workers::kill))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health_check() -> Result<Json<Value>, StatusCode> {
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let headers = req.headers();
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let api_key = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());

    if !state.auth.verify(authorization, api_key) {
        return FleetError::Unauthorized.into_response();
    }
    next.run(req).await
}
