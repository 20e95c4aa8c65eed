//! HTTP transport: authentication middleware and the sync endpoints.
//!
//! - `GET /health`: health check (no auth)
//! - `GET /me`: current caller info
//! - `POST /sync/push`: apply a batch of changes
//! - `POST /sync/pull`: page the change feed from a cursor
//! - `POST /sync/resolve`: resolve an open conflict
//! - `GET /sync/conflicts`: list open conflicts for the household

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Serialize;

use meal_sync_core::conflict::Conflict;
use meal_sync_core::protocol::{
    ErrorBody, PullRequest, PushRequest, ResolveRequest, MAX_PUSH_BATCH,
};

use crate::config::{ApiKeyStore, AuthUser};
use crate::sync::{CoordinatorError, SyncCoordinator};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub api_keys: Arc<ApiKeyStore>,
    pub coordinator: Arc<SyncCoordinator>,
}

/// Auth error response.
#[derive(Serialize)]
struct AuthError {
    error: &'static str,
    message: &'static str,
}

/// Authentication middleware.
async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let api_key = match auth_header {
        Some(h) if h.starts_with("Bearer ") => &h[7..],
        Some(_) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(AuthError {
                    error: "invalid_auth",
                    message: "Authorization header must use Bearer scheme",
                }),
            )
                .into_response();
        }
        None => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(AuthError {
                    error: "missing_auth",
                    message: "Authorization header required",
                }),
            )
                .into_response();
        }
    };

    match state.api_keys.validate(api_key) {
        Some(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(AuthError {
                error: "invalid_key",
                message: "Invalid API key",
            }),
        )
            .into_response(),
    }
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            code: code.to_string(),
            message: message.into(),
        }),
    )
        .into_response()
}

fn map_error(e: CoordinatorError) -> Response {
    match e {
        CoordinatorError::BadRequest(msg) => {
            error_response(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg)
        }
        CoordinatorError::Database(e) => {
            tracing::error!("request failed: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL",
                "internal server error",
            )
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MeResponse {
    user_id: String,
    household_id: String,
}

async fn me(Extension(user): Extension<AuthUser>) -> Json<MeResponse> {
    Json(MeResponse {
        user_id: user.user_id,
        household_id: user.household_id,
    })
}

async fn sync_push(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<PushRequest>,
) -> Response {
    if req.client_id.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "clientId must not be empty",
        );
    }
    if req.changes.len() > MAX_PUSH_BATCH {
        return error_response(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            format!("at most {} changes per push", MAX_PUSH_BATCH),
        );
    }
    match state.coordinator.push(&user, req).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => map_error(e),
    }
}

async fn sync_pull(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<PullRequest>,
) -> Response {
    if req.client_id.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "clientId must not be empty",
        );
    }
    match state.coordinator.pull(&user, req).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => map_error(e),
    }
}

async fn sync_resolve(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<ResolveRequest>,
) -> Response {
    if req.client_id.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "clientId must not be empty",
        );
    }
    match state.coordinator.resolve(&user, req).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => map_error(e),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConflictsResponse {
    conflicts: Vec<Conflict>,
}

async fn list_conflicts(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Response {
    match state.coordinator.open_conflicts(&user).await {
        Ok(conflicts) => Json(ConflictsResponse { conflicts }).into_response(),
        Err(e) => map_error(e),
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/health", get(health));

    let protected_routes = Router::new()
        .route("/me", get(me))
        .route("/sync/push", post(sync_push))
        .route("/sync/pull", post(sync_pull))
        .route("/sync/resolve", post(sync_resolve))
        .route("/sync/conflicts", get(list_conflicts))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}
