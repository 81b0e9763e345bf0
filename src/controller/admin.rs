//! Admin HTTP API.
//!
//! A thin axum wrapper over the token store and the presence registries:
//! mint bootstrap tokens, list connectors/tunnelers with presence, and a
//! service-to-service token consumption hook. Admin routes require the
//! configured bearer token; the internal route uses its own shared secret.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::controller::ControllerState;
use crate::errors::{Error, TrustplaneError};

/// API-layer error with its HTTP mapping: 401 for credential failures, 400
/// for validation, 500 for everything else.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };
        (status, Json(ErrorBody { error, message })).into_response()
    }
}

impl From<TrustplaneError> for ApiError {
    fn from(err: TrustplaneError) -> Self {
        match err {
            TrustplaneError::Auth { .. } => ApiError::Unauthorized(err.to_string()),
            TrustplaneError::Validation { .. } => ApiError::BadRequest(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
struct TokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct ConnectorView {
    id: String,
    status: String,
    private_ip: String,
    last_seen: String,
    version: String,
}

#[derive(Serialize)]
struct TunnelerView {
    id: String,
    status: String,
    connector_id: String,
    last_seen: String,
}

#[derive(Deserialize)]
struct ConsumeTokenRequest {
    token: String,
    id: String,
}

#[derive(Serialize)]
struct ConsumeTokenResponse {
    status: &'static str,
}

pub fn build_router(state: Arc<ControllerState>) -> Router {
    Router::new()
        .route("/api/admin/tokens", post(create_token))
        .route("/api/admin/connectors", get(list_connectors))
        .route("/api/admin/tunnelers", get(list_tunnelers))
        .route("/api/internal/consume-token", post(consume_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin API until `cancel` fires.
pub async fn start_admin_server(
    state: Arc<ControllerState>,
    cancel: CancellationToken,
) -> crate::Result<()> {
    let addr: SocketAddr = state
        .admin_bind_address
        .parse()
        .map_err(|e| Error::config(format!("Invalid admin API address: {}", e)))?;

    let router = build_router(state);

    info!(address = %addr, "Starting admin HTTP API");

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::transport(format!("Failed to bind admin API server: {}", e)))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| Error::transport(format!("Admin API server error: {}", e)))?;

    info!("Admin API server shutdown completed");
    Ok(())
}

fn require_bearer(headers: &HeaderMap, expected: &str) -> Result<(), ApiError> {
    let provided = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;
    if provided != expected {
        return Err(ApiError::Unauthorized("invalid bearer token".to_string()));
    }
    Ok(())
}

async fn create_token(
    State(state): State<Arc<ControllerState>>,
    headers: HeaderMap,
) -> Result<Json<TokenResponse>, ApiError> {
    require_bearer(&headers, &state.admin_token)?;
    let (token, expires_at) = state.token_store()?.create()?;
    info!(expires_at = %expires_at, "enrollment token minted");
    Ok(Json(TokenResponse { token, expires_at }))
}

async fn list_connectors(
    State(state): State<Arc<ControllerState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConnectorView>>, ApiError> {
    require_bearer(&headers, &state.admin_token)?;
    let now = Utc::now();
    let views = state
        .connectors
        .list()
        .into_iter()
        .map(|record| ConnectorView {
            status: record.status_at(now).to_string(),
            last_seen: humanize_since(record.last_seen, now),
            id: record.id,
            private_ip: record.private_ip,
            version: record.version,
        })
        .collect();
    Ok(Json(views))
}

async fn list_tunnelers(
    State(state): State<Arc<ControllerState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<TunnelerView>>, ApiError> {
    require_bearer(&headers, &state.admin_token)?;
    let now = Utc::now();
    let views = state
        .tunnelers
        .list()
        .into_iter()
        .map(|record| TunnelerView {
            status: record.status_at(now).to_string(),
            last_seen: humanize_since(record.last_seen, now),
            id: record.id,
            connector_id: record.connector_id,
        })
        .collect();
    Ok(Json(views))
}

async fn consume_token(
    State(state): State<Arc<ControllerState>>,
    headers: HeaderMap,
    Json(body): Json<ConsumeTokenRequest>,
) -> Result<Json<ConsumeTokenResponse>, ApiError> {
    let provided = headers
        .get("x-internal-token")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing internal token".to_string()))?;
    if provided != state.internal_token {
        return Err(ApiError::Unauthorized("invalid internal token".to_string()));
    }
    if body.id.trim().is_empty() {
        return Err(ApiError::BadRequest("id must not be empty".to_string()));
    }

    state.token_store()?.consume(&body.token, &body.id)?;
    Ok(Json(ConsumeTokenResponse { status: "ok" }))
}

/// Human-friendly relative age, e.g. "8s ago" or "3m ago".
fn humanize_since(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = now.signed_duration_since(then).num_seconds().max(0);
    match secs {
        0..=59 => format!("{}s ago", secs),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::test_state;
    use axum::body::Body;
    use chrono::TimeZone;
    use http::Request;
    use tower::ServiceExt;

    const ADMIN_TOKEN: &str = "unit-test-admin-token";

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn humanize_buckets() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let at = |secs: i64| now - chrono::Duration::seconds(secs);
        assert_eq!(humanize_since(at(5), now), "5s ago");
        assert_eq!(humanize_since(at(90), now), "1m ago");
        assert_eq!(humanize_since(at(7200), now), "2h ago");
        assert_eq!(humanize_since(at(200_000), now), "2d ago");
    }

    #[tokio::test]
    async fn token_mint_requires_bearer() {
        let router = build_router(test_state());

        let response = router
            .clone()
            .oneshot(
                Request::post("/api/admin/tokens").body(Body::empty()).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .oneshot(
                Request::post("/api/admin/tokens")
                    .header("authorization", format!("Bearer {}", ADMIN_TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["token"].as_str().unwrap().len(), 32);
        assert!(body["expires_at"].is_string());
    }

    #[tokio::test]
    async fn connector_listing_reports_presence() {
        let state = test_state();
        state.connectors.record_heartbeat("c1", Some("10.0.0.5"));
        let router = build_router(state);

        let response = router
            .oneshot(
                Request::get("/api/admin/connectors")
                    .header("authorization", format!("Bearer {}", ADMIN_TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body[0]["id"], "c1");
        assert_eq!(body[0]["status"], "ONLINE");
        assert_eq!(body[0]["private_ip"], "10.0.0.5");
    }

    #[tokio::test]
    async fn internal_consume_token_round_trip() {
        let state = test_state();
        let (token, _) = state.token_store().unwrap().create().unwrap();
        let router = build_router(state);

        let request = |token: &str| {
            Request::post("/api/internal/consume-token")
                .header("x-internal-token", ADMIN_TOKEN)
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({ "token": token, "id": "c1" }).to_string(),
                ))
                .unwrap()
        };

        let response = router.clone().oneshot(request(&token)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");

        // Single-use: the second consume maps to 401.
        let response = router.oneshot(request(&token)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn internal_consume_token_requires_secret() {
        let router = build_router(test_state());
        let response = router
            .oneshot(
                Request::post("/api/internal/consume-token")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"token":"x","id":"c1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
