//! HTTP API
//!
//! JSON control surface over the lifecycle manager. All responses go
//! through `PeerView`/`InterfaceRecord` serialization, which never emits
//! key material.

use crate::lifecycle::{EnrollRequest, PeerLifecycleManager};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;
use wgplane_common::{Error, InterfaceRecord, PeerView};

pub struct AppState {
    pub lifecycle: PeerLifecycleManager,
}

// ============================================================================
// Error mapping
// ============================================================================

/// Wrapper giving domain errors an HTTP status. Enrollment apply failures
/// never reach this path; they degrade to an apply-pending success inside
/// the lifecycle manager.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict { .. } | Error::InterfaceDecommissioned(_) => StatusCode::CONFLICT,
            Error::InvalidKey(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::AddressPoolExhausted { .. } => StatusCode::CONFLICT,
            Error::ToolUnavailable(_) | Error::CacheUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::ApplyFailed { .. } | Error::Timeout { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateInterfaceRequest {
    name: String,
    #[serde(default = "default_listen_port")]
    listen_port: u16,
    address_block: String,
    endpoint: Option<String>,
    dns: Option<String>,
}

fn default_listen_port() -> u16 {
    51820
}

#[derive(Debug, Deserialize)]
struct EnrollPeerRequest {
    name: String,
    public_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route(
            "/v1/interfaces",
            get(list_interfaces_handler).post(create_interface_handler),
        )
        .route(
            "/v1/interfaces/:id",
            get(get_interface_handler).delete(decommission_interface_handler),
        )
        .route(
            "/v1/interfaces/:id/peers",
            get(list_peers_handler).post(enroll_peer_handler),
        )
        .route(
            "/v1/peers/:id",
            get(get_peer_handler).delete(revoke_peer_handler),
        )
        .route("/v1/peers/:id/config", get(peer_config_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: wgplane_common::VERSION,
    })
}

async fn create_interface_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateInterfaceRequest>,
) -> ApiResult<(StatusCode, Json<InterfaceRecord>)> {
    let record = state.lifecycle.create_interface(
        req.name,
        req.listen_port,
        req.address_block,
        req.endpoint,
        req.dns,
    )?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_interfaces_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<InterfaceRecord>>> {
    Ok(Json(state.lifecycle.store().list_interfaces()?))
}

async fn get_interface_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<InterfaceRecord>> {
    let record = state
        .lifecycle
        .store()
        .get_interface(id)?
        .ok_or_else(|| Error::not_found("interface", &id.to_string()))?;
    Ok(Json(record))
}

async fn decommission_interface_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.lifecycle.store().decommission_interface(id)?;
    info!("Interface {} decommissioned via API", id);
    Ok(StatusCode::NO_CONTENT)
}

async fn enroll_peer_handler(
    State(state): State<Arc<AppState>>,
    Path(interface_id): Path<Uuid>,
    Json(req): Json<EnrollPeerRequest>,
) -> ApiResult<Response> {
    let outcome = state
        .lifecycle
        .enroll(
            interface_id,
            EnrollRequest {
                name: req.name,
                public_key: req.public_key,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)).into_response())
}

async fn list_peers_handler(
    State(state): State<Arc<AppState>>,
    Path(interface_id): Path<Uuid>,
) -> ApiResult<Json<Vec<PeerView>>> {
    Ok(Json(state.lifecycle.list_peers(interface_id).await?))
}

async fn get_peer_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let detail = state.lifecycle.get_peer(id).await?;
    Ok(Json(detail).into_response())
}

async fn revoke_peer_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PeerView>> {
    Ok(Json(state.lifecycle.revoke(id).await?))
}

async fn peer_config_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let config = state.lifecycle.client_config(id)?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"wg-peer.conf\"",
            ),
        ],
        config,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::driver::fake::FakeDriver;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use wgplane_common::{ConfigStore, MemoryCache};

    fn test_router() -> Router {
        let store = ConfigStore::open_memory().unwrap();
        let driver = Arc::new(FakeDriver::new());
        let cache = Arc::new(MemoryCache::new());
        let lifecycle =
            PeerLifecycleManager::new(store, cache, driver, DaemonConfig::default());
        router(Arc::new(AppState { lifecycle }))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = test_router()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_interface_then_peer_flow() {
        let app = test_router();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/interfaces",
                serde_json::json!({
                    "name": "wg0",
                    "address_block": "10.8.0.0/24",
                    "endpoint": "vpn.example.com"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let iface = body_json(response).await;
        // Interface private key must never appear on the wire
        assert!(iface.get("private_key_encrypted").is_none());
        let iface_id = iface["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/v1/interfaces/{}/peers", iface_id),
                serde_json::json!({ "name": "laptop" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let peer = body_json(response).await;
        assert_eq!(peer["status"], "active");
        assert!(peer["client_config"]
            .as_str()
            .unwrap()
            .contains("[Interface]"));
        assert!(peer.get("private_key_encrypted").is_none());
        let peer_id = peer["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/v1/interfaces/{}/peers", iface_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/v1/peers/{}/config", peer_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                Request::delete(format!("/v1/peers/{}", peer_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "revoked");

        let response = app
            .oneshot(
                Request::get(format!("/v1/interfaces/{}/peers", iface_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(body_json(response).await.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_key_conflict() {
        let app = test_router();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/interfaces",
                serde_json::json!({ "name": "wg0", "address_block": "10.8.0.0/24" }),
            ))
            .await
            .unwrap();
        let iface_id = body_json(response).await["id"].as_str().unwrap().to_string();

        let kp = wgplane_common::wg::generate_keypair();
        let enroll = serde_json::json!({ "name": "dev", "public_key": kp.public_key });

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/v1/interfaces/{}/peers", iface_id),
                enroll.clone(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(json_request(
                "POST",
                &format!("/v1/interfaces/{}/peers", iface_id),
                enroll,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_bad_key_rejected() {
        let app = test_router();
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/interfaces",
                serde_json::json!({ "name": "wg0", "address_block": "10.8.0.0/24" }),
            ))
            .await
            .unwrap();
        let iface_id = body_json(response).await["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(json_request(
                "POST",
                &format!("/v1/interfaces/{}/peers", iface_id),
                serde_json::json!({ "name": "bad", "public_key": "not a key" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_404() {
        let app = test_router();
        let missing = Uuid::new_v4();

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/v1/peers/{}", missing))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(json_request(
                "POST",
                &format!("/v1/interfaces/{}/peers", missing),
                serde_json::json!({ "name": "ghost" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_decommissioned_interface_conflicts() {
        let app = test_router();
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/interfaces",
                serde_json::json!({ "name": "wg0", "address_block": "10.8.0.0/24" }),
            ))
            .await
            .unwrap();
        let iface_id = body_json(response).await["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::delete(format!("/v1/interfaces/{}", iface_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(json_request(
                "POST",
                &format!("/v1/interfaces/{}/peers", iface_id),
                serde_json::json!({ "name": "late" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
