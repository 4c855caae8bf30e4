//! HTTP lease endpoint.
//!
//! `POST /newPeerLease` authenticates the caller, creates or renews the lease
//! for the supplied public key, kicks off a reconciliation pass in the
//! background and answers with the lease plus the server's static peer
//! config. `GET /healthz` is unauthenticated.

use crate::auth::{parse_bearer, TokenValidator};
use crate::error::{LeaseError, LeaseResult};
use crate::keys::WgPublicKey;
use crate::manager::{request_sync, LeaseManager};
use crate::protocol::{
    ErrorKind, ErrorResponse, LeaseRequest, LeaseResponse, ServerStaticConfig, HEALTH_PATH,
    LEASE_PATH, PUBLIC_KEY_HEADER,
};
use crate::wg::WgControl;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ipnet::Ipv4Net;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Lease service configuration.
#[derive(Debug, Clone)]
pub struct LeaseServiceConfig {
    /// Returned to every agent with its lease.
    pub server_static_config: ServerStaticConfig,
}

/// Shared handler state.
pub struct LeaseService {
    manager: Arc<LeaseManager>,
    validator: Arc<dyn TokenValidator>,
    config: LeaseServiceConfig,
}

impl LeaseService {
    pub fn new(
        manager: Arc<LeaseManager>,
        validator: Arc<dyn TokenValidator>,
        config: LeaseServiceConfig,
    ) -> Self {
        Self {
            manager,
            validator,
            config,
        }
    }

    pub fn manager(&self) -> &Arc<LeaseManager> {
        &self.manager
    }
}

/// Failure answered to an HTTP client.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorKind::BadRequest, message)
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ErrorKind::Unauthorized, message)
    }
}

impl From<LeaseError> for ApiError {
    fn from(e: LeaseError) -> Self {
        match e {
            LeaseError::AllocationFailed(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorKind::AllocationFailed,
                e.to_string(),
            ),
            LeaseError::AuthFailed(_) => Self::unauthorized(e.to_string()),
            LeaseError::Key(_) => Self::bad_request(e.to_string()),
            other => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorKind::Internal,
                other.to_string(),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse::new(self.kind, self.message))).into_response()
    }
}

/// Build the lease router.
pub fn router(service: Arc<LeaseService>) -> Router {
    Router::new()
        .route(LEASE_PATH, post(new_peer_lease))
        .route(HEALTH_PATH, get(health))
        .with_state(service)
}

async fn health() -> &'static str {
    "ok"
}

fn authenticate(validator: &dyn TokenValidator, headers: &HeaderMap) -> Result<(), ApiError> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;
    let token = parse_bearer(header).ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;
    if validator.validate(token) {
        Ok(())
    } else {
        Err(ApiError::unauthorized("Invalid bearer token"))
    }
}

/// Public key from the JSON body, or from the key header when the body is empty.
fn requested_key(headers: &HeaderMap, body: &Bytes) -> Result<WgPublicKey, ApiError> {
    if body.iter().any(|b| !b.is_ascii_whitespace()) {
        let request: LeaseRequest = serde_json::from_slice(body)
            .map_err(|e| ApiError::bad_request(format!("Invalid lease request: {}", e)))?;
        return Ok(request.public_key);
    }

    let value = headers
        .get(PUBLIC_KEY_HEADER)
        .ok_or_else(|| ApiError::bad_request("No public key in request"))?
        .to_str()
        .map_err(|_| ApiError::bad_request("Public key header is not valid text"))?;
    Ok(WgPublicKey::from_base64(value)?)
}

async fn new_peer_lease(
    State(service): State<Arc<LeaseService>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<LeaseResponse>, ApiError> {
    if let Err(e) = authenticate(service.validator.as_ref(), &headers) {
        log::warn!("Rejected lease request: {}", e.message);
        return Err(e);
    }
    let public_key = requested_key(&headers, &body)?;

    let manager = Arc::clone(&service.manager);
    let lease = tokio::task::spawn_blocking(move || manager.create_or_renew_lease(public_key))
        .await
        .map_err(|e| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorKind::Internal,
                format!("Lease task failed: {}", e),
            )
        })?
        .map_err(|e| {
            log::warn!("Lease request from {} failed: {}", public_key.short(), e);
            ApiError::from(e)
        })?;

    request_sync(&service.manager);

    Ok(Json(LeaseResponse {
        ip_address: Ipv4Net::from(lease.ip_address),
        expires_at: lease.expires_at,
        server_static_config: service.config.server_static_config.clone(),
    }))
}

/// Serve `router` on `listener` until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("Lease server listening on http://{}", addr);
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            log::info!("Lease server shutting down");
        })
        .await
}

/// The configured server key, or the one read from the device.
pub fn resolve_server_public_key(
    wg: &dyn WgControl,
    device: &str,
    configured: Option<WgPublicKey>,
) -> LeaseResult<WgPublicKey> {
    if let Some(key) = configured {
        return Ok(key);
    }
    wg.get_device(device)?.public_key.ok_or_else(|| {
        LeaseError::Config(format!(
            "Device {} has no public key; set server_peer.public_key",
            device
        ))
    })
}
