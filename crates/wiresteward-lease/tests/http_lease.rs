use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiresteward_lease::protocol::{ErrorResponse, LeaseResponse, ServerStaticConfig, PUBLIC_KEY_HEADER};
use wiresteward_lease::server::router;
use wiresteward_lease::{
    LeaseConfig, LeaseManager, LeaseService, LeaseServiceConfig, LeaseStore, ManagedSubnet,
    ManualClock, MemoryWg, StaticPeerSource, StaticTokenValidator, UnmanagedPeerPolicy,
    WgPublicKey,
};

const TOKEN: &str = "agent-token";

fn key(n: u8) -> WgPublicKey {
    WgPublicKey([n; 32])
}

fn setup(subnet: &str) -> (Router, Arc<LeaseManager>) {
    let wg = Arc::new(MemoryWg::new());
    wg.add_device("wg0", Some(key(1)), Some(51820));

    let manager = Arc::new(
        LeaseManager::new(
            LeaseConfig {
                device: "wg0".to_string(),
                subnet: ManagedSubnet::new(subnet.parse().unwrap(), None).unwrap(),
                lease_time: Duration::from_secs(12 * 3600),
                unmanaged_peers: UnmanagedPeerPolicy::Remove,
            },
            LeaseStore::new_memory(),
            wg,
            Arc::new(StaticPeerSource::empty()),
            Arc::new(ManualClock::new(Utc::now())),
        )
        .unwrap(),
    );

    let service = LeaseService::new(
        Arc::clone(&manager),
        Arc::new(StaticTokenValidator::new(vec![TOKEN.to_string()])),
        LeaseServiceConfig {
            server_static_config: ServerStaticConfig {
                public_key: key(1),
                endpoint: "vpn.example.com:51820".to_string(),
                allowed_ips: vec![subnet.parse().unwrap()],
                persistent_keepalive: Some(25),
            },
        },
    );
    (router(Arc::new(service)), manager)
}

fn lease_request(token: Option<&str>, public_key: WgPublicKey) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/newPeerLease")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder
        .body(Body::from(format!(r#"{{"publicKey":"{}"}}"#, public_key)))
        .unwrap()
}

async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_invalid_token_never_allocates() {
    let (app, manager) = setup("10.90.0.0/24");

    for token in [None, Some("wrong-token")] {
        let response = app.clone().oneshot(lease_request(token, key(10))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: ErrorResponse = body_json(response).await;
        assert_eq!(body.kind, wiresteward_lease::protocol::ErrorKind::Unauthorized);
    }

    assert!(manager.leases().is_empty());
}

#[tokio::test]
async fn test_lease_and_idempotent_renewal() {
    let (app, manager) = setup("10.90.0.0/24");

    let response = app.clone().oneshot(lease_request(Some(TOKEN), key(10))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let first: LeaseResponse = body_json(response).await;
    assert_eq!(first.ip_address.to_string(), "10.90.0.2/32");
    assert_eq!(first.server_static_config.endpoint, "vpn.example.com:51820");
    assert_eq!(first.server_static_config.public_key, key(1));

    let response = app.clone().oneshot(lease_request(Some(TOKEN), key(10))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let second: LeaseResponse = body_json(response).await;
    assert_eq!(second.ip_address, first.ip_address);
    assert!(second.expires_at >= first.expires_at);
    assert_eq!(manager.leases().len(), 1);
}

#[tokio::test]
async fn test_public_key_header() {
    let (app, _manager) = setup("10.90.0.0/24");

    let request = Request::builder()
        .method("POST")
        .uri("/newPeerLease")
        .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
        .header(PUBLIC_KEY_HEADER, key(11).to_base64())
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_malformed_key_is_bad_request() {
    let (app, manager) = setup("10.90.0.0/24");

    let request = Request::builder()
        .method("POST")
        .uri("/newPeerLease")
        .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
        .body(Body::from(r#"{"publicKey":"AAAA"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(manager.leases().is_empty());
}

#[tokio::test]
async fn test_exhausted_subnet_is_server_error() {
    // One leasable host.
    let (app, _manager) = setup("10.90.0.0/30");

    let response = app.clone().oneshot(lease_request(Some(TOKEN), key(10))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(lease_request(Some(TOKEN), key(11))).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: ErrorResponse = body_json(response).await;
    assert_eq!(body.kind, wiresteward_lease::protocol::ErrorKind::AllocationFailed);
}

#[tokio::test]
async fn test_healthz_is_public() {
    let (app, _manager) = setup("10.90.0.0/24");
    let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
