//! Lease request/response messages exchanged between agent and server.

use crate::keys::WgPublicKey;
use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};

/// Path of the lease endpoint.
pub const LEASE_PATH: &str = "/newPeerLease";

/// Path of the liveness endpoint.
pub const HEALTH_PATH: &str = "/healthz";

/// Header carrying the requester's key when the body is empty.
pub const PUBLIC_KEY_HEADER: &str = "x-wiresteward-public-key";

/// Lease request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRequest {
    pub public_key: WgPublicKey,
}

impl LeaseRequest {
    pub fn new(public_key: WgPublicKey) -> Self {
        Self { public_key }
    }
}

/// What an agent needs to configure the server as its peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStaticConfig {
    /// Server's WireGuard public key.
    pub public_key: WgPublicKey,
    /// `host:port` the agent should send WireGuard traffic to.
    pub endpoint: String,
    /// Ranges routed through the server.
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: Vec<IpNet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<u16>,
}

/// Successful lease response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseResponse {
    /// Leased address in `/32` form.
    pub ip_address: Ipv4Net,
    pub expires_at: DateTime<Utc>,
    pub server_static_config: ServerStaticConfig,
}

/// Failure categories reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    AllocationFailed,
    Internal,
}

/// Failure response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: ErrorKind,
}

impl ErrorResponse {
    pub fn new(kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_lease_response_wire_format() {
        let response = LeaseResponse {
            ip_address: "10.90.0.2/32".parse().unwrap(),
            expires_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            server_static_config: ServerStaticConfig {
                public_key: WgPublicKey([7; 32]),
                endpoint: "vpn.example.com:51820".to_string(),
                allowed_ips: vec!["10.90.0.0/24".parse().unwrap()],
                persistent_keepalive: Some(25),
            },
        };

        let json: serde_json::Value = serde_json::to_value(&response).unwrap();
        assert_eq!(json["ipAddress"], "10.90.0.2/32");
        assert_eq!(json["expiresAt"], "2026-01-01T00:00:00Z");
        assert_eq!(json["serverStaticConfig"]["endpoint"], "vpn.example.com:51820");
        assert_eq!(json["serverStaticConfig"]["allowedIPs"][0], "10.90.0.0/24");
        assert_eq!(json["serverStaticConfig"]["persistentKeepalive"], 25);
    }

    #[test]
    fn test_error_kind_wire_format() {
        let body = ErrorResponse::new(ErrorKind::AllocationFailed, "subnet full");
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(json, r#"{"error":"subnet full","kind":"allocation_failed"}"#);
    }

    #[test]
    fn test_lease_request_rejects_bad_key() {
        assert!(serde_json::from_str::<LeaseRequest>(r#"{"publicKey":"AAAA"}"#).is_err());
    }
}
