//! Agent side: request leases and apply them to local devices.
//!
//! Each (device, lease server) pair runs its own loop. A loop requests a
//! lease, moves the device address to the leased one, configures the server
//! as a WireGuard peer and sleeps until half of the remaining lifetime has
//! passed. Failures are logged and retried without touching what was
//! already applied.

use crate::auth::TokenSource;
use crate::clock::Clock;
use crate::error::{LeaseError, LeaseResult};
use crate::keys::WgPublicKey;
use crate::protocol::{ErrorResponse, LeaseRequest, LeaseResponse, LEASE_PATH};
use crate::wg::{PeerUpdate, WgControl};
use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv4Net};
use reqwest::Url;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Shortest wait between two lease requests.
const MIN_DELAY: Duration = Duration::from_secs(1);

/// A local WireGuard device and the lease servers it peers with.
#[derive(Debug, Clone)]
pub struct AgentDevice {
    pub name: String,
    pub servers: Vec<Url>,
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub devices: Vec<AgentDevice>,
    /// Bound on token acquisition and on each lease request.
    pub request_timeout: Duration,
    /// Wait after a failed request.
    pub retry_interval: Duration,
}

/// Delay until the next renewal: half of the remaining lifetime.
pub fn renewal_delay(now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Duration {
    let remaining = (expires_at - now).to_std().unwrap_or(Duration::ZERO);
    (remaining / 2).max(MIN_DELAY)
}

/// Delay after a failed request.
///
/// While an applied lease is still valid the retry happens no later than
/// its half-life, so one more attempt fits before it expires.
pub fn retry_delay(
    now: DateTime<Utc>,
    current_expiry: Option<DateTime<Utc>>,
    retry_interval: Duration,
) -> Duration {
    let delay = match current_expiry {
        Some(expires_at) if expires_at > now => retry_interval.min(renewal_delay(now, expires_at)),
        _ => retry_interval,
    };
    delay.max(MIN_DELAY)
}

/// `<base>/newPeerLease`, keeping any path prefix of the base URL.
pub fn lease_url(base: &Url) -> Url {
    let mut url = base.clone();
    let path = format!("{}{}", base.path().trim_end_matches('/'), LEASE_PATH);
    url.set_path(&path);
    url.set_query(None);
    url
}

/// HTTP client for the lease endpoint.
pub struct LeaseClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    timeout: Duration,
}

impl LeaseClient {
    pub fn new(tokens: Arc<dyn TokenSource>, timeout: Duration) -> LeaseResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LeaseError::Config(format!("Cannot build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            tokens,
            timeout,
        })
    }

    async fn token(&self) -> LeaseResult<String> {
        let tokens = Arc::clone(&self.tokens);
        let task = tokio::task::spawn_blocking(move || tokens.token());
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(LeaseError::AuthFailed(format!("Token task failed: {}", e))),
            Err(_) => Err(LeaseError::AuthFailed(format!(
                "Token acquisition timed out after {:?}",
                self.timeout
            ))),
        }
    }

    /// Request or renew the lease for `public_key` from `server`.
    pub async fn request_lease(
        &self,
        server: &Url,
        public_key: WgPublicKey,
    ) -> LeaseResult<LeaseResponse> {
        let token = self.token().await?;
        let url = lease_url(server);

        let response = self
            .http
            .post(url.clone())
            .bearer_auth(token)
            .json(&LeaseRequest::new(public_key))
            .send()
            .await
            .map_err(|e| LeaseError::UpstreamUnreachable(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            return Err(LeaseError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<LeaseResponse>()
            .await
            .map_err(|e| LeaseError::UpstreamUnreachable(format!("Invalid response from {}: {}", url, e)))
    }
}

/// What a link last applied to its device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedLease {
    pub address: Ipv4Net,
    pub server_key: WgPublicKey,
    pub expires_at: DateTime<Utc>,
}

async fn blocking<T, F>(f: F) -> LeaseResult<T>
where
    F: FnOnce() -> LeaseResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LeaseError::WireGuard(format!("WireGuard task failed: {}", e)))?
}

async fn resolve_endpoint(endpoint: &str) -> LeaseResult<SocketAddr> {
    tokio::net::lookup_host(endpoint)
        .await
        .map_err(|e| LeaseError::WireGuard(format!("Cannot resolve endpoint {}: {}", endpoint, e)))?
        .next()
        .ok_or_else(|| LeaseError::WireGuard(format!("Endpoint {} has no address", endpoint)))
}

/// One device's lease from one server.
pub struct LeaseLink {
    device: String,
    server: Url,
    public_key: WgPublicKey,
    client: Arc<LeaseClient>,
    wg: Arc<dyn WgControl>,
    applied: Option<AppliedLease>,
}

impl LeaseLink {
    pub fn new(
        device: impl Into<String>,
        server: Url,
        public_key: WgPublicKey,
        client: Arc<LeaseClient>,
        wg: Arc<dyn WgControl>,
    ) -> Self {
        Self {
            device: device.into(),
            server,
            public_key,
            client,
            wg,
            applied: None,
        }
    }

    pub fn applied(&self) -> Option<&AppliedLease> {
        self.applied.as_ref()
    }

    /// Request a lease and apply it to the device.
    pub async fn renew(&mut self) -> LeaseResult<LeaseResponse> {
        let response = self.client.request_lease(&self.server, self.public_key).await?;
        self.apply(&response).await?;
        Ok(response)
    }

    async fn apply(&mut self, response: &LeaseResponse) -> LeaseResult<()> {
        let server = &response.server_static_config;
        let endpoint = resolve_endpoint(&server.endpoint).await?;
        let previous = self.applied.clone();

        if previous.as_ref().map(|a| a.address) != Some(response.ip_address) {
            let wg = Arc::clone(&self.wg);
            let device = self.device.clone();
            let old = previous.as_ref().map(|a| a.address);
            let new = response.ip_address;
            blocking(move || wg.replace_address(&device, old, new)).await?;
            log::info!(
                "Address of {} is now {} (lease from {})",
                self.device,
                new,
                self.server
            );
        }

        let mut updates = Vec::new();
        if let Some(old) = previous.as_ref().filter(|a| a.server_key != server.public_key) {
            updates.push(PeerUpdate::remove(old.server_key));
        }
        let allowed_ips: BTreeSet<IpNet> = server.allowed_ips.iter().copied().collect();
        updates.push(
            PeerUpdate::upsert(server.public_key, allowed_ips)
                .with_endpoint(Some(endpoint))
                .with_keepalive(server.persistent_keepalive),
        );
        let wg = Arc::clone(&self.wg);
        let device = self.device.clone();
        blocking(move || wg.set_device(&device, &updates)).await?;

        self.applied = Some(AppliedLease {
            address: response.ip_address,
            server_key: server.public_key,
            expires_at: response.expires_at,
        });
        Ok(())
    }

    /// Renew until `shutdown` flips to true.
    pub async fn run(
        mut self,
        clock: Arc<dyn Clock>,
        retry_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let delay = match self.renew().await {
                Ok(response) => {
                    log::debug!(
                        "Lease {} from {} valid until {}",
                        response.ip_address,
                        self.server,
                        response.expires_at
                    );
                    renewal_delay(clock.now(), response.expires_at)
                }
                Err(e) => {
                    log::warn!("Lease request to {} for {} failed: {}", self.server, self.device, e);
                    retry_delay(
                        clock.now(),
                        self.applied.as_ref().map(|a| a.expires_at),
                        retry_interval,
                    )
                }
            };

            log::debug!("Next lease request to {} in {:?}", self.server, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("Stopped lease renewal for {} from {}", self.device, self.server);
    }
}

/// Runs one [`LeaseLink`] per configured device and server.
pub struct Agent {
    config: AgentConfig,
    client: Arc<LeaseClient>,
    wg: Arc<dyn WgControl>,
    clock: Arc<dyn Clock>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        tokens: Arc<dyn TokenSource>,
        wg: Arc<dyn WgControl>,
        clock: Arc<dyn Clock>,
    ) -> LeaseResult<Self> {
        if config.devices.is_empty() {
            return Err(LeaseError::Config("No devices configured".into()));
        }
        let client = Arc::new(LeaseClient::new(tokens, config.request_timeout)?);
        Ok(Self {
            config,
            client,
            wg,
            clock,
        })
    }

    /// Prepare every device and build its links.
    ///
    /// Each device is flushed of its addresses before the first request, and
    /// its public key is read from the device itself.
    pub async fn links(&self) -> LeaseResult<Vec<LeaseLink>> {
        let mut links = Vec::new();
        for device in &self.config.devices {
            let wg = Arc::clone(&self.wg);
            let name = device.name.clone();
            let public_key = blocking(move || {
                let key = wg.get_device(&name)?.public_key.ok_or_else(|| {
                    LeaseError::Config(format!("Device {} has no public key", name))
                })?;
                wg.flush_addresses(&name)?;
                Ok(key)
            })
            .await?;
            log::info!(
                "Device {} ({}) leasing from {} server(s)",
                device.name,
                public_key.short(),
                device.servers.len()
            );

            for server in &device.servers {
                links.push(LeaseLink::new(
                    device.name.clone(),
                    server.clone(),
                    public_key,
                    Arc::clone(&self.client),
                    Arc::clone(&self.wg),
                ));
            }
        }
        Ok(links)
    }

    /// Run all links until `shutdown` flips to true.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> LeaseResult<()> {
        let links = self.links().await?;
        let mut tasks = JoinSet::new();
        for link in links {
            tasks.spawn(link.run(
                Arc::clone(&self.clock),
                self.config.retry_interval,
                shutdown.clone(),
            ));
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                log::error!("Lease link task failed: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_renewal_at_half_life() {
        assert_eq!(renewal_delay(at(0, 0), at(12, 0)), Duration::from_secs(6 * 3600));
        assert_eq!(renewal_delay(at(11, 0), at(12, 0)), Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_renewal_never_below_minimum() {
        assert_eq!(renewal_delay(at(12, 0), at(12, 0)), MIN_DELAY);
        assert_eq!(renewal_delay(at(13, 0), at(12, 0)), MIN_DELAY);
    }

    #[test]
    fn test_retry_capped_by_half_life() {
        let retry = Duration::from_secs(60);
        assert_eq!(retry_delay(at(0, 0), Some(at(12, 0)), retry), retry);
        assert_eq!(
            retry_delay(at(11, 59), Some(at(12, 0)), retry),
            Duration::from_secs(30)
        );
        assert_eq!(retry_delay(at(0, 0), None, retry), retry);
        assert_eq!(retry_delay(at(13, 0), Some(at(12, 0)), retry), retry);
    }

    #[test]
    fn test_lease_url() {
        let base: Url = "https://vpn.example.com".parse().unwrap();
        assert_eq!(lease_url(&base).as_str(), "https://vpn.example.com/newPeerLease");
        let prefixed: Url = "http://10.0.0.1:8080/wiresteward/".parse().unwrap();
        assert_eq!(
            lease_url(&prefixed).as_str(),
            "http://10.0.0.1:8080/wiresteward/newPeerLease"
        );
    }
}
