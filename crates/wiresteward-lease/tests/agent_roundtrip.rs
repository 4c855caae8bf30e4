use ipnet::{IpNet, Ipv4Net};
use reqwest::Url;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use wiresteward_lease::server::{router, serve};
use wiresteward_lease::{
    Agent, AgentConfig, AgentDevice, FileTokenSource, LeaseClient, LeaseConfig, LeaseError,
    LeaseLink, LeaseManager, LeaseService, LeaseServiceConfig, LeaseStore, ManagedSubnet,
    MemoryWg, ServerStaticConfig, StaticPeerSource, StaticTokenSource, StaticTokenValidator,
    SystemClock, UnmanagedPeerPolicy, WgControl, WgPublicKey,
};

const TOKEN: &str = "agent-token";
const SERVER_KEY: WgPublicKey = WgPublicKey([1; 32]);
const AGENT_KEY: WgPublicKey = WgPublicKey([2; 32]);

struct Server {
    url: Url,
    manager: Arc<LeaseManager>,
    wg: Arc<MemoryWg>,
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

async fn start_server(lease_file: std::path::PathBuf) -> Server {
    let wg = Arc::new(MemoryWg::new());
    wg.add_device("wg0", Some(SERVER_KEY), Some(51820));

    let manager = Arc::new(
        LeaseManager::new(
            LeaseConfig {
                device: "wg0".to_string(),
                subnet: ManagedSubnet::new("10.90.0.0/24".parse().unwrap(), None).unwrap(),
                lease_time: Duration::from_secs(3600),
                unmanaged_peers: UnmanagedPeerPolicy::Remove,
            },
            LeaseStore::open(lease_file).unwrap(),
            wg.clone(),
            Arc::new(StaticPeerSource::empty()),
            Arc::new(SystemClock),
        )
        .unwrap(),
    );
    let service = LeaseService::new(
        Arc::clone(&manager),
        Arc::new(StaticTokenValidator::new(vec![TOKEN.to_string()])),
        LeaseServiceConfig {
            server_static_config: ServerStaticConfig {
                public_key: SERVER_KEY,
                endpoint: "127.0.0.1:51820".to_string(),
                allowed_ips: vec!["10.90.0.0/24".parse().unwrap()],
                persistent_keepalive: Some(25),
            },
        },
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url: Url = format!("http://{}", listener.local_addr().unwrap()).parse().unwrap();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(serve(listener, router(Arc::new(service)), shutdown_rx));

    Server {
        url,
        manager,
        wg,
        shutdown,
        handle,
    }
}

fn agent_wg() -> Arc<MemoryWg> {
    let wg = Arc::new(MemoryWg::new());
    wg.add_device("wg1", Some(AGENT_KEY), None);
    wg
}

#[tokio::test]
async fn test_agent_applies_lease_and_server_reconciles() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path().join("leases.json")).await;
    let wg = agent_wg();

    let client = Arc::new(
        LeaseClient::new(Arc::new(StaticTokenSource::new(TOKEN)), Duration::from_secs(5)).unwrap(),
    );
    let mut link = LeaseLink::new("wg1", server.url.clone(), AGENT_KEY, client, wg.clone());

    let response = link.renew().await.unwrap();
    let leased: Ipv4Net = "10.90.0.2/32".parse().unwrap();
    assert_eq!(response.ip_address, leased);
    assert_eq!(wg.addresses("wg1"), vec![leased]);

    let expected: BTreeSet<IpNet> = ["10.90.0.0/24".parse().unwrap()].into_iter().collect();
    assert_eq!(wg.peer_map("wg1").get(&SERVER_KEY), Some(&expected));

    // Renewal keeps the address.
    let again = link.renew().await.unwrap();
    assert_eq!(again.ip_address, leased);
    assert_eq!(wg.addresses("wg1"), vec![leased]);

    // A pass may already be running from the request; it then folds ours in.
    let host: BTreeSet<IpNet> = [IpNet::V4(leased)].into_iter().collect();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        server.manager.sync_wg_records().unwrap();
        if server.wg.peer_map("wg0").get(&AGENT_KEY) == Some(&host) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "server never reconciled");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The lease survives a restart through the lease file.
    let stored = LeaseStore::open(dir.path().join("leases.json")).unwrap();
    assert_eq!(stored.get(&AGENT_KEY).unwrap().ip_address, leased.addr());

    server.shutdown.send(true).unwrap();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_failed_renewal_keeps_applied_config() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path().join("leases.json")).await;
    let wg = agent_wg();

    let token_file = dir.path().join("token");
    std::fs::write(&token_file, TOKEN).unwrap();
    let client = Arc::new(
        LeaseClient::new(Arc::new(FileTokenSource::new(&token_file)), Duration::from_secs(5))
            .unwrap(),
    );
    let mut link = LeaseLink::new("wg1", server.url.clone(), AGENT_KEY, client, wg.clone());
    link.renew().await.unwrap();
    let applied = link.applied().cloned().unwrap();

    std::fs::write(&token_file, "revoked-token").unwrap();
    let err = link.renew().await.unwrap_err();
    assert!(matches!(err, LeaseError::Upstream { status: 401, .. }), "{err}");

    assert_eq!(link.applied(), Some(&applied));
    assert_eq!(wg.addresses("wg1"), vec![applied.address]);
    assert!(wg.peer_map("wg1").contains_key(&SERVER_KEY));

    server.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn test_unreachable_server() {
    let wg = agent_wg();
    let client = Arc::new(
        LeaseClient::new(Arc::new(StaticTokenSource::new(TOKEN)), Duration::from_secs(2)).unwrap(),
    );
    // Bind then drop to get a port nobody listens on.
    let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let url: Url = format!("http://{}", addr).parse().unwrap();
    let mut link = LeaseLink::new("wg1", url, AGENT_KEY, client, wg.clone());

    let err = link.renew().await.unwrap_err();
    assert!(matches!(err, LeaseError::UpstreamUnreachable(_)), "{err}");
    assert!(err.is_recoverable());
    assert!(wg.addresses("wg1").is_empty());
}

#[tokio::test]
async fn test_agent_flushes_and_stops_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path().join("leases.json")).await;
    let wg = agent_wg();
    let stale: Ipv4Net = "192.168.77.5/24".parse().unwrap();
    wg.replace_address("wg1", None, stale).unwrap();

    let agent = Agent::new(
        AgentConfig {
            devices: vec![AgentDevice {
                name: "wg1".to_string(),
                servers: vec![server.url.clone()],
            }],
            request_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(60),
        },
        Arc::new(StaticTokenSource::new(TOKEN)),
        wg.clone(),
        Arc::new(SystemClock),
    )
    .unwrap();

    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(agent.run(shutdown_rx));

    let leased: Ipv4Net = "10.90.0.2/32".parse().unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while wg.addresses("wg1") != vec![leased] {
        assert!(tokio::time::Instant::now() < deadline, "agent never applied its lease");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!server.manager.leases().is_empty());
    server.shutdown.send(true).unwrap();
}
