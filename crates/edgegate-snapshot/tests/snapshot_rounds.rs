//! Snapshot rounds against real transports
//!
//! Probes go through the proxy router, so direct environments are dialed over
//! TCP and edge environments through a loopback tunnel server and agent.

use edgegate_auth::StaticCredentialVerifier;
use edgegate_environment::{
    Environment, EnvironmentKind, EnvironmentRegistry, EnvironmentStatus, InMemoryEnvironmentStore,
};
use edgegate_proxy::{EndpointProxyRouter, ProxyConfig};
use edgegate_snapshot::{ProbeVerdict, SnapshotConfig, SnapshotScheduler};
use edgegate_tunnel::{EdgeAgent, EdgeAgentConfig, TunnelServer, TunnelServerConfig, TunnelStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Answers every request with `200 OK`
async fn ping_backend() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let task = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK")
                    .await;
                let _ = stream.shutdown().await;
            });
        }
    });
    (addr, task)
}

struct Plane {
    registry: Arc<EnvironmentRegistry>,
    tunnels: Arc<TunnelStore>,
    scheduler: Arc<SnapshotScheduler>,
    tunnel_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Drop for Plane {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Plane {
    async fn start(environments: Vec<Environment>) -> Self {
        init_tracing();

        let registry = Arc::new(EnvironmentRegistry::new(Arc::new(
            InMemoryEnvironmentStore::with_environments(environments),
        )));
        let tunnels = Arc::new(TunnelStore::new());

        let server = Arc::new(TunnelServer::new(
            TunnelServerConfig {
                bind_addr: "127.0.0.1:0".parse().unwrap(),
                heartbeat_interval: Duration::from_millis(100),
                heartbeat_loss_threshold: 2,
                handshake_timeout: Duration::from_secs(2),
            },
            tunnels.clone(),
            registry.clone(),
            Arc::new(StaticCredentialVerifier::new().with_key("E1", "edge-key")),
        ));
        let listener = server.bind().await.unwrap();
        let tunnel_addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(listener, shutdown.clone()));

        let router = Arc::new(EndpointProxyRouter::new(
            registry.clone(),
            tunnels.clone(),
            ProxyConfig::default(),
        ));
        let scheduler = Arc::new(SnapshotScheduler::new(
            SnapshotConfig {
                probe_timeout: Duration::from_secs(1),
                ..SnapshotConfig::default()
            },
            registry.clone(),
            tunnels.clone(),
            router,
        ));

        Self {
            registry,
            tunnels,
            scheduler,
            tunnel_addr,
            shutdown,
        }
    }

    async fn status(&self, id: &str) -> EnvironmentStatus {
        self.registry.get(id).await.unwrap().unwrap().status
    }

    async fn verdict(&self, id: &str) -> ProbeVerdict {
        let outcomes = self.scheduler.run_once().await.unwrap();
        outcomes
            .into_iter()
            .find(|o| o.environment_id == id)
            .map(|o| o.verdict)
            .unwrap()
    }

    async fn wait_for_status(&self, id: &str, status: EnvironmentStatus) {
        timeout(Duration::from_secs(2), async {
            while self.status(id).await != status {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} never became {}", id, status));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_direct_environment_goes_down_after_threshold() {
    let (addr, backend) = ping_backend().await;
    let env = Environment::new("1", "local", EnvironmentKind::docker_http(), format!("tcp://{}", addr));
    let plane = Plane::start(vec![env]).await;

    assert_eq!(plane.verdict("1").await, ProbeVerdict::Healthy);
    assert_eq!(plane.status("1").await, EnvironmentStatus::Up);

    backend.abort();
    let _ = backend.await;

    assert_eq!(plane.verdict("1").await, ProbeVerdict::Failed { consecutive: 1 });
    assert_eq!(plane.status("1").await, EnvironmentStatus::Up);

    assert_eq!(plane.verdict("1").await, ProbeVerdict::Failed { consecutive: 2 });
    assert_eq!(plane.status("1").await, EnvironmentStatus::Down);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_edge_environment_follows_its_tunnel() {
    let (addr, _backend) = ping_backend().await;
    let env = Environment::new("E1", "edge", EnvironmentKind::docker_edge(), format!("tcp://{}", addr));
    let plane = Plane::start(vec![env]).await;

    // No agent yet
    assert_eq!(plane.verdict("E1").await, ProbeVerdict::TunnelLost);
    assert_eq!(plane.status("E1").await, EnvironmentStatus::Down);

    let config = EdgeAgentConfig::new(plane.tunnel_addr.to_string(), "E1", "edge-key");
    let agent = EdgeAgent::connect(&config).await.unwrap();
    plane.wait_for_status("E1", EnvironmentStatus::Up).await;

    assert_eq!(plane.verdict("E1").await, ProbeVerdict::Healthy);
    assert_eq!(plane.status("E1").await, EnvironmentStatus::Up);

    agent.pause_heartbeats();
    plane.wait_for_status("E1", EnvironmentStatus::Down).await;
    assert!(plane.tunnels.is_empty());

    // A round after the loss must not bring it back
    assert_eq!(plane.verdict("E1").await, ProbeVerdict::TunnelLost);
    assert_eq!(plane.status("E1").await, EnvironmentStatus::Down);

    let _agent = EdgeAgent::connect(&config).await.unwrap();
    plane.wait_for_status("E1", EnvironmentStatus::Up).await;
    assert_eq!(plane.verdict("E1").await, ProbeVerdict::Healthy);
}
