//! Shared fixtures: a Docker-like backend, a thin HTTP front over the router,
//! and a loopback tunnel server with its registry.

#![allow(dead_code)]

use bytes::Bytes;
use dashmap::DashMap;
use edgegate_auth::StaticCredentialVerifier;
use edgegate_environment::{
    Environment, EnvironmentRegistry, EnvironmentStatus, InMemoryEnvironmentStore,
};
use edgegate_proxy::{full_body, EndpointProxyRouter, ProxyBody, ProxyConfig, ProxyRequest};
use edgegate_tunnel::{AgentHandle, EdgeAgent, EdgeAgentConfig, TunnelServer, TunnelServerConfig, TunnelStore};
use http::header::{CONNECTION, CONTENT_TYPE, UPGRADE};
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub const HEARTBEAT: Duration = Duration::from_millis(100);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Backend speaking a small slice of the Docker API
pub struct Backend {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl Backend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service_fn(docker_api))
                        .with_upgrades()
                        .await;
                });
            }
        });

        Self { addr, accepted }
    }

    /// Connections the backend has accepted so far
    pub fn connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

async fn docker_api(mut req: Request<Incoming>) -> Result<Response<ProxyBody>, Infallible> {
    let seen_auth = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("none")
        .to_string();
    let seen_host = req
        .headers()
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("none")
        .to_string();

    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (method, path.as_str()) {
        (Method::GET, "/containers/json") => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/json")
            .header("x-seen-authorization", seen_auth)
            .header("x-seen-host", seen_host)
            .body(full_body("[]")),
        (Method::GET, "/_ping") => Response::builder()
            .status(StatusCode::OK)
            .body(full_body("OK")),
        (Method::GET, "/slow") => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Response::builder().status(StatusCode::OK).body(full_body("late"))
        }
        (Method::POST, "/containers/abc/attach") => {
            let on_upgrade = hyper::upgrade::on(&mut req);
            tokio::spawn(async move {
                if let Ok(upgraded) = on_upgrade.await {
                    let (mut read, mut write) = tokio::io::split(TokioIo::new(upgraded));
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                }
            });
            Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .header(CONNECTION, "Upgrade")
                .header(UPGRADE, "tcp")
                .body(full_body(Bytes::new()))
        }
        (Method::POST, "/containers/abc/wrong-upgrade") => Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .body(full_body(Bytes::new())),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full_body("page not found")),
    };

    Ok(response.unwrap())
}

/// Minimal HTTP front: every call goes to one environment
///
/// A call carrying `x-session: <name>` gets a cancellation token the test can
/// fire through [`Front::cancel`].
pub struct Front {
    pub addr: SocketAddr,
    sessions: Arc<DashMap<String, CancellationToken>>,
}

impl Front {
    pub async fn start(router: Arc<EndpointProxyRouter>, environment_id: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sessions: Arc<DashMap<String, CancellationToken>> = Arc::new(DashMap::new());
        let environment_id = environment_id.to_string();

        let tokens = sessions.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let router = router.clone();
                let tokens = tokens.clone();
                let environment_id = environment_id.clone();

                let service = service_fn(move |req: Request<Incoming>| {
                    let router = router.clone();
                    let tokens = tokens.clone();
                    let environment_id = environment_id.clone();
                    async move {
                        let cancel = CancellationToken::new();
                        if let Some(name) = req.headers().get("x-session").and_then(|v| v.to_str().ok()) {
                            tokens.insert(name.to_string(), cancel.clone());
                        }

                        let path = req
                            .uri()
                            .path_and_query()
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "/".to_string());
                        let request = ProxyRequest::from_hyper(req, path);

                        let response = match router.route(&environment_id, request, cancel).await {
                            Ok(response) => response,
                            Err(e) => Response::builder()
                                .status(e.status_code())
                                .body(full_body(e.to_string()))
                                .unwrap(),
                        };
                        Ok::<_, Infallible>(response)
                    }
                });

                tokio::spawn(async move {
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades()
                        .await;
                });
            }
        });

        Self { addr, sessions }
    }

    pub fn cancel(&self, session: &str) {
        if let Some(token) = self.sessions.get(session) {
            token.cancel();
        }
    }

    /// Open an upgraded raw session through the front
    pub async fn attach(&self, path: &str, session: &str) -> (TcpStream, String) {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let head = format!(
            "POST {} HTTP/1.1\r\nHost: front\r\nConnection: Upgrade\r\nUpgrade: tcp\r\nx-session: {}\r\nContent-Length: 0\r\n\r\n",
            path, session
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        let response = read_head(&mut stream).await;
        (stream, response)
    }
}

/// Read an HTTP response head byte by byte, leaving the rest in the socket
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = timeout(Duration::from_secs(5), stream.read(&mut byte))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "connection closed before response head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// Registry, tunnel server and router wired together on loopback
pub struct Plane {
    pub registry: Arc<EnvironmentRegistry>,
    pub tunnels: Arc<TunnelStore>,
    pub router: Arc<EndpointProxyRouter>,
    pub tunnel_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Drop for Plane {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Plane {
    pub async fn start(environments: Vec<Environment>, config: ProxyConfig) -> Self {
        init_tracing();

        let store = InMemoryEnvironmentStore::with_environments(environments);
        let registry = Arc::new(EnvironmentRegistry::new(Arc::new(store)));
        let tunnels = Arc::new(TunnelStore::new());
        let verifier = Arc::new(StaticCredentialVerifier::new().with_key("E1", "edge-key"));

        let server = Arc::new(TunnelServer::new(
            TunnelServerConfig {
                bind_addr: "127.0.0.1:0".parse().unwrap(),
                heartbeat_interval: HEARTBEAT,
                heartbeat_loss_threshold: 2,
                handshake_timeout: Duration::from_secs(2),
            },
            tunnels.clone(),
            registry.clone(),
            verifier,
        ));
        let listener = server.bind().await.unwrap();
        let tunnel_addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(listener, shutdown.clone()));

        let router = Arc::new(EndpointProxyRouter::new(registry.clone(), tunnels.clone(), config));

        Self {
            registry,
            tunnels,
            router,
            tunnel_addr,
            shutdown,
        }
    }

    /// Connect the edge agent of `E1` and wait until its tunnel is installed
    pub async fn connect_agent(&self) -> AgentHandle {
        let config = EdgeAgentConfig::new(self.tunnel_addr.to_string(), "E1", "edge-key");
        let agent = EdgeAgent::connect(&config).await.unwrap();
        self.wait_for_status("E1", EnvironmentStatus::Up).await;
        agent
    }

    pub async fn wait_for_status(&self, id: &str, status: EnvironmentStatus) {
        let registry = self.registry.clone();
        timeout(Duration::from_secs(2), async move {
            loop {
                if registry.get(id).await.unwrap().map(|e| e.status) == Some(status) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} never became {}", id, status));
    }
}

/// Fetch a path and return status plus body
pub async fn fetch(router: &EndpointProxyRouter, environment_id: &str, path: &str) -> (StatusCode, Bytes) {
    use http_body_util::BodyExt;

    let response = router
        .route(environment_id, ProxyRequest::get(path), CancellationToken::new())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}
