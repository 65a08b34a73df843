//! Environment data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::url::{EndpointUrl, EndpointUrlError};

/// How the control plane reaches an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    /// Local Unix socket or Windows named pipe
    DirectSocket,
    /// TCP, optionally TLS
    DirectHttp,
    /// Sub-connections dialed through an agent-initiated tunnel
    Tunnel,
}

/// Backend API family spoken by an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiFamily {
    Docker,
    Kubernetes,
}

impl ApiFamily {
    /// Path of the lightweight liveness probe for this API family
    pub fn probe_path(&self) -> &'static str {
        match self {
            ApiFamily::Docker => "/_ping",
            ApiFamily::Kubernetes => "/healthz",
        }
    }
}

impl fmt::Display for ApiFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiFamily::Docker => f.write_str("docker"),
            ApiFamily::Kubernetes => f.write_str("kubernetes"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentKind {
    pub connection: ConnectionKind,
    pub api: ApiFamily,
}

impl EnvironmentKind {
    pub const fn new(connection: ConnectionKind, api: ApiFamily) -> Self {
        Self { connection, api }
    }

    pub const fn docker_socket() -> Self {
        Self::new(ConnectionKind::DirectSocket, ApiFamily::Docker)
    }

    pub const fn docker_http() -> Self {
        Self::new(ConnectionKind::DirectHttp, ApiFamily::Docker)
    }

    pub const fn docker_edge() -> Self {
        Self::new(ConnectionKind::Tunnel, ApiFamily::Docker)
    }

    pub const fn kubernetes_http() -> Self {
        Self::new(ConnectionKind::DirectHttp, ApiFamily::Kubernetes)
    }

    pub const fn kubernetes_edge() -> Self {
        Self::new(ConnectionKind::Tunnel, ApiFamily::Kubernetes)
    }

    pub fn is_tunnel(&self) -> bool {
        self.connection == ConnectionKind::Tunnel
    }
}

/// Liveness status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    Up,
    Down,
    #[default]
    Unknown,
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentStatus::Up => f.write_str("up"),
            EnvironmentStatus::Down => f.write_str("down"),
            EnvironmentStatus::Unknown => f.write_str("unknown"),
        }
    }
}

/// TLS parameters for reaching the backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TlsSettings {
    pub enabled: bool,
    #[serde(default)]
    pub skip_verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_pem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert_pem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_pem: Option<String>,
}

impl TlsSettings {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn insecure() -> Self {
        Self {
            enabled: true,
            skip_verify: true,
            ..Self::default()
        }
    }
}

/// Credentials injected into every forwarded call
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendCredentials {
    Bearer { token: String },
    Basic { username: String, password: String },
}

impl fmt::Debug for BackendCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendCredentials::Bearer { .. } => f.write_str("Bearer(<redacted>)"),
            BackendCredentials::Basic { username, .. } => {
                write!(f, "Basic({}, <redacted>)", username)
            }
        }
    }
}

/// A managed container or cluster target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub name: String,
    pub kind: EnvironmentKind,
    /// Socket/pipe path or URL; for tunnel environments, the address the agent dials
    pub url: String,
    #[serde(default)]
    pub tls: TlsSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<BackendCredentials>,
    #[serde(default)]
    pub status: EnvironmentStatus,
    #[serde(default)]
    pub last_probe_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status_changed_at: Option<DateTime<Utc>>,
}

/// Fields that determine how a forwarding handler is built
#[derive(Serialize)]
struct ConnectionView<'a> {
    kind: &'a EnvironmentKind,
    url: &'a str,
    tls: &'a TlsSettings,
    credentials: &'a Option<BackendCredentials>,
}

impl Environment {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: EnvironmentKind,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            url: url.into(),
            tls: TlsSettings::default(),
            credentials: None,
            status: EnvironmentStatus::Unknown,
            last_probe_at: None,
            status_changed_at: None,
        }
    }

    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_credentials(mut self, credentials: BackendCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_status(mut self, status: EnvironmentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_tunnel(&self) -> bool {
        self.kind.is_tunnel()
    }

    /// Parsed connection descriptor
    pub fn endpoint(&self) -> Result<EndpointUrl, EndpointUrlError> {
        EndpointUrl::parse(&self.url)
    }

    /// Digest of the connection-relevant configuration
    ///
    /// Status and probe timestamps are excluded, so liveness updates never
    /// invalidate a cached handler.
    pub fn fingerprint(&self) -> String {
        let view = ConnectionView {
            kind: &self.kind,
            url: &self.url,
            tls: &self.tls,
            credentials: &self.credentials,
        };
        // Serializing plain data into a Vec cannot fail
        let encoded = serde_json::to_vec(&view).unwrap_or_default();
        Sha256::digest(&encoded)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Environment {
        Environment::new("1", "local", EnvironmentKind::docker_http(), "tcp://10.0.0.5:2375")
    }

    #[test]
    fn test_fingerprint_ignores_liveness() {
        let env = sample();
        let mut probed = env.clone();
        probed.status = EnvironmentStatus::Down;
        probed.last_probe_at = Some(Utc::now());
        probed.status_changed_at = Some(Utc::now());

        assert_eq!(env.fingerprint(), probed.fingerprint());
    }

    #[test]
    fn test_fingerprint_tracks_connection_changes() {
        let env = sample();
        let moved = Environment {
            url: "tcp://10.0.0.6:2375".to_string(),
            ..env.clone()
        };
        let secured = env.clone().with_tls(TlsSettings::enabled());
        let authed = env.clone().with_credentials(BackendCredentials::Bearer {
            token: "abc".to_string(),
        });

        assert_ne!(env.fingerprint(), moved.fingerprint());
        assert_ne!(env.fingerprint(), secured.fingerprint());
        assert_ne!(env.fingerprint(), authed.fingerprint());
        assert_eq!(env.fingerprint().len(), 64);
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = BackendCredentials::Basic {
            username: "admin".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_environment_serde_defaults() {
        let json = r#"{
            "id": "7",
            "name": "edge-7",
            "kind": { "connection": "tunnel", "api": "docker" },
            "url": "unix:///var/run/docker.sock"
        }"#;
        let env: Environment = serde_json::from_str(json).unwrap();
        assert!(env.is_tunnel());
        assert_eq!(env.status, EnvironmentStatus::Unknown);
        assert!(!env.tls.enabled);
        assert!(env.credentials.is_none());
    }

    #[test]
    fn test_probe_paths() {
        assert_eq!(ApiFamily::Docker.probe_path(), "/_ping");
        assert_eq!(ApiFamily::Kubernetes.probe_path(), "/healthz");
    }
}
