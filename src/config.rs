//! Command line and environment configuration

use anyhow::{bail, Context, Result};
use clap::Parser;
use edgegate_environment::TlsSettings;
use edgegate_proxy::ProxyConfig;
use edgegate_snapshot::SnapshotConfig;
use edgegate_tunnel::TunnelServerConfig;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "edgegate",
    about = "Management gateway for container and cluster environments",
    version,
    long_about = "Proxies Docker and Kubernetes API calls to managed environments.\n\
                  Directly reachable environments are dialed over TCP or a local socket;\n\
                  edge environments are reached through reverse tunnels opened by their agents.\n\n\
                  Examples:\n  \
                  # Manage the local Docker engine\n  \
                  edgegate --host unix:///var/run/docker.sock\n\n  \
                  # Accept edge agents on port 8000 with JWT credentials\n  \
                  edgegate --tunnel-port 8000 --edge-secret $EDGE_SECRET"
)]
pub struct Cli {
    /// Address and port to serve the API
    #[arg(short = 'p', long, default_value = "0.0.0.0:9000", env = "EDGEGATE_BIND")]
    pub bind: SocketAddr,

    /// Address to serve the tunnel server
    #[arg(long, default_value = "0.0.0.0", env = "EDGEGATE_TUNNEL_ADDR")]
    pub tunnel_addr: IpAddr,

    /// Port to serve the tunnel server
    #[arg(long, default_value = "8000", env = "EDGEGATE_TUNNEL_PORT")]
    pub tunnel_port: u16,

    /// Primary environment URL (unix://, tcp:// or npipe://)
    #[arg(short = 'H', long, env = "EDGEGATE_HOST")]
    pub host: Option<String>,

    /// Connect to the primary environment over TLS, verified against --tlscacert
    #[arg(long = "tlsverify", env = "EDGEGATE_TLSVERIFY")]
    pub tls_verify: bool,

    /// Connect to the primary environment over TLS without verifying its certificate
    #[arg(long = "tlsskipverify", env = "EDGEGATE_TLSSKIPVERIFY")]
    pub tls_skip_verify: bool,

    /// Path to the CA of the primary environment
    #[arg(long = "tlscacert", env = "EDGEGATE_TLSCACERT")]
    pub tls_cacert: Option<PathBuf>,

    /// Path to the TLS client certificate
    #[arg(long = "tlscert", env = "EDGEGATE_TLSCERT")]
    pub tls_cert: Option<PathBuf>,

    /// Path to the TLS client key
    #[arg(long = "tlskey", env = "EDGEGATE_TLSKEY")]
    pub tls_key: Option<PathBuf>,

    /// Time between two snapshot rounds
    #[arg(long, default_value = "5m", env = "EDGEGATE_SNAPSHOT_INTERVAL", value_parser = snapshot_interval)]
    pub snapshot_interval: Duration,

    /// Per-probe timeout
    #[arg(long, default_value = "10s", env = "EDGEGATE_PROBE_TIMEOUT", value_parser = parse_duration)]
    pub probe_timeout: Duration,

    /// Probes allowed in flight at once
    #[arg(long, default_value = "8", env = "EDGEGATE_SNAPSHOT_WORKERS", value_parser = clap::value_parser!(u32).range(1..))]
    pub snapshot_workers: u32,

    /// Consecutive failed probes before an environment is marked down
    #[arg(long, default_value = "2", env = "EDGEGATE_FAILURE_THRESHOLD", value_parser = clap::value_parser!(u32).range(1..))]
    pub failure_threshold: u32,

    /// Interval at which edge agents must send a keepalive
    #[arg(long, default_value = "10s", env = "EDGEGATE_HEARTBEAT_INTERVAL", value_parser = parse_duration)]
    pub heartbeat_interval: Duration,

    /// Missed keepalives before a tunnel is torn down
    #[arg(long, default_value = "2", env = "EDGEGATE_HEARTBEAT_LOSS_THRESHOLD", value_parser = clap::value_parser!(u32).range(1..))]
    pub heartbeat_loss_threshold: u32,

    /// Time allowed for an agent to complete its handshake
    #[arg(long, default_value = "10s", env = "EDGEGATE_HANDSHAKE_TIMEOUT", value_parser = parse_duration)]
    pub handshake_timeout: Duration,

    /// Timeout for dialing a backend or opening a sub-connection
    #[arg(long, default_value = "5s", env = "EDGEGATE_DIAL_TIMEOUT", value_parser = parse_duration)]
    pub dial_timeout: Duration,

    /// Timeout for a proxied call to receive its response head
    #[arg(long, default_value = "60s", env = "EDGEGATE_REQUEST_TIMEOUT", value_parser = parse_duration)]
    pub request_timeout: Duration,

    /// Idle time after which an unused proxy handler is dropped
    #[arg(long = "cache-idle", default_value = "30m", env = "EDGEGATE_CACHE_IDLE", value_parser = parse_duration)]
    pub cache_idle: Duration,

    /// HS256 secret for edge agent tokens
    #[arg(long, env = "EDGEGATE_EDGE_SECRET", hide_env_values = true)]
    pub edge_secret: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Parse `500ms`, `30s`, `5m` or `1h`
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("Invalid duration '{}': missing unit (ms, s, m, h)", value))?;
    let (amount, unit) = value.split_at(split);

    let amount: u64 = amount
        .parse()
        .map_err(|_| format!("Invalid duration '{}'", value))?;
    let duration = match unit {
        "ms" => Duration::from_millis(amount),
        "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount * 60),
        "h" => Duration::from_secs(amount * 3600),
        _ => return Err(format!("Invalid duration '{}': unknown unit '{}'", value, unit)),
    };

    if duration.is_zero() {
        return Err(format!("Invalid duration '{}': must be greater than zero", value));
    }
    Ok(duration)
}

fn snapshot_interval(value: &str) -> Result<Duration, String> {
    parse_duration(value).map_err(|e| format!("Invalid snapshot interval: {}", e))
}

/// TLS files for the primary environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostTls {
    pub verify: bool,
    pub skip_verify: bool,
    pub ca_cert: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

impl HostTls {
    pub fn is_enabled(&self) -> bool {
        self.verify || self.skip_verify
    }

    fn validate(&self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        if self.verify && !self.skip_verify && self.ca_cert.is_none() {
            bail!("--tlsverify requires --tlscacert");
        }
        if self.cert.is_some() != self.key.is_some() {
            bail!("--tlscert and --tlskey must be given together");
        }
        for path in [&self.ca_cert, &self.cert, &self.key].into_iter().flatten() {
            if !path.is_file() {
                bail!("Unable to locate TLS file {}", path.display());
            }
        }
        Ok(())
    }

    /// Read the PEM files into the environment's TLS settings
    pub async fn load(&self) -> Result<TlsSettings> {
        let ca_cert_pem = if self.skip_verify {
            None
        } else {
            read_pem(self.ca_cert.as_ref()).await?
        };
        Ok(TlsSettings {
            enabled: true,
            skip_verify: self.skip_verify,
            ca_cert_pem,
            client_cert_pem: read_pem(self.cert.as_ref()).await?,
            client_key_pem: read_pem(self.key.as_ref()).await?,
        })
    }
}

async fn read_pem(path: Option<&PathBuf>) -> Result<Option<String>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let pem = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read TLS file {}", path.display()))?;
    Ok(Some(pem))
}

/// Validated settings of every component
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_bind: SocketAddr,
    pub host: Option<String>,
    pub host_tls: HostTls,
    pub edge_secret: Option<String>,
    pub tunnel: TunnelServerConfig,
    pub proxy: ProxyConfig,
    pub snapshot: SnapshotConfig,
}

impl AppConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let config = Self {
            api_bind: cli.bind,
            host: cli.host.clone(),
            host_tls: HostTls {
                verify: cli.tls_verify,
                skip_verify: cli.tls_skip_verify,
                ca_cert: cli.tls_cacert.clone(),
                cert: cli.tls_cert.clone(),
                key: cli.tls_key.clone(),
            },
            edge_secret: cli.edge_secret.clone(),
            tunnel: TunnelServerConfig {
                bind_addr: SocketAddr::new(cli.tunnel_addr, cli.tunnel_port),
                heartbeat_interval: cli.heartbeat_interval,
                heartbeat_loss_threshold: cli.heartbeat_loss_threshold,
                handshake_timeout: cli.handshake_timeout,
            },
            proxy: ProxyConfig {
                dial_timeout: cli.dial_timeout,
                request_timeout: cli.request_timeout,
                cache_idle_period: cli.cache_idle,
            },
            snapshot: SnapshotConfig {
                interval: cli.snapshot_interval,
                probe_timeout: cli.probe_timeout,
                workers: cli.snapshot_workers as usize,
                failure_threshold: cli.failure_threshold,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.snapshot.probe_timeout >= self.proxy.request_timeout {
            bail!(
                "Probe timeout ({:?}) must be shorter than the request timeout ({:?})",
                self.snapshot.probe_timeout,
                self.proxy.request_timeout
            );
        }
        if self.edge_secret.as_deref() == Some("") {
            bail!("Edge secret must not be empty");
        }
        if self.host_tls.is_enabled() && self.host.is_none() {
            bail!("TLS options require --host");
        }
        self.host_tls.validate()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_bind: SocketAddr::from(([0, 0, 0, 0], 9000)),
            host: None,
            host_tls: HostTls::default(),
            edge_secret: None,
            tunnel: TunnelServerConfig::default(),
            proxy: ProxyConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}
