//! Environment connection descriptor parsing

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointUrlError {
    #[error("Invalid endpoint protocol: only unix://, npipe://, tcp://, http:// and https:// are supported")]
    UnsupportedScheme,

    #[error("Invalid endpoint URL '{0}': missing host")]
    MissingHost(String),

    #[error("Invalid endpoint URL '{0}': missing socket or pipe path")]
    MissingPath(String),

    #[error("Invalid endpoint URL '{url}': bad port '{port}'")]
    InvalidPort { url: String, port: String },

    #[error("Unable to locate Unix socket or named pipe: {0}")]
    SocketNotFound(String),
}

/// Parsed connection descriptor of an environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointUrl {
    Unix(PathBuf),
    NamedPipe(String),
    Tcp {
        host: String,
        port: u16,
        /// Path prefix prepended to every forwarded request ("" when absent)
        base_path: String,
        /// `https://` scheme; `tcp://` and `http://` rely on the TLS settings instead
        https: bool,
    },
}

const DEFAULT_DOCKER_PORT: u16 = 2375;

impl EndpointUrl {
    pub fn parse(url: &str) -> Result<Self, EndpointUrlError> {
        if let Some(path) = url.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(EndpointUrlError::MissingPath(url.to_string()));
            }
            return Ok(EndpointUrl::Unix(PathBuf::from(path)));
        }

        if let Some(path) = url.strip_prefix("npipe://") {
            if path.is_empty() {
                return Err(EndpointUrlError::MissingPath(url.to_string()));
            }
            return Ok(EndpointUrl::NamedPipe(path.replace('/', "\\")));
        }

        let (rest, default_port, https) = if let Some(rest) = url.strip_prefix("tcp://") {
            (rest, DEFAULT_DOCKER_PORT, false)
        } else if let Some(rest) = url.strip_prefix("http://") {
            (rest, 80, false)
        } else if let Some(rest) = url.strip_prefix("https://") {
            (rest, 443, true)
        } else {
            return Err(EndpointUrlError::UnsupportedScheme);
        };

        let (authority, base_path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].trim_end_matches('/')),
            None => (rest, ""),
        };

        if authority.is_empty() {
            return Err(EndpointUrlError::MissingHost(url.to_string()));
        }

        let (host, port) = split_host_port(authority, default_port).map_err(|port| {
            EndpointUrlError::InvalidPort {
                url: url.to_string(),
                port,
            }
        })?;

        if host.is_empty() {
            return Err(EndpointUrlError::MissingHost(url.to_string()));
        }

        Ok(EndpointUrl::Tcp {
            host,
            port,
            base_path: base_path.to_string(),
            https,
        })
    }

    /// Validate the URL given for the primary environment on the command line
    ///
    /// Only `unix://`, `tcp://` and `npipe://` are accepted there, and socket or
    /// pipe paths must exist.
    pub fn validate_host_flag(url: &str) -> Result<Self, EndpointUrlError> {
        if !(url.starts_with("unix://") || url.starts_with("tcp://") || url.starts_with("npipe://"))
        {
            return Err(EndpointUrlError::UnsupportedScheme);
        }

        let parsed = Self::parse(url)?;
        match &parsed {
            EndpointUrl::Unix(path) => ensure_exists(path)?,
            EndpointUrl::NamedPipe(pipe) => ensure_exists(Path::new(pipe))?,
            EndpointUrl::Tcp { .. } => {}
        }
        Ok(parsed)
    }

    /// Target string handed to an edge agent for dialing
    pub fn agent_target(&self) -> String {
        match self {
            EndpointUrl::Unix(path) => format!("unix://{}", path.display()),
            EndpointUrl::NamedPipe(pipe) => format!("npipe://{}", pipe),
            EndpointUrl::Tcp { host, port, .. } => format!("{}:{}", host, port),
        }
    }

    /// Value for the `Host` header sent to the backend
    pub fn host_header(&self) -> String {
        match self {
            // Docker ignores the host on local sockets
            EndpointUrl::Unix(_) | EndpointUrl::NamedPipe(_) => "docker".to_string(),
            EndpointUrl::Tcp { host, port, .. } => format!("{}:{}", host, port),
        }
    }

    pub fn base_path(&self) -> &str {
        match self {
            EndpointUrl::Tcp { base_path, .. } => base_path,
            _ => "",
        }
    }
}

fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16), String> {
    // Bracketed IPv6 literal
    if let Some(rest) = authority.strip_prefix('[') {
        let Some(end) = rest.find(']') else {
            return Err(authority.to_string());
        };
        let host = format!("[{}]", &rest[..end]);
        let tail = &rest[end + 1..];
        return match tail.strip_prefix(':') {
            Some(port) => port
                .parse()
                .map(|p| (host, p))
                .map_err(|_| port.to_string()),
            None => Ok((host, default_port)),
        };
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => port
            .parse()
            .map(|p| (host.to_string(), p))
            .map_err(|_| port.to_string()),
        None => Ok((authority.to_string(), default_port)),
    }
}

fn ensure_exists(path: &Path) -> Result<(), EndpointUrlError> {
    if path.exists() {
        Ok(())
    } else {
        Err(EndpointUrlError::SocketNotFound(path.display().to_string()))
    }
}
