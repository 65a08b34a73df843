//! Proxy error types

use edgegate_environment::{EndpointUrlError, StoreError};
use http::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to the layer that serves inbound calls
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Environment not found: {0}")]
    EnvironmentNotFound(String),

    /// The environment is down or its transport cannot be reached
    #[error("Environment {environment_id} is unreachable: {reason}")]
    EnvironmentUnreachable {
        environment_id: String,
        reason: String,
    },

    /// One tunnel sub-connection failed; the tunnel itself is unaffected
    #[error("Sub-connection to environment {environment_id} failed: {reason}")]
    SubConnectionFailed {
        environment_id: String,
        reason: String,
    },

    #[error("Invalid environment configuration: {0}")]
    ConfigInvalid(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Upstream protocol error: {0}")]
    UpstreamProtocolError(String),

    #[error("Upgrade failed: {0}")]
    UpgradeFailed(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ProxyError {
    pub fn unreachable(environment_id: &str, reason: impl Into<String>) -> Self {
        ProxyError::EnvironmentUnreachable {
            environment_id: environment_id.to_string(),
            reason: reason.into(),
        }
    }

    /// HTTP status the calling layer should answer with
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::EnvironmentNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::EnvironmentUnreachable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::SubConnectionFailed { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::UpstreamProtocolError(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpgradeFailed(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EndpointUrlError> for ProxyError {
    fn from(err: EndpointUrlError) -> Self {
        ProxyError::ConfigInvalid(err.to_string())
    }
}
