//! Control message types carried on stream 0

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::mux::MuxError;

/// Control-channel message exchanged between the tunnel server and an edge agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    /// Identity frame, always the first frame an agent sends
    Hello {
        environment_id: String,
        credential: String,
        protocol_version: u32,
        metadata: AgentMetadata,
    },
    /// Handshake accepted; the agent must send a keepalive every `heartbeat_interval_ms`
    HelloAccepted {
        environment_id: String,
        heartbeat_interval_ms: u64,
    },
    /// Handshake rejected; the server closes the connection after sending this
    HelloRejected { code: RejectCode, reason: String },

    /// Agent keepalive
    Heartbeat { timestamp: u64 },
    /// Server acknowledgement of a keepalive
    HeartbeatAck { timestamp: u64 },

    /// Either side is closing the tunnel
    Disconnect { reason: String },
}

impl ControlMessage {
    pub fn to_bytes(&self) -> Result<Bytes, MuxError> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, MuxError> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Reason code attached to a rejected handshake
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RejectCode {
    /// Credential verification failed
    InvalidCredential,
    /// No environment with the announced identifier
    UnknownEnvironment,
    /// The environment exists but is not reachable through a tunnel
    NotEdgeEnvironment,
    /// Agent speaks a different protocol version
    ProtocolMismatch,
    /// First frame was not a well-formed `Hello`
    MalformedHello,
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectCode::InvalidCredential => "invalid_credential",
            RejectCode::UnknownEnvironment => "unknown_environment",
            RejectCode::NotEdgeEnvironment => "not_edge_environment",
            RejectCode::ProtocolMismatch => "protocol_mismatch",
            RejectCode::MalformedHello => "malformed_hello",
        };
        f.write_str(s)
    }
}

/// Agent metadata announced in the handshake
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentMetadata {
    pub hostname: String,
    pub platform: String,
    pub version: String,
}

impl AgentMetadata {
    /// Metadata describing the current host
    pub fn current(version: &str) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            hostname,
            platform: std::env::consts::OS.to_string(),
            version: version.to_string(),
        }
    }
}

impl Default for AgentMetadata {
    fn default() -> Self {
        Self {
            hostname: "unknown".to_string(),
            platform: std::env::consts::OS.to_string(),
            version: "0.0.0".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_bytes() {
        let msg = ControlMessage::Hello {
            environment_id: "E1".to_string(),
            credential: "secret".to_string(),
            protocol_version: crate::PROTOCOL_VERSION,
            metadata: AgentMetadata::default(),
        };

        let bytes = msg.to_bytes().unwrap();
        assert_eq!(ControlMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(ControlMessage::from_bytes(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_reject_code_display() {
        assert_eq!(RejectCode::InvalidCredential.to_string(), "invalid_credential");
        assert_eq!(RejectCode::ProtocolMismatch.to_string(), "protocol_mismatch");
    }

    #[test]
    fn test_current_metadata_has_platform() {
        let metadata = AgentMetadata::current("1.2.3");
        assert_eq!(metadata.version, "1.2.3");
        assert_eq!(metadata.platform, std::env::consts::OS);
        assert!(!metadata.hostname.is_empty());
    }
}
