//! Reverse tunnels for edge environments
//!
//! Edge agents sit behind NAT and dial out to the [`TunnelServer`]. After a
//! handshake the connection becomes a [`MuxConnection`]: the server opens one
//! [`MuxStream`] per proxied call, and the agent connects each stream to a
//! target inside its own network. [`TunnelStore`] holds at most one active
//! tunnel per environment.

pub mod agent;
pub mod connection;
pub mod server;
pub mod store;
pub mod stream;

pub use agent::{AgentError, AgentHandle, EdgeAgent, EdgeAgentConfig};
pub use connection::{ControlReceiver, IncomingStream, MuxConnection, Role, TunnelError};
pub use server::{TunnelServer, TunnelServerConfig, TunnelServerError};
pub use store::{Tunnel, TunnelState, TunnelStore};
pub use stream::MuxStream;
