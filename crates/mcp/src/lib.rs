//! Stdio JSON-RPC transport for external tool servers.
//!
//! - **types**: JSON-RPC 2.0 and tool-server protocol messages
//! - **client**: session over a spawned server process, and the connector
//!   that plugs it into the agent's provider registry
//! - **error**: transport and protocol failures

pub mod client;
pub mod error;
pub mod types;

pub use client::{McpSession, StdioConnector, StdioSession};
pub use error::McpError;
pub use types::*;
