//! Shared protocol types for the agent turn loop, tool providers, and front ends.
//!
//! This crate defines the serializable conversation/policy structures, the
//! capability traits the core consumes, and strongly-typed error enums shared
//! across the workspace.

pub mod approval;
pub mod error;
pub mod message;
pub mod policy;
pub mod tool;

/// Re-export of confirmation types.
pub use approval::{ConfirmationDecision, InteractiveChannel, PendingToolCall};
/// Re-export of all protocol error types.
pub use error::*;
/// Re-export of conversation/message identity types.
pub use message::{AgentId, Message, Role};
/// Re-export of persisted policy types.
pub use policy::{AgentConfig, ConfirmationState, FunctionConfig, PolicyFlag, ServerConfig};
/// Re-export of tool call types and external tool-server capabilities.
pub use tool::{
    ExternalToolSession, FunctionCall, NoTransportConnector, ProviderKind, ToolCall, ToolCallKind,
    ToolDefinition, ToolServerConnector,
};
