//! Tool call/definition types and the capability traits for external tool servers.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;
use crate::policy::ServerConfig;

/// Kind tag of a tool call; the chat-completions wire format only knows `function`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallKind {
    #[default]
    Function,
}

/// Function name and raw JSON argument string chosen by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Arguments exactly as the model produced them.
    pub arguments: String,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call id echoed back on the tool-role reply.
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: ToolCallKind,
    pub function: FunctionCall,
}

impl ToolCall {
    /// Builds a function tool call from already-serialized arguments.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ToolCallKind::Function,
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Requested tool name.
    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// Parses the argument string. Blank arguments read as an empty object.
    pub fn parsed_arguments(&self) -> Result<Value, ToolError> {
        let raw = self.function.arguments.trim();
        if raw.is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(raw).map_err(|e| ToolError::InvalidArgs(e.to_string()))
    }
}

/// Schema-described callable as presented to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the accepted arguments.
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Whether a provider lives in-process or behind a tool-server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Local,
    Remote,
}

/// One live session with an external tool server.
///
/// Implementations own the transport (and, for subprocess servers, the
/// process). A session is never shared between two agents.
#[async_trait]
pub trait ExternalToolSession: Send + Sync {
    /// Lists the tools the server currently exposes.
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolError>;

    /// Invokes a tool and returns its textual result.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, ToolError>;

    /// Releases the connection/process. Calls after `close` fail.
    async fn close(&self);
}

/// Opens sessions to external tool servers described by a [`ServerConfig`].
#[async_trait]
pub trait ToolServerConnector: Send + Sync {
    async fn connect(
        &self,
        server_name: &str,
        config: &ServerConfig,
    ) -> Result<Arc<dyn ExternalToolSession>, ToolError>;
}

/// Connector for deployments without any tool-server transport; every connect fails.
pub struct NoTransportConnector;

#[async_trait]
impl ToolServerConnector for NoTransportConnector {
    async fn connect(
        &self,
        server_name: &str,
        _config: &ServerConfig,
    ) -> Result<Arc<dyn ExternalToolSession>, ToolError> {
        Err(ToolError::Provider(format!(
            "no tool-server transport available for '{server_name}'"
        )))
    }
}
