//! Error types for the tool-server client.

use proto::ToolError;

/// Errors that can occur while talking to a tool server.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// Failed to parse JSON.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Transport I/O error.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The server answered with a JSON-RPC error object.
    #[error("Server error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// A response was missing its `result`.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The tool ran but reported failure.
    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    /// The server process exited or could not be started.
    #[error("Server unavailable: {0}")]
    ServerUnavailable(String),
}

impl From<McpError> for ToolError {
    fn from(err: McpError) -> Self {
        ToolError::Provider(err.to_string())
    }
}
