use thiserror::Error;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration loading/validation error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// LLM gateway error.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// Tool resolution/execution error.
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// Agent configuration persistence error.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Rejected policy update request.
    #[error("Policy update error: {0}")]
    PolicyUpdate(#[from] PolicyUpdateError),

    /// Interactive channel error.
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Internal protocol type error.
    #[error("Proto error: {0}")]
    Proto(#[from] ProtoError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field was not provided.
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// A field has an invalid value and reason.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Filesystem read error.
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(String),
}

/// LLM gateway errors
#[derive(Debug, Error)]
pub enum LlmError {
    /// Remote API failure.
    #[error("{0}")]
    Api(String),

    /// The provider refused the request or response on content-policy grounds.
    #[error("Content filtered: {0}")]
    ContentFiltered(String),

    /// Provider response schema/content was invalid.
    #[error("Invalid response from LLM: {0}")]
    InvalidResponse(String),

    /// Serialization/deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Tool resolution and execution errors
#[derive(Debug, Error)]
pub enum ToolError {
    /// Requested tool is not registered with any provider.
    #[error("tool '{0}' not found")]
    NotFound(String),

    /// Tool is registered but its server or function is disallowed.
    #[error("tool '{0}' is not allowed")]
    NotAllowed(String),

    /// The providing side failed to connect, list, or execute.
    #[error("provider error: {0}")]
    Provider(String),

    /// Tool call arguments are invalid.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// The named server is absent from the agent configuration.
    #[error("server '{0}' not found in configuration")]
    UnknownServer(String),

    /// The named provider is not currently loaded.
    #[error("server '{0}' is not loaded")]
    NotLoaded(String),
}

/// Persistence errors
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Filesystem error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Agent id cannot be mapped onto a storage key.
    #[error("Invalid agent id: {0:?}")]
    InvalidAgentId(String),
}

/// Policy update errors. No state is mutated when one of these is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyUpdateError {
    /// Unknown server name.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// Unknown function on a known server.
    #[error("Function not found: {server}/{function}")]
    FunctionNotFound { server: String, function: String },

    /// Flag name outside the closed set valid at this level.
    #[error("Unknown flag: {0}")]
    UnknownFlag(String),

    /// Value cannot be assigned to the flag.
    #[error("Invalid value for {flag}: {reason}")]
    InvalidValue { flag: String, reason: String },
}

/// Interactive channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Sending the pending call failed.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The other side went away before answering.
    #[error("Channel closed")]
    Closed,
}

/// Internal proto errors
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Invalid role string value.
    #[error("Invalid role: {0}")]
    InvalidRole(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_config_error_variant() {
        let err = ConfigError::MissingField("llm.model".to_string());
        assert!(err.to_string().contains("Missing required field"));
    }

    #[test]
    fn wraps_llm_error_into_top_level_error() {
        let err: Error = LlmError::ContentFiltered("hate".to_string()).into();
        assert!(err.to_string().contains("LLM error"));
        assert!(err.to_string().contains("Content filtered"));
    }

    #[test]
    fn tool_error_messages_name_the_tool() {
        assert_eq!(
            ToolError::NotFound("search".to_string()).to_string(),
            "tool 'search' not found"
        );
        assert_eq!(
            ToolError::NotLoaded("files".to_string()).to_string(),
            "server 'files' is not loaded"
        );
    }

    #[test]
    fn wraps_policy_and_channel_errors() {
        let policy_err: Error = PolicyUpdateError::UnknownFlag("colour".to_string()).into();
        assert!(policy_err.to_string().contains("Unknown flag: colour"));

        let channel_err: Error = ChannelError::Closed.into();
        assert!(channel_err.to_string().contains("Channel error"));
    }

    #[test]
    fn wraps_persistence_and_proto_errors() {
        let store_err: Error = PersistenceError::InvalidAgentId("../x".to_string()).into();
        assert!(store_err.to_string().contains("Persistence error"));

        let proto_err: Error = ProtoError::InvalidRole("owner".to_string()).into();
        assert!(proto_err.to_string().contains("Proto error"));
    }
}
