//! Persisted per-agent policy: servers, functions, confirmation state and history.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PolicyUpdateError;
use crate::message::{Message, Role};
use crate::tool::ToolDefinition;

/// Stored approval policy for one function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationState {
    /// Execute without asking.
    AlwaysConfirmed,
    /// Reject without asking.
    AlwaysRejected,
    /// Ask the interactive channel every time.
    #[default]
    AlwaysAsk,
}

impl std::fmt::Display for ConfirmationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlwaysConfirmed => write!(f, "always_confirmed"),
            Self::AlwaysRejected => write!(f, "always_rejected"),
            Self::AlwaysAsk => write!(f, "always_ask"),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Policy and last-observed schema of one remote function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionConfig {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default = "default_true")]
    pub allowed: bool,
    #[serde(default)]
    pub confirmed: ConfirmationState,
}

impl FunctionConfig {
    /// Fresh policy for a newly observed function: allowed, always ask.
    pub fn observed(description: impl Into<String>, parameters: Value) -> Self {
        Self {
            description: description.into(),
            parameters,
            allowed: true,
            confirmed: ConfirmationState::AlwaysAsk,
        }
    }
}

fn default_server_kind() -> String {
    "stdio".to_string()
}

/// One tool provider's launch description and policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Transport kind, e.g. `stdio`.
    #[serde(rename = "type", default = "default_server_kind")]
    pub kind: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gallery: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Last-observed functions; absent until the server was first listed.
    #[serde(default)]
    pub functions: Option<BTreeMap<String, FunctionConfig>>,
    #[serde(default = "default_true")]
    pub allowed: bool,
}

impl ServerConfig {
    /// A stdio server launched as `command args...`, allowed, with no observed functions.
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            kind: default_server_kind(),
            command: command.into(),
            args,
            gallery: None,
            version: None,
            functions: None,
            allowed: true,
        }
    }

    pub fn function(&self, name: &str) -> Option<&FunctionConfig> {
        self.functions.as_ref()?.get(name)
    }

    /// Stored confirmation state of `name`, defaulting to ask for unseen functions.
    pub fn confirmation_for(&self, name: &str) -> ConfirmationState {
        self.function(name)
            .map(|f| f.confirmed)
            .unwrap_or_default()
    }

    /// Whether `name` may be offered to and called by the model.
    pub fn permits(&self, name: &str) -> bool {
        self.allowed && self.function(name).is_none_or(|f| f.allowed)
    }

    /// Records the schemas a server reported.
    ///
    /// New functions are added with default policy; known functions whose
    /// description or parameters drifted get the new schema while keeping
    /// `allowed` and `confirmed`. Returns the number of entries written.
    pub fn merge_reported_tools(&mut self, tools: &[ToolDefinition]) -> usize {
        let functions = self.functions.get_or_insert_with(BTreeMap::new);
        let mut changed = 0;
        for tool in tools {
            match functions.get_mut(&tool.name) {
                Some(existing)
                    if existing.description == tool.description
                        && existing.parameters == tool.parameters => {}
                Some(existing) => {
                    existing.description = tool.description.clone();
                    existing.parameters = tool.parameters.clone();
                    changed += 1;
                }
                None => {
                    functions.insert(
                        tool.name.clone(),
                        FunctionConfig::observed(tool.description.clone(), tool.parameters.clone()),
                    );
                    changed += 1;
                }
            }
        }
        changed
    }
}

/// Closed set of policy flags that can be updated by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyFlag {
    Allowed,
    Confirmed,
}

impl std::str::FromStr for PolicyFlag {
    type Err = PolicyUpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allowed" => Ok(Self::Allowed),
            "confirmed" => Ok(Self::Confirmed),
            other => Err(PolicyUpdateError::UnknownFlag(other.to_string())),
        }
    }
}

impl std::fmt::Display for PolicyFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allowed => write!(f, "allowed"),
            Self::Confirmed => write!(f, "confirmed"),
        }
    }
}

/// The persisted aggregate of one agent identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// System prompt text.
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
    #[serde(default)]
    pub history: Vec<Message>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new("")
    }
}

impl AgentConfig {
    /// Creates a config with no servers and a history holding only the system prompt.
    pub fn new(description: impl Into<String>) -> Self {
        let mut config = Self {
            description: description.into(),
            servers: BTreeMap::new(),
            history: Vec::new(),
        };
        config.reset_history();
        config
    }

    /// Replaces the history with a single system message built from `description`.
    pub fn reset_history(&mut self) {
        self.history = vec![Message::system(self.description.clone())];
    }

    /// Restores the leading system message on histories loaded without one.
    pub fn ensure_system_prompt(&mut self) {
        if self.history.first().map(|m| m.role) != Some(Role::System) {
            self.history.insert(0, Message::system(self.description.clone()));
        }
    }

    /// Sets a policy flag on a server (`function == None`) or on one of its functions.
    ///
    /// Validation happens before any write, so an error leaves the config untouched.
    pub fn update_policy_flag(
        &mut self,
        server_name: &str,
        function_name: Option<&str>,
        flag_name: &str,
        value: &Value,
    ) -> Result<(), PolicyUpdateError> {
        let flag: PolicyFlag = flag_name.parse()?;
        let server = self
            .servers
            .get_mut(server_name)
            .ok_or_else(|| PolicyUpdateError::ServerNotFound(server_name.to_string()))?;

        let Some(function_name) = function_name else {
            return match flag {
                PolicyFlag::Allowed => {
                    server.allowed = parse_bool(flag, value)?;
                    Ok(())
                }
                // Confirmation is a per-function setting only.
                PolicyFlag::Confirmed => Err(PolicyUpdateError::UnknownFlag(flag.to_string())),
            };
        };

        let function = server
            .functions
            .as_mut()
            .and_then(|f| f.get_mut(function_name))
            .ok_or_else(|| PolicyUpdateError::FunctionNotFound {
                server: server_name.to_string(),
                function: function_name.to_string(),
            })?;
        match flag {
            PolicyFlag::Allowed => function.allowed = parse_bool(flag, value)?,
            PolicyFlag::Confirmed => function.confirmed = parse_confirmation(flag, value)?,
        }
        Ok(())
    }

    /// Overwrites the stored confirmation state of one function, if it is known.
    pub fn set_confirmation(
        &mut self,
        server_name: &str,
        function_name: &str,
        state: ConfirmationState,
    ) -> bool {
        let Some(function) = self
            .servers
            .get_mut(server_name)
            .and_then(|s| s.functions.as_mut())
            .and_then(|f| f.get_mut(function_name))
        else {
            return false;
        };
        function.confirmed = state;
        true
    }
}

fn parse_bool(flag: PolicyFlag, value: &Value) -> Result<bool, PolicyUpdateError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        other => Err(PolicyUpdateError::InvalidValue {
            flag: flag.to_string(),
            reason: format!("expected a boolean, got {other}"),
        }),
    }
}

fn parse_confirmation(
    flag: PolicyFlag,
    value: &Value,
) -> Result<ConfirmationState, PolicyUpdateError> {
    serde_json::from_value(value.clone()).map_err(|_| PolicyUpdateError::InvalidValue {
        flag: flag.to_string(),
        reason: format!(
            "expected one of always_confirmed, always_rejected, always_ask, got {value}"
        ),
    })
}
