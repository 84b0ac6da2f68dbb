//! In-process administrative tools: list, load and unload tool servers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use proto::{ServerConfig, ToolDefinition, ToolError};
use serde_json::{Value, json};
use tracing::debug;

use crate::remote::RemoteRegistry;

/// Session state an administrative tool may read or change.
pub struct AdminContext<'a> {
    /// The agent's server policy map.
    pub servers: &'a mut BTreeMap<String, ServerConfig>,
    /// Currently loaded remote providers.
    pub remotes: &'a mut RemoteRegistry,
}

/// An in-process tool. Sync and async bodies share this one calling convention.
#[async_trait]
pub trait AdminTool: Send + Sync {
    /// Unique tool name exposed to the LLM.
    fn name(&self) -> &str;
    /// Human-readable description for tool selection.
    fn description(&self) -> &str;
    /// JSON schema for accepted tool arguments.
    fn parameters_schema(&self) -> Value;
    /// Runs the tool against the session state.
    async fn invoke(&self, ctx: &mut AdminContext<'_>, args: Value) -> Result<String, ToolError>;
}

/// The fixed set of administrative tools. Calls into it are always pre-approved.
pub struct LocalToolProvider {
    tools: Vec<Box<dyn AdminTool>>,
}

impl LocalToolProvider {
    /// Provider name used in tool descriptors.
    pub const NAME: &'static str = "local";

    pub fn new() -> Self {
        Self {
            tools: vec![
                Box::new(ListProviders),
                Box::new(LoadProvider),
                Box::new(UnloadProvider),
            ],
        }
    }

    /// Tool definitions in declaration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition::new(t.name(), t.description(), t.parameters_schema()))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name() == name)
    }

    pub async fn call(
        &self,
        name: &str,
        ctx: &mut AdminContext<'_>,
        args: Value,
    ) -> Result<String, ToolError> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        debug!(tool = %name, "Invoking local admin tool");
        tool.invoke(ctx, args).await
    }
}

impl Default for LocalToolProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn server_name_schema(action: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": {
                "type": "string",
                "description": format!("Name of the tool server to {action}")
            }
        },
        "required": ["name"]
    })
}

fn server_name_arg(args: &Value) -> Result<&str, ToolError> {
    args.get("name")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidArgs("missing 'name'".to_string()))
}

struct ListProviders;

#[async_trait]
impl AdminTool for ListProviders {
    fn name(&self) -> &str {
        "list_providers"
    }

    fn description(&self) -> &str {
        "List the tool servers configured for this agent and whether each is loaded"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn invoke(&self, ctx: &mut AdminContext<'_>, _args: Value) -> Result<String, ToolError> {
        let entries: Vec<Value> = ctx
            .servers
            .iter()
            .map(|(name, server)| {
                json!({
                    "name": name,
                    "loaded": ctx.remotes.is_loaded(name),
                    "allowed": server.allowed,
                })
            })
            .collect();
        Ok(Value::Array(entries).to_string())
    }
}

struct LoadProvider;

#[async_trait]
impl AdminTool for LoadProvider {
    fn name(&self) -> &str {
        "load_provider"
    }

    fn description(&self) -> &str {
        "Load a configured tool server by name and make its tools available"
    }

    fn parameters_schema(&self) -> Value {
        server_name_schema("load")
    }

    async fn invoke(&self, ctx: &mut AdminContext<'_>, args: Value) -> Result<String, ToolError> {
        let name = server_name_arg(&args)?;
        let count = ctx.remotes.load(name, ctx.servers).await?;
        Ok(format!("Loaded server '{name}' with {count} tools"))
    }
}

struct UnloadProvider;

#[async_trait]
impl AdminTool for UnloadProvider {
    fn name(&self) -> &str {
        "unload_provider"
    }

    fn description(&self) -> &str {
        "Unload a loaded tool server by name and release its connection"
    }

    fn parameters_schema(&self) -> Value {
        server_name_schema("unload")
    }

    async fn invoke(&self, ctx: &mut AdminContext<'_>, args: Value) -> Result<String, ToolError> {
        let name = server_name_arg(&args)?;
        ctx.remotes.unload(name).await?;
        Ok(format!("Unloaded server '{name}'"))
    }
}
