//! Tool router: one name index over the local provider and loaded remote providers.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use proto::{ProviderKind, ServerConfig, ToolDefinition, ToolError, ToolServerConnector};
use serde_json::Value;
use tracing::debug;

use crate::local::{AdminContext, LocalToolProvider};
use crate::remote::RemoteRegistry;

/// Which provider owns a tool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderRef {
    pub kind: ProviderKind,
    pub name: String,
}

/// A tool as seen through the router. Rebuilt on every listing, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub definition: ToolDefinition,
    pub provider: ProviderRef,
}

impl ToolDescriptor {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn is_local(&self) -> bool {
        self.provider.kind == ProviderKind::Local
    }
}

/// Aggregates the providers of one session.
///
/// The local provider is registered first, then remote providers in load
/// order. When two providers expose the same tool name the first-registered
/// one is authoritative for both listing and resolution.
pub struct ToolRouter {
    local: LocalToolProvider,
    remotes: RemoteRegistry,
}

impl ToolRouter {
    pub fn new(connector: Arc<dyn ToolServerConnector>) -> Self {
        Self {
            local: LocalToolProvider::new(),
            remotes: RemoteRegistry::new(connector),
        }
    }

    pub fn remotes(&self) -> &RemoteRegistry {
        &self.remotes
    }

    /// Every registered tool, unfiltered, first-registered provider first.
    fn registered(&self) -> impl Iterator<Item = ToolDescriptor> + '_ {
        let local = self.local.definitions().into_iter().map(|definition| ToolDescriptor {
            definition,
            provider: ProviderRef {
                kind: ProviderKind::Local,
                name: LocalToolProvider::NAME.to_string(),
            },
        });
        let remote = self.remotes.providers().iter().flat_map(|provider| {
            provider.tools().iter().map(|definition| ToolDescriptor {
                definition: definition.clone(),
                provider: ProviderRef {
                    kind: ProviderKind::Remote,
                    name: provider.name().to_string(),
                },
            })
        });
        local.chain(remote)
    }

    /// The allow-listed view offered to the model.
    ///
    /// Local tools are always present. A remote tool appears only when its
    /// server and its function are both allowed.
    pub fn flattened_tools(&self, servers: &BTreeMap<String, ServerConfig>) -> Vec<ToolDescriptor> {
        let mut seen = HashSet::new();
        self.registered()
            .filter(|d| seen.insert(d.definition.name.clone()))
            .filter(|d| is_permitted(d, servers))
            .collect()
    }

    /// Finds the authoritative provider for `name`.
    pub fn resolve(&self, name: &str) -> Result<ToolDescriptor, ToolError> {
        self.registered()
            .find(|d| d.definition.name == name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    /// Re-lists loaded remote providers, recording schema drift into `servers`.
    pub async fn refresh(&mut self, servers: &mut BTreeMap<String, ServerConfig>) {
        self.remotes.refresh(servers).await;
    }

    /// Executes a resolved tool.
    pub async fn call(
        &mut self,
        descriptor: &ToolDescriptor,
        args: Value,
        servers: &mut BTreeMap<String, ServerConfig>,
    ) -> Result<String, ToolError> {
        debug!(tool = %descriptor.name(), provider = %descriptor.provider.name, "Routing tool call");
        match descriptor.provider.kind {
            ProviderKind::Local => {
                let mut ctx = AdminContext {
                    servers,
                    remotes: &mut self.remotes,
                };
                self.local.call(descriptor.name(), &mut ctx, args).await
            }
            ProviderKind::Remote => {
                let provider = self
                    .remotes
                    .get(&descriptor.provider.name)
                    .ok_or_else(|| ToolError::NotLoaded(descriptor.provider.name.clone()))?;
                provider.call_tool(descriptor.name(), args).await
            }
        }
    }

    /// Releases every remote provider.
    pub async fn shutdown(&mut self) {
        self.remotes.shutdown_all().await;
    }
}

/// Allow-list check: local tools always pass; remote tools need server and function allowed.
pub fn is_permitted(descriptor: &ToolDescriptor, servers: &BTreeMap<String, ServerConfig>) -> bool {
    match descriptor.provider.kind {
        ProviderKind::Local => true,
        ProviderKind::Remote => servers
            .get(&descriptor.provider.name)
            .is_some_and(|s| s.permits(descriptor.name())),
    }
}
