//! Remote tool providers: one lazily-connected external tool-server session each.

use std::collections::BTreeMap;
use std::sync::Arc;

use proto::{ExternalToolSession, ServerConfig, ToolDefinition, ToolError, ToolServerConnector};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// A loaded external tool server.
///
/// The session is opened on the first `list_tools`/`call_tool` and at most
/// once; dropping or shutting down the provider releases it.
pub struct RemoteToolProvider {
    name: String,
    launch: ServerConfig,
    connector: Arc<dyn ToolServerConnector>,
    session: OnceCell<Arc<dyn ExternalToolSession>>,
    tools: Vec<ToolDefinition>,
}

impl RemoteToolProvider {
    pub fn new(
        name: impl Into<String>,
        launch: ServerConfig,
        connector: Arc<dyn ToolServerConnector>,
    ) -> Self {
        Self {
            name: name.into(),
            launch,
            connector,
            session: OnceCell::new(),
            tools: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.session.initialized()
    }

    /// Tools seen on the last successful listing.
    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    /// Opens the session if needed. A failed attempt leaves the provider unconnected.
    pub async fn connect(&self) -> Result<Arc<dyn ExternalToolSession>, ToolError> {
        let session = self
            .session
            .get_or_try_init(|| async {
                info!(server = %self.name, command = %self.launch.command, "Connecting to tool server");
                self.connector
                    .connect(&self.name, &self.launch)
                    .await
                    .map_err(into_provider_error)
            })
            .await?;
        Ok(Arc::clone(session))
    }

    /// Queries the server and records schema drift into `policy`.
    pub async fn list_tools(
        &mut self,
        policy: &mut ServerConfig,
    ) -> Result<Vec<ToolDefinition>, ToolError> {
        let session = self.connect().await?;
        let tools = session.list_tools().await.map_err(into_provider_error)?;
        let changed = policy.merge_reported_tools(&tools);
        if changed > 0 {
            debug!(server = %self.name, changed, "Stored tool schemas updated");
        }
        self.tools = tools.clone();
        Ok(tools)
    }

    /// Forwards a call; every failure comes back as [`ToolError::Provider`].
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<String, ToolError> {
        let session = self.connect().await?;
        session
            .call_tool(name, args)
            .await
            .map_err(into_provider_error)
    }

    /// Releases the session, if one was opened.
    pub async fn shutdown(self) {
        if let Some(session) = self.session.get() {
            debug!(server = %self.name, "Closing tool server session");
            session.close().await;
        }
    }
}

fn into_provider_error(err: ToolError) -> ToolError {
    match err {
        ToolError::Provider(_) => err,
        other => ToolError::Provider(other.to_string()),
    }
}

/// The remote providers of one session, in registration order.
pub struct RemoteRegistry {
    connector: Arc<dyn ToolServerConnector>,
    providers: Vec<RemoteToolProvider>,
}

impl RemoteRegistry {
    pub fn new(connector: Arc<dyn ToolServerConnector>) -> Self {
        Self {
            connector,
            providers: Vec::new(),
        }
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.providers.iter().any(|p| p.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&RemoteToolProvider> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Loaded providers, first-registered first.
    pub fn providers(&self) -> &[RemoteToolProvider] {
        &self.providers
    }

    /// Activates the configured server `name` and lists its tools.
    ///
    /// The server is registered only once its listing succeeds. Reloading a
    /// loaded server swaps in the fresh connection at the same position and
    /// then releases the old session; a failed reload leaves the old one in
    /// place. Returns the number of tools.
    pub async fn load(
        &mut self,
        name: &str,
        servers: &mut BTreeMap<String, ServerConfig>,
    ) -> Result<usize, ToolError> {
        let policy = servers
            .get_mut(name)
            .ok_or_else(|| ToolError::UnknownServer(name.to_string()))?;

        let mut provider =
            RemoteToolProvider::new(name, policy.clone(), Arc::clone(&self.connector));
        let tools = match provider.list_tools(policy).await {
            Ok(tools) => tools,
            Err(e) => {
                warn!(server = %name, error = %e, "Tool server load failed");
                provider.shutdown().await;
                return Err(e);
            }
        };

        match self.providers.iter().position(|p| p.name == name) {
            Some(pos) => {
                let previous = std::mem::replace(&mut self.providers[pos], provider);
                previous.shutdown().await;
            }
            None => self.providers.push(provider),
        }
        info!(server = %name, tools = tools.len(), "Tool server loaded");
        Ok(tools.len())
    }

    /// Releases the provider `name`; fails if it is not loaded.
    pub async fn unload(&mut self, name: &str) -> Result<(), ToolError> {
        let pos = self
            .providers
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| ToolError::NotLoaded(name.to_string()))?;
        let provider = self.providers.remove(pos);
        provider.shutdown().await;
        info!(server = %name, "Tool server unloaded");
        Ok(())
    }

    /// Re-lists every loaded provider. Failures are scoped to their provider.
    pub async fn refresh(&mut self, servers: &mut BTreeMap<String, ServerConfig>) {
        for provider in &mut self.providers {
            let Some(policy) = servers.get_mut(&provider.name) else {
                warn!(server = %provider.name, "Loaded server missing from configuration");
                continue;
            };
            if let Err(e) = provider.list_tools(policy).await {
                warn!(server = %provider.name, error = %e, "Tool listing failed");
            }
        }
    }

    /// Releases every provider.
    pub async fn shutdown_all(&mut self) {
        for provider in self.providers.drain(..) {
            provider.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_support::{FakeConnector, FakeToolServer};

    fn servers() -> BTreeMap<String, ServerConfig> {
        let mut servers = BTreeMap::new();
        servers.insert("files".to_string(), ServerConfig::stdio("files-server", vec![]));
        servers
    }

    #[tokio::test]
    async fn connects_lazily_and_once() {
        let server = FakeToolServer::new(&["read"]);
        let connector = Arc::new(FakeConnector::new().with_server("files", server.clone()));
        let mut policy = ServerConfig::stdio("files-server", vec![]);
        let mut provider = RemoteToolProvider::new("files", policy.clone(), connector.clone());
        assert!(!provider.is_connected());
        assert_eq!(connector.connect_count(), 0);

        provider.list_tools(&mut policy).await.expect("list");
        provider.call_tool("read", json!({})).await.expect("call");
        provider.list_tools(&mut policy).await.expect("list again");

        assert!(provider.is_connected());
        assert_eq!(connector.connect_count(), 1);
        assert!(policy.function("read").is_some());
    }

    #[tokio::test]
    async fn call_failures_become_provider_errors() {
        let server = FakeToolServer::new(&["read"]).failing_calls();
        let connector = Arc::new(FakeConnector::new().with_server("files", server));
        let provider =
            RemoteToolProvider::new("files", ServerConfig::stdio("x", vec![]), connector);
        let err = provider
            .call_tool("read", json!({}))
            .await
            .expect_err("call should fail");
        assert!(matches!(err, ToolError::Provider(_)));
    }

    #[tokio::test]
    async fn connect_failure_is_scoped_and_retried() {
        let connector = Arc::new(FakeConnector::new());
        let provider =
            RemoteToolProvider::new("ghost", ServerConfig::stdio("x", vec![]), connector.clone());
        let err = provider.connect().await.err().expect("no such server");
        assert!(matches!(err, ToolError::Provider(_)));
        assert!(!provider.is_connected());
        assert!(provider.connect().await.is_err());
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn unload_releases_session_and_reload_reconnects() {
        let server = FakeToolServer::new(&["read"]);
        let connector = Arc::new(FakeConnector::new().with_server("files", server.clone()));
        let mut registry = RemoteRegistry::new(connector.clone());
        let mut servers = servers();

        assert_eq!(registry.load("files", &mut servers).await.expect("load"), 1);
        assert!(registry.is_loaded("files"));

        registry.unload("files").await.expect("unload");
        assert!(!registry.is_loaded("files"));
        assert_eq!(server.close_count(), 1);

        registry.load("files", &mut servers).await.expect("reload");
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn reloading_a_loaded_server_replaces_its_session() {
        let server = FakeToolServer::new(&["read"]);
        let connector = Arc::new(FakeConnector::new().with_server("files", server.clone()));
        let mut registry = RemoteRegistry::new(connector.clone());
        let mut servers = servers();

        registry.load("files", &mut servers).await.expect("load");
        registry.load("files", &mut servers).await.expect("reload");

        assert_eq!(registry.providers().len(), 1);
        assert_eq!(server.close_count(), 1);
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn failed_load_does_not_register_the_server() {
        let connector = Arc::new(FakeConnector::new());
        let mut registry = RemoteRegistry::new(connector.clone());
        let mut servers = servers();

        let err = registry
            .load("files", &mut servers)
            .await
            .expect_err("cannot spawn");
        assert!(matches!(err, ToolError::Provider(_)));
        assert!(!registry.is_loaded("files"));
        assert!(registry.providers().is_empty());
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn failed_reload_keeps_the_working_session() {
        let server = FakeToolServer::new(&["read"]);
        let connector = Arc::new(FakeConnector::new().with_server("files", server.clone()));
        let mut registry = RemoteRegistry::new(connector.clone());
        let mut servers = servers();
        registry.load("files", &mut servers).await.expect("load");

        server.set_listing_fails(true);
        registry
            .load("files", &mut servers)
            .await
            .expect_err("listing fails");
        server.set_listing_fails(false);

        assert!(registry.is_loaded("files"));
        let provider = registry.get("files").expect("still loaded");
        assert_eq!(provider.tools().len(), 1);
        assert_eq!(server.close_count(), 1);
        provider.call_tool("read", json!({})).await.expect("old session serves");
        assert_eq!(server.calls().len(), 1);
    }

    #[tokio::test]
    async fn reload_keeps_registration_order() {
        let connector = Arc::new(
            FakeConnector::new()
                .with_server("alpha", FakeToolServer::new(&["read"]))
                .with_server("beta", FakeToolServer::new(&["read"])),
        );
        let mut registry = RemoteRegistry::new(connector);
        let mut servers = BTreeMap::new();
        servers.insert("alpha".to_string(), ServerConfig::stdio("a", vec![]));
        servers.insert("beta".to_string(), ServerConfig::stdio("b", vec![]));

        registry.load("alpha", &mut servers).await.expect("alpha");
        registry.load("beta", &mut servers).await.expect("beta");
        registry.load("alpha", &mut servers).await.expect("reload alpha");

        let names: Vec<&str> = registry.providers().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn unload_of_unknown_server_is_an_error() {
        let mut registry = RemoteRegistry::new(Arc::new(FakeConnector::new()));
        let err = registry.unload("files").await.expect_err("not loaded");
        assert!(matches!(err, ToolError::NotLoaded(_)));
    }

    #[tokio::test]
    async fn refresh_records_schema_drift() {
        let server = FakeToolServer::new(&["read"]);
        let connector = Arc::new(FakeConnector::new().with_server("files", server.clone()));
        let mut registry = RemoteRegistry::new(connector);
        let mut servers = servers();
        registry.load("files", &mut servers).await.expect("load");

        server.set_tools(vec![ToolDefinition::new(
            "read",
            "Read a file (paged)",
            json!({"type": "object", "properties": {"page": {"type": "integer"}}}),
        )]);
        registry.refresh(&mut servers).await;

        let read = servers["files"].function("read").expect("read");
        assert_eq!(read.description, "Read a file (paged)");
    }
}
