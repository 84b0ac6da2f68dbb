//! Tool-server client.
//!
//! Spawns a server process over stdio, performs the initialize handshake,
//! and implements [`ExternalToolSession`] so the agent can list and call
//! the server's tools.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use proto::{ExternalToolSession, ServerConfig, ToolDefinition, ToolError, ToolServerConnector};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::error::McpError;
use crate::types::*;

/// Session over a spawned server's stdout/stdin.
pub type StdioSession = McpSession<BufReader<ChildStdout>, ChildStdin>;

struct Transport<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> Transport<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn send_line(&mut self, json: &str) -> Result<(), McpError> {
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Reads until the response for `id`. Server notifications are skipped
    /// and server requests are answered inline.
    async fn read_response(&mut self, id: &RpcId) -> Result<JsonRpcResponse, McpError> {
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(McpError::ServerUnavailable(
                    "server closed its output".to_string(),
                ));
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let message: Value = serde_json::from_str(line)?;
            if message.get("method").is_some() {
                if message.get("id").is_some_and(|id| !id.is_null()) {
                    let request: JsonRpcRequest = serde_json::from_value(message)?;
                    self.answer_server_request(request).await?;
                } else {
                    tracing::debug!(method = ?message["method"], "Ignoring server notification");
                }
                continue;
            }
            let response: JsonRpcResponse = serde_json::from_value(message)?;
            if &response.id == id {
                return Ok(response);
            }
            tracing::warn!(expected = %id, got = %response.id, "Discarding unmatched response");
        }
    }

    /// Replies to a request the server sent us. Only `ping` is supported.
    async fn answer_server_request(&mut self, request: JsonRpcRequest) -> Result<(), McpError> {
        let reply = match request.method.as_str() {
            "ping" => JsonRpcResponse::success(request.id, json!({})),
            other => {
                tracing::debug!(method = %other, "Refusing unsupported server request");
                JsonRpcResponse::failure(
                    request.id,
                    METHOD_NOT_FOUND,
                    format!("Method not found: {other}"),
                )
            }
        };
        self.send_line(&serde_json::to_string(&reply)?).await
    }
}

/// A connected tool server.
///
/// Requests are serialized: one request/response exchange holds the
/// transport at a time, so ids always line up.
pub struct McpSession<R, W> {
    server: String,
    transport: Mutex<Transport<R, W>>,
    next_id: AtomicI64,
    child: Mutex<Option<Child>>,
}

impl<R, W> McpSession<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wraps an already-open byte stream. `child` is killed on [`close`](ExternalToolSession::close).
    pub fn new(server: impl Into<String>, reader: R, writer: W, child: Option<Child>) -> Self {
        Self {
            server: server.into(),
            transport: Mutex::new(Transport { reader, writer }),
            next_id: AtomicI64::new(1),
            child: Mutex::new(child),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Send a JSON-RPC request and return its `result`.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = RpcId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let json = serde_json::to_string(&JsonRpcRequest::new(id.clone(), method, params))?;

        tracing::debug!(server = %self.server, method = %method, id = %id, "Sending request");

        let response = {
            let mut transport = self.transport.lock().await;
            transport.send_line(&json).await?;
            transport.read_response(&id).await?
        };

        if let Some(err) = response.error {
            return Err(McpError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        response
            .result
            .ok_or_else(|| McpError::InvalidResponse(format!("{method}: missing result")))
    }

    /// Send a JSON-RPC notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let json = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.transport.lock().await.send_line(&json).await
    }

    /// Perform the initialize handshake.
    pub async fn initialize(&self) -> Result<(), McpError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "toolgate",
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        self.request("initialize", Some(params))
            .await
            .map_err(|e| McpError::ServerUnavailable(e.to_string()))?;
        self.notify("notifications/initialized", None).await?;

        tracing::info!(server = %self.server, "Tool server initialized");
        Ok(())
    }

    /// All tools the server offers, following pagination cursors.
    pub async fn list_tool_infos(&self) -> Result<Vec<ToolInfo>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page: ListToolsResult =
                serde_json::from_value(self.request("tools/list", params).await?)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        tracing::debug!(server = %self.server, count = tools.len(), "Tool discovery complete");
        Ok(tools)
    }

    /// Call a tool and return its text output.
    pub async fn call(&self, name: &str, arguments: Value) -> Result<String, McpError> {
        let params = json!({
            "name": name,
            "arguments": arguments,
        });
        let result: CallToolResult =
            serde_json::from_value(self.request("tools/call", Some(params)).await?)?;
        let text = result.text();
        if result.is_error {
            return Err(McpError::ToolExecution(text));
        }
        Ok(text)
    }
}

#[async_trait]
impl<R, W> ExternalToolSession for McpSession<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolError> {
        let infos = self.list_tool_infos().await?;
        Ok(infos.into_iter().map(ToolDefinition::from).collect())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, ToolError> {
        Ok(self.call(name, arguments).await?)
    }

    async fn close(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            tracing::info!(server = %self.server, "Stopping tool server process");
            if let Err(e) = child.kill().await {
                tracing::warn!(server = %self.server, error = %e, "Failed to stop tool server");
            }
        }
    }
}

/// Connects `stdio` servers by spawning their configured command.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioConnector;

impl StdioConnector {
    /// Spawns the server process and completes the handshake.
    pub async fn spawn(server_name: &str, config: &ServerConfig) -> Result<StdioSession, McpError> {
        if config.kind != "stdio" {
            return Err(McpError::ServerUnavailable(format!(
                "unsupported server type '{}'",
                config.kind
            )));
        }
        tracing::info!(server = %server_name, program = %config.command, "Spawning tool server process");

        let mut child = Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                McpError::ServerUnavailable(format!("failed to start '{}': {e}", config.command))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            McpError::ServerUnavailable("Failed to capture server stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            McpError::ServerUnavailable("Failed to capture server stdout".to_string())
        })?;

        let session = McpSession::new(server_name, BufReader::new(stdout), stdin, Some(child));
        if let Err(e) = session.initialize().await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }
}

#[async_trait]
impl ToolServerConnector for StdioConnector {
    async fn connect(
        &self,
        server_name: &str,
        config: &ServerConfig,
    ) -> Result<Arc<dyn ExternalToolSession>, ToolError> {
        let session = Self::spawn(server_name, config).await?;
        Ok(Arc::new(session))
    }
}
