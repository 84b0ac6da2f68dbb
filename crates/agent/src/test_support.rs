//! In-memory fakes for the capabilities the turn loop consumes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use proto::{
    ChannelError, ConfirmationDecision, ExternalToolSession, InteractiveChannel, LlmError,
    Message, PendingToolCall, ServerConfig, ToolCall, ToolDefinition, ToolError,
    ToolServerConnector,
};
use serde_json::{Value, json};

use crate::llm::{ChatCompletion, ChatRequest, LlmGateway, TokenUsage};

#[derive(Default)]
struct ServerState {
    tools: Mutex<Vec<ToolDefinition>>,
    calls: Mutex<Vec<(String, Value)>>,
    closes: AtomicUsize,
    fail_calls: bool,
    fail_lists: AtomicBool,
}

/// A scriptable external tool server; clones share state.
#[derive(Clone, Default)]
pub(crate) struct FakeToolServer {
    state: Arc<ServerState>,
}

impl FakeToolServer {
    pub(crate) fn new(names: &[&str]) -> Self {
        let tools = names
            .iter()
            .map(|n| ToolDefinition::new(*n, format!("{n} tool"), json!({"type": "object"})))
            .collect();
        Self {
            state: Arc::new(ServerState {
                tools: Mutex::new(tools),
                ..Default::default()
            }),
        }
    }

    pub(crate) fn failing_calls(self) -> Self {
        let tools = self.state.tools.lock().clone();
        Self {
            state: Arc::new(ServerState {
                tools: Mutex::new(tools),
                fail_calls: true,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn set_tools(&self, tools: Vec<ToolDefinition>) {
        *self.state.tools.lock() = tools;
    }

    pub(crate) fn set_listing_fails(&self, fail: bool) {
        self.state.fail_lists.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<(String, Value)> {
        self.state.calls.lock().clone()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExternalToolSession for FakeToolServer {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolError> {
        if self.state.fail_lists.load(Ordering::SeqCst) {
            return Err(ToolError::Provider("listing failed".to_string()));
        }
        Ok(self.state.tools.lock().clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, ToolError> {
        self.state
            .calls
            .lock()
            .push((name.to_string(), arguments.clone()));
        if self.state.fail_calls {
            return Err(ToolError::Provider(format!("{name} crashed")));
        }
        Ok(format!("{name}:{arguments}"))
    }

    async fn close(&self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector handing out [`FakeToolServer`] sessions by server name.
#[derive(Default)]
pub(crate) struct FakeConnector {
    servers: HashMap<String, FakeToolServer>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_server(mut self, name: &str, server: FakeToolServer) -> Self {
        self.servers.insert(name.to_string(), server);
        self
    }

    /// Connection attempts so far, successful or not.
    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolServerConnector for FakeConnector {
    async fn connect(
        &self,
        server_name: &str,
        _config: &ServerConfig,
    ) -> Result<Arc<dyn ExternalToolSession>, ToolError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let server = self
            .servers
            .get(server_name)
            .ok_or_else(|| ToolError::Provider(format!("cannot spawn {server_name}")))?;
        Ok(Arc::new(server.clone()))
    }
}

/// LLM gateway replaying queued results and recording every request.
pub(crate) struct MockLlm {
    queue: Mutex<VecDeque<Result<ChatCompletion, LlmError>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockLlm {
    pub(crate) fn new(responses: Vec<Result<ChatCompletion, LlmError>>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::from(responses)),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Tool names offered on each request so far.
    pub(crate) fn offered_tools(&self) -> Vec<Vec<String>> {
        self.requests
            .lock()
            .iter()
            .map(|r| r.tools.iter().map(|t| t.name.clone()).collect())
            .collect()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl LlmGateway for MockLlm {
    async fn complete(&self, req: ChatRequest) -> Result<ChatCompletion, LlmError> {
        self.requests.lock().push(req);
        self.queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::InvalidResponse("No mock response left".to_string())))
    }
}

pub(crate) fn text_reply(text: &str, tokens: u32) -> Result<ChatCompletion, LlmError> {
    Ok(ChatCompletion {
        message: Message::assistant(text),
        usage: TokenUsage {
            prompt_tokens: tokens,
            completion_tokens: 0,
            total_tokens: tokens,
        },
    })
}

pub(crate) fn tool_reply(calls: &[(&str, &str, &str)], tokens: u32) -> Result<ChatCompletion, LlmError> {
    let calls = calls
        .iter()
        .map(|(id, name, args)| ToolCall::new(*id, *name, *args))
        .collect();
    Ok(ChatCompletion {
        message: Message::assistant_tool_calls(None, calls),
        usage: TokenUsage {
            prompt_tokens: tokens,
            completion_tokens: 0,
            total_tokens: tokens,
        },
    })
}

/// Interactive channel answering from a script; an exhausted script acts as a disconnect.
pub(crate) struct ScriptedChannel {
    decisions: Mutex<VecDeque<ConfirmationDecision>>,
    seen: Mutex<Vec<PendingToolCall>>,
}

impl ScriptedChannel {
    pub(crate) fn new(decisions: Vec<ConfirmationDecision>) -> Self {
        Self {
            decisions: Mutex::new(VecDeque::from(decisions)),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn seen(&self) -> Vec<PendingToolCall> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl InteractiveChannel for ScriptedChannel {
    async fn confirm(&self, pending: PendingToolCall) -> Result<ConfirmationDecision, ChannelError> {
        self.seen.lock().push(pending);
        self.decisions.lock().pop_front().ok_or(ChannelError::Closed)
    }
}
