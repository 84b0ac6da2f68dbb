//! Conversation session: the turn loop for one agent.

use std::collections::BTreeMap;
use std::sync::Arc;

use proto::{
    AgentConfig, AgentId, InteractiveChannel, LlmError, Message, PendingToolCall,
    PersistenceError, PolicyUpdateError, Role, ServerConfig, ToolCall, ToolError,
    ToolServerConnector,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::gate::{ConfirmationGate, REJECTED_SENTINEL, Verdict};
use crate::llm::{ChatCompletion, ChatRequest, LlmGateway, TokenUsage};
use crate::router::{self, ToolDescriptor, ToolRouter};
use crate::store::PersistenceStore;

/// Default ceiling on LLM round trips within one turn.
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 25;

/// Per-session knobs supplied by the front end.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub model: String,
    pub max_tool_rounds: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }
}

/// Result of one [`ConversationSession::chat`] turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatReply {
    /// Assistant texts in the order they were produced.
    pub replies: Vec<String>,
    /// Sum of provider-reported total tokens over every LLM call of the turn.
    pub tokens_used: u32,
    pub usage: TokenUsage,
}

/// One visible history line: role and text, system prompt and tool plumbing excluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

enum TurnState {
    AwaitingLlm,
    LlmResponded(ChatCompletion),
    Done,
}

/// Owns one agent's configuration while it is loaded and drives its turns.
pub struct ConversationSession {
    agent_id: AgentId,
    config: AgentConfig,
    router: ToolRouter,
    gate: ConfirmationGate,
    llm: Arc<dyn LlmGateway>,
    store: Arc<dyn PersistenceStore>,
    settings: SessionSettings,
    retired: bool,
}

impl ConversationSession {
    /// Wraps an already-loaded configuration.
    pub fn new(
        agent_id: AgentId,
        mut config: AgentConfig,
        llm: Arc<dyn LlmGateway>,
        store: Arc<dyn PersistenceStore>,
        connector: Arc<dyn ToolServerConnector>,
        settings: SessionSettings,
    ) -> Self {
        config.ensure_system_prompt();
        Self {
            gate: ConfirmationGate::new(agent_id.clone(), Arc::clone(&store)),
            router: ToolRouter::new(connector),
            agent_id,
            config,
            llm,
            store,
            settings,
            retired: false,
        }
    }

    /// Loads the persisted configuration for `agent_id`, or starts from a
    /// default one when nothing is stored. Tools are refreshed once.
    pub async fn open(
        agent_id: AgentId,
        llm: Arc<dyn LlmGateway>,
        store: Arc<dyn PersistenceStore>,
        connector: Arc<dyn ToolServerConnector>,
        settings: SessionSettings,
    ) -> Result<Self, PersistenceError> {
        let config = match store.load(&agent_id)? {
            Some(config) => config,
            None => {
                info!(agent = %agent_id, "No stored configuration; starting fresh");
                AgentConfig::default()
            }
        };
        let mut session = Self::new(agent_id, config, llm, store, connector, settings);
        session.refresh_tools().await;
        Ok(session)
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn servers(&self) -> &BTreeMap<String, ServerConfig> {
        &self.config.servers
    }

    /// Runs one user turn to completion.
    ///
    /// The loop ends when a response carries no tool calls, when the LLM
    /// refuses on content grounds, or after `max_tool_rounds` LLM calls.
    /// The updated history is not saved here; see [`save`](Self::save).
    pub async fn chat(
        &mut self,
        text: &str,
        channel: Option<&dyn InteractiveChannel>,
    ) -> Result<ChatReply, LlmError> {
        self.config.history.push(Message::user(text));

        let mut reply = ChatReply::default();
        let mut rounds = 0;
        let mut state = TurnState::AwaitingLlm;

        loop {
            state = match state {
                TurnState::AwaitingLlm if rounds >= self.settings.max_tool_rounds => {
                    warn!(
                        agent = %self.agent_id,
                        max_tool_rounds = self.settings.max_tool_rounds,
                        "Max tool rounds reached; ending turn"
                    );
                    TurnState::Done
                }
                TurnState::AwaitingLlm => {
                    rounds += 1;
                    let request = ChatRequest {
                        messages: self.config.history.clone(),
                        tools: self
                            .list_available_tools()
                            .into_iter()
                            .map(|d| d.definition)
                            .collect(),
                        model: self.settings.model.clone(),
                    };
                    debug!(agent = %self.agent_id, round = rounds, tools = request.tools.len(), "LLM call");
                    match self.llm.complete(request).await {
                        Ok(completion) => TurnState::LlmResponded(completion),
                        Err(LlmError::ContentFiltered(reason)) => {
                            warn!(agent = %self.agent_id, %reason, "Response blocked by content filter");
                            TurnState::Done
                        }
                        Err(e) => return Err(e),
                    }
                }
                TurnState::LlmResponded(completion) => {
                    reply.usage.add(&completion.usage);
                    let message = completion.message;
                    if let Some(text) = message.text() {
                        reply.replies.push(text.to_string());
                    }
                    let calls = message.requested_tool_calls().to_vec();
                    self.config.history.push(message);

                    if calls.is_empty() {
                        TurnState::Done
                    } else {
                        debug!(
                            agent = %self.agent_id,
                            "Tool calls requested: {:?}",
                            calls.iter().map(ToolCall::name).collect::<Vec<_>>()
                        );
                        for call in &calls {
                            let content = self.dispatch(call, channel).await;
                            self.config
                                .history
                                .push(Message::tool_result(call.id.clone(), content));
                        }
                        TurnState::AwaitingLlm
                    }
                }
                TurnState::Done => break,
            };
        }

        reply.tokens_used = reply.usage.total_tokens;
        Ok(reply)
    }

    /// Resolves, gates and executes one call, returning the tool-role content.
    async fn dispatch(&mut self, call: &ToolCall, channel: Option<&dyn InteractiveChannel>) -> String {
        let descriptor = match self.router.resolve(call.name()) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(agent = %self.agent_id, tool = %call.name(), "Model requested an unknown tool");
                return format!("Error: {e}");
            }
        };
        if !router::is_permitted(&descriptor, &self.config.servers) {
            return format!("Error: {}", ToolError::NotAllowed(call.name().to_string()));
        }
        let args = match call.parsed_arguments() {
            Ok(args) => args,
            Err(e) => return format!("Error: {e}"),
        };

        let pending = PendingToolCall {
            call_id: call.id.clone(),
            name: call.name().to_string(),
            arguments: args.clone(),
            description: Some(descriptor.definition.description.clone()),
        };
        match self
            .gate
            .resolve(&mut self.config, &descriptor, pending, channel)
            .await
        {
            Verdict::Reject => {
                info!(agent = %self.agent_id, tool = %call.name(), "Tool call rejected");
                REJECTED_SENTINEL.to_string()
            }
            Verdict::Execute => {
                let t0 = std::time::Instant::now();
                let result = self
                    .router
                    .call(&descriptor, args, &mut self.config.servers)
                    .await;
                debug!(tool = %call.name(), elapsed_ms = %t0.elapsed().as_millis(), ok = result.is_ok(), "Tool call finished");
                result.unwrap_or_else(|e| format!("Error: {e}"))
            }
        }
    }

    /// The allow-listed tools currently offered to the model.
    pub fn list_available_tools(&self) -> Vec<ToolDescriptor> {
        self.router.flattened_tools(&self.config.servers)
    }

    /// Sets `allowed` or `confirmed` on a server or function and saves.
    ///
    /// A rejected update changes nothing. A failed save is logged only.
    pub fn update_policy_flag(
        &mut self,
        server: &str,
        function: Option<&str>,
        flag: &str,
        value: &Value,
    ) -> Result<(), PolicyUpdateError> {
        self.config
            .update_policy_flag(server, function, flag, value)?;
        info!(agent = %self.agent_id, server, function, flag, %value, "Policy flag updated");
        self.persist_logged();
        Ok(())
    }

    /// Resets history to the system prompt and saves.
    pub fn clear_history(&mut self) {
        self.config.reset_history();
        info!(agent = %self.agent_id, "History cleared");
        self.persist_logged();
    }

    /// Text-bearing messages after the system prompt.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.config
            .history
            .iter()
            .skip(1)
            .filter_map(|m| {
                m.text().map(|content| HistoryEntry {
                    role: m.role,
                    content: content.to_string(),
                })
            })
            .collect()
    }

    /// Writes the configuration to the store; a no-op once retired.
    pub fn save(&self) -> Result<(), PersistenceError> {
        if self.retired {
            debug!(agent = %self.agent_id, "Session retired; skipping save");
            return Ok(());
        }
        self.store.save(&self.agent_id, &self.config)
    }

    /// Saves, logging instead of failing.
    pub fn persist_logged(&self) {
        if let Err(e) = self.save() {
            warn!(agent = %self.agent_id, error = %e, "Failed to persist agent configuration");
        }
    }

    /// Re-lists every loaded remote provider.
    pub async fn refresh_tools(&mut self) {
        self.router.refresh(&mut self.config.servers).await;
    }

    /// Marks the session as belonging to a deleted agent. It never writes
    /// to the store again and the manager will not hand it out.
    pub fn retire(&mut self) {
        self.retired = true;
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Releases every provider connection.
    pub async fn shutdown(&mut self) {
        self.router.shutdown().await;
    }
}
