//! End-to-end turn loop behaviour through the public session manager API.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use agent::{
    ChatCompletion, ChatRequest, InMemoryStore, LlmGateway, PersistenceStore, REJECTED_SENTINEL,
    SessionManager, SessionSettings, TokenUsage,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use proto::{
    AgentConfig, AgentId, ChannelError, ConfirmationDecision, ConfirmationState,
    ExternalToolSession, InteractiveChannel, LlmError, Message, PendingToolCall, Role,
    ServerConfig, ToolCall, ToolDefinition, ToolError, ToolServerConnector,
};
use serde_json::{Value, json};

struct ScriptedLlm {
    responses: Mutex<VecDeque<Result<ChatCompletion, LlmError>>>,
    offered: Mutex<Vec<Vec<String>>>,
}

impl ScriptedLlm {
    fn new(responses: Vec<Result<ChatCompletion, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            offered: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl LlmGateway for ScriptedLlm {
    async fn complete(&self, req: ChatRequest) -> Result<ChatCompletion, LlmError> {
        assert_eq!(req.messages[0].role, Role::System);
        self.offered
            .lock()
            .push(req.tools.iter().map(|t| t.name.clone()).collect());
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::InvalidResponse("script exhausted".to_string())))
    }
}

fn usage(total: u32) -> TokenUsage {
    TokenUsage {
        prompt_tokens: total,
        completion_tokens: 0,
        total_tokens: total,
    }
}

fn say(text: &str) -> Result<ChatCompletion, LlmError> {
    Ok(ChatCompletion {
        message: Message::assistant(text),
        usage: usage(10),
    })
}

fn call(id: &str, name: &str, args: Value) -> Result<ChatCompletion, LlmError> {
    Ok(ChatCompletion {
        message: Message::assistant_tool_calls(None, vec![ToolCall::new(id, name, args.to_string())]),
        usage: usage(10),
    })
}

/// Tool server whose calls echo their name; each connect spawns a fresh instance.
#[derive(Default)]
struct EchoServers {
    tools: HashMap<String, Vec<String>>,
    calls: Arc<Mutex<Vec<String>>>,
    connects: AtomicUsize,
}

impl EchoServers {
    fn with(mut self, server: &str, tools: &[&str]) -> Self {
        self.tools
            .insert(server.to_string(), tools.iter().map(|t| t.to_string()).collect());
        self
    }
}

struct EchoSession {
    server: String,
    tools: Vec<String>,
    calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ExternalToolSession for EchoSession {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolError> {
        Ok(self
            .tools
            .iter()
            .map(|t| ToolDefinition::new(t.as_str(), format!("{t} on {}", self.server), json!({"type": "object"})))
            .collect())
    }

    async fn call_tool(&self, name: &str, _arguments: Value) -> Result<String, ToolError> {
        self.calls.lock().push(format!("{}/{name}", self.server));
        Ok(format!("{name} ok from {}", self.server))
    }

    async fn close(&self) {}
}

#[async_trait]
impl ToolServerConnector for EchoServers {
    async fn connect(
        &self,
        server_name: &str,
        _config: &ServerConfig,
    ) -> Result<Arc<dyn ExternalToolSession>, ToolError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let tools = self
            .tools
            .get(server_name)
            .cloned()
            .ok_or_else(|| ToolError::Provider(format!("no such server {server_name}")))?;
        Ok(Arc::new(EchoSession {
            server: server_name.to_string(),
            tools,
            calls: Arc::clone(&self.calls),
        }))
    }
}

struct Answers {
    decisions: Mutex<VecDeque<ConfirmationDecision>>,
    asked: AtomicUsize,
}

impl Answers {
    fn new(decisions: Vec<ConfirmationDecision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into()),
            asked: AtomicUsize::new(0),
        }
    }

    fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InteractiveChannel for Answers {
    async fn confirm(&self, _pending: PendingToolCall) -> Result<ConfirmationDecision, ChannelError> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.decisions.lock().pop_front().ok_or(ChannelError::Closed)
    }
}

fn seeded_store(agent: &str, servers: &[&str]) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    let mut config = AgentConfig::new("You manage tools.");
    for server in servers {
        config
            .servers
            .insert(server.to_string(), ServerConfig::stdio(format!("{server}-bin"), vec![]));
    }
    store.save(&AgentId::from(agent), &config).expect("seed");
    store
}

fn manager(
    llm: Arc<ScriptedLlm>,
    store: Arc<InMemoryStore>,
    connector: Arc<EchoServers>,
) -> SessionManager {
    SessionManager::new(llm, store, connector, SessionSettings::default())
}

fn tool_contents(config: &AgentConfig) -> Vec<String> {
    config
        .history
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.content.clone())
        .collect()
}

async fn config_of(mgr: &SessionManager, agent: &AgentId) -> AgentConfig {
    let handle = mgr.session(agent).await.expect("session");
    let session = handle.lock().await;
    session.config().clone()
}

#[tokio::test]
async fn list_providers_scenario_grows_history_by_three() {
    let agent = AgentId::from("ops");
    let store = seeded_store("ops", &["files"]);
    let llm = ScriptedLlm::new(vec![call("c1", "list_providers", json!({})), say("One server: files.")]);
    let mgr = manager(llm, store, Arc::new(EchoServers::default()));
    let channel = Answers::new(vec![]);

    let reply = mgr.chat(&agent, "list providers", Some(&channel)).await.expect("chat");

    assert_eq!(reply.replies, vec!["One server: files.".to_string()]);
    assert_eq!(reply.tokens_used, 20);
    assert_eq!(channel.asked(), 0);
    let history = config_of(&mgr, &agent).await.history;
    let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    assert_eq!(history[3].tool_call_id.as_deref(), Some("c1"));
}

#[tokio::test]
async fn headless_always_ask_is_rejected_with_sentinel() {
    let agent = AgentId::from("ops");
    let store = seeded_store("ops", &["files"]);
    let connector = Arc::new(EchoServers::default().with("files", &["delete"]));
    let llm = ScriptedLlm::new(vec![
        call("c1", "load_provider", json!({"name": "files"})),
        call("c2", "delete", json!({"path": "/tmp/x"})),
        say("I could not delete it."),
    ]);
    let mgr = manager(llm, store, connector.clone());

    mgr.chat(&agent, "delete /tmp/x", None).await.expect("chat");

    let config = config_of(&mgr, &agent).await;
    assert_eq!(
        tool_contents(&config),
        vec!["Loaded server 'files' with 1 tools".to_string(), REJECTED_SENTINEL.to_string()]
    );
    assert!(connector.calls.lock().is_empty());
}

#[tokio::test]
async fn always_confirm_is_remembered_across_turns_and_restarts() {
    let agent = AgentId::from("ops");
    let store = seeded_store("ops", &["files"]);
    let connector = Arc::new(EchoServers::default().with("files", &["read"]));
    let llm = ScriptedLlm::new(vec![
        call("c1", "load_provider", json!({"name": "files"})),
        call("c2", "read", json!({})),
        say("first"),
        call("c3", "read", json!({})),
        say("second"),
    ]);
    let mgr = manager(llm, store.clone(), connector.clone());
    let channel = Answers::new(vec![ConfirmationDecision::AlwaysConfirm]);

    mgr.chat(&agent, "read", Some(&channel)).await.expect("chat");
    mgr.chat(&agent, "read again", Some(&channel)).await.expect("chat");

    assert_eq!(channel.asked(), 1);
    assert_eq!(connector.calls.lock().len(), 2);
    let saved = store.load(&agent).expect("load").expect("saved");
    assert_eq!(
        saved.servers["files"].confirmation_for("read"),
        ConfirmationState::AlwaysConfirmed
    );
}

#[tokio::test]
async fn reject_once_keeps_asking() {
    let agent = AgentId::from("ops");
    let store = seeded_store("ops", &["files"]);
    let connector = Arc::new(EchoServers::default().with("files", &["write"]));
    let llm = ScriptedLlm::new(vec![
        call("c1", "load_provider", json!({"name": "files"})),
        call("c2", "write", json!({})),
        call("c3", "write", json!({})),
        say("done"),
    ]);
    let mgr = manager(llm, store, connector.clone());
    let channel = Answers::new(vec![
        ConfirmationDecision::RejectOnce,
        ConfirmationDecision::ApproveOnce,
    ]);

    mgr.chat(&agent, "write", Some(&channel)).await.expect("chat");

    assert_eq!(channel.asked(), 2);
    let config = config_of(&mgr, &agent).await;
    assert_eq!(
        config.servers["files"].confirmation_for("write"),
        ConfirmationState::AlwaysAsk
    );
    let contents = tool_contents(&config);
    assert_eq!(contents[1], REJECTED_SENTINEL);
    assert_eq!(contents[2], "write ok from files");
}

#[tokio::test]
async fn disallowed_server_hides_all_tools() {
    let agent = AgentId::from("ops");
    let store = seeded_store("ops", &["files"]);
    let connector = Arc::new(EchoServers::default().with("files", &["read", "write"]));
    let llm = ScriptedLlm::new(vec![
        call("c1", "load_provider", json!({"name": "files"})),
        say("loaded"),
        say("nothing to offer"),
    ]);
    let mgr = manager(llm.clone(), store, connector);

    mgr.chat(&agent, "load", None).await.expect("chat");
    {
        let handle = mgr.session(&agent).await.expect("session");
        let mut session = handle.lock().await;
        assert_eq!(session.list_available_tools().len(), 5);
        session
            .update_policy_flag("files", None, "allowed", &json!(false))
            .expect("update");
        let names: Vec<String> = session
            .list_available_tools()
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(names, vec!["list_providers", "load_provider", "unload_provider"]);
    }
    mgr.chat(&agent, "anything?", None).await.expect("chat");

    let offered = llm.offered.lock().clone();
    assert!(offered[2].iter().all(|n| n != "read" && n != "write"));
}

#[tokio::test]
async fn first_loaded_server_owns_a_colliding_name() {
    let agent = AgentId::from("ops");
    let store = seeded_store("ops", &["alpha", "beta"]);
    let connector = Arc::new(
        EchoServers::default()
            .with("alpha", &["search"])
            .with("beta", &["search"]),
    );
    let llm = ScriptedLlm::new(vec![
        call("c1", "load_provider", json!({"name": "alpha"})),
        call("c2", "load_provider", json!({"name": "beta"})),
        say("both loaded"),
    ]);
    let mgr = manager(llm, store, connector);
    mgr.chat(&agent, "load both", None).await.expect("chat");

    let handle = mgr.session(&agent).await.expect("session");
    let session = handle.lock().await;
    let search: Vec<_> = session
        .list_available_tools()
        .into_iter()
        .filter(|t| t.name() == "search")
        .collect();
    assert_eq!(search.len(), 1);
    assert_eq!(search[0].provider.name, "alpha");
}

#[tokio::test]
async fn content_filter_mid_turn_returns_partial_replies() {
    let agent = AgentId::from("ops");
    let llm = ScriptedLlm::new(vec![
        Ok(ChatCompletion {
            message: Message::assistant_tool_calls(
                Some("Let me look.".to_string()),
                vec![ToolCall::new("c1", "list_providers", "{}")],
            ),
            usage: usage(4),
        }),
        Err(LlmError::ContentFiltered("hate".to_string())),
    ]);
    let mgr = manager(llm, Arc::new(InMemoryStore::new()), Arc::new(EchoServers::default()));

    let reply = mgr.chat(&agent, "something nasty", None).await.expect("not raised");
    assert_eq!(reply.replies, vec!["Let me look.".to_string()]);
    assert_eq!(reply.tokens_used, 4);
}

#[tokio::test]
async fn clear_history_restores_single_system_message() {
    let agent = AgentId::from("ops");
    let store = seeded_store("ops", &[]);
    let llm = ScriptedLlm::new(vec![say("hello")]);
    let mgr = manager(llm, store.clone(), Arc::new(EchoServers::default()));
    mgr.chat(&agent, "hi", None).await.expect("chat");

    let handle = mgr.session(&agent).await.expect("session");
    handle.lock().await.clear_history();

    let saved = store.load(&agent).expect("load").expect("saved");
    assert_eq!(saved.history, vec![Message::system("You manage tools.")]);
}

/// Answers a fresh user message with a load call and anything else with text,
/// so concurrent sessions can share it in any interleaving.
struct LoadThenDone;

#[async_trait]
impl LlmGateway for LoadThenDone {
    async fn complete(&self, req: ChatRequest) -> Result<ChatCompletion, LlmError> {
        match req.messages.last().map(|m| m.role) {
            Some(Role::User) => call("c1", "load_provider", json!({"name": "files"})),
            _ => say("done"),
        }
    }
}

#[tokio::test]
async fn agents_run_in_parallel_with_separate_connections() {
    let store = Arc::new(InMemoryStore::new());
    for agent in ["a", "b"] {
        let mut config = AgentConfig::new("sys");
        config
            .servers
            .insert("files".to_string(), ServerConfig::stdio("files-bin", vec![]));
        store.save(&AgentId::from(agent), &config).expect("seed");
    }
    let connector = Arc::new(EchoServers::default().with("files", &["read"]));
    let mgr = SessionManager::new(
        Arc::new(LoadThenDone),
        store,
        connector.clone(),
        SessionSettings::default(),
    );

    let (a_id, b_id) = (AgentId::from("a"), AgentId::from("b"));
    let (a, b) = tokio::join!(
        mgr.chat(&a_id, "load", None),
        mgr.chat(&b_id, "load", None)
    );
    a.expect("a");
    b.expect("b");

    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    assert_eq!(mgr.live_sessions().len(), 2);
}

#[tokio::test]
async fn unknown_tool_and_unknown_server_are_reported_to_the_model() {
    let agent = AgentId::from("ops");
    let llm = ScriptedLlm::new(vec![
        call("c1", "teleport", json!({})),
        call("c2", "load_provider", json!({"name": "ghost"})),
        call("c3", "unload_provider", json!({"name": "ghost"})),
        say("sorry"),
    ]);
    let mgr = manager(llm, Arc::new(InMemoryStore::new()), Arc::new(EchoServers::default()));

    let reply = mgr.chat(&agent, "go", None).await.expect("chat");
    assert_eq!(reply.replies, vec!["sorry".to_string()]);
    let config = config_of(&mgr, &agent).await;
    assert_eq!(
        tool_contents(&config),
        vec![
            "Error: tool 'teleport' not found".to_string(),
            "Error: server 'ghost' not found in configuration".to_string(),
            "Error: server 'ghost' is not loaded".to_string(),
        ]
    );
}
