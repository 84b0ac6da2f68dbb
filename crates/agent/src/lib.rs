//! Agent turn loop, tool routing, confirmation gate, and LLM adapter interfaces.

pub mod channel;
pub mod gate;
pub mod llm;
pub mod local;
pub mod manager;
pub mod remote;
pub mod router;
pub mod session;
pub mod store;

#[cfg(test)]
mod test_support;

/// Queue-backed interactive channel for front ends.
pub use channel::{PendingConfirmation, QueuedChannel};
/// Per-call approval policy.
pub use gate::{ConfirmationGate, GateDecision, REJECTED_SENTINEL, Verdict};
/// Chat request/response models and gateway implementations.
pub use llm::{ChatCompletion, ChatRequest, LlmGateway, OpenAiGateway, TokenUsage};
/// Built-in administrative tools.
pub use local::LocalToolProvider;
/// Live session registry.
pub use manager::{SessionHandle, SessionManager};
/// Lazily-connected external tool servers.
pub use remote::{RemoteRegistry, RemoteToolProvider};
/// Provider aggregation and name resolution.
pub use router::{ProviderRef, ToolDescriptor, ToolRouter};
/// Main turn loop.
pub use session::{ChatReply, ConversationSession, DEFAULT_MAX_TOOL_ROUNDS, HistoryEntry, SessionSettings};
/// Agent configuration persistence.
pub use store::{InMemoryStore, JsonFileStore, PersistenceStore};
