//! Session manager: one live [`ConversationSession`] per agent id.

use std::sync::Arc;

use dashmap::DashMap;
use proto::{AgentId, Error, InteractiveChannel, PersistenceError, ToolServerConnector};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::llm::LlmGateway;
use crate::session::{ChatReply, ConversationSession, SessionSettings};
use crate::store::PersistenceStore;

/// Shared handle to a live session. Holding the lock serialises turns.
pub type SessionHandle = Arc<Mutex<ConversationSession>>;

/// Creates sessions on demand and evicts them on delete.
///
/// Sessions of different agents share nothing mutable and can run in
/// parallel. Each session gets its own provider connections. Session
/// creation and the store half of `delete` are serialised by `lifecycle`,
/// so a deleted agent cannot be reopened from its stale stored config.
pub struct SessionManager {
    sessions: DashMap<AgentId, SessionHandle>,
    lifecycle: Mutex<()>,
    llm: Arc<dyn LlmGateway>,
    store: Arc<dyn PersistenceStore>,
    connector: Arc<dyn ToolServerConnector>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(
        llm: Arc<dyn LlmGateway>,
        store: Arc<dyn PersistenceStore>,
        connector: Arc<dyn ToolServerConnector>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            lifecycle: Mutex::new(()),
            llm,
            store,
            connector,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn PersistenceStore> {
        &self.store
    }

    /// Returns the live session for `agent`, loading or creating it first.
    pub async fn session(&self, agent: &AgentId) -> Result<SessionHandle, PersistenceError> {
        if let Some(handle) = self.sessions.get(agent) {
            return Ok(Arc::clone(handle.value()));
        }

        let _lifecycle = self.lifecycle.lock().await;
        if let Some(handle) = self.sessions.get(agent) {
            return Ok(Arc::clone(handle.value()));
        }
        let session = ConversationSession::open(
            agent.clone(),
            Arc::clone(&self.llm),
            Arc::clone(&self.store),
            Arc::clone(&self.connector),
            self.settings.clone(),
        )
        .await?;
        let handle: SessionHandle = Arc::new(Mutex::new(session));
        self.sessions.insert(agent.clone(), Arc::clone(&handle));
        debug!(agent = %agent, "Session ready");
        Ok(handle)
    }

    /// Locks the live session for `agent`, skipping any that a concurrent
    /// `delete` retired while this caller waited.
    pub async fn lock_session(
        &self,
        agent: &AgentId,
    ) -> Result<OwnedMutexGuard<ConversationSession>, PersistenceError> {
        loop {
            let handle = self.session(agent).await?;
            let session = Arc::clone(&handle).lock_owned().await;
            if !session.is_retired() {
                return Ok(session);
            }
            drop(session);
            self.sessions
                .remove_if(agent, |_, live| Arc::ptr_eq(live, &handle));
            debug!(agent = %agent, "Skipped retired session");
        }
    }

    /// Runs one turn and saves the updated configuration afterwards.
    ///
    /// A failed save is logged; the turn's replies are still returned.
    pub async fn chat(
        &self,
        agent: &AgentId,
        text: &str,
        channel: Option<&dyn InteractiveChannel>,
    ) -> Result<ChatReply, Error> {
        let mut session = self.lock_session(agent).await?;
        let result = session.chat(text, channel).await;
        session.persist_logged();
        Ok(result?)
    }

    /// Every agent with a stored configuration.
    pub fn list_agents(&self) -> Result<Vec<AgentId>, PersistenceError> {
        self.store.list()
    }

    /// Ids of sessions currently held in memory, sorted.
    pub fn live_sessions(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Evicts the live session, releases its providers and removes the stored config.
    ///
    /// Waits for an in-flight turn to finish. The evicted session is retired
    /// before the store entry goes, so it never writes the agent back.
    pub async fn delete(&self, agent: &AgentId) -> Result<(), PersistenceError> {
        loop {
            let lifecycle = self.lifecycle.lock().await;
            let live = self.sessions.get(agent).map(|h| Arc::clone(h.value()));
            let Some(handle) = live else {
                self.store.delete(agent)?;
                info!(agent = %agent, "Agent deleted");
                return Ok(());
            };
            drop(lifecycle);

            let mut session = handle.lock().await;
            if session.is_retired() {
                continue;
            }
            session.retire();
            {
                let _lifecycle = self.lifecycle.lock().await;
                self.sessions
                    .remove_if(agent, |_, live| Arc::ptr_eq(live, &handle));
                self.store.delete(agent)?;
            }
            session.shutdown().await;
            info!(agent = %agent, "Agent deleted");
            return Ok(());
        }
    }

    /// Releases every live session's providers.
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        self.sessions.clear();
        for handle in handles {
            handle.lock().await.shutdown().await;
        }
    }
}
