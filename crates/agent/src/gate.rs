//! Confirmation gate: execute, reject, or ask before a tool call runs.

use std::sync::Arc;

use proto::{
    AgentConfig, AgentId, ConfirmationState, InteractiveChannel, PendingToolCall, ProviderKind,
};
use tracing::{info, warn};

use crate::router::ToolDescriptor;
use crate::store::PersistenceStore;

/// Tool-role content recorded for a call that did not run.
pub const REJECTED_SENTINEL: &str = "Tool call rejected by user";

/// Outcome of the policy check, before any channel is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Execute,
    Reject,
    AskChannel,
}

/// Final verdict for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Execute,
    Reject,
}

/// Decides each call and persists `always-*` answers before the call runs.
pub struct ConfirmationGate {
    agent_id: AgentId,
    store: Arc<dyn PersistenceStore>,
}

impl ConfirmationGate {
    pub fn new(agent_id: AgentId, store: Arc<dyn PersistenceStore>) -> Self {
        Self { agent_id, store }
    }

    /// Pure policy: admin calls always run; remote calls follow the stored
    /// state, and `always_ask` without a channel degrades to a rejection.
    pub fn decide(
        kind: ProviderKind,
        stored: ConfirmationState,
        has_channel: bool,
    ) -> GateDecision {
        match (kind, stored) {
            (ProviderKind::Local, _) => GateDecision::Execute,
            (ProviderKind::Remote, ConfirmationState::AlwaysConfirmed) => GateDecision::Execute,
            (ProviderKind::Remote, ConfirmationState::AlwaysRejected) => GateDecision::Reject,
            (ProviderKind::Remote, ConfirmationState::AlwaysAsk) if has_channel => {
                GateDecision::AskChannel
            }
            (ProviderKind::Remote, ConfirmationState::AlwaysAsk) => GateDecision::Reject,
        }
    }

    /// Runs the decision, asking `channel` when required.
    ///
    /// A policy-changing answer is written into `config` and saved before
    /// returning. A disconnected channel counts as a rejection.
    pub async fn resolve(
        &self,
        config: &mut AgentConfig,
        descriptor: &ToolDescriptor,
        pending: PendingToolCall,
        channel: Option<&dyn InteractiveChannel>,
    ) -> Verdict {
        let stored = match descriptor.provider.kind {
            ProviderKind::Local => ConfirmationState::AlwaysConfirmed,
            ProviderKind::Remote => config
                .servers
                .get(&descriptor.provider.name)
                .map(|s| s.confirmation_for(descriptor.name()))
                .unwrap_or_default(),
        };

        match (Self::decide(descriptor.provider.kind, stored, channel.is_some()), channel) {
            (GateDecision::Execute, _) => Verdict::Execute,
            (GateDecision::AskChannel, Some(channel)) => {
                let decision = match channel.confirm(pending).await {
                    Ok(decision) => decision,
                    Err(e) => {
                        warn!(agent = %self.agent_id, tool = %descriptor.name(), error = %e, "Confirmation channel gone; rejecting call");
                        return Verdict::Reject;
                    }
                };
                info!(agent = %self.agent_id, tool = %descriptor.name(), ?decision, "Tool call decision received");
                if let Some(state) = decision.persisted_state() {
                    self.persist_policy(config, descriptor, state);
                }
                if decision.approves() {
                    Verdict::Execute
                } else {
                    Verdict::Reject
                }
            }
            (GateDecision::AskChannel, None) | (GateDecision::Reject, _) => Verdict::Reject,
        }
    }

    fn persist_policy(
        &self,
        config: &mut AgentConfig,
        descriptor: &ToolDescriptor,
        state: ConfirmationState,
    ) {
        if !config.set_confirmation(&descriptor.provider.name, descriptor.name(), state) {
            warn!(tool = %descriptor.name(), "No stored policy entry to update");
            return;
        }
        if let Err(e) = self.store.save(&self.agent_id, config) {
            warn!(agent = %self.agent_id, error = %e, "Failed to persist confirmation policy");
        }
    }
}
