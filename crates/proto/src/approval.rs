//! Tool call confirmation types shared between the turn loop and interactive channels.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::policy::ConfirmationState;

/// User's answer to a pending tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfirmationDecision {
    /// Execute this call only.
    ApproveOnce,
    /// Execute and store `always_confirmed` for the function.
    AlwaysConfirm,
    /// Reject and store `always_rejected` for the function.
    AlwaysReject,
    /// Reject this call only.
    RejectOnce,
}

impl ConfirmationDecision {
    /// Whether the call goes ahead.
    pub fn approves(self) -> bool {
        matches!(self, Self::ApproveOnce | Self::AlwaysConfirm)
    }

    /// The state to persist, for the decisions that change stored policy.
    pub fn persisted_state(self) -> Option<ConfirmationState> {
        match self {
            Self::AlwaysConfirm => Some(ConfirmationState::AlwaysConfirmed),
            Self::AlwaysReject => Some(ConfirmationState::AlwaysRejected),
            Self::ApproveOnce | Self::RejectOnce => None,
        }
    }
}

/// A tool call waiting for a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingToolCall {
    /// Tool-call identifier from the model.
    pub call_id: String,
    /// Name of the tool to be executed.
    pub name: String,
    /// Parsed JSON arguments.
    pub arguments: serde_json::Value,
    /// Tool description, when the provider supplied one.
    pub description: Option<String>,
}

/// Request/response capability used to ask a user about a pending call.
///
/// The turn loop blocks on [`confirm`](Self::confirm) without a timeout.
/// Implementations return a [`ChannelError`] when the user side goes away,
/// which the loop treats as a rejection.
#[async_trait]
pub trait InteractiveChannel: Send + Sync {
    async fn confirm(&self, pending: PendingToolCall) -> Result<ConfirmationDecision, ChannelError>;
}
