//! Queue-backed interactive channel for front ends that prompt a user.

use async_trait::async_trait;
use proto::{ChannelError, ConfirmationDecision, InteractiveChannel, PendingToolCall};
use tokio::sync::{mpsc, oneshot};

/// A pending confirmation forwarded to the front end's event loop.
pub struct PendingConfirmation {
    /// The call awaiting a decision.
    pub request: PendingToolCall,
    /// Oneshot sender to deliver the user's decision back to the turn loop.
    pub reply_tx: oneshot::Sender<ConfirmationDecision>,
}

/// Forwards confirmation requests over an mpsc channel.
///
/// The front end receives [`PendingConfirmation`]s, renders a prompt and
/// answers through the oneshot. A dropped receiver fails the send; a dropped
/// reply sender reads as [`ChannelError::Closed`].
pub struct QueuedChannel {
    tx: mpsc::Sender<PendingConfirmation>,
}

impl QueuedChannel {
    /// Creates a channel and the receiver the front end should poll.
    pub fn new() -> (Self, mpsc::Receiver<PendingConfirmation>) {
        let (tx, rx) = mpsc::channel(16);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl InteractiveChannel for QueuedChannel {
    async fn confirm(&self, pending: PendingToolCall) -> Result<ConfirmationDecision, ChannelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingConfirmation {
                request: pending,
                reply_tx,
            })
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        reply_rx.await.map_err(|_| ChannelError::Closed)
    }
}
