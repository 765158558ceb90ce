//! Chat-side collaborators: the message store and the user directory.

use async_trait::async_trait;
use wirecore::{ChatMessage, ParticipantId, User};

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persist a message to `receiver_id` and return the saved copy.
    async fn send_message(
        &self,
        receiver_id: ParticipantId,
        content: &str,
    ) -> anyhow::Result<ChatMessage>;

    /// Conversation history with `receiver_id`, oldest first.
    async fn messages(&self, receiver_id: ParticipantId) -> anyhow::Result<Vec<ChatMessage>>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn users(&self) -> anyhow::Result<Vec<User>>;
}
