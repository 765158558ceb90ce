//! Chat-side models shared with the REST collaborators.

use serde::{Deserialize, Serialize};

use super::call::ParticipantId;

/// A user as listed by the user directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: ParticipantId,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// A persisted chat message, as returned by the message store and relayed
/// verbatim inside `chat` envelopes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatMessage {
    pub id: Option<i64>,
    pub sender: Option<User>,
    pub receiver: Option<User>,
    pub content: String,
    pub timestamp: Option<String>,
}

impl ChatMessage {
    pub fn sender_id(&self) -> Option<ParticipantId> {
        self.sender.as_ref().map(|u| u.id)
    }
}
