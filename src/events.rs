use std::sync::Arc;
use tokio::sync::broadcast;
use wirecore::{CallState, ChatMessage, EndReason, MediaKind, ParticipantId};

use crate::session::CallHandle;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// A remote participant is calling.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub caller_id: ParticipantId,
    pub media_kind: MediaKind,
    /// Accept or reject through this handle.
    pub call: CallHandle,
}

#[derive(Debug, Clone)]
pub struct CallStateChanged {
    pub remote_id: ParticipantId,
    pub state: CallState,
}

/// Reported once per call, after teardown.
#[derive(Debug, Clone)]
pub struct CallEnded {
    pub remote_id: ParticipantId,
    pub reason: EndReason,
    pub duration_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ChatReceived {
    pub sender_id: ParticipantId,
    pub message: ChatMessage,
}

macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with one broadcast channel per event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    (incoming_call, Arc<IncomingCall>),
    (state_changed, Arc<CallStateChanged>),
    (call_ended, Arc<CallEnded>),
    (chat_message, Arc<ChatReceived>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
