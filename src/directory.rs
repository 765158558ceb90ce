//! Presence layer: which local participants currently hold a call.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::debug;
use wirecore::ParticipantId;

use crate::error::CallError;

pub type SessionId = u64;

/// The call a local participant is holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveCall {
    pub remote_id: ParticipantId,
    pub session_id: SessionId,
}

/// Shared across every chat context of the process. A claim is taken when a
/// session is created and released by its teardown.
#[derive(Debug, Default)]
pub struct CallDirectory {
    calls: DashMap<ParticipantId, ActiveCall>,
}

impl CallDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self, local_id: ParticipantId) -> bool {
        self.calls.contains_key(&local_id)
    }

    pub fn active_call(&self, local_id: ParticipantId) -> Option<ActiveCall> {
        self.calls.get(&local_id).map(|entry| *entry)
    }

    /// Atomically claim `local_id` for a new session.
    pub fn try_claim(
        &self,
        local_id: ParticipantId,
        remote_id: ParticipantId,
        session_id: SessionId,
    ) -> Result<(), CallError> {
        match self.calls.entry(local_id) {
            Entry::Occupied(_) => Err(CallError::Busy(local_id)),
            Entry::Vacant(slot) => {
                slot.insert(ActiveCall {
                    remote_id,
                    session_id,
                });
                debug!(target: "Call/Directory", "{local_id} claimed by session {session_id}");
                Ok(())
            }
        }
    }

    /// Release the claim if `session_id` still holds it.
    pub fn release(&self, local_id: ParticipantId, session_id: SessionId) -> bool {
        let released = self
            .calls
            .remove_if(&local_id, |_, call| call.session_id == session_id)
            .is_some();
        if released {
            debug!(target: "Call/Directory", "{local_id} released by session {session_id}");
        }
        released
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
