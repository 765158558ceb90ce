//! Call-related error types.

use thiserror::Error;
use wirecore::{DecodeError, InvalidTransition, ParticipantId};

use crate::channel::ChannelError;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("envelope for {receiver_id} reached participant {local_id}")]
    RoutingMiss {
        local_id: ParticipantId,
        receiver_id: ParticipantId,
    },

    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("signaling channel unavailable")]
    ChannelUnavailable,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("participant {0} is already in a call")]
    Busy(ParticipantId),

    #[error("call session closed")]
    SessionClosed,
}

impl From<ChannelError> for CallError {
    fn from(_: ChannelError) -> Self {
        Self::ChannelUnavailable
    }
}
