//! Platform-agnostic core for peer-to-peer call signaling.
//!
//! Everything here is sans-io: the wire envelope codec, the participant and
//! media types, the call state machine value type and the candidate buffer.
//! The runtime crate drives these with tokio.

pub mod candidates;
pub mod envelope;
pub mod state;
pub mod types;

pub use candidates::CandidateBuffer;
pub use envelope::{
    CallSignal, DecodeError, EnvelopeKind, IceCandidate, Payload, SignalEnvelope, decode, encode,
};
pub use state::{CallInfo, CallState, CallTransition, InvalidTransition, resolve_duration};
pub use types::call::{
    CallRole, ConnectionState, EndReason, MediaKind, ParticipantId, format_duration,
};
pub use types::{ChatMessage, User};
