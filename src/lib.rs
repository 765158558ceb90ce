//! Call signaling over a shared chat channel.
//!
//! Two participants of a chat room negotiate a peer-to-peer media session by
//! exchanging call signals on the same channel that carries their chat
//! messages. [`SessionContext`] is the entry point: attach it to a channel,
//! then place calls or answer the ones announced on its [`EventBus`].

pub use wirecore;

pub mod channel;
pub mod config;
pub mod context;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod peer;
pub mod rest;
pub mod session;
pub mod store;
pub mod transport;

#[cfg(test)]
pub mod test_utils;

pub use config::{CallConfig, ServerConfig};
pub use context::{SessionContext, SessionContextBuilder};
pub use directory::CallDirectory;
pub use error::CallError;
pub use events::EventBus;
pub use session::{CallHandle, CallSnapshot, SessionCommand};
pub use wirecore::{CallState, EndReason, MediaKind, ParticipantId};
