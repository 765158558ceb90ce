//! Routes inbound envelopes to the chat side or the active call session.
//!
//! The dispatcher holds a single handler slot. While the slot is empty,
//! call signals accumulate in the signal queue; registering a handler drains
//! the queue into it, in arrival order, before any new envelope is forwarded.

use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use wirecore::{CallSignal, ChatMessage, DecodeError, ParticipantId, Payload, SignalEnvelope};

use crate::error::CallError;

pub type HandlerId = u64;

/// Signal intake of a call session.
pub trait SignalHandler: Send + Sync {
    /// Hands one envelope over. Gives it back if the session is gone.
    fn deliver(&self, envelope: SignalEnvelope) -> Result<(), SignalEnvelope>;
}

/// Why an envelope was discarded.
#[derive(Debug)]
pub enum DropReason {
    /// Not a valid envelope; always [`CallError::Decode`].
    Decode(CallError),
    /// Addressed to someone else.
    Misrouted(CallError),
    /// Our own signal, echoed back by the room.
    SelfEcho,
}

/// Outcome of routing one envelope.
#[derive(Debug)]
pub enum Routed {
    Chat {
        sender_id: ParticipantId,
        message: ChatMessage,
    },
    /// Offers go to the owning context, which decides between a new session
    /// and a busy reply.
    IncomingOffer(SignalEnvelope),
    Delivered,
    Queued,
    Dropped(DropReason),
}

#[derive(Default)]
struct Inner {
    slot: Option<(HandlerId, Arc<dyn SignalHandler>)>,
    queue: VecDeque<SignalEnvelope>,
}

pub struct SignalDispatcher {
    local_id: ParticipantId,
    inner: Mutex<Inner>,
    next_handler_id: AtomicU64,
}

impl SignalDispatcher {
    pub fn new(local_id: ParticipantId) -> Self {
        Self {
            local_id,
            inner: Mutex::new(Inner::default()),
            next_handler_id: AtomicU64::new(1),
        }
    }

    pub fn local_id(&self) -> ParticipantId {
        self.local_id
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decode and route one raw frame.
    pub fn dispatch(&self, frame: &[u8]) -> Routed {
        match wirecore::decode(frame) {
            Ok(envelope) => self.route(envelope),
            Err(e) => {
                warn!(target: "Call/Dispatch", "Dropping undecodable envelope: {e}");
                Routed::Dropped(DropReason::Decode(CallError::from(e)))
            }
        }
    }

    pub fn route(&self, envelope: SignalEnvelope) -> Routed {
        if !envelope.is_addressed_to(self.local_id) {
            let err = CallError::RoutingMiss {
                local_id: self.local_id,
                receiver_id: envelope.receiver_id.unwrap_or_default(),
            };
            warn!(target: "Call/Dispatch", "Dropping envelope: {err}");
            return Routed::Dropped(DropReason::Misrouted(err));
        }
        if envelope.sender_id == self.local_id {
            debug!(target: "Call/Dispatch", "Dropping self-echo ({:?})", envelope.kind());
            return Routed::Dropped(DropReason::SelfEcho);
        }

        match envelope.payload {
            Payload::Chat(message) => Routed::Chat {
                sender_id: envelope.sender_id,
                message,
            },
            Payload::Call(CallSignal::Offer { .. }) => Routed::IncomingOffer(envelope),
            Payload::Call(_) => self.forward(envelope),
        }
    }

    /// Forward a call signal to the registered handler, or queue it.
    pub fn forward(&self, envelope: SignalEnvelope) -> Routed {
        let mut inner = self.lock();
        let slot = inner.slot.as_ref().map(|(id, h)| (*id, h.clone()));
        let envelope = match slot {
            Some((id, handler)) => match handler.deliver(envelope) {
                Ok(()) => return Routed::Delivered,
                Err(envelope) => {
                    warn!(target: "Call/Dispatch", "Handler {id} is gone, clearing slot");
                    inner.slot = None;
                    envelope
                }
            },
            None => envelope,
        };
        debug!(
            target: "Call/Dispatch",
            "No call handler, queueing {} from {}",
            envelope.signal().map_or("chat", CallSignal::name),
            envelope.sender_id
        );
        inner.queue.push_back(envelope);
        Routed::Queued
    }

    /// Install `handler`, replacing any previous one. Queued signals are
    /// delivered to it first, oldest first.
    pub fn register_call_handler(&self, handler: Arc<dyn SignalHandler>) -> HandlerId {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();

        let queued = inner.queue.len();
        while let Some(envelope) = inner.queue.pop_front() {
            if let Err(envelope) = handler.deliver(envelope) {
                warn!(target: "Call/Dispatch", "Handler {id} closed while draining the queue");
                inner.queue.push_front(envelope);
                return id;
            }
        }
        if queued > 0 {
            debug!(target: "Call/Dispatch", "Drained {queued} queued signals into handler {id}");
        }

        inner.slot = Some((id, handler));
        id
    }

    /// Clear the slot. Queued signals stay queued.
    pub fn unregister_call_handler(&self) {
        self.lock().slot = None;
    }

    /// Clear the slot only if `id` still holds it.
    pub fn unregister_if_current(&self, id: HandlerId) -> bool {
        let mut inner = self.lock();
        if inner.slot.as_ref().is_some_and(|(current, _)| *current == id) {
            inner.slot = None;
            true
        } else {
            false
        }
    }

    /// Discard every queued signal. Returns how many were dropped.
    pub fn flush_queue(&self) -> usize {
        let mut inner = self.lock();
        let dropped = inner.queue.len();
        inner.queue.clear();
        if dropped > 0 {
            debug!(target: "Call/Dispatch", "Flushed {dropped} stale signals");
        }
        dropped
    }

    pub fn queued_len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn has_handler(&self) -> bool {
        self.lock().slot.is_some()
    }
}
