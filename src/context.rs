//! Per-chat context: one channel, one dispatcher, at most one call.
//!
//! The context pumps the channel, hands chat messages to the event bus and
//! turns incoming offers into callee sessions. Outgoing calls start here too.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use wirecore::{
    CallInfo, CallRole, CallSignal, CallState, ChatMessage, MediaKind, ParticipantId,
    SignalEnvelope, encode,
};

use crate::channel::{ChannelEvent, ChannelFactory, MessageChannel};
use crate::config::CallConfig;
use crate::directory::{CallDirectory, SessionId};
use crate::dispatcher::{Routed, SignalDispatcher};
use crate::error::CallError;
use crate::events::{ChatReceived, EventBus};
use crate::peer::{MediaDevices, NoMediaBackend, PeerLinkFactory};
use crate::session::{CallHandle, CallSession, SessionServices};
use crate::store::ChatStore;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

fn next_session_id() -> SessionId {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

pub struct SessionContextBuilder {
    local_id: ParticipantId,
    remote_id: ParticipantId,
    directory: Option<Arc<CallDirectory>>,
    events: Option<Arc<EventBus>>,
    config: CallConfig,
    media: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerLinkFactory>,
    chat_store: Option<Arc<dyn ChatStore>>,
}

impl SessionContextBuilder {
    /// Share a presence directory with other contexts of this process.
    pub fn with_directory(mut self, directory: Arc<CallDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_media(
        mut self,
        media: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerLinkFactory>,
    ) -> Self {
        self.media = media;
        self.peers = peers;
        self
    }

    pub fn with_chat_store(mut self, store: Arc<dyn ChatStore>) -> Self {
        self.chat_store = Some(store);
        self
    }

    /// Open the room through `factory` and attach to it.
    pub async fn connect(
        self,
        factory: &dyn ChannelFactory,
    ) -> Result<Arc<SessionContext>, CallError> {
        let (channel, events) = factory.open(self.remote_id).await?;
        Ok(self.attach(channel, events))
    }

    /// Attach to an open channel and start pumping its events.
    pub fn attach(
        self,
        channel: Arc<dyn MessageChannel>,
        events: mpsc::Receiver<ChannelEvent>,
    ) -> Arc<SessionContext> {
        let services = Arc::new(SessionServices {
            local_id: self.local_id,
            channel,
            dispatcher: Arc::new(SignalDispatcher::new(self.local_id)),
            directory: self.directory.unwrap_or_default(),
            events: self.events.unwrap_or_default(),
            config: self.config,
            media: self.media,
            peers: self.peers,
        });
        let ctx = Arc::new(SessionContext {
            services,
            remote_id: self.remote_id,
            chat_store: self.chat_store,
            current: Mutex::new(None),
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(ctx.clone().pump(events));
        *lock(&ctx.pump) = Some(pump);
        ctx
    }
}

pub struct SessionContext {
    services: Arc<SessionServices>,
    remote_id: ParticipantId,
    chat_store: Option<Arc<dyn ChatStore>>,
    current: Mutex<Option<CallHandle>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionContext {
    pub fn builder(local_id: ParticipantId, remote_id: ParticipantId) -> SessionContextBuilder {
        SessionContextBuilder {
            local_id,
            remote_id,
            directory: None,
            events: None,
            config: CallConfig::default(),
            media: Arc::new(NoMediaBackend),
            peers: Arc::new(NoMediaBackend),
            chat_store: None,
        }
    }

    pub fn local_id(&self) -> ParticipantId {
        self.services.local_id
    }

    pub fn remote_id(&self) -> ParticipantId {
        self.remote_id
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.services.events
    }

    pub fn dispatcher(&self) -> &Arc<SignalDispatcher> {
        &self.services.dispatcher
    }

    pub fn directory(&self) -> &Arc<CallDirectory> {
        &self.services.directory
    }

    pub fn config(&self) -> &CallConfig {
        &self.services.config
    }

    /// The most recent call of this chat, if it is still running.
    pub fn current_call(&self) -> Option<CallHandle> {
        lock(&self.current).clone().filter(|call| !call.is_ended())
    }

    /// Place a call to the remote participant.
    pub fn start_call(&self, media_kind: MediaKind) -> Result<CallHandle, CallError> {
        let services = &self.services;
        if !services.channel.is_open() {
            return Err(CallError::ChannelUnavailable);
        }
        let session_id = next_session_id();
        services
            .directory
            .try_claim(services.local_id, self.remote_id, session_id)?;
        services.dispatcher.flush_queue();

        info!(target: "Call/Context", "Calling {} ({media_kind})", self.remote_id);
        let info = CallInfo::new_outgoing(services.local_id, self.remote_id, media_kind);
        let handle = CallSession::spawn(services.clone(), info, session_id);
        *lock(&self.current) = Some(handle.clone());
        Ok(handle)
    }

    /// Save a chat message and relay it to the room.
    pub async fn send_chat(&self, content: &str) -> anyhow::Result<ChatMessage> {
        let store = self
            .chat_store
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no chat store configured"))?;
        let message = store.send_message(self.remote_id, content).await?;

        let envelope = SignalEnvelope::chat(self.services.local_id, self.remote_id, message.clone());
        self.services.channel.send(&encode(&envelope)).await?;
        Ok(message)
    }

    /// Chat history with the remote participant.
    pub async fn history(&self) -> anyhow::Result<Vec<ChatMessage>> {
        match &self.chat_store {
            Some(store) => store.messages(self.remote_id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Hang up any running call and close the channel.
    pub async fn detach(&self) {
        if let Some(call) = self.current_call() {
            let _ = call.hangup();
            call.ended().await;
        }
        self.services.channel.close().await;
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }

    async fn pump(self: Arc<Self>, mut events: mpsc::Receiver<ChannelEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Connected => {
                    debug!(target: "Call/Context", "Channel to {} connected", self.remote_id)
                }
                ChannelEvent::Frame(frame) => self.on_frame(&frame).await,
                ChannelEvent::Disconnected => {
                    warn!(target: "Call/Context", "Channel to {} disconnected", self.remote_id);
                    break;
                }
            }
        }
        debug!(target: "Call/Context", "Pump for {} stopped", self.remote_id);
    }

    async fn on_frame(&self, frame: &[u8]) {
        match self.services.dispatcher.dispatch(frame) {
            Routed::Chat { sender_id, message } => {
                let _ = self
                    .services
                    .events
                    .chat_message
                    .send(Arc::new(ChatReceived { sender_id, message }));
            }
            Routed::IncomingOffer(offer) => self.on_incoming_offer(offer).await,
            _ => {}
        }
    }

    async fn on_incoming_offer(&self, offer: SignalEnvelope) {
        let services = &self.services;
        let caller_id = offer.sender_id;
        let media_kind = match offer.signal() {
            Some(CallSignal::Offer { media_kind, .. }) => {
                media_kind.unwrap_or(services.config.default_media_kind)
            }
            _ => return,
        };

        // A repeated offer belongs to the session still waiting on it. Any
        // other running call, including our own outgoing one, makes us busy.
        if let Some(call) = self.current_call() {
            let ringing = call.role() == CallRole::Callee
                && matches!(call.state(), CallState::Idle | CallState::Ringing { .. });
            if ringing && call.remote_id() == caller_id {
                services.dispatcher.forward(offer);
            } else {
                self.reply_busy(caller_id, "a call is already running").await;
            }
            return;
        }

        let session_id = next_session_id();
        if let Err(e) = services
            .directory
            .try_claim(services.local_id, caller_id, session_id)
        {
            self.reply_busy(caller_id, &e.to_string()).await;
            return;
        }

        info!(target: "Call/Context", "Incoming {media_kind} call from {caller_id}");
        services.dispatcher.flush_queue();
        services.dispatcher.forward(offer);
        let info = CallInfo::new_incoming(services.local_id, caller_id, media_kind);
        let handle = CallSession::spawn(services.clone(), info, session_id);
        *lock(&self.current) = Some(handle);
    }

    async fn reply_busy(&self, caller_id: ParticipantId, why: &str) {
        info!(target: "Call/Context", "Declining call from {caller_id}: {why}");
        let services = &self.services;
        let busy = SignalEnvelope::call(services.local_id, caller_id, CallSignal::CallBusy);
        if let Err(e) = services.channel.send(&encode(&busy)).await {
            warn!(target: "Call/Context", "Could not send call-busy: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockRoom, TestParty, eventually};
    use std::time::Duration;
    use wirecore::{CallState, EndReason};

    #[tokio::test]
    async fn test_chat_message_reaches_remote_events() {
        let room = MockRoom::new();
        let directory = Arc::new(CallDirectory::new());
        let alice = TestParty::join(&room, 1, 2, directory.clone());
        let bob = TestParty::join(&room, 2, 1, directory);
        let mut chats = bob.events.chat_message.subscribe();

        let sent = alice.ctx.send_chat("hello").await.unwrap();
        assert_eq!(sent.content, "hello");

        let received = tokio::time::timeout(Duration::from_secs(1), chats.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.sender_id, 1);
        assert_eq!(received.message.content, "hello");
        assert_eq!(alice.ctx.history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_start_call_requires_open_channel() {
        let room = MockRoom::new();
        let alice = TestParty::join(&room, 1, 2, Arc::new(CallDirectory::new()));
        alice.channel.set_open(false);

        let err = alice.ctx.start_call(MediaKind::Audio).unwrap_err();
        assert!(matches!(err, CallError::ChannelUnavailable));
        assert!(alice.ctx.directory().is_empty());
    }

    #[tokio::test]
    async fn test_second_outgoing_call_is_busy() {
        let room = MockRoom::new();
        let alice = TestParty::join(&room, 1, 2, Arc::new(CallDirectory::new()));

        let first = alice.ctx.start_call(MediaKind::Video).unwrap();
        let err = alice.ctx.start_call(MediaKind::Video).unwrap_err();
        assert!(matches!(err, CallError::Busy(1)));

        first.hangup().unwrap();
        first.ended().await;
        eventually(|| alice.ctx.directory().is_empty().then_some(())).await;
        assert!(alice.ctx.start_call(MediaKind::Video).is_ok());
    }

    #[tokio::test]
    async fn test_offer_while_busy_gets_call_busy() {
        let directory = Arc::new(CallDirectory::new());
        let room_ab = MockRoom::new();
        let room_cb = MockRoom::new();
        let alice = TestParty::join(&room_ab, 1, 2, Arc::new(CallDirectory::new()));
        let bob_with_alice = TestParty::join(&room_ab, 2, 1, directory.clone());
        let carol = TestParty::join(&room_cb, 3, 2, Arc::new(CallDirectory::new()));
        let _bob_with_carol = TestParty::join(&room_cb, 2, 3, directory.clone());

        let mut incoming = bob_with_alice.events.incoming_call.subscribe();
        let _ringing = alice.ctx.start_call(MediaKind::Audio).unwrap();
        let ring = incoming.recv().await.unwrap();
        assert_eq!(ring.caller_id, 1);

        let call = carol.ctx.start_call(MediaKind::Audio).unwrap();
        let ended = call.ended().await;
        assert!(matches!(
            ended.state,
            CallState::Ended {
                reason: EndReason::Busy,
                ..
            }
        ));
        assert_eq!(directory.active_call(2).unwrap().remote_id, 1);
    }

    #[tokio::test]
    async fn test_crossed_calls_answer_busy() {
        let room = MockRoom::new();
        let directory = Arc::new(CallDirectory::new());
        let alice = TestParty::join(&room, 1, 2, directory.clone());
        let bob = TestParty::join(&room, 2, 1, directory);

        let from_alice = alice.ctx.start_call(MediaKind::Audio).unwrap();
        let from_bob = bob.ctx.start_call(MediaKind::Audio).unwrap();

        let alice_end = from_alice.ended().await;
        let bob_end = from_bob.ended().await;
        for end in [&alice_end, &bob_end] {
            assert!(matches!(
                end.state,
                CallState::Ended {
                    reason: EndReason::Busy,
                    ..
                }
            ));
        }
        assert!(alice.channel.sent_names().contains(&"call-busy"));
        assert!(bob.channel.sent_names().contains(&"call-busy"));
        assert_eq!(alice.peers.link_count(), 1);
        assert_eq!(bob.peers.link_count(), 1);
    }

    #[tokio::test]
    async fn test_repeated_offer_reaches_ringing_session() {
        let room = MockRoom::new();
        let (alice, _rx) = room.join();
        let bob = TestParty::join(&room, 2, 1, Arc::new(CallDirectory::new()));
        let mut incoming = bob.events.incoming_call.subscribe();
        let offer = CallSignal::Offer {
            sdp: "v=0 offer".into(),
            media_kind: None,
        };

        alice.send_signal(1, 2, offer.clone()).await;
        let ring = incoming.recv().await.unwrap();
        assert_eq!(ring.media_kind, MediaKind::Video);
        alice.send_signal(1, 2, offer).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ring.call.state().is_ringing());
        assert!(bob.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_stops_pump() {
        let room = MockRoom::new();
        let (channel, _rx) = room.join();
        let (tx, rx) = mpsc::channel(4);
        let ctx = SessionContext::builder(1, 2).attach(channel, rx);

        tx.send(ChannelEvent::Connected).await.unwrap();
        tx.send(ChannelEvent::Disconnected).await.unwrap();
        eventually(|| tx.is_closed().then_some(())).await;
        assert!(ctx.current_call().is_none());
    }
}
