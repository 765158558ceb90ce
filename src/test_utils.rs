use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use wirecore::{
    CallSignal, ChatMessage, ConnectionState, IceCandidate, MediaKind, ParticipantId,
    SignalEnvelope, User, decode, encode,
};

use crate::channel::{ChannelError, ChannelEvent, MessageChannel};
use crate::config::CallConfig;
use crate::context::SessionContext;
use crate::directory::CallDirectory;
use crate::events::EventBus;
use crate::peer::{
    LocalMedia, MediaDevices, MediaTrack, PeerLink, PeerLinkError, PeerLinkEvent, PeerLinkFactory,
    TrackKind,
};
use crate::store::ChatStore;

/// Poll `check` until it yields a value.
pub async fn eventually<T>(mut check: impl FnMut() -> Option<T>) -> T {
    for _ in 0..500 {
        if let Some(value) = check() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition was not met in time");
}

/// In-memory chat room. Every frame sent by a member reaches every member,
/// the sender included, like the real relay.
#[derive(Default)]
pub struct MockRoom {
    members: Mutex<Vec<mpsc::Sender<ChannelEvent>>>,
}

impl MockRoom {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn join(self: &Arc<Self>) -> (Arc<MockChannel>, mpsc::Receiver<ChannelEvent>) {
        let (tx, rx) = mpsc::channel(256);
        self.members.lock().unwrap().push(tx);
        let channel = Arc::new(MockChannel {
            room: self.clone(),
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        });
        (channel, rx)
    }
}

pub struct MockChannel {
    room: Arc<MockRoom>,
    open: AtomicBool,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl MockChannel {
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Every envelope this member sent, decoded.
    pub fn sent(&self) -> Vec<SignalEnvelope> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|frame| decode(frame).expect("sent frames decode"))
            .collect()
    }

    pub fn sent_signals(&self) -> Vec<CallSignal> {
        self.sent()
            .into_iter()
            .filter_map(|e| e.signal().cloned())
            .collect()
    }

    pub fn sent_names(&self) -> Vec<&'static str> {
        self.sent_signals().iter().map(CallSignal::name).collect()
    }

    /// Send a call signal as `sender` to `receiver`.
    pub async fn send_signal(&self, sender: ParticipantId, receiver: ParticipantId, signal: CallSignal) {
        let frame = encode(&SignalEnvelope::call(sender, receiver, signal));
        self.send(&frame).await.expect("room accepts frames");
    }
}

#[async_trait]
impl MessageChannel for MockChannel {
    async fn send(&self, frame: &[u8]) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        self.sent.lock().unwrap().push(frame.to_vec());
        let members = self.room.members.lock().unwrap().clone();
        for member in members {
            let _ = member
                .send(ChannelEvent::Frame(bytes::Bytes::copy_from_slice(frame)))
                .await;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.set_open(false);
    }
}

pub struct MockMedia {
    tracks: Vec<MediaTrack>,
    enabled: Mutex<HashMap<TrackKind, bool>>,
    stops: AtomicUsize,
}

impl MockMedia {
    pub fn new(kind: MediaKind) -> Self {
        let mut tracks = vec![MediaTrack {
            id: "mic".into(),
            kind: TrackKind::Audio,
        }];
        if kind.has_video() {
            tracks.push(MediaTrack {
                id: "camera-front".into(),
                kind: TrackKind::Video,
            });
        }
        let enabled = tracks.iter().map(|t| (t.kind, true)).collect();
        Self {
            tracks,
            enabled: Mutex::new(enabled),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self, kind: TrackKind) -> Option<bool> {
        self.enabled.lock().unwrap().get(&kind).copied()
    }
}

impl LocalMedia for MockMedia {
    fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.clone()
    }

    fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        if let Some(slot) = self.enabled.lock().unwrap().get_mut(&kind) {
            *slot = enabled;
        }
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Media devices with scriptable failure and an optional gate that holds
/// acquisition until opened.
#[derive(Default)]
pub struct MockMediaDevices {
    fail: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
    acquired: Mutex<Vec<Arc<MockMedia>>>,
}

impl MockMediaDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Hold every acquisition until the returned notify fires.
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn acquired(&self) -> Vec<Arc<MockMedia>> {
        self.acquired.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaDevices for MockMediaDevices {
    async fn acquire(&self, kind: MediaKind) -> Result<Arc<dyn LocalMedia>, PeerLinkError> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(PeerLinkError::Media("permission denied".into()));
        }
        let media = Arc::new(MockMedia::new(kind));
        self.acquired.lock().unwrap().push(media.clone());
        Ok(media)
    }
}

pub struct MockPeerLink {
    calls: Mutex<Vec<String>>,
    events: mpsc::Sender<PeerLinkEvent>,
    fail_remote: bool,
    closes: AtomicUsize,
}

impl MockPeerLink {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Candidates applied so far, in order.
    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix("add_candidate:").map(str::to_string))
            .collect()
    }

    pub async fn emit(&self, event: PeerLinkEvent) {
        let _ = self.events.send(event).await;
    }

    pub async fn set_connection_state(&self, state: ConnectionState) {
        self.emit(PeerLinkEvent::ConnectionStateChanged(state)).await;
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PeerLink for MockPeerLink {
    async fn create_offer(&self) -> Result<String, PeerLinkError> {
        self.record("create_offer".into());
        Ok("v=0 offer".into())
    }

    async fn create_answer(&self) -> Result<String, PeerLinkError> {
        self.record("create_answer".into());
        Ok("v=0 answer".into())
    }

    async fn set_local_description(&self, sdp: &str) -> Result<(), PeerLinkError> {
        self.record(format!("set_local:{sdp}"));
        Ok(())
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<(), PeerLinkError> {
        self.record(format!("set_remote:{sdp}"));
        if self.fail_remote {
            return Err(PeerLinkError::Negotiation("malformed description".into()));
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerLinkError> {
        self.record(format!("add_candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn replace_outbound_video_track(&self, track: MediaTrack) -> Result<(), PeerLinkError> {
        self.record(format!("replace_video:{}", track.id));
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.record("close".into());
    }
}

#[derive(Default)]
pub struct MockPeerLinkFactory {
    links: Mutex<Vec<Arc<MockPeerLink>>>,
    fail_remote: AtomicBool,
}

impl MockPeerLinkFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Links created from now on reject remote descriptions.
    pub fn fail_remote_descriptions(&self) {
        self.fail_remote.store(true, Ordering::SeqCst);
    }

    pub fn link(&self, index: usize) -> Option<Arc<MockPeerLink>> {
        self.links.lock().unwrap().get(index).cloned()
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub async fn wait_for_link(&self, index: usize) -> Arc<MockPeerLink> {
        eventually(|| self.link(index)).await
    }
}

#[async_trait]
impl PeerLinkFactory for MockPeerLinkFactory {
    async fn create(
        &self,
        _ice_servers: &[String],
        _media: Arc<dyn LocalMedia>,
    ) -> Result<(Arc<dyn PeerLink>, mpsc::Receiver<PeerLinkEvent>), PeerLinkError> {
        let (events, rx) = mpsc::channel(64);
        let link = Arc::new(MockPeerLink {
            calls: Mutex::new(Vec::new()),
            events,
            fail_remote: self.fail_remote.load(Ordering::SeqCst),
            closes: AtomicUsize::new(0),
        });
        self.links.lock().unwrap().push(link.clone());
        Ok((link, rx))
    }
}

/// Chat store that keeps messages in memory.
#[derive(Default)]
pub struct MemoryChatStore {
    local: Option<User>,
    messages: Mutex<Vec<ChatMessage>>,
}

impl MemoryChatStore {
    pub fn new(local_id: ParticipantId) -> Arc<Self> {
        Arc::new(Self {
            local: Some(User {
                id: local_id,
                username: format!("user{local_id}"),
                email: None,
            }),
            messages: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn send_message(
        &self,
        receiver_id: ParticipantId,
        content: &str,
    ) -> anyhow::Result<ChatMessage> {
        let mut messages = self.messages.lock().unwrap();
        let saved = ChatMessage {
            id: Some(messages.len() as i64 + 1),
            sender: self.local.clone(),
            receiver: Some(User {
                id: receiver_id,
                username: format!("user{receiver_id}"),
                email: None,
            }),
            content: content.to_string(),
            timestamp: None,
        };
        messages.push(saved.clone());
        Ok(saved)
    }

    async fn messages(&self, _receiver_id: ParticipantId) -> anyhow::Result<Vec<ChatMessage>> {
        Ok(self.messages.lock().unwrap().clone())
    }
}

/// One participant wired to a shared room with mock media.
pub struct TestParty {
    pub ctx: Arc<SessionContext>,
    pub channel: Arc<MockChannel>,
    pub media: Arc<MockMediaDevices>,
    pub peers: Arc<MockPeerLinkFactory>,
    pub events: Arc<EventBus>,
}

impl TestParty {
    pub fn join(
        room: &Arc<MockRoom>,
        local_id: ParticipantId,
        remote_id: ParticipantId,
        directory: Arc<CallDirectory>,
    ) -> Self {
        Self::join_with(room, local_id, remote_id, directory, CallConfig::default())
    }

    pub fn join_with(
        room: &Arc<MockRoom>,
        local_id: ParticipantId,
        remote_id: ParticipantId,
        directory: Arc<CallDirectory>,
        config: CallConfig,
    ) -> Self {
        let (channel, rx) = room.join();
        let media = MockMediaDevices::new();
        let peers = MockPeerLinkFactory::new();
        let events = Arc::new(EventBus::new());
        let ctx = SessionContext::builder(local_id, remote_id)
            .with_directory(directory)
            .with_config(config)
            .with_events(events.clone())
            .with_media(media.clone(), peers.clone())
            .with_chat_store(MemoryChatStore::new(local_id))
            .attach(channel.clone(), rx);
        Self {
            ctx,
            channel,
            media,
            peers,
            events,
        }
    }
}
