//! Per-call session actor.
//!
//! Each call runs as one task owning its [`CallInfo`]. Inbound signals,
//! local commands, peer link notifications and timers all arrive through a
//! single `select!` loop. Awaiting the peer link or media devices is the only
//! suspension point: while suspended, a hangup or `call-ended` aborts the
//! step and everything else waits its turn.

use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval};
use wirecore::{
    CallInfo, CallRole, CallSignal, CallState, CallTransition, ConnectionState, EndReason,
    IceCandidate, MediaKind, ParticipantId, Payload, SignalEnvelope, encode,
};

use crate::channel::MessageChannel;
use crate::config::CallConfig;
use crate::directory::{CallDirectory, SessionId};
use crate::dispatcher::{HandlerId, SignalDispatcher, SignalHandler};
use crate::error::CallError;
use crate::events::{CallEnded, CallStateChanged, EventBus, IncomingCall};
use crate::peer::{MediaDevices, MediaTrack, PeerLinkAdapter, PeerLinkEvent, PeerLinkFactory, TrackKind};

/// Everything a session needs from its chat context.
pub(crate) struct SessionServices {
    pub local_id: ParticipantId,
    pub channel: Arc<dyn MessageChannel>,
    pub dispatcher: Arc<SignalDispatcher>,
    pub directory: Arc<CallDirectory>,
    pub events: Arc<EventBus>,
    pub config: CallConfig,
    pub media: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerLinkFactory>,
}

/// Local actions on a call.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Accept,
    Reject,
    Hangup,
    SetAudioEnabled(bool),
    SetVideoEnabled(bool),
    SwitchCamera(MediaTrack),
}

/// Point-in-time view of a call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub state: CallState,
    pub duration_secs: u64,
    pub status_line: String,
}

impl CallSnapshot {
    fn of(info: &CallInfo) -> Self {
        Self {
            state: info.state.clone(),
            duration_secs: info.duration_secs(),
            status_line: info.status_line(),
        }
    }
}

/// Handle to a running call session.
#[derive(Debug, Clone)]
pub struct CallHandle {
    session_id: SessionId,
    remote_id: ParticipantId,
    role: CallRole,
    media_kind: MediaKind,
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn remote_id(&self) -> ParticipantId {
        self.remote_id
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn media_kind(&self) -> MediaKind {
        self.media_kind
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> CallState {
        self.status.borrow().state.clone()
    }

    pub fn is_ended(&self) -> bool {
        self.status.borrow().state.is_ended()
    }

    pub fn accept(&self) -> Result<(), CallError> {
        self.send(SessionCommand::Accept)
    }

    pub fn reject(&self) -> Result<(), CallError> {
        self.send(SessionCommand::Reject)
    }

    pub fn hangup(&self) -> Result<(), CallError> {
        self.send(SessionCommand::Hangup)
    }

    pub fn set_audio_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.send(SessionCommand::SetAudioEnabled(enabled))
    }

    pub fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.send(SessionCommand::SetVideoEnabled(enabled))
    }

    pub fn switch_camera(&self, track: MediaTrack) -> Result<(), CallError> {
        self.send(SessionCommand::SwitchCamera(track))
    }

    /// Wait until `done` holds for the call's snapshot.
    pub async fn wait_for(&self, mut done: impl FnMut(&CallSnapshot) -> bool) -> CallSnapshot {
        let mut status = self.status.clone();
        let reached = status.wait_for(|s| done(s)).await.map(|s| s.clone());
        reached.unwrap_or_else(|_| status.borrow().clone())
    }

    /// Wait for the call to end.
    pub async fn ended(&self) -> CallSnapshot {
        self.wait_for(|s| s.state.is_ended()).await
    }

    fn send(&self, command: SessionCommand) -> Result<(), CallError> {
        if self.is_ended() {
            return Err(CallError::SessionClosed);
        }
        self.commands
            .send(command)
            .map_err(|_| CallError::SessionClosed)
    }
}

/// Dispatcher-facing intake of a session.
struct SessionInbox(mpsc::UnboundedSender<SignalEnvelope>);

impl SignalHandler for SessionInbox {
    fn deliver(&self, envelope: SignalEnvelope) -> Result<(), SignalEnvelope> {
        self.0.send(envelope).map_err(|err| err.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    Ring,
    Answer,
    Media,
}

enum Input {
    Signal(SignalEnvelope),
    Command(SessionCommand),
    Peer(PeerLinkEvent),
    Deadline(Deadline),
    Tick,
}

pub(crate) struct CallSession {
    id: SessionId,
    info: CallInfo,
    services: Arc<SessionServices>,
    handle: CallHandle,
    signals: mpsc::UnboundedReceiver<SignalEnvelope>,
    signals_tx: mpsc::UnboundedSender<SignalEnvelope>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    handler_id: Option<HandlerId>,
    link: Option<Arc<PeerLinkAdapter>>,
    peer_events: Option<mpsc::Receiver<PeerLinkEvent>>,
    remote_offer: Option<String>,
    deadline: Option<(Instant, Deadline)>,
    ticker: Option<Interval>,
    deferred: VecDeque<Input>,
    status: watch::Sender<CallSnapshot>,
    torn_down: bool,
}

impl CallSession {
    /// Start the actor for `info` and return its handle.
    pub(crate) fn spawn(services: Arc<SessionServices>, info: CallInfo, id: SessionId) -> CallHandle {
        let (signals_tx, signals) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(CallSnapshot::of(&info));

        let handle = CallHandle {
            session_id: id,
            remote_id: info.remote_id,
            role: info.role,
            media_kind: info.media_kind,
            commands: commands_tx,
            status: status_rx,
        };

        let session = Self {
            id,
            info,
            services,
            handle: handle.clone(),
            signals,
            signals_tx,
            commands,
            handler_id: None,
            link: None,
            peer_events: None,
            remote_offer: None,
            deadline: None,
            ticker: None,
            deferred: VecDeque::new(),
            status,
            torn_down: false,
        };
        tokio::spawn(session.run());
        handle
    }

    async fn run(mut self) {
        let _claim = scopeguard::guard(
            (self.services.directory.clone(), self.info.local_id, self.id),
            |(directory, local_id, id)| {
                directory.release(local_id, id);
            },
        );

        info!(
            target: "Call/Session",
            "Session {} started: {:?} of a {} call with {}",
            self.id, self.info.role, self.info.media_kind, self.info.remote_id
        );

        let inbox = Arc::new(SessionInbox(self.signals_tx.clone()));
        self.handler_id = Some(self.services.dispatcher.register_call_handler(inbox));

        if self.info.is_caller() {
            self.place_call().await;
        }

        while !self.info.state.is_ended() {
            let input = match self.deferred.pop_front() {
                Some(input) => input,
                None => self.next_input().await,
            };
            self.handle_input(input).await;
        }

        debug!(target: "Call/Session", "Session {} finished", self.id);
    }

    async fn next_input(&mut self) -> Input {
        loop {
            tokio::select! {
                Some(envelope) = self.signals.recv() => return Input::Signal(envelope),
                Some(command) = self.commands.recv() => return Input::Command(command),
                event = next_peer_event(&mut self.peer_events) => match event {
                    Some(event) => return Input::Peer(event),
                    None => self.peer_events = None,
                },
                kind = wait_deadline(self.deadline) => {
                    self.deadline = None;
                    return Input::Deadline(kind);
                }
                _ = next_tick(&mut self.ticker) => return Input::Tick,
            }
        }
    }

    /// Await a peer link or media step. Returns `None` if the session ended
    /// while waiting; the step's result is then discarded.
    async fn suspend<T>(&mut self, step: impl Future<Output = T>) -> Option<T> {
        tokio::pin!(step);
        loop {
            tokio::select! {
                biased;
                out = &mut step => return Some(out),
                Some(envelope) = self.signals.recv() => {
                    let ended = match envelope.signal() {
                        Some(CallSignal::CallEnded { duration })
                            if envelope.sender_id == self.info.remote_id => Some(*duration),
                        _ => None,
                    };
                    if let Some(duration) = ended {
                        self.finish(EndReason::RemoteHangup, Some(duration)).await;
                        return None;
                    }
                    self.deferred.push_back(Input::Signal(envelope));
                }
                Some(command) = self.commands.recv() => {
                    if command == SessionCommand::Hangup {
                        self.finish(EndReason::LocalHangup, None).await;
                        return None;
                    }
                    self.deferred.push_back(Input::Command(command));
                }
                event = next_peer_event(&mut self.peer_events) => match event {
                    Some(event) => self.deferred.push_back(Input::Peer(event)),
                    None => self.peer_events = None,
                },
                kind = wait_deadline(self.deadline) => {
                    self.deadline = None;
                    self.on_deadline(kind).await;
                    if self.info.state.is_ended() {
                        return None;
                    }
                }
                _ = next_tick(&mut self.ticker) => self.deferred.push_back(Input::Tick),
            }
        }
    }

    async fn handle_input(&mut self, input: Input) {
        match input {
            Input::Signal(envelope) => self.on_signal(envelope).await,
            Input::Command(command) => self.on_command(command).await,
            Input::Peer(event) => self.on_peer_event(event).await,
            Input::Deadline(kind) => self.on_deadline(kind).await,
            Input::Tick => {
                self.info.tick();
                self.status.send_replace(CallSnapshot::of(&self.info));
            }
        }
    }

    async fn on_signal(&mut self, envelope: SignalEnvelope) {
        if envelope.sender_id != self.info.remote_id {
            debug!(
                target: "Call/Session",
                "Ignoring signal from {} (call is with {})",
                envelope.sender_id, self.info.remote_id
            );
            return;
        }
        let Payload::Call(signal) = envelope.payload else {
            return;
        };
        debug!(target: "Call/Session", "<- {} in {}", signal.name(), self.info.state.name());

        match signal {
            CallSignal::Offer { sdp, .. } => self.on_offer(sdp),
            CallSignal::Answer { sdp } => self.on_answer(sdp).await,
            CallSignal::Candidate(candidate) => self.on_candidate(candidate).await,
            CallSignal::CallAccepted => self.on_accepted(),
            CallSignal::CallRejected if self.is_dialing() => {
                self.finish(EndReason::Rejected, None).await
            }
            CallSignal::CallBusy if self.is_dialing() => self.finish(EndReason::Busy, None).await,
            CallSignal::CallEnded { duration } => {
                self.finish(EndReason::RemoteHangup, Some(duration)).await
            }
            other => debug!(
                target: "Call/Session",
                "Dropping {} in {}",
                other.name(),
                self.info.state.name()
            ),
        }
    }

    fn is_dialing(&self) -> bool {
        self.info.is_caller() && matches!(self.info.state, CallState::Dialing { .. })
    }

    fn on_offer(&mut self, sdp: String) {
        if self.info.is_caller() || self.info.state != CallState::Idle {
            debug!(target: "Call/Session", "Dropping repeated offer");
            return;
        }
        self.remote_offer = Some(sdp);
        if !self.transition(CallTransition::OfferReceived) {
            return;
        }
        self.arm(Deadline::Ring);
        let _ = self.services.events.incoming_call.send(Arc::new(IncomingCall {
            caller_id: self.info.remote_id,
            media_kind: self.info.media_kind,
            call: self.handle.clone(),
        }));
    }

    async fn on_answer(&mut self, sdp: String) {
        let negotiating = matches!(
            self.info.state,
            CallState::Dialing { .. } | CallState::Negotiating { .. }
        );
        if !self.info.is_caller() || !negotiating {
            debug!(target: "Call/Session", "Dropping answer in {}", self.info.state.name());
            return;
        }
        if self.info.has_received_answer {
            debug!(target: "Call/Session", "Dropping repeated answer");
            return;
        }
        let Some(link) = self.link.clone() else {
            warn!(target: "Call/Session", "Answer arrived without a peer link");
            return;
        };

        match self.suspend(async move { link.apply_remote_description(&sdp).await }).await {
            None => return,
            Some(Err(e)) => {
                error!(target: "Call/Session", "Failed to apply answer: {e}");
                self.finish(EndReason::NegotiationFailed, None).await;
                return;
            }
            Some(Ok(())) => {}
        }
        if self.transition(CallTransition::AnswerApplied) {
            self.drain_candidates().await;
        }
    }

    async fn on_candidate(&mut self, candidate: IceCandidate) {
        if !self.info.state.accepts_candidates() {
            debug!(target: "Call/Session", "Dropping candidate in {}", self.info.state.name());
            return;
        }
        let link = match self.link.clone() {
            Some(link) if self.info.can_apply_candidates(true) => link,
            _ => {
                self.info.buffer_candidate(candidate);
                debug!(
                    target: "Call/Session",
                    "Buffered candidate ({} pending)",
                    self.info.pending_candidates.len()
                );
                return;
            }
        };
        self.apply_candidate(link, candidate).await;
    }

    async fn apply_candidate(&mut self, link: Arc<PeerLinkAdapter>, candidate: IceCandidate) {
        if let Some(Err(e)) = self
            .suspend(async move { link.add_candidate(&candidate).await })
            .await
        {
            warn!(target: "Call/Session", "Dropping candidate: {e}");
        }
    }

    /// Apply buffered candidates in arrival order.
    async fn drain_candidates(&mut self) {
        let Some(link) = self.link.clone() else {
            return;
        };
        for candidate in self.info.take_pending_candidates() {
            if self.info.state.is_ended() {
                return;
            }
            self.apply_candidate(link.clone(), candidate).await;
        }
    }

    fn on_accepted(&mut self) {
        if !self.is_dialing() {
            debug!(target: "Call/Session", "Dropping call-accepted in {}", self.info.state.name());
            return;
        }
        if self.transition(CallTransition::RemoteAccepted) {
            self.arm(Deadline::Media);
        }
    }

    async fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Accept => self.accept().await,
            SessionCommand::Reject if self.info.state.is_ringing() => {
                self.finish(EndReason::Declined, None).await
            }
            SessionCommand::Reject => {
                debug!(target: "Call/Session", "Nothing to reject in {}", self.info.state.name())
            }
            SessionCommand::Hangup => self.finish(EndReason::LocalHangup, None).await,
            SessionCommand::SetAudioEnabled(enabled) => self.set_track(TrackKind::Audio, enabled),
            SessionCommand::SetVideoEnabled(enabled) => self.set_track(TrackKind::Video, enabled),
            SessionCommand::SwitchCamera(track) => {
                let Some(link) = self.link.clone() else {
                    debug!(target: "Call/Session", "No media to switch yet");
                    return;
                };
                if let Some(Err(e)) = self.suspend(async move { link.switch_camera(track).await }).await {
                    warn!(target: "Call/Session", "Camera switch failed: {e}");
                }
            }
        }
    }

    fn set_track(&self, kind: TrackKind, enabled: bool) {
        match &self.link {
            Some(link) => link.set_track_enabled(kind, enabled),
            None => debug!(target: "Call/Session", "No media yet, ignoring {kind:?} toggle"),
        }
    }

    /// Caller side: acquire media, create the link and send the offer.
    async fn place_call(&mut self) {
        let Some(link) = self.open_link().await else {
            return;
        };
        let sdp = match self.suspend(async move { link.offer().await }).await {
            None => return,
            Some(Err(e)) => {
                error!(target: "Call/Session", "Failed to create offer: {e}");
                self.finish(EndReason::NegotiationFailed, None).await;
                return;
            }
            Some(Ok(sdp)) => sdp,
        };

        let offer = CallSignal::Offer {
            sdp,
            media_kind: Some(self.info.media_kind),
        };
        // Dialing before the offer leaves, so an instant reply finds us ready.
        if self.transition(CallTransition::OfferSent) {
            self.arm(Deadline::Answer);
            self.send(offer).await;
        }
    }

    /// Callee side: accept the ringing call and answer the stored offer.
    async fn accept(&mut self) {
        if !self.info.state.can_accept() {
            debug!(target: "Call/Session", "Nothing to accept in {}", self.info.state.name());
            return;
        }
        let Some(offer) = self.remote_offer.take() else {
            warn!(target: "Call/Session", "Ringing without an offer");
            return;
        };
        if !self.transition(CallTransition::LocalAccepted) {
            return;
        }
        self.arm(Deadline::Media);
        if !self.send(CallSignal::CallAccepted).await {
            return;
        }

        let Some(link) = self.open_link().await else {
            return;
        };
        let remote = link.clone();
        match self.suspend(async move { remote.apply_remote_description(&offer).await }).await {
            None => return,
            Some(Err(e)) => {
                error!(target: "Call/Session", "Failed to apply offer: {e}");
                self.finish(EndReason::NegotiationFailed, None).await;
                return;
            }
            Some(Ok(())) => {}
        }
        if !self.transition(CallTransition::OfferApplied) {
            return;
        }
        self.drain_candidates().await;
        if self.info.state.is_ended() {
            return;
        }

        match self.suspend(async move { link.answer().await }).await {
            None => {}
            Some(Err(e)) => warn!(target: "Call/Session", "Failed to create answer: {e}"),
            Some(Ok(sdp)) => {
                self.send(CallSignal::Answer { sdp }).await;
            }
        }
    }

    /// Acquire local media and create the peer link. Ends the session on
    /// failure.
    async fn open_link(&mut self) -> Option<Arc<PeerLinkAdapter>> {
        let devices = self.services.media.clone();
        let kind = self.info.media_kind;
        let media = match self.suspend(async move { devices.acquire(kind).await }).await? {
            Ok(media) => media,
            Err(e) => {
                warn!(target: "Call/Session", "Could not acquire {kind} media: {e}");
                self.finish(EndReason::MediaUnavailable, None).await;
                return None;
            }
        };

        let factory = self.services.peers.clone();
        let ice_servers = self.services.config.ice_servers.clone();
        let attached = media.clone();
        let created = self
            .suspend(async move { factory.create(&ice_servers, attached).await })
            .await;
        match created {
            Some(Ok((link, events))) => {
                let adapter = Arc::new(PeerLinkAdapter::new(link, media));
                let tracks: Vec<String> = adapter.tracks().into_iter().map(|t| t.id).collect();
                debug!(target: "Call/Session", "Peer link up with tracks {tracks:?}");
                self.link = Some(adapter.clone());
                self.peer_events = Some(events);
                Some(adapter)
            }
            Some(Err(e)) => {
                media.stop();
                warn!(target: "Call/Session", "Could not create peer link: {e}");
                self.finish(EndReason::MediaUnavailable, None).await;
                None
            }
            None => {
                media.stop();
                None
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerLinkEvent) {
        match event {
            PeerLinkEvent::CandidateGenerated(candidate) => {
                self.send(CallSignal::Candidate(candidate)).await;
            }
            PeerLinkEvent::ConnectionStateChanged(state) => self.on_connection_state(state).await,
        }
    }

    async fn on_connection_state(&mut self, state: ConnectionState) {
        debug!(target: "Call/Session", "Peer link is {state:?} in {}", self.info.state.name());
        match (&self.info.state, state) {
            (CallState::Negotiating { .. }, ConnectionState::Connected) => {
                if self.transition(CallTransition::MediaConnected) {
                    self.deadline = None;
                    let period = self.services.config.tick_interval;
                    self.ticker = Some(tokio::time::interval_at(Instant::now() + period, period));
                }
            }
            (CallState::Connected { .. }, s) if s.is_down() => {
                if self.info.is_caller() {
                    self.finish(EndReason::ConnectionLost, None).await;
                } else {
                    info!(target: "Call/Session", "Connection {s:?}, waiting for the caller to end the call");
                }
            }
            (CallState::Negotiating { .. }, ConnectionState::Failed) => {
                self.finish(EndReason::NegotiationFailed, None).await;
            }
            _ => {}
        }
    }

    async fn on_deadline(&mut self, kind: Deadline) {
        let expired = match kind {
            Deadline::Ring if self.info.state.is_ringing() => Some(EndReason::Missed),
            Deadline::Answer if self.is_dialing() && !self.info.has_received_answer => {
                Some(EndReason::Timeout)
            }
            Deadline::Media if !self.info.state.is_connected() && !self.info.state.is_ended() => {
                if !self.info.is_caller() {
                    Some(EndReason::NegotiationFailed)
                } else if !self.info.has_received_answer {
                    Some(EndReason::Timeout)
                } else {
                    None
                }
            }
            _ => None,
        };
        if let Some(reason) = expired {
            info!(target: "Call/Session", "{kind:?} deadline expired in {}", self.info.state.name());
            self.finish(reason, None).await;
        }
    }

    fn arm(&mut self, kind: Deadline) {
        let config = &self.services.config;
        let after = match kind {
            Deadline::Ring => config.ring_timeout,
            Deadline::Answer => config.answer_timeout,
            Deadline::Media => config.media_timeout,
        };
        self.deadline = Some((Instant::now() + after, kind));
    }

    fn transition(&mut self, transition: CallTransition) -> bool {
        let from = self.info.state.name();
        match advance(&mut self.info, transition) {
            Ok(()) => {
                debug!(target: "Call/Session", "{} -> {}", from, self.info.state.name());
                self.status.send_replace(CallSnapshot::of(&self.info));
                let _ = self.services.events.state_changed.send(Arc::new(CallStateChanged {
                    remote_id: self.info.remote_id,
                    state: self.info.state.clone(),
                }));
                true
            }
            Err(e) => {
                warn!(target: "Call/Session", "{e}");
                false
            }
        }
    }

    async fn send_signal(&self, signal: CallSignal) -> Result<(), CallError> {
        let channel = &self.services.channel;
        if !channel.is_open() {
            return Err(CallError::ChannelUnavailable);
        }
        debug!(target: "Call/Session", "-> {}", signal.name());
        let envelope = SignalEnvelope::call(self.info.local_id, self.info.remote_id, signal);
        channel.send(&encode(&envelope)).await?;
        Ok(())
    }

    /// Send `signal`, ending the session if the channel is gone.
    async fn send(&mut self, signal: CallSignal) -> bool {
        match self.send_signal(signal).await {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "Call/Session", "Send failed: {e}");
                self.finish(EndReason::ChannelUnavailable, None).await;
                false
            }
        }
    }

    /// End the call: tell the remote side if it needs telling, move to
    /// `Ended` and tear down.
    async fn finish(&mut self, reason: EndReason, reported_duration: Option<u64>) {
        if self.info.state.is_ended() {
            return;
        }

        // Nothing went out yet while still idle.
        if self.info.state != CallState::Idle {
            let notice = if reason.sends_call_ended() {
                Some(CallSignal::CallEnded {
                    duration: self.info.duration_secs(),
                })
            } else if reason.sends_call_rejected() {
                Some(CallSignal::CallRejected)
            } else {
                None
            };
            if let Some(notice) = notice {
                if let Err(e) = self.send_signal(notice).await {
                    warn!(target: "Call/Session", "Could not notify {}: {e}", self.info.remote_id);
                }
            }
        }

        self.transition(CallTransition::Terminated {
            reason,
            reported_duration,
        });
        info!(
            target: "Call/Session",
            "Call with {} ended ({reason}) after {}s",
            self.info.remote_id,
            self.info.duration_secs()
        );
        self.teardown().await;
    }

    /// Release everything the session holds. Runs once.
    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.deadline = None;
        self.ticker = None;
        self.deferred.clear();
        self.remote_offer = None;
        self.peer_events = None;
        if let Some(link) = self.link.take() {
            link.release().await;
        }
        self.info.pending_candidates.clear();

        let dispatcher = &self.services.dispatcher;
        if let Some(id) = self.handler_id.take() {
            dispatcher.unregister_if_current(id);
        }
        dispatcher.flush_queue();
        self.services.directory.release(self.info.local_id, self.id);

        let reason = match self.info.state {
            CallState::Ended { reason, .. } => reason,
            _ => EndReason::LocalHangup,
        };
        let _ = self.services.events.call_ended.send(Arc::new(CallEnded {
            remote_id: self.info.remote_id,
            reason,
            duration_secs: self.info.duration_secs(),
        }));
        self.status.send_replace(CallSnapshot::of(&self.info));
    }
}

fn advance(info: &mut CallInfo, transition: CallTransition) -> Result<(), CallError> {
    info.apply_transition(transition)?;
    Ok(())
}

async fn next_peer_event(events: &mut Option<mpsc::Receiver<PeerLinkEvent>>) -> Option<PeerLinkEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<(Instant, Deadline)>) -> Deadline {
    match deadline {
        Some((at, kind)) => {
            tokio::time::sleep_until(at).await;
            kind
        }
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
