//! Call state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::candidates::CandidateBuffer;
use crate::envelope::IceCandidate;
use crate::types::call::{CallRole, EndReason, MediaKind, ParticipantId, format_duration};

/// Lifecycle state of one call. `Ended` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub enum CallState {
    #[default]
    Idle,
    /// Outgoing call: offer sent, waiting for the callee.
    Dialing { since: DateTime<Utc> },
    /// Incoming call: ringing locally.
    Ringing { received_at: DateTime<Utc> },
    /// Accepted, descriptions and candidates being exchanged.
    Negotiating { since: DateTime<Utc> },
    /// Media flowing.
    Connected { connected_at: DateTime<Utc> },
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_secs: u64,
    },
}

impl CallState {
    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    /// Holding the participant: anything other than `Idle` or `Ended`.
    pub fn is_busy(&self) -> bool {
        !matches!(self, Self::Idle | Self::Ended { .. })
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    /// Candidates may be buffered or applied in these states. Late trickle
    /// candidates can still arrive once connected.
    pub fn accepts_candidates(&self) -> bool {
        matches!(
            self,
            Self::Dialing { .. }
                | Self::Ringing { .. }
                | Self::Negotiating { .. }
                | Self::Connected { .. }
        )
    }

    /// Short name, used in logs and events.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Dialing { .. } => "dialing",
            Self::Ringing { .. } => "ringing",
            Self::Negotiating { .. } => "negotiating",
            Self::Connected { .. } => "connected",
            Self::Ended { .. } => "ended",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallTransition {
    /// Caller sent its offer.
    OfferSent,
    /// Callee received an offer.
    OfferReceived,
    /// Callee accepted.
    LocalAccepted,
    /// Caller received `call-accepted`.
    RemoteAccepted,
    /// Callee applied the caller's offer as remote description.
    OfferApplied,
    /// Caller applied the callee's answer.
    AnswerApplied,
    MediaConnected,
    /// `reported_duration` is the remote side's figure from `call-ended`.
    Terminated {
        reason: EndReason,
        reported_duration: Option<u64>,
    },
}

/// Pick the duration to report when a call ends: the remote figure when it
/// is positive, the locally measured one otherwise.
pub fn resolve_duration(local: u64, reported: Option<u64>) -> u64 {
    match reported {
        Some(remote) if remote > 0 => remote,
        _ => local,
    }
}

/// One call as seen from one participant.
#[derive(Debug, Clone, Serialize)]
pub struct CallInfo {
    pub local_id: ParticipantId,
    pub remote_id: ParticipantId,
    pub role: CallRole,
    pub media_kind: MediaKind,
    pub state: CallState,
    pub has_remote_description: bool,
    pub has_received_answer: bool,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    /// Seconds counted by the duration ticker while connected.
    pub elapsed_secs: u64,
    #[serde(skip)]
    pub pending_candidates: CandidateBuffer,
}

impl CallInfo {
    fn new(
        local_id: ParticipantId,
        remote_id: ParticipantId,
        role: CallRole,
        media_kind: MediaKind,
    ) -> Self {
        Self {
            local_id,
            remote_id,
            role,
            media_kind,
            state: CallState::Idle,
            has_remote_description: false,
            has_received_answer: false,
            started_at: Utc::now(),
            connected_at: None,
            elapsed_secs: 0,
            pending_candidates: CandidateBuffer::new(),
        }
    }

    pub fn new_outgoing(
        local_id: ParticipantId,
        remote_id: ParticipantId,
        media_kind: MediaKind,
    ) -> Self {
        Self::new(local_id, remote_id, CallRole::Caller, media_kind)
    }

    pub fn new_incoming(
        local_id: ParticipantId,
        remote_id: ParticipantId,
        media_kind: MediaKind,
    ) -> Self {
        Self::new(local_id, remote_id, CallRole::Callee, media_kind)
    }

    pub fn is_caller(&self) -> bool {
        self.role.is_caller()
    }

    /// Seconds of connected time so far, or the frozen figure once ended.
    pub fn duration_secs(&self) -> u64 {
        match self.state {
            CallState::Ended { duration_secs, .. } => duration_secs,
            _ => self.elapsed_secs,
        }
    }

    /// Advance the duration ticker by one second. No-op unless connected.
    pub fn tick(&mut self) -> u64 {
        if self.state.is_connected() {
            self.elapsed_secs += 1;
        }
        self.elapsed_secs
    }

    /// Whether a candidate can go straight to the peer link. Candidates
    /// must wait for this round's remote description.
    pub fn can_apply_candidates(&self, link_ready: bool) -> bool {
        link_ready && self.has_remote_description && !self.state.is_ended()
    }

    pub fn buffer_candidate(&mut self, candidate: IceCandidate) {
        self.pending_candidates.push(candidate);
    }

    pub fn take_pending_candidates(&mut self) -> Vec<IceCandidate> {
        self.pending_candidates.drain()
    }

    /// Text shown next to the call window.
    pub fn status_line(&self) -> String {
        match &self.state {
            CallState::Idle => String::new(),
            CallState::Dialing { .. } => "Calling...".to_string(),
            CallState::Ringing { .. } => format!("Incoming {} call", self.media_kind),
            CallState::Negotiating { .. } => "Connecting...".to_string(),
            CallState::Connected { .. } => format_duration(self.elapsed_secs),
            CallState::Ended {
                reason,
                duration_secs,
                ..
            } if *duration_secs > 0 => {
                format!("Call ended ({}) {}", reason, format_duration(*duration_secs))
            }
            CallState::Ended { reason, .. } => format!("Call ended ({})", reason),
        }
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let new_state = match (&self.state, transition) {
            (CallState::Idle, CallTransition::OfferSent) if self.is_caller() => {
                CallState::Dialing { since: Utc::now() }
            }
            (CallState::Idle, CallTransition::OfferReceived) if !self.is_caller() => {
                CallState::Ringing {
                    received_at: Utc::now(),
                }
            }
            (CallState::Ringing { .. }, CallTransition::LocalAccepted) => {
                CallState::Negotiating { since: Utc::now() }
            }
            (CallState::Dialing { .. }, CallTransition::RemoteAccepted) => {
                CallState::Negotiating { since: Utc::now() }
            }
            (CallState::Negotiating { since }, CallTransition::OfferApplied)
                if !self.is_caller() =>
            {
                self.has_remote_description = true;
                CallState::Negotiating { since: *since }
            }
            (CallState::Negotiating { since }, CallTransition::AnswerApplied)
                if self.is_caller() =>
            {
                self.has_remote_description = true;
                self.has_received_answer = true;
                CallState::Negotiating { since: *since }
            }
            (CallState::Dialing { .. }, CallTransition::AnswerApplied) if self.is_caller() => {
                self.has_remote_description = true;
                self.has_received_answer = true;
                CallState::Negotiating { since: Utc::now() }
            }
            (CallState::Negotiating { .. }, CallTransition::MediaConnected) => {
                let now = Utc::now();
                self.connected_at = Some(now);
                CallState::Connected { connected_at: now }
            }
            (
                current,
                CallTransition::Terminated {
                    reason,
                    reported_duration,
                },
            ) if !current.is_ended() => {
                let local = if current.is_connected() {
                    self.elapsed_secs
                } else {
                    0
                };
                CallState::Ended {
                    reason,
                    ended_at: Utc::now(),
                    duration_secs: resolve_duration(local, reported_duration),
                }
            }
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: current.name().to_string(),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.state = new_state;
        if self.state.is_ended() {
            self.pending_candidates.clear();
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
