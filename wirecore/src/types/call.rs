use serde::{Deserialize, Serialize};
use std::fmt;

/// Participant identifier as issued by the chat backend.
pub type ParticipantId = i64;

/// Which side of the call this participant is on. Fixed at session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallRole {
    Caller,
    Callee,
}

impl CallRole {
    pub fn is_caller(&self) -> bool {
        matches!(self, Self::Caller)
    }
}

/// Media requested for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    #[default]
    Video,
}

impl MediaKind {
    /// The `callType` string used on the wire.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    /// Parse a wire `callType`. Unknown values yield `None`.
    pub fn from_call_type(call_type: &str) -> Option<Self> {
        match call_type {
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            _ => None,
        }
    }

    pub fn has_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call reached `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndReason {
    /// We hung up.
    LocalHangup,
    /// The remote side sent `call-ended`.
    RemoteHangup,
    /// We declined an incoming call.
    Declined,
    /// An incoming call rang out without being answered.
    Missed,
    /// The callee declined our call.
    Rejected,
    /// The callee already had a call in progress.
    Busy,
    /// No answer arrived before the answer/media timeout.
    Timeout,
    /// Local capture devices were unavailable or permission was denied.
    MediaUnavailable,
    /// The initial remote description could not be applied.
    NegotiationFailed,
    /// The signaling channel was not open when a send was attempted.
    ChannelUnavailable,
    /// The peer connection dropped while connected.
    ConnectionLost,
}

impl EndReason {
    /// Whether ending for this reason sends `call-ended` to the remote side.
    /// Declines travel as `call-rejected` instead.
    pub fn sends_call_ended(&self) -> bool {
        matches!(
            self,
            Self::LocalHangup | Self::ConnectionLost | Self::NegotiationFailed
        )
    }

    /// Whether the end was a declined or unanswered incoming call.
    pub fn sends_call_rejected(&self) -> bool {
        matches!(self, Self::Declined | Self::Missed)
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LocalHangup => "hung up",
            Self::RemoteHangup => "remote hung up",
            Self::Declined => "declined",
            Self::Missed => "missed",
            Self::Rejected => "rejected",
            Self::Busy => "busy",
            Self::Timeout => "timeout",
            Self::MediaUnavailable => "media unavailable",
            Self::NegotiationFailed => "negotiation failed",
            Self::ChannelUnavailable => "channel unavailable",
            Self::ConnectionLost => "connection lost",
        };
        f.write_str(s)
    }
}

/// Connection state reported by the peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Disconnected, failed or closed.
    pub fn is_down(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Render a duration in seconds as `mm:ss`.
pub fn format_duration(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
