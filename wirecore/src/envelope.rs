//! Signal envelope codec.
//!
//! Every message on the shared chat channel is a JSON object:
//!
//! ```text
//! { "type": "chat" | "webrtc",
//!   "sender_id": <int>, "receiver_id": <int>,
//!   "message": {...},    // type = chat
//!   "signal": {...} }    // type = webrtc
//! ```
//!
//! Decoding is strict about the parts a call session relies on (sender id,
//! signal tag, candidate descriptor) and lenient about everything else.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::types::call::{MediaKind, ParticipantId};
use crate::types::chat::ChatMessage;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("unknown envelope kind: {0}")]
    UnknownKind(String),

    #[error("unknown signal type: {0}")]
    UnknownSignal(String),

    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
}

/// Envelope discriminator (`type` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Chat,
    Webrtc,
}

impl EnvelopeKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Webrtc => "webrtc",
        }
    }
}

/// Network-path descriptor exchanged during negotiation.
///
/// Mirrors the browser `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// A descriptor needs a candidate line and at least one media-section
    /// locator to be applicable.
    pub fn is_complete(&self) -> bool {
        !self.candidate.trim().is_empty()
            && (self.sdp_mid.is_some() || self.sdp_m_line_index.is_some())
    }
}

/// The `webrtc` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallSignal {
    /// `media_kind` is `None` when the sender omitted `callType` or sent an
    /// unknown value; the receiver applies its configured default.
    Offer {
        sdp: String,
        media_kind: Option<MediaKind>,
    },
    Answer {
        sdp: String,
    },
    Candidate(IceCandidate),
    CallAccepted,
    CallRejected,
    CallBusy,
    CallEnded {
        duration: u64,
    },
}

impl CallSignal {
    /// Short tag used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate(_) => "candidate",
            Self::CallAccepted => "call-accepted",
            Self::CallRejected => "call-rejected",
            Self::CallBusy => "call-busy",
            Self::CallEnded { .. } => "call-ended",
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Offer { sdp, media_kind } => {
                let mut obj = json!({ "type": "offer", "sdp": sdp });
                if let Some(kind) = media_kind {
                    obj["callType"] = Value::from(kind.as_str());
                }
                obj
            }
            Self::Answer { sdp } => json!({ "type": "answer", "sdp": sdp }),
            Self::Candidate(candidate) => json!({ "candidate": candidate }),
            Self::CallAccepted => json!({ "type": "call-accepted" }),
            Self::CallRejected => json!({ "type": "call-rejected" }),
            Self::CallBusy => json!({ "type": "call-busy" }),
            Self::CallEnded { duration } => json!({ "type": "call-ended", "duration": duration }),
        }
    }

    fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let obj = value.as_object().ok_or(DecodeError::NotAnObject)?;

        let Some(tag) = obj.get("type").and_then(Value::as_str) else {
            // Candidates travel untagged.
            return match obj.get("candidate") {
                Some(c) => parse_candidate(c).map(Self::Candidate),
                None => Err(DecodeError::UnknownSignal("<untagged>".into())),
            };
        };

        match tag {
            "offer" => Ok(Self::Offer {
                sdp: required_str(obj, "sdp")?,
                media_kind: obj
                    .get("callType")
                    .and_then(Value::as_str)
                    .and_then(MediaKind::from_call_type),
            }),
            "answer" => Ok(Self::Answer {
                sdp: required_str(obj, "sdp")?,
            }),
            "candidate" => {
                let c = obj
                    .get("candidate")
                    .ok_or(DecodeError::MissingField("candidate"))?;
                parse_candidate(c).map(Self::Candidate)
            }
            "call-accepted" => Ok(Self::CallAccepted),
            "call-rejected" => Ok(Self::CallRejected),
            "call-busy" => Ok(Self::CallBusy),
            "call-ended" => Ok(Self::CallEnded {
                duration: obj.get("duration").map(duration_secs).unwrap_or(0),
            }),
            other => Err(DecodeError::UnknownSignal(other.to_string())),
        }
    }
}

/// Envelope payload, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Chat(ChatMessage),
    Call(CallSignal),
}

/// One discrete message on the shared channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEnvelope {
    pub sender_id: ParticipantId,
    pub receiver_id: Option<ParticipantId>,
    pub payload: Payload,
}

impl SignalEnvelope {
    pub fn call(sender_id: ParticipantId, receiver_id: ParticipantId, signal: CallSignal) -> Self {
        Self {
            sender_id,
            receiver_id: Some(receiver_id),
            payload: Payload::Call(signal),
        }
    }

    pub fn chat(sender_id: ParticipantId, receiver_id: ParticipantId, message: ChatMessage) -> Self {
        Self {
            sender_id,
            receiver_id: Some(receiver_id),
            payload: Payload::Chat(message),
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self.payload {
            Payload::Chat(_) => EnvelopeKind::Chat,
            Payload::Call(_) => EnvelopeKind::Webrtc,
        }
    }

    pub fn signal(&self) -> Option<&CallSignal> {
        match &self.payload {
            Payload::Call(signal) => Some(signal),
            Payload::Chat(_) => None,
        }
    }

    /// Whether a participant with `local_id` should accept this envelope.
    pub fn is_addressed_to(&self, local_id: ParticipantId) -> bool {
        self.receiver_id.is_none_or(|r| r == local_id)
    }
}

/// Encode an envelope to its JSON wire form.
pub fn encode(envelope: &SignalEnvelope) -> Vec<u8> {
    let mut obj = Map::new();
    obj.insert("type".into(), Value::from(envelope.kind().as_str()));
    obj.insert("sender_id".into(), Value::from(envelope.sender_id));
    if let Some(receiver_id) = envelope.receiver_id {
        obj.insert("receiver_id".into(), Value::from(receiver_id));
    }
    match &envelope.payload {
        Payload::Chat(message) => {
            // ChatMessage only holds plain data; serialization cannot fail.
            let message = serde_json::to_value(message).unwrap_or(Value::Null);
            obj.insert("message".into(), message);
        }
        Payload::Call(signal) => {
            obj.insert("signal".into(), signal.to_value());
        }
    }
    Value::Object(obj).to_string().into_bytes()
}

/// Decode an envelope from its JSON wire form.
pub fn decode(bytes: &[u8]) -> Result<SignalEnvelope, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let obj = value.as_object().ok_or(DecodeError::NotAnObject)?;

    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingField("type"))?;
    let receiver_id = obj.get("receiver_id").and_then(Value::as_i64);

    match kind {
        "chat" => {
            let raw = obj.get("message").ok_or(DecodeError::MissingField("message"))?;
            let message: ChatMessage = serde_json::from_value(raw.clone())?;
            // The relay strips sender_id from chat frames; the saved message
            // still names its sender.
            let sender_id = obj
                .get("sender_id")
                .and_then(Value::as_i64)
                .or_else(|| message.sender_id())
                .ok_or(DecodeError::MissingField("sender_id"))?;
            Ok(SignalEnvelope {
                sender_id,
                receiver_id,
                payload: Payload::Chat(message),
            })
        }
        "webrtc" => {
            let sender_id = obj
                .get("sender_id")
                .and_then(Value::as_i64)
                .ok_or(DecodeError::MissingField("sender_id"))?;
            let signal = obj.get("signal").ok_or(DecodeError::MissingField("signal"))?;
            Ok(SignalEnvelope {
                sender_id,
                receiver_id,
                payload: Payload::Call(CallSignal::from_value(signal)?),
            })
        }
        other => Err(DecodeError::UnknownKind(other.to_string())),
    }
}

fn required_str(obj: &Map<String, Value>, field: &'static str) -> Result<String, DecodeError> {
    obj.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(DecodeError::MissingField(field))
}

fn parse_candidate(value: &Value) -> Result<IceCandidate, DecodeError> {
    let candidate: IceCandidate = serde_json::from_value(value.clone())
        .map_err(|e| DecodeError::InvalidCandidate(e.to_string()))?;
    if !candidate.is_complete() {
        return Err(DecodeError::InvalidCandidate(
            "descriptor needs a candidate line and sdpMid or sdpMLineIndex".into(),
        ));
    }
    Ok(candidate)
}

/// Durations are whole seconds; tolerate fractional or negative senders.
fn duration_secs(value: &Value) -> u64 {
    value
        .as_u64()
        .or_else(|| value.as_f64().map(|f| f.max(0.0).round() as u64))
        .unwrap_or(0)
}
