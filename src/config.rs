use serde::{Deserialize, Serialize};
use std::time::Duration;
use wirecore::MediaKind;

pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Timers and defaults for call sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// How long an incoming call rings before it counts as missed.
    pub ring_timeout: Duration,
    /// How long the caller waits for `call-accepted`.
    pub answer_timeout: Duration,
    /// How long media may take to connect once the callee accepted.
    pub media_timeout: Duration,
    /// Period of the duration ticker.
    pub tick_interval: Duration,
    pub ice_servers: Vec<String>,
    /// Applied to offers without a usable `callType`.
    pub default_media_kind: MediaKind,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
            answer_timeout: Duration::from_secs(30),
            media_timeout: Duration::from_secs(60),
            tick_interval: Duration::from_secs(1),
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            default_media_kind: MediaKind::Video,
        }
    }
}

/// Where the chat backend lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub http_base: String,
    pub ws_base: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_base: "http://localhost:8000".to_string(),
            ws_base: "ws://localhost:8000".to_string(),
        }
    }
}
