//! PeerLink adapter.
//!
//! The peer link is the opaque media/ICE capability. A session talks to it
//! through [`PeerLinkAdapter`], which pairs the link with the local media it
//! carries and releases both exactly once.

use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use wirecore::{ConnectionState, IceCandidate, MediaKind};

use crate::error::CallError;

#[derive(Debug, Error)]
pub enum PeerLinkError {
    #[error("media unavailable: {0}")]
    Media(String),

    #[error("{0}")]
    Negotiation(String),
}

impl From<PeerLinkError> for CallError {
    fn from(err: PeerLinkError) -> Self {
        match err {
            PeerLinkError::Media(msg) => Self::MediaAcquisition(msg),
            PeerLinkError::Negotiation(msg) => Self::Negotiation(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A capture track, e.g. one camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Local capture tracks acquired for one call.
pub trait LocalMedia: Send + Sync {
    fn tracks(&self) -> Vec<MediaTrack>;

    fn set_enabled(&self, kind: TrackKind, enabled: bool);

    /// Stop every track. Called once, on teardown.
    fn stop(&self);
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, kind: MediaKind) -> Result<Arc<dyn LocalMedia>, PeerLinkError>;
}

/// Notifications from a peer link, in the order the link produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerLinkEvent {
    CandidateGenerated(IceCandidate),
    ConnectionStateChanged(ConnectionState),
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<String, PeerLinkError>;

    /// Answer the remote description applied last.
    async fn create_answer(&self) -> Result<String, PeerLinkError>;

    async fn set_local_description(&self, sdp: &str) -> Result<(), PeerLinkError>;

    async fn set_remote_description(&self, sdp: &str) -> Result<(), PeerLinkError>;

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerLinkError>;

    async fn replace_outbound_video_track(&self, track: MediaTrack) -> Result<(), PeerLinkError>;

    async fn close(&self);
}

/// Creates peer links with the local media attached.
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[String],
        media: Arc<dyn LocalMedia>,
    ) -> Result<(Arc<dyn PeerLink>, mpsc::Receiver<PeerLinkEvent>), PeerLinkError>;
}

pub struct PeerLinkAdapter {
    link: Arc<dyn PeerLink>,
    media: Arc<dyn LocalMedia>,
    released: AtomicBool,
}

impl PeerLinkAdapter {
    pub fn new(link: Arc<dyn PeerLink>, media: Arc<dyn LocalMedia>) -> Self {
        Self {
            link,
            media,
            released: AtomicBool::new(false),
        }
    }

    /// Create an offer and install it locally.
    pub async fn offer(&self) -> Result<String, CallError> {
        let sdp = self.link.create_offer().await?;
        self.link.set_local_description(&sdp).await?;
        Ok(sdp)
    }

    /// Create an answer to the applied remote offer and install it locally.
    pub async fn answer(&self) -> Result<String, CallError> {
        let sdp = self.link.create_answer().await?;
        self.link.set_local_description(&sdp).await?;
        Ok(sdp)
    }

    pub async fn apply_remote_description(&self, sdp: &str) -> Result<(), CallError> {
        Ok(self.link.set_remote_description(sdp).await?)
    }

    pub async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError> {
        Ok(self.link.add_candidate(candidate).await?)
    }

    /// Swap the outbound camera. Never touches call state.
    pub async fn switch_camera(&self, track: MediaTrack) -> Result<(), CallError> {
        Ok(self.link.replace_outbound_video_track(track).await?)
    }

    /// Local tracks carried by the link.
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.media.tracks()
    }

    pub fn set_track_enabled(&self, kind: TrackKind, enabled: bool) {
        self.media.set_enabled(kind, enabled);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Stop local media and close the link. Only the first call does work.
    pub async fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.media.stop();
        self.link.close().await;
        debug!(target: "Call/Session", "Peer link released");
        true
    }
}

/// Stand-in for hosts without a media stack. Every acquisition fails, so
/// calls can be signalled and declined but never connected.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMediaBackend;

#[async_trait]
impl MediaDevices for NoMediaBackend {
    async fn acquire(&self, kind: MediaKind) -> Result<Arc<dyn LocalMedia>, PeerLinkError> {
        Err(PeerLinkError::Media(format!("no {kind} capture available")))
    }
}

#[async_trait]
impl PeerLinkFactory for NoMediaBackend {
    async fn create(
        &self,
        _ice_servers: &[String],
        _media: Arc<dyn LocalMedia>,
    ) -> Result<(Arc<dyn PeerLink>, mpsc::Receiver<PeerLinkEvent>), PeerLinkError> {
        Err(PeerLinkError::Negotiation("no peer link backend".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockMedia, MockPeerLinkFactory};

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let factory = MockPeerLinkFactory::new();
        let media = Arc::new(MockMedia::new(MediaKind::Video));
        let (link, _events) = factory.create(&[], media.clone()).await.unwrap();
        let adapter = PeerLinkAdapter::new(link, media.clone());

        assert!(adapter.release().await);
        assert!(!adapter.release().await);
        assert!(adapter.is_released());
        assert_eq!(media.stop_count(), 1);
        assert_eq!(factory.link(0).unwrap().close_count(), 1);
    }

    #[tokio::test]
    async fn test_offer_installs_local_description() {
        let factory = MockPeerLinkFactory::new();
        let media = Arc::new(MockMedia::new(MediaKind::Audio));
        let (link, _events) = factory.create(&[], media.clone()).await.unwrap();
        let adapter = PeerLinkAdapter::new(link, media);

        let sdp = adapter.offer().await.unwrap();
        let log = factory.link(0).unwrap().calls();
        assert_eq!(log, vec!["create_offer".to_string(), format!("set_local:{sdp}")]);
    }

    #[tokio::test]
    async fn test_media_controls_reach_tracks() {
        let factory = MockPeerLinkFactory::new();
        let media = Arc::new(MockMedia::new(MediaKind::Video));
        let (link, _events) = factory.create(&[], media.clone()).await.unwrap();
        let adapter = PeerLinkAdapter::new(link, media.clone());

        let ids: Vec<String> = adapter.tracks().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, ["mic", "camera-front"]);

        adapter.set_track_enabled(TrackKind::Audio, false);
        assert_eq!(media.is_enabled(TrackKind::Audio), Some(false));
        assert_eq!(media.is_enabled(TrackKind::Video), Some(true));

        let back = MediaTrack {
            id: "camera-back".into(),
            kind: TrackKind::Video,
        };
        adapter.switch_camera(back).await.unwrap();
        assert!(
            factory
                .link(0)
                .unwrap()
                .calls()
                .contains(&"replace_video:camera-back".to_string())
        );
    }

    #[tokio::test]
    async fn test_no_media_backend_refuses() {
        let err = NoMediaBackend.acquire(MediaKind::Audio).await.err().unwrap();
        assert!(matches!(CallError::from(err), CallError::MediaAcquisition(_)));
    }
}
