//! External collaborators consumed by the call layer.
//!
//! The XMPP stack, the media engine and the presentation layer live outside
//! this crate. Each is reached through one of the traits below; all of them
//! are object-safe so a [`Collaborators`] bundle can hold them as
//! `Arc<dyn ...>`.

use std::sync::Arc;

use async_trait::async_trait;
use jinglecore::features::EndpointCapabilities;
use jinglecore::types::{CallId, MediaKind, RelayServer};
use jinglecore::{Candidate, Jid, SessionDescription};

use super::adapter::ConnectionEventSink;
use super::signaling::SessionKey;
use super::state::CallState;

/// Authorization of one media kind on the local device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Authorized,
    Denied,
    Restricted,
    NotDetermined,
}

/// Capability discovery (disco#info over every available resource).
#[async_trait]
pub trait CapabilityDiscovery: Send + Sync {
    /// Feature sets of every currently available endpoint of `party`.
    async fn endpoints(&self, account: &Jid, party: &Jid) -> anyhow::Result<Vec<EndpointCapabilities>>;
}

/// STUN/TURN server discovery.
#[async_trait]
pub trait RelayDiscovery: Send + Sync {
    async fn relay_servers(&self, account: &Jid) -> anyhow::Result<Vec<RelayServer>>;
}

/// Camera and microphone access.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    fn authorization_status(&self, kind: MediaKind) -> AuthorizationStatus;

    /// Prompt for access; resolves to whether access was granted.
    async fn request_access(&self, kind: MediaKind) -> bool;

    /// Start capturing the given kinds.
    async fn open_capture(&self, media: &[MediaKind]) -> anyhow::Result<LocalMedia>;
}

/// A running capture source.
pub trait CaptureDevice: Send + Sync {
    fn set_track_enabled(&self, kind: MediaKind, enabled: bool);

    /// Stop capturing and release the device.
    fn stop(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// Local capture handle plus the tracks it produces.
pub struct LocalMedia {
    pub capture: Arc<dyn CaptureDevice>,
    pub tracks: Vec<MediaTrack>,
}

impl LocalMedia {
    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind == MediaKind::Video)
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("tracks", &self.tracks)
            .finish_non_exhaustive()
    }
}

/// Outbound signaling. Every send is fire-and-forget: resolving means the
/// stanza was handed to the transport, not that the remote acknowledged it.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Lightweight invite, addressed to the bare remote.
    async fn send_propose(&self, key: &SessionKey, media: &[MediaKind]) -> anyhow::Result<()>;
    async fn send_retract(&self, key: &SessionKey) -> anyhow::Result<()>;
    async fn send_proceed(&self, key: &SessionKey) -> anyhow::Result<()>;
    async fn send_reject(&self, key: &SessionKey) -> anyhow::Result<()>;

    async fn send_initiate(&self, key: &SessionKey, description: &SessionDescription) -> anyhow::Result<()>;
    async fn send_accept(&self, key: &SessionKey, description: &SessionDescription) -> anyhow::Result<()>;
    async fn send_decline(&self, key: &SessionKey) -> anyhow::Result<()>;
    /// `reason` is the Jingle reason element name.
    async fn send_terminate(&self, key: &SessionKey, reason: &str) -> anyhow::Result<()>;
    async fn send_candidate(&self, key: &SessionKey, candidate: &Candidate) -> anyhow::Result<()>;
}

/// ICE server list handed to the media engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerConnectionConfig {
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl From<&RelayServer> for IceServer {
    fn from(relay: &RelayServer) -> Self {
        Self {
            url: relay.url(),
            username: relay.username.clone(),
            password: relay.password.clone(),
        }
    }
}

/// Creates peer transports bound to an event sink.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: PeerConnectionConfig,
        events: Arc<dyn ConnectionEventSink>,
    ) -> anyhow::Result<Arc<dyn PeerConnection>>;
}

/// The media engine's peer transport (ICE agent, DTLS, RTP).
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &MediaTrack) -> anyhow::Result<()>;
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_local_description(&self, description: &SessionDescription) -> anyhow::Result<()>;
    async fn set_remote_description(&self, description: &SessionDescription) -> anyhow::Result<()>;
    async fn add_remote_candidate(&self, candidate: &Candidate) -> anyhow::Result<()>;
    async fn close(&self);
}

/// Presentation observer of one call.
pub trait CallDelegate: Send + Sync {
    fn call_started(&self, call_id: &CallId);
    fn call_state_changed(&self, call_id: &CallId, state: &CallState);
    /// Invoked exactly once per call.
    fn call_ended(&self, call_id: &CallId, state: &CallState);
    fn local_video_track_ready(&self, call_id: &CallId, track: &MediaTrack);
    fn remote_video_track_ready(&self, call_id: &CallId, track: &MediaTrack);
}

/// Every external dependency of the call layer.
#[derive(Clone)]
pub struct Collaborators {
    pub capabilities: Arc<dyn CapabilityDiscovery>,
    pub relays: Arc<dyn RelayDiscovery>,
    pub media: Arc<dyn MediaDevices>,
    pub signaling: Arc<dyn SignalingTransport>,
    pub connections: Arc<dyn PeerConnectionFactory>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
