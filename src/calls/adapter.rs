//! Boundary between the peer transport and the call.
//!
//! The media engine reports transport events through [`ConnectionEventSink`];
//! the sink installed by a call turns them into [`ConnectionEvent`]s on the
//! call's command queue. Outbound, [`ConnectionAdapter`] wraps the engine's
//! [`PeerConnection`] with the call's error types.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use jinglecore::types::RelayServer;
use jinglecore::{Candidate, Jid, SessionDescription};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use super::call::CallCommand;
use super::error::CallError;
use super::traits::{Collaborators, IceServer, LocalMedia, MediaTrack, PeerConnection, PeerConnectionConfig};

/// ICE agent connection state as reported by the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Transport callbacks, one method per event kind.
pub trait ConnectionEventSink: Send + Sync {
    fn connectivity_changed(&self, state: IceConnectionState);
    fn local_candidate(&self, candidate: Candidate);
    fn remote_track(&self, track: MediaTrack);
}

/// Call-level meaning of a transport event.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    ConnectivityLost,
    LocalCandidate(Candidate),
    RemoteTrack(MediaTrack),
}

impl ConnectionEvent {
    /// `None` for intermediate states that need no reaction.
    pub fn from_ice_state(state: IceConnectionState) -> Option<Self> {
        match state {
            IceConnectionState::Connected | IceConnectionState::Completed => Some(Self::Connected),
            IceConnectionState::Disconnected
            | IceConnectionState::Failed
            | IceConnectionState::Closed => Some(Self::ConnectivityLost),
            IceConnectionState::New | IceConnectionState::Checking => None,
        }
    }
}

/// Sink that queues events onto a call. Events arriving after the call
/// finished are dropped.
pub(crate) struct CallEventSink {
    commands: mpsc::UnboundedSender<CallCommand>,
}

impl CallEventSink {
    pub(crate) fn new(commands: mpsc::UnboundedSender<CallCommand>) -> Arc<Self> {
        Arc::new(Self { commands })
    }

    fn forward(&self, event: ConnectionEvent) {
        if self.commands.send(CallCommand::Connection(event)).is_err() {
            debug!("Dropping transport event, call already finished");
        }
    }
}

impl ConnectionEventSink for CallEventSink {
    fn connectivity_changed(&self, state: IceConnectionState) {
        debug!("ICE connection state: {:?}", state);
        if let Some(event) = ConnectionEvent::from_ice_state(state) {
            self.forward(event);
        }
    }

    fn local_candidate(&self, candidate: Candidate) {
        self.forward(ConnectionEvent::LocalCandidate(candidate));
    }

    fn remote_track(&self, track: MediaTrack) {
        self.forward(ConnectionEvent::RemoteTrack(track));
    }
}

/// Usable relays as ICE servers.
pub fn ice_servers(relays: &[RelayServer]) -> Vec<IceServer> {
    relays
        .iter()
        .filter(|relay| relay.is_usable())
        .map(IceServer::from)
        .collect()
}

/// Peer transport of one call.
pub struct ConnectionAdapter {
    connection: Arc<dyn PeerConnection>,
    closed: AtomicBool,
}

impl ConnectionAdapter {
    /// Fetch relays and create the transport. A failing relay lookup leaves
    /// the connection without relays.
    pub async fn open(
        collaborators: &Collaborators,
        account: &Jid,
        events: Arc<dyn ConnectionEventSink>,
    ) -> Result<Self, CallError> {
        let relays = match collaborators.relays.relay_servers(account).await {
            Ok(relays) => relays,
            Err(e) => {
                warn!("Relay discovery failed, continuing without relays: {e}");
                Vec::new()
            }
        };
        let config = PeerConnectionConfig {
            ice_servers: ice_servers(&relays),
        };
        debug!("Creating peer connection with {} ICE servers", config.ice_servers.len());

        let connection = collaborators
            .connections
            .create(config, events)
            .await
            .map_err(CallError::Transport)?;
        Ok(Self {
            connection,
            closed: AtomicBool::new(false),
        })
    }

    pub async fn add_local_media(&self, media: &LocalMedia) -> Result<(), CallError> {
        for track in &media.tracks {
            self.connection.add_track(track).await.map_err(CallError::Media)?;
        }
        Ok(())
    }

    /// Create an offer and install it as the local description.
    pub async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let offer = self
            .connection
            .create_offer()
            .await
            .map_err(|e| CallError::NegotiationFailed(format!("create offer: {e}")))?;
        self.set_local(&offer).await?;
        Ok(offer)
    }

    /// Create an answer to the applied remote offer and install it.
    pub async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let answer = self
            .connection
            .create_answer()
            .await
            .map_err(|e| CallError::NegotiationFailed(format!("create answer: {e}")))?;
        self.set_local(&answer).await?;
        Ok(answer)
    }

    async fn set_local(&self, description: &SessionDescription) -> Result<(), CallError> {
        self.connection
            .set_local_description(description)
            .await
            .map_err(|e| CallError::NegotiationFailed(format!("set local description: {e}")))
    }

    pub async fn apply_remote(&self, description: &SessionDescription) -> Result<(), CallError> {
        self.connection
            .set_remote_description(description)
            .await
            .map_err(|e| CallError::NegotiationFailed(format!("set remote description: {e}")))
    }

    pub async fn add_remote_candidate(&self, candidate: &Candidate) -> Result<(), CallError> {
        self.connection
            .add_remote_candidate(candidate)
            .await
            .map_err(CallError::Transport)
    }

    /// Close the transport. Later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing peer connection");
        self.connection.close().await;
    }
}
