//! One negotiation attempt with one remote endpoint.

use std::sync::{Arc, Mutex, PoisonError};

use jinglecore::types::{EndCallReason, InitiationMechanism, MediaKind, SessionRole};
use jinglecore::{Candidate, Jid, SessionDescription};
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};

use super::error::CallError;
use super::signaling::{DescriptionKind, RemoteDescription, SessionKey, SignalPayload};
use super::state::{SessionState, SessionTransition};
use super::traits::SignalingTransport;

/// Signaling session with a single remote endpoint.
///
/// A session only tracks its own negotiation. Cross-session decisions
/// (which of several sessions wins) belong to the owning call, which observes
/// the session through [`subscribe_state`](Self::subscribe_state),
/// [`subscribe_remote_description`](Self::subscribe_remote_description) and
/// [`take_remote_candidates`](Self::take_remote_candidates).
pub struct SignalingSession {
    key: SessionKey,
    role: SessionRole,
    mechanism: InitiationMechanism,
    /// Where outbound signals go. Starts as `key.remote` and is pinned to the
    /// answering full address when a lightweight invite is accepted.
    peer: Mutex<Jid>,
    state: watch::Sender<SessionState>,
    remote_description: watch::Sender<Option<RemoteDescription>>,
    candidates_tx: mpsc::UnboundedSender<Candidate>,
    candidates_rx: Mutex<Option<mpsc::UnboundedReceiver<Candidate>>>,
    transport: Arc<dyn SignalingTransport>,
}

impl SignalingSession {
    fn new(
        key: SessionKey,
        role: SessionRole,
        mechanism: InitiationMechanism,
        transport: Arc<dyn SignalingTransport>,
    ) -> Self {
        let (candidates_tx, candidates_rx) = mpsc::unbounded_channel();
        Self {
            peer: Mutex::new(key.remote.clone()),
            key,
            role,
            mechanism,
            state: watch::Sender::new(SessionState::Pending),
            remote_description: watch::Sender::new(None),
            candidates_tx,
            candidates_rx: Mutex::new(Some(candidates_rx)),
            transport,
        }
    }

    /// Session we open towards `key.remote`.
    pub fn outgoing(
        key: SessionKey,
        mechanism: InitiationMechanism,
        transport: Arc<dyn SignalingTransport>,
    ) -> Arc<Self> {
        Arc::new(Self::new(key, SessionRole::Initiator, mechanism, transport))
    }

    /// Session opened by the remote. A full invite carries its offer, which
    /// becomes the first remote description.
    pub fn incoming(
        key: SessionKey,
        mechanism: InitiationMechanism,
        offer: Option<SessionDescription>,
        transport: Arc<dyn SignalingTransport>,
    ) -> Arc<Self> {
        let session = Self::new(key, SessionRole::Responder, mechanism, transport);
        if let Some(offer) = offer {
            session.set_remote_description(offer, DescriptionKind::Offer);
        }
        Arc::new(session)
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn mechanism(&self) -> InitiationMechanism {
        self.mechanism
    }

    pub fn peer(&self) -> Jid {
        self.peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn remote_description(&self) -> Option<RemoteDescription> {
        self.remote_description.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn subscribe_remote_description(&self) -> watch::Receiver<Option<RemoteDescription>> {
        self.remote_description.subscribe()
    }

    /// Remote candidates, buffered from session creation on. Only the first
    /// caller gets the receiver.
    pub fn take_remote_candidates(&self) -> Option<mpsc::UnboundedReceiver<Candidate>> {
        self.candidates_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Key addressed to the current peer.
    fn addressed_key(&self) -> SessionKey {
        self.key.with_remote(self.peer())
    }

    fn transition(&self, transition: SessionTransition) -> Result<(), CallError> {
        let mut rejected = None;
        self.state
            .send_if_modified(|current| match current.apply(transition) {
                Ok(next) => {
                    debug!("Session {}: {} -> {}", self.key, current.name(), next.name());
                    *current = next;
                    true
                }
                Err(e) => {
                    rejected = Some(e);
                    false
                }
            });
        match rejected {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn set_remote_description(&self, description: SessionDescription, kind: DescriptionKind) {
        self.remote_description.send_modify(|current| {
            let revision = current.as_ref().map_or(1, |r| r.revision + 1);
            *current = Some(RemoteDescription {
                description,
                kind,
                revision,
            });
        });
    }

    /// Send a lightweight invite for `media`.
    pub async fn propose(&self, media: &[MediaKind]) -> Result<(), CallError> {
        if self.mechanism != InitiationMechanism::Lightweight || self.role != SessionRole::Initiator {
            return Err(CallError::NegotiationFailed(
                "propose requires an outgoing lightweight session".to_string(),
            ));
        }
        self.transition(SessionTransition::Initiate)?;
        info!("Proposing {:?} call on {}", media, self.key);
        self.transport
            .send_propose(&self.key, media)
            .await
            .map_err(CallError::Signaling)
    }

    /// Send the offer.
    ///
    /// A full session moves to `Initiated`. A lightweight session sends its
    /// offer once the invite was accepted and stays `Accepted`.
    pub async fn initiate(&self, description: &SessionDescription) -> Result<(), CallError> {
        match self.mechanism {
            InitiationMechanism::Full => self.transition(SessionTransition::Initiate)?,
            InitiationMechanism::Lightweight if self.state().is_accepted() => {}
            InitiationMechanism::Lightweight => {
                return Err(CallError::NegotiationFailed(format!(
                    "cannot send offer on {} session {}",
                    self.state().name(),
                    self.key
                )));
            }
        }
        self.transport
            .send_initiate(&self.addressed_key(), description)
            .await
            .map_err(CallError::Signaling)
    }

    /// Accept the remote invite, or answer a remote offer on an accepted
    /// session.
    ///
    /// A lightweight invite is accepted without a description; the answer
    /// follows once the caller's offer arrived.
    pub async fn accept(&self, description: Option<&SessionDescription>) -> Result<(), CallError> {
        let key = self.addressed_key();
        if self.state().is_accepted() {
            let Some(description) = description else {
                return Ok(());
            };
            return self
                .transport
                .send_accept(&key, description)
                .await
                .map_err(CallError::Signaling);
        }

        match (self.mechanism, description) {
            (InitiationMechanism::Lightweight, _) => {
                self.transition(SessionTransition::Accept)?;
                self.transport.send_proceed(&key).await.map_err(CallError::Signaling)
            }
            (InitiationMechanism::Full, Some(description)) => {
                self.transition(SessionTransition::Accept)?;
                self.transport
                    .send_accept(&key, description)
                    .await
                    .map_err(CallError::Signaling)
            }
            (InitiationMechanism::Full, None) => Err(CallError::NegotiationFailed(
                "accepting a full invite requires an answer".to_string(),
            )),
        }
    }

    /// Refuse the invite. Declining a session that already ended is a no-op.
    pub async fn decline(&self) -> Result<(), CallError> {
        if self.state().is_finished() {
            debug!("Session {} already finished, ignoring decline", self.key);
            return Ok(());
        }
        self.transition(SessionTransition::Decline)?;
        self.transition(SessionTransition::Terminate {
            reason: EndCallReason::Declined,
        })?;

        let key = self.addressed_key();
        let sent = match self.mechanism {
            InitiationMechanism::Full => self.transport.send_decline(&key).await,
            InitiationMechanism::Lightweight => self.transport.send_reject(&key).await,
        };
        sent.map_err(CallError::Signaling)
    }

    /// End the session and tell the remote, if it knows about it.
    ///
    /// Terminating an already terminated session is a no-op.
    pub async fn terminate(&self, reason: EndCallReason) -> Result<(), CallError> {
        let previous = self.state();
        if previous.is_terminated() {
            return Ok(());
        }
        self.transition(SessionTransition::Terminate { reason })?;
        if !reason.notifies_remote() {
            debug!("Session {} ended locally ({:?})", self.key, reason);
            return Ok(());
        }

        let key = self.addressed_key();
        let sent = match (previous, self.mechanism, self.role) {
            (SessionState::Declined, _, _) => return Ok(()),
            (SessionState::Pending, _, SessionRole::Initiator) => return Ok(()),
            (SessionState::Initiated, InitiationMechanism::Lightweight, _) => {
                self.transport.send_retract(&key).await
            }
            (SessionState::Pending, InitiationMechanism::Lightweight, SessionRole::Responder) => {
                self.transport.send_reject(&key).await
            }
            _ => self.transport.send_terminate(&key, reason.jingle_reason()).await,
        };
        info!("Terminated session {} ({:?})", self.key, reason);
        sent.map_err(CallError::Signaling)
    }

    pub async fn send_local_candidate(&self, candidate: &Candidate) -> Result<(), CallError> {
        if self.state().is_finished() {
            return Err(CallError::CallEnded);
        }
        self.transport
            .send_candidate(&self.addressed_key(), candidate)
            .await
            .map_err(CallError::Signaling)
    }

    /// Apply a signal received from `from`.
    ///
    /// Once a lightweight invite was answered, signals from any other
    /// resource of the remote account are ignored.
    pub async fn handle_remote(&self, from: &Jid, payload: SignalPayload) -> Result<(), CallError> {
        if matches!(payload, SignalPayload::Proceed) {
            return self.remote_proceed(from).await;
        }
        let peer = self.peer();
        if !peer.is_bare() && from != &peer {
            debug!(
                "Ignoring {} from {} on {}, answered by {}",
                payload.action(),
                from,
                self.key,
                peer
            );
            return Ok(());
        }

        match payload {
            SignalPayload::Propose { .. } => {
                debug!("Duplicate invite for {}", self.key);
                Ok(())
            }
            SignalPayload::Proceed => Ok(()),
            SignalPayload::Reject => {
                self.transition(SessionTransition::Decline)?;
                self.transition(SessionTransition::Terminate {
                    reason: EndCallReason::Declined,
                })
            }
            SignalPayload::Retract => self.transition(SessionTransition::Terminate {
                reason: EndCallReason::Cancelled,
            }),
            SignalPayload::Initiate { description } => {
                // Only an accepted lightweight invite expects the caller's offer.
                let expected = self.mechanism == InitiationMechanism::Lightweight
                    && self.role == SessionRole::Responder
                    && self.state().is_accepted()
                    && self.remote_description().is_none();
                if !expected {
                    warn!("Unexpected offer on {} session {}", self.state().name(), self.key);
                    return Ok(());
                }
                self.set_remote_description(description, DescriptionKind::Offer);
                Ok(())
            }
            SignalPayload::Accept { description } => {
                self.set_remote_description(description, DescriptionKind::Answer);
                if self.state().is_accepted() {
                    return Ok(());
                }
                self.transition(SessionTransition::Accept)
            }
            SignalPayload::Terminate { reason } => {
                if self.state().is_terminated() {
                    return Ok(());
                }
                let reason = match (self.state(), EndCallReason::from_remote_jingle_reason(&reason)) {
                    (SessionState::Pending | SessionState::Initiated, EndCallReason::RemoteEnded) => {
                        EndCallReason::Cancelled
                    }
                    (_, reason) => reason,
                };
                self.transition(SessionTransition::Terminate { reason })
            }
            SignalPayload::Candidate { candidate } => {
                if self.candidates_tx.send(candidate).is_err() {
                    debug!("Candidate for {} dropped, receiver closed", self.key);
                }
                Ok(())
            }
            SignalPayload::DescriptionUpdate { description, kind } => {
                if !self.state().is_accepted() {
                    warn!("Description update on unaccepted session {}", self.key);
                    return Ok(());
                }
                self.set_remote_description(description, kind);
                Ok(())
            }
        }
    }

    /// The lightweight invite was accepted by `from`. The first device to
    /// proceed wins; a later one gets the invite retracted.
    async fn remote_proceed(&self, from: &Jid) -> Result<(), CallError> {
        let state = self.state();
        let expected = self.mechanism == InitiationMechanism::Lightweight
            && self.role == SessionRole::Initiator
            && state == SessionState::Initiated;
        if !expected {
            let peer = self.peer();
            if state.is_accepted() && from != &peer {
                info!("{} proceeded after {} answered {}, retracting", from, peer, self.key);
                return self
                    .transport
                    .send_retract(&self.key.with_remote(from.clone()))
                    .await
                    .map_err(CallError::Signaling);
            }
            debug!("Ignoring proceed on {} session {}", state.name(), self.key);
            return Ok(());
        }

        let previous = std::mem::replace(
            &mut *self.peer.lock().unwrap_or_else(PoisonError::into_inner),
            from.clone(),
        );
        if let Err(e) = self.transition(SessionTransition::Accept) {
            *self.peer.lock().unwrap_or_else(PoisonError::into_inner) = previous;
            return Err(e);
        }
        info!("Invite {} accepted by {}", self.key, from);
        Ok(())
    }
}

impl std::fmt::Debug for SignalingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingSession")
            .field("key", &self.key)
            .field("role", &self.role)
            .field("mechanism", &self.mechanism)
            .field("state", &self.state())
            .finish()
    }
}
