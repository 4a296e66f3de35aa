//! The call: lifecycle orchestration for one 1:1 call.
//!
//! Each call runs as an actor task that owns every piece of mutable call
//! state: the establishing and winning signaling sessions, local media, the
//! peer transport and the candidate queues. Everything that touches that
//! state arrives as a [`CallCommand`] on the call's queue, including the
//! completion of asynchronous lookups and events re-queued from session
//! observers and from the transport. [`CallHandle`] is the cloneable
//! front-end.
//!
//! # Outgoing calls
//!
//! Capability discovery picks one of two strategies:
//!
//! - every capable endpoint supports the lightweight invite: a single
//!   `propose` to the bare address; media, transport and the offer are
//!   prepared after the callee proceeds;
//! - otherwise the offer is generated first and one full session is opened
//!   per capable endpoint (fan-out). The first session to be accepted wins
//!   and every other one is terminated in the same step.
//!
//! # Teardown
//!
//! [`reset`](Call::reset) is the single exit path. It runs at most once per
//! call and the actor stops right after it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures_util::future::join_all;
use jinglecore::features::EndpointCapabilities;
use jinglecore::types::{
    CallDirection, CallId, EndCallReason, InitiationMechanism, MediaKind, SessionId,
};
use jinglecore::{Candidate, Jid};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::adapter::{CallEventSink, ConnectionAdapter, ConnectionEvent};
use super::context::CallContext;
use super::error::CallError;
use super::session::SignalingSession;
use super::signaling::{DescriptionKind, RemoteDescription, SessionKey};
use super::state::{CallState, CallTransition, SessionState};
use super::traits::{CallDelegate, LocalMedia};

type Reply = oneshot::Sender<Result<(), CallError>>;

/// Identity of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallInfo {
    /// Local correlation id.
    pub id: CallId,
    pub account: Jid,
    /// Remote party. Bare for outgoing calls, the calling endpoint for
    /// incoming ones.
    pub remote: Jid,
    pub sid: SessionId,
    pub direction: CallDirection,
    pub media: Vec<MediaKind>,
}

/// Published view of a call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallSnapshot {
    pub state: CallState,
    /// Key of the winning session, once assigned.
    pub winner: Option<SessionKey>,
}

pub(crate) enum CallCommand {
    Report {
        reply: Reply,
    },
    Announce {
        reply: Reply,
    },
    InitiateOutgoing {
        reply: Reply,
    },
    EndpointsDiscovered(anyhow::Result<Vec<EndpointCapabilities>>),
    Accept {
        reply: Reply,
    },
    Decline {
        reply: Reply,
    },
    Hangup {
        reply: oneshot::Sender<()>,
    },
    Reset {
        reason: EndCallReason,
        reply: oneshot::Sender<()>,
    },
    SetMuted {
        kind: MediaKind,
        muted: bool,
        reply: Reply,
    },
    SessionStateChanged {
        key: SessionKey,
        state: SessionState,
    },
    RemoteDescription {
        key: SessionKey,
        description: RemoteDescription,
    },
    RemoteCandidate {
        key: SessionKey,
        candidate: Candidate,
    },
    Connection(ConnectionEvent),
}

pub(crate) struct CallSetup {
    pub info: CallInfo,
    /// Skip the capability requirement.
    pub force: bool,
    /// The remote's session, for incoming calls.
    pub incoming: Option<Arc<SignalingSession>>,
    pub delegate: Option<Arc<dyn CallDelegate>>,
}

/// Cloneable front-end of a running call.
#[derive(Clone)]
pub struct CallHandle {
    info: Arc<CallInfo>,
    commands: mpsc::UnboundedSender<CallCommand>,
    snapshot: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    pub fn id(&self) -> &CallId {
        &self.info.id
    }

    pub fn info(&self) -> &CallInfo {
        &self.info
    }

    pub fn state(&self) -> CallState {
        self.snapshot.borrow().state.clone()
    }

    pub fn winner(&self) -> Option<SessionKey> {
        self.snapshot.borrow().winner.clone()
    }

    pub fn is_ended(&self) -> bool {
        self.snapshot.borrow().state.is_ended()
    }

    /// Observe state and winner changes. The receiver starts with the
    /// current snapshot.
    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Resolves with the final state once the call ended.
    pub async fn ended(&self) -> CallState {
        let mut snapshot = self.snapshot.clone();
        let result = snapshot
            .wait_for(|s| s.state.is_ended())
            .await
            .map(|s| s.state.clone());
        result.unwrap_or_else(|_| snapshot.borrow().state.clone())
    }

    async fn request(&self, command: impl FnOnce(Reply) -> CallCommand) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| CallError::CallEnded)?;
        rx.await.map_err(|_| CallError::CallEnded)?
    }

    pub(crate) async fn report(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Report { reply }).await
    }

    /// Hand the reported call to the presentation layer.
    pub(crate) async fn announce(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Announce { reply }).await
    }

    /// Discover endpoints and send the invite(s). Resolves once the invites
    /// are out, not when the call is answered.
    pub(crate) async fn initiate_outgoing(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::InitiateOutgoing { reply })
            .await
    }

    /// Accept an incoming call.
    pub async fn accept(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Accept { reply }).await
    }

    /// Refuse an incoming call.
    pub async fn decline(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Decline { reply }).await
    }

    /// End the call from the local side, whatever its state.
    pub async fn hangup(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(CallCommand::Hangup { reply }).is_ok() {
            let _ = done.await;
        }
    }

    /// Tear the call down with `reason`. Safe to call repeatedly.
    pub async fn reset(&self, reason: EndCallReason) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(CallCommand::Reset { reason, reply }).is_ok() {
            let _ = done.await;
        }
    }

    /// Mute audio, or turn video off, on a connected call.
    pub async fn set_muted(&self, kind: MediaKind, muted: bool) -> Result<(), CallError> {
        self.request(|reply| CallCommand::SetMuted { kind, muted, reply })
            .await
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("info", &self.info)
            .field("state", &self.state().name())
            .finish()
    }
}

/// Actor state of one call.
pub(crate) struct Call {
    info: Arc<CallInfo>,
    ctx: Arc<CallContext>,
    commands: mpsc::UnboundedSender<CallCommand>,
    snapshot: watch::Sender<CallSnapshot>,
    delegate: Option<Arc<dyn CallDelegate>>,
    force: bool,

    establishing: Vec<Arc<SignalingSession>>,
    winner: Option<Arc<SignalingSession>>,
    forwarders: HashMap<SessionKey, Vec<JoinHandle<()>>>,
    discovery: Option<JoinHandle<()>>,
    pending_initiate: Option<Reply>,
    finished_sessions: usize,
    declined_sessions: usize,

    media: Option<LocalMedia>,
    connection: Option<ConnectionAdapter>,
    /// The winner (or every fan-out session) has our description.
    local_description_sent: bool,
    /// Revision of the last remote description applied to the transport.
    applied_revision: u64,
    pending_local_candidates: VecDeque<Candidate>,
    pending_remote_candidates: VecDeque<Candidate>,
}

impl Call {
    pub(crate) fn spawn(setup: CallSetup, ctx: Arc<CallContext>) -> CallHandle {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (snapshot, snapshot_rx) = watch::channel(CallSnapshot::default());
        let info = Arc::new(setup.info);

        let mut call = Call {
            info: info.clone(),
            ctx,
            commands: commands.clone(),
            snapshot,
            delegate: setup.delegate,
            force: setup.force,
            establishing: Vec::new(),
            winner: None,
            forwarders: HashMap::new(),
            discovery: None,
            pending_initiate: None,
            finished_sessions: 0,
            declined_sessions: 0,
            media: None,
            connection: None,
            local_description_sent: false,
            applied_revision: 0,
            pending_local_candidates: VecDeque::new(),
            pending_remote_candidates: VecDeque::new(),
        };
        if let Some(session) = setup.incoming {
            call.track_session(session);
        }
        tokio::spawn(call.run(commands_rx));

        CallHandle {
            info,
            commands,
            snapshot: snapshot_rx,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<CallCommand>) {
        debug!("Call {} started ({:?})", self.info.id, self.info.direction);
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
            if self.is_ended() {
                break;
            }
        }
        debug!("Call {} stopped", self.info.id);
    }

    async fn handle(&mut self, command: CallCommand) {
        match command {
            CallCommand::Report { reply } => {
                let _ = reply.send(self.report());
            }
            CallCommand::Announce { reply } => {
                let _ = reply.send(self.announce());
            }
            CallCommand::InitiateOutgoing { reply } => self.initiate_outgoing(reply),
            CallCommand::EndpointsDiscovered(result) => self.endpoints_discovered(result).await,
            CallCommand::Accept { reply } => {
                let result = self.accept().await;
                let _ = reply.send(result);
            }
            CallCommand::Decline { reply } => {
                let result = self.decline().await;
                let _ = reply.send(result);
            }
            CallCommand::Hangup { reply } => {
                self.cancel_pending_initiate();
                self.hangup().await;
                let _ = reply.send(());
            }
            CallCommand::Reset { reason, reply } => {
                self.cancel_pending_initiate();
                self.reset(reason).await;
                let _ = reply.send(());
            }
            CallCommand::SetMuted { kind, muted, reply } => {
                let _ = reply.send(self.set_muted(kind, muted));
            }
            CallCommand::SessionStateChanged { key, state } => {
                self.session_state_changed(key, state).await
            }
            CallCommand::RemoteDescription { key, description } => {
                self.remote_description(key, description).await
            }
            CallCommand::RemoteCandidate { key, candidate } => {
                self.remote_candidate(key, candidate).await
            }
            CallCommand::Connection(event) => self.connection_event(event).await,
        }
    }

    fn state(&self) -> CallState {
        self.snapshot.borrow().state.clone()
    }

    fn is_ended(&self) -> bool {
        self.snapshot.borrow().state.is_ended()
    }

    fn is_winner(&self, key: &SessionKey) -> bool {
        self.winner.as_ref().is_some_and(|w| w.key() == key)
    }

    fn change_state(&mut self, transition: CallTransition) -> Result<(), CallError> {
        let current = self.state();
        let next = current.apply(transition)?;
        info!("Call {}: {} -> {}", self.info.id, current.name(), next.name());
        self.snapshot.send_modify(|s| s.state = next.clone());
        if let Some(delegate) = &self.delegate {
            delegate.call_state_changed(&self.info.id, &next);
        }
        Ok(())
    }

    fn report(&mut self) -> Result<(), CallError> {
        self.change_state(CallTransition::Reported)
    }

    fn announce(&mut self) -> Result<(), CallError> {
        if self.is_ended() {
            return Err(CallError::CallEnded);
        }
        if let Some(delegate) = &self.delegate {
            delegate.call_started(&self.info.id);
        }
        Ok(())
    }

    // Session bookkeeping

    fn track_session(&mut self, session: Arc<SignalingSession>) {
        let key = session.key().clone();
        self.ctx.register_session(session.clone());
        let forwarder = forward_session_state(&session, self.commands.clone());
        self.forwarders.entry(key).or_default().push(forwarder);
        self.establishing.push(session);
    }

    /// Stop observing a session and drop it from the registry. Nothing is
    /// sent to the remote.
    fn forget_session(&mut self, key: &SessionKey) -> Option<Arc<SignalingSession>> {
        if let Some(handles) = self.forwarders.remove(key) {
            handles.iter().for_each(JoinHandle::abort);
        }
        self.ctx.sessions.remove(key);
        let index = self.establishing.iter().position(|s| s.key() == key)?;
        Some(self.establishing.remove(index))
    }

    fn promote(&mut self, session: Arc<SignalingSession>) {
        let key = session.key().clone();
        self.establishing.retain(|s| s.key() != &key);

        let mut handles = vec![forward_remote_descriptions(&session, self.commands.clone())];
        if let Some(candidates) = session.take_remote_candidates() {
            handles.push(forward_remote_candidates(
                key.clone(),
                candidates,
                self.commands.clone(),
            ));
        }
        self.forwarders.entry(key.clone()).or_default().extend(handles);

        self.winner = Some(session);
        self.snapshot.send_modify(|s| s.winner = Some(key));
    }

    // Outgoing

    fn initiate_outgoing(&mut self, reply: Reply) {
        let ready = self.info.direction == CallDirection::Outgoing
            && self.state().is_ringing()
            && self.pending_initiate.is_none()
            && self.establishing.is_empty()
            && self.winner.is_none();
        if !ready {
            let _ = reply.send(Err(CallError::NegotiationFailed(format!(
                "call {} cannot be initiated while {}",
                self.info.id,
                self.state().name()
            ))));
            return;
        }
        self.pending_initiate = Some(reply);

        let capabilities = self.ctx.collaborators.capabilities.clone();
        let account = self.info.account.clone();
        let party = self.info.remote.to_bare();
        let commands = self.commands.clone();
        self.discovery = Some(tokio::spawn(async move {
            let result = capabilities.endpoints(&account, &party).await;
            let _ = commands.send(CallCommand::EndpointsDiscovered(result));
        }));
    }

    /// A local hangup or reset answers a waiting initiate with `CallEnded`
    /// rather than an error blaming the remote.
    fn cancel_pending_initiate(&mut self) {
        if let Some(reply) = self.pending_initiate.take() {
            let _ = reply.send(Err(CallError::CallEnded));
        }
    }

    async fn endpoints_discovered(&mut self, result: anyhow::Result<Vec<EndpointCapabilities>>) {
        self.discovery = None;
        let Some(reply) = self.pending_initiate.take() else {
            debug!("Late capability result for call {}", self.info.id);
            return;
        };
        let outcome = self.start_negotiation(result).await;
        if let Err(e) = &outcome {
            self.fail(e).await;
        }
        let _ = reply.send(outcome);
    }

    async fn start_negotiation(
        &mut self,
        result: anyhow::Result<Vec<EndpointCapabilities>>,
    ) -> Result<(), CallError> {
        let endpoints = match result {
            Ok(endpoints) => endpoints,
            Err(e) if self.force => {
                warn!("Capability discovery failed, forcing call anyway: {e}");
                Vec::new()
            }
            Err(e) => return Err(CallError::Discovery(e)),
        };

        let capable: Vec<EndpointCapabilities> = endpoints
            .into_iter()
            .filter(|e| e.supports_calls() && e.supports_media(&self.info.media))
            .collect();
        if capable.is_empty() && !self.force {
            info!("No endpoint of {} supports calls", self.info.remote);
            return Err(CallError::NoCapableEndpoint);
        }

        let lightweight = self.ctx.config.lightweight_invite
            && capable.iter().all(EndpointCapabilities::supports_lightweight_invite);
        if lightweight {
            return self.send_lightweight_invite().await;
        }

        let targets = if capable.is_empty() {
            vec![self.info.remote.to_bare()]
        } else {
            capable.into_iter().map(|e| e.jid).collect()
        };
        self.fan_out(targets).await
    }

    fn session_key(&self, remote: Jid) -> SessionKey {
        SessionKey::new(self.info.account.clone(), remote, self.info.sid.clone())
    }

    async fn send_lightweight_invite(&mut self) -> Result<(), CallError> {
        let key = self.session_key(self.info.remote.to_bare());
        let session = SignalingSession::outgoing(
            key,
            InitiationMechanism::Lightweight,
            self.ctx.collaborators.signaling.clone(),
        );
        self.track_session(session.clone());
        session.propose(&self.info.media).await
    }

    async fn fan_out(&mut self, targets: Vec<Jid>) -> Result<(), CallError> {
        self.open_media().await?;
        self.open_connection().await?;
        let offer = self.connection()?.create_offer().await?;

        let sessions: Vec<_> = targets
            .into_iter()
            .map(|target| {
                SignalingSession::outgoing(
                    self.session_key(target),
                    InitiationMechanism::Full,
                    self.ctx.collaborators.signaling.clone(),
                )
            })
            .collect();
        for session in &sessions {
            self.track_session(session.clone());
        }

        let results = join_all(sessions.iter().map(|s| s.initiate(&offer))).await;
        for (session, result) in sessions.iter().zip(results) {
            if let Err(e) = result {
                warn!("Invite to {} failed: {e}", session.key().remote);
                self.forget_session(session.key());
            }
        }
        if self.establishing.is_empty() {
            return Err(CallError::NegotiationFailed(
                "no invite could be delivered".to_string(),
            ));
        }

        self.local_description_sent = true;
        info!(
            "Call {} offered to {} endpoint(s)",
            self.info.id,
            self.establishing.len()
        );
        Ok(())
    }

    /// Promote `session` and terminate every other establishing session.
    async fn converge(&mut self, session: Arc<SignalingSession>) {
        let losers: Vec<_> = self
            .establishing
            .iter()
            .filter(|s| s.key() != session.key())
            .cloned()
            .collect();
        for loser in &losers {
            self.forget_session(loser.key());
        }
        self.promote(session.clone());
        info!(
            "Call {} answered by {}, cancelling {} other session(s)",
            self.info.id,
            session.peer(),
            losers.len()
        );

        let results = join_all(losers.iter().map(|s| s.terminate(EndCallReason::Cancelled))).await;
        for (loser, result) in losers.iter().zip(results) {
            if let Err(e) = result {
                warn!("Failed to cancel session {}: {e}", loser.key());
            }
        }

        if session.mechanism() == InitiationMechanism::Lightweight
            && let Err(e) = self.send_offer(&session).await
        {
            self.fail(&e).await;
            return;
        }
        self.flush_local_candidates().await;
        if let Err(e) = self.change_state(CallTransition::NegotiationStarted) {
            warn!("Call {}: {e}", self.info.id);
        }
    }

    /// Offer for an accepted lightweight invite.
    async fn send_offer(&mut self, session: &SignalingSession) -> Result<(), CallError> {
        self.open_media().await?;
        self.open_connection().await?;
        let offer = self.connection()?.create_offer().await?;
        session.initiate(&offer).await?;
        self.local_description_sent = true;
        Ok(())
    }

    // Incoming

    async fn accept(&mut self) -> Result<(), CallError> {
        if self.info.direction != CallDirection::Incoming {
            return Err(CallError::NegotiationFailed(
                "only incoming calls can be accepted".to_string(),
            ));
        }
        if !self.state().is_ringing() || self.winner.is_some() {
            return Err(CallError::NegotiationFailed(format!(
                "cannot accept a {} call",
                self.state().name()
            )));
        }
        let Some(session) = self.establishing.first().cloned() else {
            return Err(CallError::CallEnded);
        };

        if let Err(e) = self.open_media().await {
            error!("Cannot open local media for call {}: {e}", self.info.id);
            self.reset(EndCallReason::NegotiationFailed).await;
            return Err(e);
        }
        if let Err(e) = self.open_connection().await {
            warn!("No peer connection for call {}, rejecting: {e}", self.info.id);
            if let Err(e) = session.decline().await {
                warn!("Failed to reject call {}: {e}", self.info.id);
            }
            self.reset(EndCallReason::Declined).await;
            return Err(e);
        }

        self.promote(session.clone());
        self.change_state(CallTransition::NegotiationStarted)?;

        let result = match session.mechanism() {
            InitiationMechanism::Lightweight => session.accept(None).await,
            InitiationMechanism::Full => match session.remote_description() {
                Some(offer) => self.apply_remote_description(&session, offer).await,
                None => Err(CallError::NegotiationFailed(
                    "invite carried no offer".to_string(),
                )),
            },
        };
        if let Err(e) = result {
            self.fail(&e).await;
            return Err(e);
        }
        Ok(())
    }

    async fn decline(&mut self) -> Result<(), CallError> {
        if self.info.direction != CallDirection::Incoming || self.winner.is_some() {
            return Err(CallError::NegotiationFailed(
                "only unanswered incoming calls can be declined".to_string(),
            ));
        }
        let result = match self.establishing.first().cloned() {
            Some(session) => session.decline().await,
            None => Ok(()),
        };
        self.reset(EndCallReason::Declined).await;
        result
    }

    async fn hangup(&mut self) {
        let state = self.state();
        if state.is_ended() {
            return;
        }
        if self.info.direction == CallDirection::Incoming && self.winner.is_none() {
            if let Err(e) = self.decline().await {
                warn!("Failed to decline call {}: {e}", self.info.id);
            }
            return;
        }
        let reason = if state.is_connected() {
            EndCallReason::Success
        } else {
            EndCallReason::Cancelled
        };
        self.reset(reason).await;
    }

    fn set_muted(&mut self, kind: MediaKind, muted: bool) -> Result<(), CallError> {
        if !self.info.media.contains(&kind) {
            return Err(CallError::Media(anyhow::anyhow!("call has no {kind} track")));
        }
        let Some(capture) = self.media.as_ref().map(|m| m.capture.clone()) else {
            return Err(CallError::Media(anyhow::anyhow!("no local capture")));
        };
        let transition = match kind {
            MediaKind::Audio => CallTransition::AudioMuteChanged { muted },
            MediaKind::Video => CallTransition::VideoStateChanged { off: muted },
        };
        self.change_state(transition)?;
        capture.set_track_enabled(kind, !muted);
        Ok(())
    }

    // Resources

    async fn open_media(&mut self) -> Result<(), CallError> {
        if self.media.is_some() {
            return Ok(());
        }
        let media = self
            .ctx
            .collaborators
            .media
            .open_capture(&self.info.media)
            .await
            .map_err(CallError::Media)?;
        if let (Some(track), Some(delegate)) = (media.video_track(), &self.delegate) {
            delegate.local_video_track_ready(&self.info.id, track);
        }
        self.media = Some(media);
        Ok(())
    }

    async fn open_connection(&mut self) -> Result<(), CallError> {
        if self.connection.is_some() {
            return Ok(());
        }
        let sink = CallEventSink::new(self.commands.clone());
        let connection =
            ConnectionAdapter::open(&self.ctx.collaborators, &self.info.account, sink).await?;
        let connection = self.connection.insert(connection);
        if let Some(media) = &self.media {
            connection.add_local_media(media).await?;
        }
        Ok(())
    }

    fn connection(&self) -> Result<&ConnectionAdapter, CallError> {
        self.connection
            .as_ref()
            .ok_or_else(|| CallError::NegotiationFailed("no peer connection".to_string()))
    }

    // Description and candidate exchange

    async fn apply_remote_description(
        &mut self,
        session: &SignalingSession,
        remote: RemoteDescription,
    ) -> Result<(), CallError> {
        if remote.revision <= self.applied_revision {
            debug!(
                "Ignoring remote description revision {} (applied {})",
                remote.revision, self.applied_revision
            );
            return Ok(());
        }
        self.connection()?.apply_remote(&remote.description).await?;
        self.applied_revision = remote.revision;
        debug!(
            "Applied remote {:?} revision {} on call {}",
            remote.kind, remote.revision, self.info.id
        );

        if remote.kind == DescriptionKind::Offer {
            let answer = self.connection()?.create_answer().await?;
            session.accept(Some(&answer)).await?;
            self.local_description_sent = true;
        }
        self.flush_remote_candidates().await;
        self.flush_local_candidates().await;
        Ok(())
    }

    async fn remote_description(&mut self, key: SessionKey, description: RemoteDescription) {
        let Some(session) = self.winner.clone().filter(|w| w.key() == &key) else {
            return;
        };
        if self.connection.is_none() {
            debug!("Remote description for call {} before transport", self.info.id);
            return;
        }
        if let Err(e) = self.apply_remote_description(&session, description).await {
            self.fail(&e).await;
        }
    }

    async fn remote_candidate(&mut self, key: SessionKey, candidate: Candidate) {
        if !self.is_winner(&key) {
            return;
        }
        self.pending_remote_candidates.push_back(candidate);
        self.flush_remote_candidates().await;
    }

    /// Remote candidates wait for a transport with a remote description.
    async fn flush_remote_candidates(&mut self) {
        let Some(connection) = &self.connection else {
            return;
        };
        if self.applied_revision == 0 {
            return;
        }
        while let Some(candidate) = self.pending_remote_candidates.pop_front() {
            if let Err(e) = connection.add_remote_candidate(&candidate).await {
                warn!("Remote candidate rejected: {e}");
            }
        }
    }

    /// Local candidates wait for a winner that has our description, then go
    /// out in generation order.
    async fn flush_local_candidates(&mut self) {
        let Some(winner) = self.winner.clone() else {
            return;
        };
        if !self.local_description_sent {
            return;
        }
        while let Some(candidate) = self.pending_local_candidates.pop_front() {
            if let Err(e) = winner.send_local_candidate(&candidate).await {
                warn!("Failed to send candidate on {}: {e}", winner.key());
            }
        }
    }

    // Observed events

    async fn session_state_changed(&mut self, key: SessionKey, state: SessionState) {
        if self.is_winner(&key) {
            if let SessionState::Terminated { reason } = state {
                info!("Session {} ended by remote ({:?})", key, reason);
                self.reset(reason).await;
            }
            return;
        }
        let Some(session) = self.establishing.iter().find(|s| s.key() == &key).cloned() else {
            return;
        };
        match state {
            SessionState::Accepted if self.info.direction == CallDirection::Outgoing => {
                if self.winner.is_none() {
                    self.converge(session).await;
                }
            }
            SessionState::Terminated { reason } => self.session_finished(&key, reason).await,
            _ => {}
        }
    }

    async fn session_finished(&mut self, key: &SessionKey, reason: EndCallReason) {
        self.forget_session(key);
        self.finished_sessions += 1;
        if reason == EndCallReason::Declined {
            self.declined_sessions += 1;
        }
        debug!(
            "Session {} ended ({:?}), {} still establishing",
            key,
            reason,
            self.establishing.len()
        );
        if !self.establishing.is_empty() || self.winner.is_some() {
            return;
        }

        let reason = match self.info.direction {
            CallDirection::Incoming => reason,
            CallDirection::Outgoing if self.declined_sessions == self.finished_sessions => {
                EndCallReason::Declined
            }
            CallDirection::Outgoing => EndCallReason::NoAnswer,
        };
        self.reset(reason).await;
    }

    async fn connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                if self.state().is_connecting() {
                    let video = self.info.media.contains(&MediaKind::Video);
                    if let Err(e) =
                        self.change_state(CallTransition::ConnectivityEstablished { video })
                    {
                        warn!("Call {}: {e}", self.info.id);
                    }
                }
            }
            ConnectionEvent::ConnectivityLost => {
                let state = self.state();
                if state.is_connecting() || state.is_connected() {
                    warn!("Call {} lost connectivity", self.info.id);
                    self.reset(EndCallReason::ConnectivityLost).await;
                }
            }
            ConnectionEvent::LocalCandidate(candidate) => {
                self.pending_local_candidates.push_back(candidate);
                self.flush_local_candidates().await;
            }
            ConnectionEvent::RemoteTrack(track) => {
                if track.kind == MediaKind::Video
                    && let Some(delegate) = &self.delegate
                {
                    delegate.remote_video_track_ready(&self.info.id, &track);
                }
            }
        }
    }

    // Teardown

    async fn fail(&mut self, error: &CallError) {
        warn!("Call {} failed: {error}", self.info.id);
        self.reset(error.end_reason()).await;
    }

    /// Release everything the call holds and end it. Runs once; later calls
    /// return immediately.
    async fn reset(&mut self, reason: EndCallReason) {
        if self.is_ended() {
            return;
        }
        info!("Ending call {} ({:?})", self.info.id, reason);

        for handle in self.forwarders.drain().flat_map(|(_, handles)| handles) {
            handle.abort();
        }
        if let Some(discovery) = self.discovery.take() {
            discovery.abort();
        }

        if let Some(media) = self.media.take() {
            media.capture.stop();
        }
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
        self.pending_local_candidates.clear();
        self.pending_remote_candidates.clear();

        let sessions: Vec<_> = self
            .winner
            .iter()
            .cloned()
            .chain(self.establishing.drain(..))
            .collect();
        let results = join_all(sessions.iter().map(|s| s.terminate(reason))).await;
        for (session, result) in sessions.iter().zip(results) {
            self.ctx.sessions.remove(session.key());
            if let Err(e) = result {
                warn!("Failed to terminate session {}: {e}", session.key());
            }
        }

        if let Some(reply) = self.pending_initiate.take() {
            let _ = reply.send(Err(CallError::from_end_reason(reason)));
        }
        if let Err(e) = self.change_state(CallTransition::Ended { reason }) {
            error!("Call {}: {e}", self.info.id);
        }
        if let Some(delegate) = self.delegate.take() {
            delegate.call_ended(&self.info.id, &self.state());
        }
        self.ctx.calls.remove(&self.info.id);
    }
}

fn forward_session_state(
    session: &SignalingSession,
    commands: mpsc::UnboundedSender<CallCommand>,
) -> JoinHandle<()> {
    let key = session.key().clone();
    let mut states = session.subscribe_state();
    tokio::spawn(async move {
        loop {
            let state = states.borrow_and_update().clone();
            let command = CallCommand::SessionStateChanged {
                key: key.clone(),
                state,
            };
            if commands.send(command).is_err() || states.changed().await.is_err() {
                break;
            }
        }
    })
}

fn forward_remote_descriptions(
    session: &SignalingSession,
    commands: mpsc::UnboundedSender<CallCommand>,
) -> JoinHandle<()> {
    let key = session.key().clone();
    let mut descriptions = session.subscribe_remote_description();
    tokio::spawn(async move {
        loop {
            let current = descriptions.borrow_and_update().clone();
            if let Some(description) = current {
                let command = CallCommand::RemoteDescription {
                    key: key.clone(),
                    description,
                };
                if commands.send(command).is_err() {
                    break;
                }
            }
            if descriptions.changed().await.is_err() {
                break;
            }
        }
    })
}

fn forward_remote_candidates(
    key: SessionKey,
    mut candidates: mpsc::UnboundedReceiver<Candidate>,
    commands: mpsc::UnboundedSender<CallCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(candidate) = candidates.recv().await {
            let command = CallCommand::RemoteCandidate {
                key: key.clone(),
                candidate,
            };
            if commands.send(command).is_err() {
                break;
            }
        }
    })
}
