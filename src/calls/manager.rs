//! Call manager: entry point for placing, reporting and routing calls.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use futures_util::future::join_all;
use jinglecore::types::{
    CallDirection, CallId, EndCallReason, InitiationMechanism, MediaKind, SessionId,
};
use jinglecore::{Jid, SessionDescription};
use log::{debug, info, warn};

use super::call::{Call, CallHandle, CallInfo, CallSetup};
use super::context::CallContext;
use super::error::CallError;
use super::session::SignalingSession;
use super::signaling::{InboundSignal, SessionKey, SignalPayload};
use super::traits::{AuthorizationStatus, CallDelegate};

/// Configuration for the call manager.
#[derive(Debug, Clone)]
pub struct CallManagerConfig {
    /// Maximum number of calls that have not ended.
    pub max_concurrent_calls: usize,
    /// Require a remote endpoint advertising call support. When false every
    /// call is placed as if forced.
    pub require_capability: bool,
    /// Use the lightweight invite when every capable endpoint supports it.
    pub lightweight_invite: bool,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
            require_capability: true,
            lightweight_invite: true,
        }
    }
}

/// Options for placing a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOptions {
    pub media: Vec<MediaKind>,
    /// Place the call even if no endpoint advertises call support.
    pub force: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self::audio()
    }
}

impl CallOptions {
    pub fn audio() -> Self {
        Self {
            media: vec![MediaKind::Audio],
            force: false,
        }
    }

    /// Audio and video.
    pub fn video() -> Self {
        Self {
            media: vec![MediaKind::Audio, MediaKind::Video],
            force: false,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Sorted, without duplicates (audio first).
fn normalize_media(mut media: Vec<MediaKind>) -> Vec<MediaKind> {
    media.sort();
    media.dedup();
    media
}

/// Creates calls, checks device permissions and routes inbound signals.
pub struct CallManager {
    ctx: Arc<CallContext>,
    delegate: Option<Arc<dyn CallDelegate>>,
}

impl CallManager {
    pub fn new(ctx: Arc<CallContext>, delegate: Option<Arc<dyn CallDelegate>>) -> Arc<Self> {
        Arc::new(Self { ctx, delegate })
    }

    pub fn context(&self) -> &Arc<CallContext> {
        &self.ctx
    }

    fn check_capacity(&self) -> Result<(), CallError> {
        let max = self.ctx.config.max_concurrent_calls;
        if self.ctx.live_calls().len() >= max {
            return Err(CallError::TooManyCalls(max));
        }
        Ok(())
    }

    fn spawn_call(&self, info: CallInfo, force: bool, incoming: Option<Arc<SignalingSession>>) -> CallHandle {
        let id = info.id.clone();
        let call = Call::spawn(
            CallSetup {
                info,
                force,
                incoming,
                delegate: self.delegate.clone(),
            },
            self.ctx.clone(),
        );
        self.ctx.calls.insert(id, call.clone());
        call
    }

    /// Create an outgoing call in state `new` with a fresh correlation id.
    pub fn create_outgoing(&self, remote: Jid, options: CallOptions) -> Result<CallHandle, CallError> {
        self.check_capacity()?;
        let media = normalize_media(options.media);
        if media.is_empty() {
            return Err(CallError::NegotiationFailed("no media requested".to_string()));
        }

        let info = CallInfo {
            id: CallId::generate(),
            account: self.ctx.account.clone(),
            remote: remote.to_bare(),
            sid: SessionId::generate(),
            direction: CallDirection::Outgoing,
            media,
        };
        info!("New outgoing call {} to {} ({:?})", info.id, info.remote, info.media);
        let force = options.force || !self.ctx.config.require_capability;
        Ok(self.spawn_call(info, force, None))
    }

    /// Report an outgoing call and send its invite(s).
    pub async fn report_outgoing(&self, call: &CallHandle) -> Result<(), CallError> {
        self.report(call).await?;
        call.initiate_outgoing().await
    }

    /// Report an incoming call; it rings until accepted or declined.
    pub async fn report_incoming(&self, call: &CallHandle) -> Result<(), CallError> {
        self.report(call).await
    }

    async fn report(&self, call: &CallHandle) -> Result<(), CallError> {
        call.report().await?;
        if let Err(e) = self.check_permissions(&call.info().media).await {
            warn!("Call {}: {e}", call.id());
            call.reset(EndCallReason::PermissionDenied).await;
            return Err(e);
        }
        call.announce().await
    }

    /// Check every requested kind concurrently. Fails with the full list of
    /// kinds that were not granted.
    pub async fn check_permissions(&self, media: &[MediaKind]) -> Result<(), CallError> {
        let devices = &self.ctx.collaborators.media;
        let checks = media.iter().map(|&kind| async move {
            let granted = match devices.authorization_status(kind) {
                AuthorizationStatus::Authorized => true,
                AuthorizationStatus::NotDetermined => devices.request_access(kind).await,
                AuthorizationStatus::Denied | AuthorizationStatus::Restricted => false,
            };
            (kind, granted)
        });

        let denied: Vec<MediaKind> = join_all(checks)
            .await
            .into_iter()
            .filter(|(_, granted)| !granted)
            .map(|(kind, _)| kind)
            .collect();
        if denied.is_empty() {
            Ok(())
        } else {
            Err(CallError::PermissionDenied(denied))
        }
    }

    /// Create, report and initiate an outgoing call.
    pub async fn place_call(&self, remote: Jid, options: CallOptions) -> Result<CallHandle, CallError> {
        let call = self.create_outgoing(remote, options)?;
        self.report_outgoing(&call).await?;
        Ok(call)
    }

    /// Route a signal from the signaling transport.
    ///
    /// Signals for a known session go to that session, looked up by exact
    /// key and then by the sender's bare address. An unknown invite creates
    /// an incoming call; anything else for an unknown session is dropped.
    pub async fn handle_signal(self: &Arc<Self>, signal: InboundSignal) -> Result<(), CallError> {
        let InboundSignal { key, payload } = signal;
        if !key.account.is_same_account_as(&self.ctx.account) {
            debug!("Dropping {} addressed to {}", payload.action(), key.account);
            return Ok(());
        }

        if let Some(session) = self.ctx.find_session(&key) {
            debug!("{} for {}", payload.action(), session.key());
            return session.handle_remote(&key.remote, payload).await;
        }

        match payload {
            SignalPayload::Propose { media } => {
                self.incoming_call(key, InitiationMechanism::Lightweight, media, None)
                    .await
            }
            SignalPayload::Initiate { description } => {
                let media = description.media_kinds();
                self.incoming_call(key, InitiationMechanism::Full, media, Some(description))
                    .await
            }
            other => {
                debug!("Dropping {} for unknown session {}", other.action(), key);
                Ok(())
            }
        }
    }

    async fn incoming_call(
        self: &Arc<Self>,
        key: SessionKey,
        mechanism: InitiationMechanism,
        media: Vec<MediaKind>,
        offer: Option<SessionDescription>,
    ) -> Result<(), CallError> {
        let session = SignalingSession::incoming(
            key.clone(),
            mechanism,
            offer,
            self.ctx.collaborators.signaling.clone(),
        );
        match self.ctx.sessions.entry(key.clone()) {
            Entry::Occupied(_) => {
                debug!("Duplicate invite for {}", key);
                return Ok(());
            }
            Entry::Vacant(entry) => {
                entry.insert(session.clone());
            }
        }

        if self.check_capacity().is_err() {
            info!("Busy, rejecting call from {}", key.remote);
            self.ctx.sessions.remove(&key);
            return session.terminate(EndCallReason::Busy).await;
        }

        let mut media = normalize_media(media);
        if media.is_empty() {
            media.push(MediaKind::Audio);
        }
        let info = CallInfo {
            id: CallId::generate(),
            account: key.account.clone(),
            remote: key.remote.clone(),
            sid: key.sid.clone(),
            direction: CallDirection::Incoming,
            media,
        };
        info!(
            "Incoming {:?} call {} from {} ({:?})",
            mechanism, info.id, info.remote, info.media
        );
        let call = self.spawn_call(info, false, Some(session));

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.report_incoming(&call).await {
                warn!("Incoming call {} not reported: {e}", call.id());
            }
        });
        Ok(())
    }

    pub fn call(&self, id: &CallId) -> Option<CallHandle> {
        self.ctx.calls.get(id).map(|entry| entry.value().clone())
    }

    pub fn active_calls(&self) -> Vec<CallHandle> {
        self.ctx.live_calls()
    }

    pub fn has_active_call(&self) -> bool {
        !self.ctx.live_calls().is_empty()
    }

    /// End every call. Invoked when the application stops.
    pub async fn shutdown(&self) {
        let calls = self.ctx.live_calls();
        info!("Shutting down call manager, ending {} call(s)", calls.len());
        join_all(calls.iter().map(CallHandle::hangup)).await;
        self.ctx.calls.clear();
        self.ctx.sessions.clear();
    }
}

impl std::fmt::Debug for CallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManager")
            .field("ctx", &self.ctx)
            .field("delegate", &self.delegate.is_some())
            .finish()
    }
}
