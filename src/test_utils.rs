use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jinglecore::features::{
    EndpointCapabilities, NS_JINGLE, NS_JINGLE_ICE_UDP, NS_JINGLE_MESSAGE, NS_JINGLE_RTP,
};
use jinglecore::sdp::{MediaContent, Origin};
use jinglecore::types::{CallId, MediaKind, RelayServer, SessionId};
use jinglecore::{Candidate, CandidateType, Jid, SessionDescription};
use tokio::sync::Notify;

use crate::calls::traits::{
    AuthorizationStatus, CallDelegate, CapabilityDiscovery, CaptureDevice, Collaborators,
    LocalMedia, MediaDevices, MediaTrack, PeerConnection, PeerConnectionConfig,
    PeerConnectionFactory, RelayDiscovery, SignalingTransport,
};
use crate::calls::{
    CallContext, CallHandle, CallManager, CallManagerConfig, CallSnapshot, CallState,
    ConnectionEventSink, SessionKey,
};

pub const ACCOUNT: &str = "romeo@montague.lit/orchard";
pub const SID: &str = "a73sjjvkla37jfea";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn jid(s: &str) -> Jid {
    s.parse().expect("test JID should parse")
}

pub fn session_key(remote: &str) -> SessionKey {
    SessionKey::new(jid(ACCOUNT), jid(remote), SessionId::new(SID))
}

pub fn description_with(media: &[MediaKind]) -> SessionDescription {
    let contents = media
        .iter()
        .enumerate()
        .map(|(index, kind)| MediaContent::new(*kind, index.to_string()))
        .collect();
    SessionDescription::new(Origin::new("4611731400430051336", 2), contents)
}

pub fn sample_description() -> SessionDescription {
    description_with(&[MediaKind::Audio])
}

pub fn sample_candidate(port: u16) -> Candidate {
    Candidate::new("1", 1, 2_122_260_223, "192.0.2.10", port, CandidateType::Host)
        .with_sdp_mid("0")
        .with_sdp_m_line_index(0)
}

/// Endpoint advertising call support, optionally with the lightweight invite.
pub fn capable_endpoint(full_jid: &str, lightweight: bool) -> EndpointCapabilities {
    let mut features = vec![NS_JINGLE, NS_JINGLE_RTP, NS_JINGLE_ICE_UDP];
    if lightweight {
        features.push(NS_JINGLE_MESSAGE);
    }
    EndpointCapabilities::new(jid(full_jid), features)
}

/// Wait (bounded) until the call's snapshot satisfies `pred`.
pub async fn wait_for(call: &CallHandle, pred: impl FnMut(&CallSnapshot) -> bool) -> CallSnapshot {
    let mut rx = call.subscribe();
    let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("timed out waiting for call state")
        .expect("call snapshot channel closed")
        .clone();
    snapshot
}

pub async fn wait_for_state(call: &CallHandle, name: &str) -> CallSnapshot {
    wait_for(call, |s| s.state.name() == name).await
}

/// Yield to other tasks until `cond` holds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub async fn ended_state(call: &CallHandle) -> CallState {
    tokio::time::timeout(Duration::from_secs(5), call.ended())
        .await
        .expect("timed out waiting for the call to end")
}

/// Outbound signal as recorded by [`RecordingSignaling`].
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Propose { key: SessionKey, media: Vec<MediaKind> },
    Retract { key: SessionKey },
    Proceed { key: SessionKey },
    Reject { key: SessionKey },
    Initiate { key: SessionKey },
    Accept { key: SessionKey },
    Decline { key: SessionKey },
    Terminate { key: SessionKey, reason: String },
    Candidate { key: SessionKey, candidate: Candidate },
}

#[derive(Default)]
pub struct RecordingSignaling {
    sent: Mutex<Vec<Sent>>,
    unreachable: Mutex<HashSet<Jid>>,
}

impl RecordingSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Sent) -> bool) -> usize {
        self.sent.lock().unwrap().iter().filter(|s| pred(s)).count()
    }

    /// Make every send to `remote` fail.
    pub fn make_unreachable(&self, remote: &str) {
        self.unreachable.lock().unwrap().insert(jid(remote));
    }

    fn record(&self, key: &SessionKey, sent: Sent) -> anyhow::Result<()> {
        if self.unreachable.lock().unwrap().contains(&key.remote) {
            anyhow::bail!("{} is unreachable", key.remote);
        }
        self.sent.lock().unwrap().push(sent);
        Ok(())
    }
}

#[async_trait]
impl SignalingTransport for RecordingSignaling {
    async fn send_propose(&self, key: &SessionKey, media: &[MediaKind]) -> anyhow::Result<()> {
        self.record(key, Sent::Propose {
            key: key.clone(),
            media: media.to_vec(),
        })
    }

    async fn send_retract(&self, key: &SessionKey) -> anyhow::Result<()> {
        self.record(key, Sent::Retract { key: key.clone() })
    }

    async fn send_proceed(&self, key: &SessionKey) -> anyhow::Result<()> {
        self.record(key, Sent::Proceed { key: key.clone() })
    }

    async fn send_reject(&self, key: &SessionKey) -> anyhow::Result<()> {
        self.record(key, Sent::Reject { key: key.clone() })
    }

    async fn send_initiate(&self, key: &SessionKey, _description: &SessionDescription) -> anyhow::Result<()> {
        self.record(key, Sent::Initiate { key: key.clone() })
    }

    async fn send_accept(&self, key: &SessionKey, _description: &SessionDescription) -> anyhow::Result<()> {
        self.record(key, Sent::Accept { key: key.clone() })
    }

    async fn send_decline(&self, key: &SessionKey) -> anyhow::Result<()> {
        self.record(key, Sent::Decline { key: key.clone() })
    }

    async fn send_terminate(&self, key: &SessionKey, reason: &str) -> anyhow::Result<()> {
        self.record(key, Sent::Terminate {
            key: key.clone(),
            reason: reason.to_string(),
        })
    }

    async fn send_candidate(&self, key: &SessionKey, candidate: &Candidate) -> anyhow::Result<()> {
        self.record(key, Sent::Candidate {
            key: key.clone(),
            candidate: candidate.clone(),
        })
    }
}

#[derive(Default)]
pub struct MockCapabilities {
    endpoints: Mutex<Vec<EndpointCapabilities>>,
    failing: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
    lookups: AtomicUsize,
}

impl MockCapabilities {
    /// Hold every lookup until the returned gate is notified.
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Lookups started so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn set(&self, endpoints: Vec<EndpointCapabilities>) {
        *self.endpoints.lock().unwrap() = endpoints;
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CapabilityDiscovery for MockCapabilities {
    async fn endpoints(&self, _account: &Jid, _party: &Jid) -> anyhow::Result<Vec<EndpointCapabilities>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("disco#info timed out");
        }
        Ok(self.endpoints.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct MockRelays {
    relays: Mutex<Vec<RelayServer>>,
    failing: AtomicBool,
}

impl MockRelays {
    pub fn set(&self, relays: Vec<RelayServer>) {
        *self.relays.lock().unwrap() = relays;
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RelayDiscovery for MockRelays {
    async fn relay_servers(&self, _account: &Jid) -> anyhow::Result<Vec<RelayServer>> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("external service discovery unavailable");
        }
        Ok(self.relays.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct MockCapture {
    stops: AtomicUsize,
    toggles: Mutex<Vec<(MediaKind, bool)>>,
}

impl MockCapture {
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn toggles(&self) -> Vec<(MediaKind, bool)> {
        self.toggles.lock().unwrap().clone()
    }
}

impl CaptureDevice for MockCapture {
    fn set_track_enabled(&self, kind: MediaKind, enabled: bool) {
        self.toggles.lock().unwrap().push((kind, enabled));
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Media devices with per-kind authorization. Kinds without an explicit
/// status are authorized.
#[derive(Default)]
pub struct MockMediaDevices {
    statuses: Mutex<HashMap<MediaKind, AuthorizationStatus>>,
    grant_on_request: AtomicBool,
    capture_fails: AtomicBool,
    checked: Mutex<Vec<MediaKind>>,
    capture: Arc<MockCapture>,
    opened: AtomicUsize,
}

impl MockMediaDevices {
    pub fn set_status(&self, kind: MediaKind, status: AuthorizationStatus) {
        self.statuses.lock().unwrap().insert(kind, status);
    }

    pub fn grant_on_request(&self, grant: bool) {
        self.grant_on_request.store(grant, Ordering::SeqCst);
    }

    pub fn fail_capture(&self) {
        self.capture_fails.store(true, Ordering::SeqCst);
    }

    /// Kinds whose authorization was checked, in check order.
    pub fn checked(&self) -> Vec<MediaKind> {
        self.checked.lock().unwrap().clone()
    }

    pub fn capture(&self) -> Arc<MockCapture> {
        self.capture.clone()
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for MockMediaDevices {
    fn authorization_status(&self, kind: MediaKind) -> AuthorizationStatus {
        self.checked.lock().unwrap().push(kind);
        self.statuses
            .lock()
            .unwrap()
            .get(&kind)
            .copied()
            .unwrap_or(AuthorizationStatus::Authorized)
    }

    async fn request_access(&self, _kind: MediaKind) -> bool {
        tokio::task::yield_now().await;
        self.grant_on_request.load(Ordering::SeqCst)
    }

    async fn open_capture(&self, media: &[MediaKind]) -> anyhow::Result<LocalMedia> {
        if self.capture_fails.load(Ordering::SeqCst) {
            anyhow::bail!("camera in use by another application");
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(LocalMedia {
            capture: self.capture.clone(),
            tracks: media
                .iter()
                .map(|kind| MediaTrack {
                    id: format!("local-{kind}"),
                    kind: *kind,
                })
                .collect(),
        })
    }
}

#[derive(Default)]
pub struct MockPeerConnection {
    closes: AtomicUsize,
    tracks: Mutex<Vec<MediaTrack>>,
    remote_descriptions: AtomicUsize,
    remote_candidates: Mutex<Vec<Candidate>>,
    offers: AtomicUsize,
    answers: AtomicUsize,
}

impl MockPeerConnection {
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.lock().unwrap().clone()
    }

    pub fn remote_description_count(&self) -> usize {
        self.remote_descriptions.load(Ordering::SeqCst)
    }

    pub fn remote_candidates(&self) -> Vec<Candidate> {
        self.remote_candidates.lock().unwrap().clone()
    }

    pub fn offer_count(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn answer_count(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn add_track(&self, track: &MediaTrack) -> anyhow::Result<()> {
        self.tracks.lock().unwrap().push(track.clone());
        Ok(())
    }

    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(sample_description())
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        self.answers.fetch_add(1, Ordering::SeqCst);
        Ok(sample_description())
    }

    async fn set_local_description(&self, _description: &SessionDescription) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_remote_description(&self, _description: &SessionDescription) -> anyhow::Result<()> {
        self.remote_descriptions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &Candidate) -> anyhow::Result<()> {
        self.remote_candidates.lock().unwrap().push(candidate.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory keeping every connection and sink it handed out.
#[derive(Default)]
pub struct MockConnections {
    failing: AtomicBool,
    configs: Mutex<Vec<PeerConnectionConfig>>,
    created: Mutex<Vec<(Arc<MockPeerConnection>, Arc<dyn ConnectionEventSink>)>>,
}

impl MockConnections {
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn configs(&self) -> Vec<PeerConnectionConfig> {
        self.configs.lock().unwrap().clone()
    }

    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Arc<MockPeerConnection>> {
        self.created.lock().unwrap().last().map(|(c, _)| c.clone())
    }

    /// Event sink of the most recent connection.
    pub fn sink(&self) -> Arc<dyn ConnectionEventSink> {
        self.created
            .lock()
            .unwrap()
            .last()
            .map(|(_, sink)| sink.clone())
            .expect("no peer connection was created")
    }
}

#[async_trait]
impl PeerConnectionFactory for MockConnections {
    async fn create(
        &self,
        config: PeerConnectionConfig,
        events: Arc<dyn ConnectionEventSink>,
    ) -> anyhow::Result<Arc<dyn PeerConnection>> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("media engine unavailable");
        }
        self.configs.lock().unwrap().push(config);
        let connection = Arc::new(MockPeerConnection::default());
        self.created
            .lock()
            .unwrap()
            .push((connection.clone(), events));
        Ok(connection)
    }
}

/// Delegate recording every notification as a short string.
#[derive(Default)]
pub struct RecordingDelegate {
    events: Mutex<Vec<String>>,
}

impl RecordingDelegate {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// State names passed to `call_state_changed`, in order.
    pub fn states(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix("state:").map(str::to_string))
            .collect()
    }

    pub fn ended_count(&self) -> usize {
        self.events().iter().filter(|e| e.starts_with("ended:")).count()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl CallDelegate for RecordingDelegate {
    fn call_started(&self, _call_id: &CallId) {
        self.push("started".to_string());
    }

    fn call_state_changed(&self, _call_id: &CallId, state: &CallState) {
        self.push(format!("state:{}", state.name()));
    }

    fn call_ended(&self, _call_id: &CallId, state: &CallState) {
        let reason = state.end_reason().map(|r| format!("{r:?}")).unwrap_or_default();
        self.push(format!("ended:{reason}"));
    }

    fn local_video_track_ready(&self, _call_id: &CallId, track: &MediaTrack) {
        self.push(format!("local-video:{}", track.id));
    }

    fn remote_video_track_ready(&self, _call_id: &CallId, track: &MediaTrack) {
        self.push(format!("remote-video:{}", track.id));
    }
}

/// Every mock wired together.
pub struct TestEnv {
    pub account: Jid,
    pub signaling: Arc<RecordingSignaling>,
    pub capabilities: Arc<MockCapabilities>,
    pub relays: Arc<MockRelays>,
    pub media: Arc<MockMediaDevices>,
    pub connections: Arc<MockConnections>,
    pub delegate: Arc<RecordingDelegate>,
}

impl TestEnv {
    pub fn new() -> Self {
        init_logger();
        Self {
            account: jid(ACCOUNT),
            signaling: RecordingSignaling::new(),
            capabilities: Arc::default(),
            relays: Arc::default(),
            media: Arc::default(),
            connections: Arc::default(),
            delegate: Arc::default(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            capabilities: self.capabilities.clone(),
            relays: self.relays.clone(),
            media: self.media.clone(),
            signaling: self.signaling.clone(),
            connections: self.connections.clone(),
        }
    }

    pub fn manager(&self) -> Arc<CallManager> {
        self.manager_with(CallManagerConfig::default())
    }

    pub fn manager_with(&self, config: CallManagerConfig) -> Arc<CallManager> {
        let ctx = CallContext::new(self.account.clone(), config, self.collaborators());
        CallManager::new(ctx, Some(self.delegate.clone()))
    }
}
