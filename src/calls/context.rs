//! Process-scoped call registry.
//!
//! One [`CallContext`] exists per signed-in account. It is created at
//! application start, handed to [`CallManager::new`](super::CallManager::new)
//! and torn down by [`CallManager::shutdown`](super::CallManager::shutdown).

use std::sync::Arc;

use dashmap::DashMap;
use jinglecore::Jid;
use jinglecore::types::CallId;

use super::call::CallHandle;
use super::manager::CallManagerConfig;
use super::session::SignalingSession;
use super::signaling::SessionKey;
use super::traits::Collaborators;

pub struct CallContext {
    pub(crate) account: Jid,
    pub(crate) config: CallManagerConfig,
    pub(crate) collaborators: Collaborators,
    /// Calls that have not ended.
    pub(crate) calls: DashMap<CallId, CallHandle>,
    /// Every live signaling session, for inbound routing.
    pub(crate) sessions: DashMap<SessionKey, Arc<SignalingSession>>,
}

impl CallContext {
    pub fn new(account: Jid, config: CallManagerConfig, collaborators: Collaborators) -> Arc<Self> {
        Arc::new(Self {
            account,
            config,
            collaborators,
            calls: DashMap::new(),
            sessions: DashMap::new(),
        })
    }

    pub fn account(&self) -> &Jid {
        &self.account
    }

    pub fn config(&self) -> &CallManagerConfig {
        &self.config
    }

    pub(crate) fn register_session(&self, session: Arc<SignalingSession>) {
        self.sessions.insert(session.key().clone(), session);
    }

    /// Session for an inbound key: exact match first, then the session
    /// addressed to the sender's bare address.
    pub(crate) fn find_session(&self, key: &SessionKey) -> Option<Arc<SignalingSession>> {
        if let Some(session) = self.sessions.get(key) {
            return Some(session.clone());
        }
        if key.remote.is_bare() {
            return None;
        }
        self.sessions.get(&key.to_bare()).map(|s| s.clone())
    }

    pub(crate) fn live_calls(&self) -> Vec<CallHandle> {
        self.calls
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|call| !call.is_ended())
            .collect()
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("account", &self.account)
            .field("config", &self.config)
            .field("calls", &self.calls.len())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
