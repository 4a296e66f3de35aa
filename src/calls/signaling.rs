//! Signaling vocabulary: actions, session routing keys and inbound signals.
//!
//! Full negotiated-content sessions use Jingle actions (`session-initiate`,
//! `session-accept`, `transport-info`, ...). Lightweight invites use the
//! message-based `propose`/`proceed`/`reject`/`retract` elements, which carry
//! no session content.

use std::fmt;

use jinglecore::types::{MediaKind, SessionId};
use jinglecore::{Candidate, Jid, SessionDescription};

/// Signaling actions exchanged with a remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JingleAction {
    /// Lightweight invite announcing a call with the given media.
    Propose,
    /// Callee accepts a lightweight invite; the description exchange follows.
    Proceed,
    /// Callee refuses a lightweight invite.
    Reject,
    /// Caller withdraws a lightweight invite before it was answered.
    Retract,
    /// Full invite carrying the offer.
    SessionInitiate,
    /// Answer to a full invite.
    SessionAccept,
    /// End of a session, with a reason.
    SessionTerminate,
    /// Trickled connectivity candidate.
    TransportInfo,
    /// Replacement description during an established session.
    ContentModify,
}

impl JingleAction {
    pub const ALL: [JingleAction; 9] = [
        Self::Propose,
        Self::Proceed,
        Self::Reject,
        Self::Retract,
        Self::SessionInitiate,
        Self::SessionAccept,
        Self::SessionTerminate,
        Self::TransportInfo,
        Self::ContentModify,
    ];

    /// Element name (invite actions) or `action` attribute value (Jingle).
    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::Propose => "propose",
            Self::Proceed => "proceed",
            Self::Reject => "reject",
            Self::Retract => "retract",
            Self::SessionInitiate => "session-initiate",
            Self::SessionAccept => "session-accept",
            Self::SessionTerminate => "session-terminate",
            Self::TransportInfo => "transport-info",
            Self::ContentModify => "content-modify",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.tag_name() == tag)
    }

    /// Whether the action belongs to the lightweight invite mechanism.
    pub const fn is_lightweight(&self) -> bool {
        matches!(
            self,
            Self::Propose | Self::Proceed | Self::Reject | Self::Retract
        )
    }

    /// Whether this action can open a new session on the receiving side.
    pub const fn opens_session(&self) -> bool {
        matches!(self, Self::Propose | Self::SessionInitiate)
    }
}

impl fmt::Display for JingleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag_name())
    }
}

/// (account, remote party, session-id): routing and de-duplication key of a
/// signaling session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub account: Jid,
    pub remote: Jid,
    pub sid: SessionId,
}

impl SessionKey {
    pub fn new(account: Jid, remote: Jid, sid: SessionId) -> Self {
        Self {
            account,
            remote,
            sid,
        }
    }

    /// Same session addressed to the bare remote account.
    pub fn to_bare(&self) -> Self {
        Self {
            account: self.account.clone(),
            remote: self.remote.to_bare(),
            sid: self.sid.clone(),
        }
    }

    pub fn with_remote(&self, remote: Jid) -> Self {
        Self {
            account: self.account.clone(),
            remote,
            sid: self.sid.clone(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} [{}]", self.account, self.remote, self.sid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// A remote description together with its arrival order within a session.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDescription {
    pub description: SessionDescription,
    pub kind: DescriptionKind,
    /// Starts at 1 and increases with every replacement.
    pub revision: u64,
}

/// Content of an inbound signal.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalPayload {
    Propose { media: Vec<MediaKind> },
    Proceed,
    Reject,
    Retract,
    Initiate { description: SessionDescription },
    Accept { description: SessionDescription },
    /// `reason` is the Jingle reason element name.
    Terminate { reason: String },
    Candidate { candidate: Candidate },
    DescriptionUpdate {
        description: SessionDescription,
        kind: DescriptionKind,
    },
}

impl SignalPayload {
    pub fn action(&self) -> JingleAction {
        match self {
            Self::Propose { .. } => JingleAction::Propose,
            Self::Proceed => JingleAction::Proceed,
            Self::Reject => JingleAction::Reject,
            Self::Retract => JingleAction::Retract,
            Self::Initiate { .. } => JingleAction::SessionInitiate,
            Self::Accept { .. } => JingleAction::SessionAccept,
            Self::Terminate { .. } => JingleAction::SessionTerminate,
            Self::Candidate { .. } => JingleAction::TransportInfo,
            Self::DescriptionUpdate { .. } => JingleAction::ContentModify,
        }
    }
}

/// Signal received from the signaling transport. `key.remote` is the full
/// address of the sending endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundSignal {
    pub key: SessionKey,
    pub payload: SignalPayload,
}

impl InboundSignal {
    pub fn new(key: SessionKey, payload: SignalPayload) -> Self {
        Self { key, payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_tag_roundtrip() {
        for action in JingleAction::ALL {
            assert_eq!(JingleAction::from_tag(action.tag_name()), Some(action));
        }
        assert_eq!(JingleAction::from_tag("session-info"), None);
    }

    #[test]
    fn test_lightweight_actions() {
        assert!(JingleAction::Propose.is_lightweight());
        assert!(JingleAction::Retract.is_lightweight());
        assert!(!JingleAction::SessionInitiate.is_lightweight());
        assert!(!JingleAction::TransportInfo.is_lightweight());
    }

    #[test]
    fn test_only_invites_open_sessions() {
        let openers: Vec<_> = JingleAction::ALL
            .into_iter()
            .filter(JingleAction::opens_session)
            .collect();
        assert_eq!(
            openers,
            vec![JingleAction::Propose, JingleAction::SessionInitiate]
        );
    }

    #[test]
    fn test_session_key_bare_fallback() {
        let key = SessionKey::new(
            "romeo@montague.lit/orchard".parse().unwrap(),
            "juliet@capulet.lit/balcony".parse().unwrap(),
            SessionId::new("a73sjjvkla37jfea"),
        );
        let bare = key.to_bare();
        assert_eq!(bare.remote.to_string(), "juliet@capulet.lit");
        assert_eq!(bare.account, key.account);
        assert_eq!(bare.sid, key.sid);
        assert_ne!(bare, key);
    }

    #[test]
    fn test_payload_actions() {
        assert_eq!(SignalPayload::Proceed.action(), JingleAction::Proceed);
        assert_eq!(
            SignalPayload::Terminate {
                reason: "success".into()
            }
            .action(),
            JingleAction::SessionTerminate
        );
    }
}
