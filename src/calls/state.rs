//! Call and signaling-session state machines.

use chrono::{DateTime, Utc};
use jinglecore::types::EndCallReason;
use serde::Serialize;

/// Current state of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub enum CallState {
    /// Created, not yet reported to the manager.
    #[default]
    New,
    /// Reported: ringing locally (incoming) or remotely (outgoing).
    Ringing { since: DateTime<Utc> },
    /// Accepted, description exchange and connectivity checks in progress.
    Connecting { since: DateTime<Utc> },
    /// Transport connectivity confirmed, media flowing.
    Connected {
        connected_at: DateTime<Utc>,
        audio_muted: bool,
        video_off: bool,
    },
    /// Terminal.
    Ended {
        reason: EndCallReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    pub fn end_reason(&self) -> Option<EndCallReason> {
        match self {
            Self::Ended { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Short name used in logs and by observers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Ringing { .. } => "ringing",
            Self::Connecting { .. } => "connecting",
            Self::Connected { .. } => "connected",
            Self::Ended { .. } => "ended",
        }
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    Reported,
    NegotiationStarted,
    ConnectivityEstablished { video: bool },
    AudioMuteChanged { muted: bool },
    VideoStateChanged { off: bool },
    Ended { reason: EndCallReason },
}

impl CallState {
    /// Compute the state after `transition`. `Ended` accepts nothing.
    pub fn apply(&self, transition: CallTransition) -> Result<CallState, InvalidTransition> {
        let next = match (self, transition) {
            (Self::New, CallTransition::Reported) => Self::Ringing { since: Utc::now() },
            (Self::Ringing { .. }, CallTransition::NegotiationStarted) => {
                Self::Connecting { since: Utc::now() }
            }
            (Self::Connecting { .. }, CallTransition::ConnectivityEstablished { video }) => {
                Self::Connected {
                    connected_at: Utc::now(),
                    audio_muted: false,
                    video_off: !video,
                }
            }
            (
                Self::Connected {
                    connected_at,
                    video_off,
                    ..
                },
                CallTransition::AudioMuteChanged { muted },
            ) => Self::Connected {
                connected_at: *connected_at,
                audio_muted: muted,
                video_off: *video_off,
            },
            (
                Self::Connected {
                    connected_at,
                    audio_muted,
                    ..
                },
                CallTransition::VideoStateChanged { off },
            ) => Self::Connected {
                connected_at: *connected_at,
                audio_muted: *audio_muted,
                video_off: off,
            },
            (Self::Connected { connected_at, .. }, CallTransition::Ended { reason }) => {
                let now = Utc::now();
                Self::Ended {
                    reason,
                    ended_at: now,
                    duration_secs: Some(now.signed_duration_since(*connected_at).num_seconds()),
                }
            }
            (
                Self::New | Self::Ringing { .. } | Self::Connecting { .. },
                CallTransition::Ended { reason },
            ) => Self::Ended {
                reason,
                ended_at: Utc::now(),
                duration_secs: None,
            },
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: current.name().to_string(),
                    attempted: format!("{transition:?}"),
                });
            }
        };
        Ok(next)
    }
}

/// State of one signaling session with one remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub enum SessionState {
    /// Created; nothing sent yet (initiator) or invite received and
    /// unanswered (responder).
    #[default]
    Pending,
    /// Invite sent, waiting for the remote answer.
    Initiated,
    /// Accepted by the responder.
    Accepted,
    /// Invite refused, by either side.
    Declined,
    Terminated { reason: EndCallReason },
}

impl SessionState {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// Declined or terminated: the session will never be accepted.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Declined | Self::Terminated { .. })
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Initiated => "initiated",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Terminated { .. } => "terminated",
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionTransition {
    Initiate,
    Accept,
    Decline,
    Terminate { reason: EndCallReason },
}

impl SessionState {
    pub fn apply(&self, transition: SessionTransition) -> Result<SessionState, InvalidTransition> {
        let next = match (self, transition) {
            (Self::Pending, SessionTransition::Initiate) => Self::Initiated,
            (Self::Pending | Self::Initiated, SessionTransition::Accept) => Self::Accepted,
            (Self::Pending | Self::Initiated, SessionTransition::Decline) => Self::Declined,
            (
                Self::Pending | Self::Initiated | Self::Accepted | Self::Declined,
                SessionTransition::Terminate { reason },
            ) => Self::Terminated { reason },
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: current.name().to_string(),
                    attempted: format!("{transition:?}"),
                });
            }
        };
        Ok(next)
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    fn ended(reason: EndCallReason) -> CallTransition {
        CallTransition::Ended { reason }
    }

    /// Flow: New → Ringing → Connecting → Connected → Ended
    #[test]
    fn test_call_happy_path() {
        let state = CallState::New;
        let state = state.apply(CallTransition::Reported).unwrap();
        assert!(state.is_ringing());
        let state = state.apply(CallTransition::NegotiationStarted).unwrap();
        assert!(state.is_connecting());
        let state = state.apply(CallTransition::ConnectivityEstablished { video: true }).unwrap();
        assert!(state.is_connected());
        let state = state.apply(ended(EndCallReason::Success)).unwrap();
        match state {
            CallState::Ended {
                reason,
                duration_secs,
                ..
            } => {
                assert_eq!(reason, EndCallReason::Success);
                assert!(duration_secs.is_some());
            }
            other => panic!("expected ended, got {other:?}"),
        }
    }

    #[test]
    fn test_ringing_can_end_directly() {
        let state = CallState::New.apply(CallTransition::Reported).unwrap();
        let state = state.apply(ended(EndCallReason::PermissionDenied)).unwrap();
        assert_eq!(state.end_reason(), Some(EndCallReason::PermissionDenied));
        if let CallState::Ended { duration_secs, .. } = state {
            assert_eq!(duration_secs, None);
        }
    }

    #[test]
    fn test_ended_is_terminal() {
        let state = CallState::New.apply(ended(EndCallReason::NoAnswer)).unwrap();
        assert!(state.apply(CallTransition::Reported).is_err());
        assert!(state.apply(CallTransition::ConnectivityEstablished { video: true }).is_err());
        assert!(state.apply(ended(EndCallReason::Success)).is_err());
    }

    #[test]
    fn test_call_skipping_states_is_rejected() {
        assert!(CallState::New.apply(CallTransition::NegotiationStarted).is_err());
        let ringing = CallState::New.apply(CallTransition::Reported).unwrap();
        assert!(ringing.apply(CallTransition::ConnectivityEstablished { video: true }).is_err());
        assert!(ringing.apply(CallTransition::AudioMuteChanged { muted: true }).is_err());
    }

    #[test]
    fn test_mute_and_video_preserved_across_changes() {
        let state = CallState::New
            .apply(CallTransition::Reported)
            .and_then(|s| s.apply(CallTransition::NegotiationStarted))
            .and_then(|s| s.apply(CallTransition::ConnectivityEstablished { video: true }))
            .and_then(|s| s.apply(CallTransition::AudioMuteChanged { muted: true }))
            .and_then(|s| s.apply(CallTransition::VideoStateChanged { off: true }))
            .unwrap();
        match state {
            CallState::Connected {
                audio_muted,
                video_off,
                ..
            } => assert!(audio_muted && video_off),
            other => panic!("expected connected, got {other:?}"),
        }
    }

    #[test]
    fn test_session_initiator_path() {
        let s = SessionState::Pending.apply(SessionTransition::Initiate).unwrap();
        assert_eq!(s, SessionState::Initiated);
        let s = s.apply(SessionTransition::Accept).unwrap();
        assert!(s.is_accepted());
        let s = s
            .apply(SessionTransition::Terminate {
                reason: EndCallReason::Success,
            })
            .unwrap();
        assert!(s.is_terminated());
    }

    #[test]
    fn test_session_decline_path() {
        let s = SessionState::Pending.apply(SessionTransition::Decline).unwrap();
        assert_eq!(s, SessionState::Declined);
        assert!(s.is_finished());
        assert!(s.apply(SessionTransition::Decline).is_err());
        assert!(s.apply(SessionTransition::Accept).is_err());
        let s = s
            .apply(SessionTransition::Terminate {
                reason: EndCallReason::Declined,
            })
            .unwrap();
        assert!(s.apply(SessionTransition::Terminate {
            reason: EndCallReason::Success
        })
        .is_err());
    }

    #[test]
    fn test_accepted_session_cannot_be_declined() {
        let s = SessionState::Accepted;
        assert!(s.apply(SessionTransition::Decline).is_err());
        assert!(s.apply(SessionTransition::Initiate).is_err());
    }
}
