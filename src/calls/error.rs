//! Call-related error types.

use jinglecore::types::{EndCallReason, MediaKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("media permission denied for {0:?}")]
    PermissionDenied(Vec<MediaKind>),

    #[error("no endpoint of the remote party supports calls")]
    NoCapableEndpoint,

    #[error("no endpoint answered the call")]
    NoAnswer,

    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("call terminated by the remote party")]
    RemoteTerminated,

    #[error("call declined by the remote party")]
    RemoteDeclined,

    #[error("connectivity lost")]
    ConnectivityLost,

    #[error("call not found: {0}")]
    NotFound(String),

    #[error("call already exists: {0}")]
    AlreadyExists(String),

    #[error("maximum number of concurrent calls reached ({0})")]
    TooManyCalls(usize),

    #[error("call already ended")]
    CallEnded,

    #[error("invalid state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("signaling error: {0}")]
    Signaling(anyhow::Error),

    #[error("media device error: {0}")]
    Media(anyhow::Error),

    #[error("transport error: {0}")]
    Transport(anyhow::Error),

    #[error("capability discovery failed: {0}")]
    Discovery(anyhow::Error),
}

impl CallError {
    /// The end reason recorded on a call that fails with this error.
    pub fn end_reason(&self) -> EndCallReason {
        match self {
            Self::PermissionDenied(_) => EndCallReason::PermissionDenied,
            Self::NoCapableEndpoint => EndCallReason::NoCapableEndpoint,
            Self::NoAnswer => EndCallReason::NoAnswer,
            Self::RemoteTerminated => EndCallReason::RemoteEnded,
            Self::RemoteDeclined => EndCallReason::Declined,
            Self::ConnectivityLost => EndCallReason::ConnectivityLost,
            Self::NegotiationFailed(_) | Self::Media(_) | Self::Transport(_) => {
                EndCallReason::NegotiationFailed
            }
            Self::Discovery(_) => EndCallReason::NoCapableEndpoint,
            _ => EndCallReason::GeneralError,
        }
    }

    /// The error reported for a call that ended for `reason`.
    pub fn from_end_reason(reason: EndCallReason) -> Self {
        match reason {
            EndCallReason::NoAnswer | EndCallReason::Timeout => Self::NoAnswer,
            EndCallReason::Declined | EndCallReason::Busy => Self::RemoteDeclined,
            EndCallReason::NoCapableEndpoint => Self::NoCapableEndpoint,
            EndCallReason::PermissionDenied => Self::PermissionDenied(Vec::new()),
            EndCallReason::ConnectivityLost => Self::ConnectivityLost,
            EndCallReason::NegotiationFailed => {
                Self::NegotiationFailed("call setup failed".to_string())
            }
            EndCallReason::RemoteEnded | EndCallReason::Cancelled => Self::RemoteTerminated,
            EndCallReason::Success | EndCallReason::GeneralError => Self::CallEnded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_reason_mapping() {
        assert_eq!(
            CallError::PermissionDenied(vec![MediaKind::Video]).end_reason(),
            EndCallReason::PermissionDenied
        );
        assert_eq!(
            CallError::Transport(anyhow::anyhow!("no route")).end_reason(),
            EndCallReason::NegotiationFailed
        );
        assert_eq!(CallError::CallEnded.end_reason(), EndCallReason::GeneralError);
        assert!(matches!(
            CallError::from_end_reason(EndCallReason::Busy),
            CallError::RemoteDeclined
        ));
        assert!(matches!(
            CallError::from_end_reason(EndCallReason::Timeout),
            CallError::NoAnswer
        ));
    }
}
