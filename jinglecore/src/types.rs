use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Media kind carried by a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    pub fn from_media_line(media: &str) -> Option<Self> {
        match media {
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Which side started a signaling session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionRole {
    Initiator,
    Responder,
}

/// How a signaling session is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InitiationMechanism {
    /// Message-based invite (propose/proceed/reject/retract) carrying no
    /// session content; the description exchange follows acceptance.
    Lightweight,
    /// Full negotiated-content invite carrying the offer up front.
    Full,
}

fn random_hex_id() -> String {
    hex::encode_upper(rand::random::<[u8; 16]>())
}

/// Local correlation identifier of a call, independent of the wire session id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(random_hex_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Signaling session identifier (the Jingle `sid` / invite `id`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(random_hex_id().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a call or session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndCallReason {
    /// Normal hangup by either side after the call was established.
    Success,
    /// Remote declined the invite.
    Declined,
    /// Remote is busy.
    Busy,
    /// Invite cancelled before an answer (by us or by the remote).
    Cancelled,
    /// Remote ended an established or establishing session.
    RemoteEnded,
    /// Every fan-out attempt ended without acceptance.
    NoAnswer,
    /// Media device access refused locally.
    PermissionDenied,
    /// No endpoint of the remote party advertises call signaling.
    NoCapableEndpoint,
    /// Local description, transport or media setup failed.
    NegotiationFailed,
    /// Transport reported the connection lost.
    ConnectivityLost,
    Timeout,
    GeneralError,
}

impl EndCallReason {
    /// The Jingle `<reason/>` child element name for this reason.
    pub fn jingle_reason(&self) -> &'static str {
        match self {
            Self::Success | Self::RemoteEnded => "success",
            Self::Declined | Self::PermissionDenied => "decline",
            Self::Busy => "busy",
            Self::Cancelled | Self::NoAnswer => "cancel",
            Self::ConnectivityLost => "connectivity-error",
            Self::NegotiationFailed => "failed-application",
            Self::NoCapableEndpoint => "unsupported-applications",
            Self::Timeout => "timeout",
            Self::GeneralError => "general-error",
        }
    }

    /// Interpret a reason received from the remote side.
    pub fn from_remote_jingle_reason(reason: &str) -> Self {
        match reason {
            "success" => Self::RemoteEnded,
            "decline" => Self::Declined,
            "busy" => Self::Busy,
            "cancel" | "gone" => Self::Cancelled,
            "connectivity-error" | "failed-transport" => Self::ConnectivityLost,
            "failed-application" | "incompatible-parameters" | "unsupported-applications"
            | "unsupported-transports" | "media-error" | "security-error" => {
                Self::NegotiationFailed
            }
            "timeout" | "expired" => Self::Timeout,
            _ => Self::GeneralError,
        }
    }

    /// Whether ending for this reason should signal the remote side.
    ///
    /// Local pre-flight failures end the attempt without any signaling.
    pub fn notifies_remote(&self) -> bool {
        !matches!(self, Self::PermissionDenied | Self::NoCapableEndpoint)
    }
}

/// Relay/reflexive server protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayKind {
    Stun,
    Stuns,
    Turn,
    Turns,
}

impl RelayKind {
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Stun => "stun",
            Self::Stuns => "stuns",
            Self::Turn => "turn",
            Self::Turns => "turns",
        }
    }

    pub fn needs_credentials(&self) -> bool {
        matches!(self, Self::Turn | Self::Turns)
    }
}

impl FromStr for RelayKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stun" => Ok(Self::Stun),
            "stuns" => Ok(Self::Stuns),
            "turn" => Ok(Self::Turn),
            "turns" => Ok(Self::Turns),
            other => Err(format!("unknown relay type '{other}'")),
        }
    }
}

/// A STUN/TURN server usable for candidate gathering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayServer {
    pub kind: RelayKind,
    pub host: String,
    pub port: Option<u16>,
    /// "udp" or "tcp"; omitted from the URL when unset.
    pub transport: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl RelayServer {
    pub fn new(kind: RelayKind, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
            transport: None,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = Some(transport.into());
        self
    }

    /// ICE server URL (RFC 7064 / RFC 7065).
    pub fn url(&self) -> String {
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let mut url = format!("{}:{}", self.kind.scheme(), host);
        if let Some(port) = self.port {
            url.push_str(&format!(":{port}"));
        }
        if let Some(transport) = &self.transport
            && self.kind.needs_credentials()
        {
            url.push_str(&format!("?transport={transport}"));
        }
        url
    }

    /// A TURN entry without credentials cannot be used for allocation.
    pub fn is_usable(&self) -> bool {
        !self.kind.needs_credentials() || (self.username.is_some() && self.password.is_some())
    }
}
