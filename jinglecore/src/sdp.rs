//! Session description model.
//!
//! The offer/answer document exchanged between peers, parsed from and
//! serialized to SDP text (RFC 8866). A description is immutable once built:
//! renegotiation produces a new description that replaces the old one, and
//! trickled candidates travel separately as [`Candidate`] values.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::candidate::Candidate;
use crate::types::MediaKind;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SdpError {
    #[error("empty session description")]
    Empty,
    #[error("line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("unsupported SDP version: {0}")]
    UnsupportedVersion(String),
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub username: String,
    pub session_id: String,
    pub session_version: u64,
    /// "IP4" or "IP6".
    pub address_type: String,
    pub address: String,
}

impl Origin {
    pub fn new(session_id: impl Into<String>, session_version: u64) -> Self {
        Self {
            username: "-".to_string(),
            session_id: session_id.into(),
            session_version,
            address_type: "IP4".to_string(),
            address: "127.0.0.1".to_string(),
        }
    }
}

/// `a=group:` session attribute, usually `BUNDLE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub semantics: String,
    pub mids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub hash: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetupRole {
    Active,
    Passive,
    ActPass,
    HoldConn,
}

impl SetupRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Passive => "passive",
            Self::ActPass => "actpass",
            Self::HoldConn => "holdconn",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "passive" => Some(Self::Passive),
            "actpass" => Some(Self::ActPass),
            "holdconn" => Some(Self::HoldConn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MediaDirection {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendRecv => "sendrecv",
            Self::SendOnly => "sendonly",
            Self::RecvOnly => "recvonly",
            Self::Inactive => "inactive",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "sendrecv" => Some(Self::SendRecv),
            "sendonly" => Some(Self::SendOnly),
            "recvonly" => Some(Self::RecvOnly),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

/// Codec/payload parameters of one format in a media line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadType {
    pub id: u8,
    pub name: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    /// Raw `a=fmtp:` parameter string.
    pub format_parameters: Option<String>,
    /// `a=rtcp-fb:` values.
    pub feedback: Vec<String>,
}

impl PayloadType {
    pub fn new(id: u8, name: impl Into<String>, clock_rate: u32) -> Self {
        Self {
            id,
            name: name.into(),
            clock_rate,
            channels: None,
            format_parameters: None,
            feedback: Vec::new(),
        }
    }

    pub fn with_channels(mut self, channels: u8) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn with_parameters(mut self, parameters: impl Into<String>) -> Self {
        self.format_parameters = Some(parameters.into());
        self
    }

    /// Static payload types may appear without an rtpmap line.
    fn from_static(id: u8) -> Self {
        match id {
            0 => Self::new(id, "PCMU", 8000),
            8 => Self::new(id, "PCMA", 8000),
            9 => Self::new(id, "G722", 8000),
            13 => Self::new(id, "CN", 8000),
            _ => Self::new(id, "", 0),
        }
    }

    fn rtpmap(&self) -> Option<String> {
        if self.name.is_empty() {
            return None;
        }
        Some(match self.channels {
            Some(ch) => format!("{}/{}/{}", self.name, self.clock_rate, ch),
            None => format!("{}/{}", self.name, self.clock_rate),
        })
    }
}

/// One media-content descriptor (an `m=` section).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaContent {
    /// Media type from the m-line ("audio", "video", "application").
    pub media: String,
    pub port: u16,
    pub protocol: String,
    pub mid: Option<String>,
    pub connection: Option<String>,
    pub ice: Option<IceCredentials>,
    pub fingerprint: Option<Fingerprint>,
    pub setup: Option<SetupRole>,
    pub direction: MediaDirection,
    pub rtcp_mux: bool,
    pub payloads: Vec<PayloadType>,
    pub candidates: Vec<Candidate>,
    /// Attributes this model does not interpret, kept verbatim (without `a=`).
    pub attributes: Vec<String>,
}

impl MediaContent {
    pub fn new(kind: MediaKind, mid: impl Into<String>) -> Self {
        Self {
            media: kind.as_str().to_string(),
            port: 9,
            protocol: "UDP/TLS/RTP/SAVPF".to_string(),
            mid: Some(mid.into()),
            connection: Some("IN IP4 0.0.0.0".to_string()),
            ice: None,
            fingerprint: None,
            setup: None,
            direction: MediaDirection::SendRecv,
            rtcp_mux: true,
            payloads: Vec::new(),
            candidates: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn kind(&self) -> Option<MediaKind> {
        MediaKind::from_media_line(&self.media)
    }

    fn payload_mut(&mut self, id: u8) -> Option<&mut PayloadType> {
        self.payloads.iter_mut().find(|p| p.id == id)
    }
}

/// Complete offer or answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    origin: Origin,
    name: String,
    connection: Option<String>,
    group: Option<Group>,
    ice: Option<IceCredentials>,
    fingerprint: Option<Fingerprint>,
    attributes: Vec<String>,
    contents: Vec<MediaContent>,
}

impl SessionDescription {
    /// Build a description whose contents are bundled under one transport.
    pub fn new(origin: Origin, contents: Vec<MediaContent>) -> Self {
        let mids: Vec<String> = contents.iter().filter_map(|c| c.mid.clone()).collect();
        let group = (!mids.is_empty()).then(|| Group {
            semantics: "BUNDLE".to_string(),
            mids,
        });
        Self {
            origin,
            name: "-".to_string(),
            connection: None,
            group,
            ice: None,
            fingerprint: None,
            attributes: Vec::new(),
            contents,
        }
    }

    pub fn parse(text: &str) -> Result<Self, SdpError> {
        let mut version_seen = false;
        let mut origin = None;
        let mut name = None;
        let mut connection = None;
        let mut group = None;
        let mut ice_ufrag = None;
        let mut ice_pwd = None;
        let mut fingerprint = None;
        let mut attributes = Vec::new();
        let mut contents: Vec<MediaContent> = Vec::new();
        // Media-level ICE credentials may come in either order, collect per content.
        let mut content_ice: Vec<(Option<String>, Option<String>)> = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let invalid = |reason: &str| SdpError::InvalidLine {
                line: line_no,
                reason: reason.to_string(),
            };
            let (field, value) = line
                .split_once('=')
                .filter(|(f, _)| f.len() == 1)
                .ok_or_else(|| invalid("expected '<type>=<value>'"))?;

            match field {
                "v" => {
                    if value != "0" {
                        return Err(SdpError::UnsupportedVersion(value.to_string()));
                    }
                    version_seen = true;
                }
                "o" => origin = Some(parse_origin(value).ok_or_else(|| invalid("malformed origin"))?),
                "s" => name = Some(value.to_string()),
                "t" => {}
                "c" => match contents.last_mut() {
                    Some(content) => content.connection = Some(value.to_string()),
                    None => connection = Some(value.to_string()),
                },
                "m" => {
                    contents.push(parse_media_line(value).ok_or_else(|| invalid("malformed media line"))?);
                    content_ice.push((None, None));
                }
                "a" => {
                    let (attr, attr_value) = match value.split_once(':') {
                        Some((a, v)) => (a, Some(v)),
                        None => (value, None),
                    };
                    let Some(content) = contents.last_mut() else {
                        match (attr, attr_value) {
                            ("group", Some(v)) => {
                                let mut parts = v.split_whitespace();
                                let semantics = parts.next().ok_or_else(|| invalid("empty group"))?;
                                group = Some(Group {
                                    semantics: semantics.to_string(),
                                    mids: parts.map(str::to_string).collect(),
                                });
                            }
                            ("ice-ufrag", Some(v)) => ice_ufrag = Some(v.to_string()),
                            ("ice-pwd", Some(v)) => ice_pwd = Some(v.to_string()),
                            ("fingerprint", Some(v)) => {
                                fingerprint = Some(parse_fingerprint(v).ok_or_else(|| invalid("malformed fingerprint"))?)
                            }
                            _ => attributes.push(value.to_string()),
                        }
                        continue;
                    };
                    let ice = content_ice.last_mut().ok_or_else(|| invalid("attribute outside media"))?;
                    apply_media_attribute(content, ice, attr, attr_value, value)
                        .map_err(|e| match e {
                            SdpError::InvalidCandidate(_) => e,
                            other => SdpError::InvalidLine {
                                line: line_no,
                                reason: other.to_string(),
                            },
                        })?;
                }
                // Bandwidth, timezone, key, repeat and info lines are not modelled.
                _ => {}
            }
        }

        if !version_seen {
            return if contents.is_empty() && origin.is_none() {
                Err(SdpError::Empty)
            } else {
                Err(SdpError::MissingField("v"))
            };
        }

        for (content, (ufrag, pwd)) in contents.iter_mut().zip(content_ice) {
            if let (Some(ufrag), Some(pwd)) = (ufrag, pwd) {
                content.ice = Some(IceCredentials { ufrag, pwd });
            }
        }

        let ice = match (ice_ufrag, ice_pwd) {
            (Some(ufrag), Some(pwd)) => Some(IceCredentials { ufrag, pwd }),
            _ => None,
        };

        Ok(Self {
            origin: origin.ok_or(SdpError::MissingField("o"))?,
            name: name.ok_or(SdpError::MissingField("s"))?,
            connection,
            group,
            ice,
            fingerprint,
            attributes,
            contents,
        })
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn group(&self) -> Option<&Group> {
        self.group.as_ref()
    }

    pub fn contents(&self) -> &[MediaContent] {
        &self.contents
    }

    pub fn content(&self, mid: &str) -> Option<&MediaContent> {
        self.contents.iter().find(|c| c.mid.as_deref() == Some(mid))
    }

    /// Audio/video kinds present, in first-appearance order, without duplicates.
    pub fn media_kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::new();
        for kind in self.contents.iter().filter_map(MediaContent::kind) {
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        kinds
    }

    pub fn is_bundled(&self) -> bool {
        self.group
            .as_ref()
            .is_some_and(|g| g.semantics.eq_ignore_ascii_case("BUNDLE"))
    }

    /// ICE credentials in effect for a content: media-level, else session-level.
    pub fn ice_for<'a>(&'a self, content: &'a MediaContent) -> Option<&'a IceCredentials> {
        content.ice.as_ref().or(self.ice.as_ref())
    }

    pub fn fingerprint_for<'a>(&'a self, content: &'a MediaContent) -> Option<&'a Fingerprint> {
        content.fingerprint.as_ref().or(self.fingerprint.as_ref())
    }

    /// Every embedded candidate with the mid and m-line index filled in.
    pub fn candidates(&self) -> Vec<Candidate> {
        self.contents
            .iter()
            .enumerate()
            .flat_map(|(index, content)| {
                content.candidates.iter().map(move |c| {
                    let mut c = c.clone();
                    c.sdp_mid = content.mid.clone();
                    c.sdp_m_line_index = Some(index as u16);
                    c
                })
            })
            .collect()
    }

    pub fn to_sdp(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.origin;
        write!(f, "v=0\r\n")?;
        write!(
            f,
            "o={} {} {} IN {} {}\r\n",
            o.username, o.session_id, o.session_version, o.address_type, o.address
        )?;
        write!(f, "s={}\r\n", self.name)?;
        if let Some(c) = &self.connection {
            write!(f, "c={c}\r\n")?;
        }
        write!(f, "t=0 0\r\n")?;
        if let Some(group) = &self.group {
            write!(f, "a=group:{}", group.semantics)?;
            for mid in &group.mids {
                write!(f, " {mid}")?;
            }
            write!(f, "\r\n")?;
        }
        if let Some(ice) = &self.ice {
            write!(f, "a=ice-ufrag:{}\r\na=ice-pwd:{}\r\n", ice.ufrag, ice.pwd)?;
        }
        if let Some(fp) = &self.fingerprint {
            write!(f, "a=fingerprint:{} {}\r\n", fp.hash, fp.value)?;
        }
        for attr in &self.attributes {
            write!(f, "a={attr}\r\n")?;
        }
        for content in &self.contents {
            write_content(f, content)?;
        }
        Ok(())
    }
}

impl FromStr for SessionDescription {
    type Err = SdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn write_content(f: &mut fmt::Formatter<'_>, content: &MediaContent) -> fmt::Result {
    write!(f, "m={} {} {}", content.media, content.port, content.protocol)?;
    for payload in &content.payloads {
        write!(f, " {}", payload.id)?;
    }
    write!(f, "\r\n")?;
    if let Some(c) = &content.connection {
        write!(f, "c={c}\r\n")?;
    }
    if let Some(mid) = &content.mid {
        write!(f, "a=mid:{mid}\r\n")?;
    }
    if let Some(ice) = &content.ice {
        write!(f, "a=ice-ufrag:{}\r\na=ice-pwd:{}\r\n", ice.ufrag, ice.pwd)?;
    }
    if let Some(fp) = &content.fingerprint {
        write!(f, "a=fingerprint:{} {}\r\n", fp.hash, fp.value)?;
    }
    if let Some(setup) = content.setup {
        write!(f, "a=setup:{}\r\n", setup.as_str())?;
    }
    write!(f, "a={}\r\n", content.direction.as_str())?;
    if content.rtcp_mux {
        write!(f, "a=rtcp-mux\r\n")?;
    }
    for payload in &content.payloads {
        if let Some(rtpmap) = payload.rtpmap() {
            write!(f, "a=rtpmap:{} {}\r\n", payload.id, rtpmap)?;
        }
        for fb in &payload.feedback {
            write!(f, "a=rtcp-fb:{} {}\r\n", payload.id, fb)?;
        }
        if let Some(params) = &payload.format_parameters {
            write!(f, "a=fmtp:{} {}\r\n", payload.id, params)?;
        }
    }
    for attr in &content.attributes {
        write!(f, "a={attr}\r\n")?;
    }
    for candidate in &content.candidates {
        write!(f, "a={candidate}\r\n")?;
    }
    Ok(())
}

fn parse_origin(value: &str) -> Option<Origin> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    let [username, session_id, version, _net_type, address_type, address] = fields.as_slice() else {
        return None;
    };
    Some(Origin {
        username: username.to_string(),
        session_id: session_id.to_string(),
        session_version: version.parse().ok()?,
        address_type: address_type.to_string(),
        address: address.to_string(),
    })
}

fn parse_media_line(value: &str) -> Option<MediaContent> {
    let mut fields = value.split_whitespace();
    let media = fields.next()?;
    // Port may carry a "/<count>" suffix.
    let port = fields.next()?.split('/').next()?.parse().ok()?;
    let protocol = fields.next()?;
    let payloads = fields
        .filter_map(|fmt| fmt.parse::<u8>().ok())
        .map(PayloadType::from_static)
        .collect();
    Some(MediaContent {
        media: media.to_string(),
        port,
        protocol: protocol.to_string(),
        mid: None,
        connection: None,
        ice: None,
        fingerprint: None,
        setup: None,
        direction: MediaDirection::SendRecv,
        rtcp_mux: false,
        payloads,
        candidates: Vec::new(),
        attributes: Vec::new(),
    })
}

fn parse_fingerprint(value: &str) -> Option<Fingerprint> {
    let (hash, fp) = value.split_once(' ')?;
    Some(Fingerprint {
        hash: hash.to_string(),
        value: fp.trim().to_string(),
    })
}

fn apply_media_attribute(
    content: &mut MediaContent,
    ice: &mut (Option<String>, Option<String>),
    attr: &str,
    attr_value: Option<&str>,
    raw: &str,
) -> Result<(), SdpError> {
    let malformed = |what: &str| SdpError::InvalidLine {
        line: 0,
        reason: format!("malformed {what}"),
    };
    match (attr, attr_value) {
        ("mid", Some(v)) => content.mid = Some(v.to_string()),
        ("ice-ufrag", Some(v)) => ice.0 = Some(v.to_string()),
        ("ice-pwd", Some(v)) => ice.1 = Some(v.to_string()),
        ("fingerprint", Some(v)) => {
            content.fingerprint = Some(parse_fingerprint(v).ok_or_else(|| malformed("fingerprint"))?)
        }
        ("setup", Some(v)) => content.setup = Some(SetupRole::parse(v).ok_or_else(|| malformed("setup"))?),
        ("rtcp-mux", None) => content.rtcp_mux = true,
        ("candidate", Some(_)) => content.candidates.push(Candidate::parse(raw)?),
        ("rtpmap", Some(v)) => {
            let (id, codec) = v.split_once(' ').ok_or_else(|| malformed("rtpmap"))?;
            let id: u8 = id.parse().map_err(|_| malformed("rtpmap"))?;
            let mut parts = codec.split('/');
            let name = parts.next().unwrap_or_default().to_string();
            let clock_rate = parts
                .next()
                .and_then(|r| r.parse().ok())
                .ok_or_else(|| malformed("rtpmap"))?;
            let channels = parts.next().and_then(|c| c.parse().ok());
            if content.payload_mut(id).is_none() {
                content.payloads.push(PayloadType::new(id, "", 0));
            }
            if let Some(payload) = content.payload_mut(id) {
                payload.name = name;
                payload.clock_rate = clock_rate;
                payload.channels = channels;
            }
        }
        ("fmtp", Some(v)) => {
            let (id, params) = v.split_once(' ').ok_or_else(|| malformed("fmtp"))?;
            let id: u8 = id.parse().map_err(|_| malformed("fmtp"))?;
            match content.payload_mut(id) {
                Some(payload) => payload.format_parameters = Some(params.to_string()),
                None => content.attributes.push(raw.to_string()),
            }
        }
        ("rtcp-fb", Some(v)) => {
            let (id, fb) = v.split_once(' ').ok_or_else(|| malformed("rtcp-fb"))?;
            match id.parse::<u8>().ok().and_then(|id| content.payload_mut(id)) {
                Some(payload) => payload.feedback.push(fb.to_string()),
                // Wildcard feedback ("*") applies to every payload; keep it verbatim.
                None => content.attributes.push(raw.to_string()),
            }
        }
        (direction, None) if MediaDirection::parse(direction).is_some() => {
            content.direction = MediaDirection::parse(direction).unwrap_or_default();
        }
        ("end-of-candidates", None) => {}
        _ => content.attributes.push(raw.to_string()),
    }
    Ok(())
}
