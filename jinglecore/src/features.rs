//! Service discovery feature namespaces relevant to calling, and the
//! per-endpoint capability set built from a disco#info result.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::jid::Jid;
use crate::types::MediaKind;

pub const NS_JINGLE: &str = "urn:xmpp:jingle:1";
pub const NS_JINGLE_RTP: &str = "urn:xmpp:jingle:apps:rtp:1";
pub const NS_JINGLE_RTP_AUDIO: &str = "urn:xmpp:jingle:apps:rtp:audio";
pub const NS_JINGLE_RTP_VIDEO: &str = "urn:xmpp:jingle:apps:rtp:video";
pub const NS_JINGLE_ICE_UDP: &str = "urn:xmpp:jingle:transports:ice-udp:1";
pub const NS_JINGLE_DTLS: &str = "urn:xmpp:jingle:apps:dtls:0";
pub const NS_JINGLE_MESSAGE: &str = "urn:xmpp:jingle-message:0";
pub const NS_EXTERNAL_SERVICES: &str = "urn:xmpp:extdisco:2";

/// Advertised feature set of one endpoint (full JID) of a remote party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCapabilities {
    pub jid: Jid,
    pub features: HashSet<String>,
}

impl EndpointCapabilities {
    pub fn new<I, S>(jid: Jid, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            jid,
            features: features.into_iter().map(Into::into).collect(),
        }
    }

    pub fn supports(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    /// Signaling protocol plus a usable transport protocol.
    pub fn supports_calls(&self) -> bool {
        self.supports(NS_JINGLE) && self.supports(NS_JINGLE_RTP) && self.supports(NS_JINGLE_ICE_UDP)
    }

    pub fn supports_lightweight_invite(&self) -> bool {
        self.supports(NS_JINGLE_MESSAGE)
    }

    /// Media-specific features are optional; only an endpoint that
    /// advertises some of them is held to the requested kinds.
    pub fn supports_media(&self, media: &[MediaKind]) -> bool {
        let advertises_any = self.supports(NS_JINGLE_RTP_AUDIO) || self.supports(NS_JINGLE_RTP_VIDEO);
        if !advertises_any {
            return true;
        }
        media.iter().all(|kind| match kind {
            MediaKind::Audio => self.supports(NS_JINGLE_RTP_AUDIO),
            MediaKind::Video => self.supports(NS_JINGLE_RTP_VIDEO),
        })
    }
}
