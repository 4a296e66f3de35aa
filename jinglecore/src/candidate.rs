//! ICE candidate model.
//!
//! Candidates travel in two shapes: embedded in a session description as
//! `a=candidate:` lines, and individually (trickled) in transport-info
//! signals. Both use the attribute grammar of RFC 8839 §5.1:
//!
//! ```text
//! candidate:<foundation> <component> <transport> <priority> <address> <port> typ <type>
//!     [raddr <address>] [rport <port>] [generation <n>] [*(<ext-name> <ext-value>)]
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::sdp::SdpError;

/// ICE candidate type (RFC 8445).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateType {
    /// Direct host candidate
    Host,
    /// Server reflexive (STUN) candidate
    ServerReflexive,
    /// Peer reflexive candidate
    PeerReflexive,
    /// Relay (TURN) candidate
    Relay,
}

impl CandidateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }
}

impl FromStr for CandidateType {
    type Err = SdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "prflx" => Ok(Self::PeerReflexive),
            "relay" => Ok(Self::Relay),
            other => Err(SdpError::InvalidCandidate(format!(
                "unknown candidate type '{other}'"
            ))),
        }
    }
}

/// A single connectivity path descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub foundation: String,
    pub component: u16,
    /// Transport protocol as written on the wire ("udp", "tcp").
    pub protocol: String,
    pub priority: u32,
    /// IP address or mDNS hostname.
    pub address: String,
    pub port: u16,
    pub kind: CandidateType,
    pub related_address: Option<String>,
    pub related_port: Option<u16>,
    pub generation: Option<u32>,
    /// Media stream identification of the content this candidate belongs to.
    pub sdp_mid: Option<String>,
    /// Index of the media line this candidate belongs to.
    pub sdp_m_line_index: Option<u16>,
}

impl Candidate {
    pub fn new(
        foundation: impl Into<String>,
        component: u16,
        priority: u32,
        address: impl Into<String>,
        port: u16,
        kind: CandidateType,
    ) -> Self {
        Self {
            foundation: foundation.into(),
            component,
            protocol: "udp".to_string(),
            priority,
            address: address.into(),
            port,
            kind,
            related_address: None,
            related_port: None,
            generation: None,
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    pub fn with_related(mut self, address: impl Into<String>, port: u16) -> Self {
        self.related_address = Some(address.into());
        self.related_port = Some(port);
        self
    }

    /// Parse the attribute value, with or without the `candidate:` prefix
    /// and with or without a leading `a=`.
    pub fn parse(line: &str) -> Result<Self, SdpError> {
        let value = line.trim();
        let value = value.strip_prefix("a=").unwrap_or(value);
        let value = value.strip_prefix("candidate:").unwrap_or(value);

        let fields: Vec<&str> = value.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(SdpError::InvalidCandidate(format!(
                "expected at least 8 fields, got {}",
                fields.len()
            )));
        }
        if !fields[6].eq_ignore_ascii_case("typ") {
            return Err(SdpError::InvalidCandidate(format!(
                "expected 'typ', got '{}'",
                fields[6]
            )));
        }

        let number = |field: &str, name: &str| -> Result<u32, SdpError> {
            field
                .parse::<u32>()
                .map_err(|_| SdpError::InvalidCandidate(format!("invalid {name} '{field}'")))
        };

        let mut candidate = Candidate {
            foundation: fields[0].to_string(),
            component: number(fields[1], "component")? as u16,
            protocol: fields[2].to_lowercase(),
            priority: number(fields[3], "priority")?,
            address: fields[4].to_string(),
            port: number(fields[5], "port")? as u16,
            kind: fields[7].parse()?,
            related_address: None,
            related_port: None,
            generation: None,
            sdp_mid: None,
            sdp_m_line_index: None,
        };

        // Extension attributes come in name/value pairs; unknown ones are skipped.
        for pair in fields[8..].chunks(2) {
            let [name, value] = pair else {
                return Err(SdpError::InvalidCandidate(format!(
                    "dangling extension attribute '{}'",
                    pair[0]
                )));
            };
            match *name {
                "raddr" => candidate.related_address = Some(value.to_string()),
                "rport" => candidate.related_port = Some(number(*value, "rport")? as u16),
                "generation" => candidate.generation = Some(number(*value, "generation")?),
                _ => {}
            }
        }

        Ok(candidate)
    }

    /// The attribute value including the `candidate:` prefix.
    pub fn to_attribute(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.address,
            self.port,
            self.kind.as_str()
        )?;
        if let Some(raddr) = &self.related_address {
            write!(f, " raddr {raddr}")?;
        }
        if let Some(rport) = self.related_port {
            write!(f, " rport {rport}")?;
        }
        if let Some(generation) = self.generation {
            write!(f, " generation {generation}")?;
        }
        Ok(())
    }
}

impl FromStr for Candidate {
    type Err = SdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_candidate() {
        let c = Candidate::parse("candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host").unwrap();
        assert_eq!(c.foundation, "1");
        assert_eq!(c.component, 1);
        assert_eq!(c.protocol, "udp");
        assert_eq!(c.priority, 2130706431);
        assert_eq!(c.address, "192.168.1.1");
        assert_eq!(c.port, 8888);
        assert_eq!(c.kind, CandidateType::Host);
        assert_eq!(c.related_address, None);
    }

    #[test]
    fn test_parse_relay_candidate_with_extensions() {
        let c = Candidate::parse(
            "a=candidate:842163049 1 udp 1677729535 203.0.113.7 46154 typ relay raddr 10.0.0.2 rport 51234 generation 0 network-cost 999",
        )
        .unwrap();
        assert_eq!(c.kind, CandidateType::Relay);
        assert_eq!(c.related_address.as_deref(), Some("10.0.0.2"));
        assert_eq!(c.related_port, Some(51234));
        assert_eq!(c.generation, Some(0));
    }

    #[test]
    fn test_display_matches_attribute_grammar() {
        let c = Candidate::new("4", 1, 1694498815, "198.51.100.3", 3478, CandidateType::ServerReflexive)
            .with_related("10.0.0.2", 50000);
        assert_eq!(
            c.to_attribute(),
            "candidate:4 1 udp 1694498815 198.51.100.3 3478 typ srflx raddr 10.0.0.2 rport 50000"
        );
    }

    #[test]
    fn test_rejects_malformed_candidates() {
        assert!(Candidate::parse("candidate:1 1 udp 1 10.0.0.1").is_err());
        assert!(Candidate::parse("candidate:1 1 udp 1 10.0.0.1 9 type host").is_err());
        assert!(Candidate::parse("candidate:1 x udp 1 10.0.0.1 9 typ host").is_err());
        assert!(Candidate::parse("candidate:1 1 udp 1 10.0.0.1 9 typ bogus").is_err());
        assert!(Candidate::parse("candidate:1 1 udp 1 10.0.0.1 9 typ host raddr").is_err());
    }

    #[test]
    fn test_candidate_type_parsing() {
        assert_eq!("host".parse::<CandidateType>().unwrap(), CandidateType::Host);
        assert_eq!("SRFLX".parse::<CandidateType>().unwrap(), CandidateType::ServerReflexive);
        assert_eq!("prflx".parse::<CandidateType>().unwrap(), CandidateType::PeerReflexive);
        assert_eq!("relay".parse::<CandidateType>().unwrap(), CandidateType::Relay);
        assert!("unknown".parse::<CandidateType>().is_err());
    }
}
