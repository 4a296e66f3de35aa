use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JidError {
    #[error("empty JID")]
    Empty,
    #[error("JID has an empty domain: {0}")]
    EmptyDomain(String),
    #[error("JID has an empty localpart: {0}")]
    EmptyLocal(String),
    #[error("JID has an empty resource: {0}")]
    EmptyResource(String),
}

/// An XMPP address: `[local@]domain[/resource]`.
///
/// A JID without a resource is *bare* and names an account; with a resource
/// it is *full* and names one connected endpoint (device) of that account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Jid {
    pub local: Option<String>,
    pub domain: String,
    pub resource: Option<String>,
}

impl Jid {
    pub fn new(local: &str, domain: &str) -> Self {
        Self {
            local: (!local.is_empty()).then(|| local.to_string()),
            domain: domain.to_string(),
            resource: None,
        }
    }

    pub fn with_resource(mut self, resource: &str) -> Self {
        self.resource = Some(resource.to_string());
        self
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    pub fn is_full(&self) -> bool {
        self.resource.is_some()
    }

    pub fn to_bare(&self) -> Self {
        Self {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// True when both addresses name the same account, ignoring resources.
    pub fn is_same_account_as(&self, other: &Jid) -> bool {
        self.local == other.local && self.domain.eq_ignore_ascii_case(&other.domain)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{local}@")?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(JidError::Empty);
        }

        // The resource may itself contain '@' and '/', so split it off first.
        let (address, resource) = match s.split_once('/') {
            Some((_, "")) => return Err(JidError::EmptyResource(s.to_string())),
            Some((a, r)) => (a, Some(r.to_string())),
            None => (s, None),
        };

        let (local, domain) = match address.split_once('@') {
            Some(("", _)) => return Err(JidError::EmptyLocal(s.to_string())),
            Some((l, d)) => (Some(l.to_string()), d),
            None => (None, address),
        };

        if domain.is_empty() {
            return Err(JidError::EmptyDomain(s.to_string()));
        }

        Ok(Jid {
            local,
            domain: domain.to_string(),
            resource,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_jid() {
        let jid: Jid = "juliet@capulet.lit/balcony".parse().unwrap();
        assert_eq!(jid.local.as_deref(), Some("juliet"));
        assert_eq!(jid.domain, "capulet.lit");
        assert_eq!(jid.resource.as_deref(), Some("balcony"));
        assert!(jid.is_full());
        assert_eq!(jid.to_string(), "juliet@capulet.lit/balcony");
    }

    #[test]
    fn test_parse_bare_and_domain_jids() {
        let bare: Jid = "romeo@montague.lit".parse().unwrap();
        assert!(bare.is_bare());
        assert_eq!(bare.to_string(), "romeo@montague.lit");

        let domain: Jid = "conference.montague.lit".parse().unwrap();
        assert_eq!(domain.local, None);
        assert_eq!(domain.domain, "conference.montague.lit");
    }

    #[test]
    fn test_resource_may_contain_separators() {
        let jid: Jid = "romeo@montague.lit/phone/at@home".parse().unwrap();
        assert_eq!(jid.resource.as_deref(), Some("phone/at@home"));
        assert_eq!(jid.domain, "montague.lit");
    }

    #[test]
    fn test_invalid_jids() {
        assert_eq!("".parse::<Jid>(), Err(JidError::Empty));
        assert!(matches!("@montague.lit".parse::<Jid>(), Err(JidError::EmptyLocal(_))));
        assert!(matches!("romeo@".parse::<Jid>(), Err(JidError::EmptyDomain(_))));
        assert!(matches!(
            "romeo@montague.lit/".parse::<Jid>(),
            Err(JidError::EmptyResource(_))
        ));
    }

    #[test]
    fn test_to_bare_and_account_comparison() {
        let phone: Jid = "romeo@montague.lit/phone".parse().unwrap();
        let laptop: Jid = "romeo@Montague.lit/laptop".parse().unwrap();
        assert_eq!(phone.to_bare(), "romeo@montague.lit".parse().unwrap());
        assert!(phone.is_same_account_as(&laptop));
        assert_ne!(phone, laptop);
    }
}
