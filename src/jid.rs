//! Jabber addresses: `node@domain/resource`.

use std::fmt;
use std::str::FromStr;

/// A parsed Jabber ID. Node and resource are optional, domain is not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(node: Option<&str>, domain: &str, resource: Option<&str>) -> Self {
        Self {
            node: node.filter(|n| !n.is_empty()).map(str::to_lowercase),
            domain: domain.to_lowercase(),
            resource: resource.filter(|r| !r.is_empty()).map(str::to_string),
        }
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The address without its resource.
    pub fn bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn with_resource(&self, resource: &str) -> Jid {
        Jid::new(self.node.as_deref(), &self.domain, Some(resource))
    }

    pub fn is_full(&self) -> bool {
        self.resource.is_some()
    }
}

impl FromStr for Jid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // Resource may itself contain '@' or '/', so split it off first
        let (rest, resource) = match s.split_once('/') {
            Some((rest, res)) => (rest, Some(res)),
            None => (s, None),
        };
        let (node, domain) = match rest.split_once('@') {
            Some((node, domain)) => (Some(node), domain),
            None => (None, rest),
        };
        if domain.is_empty() {
            return Err(format!("invalid JID '{}': empty domain", s));
        }
        if node == Some("") {
            return Err(format!("invalid JID '{}': empty node", s));
        }
        Ok(Jid::new(node, domain, resource))
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{}@", node)?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}
