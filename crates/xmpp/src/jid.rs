use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{input}': {reason}")]
pub struct JidError {
    pub input: String,
    pub reason: String,
}

/// An XMPP address: `[localpart@]domain[/resource]`.
///
/// Parsing applies nodeprep, nameprep and resourceprep, so two addresses
/// that a server would treat as the same compare equal here.
#[derive(Debug, Clone)]
pub struct Jid(::jid::Jid);

impl Jid {
    pub fn parse(input: &str) -> Result<Self, JidError> {
        ::jid::Jid::new(input.trim()).map(Jid).map_err(|e| JidError {
            input: input.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn from_parts(
        local: Option<&str>,
        domain: &str,
        resource: Option<&str>,
    ) -> Result<Self, JidError> {
        let mut raw = String::new();
        if let Some(local) = local {
            raw.push_str(local);
            raw.push('@');
        }
        raw.push_str(domain);
        if let Some(resource) = resource {
            raw.push('/');
            raw.push_str(resource);
        }
        Self::parse(&raw)
    }

    pub fn local(&self) -> Option<&str> {
        self.0.node().map(|node| node.as_str())
    }

    pub fn domain(&self) -> &str {
        self.0.domain().as_str()
    }

    pub fn resource(&self) -> Option<&str> {
        self.0.resource().map(|resource| resource.as_str())
    }

    pub fn is_bare(&self) -> bool {
        self.0.resource().is_none()
    }

    pub fn to_bare(&self) -> Jid {
        Jid(self.0.to_bare().into())
    }

    pub fn with_resource(&self, resource: &str) -> Result<Jid, JidError> {
        Self::from_parts(self.local(), self.domain(), Some(resource))
    }

    /// Whether both addresses share localpart and domain.
    pub fn bare_eq(&self, other: &Jid) -> bool {
        self.local() == other.local() && self.domain() == other.domain()
    }

    /// The `localpart@domain` form as a string.
    pub fn bare_string(&self) -> String {
        self.0.to_bare().to_string()
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl PartialEq for Jid {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for Jid {}

impl Hash for Jid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl PartialOrd for Jid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Jid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Jid::parse(s)
    }
}
