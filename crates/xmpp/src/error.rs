use std::fmt;

use crate::element::{self, Element, ElementExt};
use crate::jid::JidError;
use crate::ns;

pub type Result<T> = std::result::Result<T, XmppError>;

#[derive(Debug, thiserror::Error)]
pub enum XmppError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("{0}")]
    Remote(RemoteError),

    #[error("query timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("not connected")]
    NotConnected,

    #[error("query id {0} is already pending")]
    DuplicateQueryId(String),

    #[error("not in room {0}")]
    UnknownRoom(String),

    #[error("xml error: {0}")]
    Xml(String),

    #[error("invalid stanza: {0}")]
    Decode(String),

    #[error("invalid jid: {0}")]
    Jid(#[from] JidError),
}

impl XmppError {
    pub(crate) fn xml(message: impl fmt::Display) -> Self {
        XmppError::Xml(message.to_string())
    }

    pub(crate) fn decode(message: impl Into<String>) -> Self {
        XmppError::Decode(message.into())
    }

    /// Whether reconnecting later may succeed without user intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            XmppError::Transport(_) | XmppError::Timeout | XmppError::Xml(_) => true,
            XmppError::Negotiation(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Whether the user should be asked for a new password.
    pub fn needs_credentials(&self) -> bool {
        matches!(
            self,
            XmppError::Negotiation(NegotiationError::AuthenticationFailed { .. })
        )
    }

    /// The remote condition, if this is a remote error.
    pub fn condition(&self) -> Option<Condition> {
        match self {
            XmppError::Remote(err) => err.condition,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    #[error("server does not offer STARTTLS")]
    TlsUnavailable,

    #[error("server requires TLS but it is disabled for this account")]
    TlsRequiredByServer,

    #[error("TLS negotiation failed: {0}")]
    TlsFailed(String),

    #[error("no supported SASL mechanism (offered: {})", .0.join(", "))]
    MechanismUnsupported(Vec<String>),

    #[error("authentication failed: {condition}{}", text_suffix(.text))]
    AuthenticationFailed {
        condition: String,
        text: Option<String>,
    },

    #[error("resource binding failed: {0}")]
    BindFailed(String),

    #[error("session establishment failed: {0}")]
    SessionFailed(String),

    #[error("stream error: {condition}{}", text_suffix(.text))]
    StreamError {
        condition: String,
        text: Option<String>,
    },

    #[error("stream closed during negotiation")]
    UnexpectedClose,

    #[error("unexpected <{0}/> during negotiation")]
    UnexpectedElement(String),
}

impl NegotiationError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            NegotiationError::TlsFailed(_)
                | NegotiationError::StreamError { .. }
                | NegotiationError::UnexpectedClose
                | NegotiationError::SessionFailed(_)
        )
    }
}

fn text_suffix(text: &Option<String>) -> String {
    match text {
        Some(text) => format!(" ({text})"),
        None => String::new(),
    }
}

/// The `type` attribute of a stanza `<error/>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Auth,
    Cancel,
    Continue,
    Modify,
    Wait,
    Unknown,
}

impl ErrorType {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("auth") => ErrorType::Auth,
            Some("cancel") => ErrorType::Cancel,
            Some("continue") => ErrorType::Continue,
            Some("modify") => ErrorType::Modify,
            Some("wait") => ErrorType::Wait,
            _ => ErrorType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Auth => "auth",
            ErrorType::Cancel => "cancel",
            ErrorType::Continue => "continue",
            ErrorType::Modify => "modify",
            ErrorType::Wait => "wait",
            ErrorType::Unknown => "unknown",
        }
    }
}

/// Stanza error conditions this client recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    ItemNotFound,
    NotAllowed,
    NotAuthorized,
    ServiceUnavailable,
    RemoteServerNotFound,
    InternalServerError,
    RecipientUnavailable,
    ResourceConstraint,
}

impl Condition {
    pub const ALL: [Condition; 12] = [
        Condition::BadRequest,
        Condition::Conflict,
        Condition::FeatureNotImplemented,
        Condition::Forbidden,
        Condition::ItemNotFound,
        Condition::NotAllowed,
        Condition::NotAuthorized,
        Condition::ServiceUnavailable,
        Condition::RemoteServerNotFound,
        Condition::InternalServerError,
        Condition::RecipientUnavailable,
        Condition::ResourceConstraint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::BadRequest => "bad-request",
            Condition::Conflict => "conflict",
            Condition::FeatureNotImplemented => "feature-not-implemented",
            Condition::Forbidden => "forbidden",
            Condition::ItemNotFound => "item-not-found",
            Condition::NotAllowed => "not-allowed",
            Condition::NotAuthorized => "not-authorized",
            Condition::ServiceUnavailable => "service-unavailable",
            Condition::RemoteServerNotFound => "remote-server-not-found",
            Condition::InternalServerError => "internal-server-error",
            Condition::RecipientUnavailable => "recipient-unavailable",
            Condition::ResourceConstraint => "resource-constraint",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == value)
    }

    /// Default error type paired with the condition when we generate one.
    pub fn default_type(&self) -> ErrorType {
        match self {
            Condition::BadRequest => ErrorType::Modify,
            Condition::NotAllowed | Condition::Forbidden | Condition::NotAuthorized => {
                ErrorType::Auth
            }
            Condition::ResourceConstraint | Condition::RecipientUnavailable => ErrorType::Wait,
            _ => ErrorType::Cancel,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An `<error/>` returned by the server or a peer for one of our stanzas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: ErrorType,
    pub condition: Option<Condition>,
    pub text: Option<String>,
}

impl RemoteError {
    /// Extract an error from a stanza's `<error/>` child.
    ///
    /// Falls back to scanning the serialized stanza for a known condition
    /// token when the error element is missing or uses a foreign namespace.
    pub fn from_stanza(stanza: &Element) -> Self {
        Self::scan(stanza.child_named("error"), stanza)
    }

    /// Extract from a detached `<error/>` element.
    pub fn from_error_element(error: &Element) -> Self {
        Self::scan(Some(error), error)
    }

    fn scan(error: Option<&Element>, raw: &Element) -> Self {
        let kind = ErrorType::parse(error.and_then(|e| e.attr("type")));

        let condition = error
            .and_then(|e| {
                e.children()
                    .find_map(|child| Condition::parse(child.name()))
            })
            .or_else(|| {
                let raw = raw.to_xml().ok()?;
                Condition::ALL
                    .into_iter()
                    .find(|c| raw.contains(c.as_str()))
            });

        let text = error
            .and_then(|e| e.get_child("text", ns::STANZAS))
            .map(|t| t.text())
            .filter(|t| !t.is_empty());

        Self {
            kind,
            condition,
            text,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.condition {
            Some(condition) => write!(f, "remote error: {condition} ({})", self.kind.as_str())?,
            None => write!(f, "unknown remote error ({})", self.kind.as_str())?,
        }
        if let Some(text) = &self.text {
            write!(f, ": {text}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}

impl From<RemoteError> for XmppError {
    fn from(err: RemoteError) -> Self {
        XmppError::Remote(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(xml: &str) -> Element {
        element::parse(xml).unwrap()
    }

    #[test]
    fn extracts_condition_type_and_text() {
        let iq = parse(
            "<iq xmlns='jabber:client' type='error' id='1'>\
               <error type='cancel'>\
                 <item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
                 <text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>no such room</text>\
               </error>\
             </iq>",
        );
        let err = RemoteError::from_stanza(&iq);
        assert_eq!(err.kind, ErrorType::Cancel);
        assert_eq!(err.condition, Some(Condition::ItemNotFound));
        assert_eq!(err.text.as_deref(), Some("no such room"));
        assert_eq!(
            err.to_string(),
            "remote error: item-not-found (cancel): no such room"
        );
    }

    #[test]
    fn unknown_condition_is_reported_generically() {
        let iq = parse("<iq xmlns='jabber:client' type='error' id='1'><error type='wait'><x-custom xmlns='urn:example'/></error></iq>");
        let err = RemoteError::from_stanza(&iq);
        assert_eq!(err.kind, ErrorType::Wait);
        assert_eq!(err.condition, None);
        assert_eq!(err.to_string(), "unknown remote error (wait)");
    }

    #[test]
    fn retryable_and_credential_classification() {
        let auth = XmppError::Negotiation(NegotiationError::AuthenticationFailed {
            condition: "not-authorized".into(),
            text: None,
        });
        assert!(auth.needs_credentials());
        assert!(!auth.is_retryable());

        let io = XmppError::Transport(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(io.is_retryable());
        assert!(!io.needs_credentials());

        assert!(!XmppError::Negotiation(NegotiationError::TlsUnavailable).is_retryable());
        assert!(XmppError::Negotiation(NegotiationError::UnexpectedClose).is_retryable());
        assert!(XmppError::Timeout.is_retryable());
    }
}
