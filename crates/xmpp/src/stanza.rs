use perch_core::event::{MessageType, PresenceShow};

use crate::element::Element;
use crate::error::{Condition, RemoteError, XmppError};
use crate::extensions::{Extension, ExtensionRegistry};
use crate::jid::Jid;
use crate::ns;

#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    Message(Message),
    Presence(Presence),
    Iq(Iq),
}

impl Stanza {
    /// Decode a top-level element; `Ok(None)` for non-stanza elements.
    pub fn decode(element: &Element) -> Result<Option<Self>, XmppError> {
        if element.ns() != ns::CLIENT {
            return Ok(None);
        }
        match element.name() {
            "message" => Message::from_element(element).map(|m| Some(Stanza::Message(m))),
            "presence" => Presence::from_element(element).map(|p| Some(Stanza::Presence(p))),
            "iq" => Iq::from_element(element).map(|iq| Some(Stanza::Iq(iq))),
            _ => Ok(None),
        }
    }
}

fn jid_attr(element: &Element, name: &str) -> Result<Option<Jid>, XmppError> {
    element
        .attr(name)
        .map(Jid::parse)
        .transpose()
        .map_err(XmppError::from)
}

fn stanza_element(name: &str, id: Option<&str>, from: Option<&Jid>, to: Option<&Jid>) -> Element {
    Element::builder(name, ns::CLIENT)
        .attr("id", id)
        .attr("from", from.map(Jid::to_string))
        .attr("to", to.map(Jid::to_string))
        .build()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Option<String>,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub kind: MessageType,
    pub body: Option<String>,
    pub subject: Option<String>,
    pub thread: Option<String>,
    /// Child elements other than body, subject and thread.
    pub payloads: Vec<Element>,
}

impl Message {
    pub fn new(kind: MessageType, to: Option<Jid>) -> Self {
        Self {
            id: None,
            from: None,
            to,
            kind,
            body: None,
            subject: None,
            thread: None,
            payloads: Vec::new(),
        }
    }

    pub fn chat(to: Jid, body: impl Into<String>) -> Self {
        Self::new(MessageType::Chat, Some(to)).with_body(body)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_payload(mut self, payload: Element) -> Self {
        self.payloads.push(payload);
        self
    }

    /// Decode payloads through the standard extension registry.
    pub fn extensions(&self) -> impl Iterator<Item = Extension> + '_ {
        let registry = ExtensionRegistry::standard();
        self.payloads.iter().map(move |p| registry.decode(p))
    }

    pub fn from_element(element: &Element) -> Result<Self, XmppError> {
        let mut message = Message {
            id: element.attr("id").map(str::to_string),
            from: jid_attr(element, "from")?,
            to: jid_attr(element, "to")?,
            kind: MessageType::parse(element.attr("type")),
            body: None,
            subject: None,
            thread: None,
            payloads: Vec::new(),
        };

        for child in element.children() {
            match (child.ns().as_str(), child.name()) {
                (ns::CLIENT, "body") => message.body = Some(child.text()),
                (ns::CLIENT, "subject") => message.subject = Some(child.text()),
                (ns::CLIENT, "thread") => message.thread = Some(child.text()),
                _ => message.payloads.push(child.clone()),
            }
        }
        Ok(message)
    }

    pub fn to_element(&self) -> Element {
        let mut element = stanza_element(
            "message",
            self.id.as_deref(),
            self.from.as_ref(),
            self.to.as_ref(),
        );
        if self.kind != MessageType::Normal {
            element.set_attr("type", self.kind.as_str());
        }
        for (name, value) in [
            ("subject", &self.subject),
            ("body", &self.body),
            ("thread", &self.thread),
        ] {
            if let Some(value) = value {
                element.append_child(Element::builder(name, ns::CLIENT).append(value.as_str()).build());
            }
        }
        for payload in &self.payloads {
            element.append_child(payload.clone());
        }
        element
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceType {
    Available,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Probe,
    Error,
}

impl PresenceType {
    pub fn parse(value: Option<&str>) -> Result<Self, XmppError> {
        Ok(match value {
            None => PresenceType::Available,
            Some("unavailable") => PresenceType::Unavailable,
            Some("subscribe") => PresenceType::Subscribe,
            Some("subscribed") => PresenceType::Subscribed,
            Some("unsubscribe") => PresenceType::Unsubscribe,
            Some("unsubscribed") => PresenceType::Unsubscribed,
            Some("probe") => PresenceType::Probe,
            Some("error") => PresenceType::Error,
            Some(other) => {
                return Err(XmppError::decode(format!("unknown presence type '{other}'")));
            }
        })
    }

    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            PresenceType::Available => None,
            PresenceType::Unavailable => Some("unavailable"),
            PresenceType::Subscribe => Some("subscribe"),
            PresenceType::Subscribed => Some("subscribed"),
            PresenceType::Unsubscribe => Some("unsubscribe"),
            PresenceType::Unsubscribed => Some("unsubscribed"),
            PresenceType::Probe => Some("probe"),
            PresenceType::Error => Some("error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Presence {
    pub id: Option<String>,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub kind: PresenceType,
    pub show: Option<PresenceShow>,
    pub status: Option<String>,
    pub priority: i8,
    pub payloads: Vec<Element>,
}

impl Presence {
    pub fn new(kind: PresenceType) -> Self {
        Self {
            id: None,
            from: None,
            to: None,
            kind,
            show: None,
            status: None,
            priority: 0,
            payloads: Vec::new(),
        }
    }

    pub fn to(mut self, to: Jid) -> Self {
        self.to = Some(to);
        self
    }

    pub fn with_payload(mut self, payload: Element) -> Self {
        self.payloads.push(payload);
        self
    }

    /// Effective availability: `Unavailable` for unavailable presences,
    /// otherwise the `<show/>` value.
    pub fn availability(&self) -> PresenceShow {
        match self.kind {
            PresenceType::Unavailable => PresenceShow::Unavailable,
            _ => self.show.unwrap_or(PresenceShow::Available),
        }
    }

    pub fn extensions(&self) -> impl Iterator<Item = Extension> + '_ {
        let registry = ExtensionRegistry::standard();
        self.payloads.iter().map(move |p| registry.decode(p))
    }

    pub fn from_element(element: &Element) -> Result<Self, XmppError> {
        let mut presence = Presence {
            id: element.attr("id").map(str::to_string),
            from: jid_attr(element, "from")?,
            to: jid_attr(element, "to")?,
            kind: PresenceType::parse(element.attr("type"))?,
            show: None,
            status: None,
            priority: 0,
            payloads: Vec::new(),
        };

        for child in element.children() {
            match (child.ns().as_str(), child.name()) {
                (ns::CLIENT, "show") => {
                    presence.show = Some(PresenceShow::from_show_text(child.text().trim()));
                }
                (ns::CLIENT, "status") => presence.status = Some(child.text()),
                (ns::CLIENT, "priority") => {
                    presence.priority = child.text().trim().parse().unwrap_or(0);
                }
                _ => presence.payloads.push(child.clone()),
            }
        }
        Ok(presence)
    }

    pub fn to_element(&self) -> Element {
        let mut element = stanza_element(
            "presence",
            self.id.as_deref(),
            self.from.as_ref(),
            self.to.as_ref(),
        );
        if let Some(kind) = self.kind.as_str() {
            element.set_attr("type", kind);
        }
        if let Some(show) = self.show.and_then(|show| show.show_text()) {
            element.append_child(Element::builder("show", ns::CLIENT).append(show).build());
        }
        if let Some(status) = &self.status {
            element.append_child(Element::builder("status", ns::CLIENT).append(status.as_str()).build());
        }
        if self.priority != 0 {
            element.append_child(
                Element::builder("priority", ns::CLIENT)
                    .append(self.priority.to_string())
                    .build(),
            );
        }
        for payload in &self.payloads {
            element.append_child(payload.clone());
        }
        element
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, IqType::Get | IqType::Set)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Iq {
    pub id: String,
    pub kind: IqType,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    /// First child other than `<error/>`.
    pub payload: Option<Element>,
    pub error: Option<Element>,
}

impl Iq {
    pub fn get(id: impl Into<String>, payload: Element) -> Self {
        Self::request(id, IqType::Get, payload)
    }

    pub fn set(id: impl Into<String>, payload: Element) -> Self {
        Self::request(id, IqType::Set, payload)
    }

    fn request(id: impl Into<String>, kind: IqType, payload: Element) -> Self {
        Self {
            id: id.into(),
            kind,
            from: None,
            to: None,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn to(mut self, to: Jid) -> Self {
        self.to = Some(to);
        self
    }

    /// An empty `result` answering `request`.
    pub fn result_for(request: &Iq) -> Self {
        Self {
            id: request.id.clone(),
            kind: IqType::Result,
            from: None,
            to: request.from.clone(),
            payload: None,
            error: None,
        }
    }

    /// An `error` answering `request` with a stanza error condition.
    pub fn error_for(request: &Iq, condition: Condition) -> Self {
        let error = Element::builder("error", ns::CLIENT)
            .attr("type", condition.default_type().as_str())
            .append(Element::bare(condition.as_str(), ns::STANZAS))
            .build();
        Self {
            id: request.id.clone(),
            kind: IqType::Error,
            from: None,
            to: request.from.clone(),
            payload: None,
            error: Some(error),
        }
    }

    pub fn remote_error(&self) -> RemoteError {
        match &self.error {
            Some(error) => RemoteError::from_error_element(error),
            None => RemoteError::from_stanza(&self.to_element()),
        }
    }

    pub fn payload_is(&self, name: &str, ns: &str) -> bool {
        self.payload.as_ref().is_some_and(|p| p.is(name, ns))
    }

    pub fn from_element(element: &Element) -> Result<Self, XmppError> {
        let id = element
            .attr("id")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| XmppError::decode("iq without id"))?
            .to_string();
        let kind = match element.attr("type") {
            Some("get") => IqType::Get,
            Some("set") => IqType::Set,
            Some("result") => IqType::Result,
            Some("error") => IqType::Error,
            other => {
                return Err(XmppError::decode(format!(
                    "iq '{id}' with invalid type {other:?}"
                )));
            }
        };

        let mut payload = None;
        let mut error = None;
        for child in element.children() {
            if child.name() == "error" && child.ns() == ns::CLIENT {
                error = Some(child.clone());
            } else if payload.is_none() {
                payload = Some(child.clone());
            }
        }

        Ok(Iq {
            id,
            kind,
            from: jid_attr(element, "from")?,
            to: jid_attr(element, "to")?,
            payload,
            error,
        })
    }

    pub fn to_element(&self) -> Element {
        let mut element = stanza_element(
            "iq",
            Some(&self.id),
            self.from.as_ref(),
            self.to.as_ref(),
        );
        element.set_attr("type", self.kind.as_str());
        if let Some(payload) = &self.payload {
            element.append_child(payload.clone());
        }
        if let Some(error) = &self.error {
            element.append_child(error.clone());
        }
        element
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::element::{self, ElementExt};

    fn decode(xml: &str) -> Stanza {
        Stanza::decode(&element::parse(xml).unwrap())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn decodes_message_fields_and_payloads() {
        let stanza = decode(
            "<message xmlns='jabber:client' from='bob@example.com/pc' to='alice@example.com' \
               type='chat' id='m1'><body>hello</body><thread>t1</thread>\
               <request xmlns='urn:xmpp:receipts'/></message>",
        );
        assert_matches!(stanza, Stanza::Message(message) => {
            assert_eq!(message.id.as_deref(), Some("m1"));
            assert_eq!(message.kind, MessageType::Chat);
            assert_eq!(message.body.as_deref(), Some("hello"));
            assert_eq!(message.thread.as_deref(), Some("t1"));
            assert_eq!(message.from.unwrap().resource(), Some("pc"));
            assert_eq!(message.payloads.len(), 1);
        });
    }

    #[test]
    fn decodes_presence() {
        let stanza = decode(
            "<presence xmlns='jabber:client' from='bob@example.com/pc'>\
               <show>dnd</show><status>busy</status><priority>5</priority></presence>",
        );
        assert_matches!(stanza, Stanza::Presence(presence) => {
            assert_eq!(presence.kind, PresenceType::Available);
            assert_eq!(presence.availability(), PresenceShow::Dnd);
            assert_eq!(presence.status.as_deref(), Some("busy"));
            assert_eq!(presence.priority, 5);
        });
    }

    #[test]
    fn unavailable_presence_overrides_show() {
        let stanza = decode("<presence xmlns='jabber:client' type='unavailable'><show>away</show></presence>");
        assert_matches!(stanza, Stanza::Presence(p) if p.availability() == PresenceShow::Unavailable);
    }

    #[test]
    fn iq_without_id_is_rejected() {
        let element = element::parse("<iq xmlns='jabber:client' type='get'/>").unwrap();
        assert!(Stanza::decode(&element).is_err());
    }

    #[test]
    fn non_stanza_elements_decode_to_none() {
        let element = element::parse("<r xmlns='urn:xmpp:sm:3'/>").unwrap();
        assert_eq!(Stanza::decode(&element).unwrap(), None);
    }

    #[test]
    fn error_reply_carries_condition() {
        let request = match decode("<iq xmlns='jabber:client' type='get' id='q1' from='server.example'><query xmlns='urn:example'/></iq>") {
            Stanza::Iq(iq) => iq,
            other => panic!("unexpected {other:?}"),
        };
        let reply = Iq::error_for(&request, Condition::ServiceUnavailable).to_element();
        assert_eq!(reply.attr("type"), Some("error"));
        assert_eq!(reply.attr("id"), Some("q1"));
        assert_eq!(reply.attr("to"), Some("server.example"));
        let error = reply.get_child("error", ns::CLIENT).unwrap();
        assert_eq!(error.attr("type"), Some("cancel"));
        assert!(error.has_child("service-unavailable", ns::STANZAS));
        assert!(reply.get_child("query", "urn:example").is_none());

        let decoded = assert_matches!(Stanza::decode(&reply), Ok(Some(Stanza::Iq(iq))) => iq);
        assert_eq!(decoded.remote_error().condition, Some(Condition::ServiceUnavailable));
    }

    #[test]
    fn message_encoding_omits_normal_type() {
        let message = Message::new(MessageType::Normal, Some(Jid::parse("b@example.com").unwrap()))
            .with_id("x1")
            .with_body("hey");
        let element = message.to_element();
        assert!(element.is("message", ns::CLIENT));
        assert_eq!(element.attr("type"), None);
        assert_eq!(element.attr("from"), None);
        assert_eq!(element.attr("to"), Some("b@example.com"));
        assert_eq!(element.child_text("body", ns::CLIENT).as_deref(), Some("hey"));

        let reparsed = element::parse(&element.to_xml().unwrap()).unwrap();
        assert_eq!(Message::from_element(&reparsed).unwrap(), message);
    }
}
