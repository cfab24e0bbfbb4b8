//! Typed decoding of stanza payload elements.
//!
//! Known payloads decode into [`Extension`] through a registry keyed by
//! `(namespace, local name)`. Anything unregistered, or registered but
//! malformed, is kept as [`Extension::Unknown`].

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use perch_core::event::{MucAffiliation, MucRole};
use tracing::debug;

use crate::element::Element;
use crate::encryption::EncryptedEnvelope;
use crate::error::XmppError;
use crate::ns;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Received,
    Displayed,
    Acknowledged,
}

impl MarkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerKind::Received => "received",
            MarkerKind::Displayed => "displayed",
            MarkerKind::Acknowledged => "acknowledged",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarbonDirection {
    Received,
    Sent,
}

/// A `<forwarded/>` wrapper: the inner message plus its optional delay stamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Forwarded {
    pub stamp: Option<DateTime<Utc>>,
    pub message: Element,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MucItem {
    pub affiliation: MucAffiliation,
    pub role: MucRole,
    pub jid: Option<String>,
    pub nick: Option<String>,
}

/// The `muc#user` payload of a room presence.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MucUser {
    pub items: Vec<MucItem>,
    pub statuses: Vec<u16>,
}

impl MucUser {
    pub const STATUS_SELF: u16 = 110;
    pub const STATUS_CREATED: u16 = 201;

    pub fn has_status(&self, code: u16) -> bool {
        self.statuses.contains(&code)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Extension {
    ReceiptRequest,
    ReceiptReceived { id: String },
    Markable,
    Marker { kind: MarkerKind, id: String },
    Correction { id: String },
    Reactions { id: String, emojis: Vec<String> },
    Carbon { direction: CarbonDirection, forwarded: Forwarded },
    ArchiveResult { query_id: Option<String>, id: String, forwarded: Forwarded },
    Delay { stamp: DateTime<Utc> },
    Encrypted(EncryptedEnvelope),
    MucUser(MucUser),
    Unknown(Element),
}

type Parser = fn(&Element) -> Result<Extension, XmppError>;

pub struct ExtensionRegistry {
    parsers: HashMap<&'static str, HashMap<&'static str, Parser>>,
}

impl ExtensionRegistry {
    pub fn empty() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    pub fn with_standard_parsers() -> Self {
        let mut registry = Self::empty();
        registry.register(ns::RECEIPTS, "request", |_| Ok(Extension::ReceiptRequest));
        registry.register(ns::RECEIPTS, "received", parse_receipt);
        registry.register(ns::CHAT_MARKERS, "markable", |_| Ok(Extension::Markable));
        registry.register(ns::CHAT_MARKERS, "received", parse_marker);
        registry.register(ns::CHAT_MARKERS, "displayed", parse_marker);
        registry.register(ns::CHAT_MARKERS, "acknowledged", parse_marker);
        registry.register(ns::CORRECTION, "replace", parse_correction);
        registry.register(ns::REACTIONS, "reactions", parse_reactions);
        registry.register(ns::CARBONS, "received", parse_carbon);
        registry.register(ns::CARBONS, "sent", parse_carbon);
        registry.register(ns::MAM, "result", parse_archive_result);
        registry.register(ns::DELAY, "delay", parse_delay);
        registry.register(ns::OMEMO, "encrypted", |el| {
            EncryptedEnvelope::from_element(el).map(Extension::Encrypted)
        });
        registry.register(ns::MUC_USER, "x", parse_muc_user);
        registry
    }

    /// The process-wide registry with every parser this crate ships.
    pub fn standard() -> &'static ExtensionRegistry {
        static STANDARD: OnceLock<ExtensionRegistry> = OnceLock::new();
        STANDARD.get_or_init(Self::with_standard_parsers)
    }

    pub fn register(&mut self, ns: &'static str, name: &'static str, parser: Parser) {
        self.parsers.entry(ns).or_default().insert(name, parser);
    }

    pub fn decode(&self, element: &Element) -> Extension {
        let parser = self
            .parsers
            .get(element.ns().as_str())
            .and_then(|by_name| by_name.get(element.name()));
        let Some(parser) = parser else {
            return Extension::Unknown(element.clone());
        };
        match parser(element) {
            Ok(extension) => extension,
            Err(e) => {
                debug!(name = element.name(), ns = %element.ns(), error = %e, "Malformed extension");
                Extension::Unknown(element.clone())
            }
        }
    }
}

fn required_attr(element: &Element, name: &str) -> Result<String, XmppError> {
    element
        .attr(name)
        .map(str::to_string)
        .ok_or_else(|| XmppError::decode(format!("<{}/> without '{name}'", element.name())))
}

pub(crate) fn parse_stamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|stamp| stamp.with_timezone(&Utc))
}

fn parse_receipt(element: &Element) -> Result<Extension, XmppError> {
    Ok(Extension::ReceiptReceived {
        id: required_attr(element, "id")?,
    })
}

fn parse_marker(element: &Element) -> Result<Extension, XmppError> {
    let kind = match element.name() {
        "received" => MarkerKind::Received,
        "displayed" => MarkerKind::Displayed,
        _ => MarkerKind::Acknowledged,
    };
    Ok(Extension::Marker {
        kind,
        id: required_attr(element, "id")?,
    })
}

fn parse_correction(element: &Element) -> Result<Extension, XmppError> {
    Ok(Extension::Correction {
        id: required_attr(element, "id")?,
    })
}

fn parse_reactions(element: &Element) -> Result<Extension, XmppError> {
    let emojis = element
        .children()
        .filter(|c| c.is("reaction", ns::REACTIONS))
        .map(Element::text)
        .filter(|text| !text.is_empty())
        .collect();
    Ok(Extension::Reactions {
        id: required_attr(element, "id")?,
        emojis,
    })
}

fn parse_forwarded(parent: &Element) -> Result<Forwarded, XmppError> {
    let forwarded = parent
        .get_child("forwarded", ns::FORWARD)
        .ok_or_else(|| XmppError::decode(format!("<{}/> without <forwarded/>", parent.name())))?;
    let message = forwarded
        .get_child("message", ns::CLIENT)
        .cloned()
        .ok_or_else(|| XmppError::decode("<forwarded/> without <message/>"))?;
    let stamp = forwarded
        .get_child("delay", ns::DELAY)
        .and_then(|delay| delay.attr("stamp"))
        .and_then(parse_stamp);
    Ok(Forwarded { stamp, message })
}

fn parse_carbon(element: &Element) -> Result<Extension, XmppError> {
    let direction = if element.name() == "sent" {
        CarbonDirection::Sent
    } else {
        CarbonDirection::Received
    };
    Ok(Extension::Carbon {
        direction,
        forwarded: parse_forwarded(element)?,
    })
}

fn parse_archive_result(element: &Element) -> Result<Extension, XmppError> {
    Ok(Extension::ArchiveResult {
        query_id: element.attr("queryid").map(str::to_string),
        id: required_attr(element, "id")?,
        forwarded: parse_forwarded(element)?,
    })
}

fn parse_delay(element: &Element) -> Result<Extension, XmppError> {
    let stamp = required_attr(element, "stamp")?;
    parse_stamp(&stamp)
        .map(|stamp| Extension::Delay { stamp })
        .ok_or_else(|| XmppError::decode(format!("invalid delay stamp '{stamp}'")))
}

fn parse_muc_user(element: &Element) -> Result<Extension, XmppError> {
    let mut user = MucUser::default();
    for child in element.children() {
        if child.is("item", ns::MUC_USER) {
            user.items.push(MucItem {
                affiliation: MucAffiliation::parse(child.attr("affiliation").unwrap_or("none")),
                role: MucRole::parse(child.attr("role").unwrap_or("none")),
                jid: child.attr("jid").map(str::to_string),
                nick: child.attr("nick").map(str::to_string),
            });
        } else if child.is("status", ns::MUC_USER) {
            if let Some(code) = child.attr("code").and_then(|code| code.parse().ok()) {
                user.statuses.push(code);
            }
        }
    }
    Ok(Extension::MucUser(user))
}

// Outgoing payload builders.

pub fn receipt_request() -> Element {
    Element::bare("request", ns::RECEIPTS)
}

pub fn receipt_received(id: &str) -> Element {
    Element::builder("received", ns::RECEIPTS)
        .attr("id", id)
        .build()
}

pub fn markable() -> Element {
    Element::bare("markable", ns::CHAT_MARKERS)
}

pub fn marker(kind: MarkerKind, id: &str) -> Element {
    Element::builder(kind.as_str(), ns::CHAT_MARKERS)
        .attr("id", id)
        .build()
}

pub fn store_hint() -> Element {
    Element::bare("store", ns::HINTS)
}

pub fn encryption_notice() -> Element {
    Element::builder("encryption", ns::EME)
        .attr("namespace", ns::OMEMO)
        .attr("name", "OMEMO")
        .build()
}
