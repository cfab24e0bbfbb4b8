//! Namespace URIs, exactly as servers expect them.

pub const CLIENT: &str = "jabber:client";
pub const STREAM: &str = "http://etherx.jabber.org/streams";
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
pub const STREAMS_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

pub const ROSTER: &str = "jabber:iq:roster";
pub const RECEIPTS: &str = "urn:xmpp:receipts";
pub const CHAT_MARKERS: &str = "urn:xmpp:chat-markers:0";
pub const CARBONS: &str = "urn:xmpp:carbons:2";
pub const FORWARD: &str = "urn:xmpp:forward:0";
pub const CORRECTION: &str = "urn:xmpp:message-correct:0";
pub const REACTIONS: &str = "urn:xmpp:reactions:0";
pub const MAM: &str = "urn:xmpp:mam:2";
pub const RSM: &str = "http://jabber.org/protocol/rsm";
pub const DATA_FORMS: &str = "jabber:x:data";
pub const DELAY: &str = "urn:xmpp:delay";
pub const PING: &str = "urn:xmpp:ping";
pub const HINTS: &str = "urn:xmpp:hints";

pub const MUC: &str = "http://jabber.org/protocol/muc";
pub const MUC_USER: &str = "http://jabber.org/protocol/muc#user";
pub const MUC_OWNER: &str = "http://jabber.org/protocol/muc#owner";

pub const OMEMO: &str = "eu.siacs.conversations.axolotl";
pub const EME: &str = "urn:xmpp:eme:0";
