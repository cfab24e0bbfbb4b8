//! The XML tree every stanza is built on is [`minidom::Element`]; this
//! module adds the few helpers the engine needs on top of it.

pub use minidom::{Element, ElementBuilder, Node};

use crate::codec;
use crate::error::XmppError;

pub trait ElementExt {
    /// Text of the named child, if the child exists.
    fn child_text(&self, name: &str, ns: &str) -> Option<String>;

    /// First child with the given local name, whatever its namespace.
    fn child_named(&self, name: &str) -> Option<&Element>;

    fn to_xml(&self) -> Result<String, XmppError>;
}

impl ElementExt for Element {
    fn child_text(&self, name: &str, ns: &str) -> Option<String> {
        self.get_child(name, ns).map(Element::text)
    }

    fn child_named(&self, name: &str) -> Option<&Element> {
        self.children().find(|child| child.name() == name)
    }

    fn to_xml(&self) -> Result<String, XmppError> {
        let mut out = Vec::new();
        self.write_to(&mut out).map_err(XmppError::xml)?;
        String::from_utf8(out).map_err(XmppError::xml)
    }
}

/// Parse one standalone element with the client stream's default namespace,
/// e.g. from a test fixture.
pub fn parse(xml: &str) -> Result<Element, XmppError> {
    codec::parse_fragment(xml.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster_set() -> Element {
        Element::builder("iq", "jabber:client")
            .attr("type", "set")
            .attr("id", "r1")
            .append(
                Element::builder("query", "jabber:iq:roster")
                    .append(
                        Element::builder("item", "jabber:iq:roster")
                            .attr("jid", "carol@example.com")
                            .attr("name", "it's <ok> & fine")
                            .append(
                                Element::builder("group", "jabber:iq:roster")
                                    .append("Friends & co")
                                    .build(),
                            )
                            .build(),
                    )
                    .build(),
            )
            .build()
    }

    #[test]
    fn reparses_serialized_output() {
        let original = roster_set();
        let parsed = parse(&original.to_xml().unwrap()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn unqualified_fixture_defaults_to_client_namespace() {
        let message = parse("<message><body>hi</body></message>").unwrap();
        assert!(message.is("message", "jabber:client"));
        assert_eq!(message.child_text("body", "jabber:client").as_deref(), Some("hi"));
        assert_eq!(message.child_text("subject", "jabber:client"), None);
    }

    #[test]
    fn child_named_ignores_namespace() {
        let iq = parse(
            "<iq type='error' id='1'><error type='cancel' xmlns='urn:other'>\
             <item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
        )
        .unwrap();
        let error = iq.child_named("error").unwrap();
        assert_eq!(error.attr("type"), Some("cancel"));
        assert!(iq.child_named("query").is_none());
    }
}
