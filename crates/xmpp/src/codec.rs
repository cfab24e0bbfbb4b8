//! Incremental tokenizer for the unbounded XMPP stream.
//!
//! Bytes are appended with [`StreamParser::feed`] and complete top-level
//! items are pulled with [`StreamParser::next_item`]. Framing runs first on
//! the raw buffer to find where a top-level element ends; only complete
//! fragments are then built into namespace-resolved [`Element`] trees.
//! A fragment that frames correctly but cannot be built is reported as
//! [`StreamItem::Invalid`] and the stream carries on.

use std::collections::HashMap;

use quick_xml::Reader;
use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use tracing::trace;

use crate::element::Element;
use crate::error::XmppError;
use crate::ns;

/// Upper bound on a single buffered top-level element.
pub const MAX_STANZA_BYTES: usize = 1024 * 1024;

/// Attributes of a received `<stream:stream>` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Open(StreamHeader),
    Element(Element),
    /// A well-framed top-level element that failed to decode.
    Invalid(String),
    Close,
}

#[derive(Debug, Clone)]
struct Scope {
    default_ns: String,
    prefixes: HashMap<String, String>,
}

impl Scope {
    fn stream_default() -> Self {
        let mut prefixes = HashMap::new();
        prefixes.insert("stream".to_string(), ns::STREAM.to_string());
        Self {
            default_ns: ns::CLIENT.to_string(),
            prefixes,
        }
    }

    fn resolve(&self, prefix: Option<&str>) -> Result<String, XmppError> {
        match prefix {
            None => Ok(self.default_ns.clone()),
            Some("xml") => Ok("http://www.w3.org/XML/1998/namespace".to_string()),
            Some(prefix) => self
                .prefixes
                .get(prefix)
                .cloned()
                .ok_or_else(|| XmppError::xml(format!("undeclared namespace prefix '{prefix}'"))),
        }
    }
}

enum Frame {
    Open { header: StreamHeader, scope: Scope, end: usize },
    Element { start: usize, end: usize },
    Close { end: usize },
}

/// How far framing got through the buffered bytes of a partial element.
#[derive(Debug, Clone, Copy, Default)]
struct Scan {
    resume: usize,
    depth: u32,
    element_start: usize,
}

pub struct StreamParser {
    buffer: Vec<u8>,
    scope: Scope,
    scan: Scan,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            scope: Scope::stream_default(),
            scan: Scan::default(),
        }
    }

    /// Forget the current stream; used on stream restarts after TLS and SASL.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scope = Scope::stream_default();
        self.scan = Scan::default();
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pull the next complete item, or `None` if more bytes are needed.
    ///
    /// An error means the stream framing is broken and the stream cannot
    /// continue.
    pub fn next_item(&mut self) -> Result<Option<StreamItem>, XmppError> {
        if self.scan.resume == 0 {
            let leading = self
                .buffer
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            if leading > 0 {
                self.buffer.drain(..leading);
            }
        }
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let frame = match frame(&self.buffer, &mut self.scan)? {
            Some(frame) => frame,
            None => {
                if self.buffer.len() > MAX_STANZA_BYTES {
                    return Err(XmppError::xml(format!(
                        "top-level element exceeds {MAX_STANZA_BYTES} bytes"
                    )));
                }
                return Ok(None);
            }
        };
        self.scan = Scan::default();

        match frame {
            Frame::Open { header, scope, end } => {
                self.scope = scope;
                self.buffer.drain(..end);
                Ok(Some(StreamItem::Open(header)))
            }
            Frame::Close { end } => {
                self.buffer.drain(..end);
                Ok(Some(StreamItem::Close))
            }
            Frame::Element { start, end } => {
                let fragment = &self.buffer[start..end];
                if tracing::enabled!(tracing::Level::TRACE) {
                    trace!(xml = %String::from_utf8_lossy(fragment), "recv");
                }
                let item = match build_element(fragment, &self.scope) {
                    Ok(element) => StreamItem::Element(element),
                    Err(e) => StreamItem::Invalid(e.to_string()),
                };
                self.buffer.drain(..end);
                Ok(Some(item))
            }
        }
    }
}

/// Parse one standalone element with the client stream's default scope.
pub fn parse_fragment(bytes: &[u8]) -> Result<Element, XmppError> {
    build_element(bytes, &Scope::stream_default())
}

fn is_stream_tag(start: &BytesStart<'_>) -> bool {
    start.name().as_ref() == b"stream:stream" || start.name().local_name().as_ref() == b"stream"
}

/// Find the next top-level item, resuming from `scan`.
///
/// The reader starts at `scan.resume`, so end tags of elements opened in an
/// earlier call show up as unmatched; `allow_unmatched_ends` lets them
/// through and the depth counter does the matching. The same setting turns
/// `</stream:stream>` into a plain end event at depth zero.
fn frame(buffer: &[u8], scan: &mut Scan) -> Result<Option<Frame>, XmppError> {
    let base = scan.resume;
    let mut reader = Reader::from_reader(&buffer[base..]);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;
    reader.config_mut().allow_unmatched_ends = true;

    loop {
        let pos = base + reader.buffer_position() as usize;
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(quick_xml::Error::Syntax(
                SyntaxError::UnclosedTag
                | SyntaxError::UnclosedCData
                | SyntaxError::UnclosedComment
                | SyntaxError::UnclosedPIOrXmlDecl
                | SyntaxError::UnclosedDoctype,
            )) => return Ok(None),
            Err(err) => return Err(XmppError::xml(err)),
        };
        let end = base + reader.buffer_position() as usize;

        match event {
            Event::Start(start) if scan.depth == 0 => {
                if is_stream_tag(&start) {
                    let (header, scope) = read_stream_header(&start)?;
                    return Ok(Some(Frame::Open { header, scope, end }));
                }
                scan.element_start = pos;
                scan.depth = 1;
            }
            Event::Start(_) => scan.depth += 1,
            Event::Empty(_) if scan.depth == 0 => {
                return Ok(Some(Frame::Element { start: pos, end }));
            }
            Event::End(_) if scan.depth == 0 => return Ok(Some(Frame::Close { end })),
            Event::End(_) => {
                scan.depth -= 1;
                if scan.depth == 0 {
                    return Ok(Some(Frame::Element {
                        start: scan.element_start,
                        end,
                    }));
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
        if scan.depth > 0 {
            scan.resume = end;
        }
    }
}

fn read_stream_header(start: &BytesStart<'_>) -> Result<(StreamHeader, Scope), XmppError> {
    let mut header = StreamHeader::default();
    let mut scope = Scope::stream_default();

    for attr in start.attributes() {
        let attr = attr.map_err(XmppError::xml)?;
        let key = std::str::from_utf8(attr.key.as_ref()).map_err(XmppError::xml)?;
        let value = attr.unescape_value().map_err(XmppError::xml)?.into_owned();
        match key {
            "xmlns" => scope.default_ns = value,
            "id" => header.id = Some(value),
            "from" => header.from = Some(value),
            "to" => header.to = Some(value),
            "version" => header.version = Some(value),
            _ => {
                if let Some(prefix) = key.strip_prefix("xmlns:") {
                    scope.prefixes.insert(prefix.to_string(), value);
                }
            }
        }
    }
    Ok((header, scope))
}

fn open_element(start: &BytesStart<'_>, parent: &Scope) -> Result<(Element, Scope), XmppError> {
    let mut scope = parent.clone();
    let mut attrs = Vec::new();

    for attr in start.attributes() {
        let attr = attr.map_err(XmppError::xml)?;
        let key = std::str::from_utf8(attr.key.as_ref()).map_err(XmppError::xml)?;
        let value = attr.unescape_value().map_err(XmppError::xml)?.into_owned();
        if key == "xmlns" {
            scope.default_ns = value;
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            scope.prefixes.insert(prefix.to_string(), value);
        } else {
            attrs.push((key.to_string(), value));
        }
    }

    let qname = std::str::from_utf8(start.name().as_ref())
        .map_err(XmppError::xml)?
        .to_string();
    let (prefix, local) = match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname.as_str()),
    };
    let mut element = Element::bare(local, scope.resolve(prefix)?);
    for (key, value) in attrs {
        element.set_attr(key, value);
    }
    Ok((element, scope))
}

fn build_element(bytes: &[u8], root: &Scope) -> Result<Element, XmppError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<(Element, Scope)> = Vec::new();

    loop {
        match reader.read_event().map_err(XmppError::xml)? {
            Event::Start(start) => {
                let parent = stack.last().map(|(_, scope)| scope).unwrap_or(root);
                let opened = open_element(&start, parent)?;
                stack.push(opened);
            }
            Event::Empty(start) => {
                let parent = stack.last().map(|(_, scope)| scope).unwrap_or(root);
                let (element, _) = open_element(&start, parent)?;
                match stack.last_mut() {
                    Some((parent, _)) => {
                        parent.append_child(element);
                    }
                    None => return Ok(element),
                }
            }
            Event::End(_) => {
                let (element, _) = stack
                    .pop()
                    .ok_or_else(|| XmppError::xml("unbalanced end tag"))?;
                match stack.last_mut() {
                    Some((parent, _)) => {
                        parent.append_child(element);
                    }
                    None => return Ok(element),
                }
            }
            Event::Text(text) => {
                if let Some((parent, _)) = stack.last_mut() {
                    let text = text.unescape().map_err(XmppError::xml)?;
                    if !text.is_empty() {
                        parent.append_text_node(text.into_owned());
                    }
                }
            }
            Event::CData(cdata) => {
                if let Some((parent, _)) = stack.last_mut() {
                    parent.append_text_node(String::from_utf8_lossy(&cdata).into_owned());
                }
            }
            Event::Eof => return Err(XmppError::xml("element ended prematurely")),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::element::ElementExt;

    const HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' id='s1' from='example.com' version='1.0'>";

    fn drain(parser: &mut StreamParser) -> Vec<StreamItem> {
        let mut items = Vec::new();
        while let Some(item) = parser.next_item().unwrap() {
            items.push(item);
        }
        items
    }

    #[test]
    fn parses_header_features_and_close() {
        let mut parser = StreamParser::new();
        parser.feed(HEADER.as_bytes());
        parser.feed(b"<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>");
        parser.feed(b"</stream:stream>");

        let items = drain(&mut parser);
        assert_eq!(items.len(), 3);
        assert_matches!(&items[0], StreamItem::Open(header) if header.id.as_deref() == Some("s1"));
        assert_matches!(&items[1], StreamItem::Element(features) => {
            assert!(features.is("features", ns::STREAM));
            assert!(features.has_child("bind", ns::BIND));
        });
        assert_matches!(items[2], StreamItem::Close);
    }

    #[test]
    fn stanza_split_at_every_byte_boundary() {
        let stanza = "<message from='a@example.com/x' to='b@example.com' type='chat' id='m1'>\
            <body>caf\u{e9} &amp; cr\u{e8}me</body></message>";

        for split in 1..stanza.len() {
            let mut parser = StreamParser::new();
            parser.feed(HEADER.as_bytes());
            assert_matches!(parser.next_item().unwrap(), Some(StreamItem::Open(_)));

            let bytes = stanza.as_bytes();
            parser.feed(&bytes[..split]);
            assert_eq!(parser.next_item().unwrap(), None, "split at {split}");
            parser.feed(&bytes[split..]);

            let item = parser.next_item().unwrap();
            assert_matches!(item, Some(StreamItem::Element(message)) => {
                assert_eq!(message.ns(), ns::CLIENT);
                assert_eq!(message.child_text("body", ns::CLIENT).as_deref(), Some("caf\u{e9} & cr\u{e8}me"));
            });
        }
    }

    #[test]
    fn several_stanzas_in_one_read() {
        let mut parser = StreamParser::new();
        parser.feed(HEADER.as_bytes());
        parser.feed(b"<presence/> \n<iq type='result' id='1'/><message><body>x</body></message>");
        let items = drain(&mut parser);
        assert_eq!(items.len(), 4);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn whitespace_keepalive_is_ignored() {
        let mut parser = StreamParser::new();
        parser.feed(HEADER.as_bytes());
        parser.next_item().unwrap();
        parser.feed(b" \n ");
        assert_eq!(parser.next_item().unwrap(), None);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn resolves_nested_namespaces_and_prefixes() {
        let mut parser = StreamParser::new();
        parser.feed(HEADER.as_bytes());
        parser.feed(
            b"<message><received xmlns='urn:xmpp:carbons:2'><forwarded xmlns='urn:xmpp:forward:0'>\
              <message xmlns='jabber:client' from='x@y/z'><body>inner</body></message>\
              </forwarded></received></message>",
        );
        let items = drain(&mut parser);
        assert_matches!(&items[1], StreamItem::Element(message) => {
            let inner = message
                .get_child("received", ns::CARBONS)
                .and_then(|r| r.get_child("forwarded", ns::FORWARD))
                .and_then(|f| f.get_child("message", ns::CLIENT))
                .unwrap();
            assert_eq!(inner.attr("from"), Some("x@y/z"));
            assert_eq!(inner.child_text("body", ns::CLIENT).as_deref(), Some("inner"));
        });
    }

    #[test]
    fn stream_error_uses_stream_prefix() {
        let mut parser = StreamParser::new();
        parser.feed(HEADER.as_bytes());
        parser.feed(
            b"<stream:error><host-unknown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>",
        );
        let items = drain(&mut parser);
        assert_matches!(&items[1], StreamItem::Element(error) => {
            assert!(error.is("error", ns::STREAM));
        });
    }

    #[test]
    fn broken_framing_is_an_error() {
        let mut parser = StreamParser::new();
        parser.feed(HEADER.as_bytes());
        parser.next_item().unwrap();
        parser.feed(b"<!oops>");
        assert!(parser.next_item().is_err());
    }

    #[test]
    fn undecodable_stanza_is_reported_and_stream_continues() {
        let mut parser = StreamParser::new();
        parser.feed(HEADER.as_bytes());
        parser.feed(b"<message><body>&bogus;</body></message>");
        parser.feed(b"<foo:bar/>");
        parser.feed(b"<message><body>x</wrong></message>");
        parser.feed(b"<presence from='bob@example.com/pc'/>");

        let items = drain(&mut parser);
        assert_eq!(items.len(), 5);
        assert_matches!(&items[1], StreamItem::Invalid(reason) if reason.contains("bogus"));
        assert_matches!(&items[2], StreamItem::Invalid(reason) if reason.contains("foo"));
        assert_matches!(&items[3], StreamItem::Invalid(_));
        assert_matches!(&items[4], StreamItem::Element(presence) if presence.name() == "presence");
    }

    #[test]
    fn stream_close_after_partial_reads() {
        let mut parser = StreamParser::new();
        parser.feed(HEADER.as_bytes());
        parser.next_item().unwrap();
        parser.feed(b"</stream:");
        assert_eq!(parser.next_item().unwrap(), None);
        parser.feed(b"stream>");
        assert_eq!(parser.next_item().unwrap(), Some(StreamItem::Close));
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn partial_element_resumes_where_scanning_stopped() {
        let mut parser = StreamParser::new();
        parser.feed(HEADER.as_bytes());
        parser.next_item().unwrap();

        parser.feed(b"<message><body>first half");
        assert_eq!(parser.next_item().unwrap(), None);
        let resumed_at = parser.scan.resume;
        assert!(resumed_at > 0);

        parser.feed(b" and more</body><thread>t1");
        assert_eq!(parser.next_item().unwrap(), None);
        assert!(parser.scan.resume > resumed_at);
        assert_eq!(parser.scan.depth, 2);

        parser.feed(b"</thread></message>");
        assert_matches!(parser.next_item().unwrap(), Some(StreamItem::Element(message)) => {
            assert_eq!(message.child_text("body", ns::CLIENT).as_deref(), Some("first half and more"));
            assert_eq!(message.child_text("thread", ns::CLIENT).as_deref(), Some("t1"));
        });
        assert_eq!(parser.scan.resume, 0);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn reset_forgets_buffered_bytes() {
        let mut parser = StreamParser::new();
        parser.feed(b"<partial");
        parser.reset();
        assert_eq!(parser.buffered(), 0);
    }
}
