//! In-memory fake server pieces for tests in this crate and downstream ones.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use perch_core::config::AccountConfig;
use tokio::sync::mpsc;

use crate::codec::StreamItem;
use crate::connection::Connector;
use crate::element::Element;
use crate::encryption::{NoEncryption, PayloadEncryption};
use crate::error::XmppError;
use crate::jid::Jid;
use crate::negotiator::{Negotiated, StreamFeatures};
use crate::ns;
use crate::session::{Session, SessionEvent, SessionTimeouts};
use crate::transport::{BoxedIo, TlsUpgrade, XmppStream};

const PIPE_CAPACITY: usize = 64 * 1024;

pub const STARTTLS_FEATURES: &str =
    "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>";
pub const AUTH_FEATURES: &str =
    "<mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>";
pub const BIND_FEATURES: &str = "<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>";

/// A connected client byte stream and the server end scripted by the test.
pub fn pair() -> (BoxedIo, ScriptedServer) {
    let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
    (Box::new(client), ScriptedServer::new(Box::new(server)))
}

/// Passes the stream through untouched.
pub struct PlainUpgrader;

impl TlsUpgrade for PlainUpgrader {
    async fn upgrade(&self, _domain: &str, io: BoxedIo) -> Result<BoxedIo, XmppError> {
        Ok(io)
    }
}

/// Server side of a scripted exchange. Helpers panic on protocol surprises.
pub struct ScriptedServer {
    stream: XmppStream,
}

impl ScriptedServer {
    pub fn new(io: BoxedIo) -> Self {
        Self {
            stream: XmppStream::new(io),
        }
    }

    pub async fn expect_stream_open(&mut self) {
        match self.stream.next_item().await {
            Ok(StreamItem::Open(_)) => {}
            other => panic!("expected stream header, got {other:?}"),
        }
    }

    pub async fn send_header(&mut self) {
        self.send(&format!(
            "<stream:stream xmlns='{}' xmlns:stream='{}' id='s-1' from='example.com' version='1.0'>",
            ns::CLIENT,
            ns::STREAM
        ))
        .await;
    }

    pub async fn send_features(&mut self, features: &str) {
        self.send_header().await;
        self.send(&format!("<stream:features>{features}</stream:features>"))
            .await;
    }

    pub async fn send(&mut self, xml: &str) {
        self.stream.send_raw(xml).await.expect("server write");
    }

    pub async fn next_element(&mut self) -> Element {
        loop {
            match self.stream.next_item().await {
                Ok(StreamItem::Element(element)) => return element,
                Ok(StreamItem::Open(_)) => continue,
                other => panic!("expected element, got {other:?}"),
            }
        }
    }

    /// Next item, or `None` once the client closed the stream or connection.
    pub async fn try_next_element(&mut self) -> Option<Element> {
        loop {
            match self.stream.next_item().await {
                Ok(StreamItem::Element(element)) => return Some(element),
                Ok(StreamItem::Open(_) | StreamItem::Invalid(_)) => continue,
                Ok(StreamItem::Close) | Err(_) => return None,
            }
        }
    }

    pub fn restart(&mut self) {
        self.stream.restart();
    }

    pub async fn reply_result(&mut self, iq: &Element) {
        self.reply_result_with(iq, "").await;
    }

    pub async fn reply_result_with(&mut self, iq: &Element, payload: &str) {
        let id = iq.attr("id").expect("iq id");
        let from = reply_from(iq);
        self.send(&format!("<iq type='result' id='{id}'{from}>{payload}</iq>"))
            .await;
    }

    pub async fn reply_error(&mut self, iq: &Element, condition: &str) {
        let id = iq.attr("id").expect("iq id");
        let from = reply_from(iq);
        self.send(&format!(
            "<iq type='error' id='{id}'{from}><error type='cancel'><{condition} xmlns='{}'/></error></iq>",
            ns::STANZAS
        ))
        .await;
    }

    pub async fn reply_bind(&mut self, iq: &Element, jid: &str) {
        self.reply_result_with(
            iq,
            &format!("<bind xmlns='{}'><jid>{jid}</jid></bind>", ns::BIND),
        )
        .await;
    }

    pub async fn reply_bind_error(&mut self, iq: &Element, condition: &str) {
        self.reply_error(iq, condition).await;
    }

    /// Run the server half of an unencrypted PLAIN login, up to the point
    /// where the client sends its first bind request.
    pub async fn authenticate_plain(&mut self) {
        self.expect_stream_open().await;
        self.send_features(AUTH_FEATURES).await;
        let auth = self.next_element().await;
        assert!(auth.is("auth", ns::SASL), "expected <auth/>, got {auth:?}");
        self.send("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
            .await;
        self.restart();
        self.expect_stream_open().await;
        self.send_features(BIND_FEATURES).await;
    }

    /// Complete a whole login and bind the client to `jid`.
    pub async fn accept_login(&mut self, jid: &str) {
        self.authenticate_plain().await;
        let bind = self.next_element().await;
        self.reply_bind(&bind, jid).await;
    }

    /// Answer every IQ request with an empty result until the client goes
    /// away. Roster queries get an empty roster.
    pub async fn serve(mut self) {
        while let Some(element) = self.try_next_element().await {
            if element.is("iq", ns::CLIENT) && matches!(element.attr("type"), Some("get" | "set")) {
                if element.has_child("query", ns::ROSTER) {
                    self.reply_result_with(&element, "<query xmlns='jabber:iq:roster'/>")
                        .await;
                } else {
                    self.reply_result(&element).await;
                }
            }
        }
    }

    /// True if the client hung up without sending any further element.
    pub async fn closed_without_more_elements(&mut self) -> bool {
        loop {
            match self.stream.next_item().await {
                Ok(StreamItem::Element(_)) => return false,
                Ok(StreamItem::Open(_) | StreamItem::Invalid(_)) => continue,
                Ok(StreamItem::Close) | Err(_) => return true,
            }
        }
    }

    /// Close the connection from the server side.
    pub async fn hang_up(mut self) {
        self.stream.shutdown().await;
    }
}

/// A ` from='...'` attribute answering from wherever `request` was sent.
fn reply_from(request: &Element) -> String {
    request
        .attr("to")
        .map(|to| format!(" from='{}'", quick_xml::escape::escape(to)))
        .unwrap_or_default()
}

/// A session over an in-memory pipe, already past negotiation.
pub async fn session(
    jid: &str,
) -> (Session, mpsc::UnboundedReceiver<SessionEvent>, ScriptedServer) {
    session_with(jid, Arc::new(NoEncryption)).await
}

pub async fn session_with(
    jid: &str,
    encryption: Arc<dyn PayloadEncryption>,
) -> (Session, mpsc::UnboundedReceiver<SessionEvent>, ScriptedServer) {
    let (io, server) = pair();
    let negotiated = Negotiated {
        stream: XmppStream::new(io),
        jid: Jid::parse(jid).expect("valid test jid"),
        features: StreamFeatures::default(),
    };
    let (session, events) =
        Session::start(negotiated, encryption, SessionTimeouts::default()).expect("session start");
    (session, events, server)
}

#[derive(Default)]
struct ConnectorState {
    refusals: VecDeque<std::io::ErrorKind>,
    attempts: usize,
}

/// Hands the server end of every connection to the test through a channel.
#[derive(Clone)]
pub struct ScriptedConnector {
    state: Arc<Mutex<ConnectorState>>,
    servers: mpsc::UnboundedSender<ScriptedServer>,
}

impl ScriptedConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScriptedServer>) {
        let (servers, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::default(),
                servers,
            },
            rx,
        )
    }

    /// Make the next connection attempt fail with `kind`.
    pub fn refuse_next(&self, kind: std::io::ErrorKind) {
        self.state
            .lock()
            .expect("connector state")
            .refusals
            .push_back(kind);
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().expect("connector state").attempts
    }
}

impl Connector for ScriptedConnector {
    async fn connect(&self, _account: &AccountConfig) -> Result<BoxedIo, XmppError> {
        let refusal = {
            let mut state = self.state.lock().expect("connector state");
            state.attempts += 1;
            state.refusals.pop_front()
        };
        if let Some(kind) = refusal {
            return Err(XmppError::Transport(kind.into()));
        }
        let (io, server) = pair();
        let _ = self.servers.send(server);
        Ok(io)
    }
}
