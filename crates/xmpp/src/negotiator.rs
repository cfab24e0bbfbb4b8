//! Client-side stream negotiation: STARTTLS, SASL PLAIN, resource binding.
//!
//! Every step must succeed before the next one starts. Nothing here retries;
//! reconnect policy belongs to the account layer.

use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use perch_core::config::TlsPolicy;
use tracing::{debug, info, instrument, warn};

use crate::codec::StreamItem;
use crate::element::{self, Element, ElementExt};
use crate::error::{NegotiationError, RemoteError, XmppError};
use crate::jid::Jid;
use crate::ns;
use crate::transport::{TlsUpgrade, XmppStream};

/// What the server advertised in `<stream:features/>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFeatures {
    pub starttls: bool,
    pub starttls_required: bool,
    pub mechanisms: Vec<String>,
    pub bind: bool,
    /// Legacy session establishment is required (not marked optional).
    pub session_required: bool,
}

impl StreamFeatures {
    pub fn from_element(features: &Element) -> Self {
        let starttls = features.get_child("starttls", ns::TLS);
        let mechanisms = features
            .get_child("mechanisms", ns::SASL)
            .map(|m| {
                m.children()
                    .filter(|c| c.is("mechanism", ns::SASL))
                    .map(|c| c.text().trim().to_string())
                    .collect()
            })
            .unwrap_or_default();
        let session = features.get_child("session", ns::SESSION);

        Self {
            starttls: starttls.is_some(),
            starttls_required: starttls.is_some_and(|s| s.has_child("required", ns::TLS)),
            mechanisms,
            bind: features.has_child("bind", ns::BIND),
            session_required: session.is_some_and(|s| !s.has_child("optional", ns::SESSION)),
        }
    }
}

/// Account parameters the negotiator needs.
#[derive(Debug, Clone)]
pub struct NegotiationParams {
    /// The bare account JID.
    pub jid: Jid,
    pub password: String,
    pub resource: String,
    pub tls: TlsPolicy,
    pub bind_timeout: Duration,
}

pub struct Negotiated {
    pub stream: XmppStream,
    /// The full JID assigned by the server.
    pub jid: Jid,
    pub features: StreamFeatures,
}

impl std::fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiated")
            .field("jid", &self.jid)
            .finish_non_exhaustive()
    }
}

/// Negotiate a client stream. On failure the connection is shut down.
#[instrument(skip_all, name = "xmpp.negotiate", fields(jid = %params.jid))]
pub async fn negotiate<U: TlsUpgrade>(
    mut stream: XmppStream,
    params: &NegotiationParams,
    upgrader: &U,
) -> Result<Negotiated, XmppError> {
    match run(&mut stream, params, upgrader).await {
        Ok((jid, features)) => {
            info!(jid = %jid, "Stream negotiated");
            Ok(Negotiated {
                stream,
                jid,
                features,
            })
        }
        Err(e) => {
            warn!(error = %e, "Negotiation failed");
            stream.shutdown().await;
            Err(e)
        }
    }
}

async fn run<U: TlsUpgrade>(
    stream: &mut XmppStream,
    params: &NegotiationParams,
    upgrader: &U,
) -> Result<(Jid, StreamFeatures), XmppError> {
    let domain = params.jid.domain();
    let mut features = open_stream(stream, domain).await?;

    if features.starttls {
        match params.tls {
            TlsPolicy::Required | TlsPolicy::Opportunistic => {
                starttls(stream, upgrader, domain).await?;
                features = open_stream(stream, domain).await?;
            }
            TlsPolicy::Disabled if features.starttls_required => {
                return Err(NegotiationError::TlsRequiredByServer.into());
            }
            TlsPolicy::Disabled => debug!("Skipping offered STARTTLS"),
        }
    } else if params.tls == TlsPolicy::Required && !stream.is_encrypted() {
        return Err(NegotiationError::TlsUnavailable.into());
    } else if !stream.is_encrypted() {
        debug!(policy = ?params.tls, "Continuing without TLS");
    }

    authenticate(stream, &features, params).await?;
    features = open_stream(stream, domain).await?;

    if !features.bind {
        return Err(NegotiationError::BindFailed("server does not offer resource binding".into()).into());
    }
    let jid = bind(stream, params).await?;

    if features.session_required {
        establish_session(stream, params.bind_timeout).await?;
    }
    Ok((jid, features))
}

fn stream_header(domain: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream to='{}' version='1.0' xmlns='{}' xmlns:stream='{}'>",
        quick_xml::escape::escape(domain),
        ns::CLIENT,
        ns::STREAM
    )
}

fn stream_error(error: &Element) -> NegotiationError {
    let condition = error
        .children()
        .find(|c| c.ns() == ns::STREAMS_ERRORS && c.name() != "text")
        .map(|c| c.name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string());
    let text = error
        .child_text("text", ns::STREAMS_ERRORS)
        .filter(|t| !t.is_empty());
    NegotiationError::StreamError { condition, text }
}

/// Read the next top-level element, failing on stream errors and close.
async fn next_element(stream: &mut XmppStream) -> Result<Element, XmppError> {
    loop {
        match stream.next_item().await? {
            StreamItem::Element(element) if element.is("error", ns::STREAM) => {
                return Err(stream_error(&element).into());
            }
            StreamItem::Element(element) => return Ok(element),
            StreamItem::Open(_) => debug!("Ignoring repeated stream header"),
            StreamItem::Invalid(reason) => warn!(%reason, "Skipping undecodable element"),
            StreamItem::Close => return Err(NegotiationError::UnexpectedClose.into()),
        }
    }
}

#[instrument(skip(stream), name = "xmpp.negotiate.open")]
async fn open_stream(stream: &mut XmppStream, domain: &str) -> Result<StreamFeatures, XmppError> {
    stream.restart();
    stream.send_raw(&stream_header(domain)).await?;

    loop {
        match stream.next_item().await? {
            StreamItem::Open(header) => debug!(id = ?header.id, "Stream opened"),
            StreamItem::Element(element) if element.is("features", ns::STREAM) => {
                let features = StreamFeatures::from_element(&element);
                debug!(?features, "Received stream features");
                return Ok(features);
            }
            StreamItem::Element(element) if element.is("error", ns::STREAM) => {
                return Err(stream_error(&element).into());
            }
            StreamItem::Element(element) => {
                debug!(name = element.name(), ns = %element.ns(), "Skipping element before features");
            }
            StreamItem::Invalid(reason) => warn!(%reason, "Skipping undecodable element before features"),
            StreamItem::Close => return Err(NegotiationError::UnexpectedClose.into()),
        }
    }
}

#[instrument(skip(stream, upgrader), name = "xmpp.negotiate.starttls")]
async fn starttls<U: TlsUpgrade>(
    stream: &mut XmppStream,
    upgrader: &U,
    domain: &str,
) -> Result<(), XmppError> {
    stream.send(&Element::bare("starttls", ns::TLS)).await?;

    let reply = next_element(stream).await?;
    if reply.is("failure", ns::TLS) {
        return Err(NegotiationError::TlsFailed("server refused STARTTLS".into()).into());
    }
    if !reply.is("proceed", ns::TLS) {
        return Err(NegotiationError::UnexpectedElement(reply.name().to_string()).into());
    }

    stream.upgrade_tls(upgrader, domain).await
}

#[instrument(skip_all, name = "xmpp.negotiate.auth")]
async fn authenticate(
    stream: &mut XmppStream,
    features: &StreamFeatures,
    params: &NegotiationParams,
) -> Result<(), XmppError> {
    if !features.mechanisms.iter().any(|m| m == "PLAIN") {
        return Err(NegotiationError::MechanismUnsupported(features.mechanisms.clone()).into());
    }

    let authcid = params.jid.local().unwrap_or_default();
    let payload = BASE64_STANDARD.encode(format!("\0{authcid}\0{}", params.password));
    let auth = Element::builder("auth", ns::SASL)
        .attr("mechanism", "PLAIN")
        .append(payload)
        .build();
    stream.send(&auth).await?;

    let reply = next_element(stream).await?;
    if reply.is("success", ns::SASL) {
        debug!("Authenticated");
        return Ok(());
    }
    if reply.is("failure", ns::SASL) {
        let condition = reply
            .children()
            .find(|c| c.name() != "text")
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| "not-authorized".to_string());
        let text = reply.child_text("text", ns::SASL).filter(|t| !t.is_empty());
        return Err(NegotiationError::AuthenticationFailed { condition, text }.into());
    }
    Err(NegotiationError::UnexpectedElement(reply.name().to_string()).into())
}

/// Resources to try, in order: server-assigned first, then the configured one.
fn bind_attempts(configured: &str) -> Vec<String> {
    let mut attempts = vec![String::new()];
    if !configured.is_empty() {
        attempts.push(configured.to_string());
    }
    attempts
}

#[instrument(skip_all, name = "xmpp.negotiate.bind")]
async fn bind(stream: &mut XmppStream, params: &NegotiationParams) -> Result<Jid, XmppError> {
    let mut failures = Vec::new();

    for (n, resource) in bind_attempts(&params.resource).into_iter().enumerate() {
        let label = if resource.is_empty() {
            "server-assigned resource".to_string()
        } else {
            format!("resource '{resource}'")
        };
        match bind_once(stream, &resource, n, params.bind_timeout).await {
            Ok(jid) => {
                debug!(jid = %jid, "Bound");
                return Ok(jid);
            }
            Err(BindAttemptError::Fatal(e)) => return Err(e),
            Err(BindAttemptError::Refused(reason)) => {
                debug!(%label, %reason, "Bind attempt refused");
                failures.push(format!("{label}: {reason}"));
            }
        }
    }

    Err(NegotiationError::BindFailed(failures.join("; ")).into())
}

enum BindAttemptError {
    /// The server answered with an error; another attempt may succeed.
    Refused(String),
    Fatal(XmppError),
}

impl From<XmppError> for BindAttemptError {
    fn from(err: XmppError) -> Self {
        BindAttemptError::Fatal(err)
    }
}

async fn bind_once(
    stream: &mut XmppStream,
    resource: &str,
    attempt: usize,
    timeout: Duration,
) -> Result<Jid, BindAttemptError> {
    let id = format!("bind-{attempt}");
    let mut bind = Element::builder("bind", ns::BIND);
    if !resource.is_empty() {
        bind = bind.append(Element::builder("resource", ns::BIND).append(resource).build());
    }
    let iq = Element::builder("iq", ns::CLIENT)
        .attr("type", "set")
        .attr("id", id.as_str())
        .append(bind.build())
        .build();
    stream.send(&iq).await?;

    let reply = tokio::time::timeout(timeout, await_reply(stream, &id))
        .await
        .map_err(|_| BindAttemptError::Refused("no reply".to_string()))??;

    match reply.attr("type") {
        Some("result") => {
            let jid = reply
                .get_child("bind", ns::BIND)
                .and_then(|b| b.child_text("jid", ns::BIND))
                .ok_or_else(|| BindAttemptError::Refused("result without jid".to_string()))?;
            Jid::parse(jid.trim()).map_err(|e| BindAttemptError::Refused(format!("invalid jid: {e}")))
        }
        _ => Err(BindAttemptError::Refused(
            RemoteError::from_stanza(&reply).to_string(),
        )),
    }
}

/// Wait for the IQ reply with `id`, skipping anything else.
async fn await_reply(stream: &mut XmppStream, id: &str) -> Result<Element, XmppError> {
    loop {
        let element = next_element(stream).await?;
        if element.is("iq", ns::CLIENT) && element.attr("id") == Some(id) {
            return Ok(element);
        }
        debug!(name = element.name(), "Skipping element while waiting for reply");
    }
}

#[instrument(skip_all, name = "xmpp.negotiate.session")]
async fn establish_session(stream: &mut XmppStream, timeout: Duration) -> Result<(), XmppError> {
    let id = "session-0";
    let iq = Element::builder("iq", ns::CLIENT)
        .attr("type", "set")
        .attr("id", id)
        .append(Element::bare("session", ns::SESSION))
        .build();
    stream.send(&iq).await?;

    let reply = tokio::time::timeout(timeout, await_reply(stream, id))
        .await
        .map_err(|_| NegotiationError::SessionFailed("no reply".into()))??;
    match reply.attr("type") {
        Some("result") => Ok(()),
        _ => Err(NegotiationError::SessionFailed(RemoteError::from_stanza(&reply).to_string()).into()),
    }
}
