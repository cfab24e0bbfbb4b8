use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::{debug, instrument, trace};

use crate::codec::{StreamItem, StreamParser};
use crate::element::{Element, ElementExt};
use crate::error::{NegotiationError, XmppError};

const READ_BUFFER_SIZE: usize = 8192;

pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// A byte stream: plain TCP, TLS, or an in-memory pipe in tests.
pub type BoxedIo = Box<dyn AsyncIo>;

/// In-place TLS upgrade of an established byte stream.
pub trait TlsUpgrade: Send + Sync + 'static {
    fn upgrade(
        &self,
        domain: &str,
        io: BoxedIo,
    ) -> impl Future<Output = Result<BoxedIo, XmppError>> + Send;
}

/// TLS via rustls, trusting the Mozilla root set.
#[derive(Clone)]
pub struct RustlsUpgrader {
    connector: TlsConnector,
}

impl RustlsUpgrader {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }
}

impl Default for RustlsUpgrader {
    fn default() -> Self {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self::new(config)
    }
}

impl TlsUpgrade for RustlsUpgrader {
    async fn upgrade(&self, domain: &str, io: BoxedIo) -> Result<BoxedIo, XmppError> {
        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|e| NegotiationError::TlsFailed(format!("invalid server name: {e}")))?;
        let tls = self
            .connector
            .connect(server_name, io)
            .await
            .map_err(|e| NegotiationError::TlsFailed(e.to_string()))?;
        Ok(Box::new(tls))
    }
}

/// A full-duplex XMPP stream used during negotiation.
pub struct XmppStream {
    io: Option<BoxedIo>,
    parser: StreamParser,
    encrypted: bool,
}

impl XmppStream {
    pub fn new(io: BoxedIo) -> Self {
        Self {
            io: Some(io),
            parser: StreamParser::new(),
            encrypted: false,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    fn io(&mut self) -> Result<&mut BoxedIo, XmppError> {
        self.io.as_mut().ok_or(XmppError::NotConnected)
    }

    /// Prepare for a new stream header on the same connection.
    pub fn restart(&mut self) {
        self.parser.reset();
    }

    pub async fn send_raw(&mut self, data: &str) -> Result<(), XmppError> {
        trace!(xml = data, "send");
        let io = self.io()?;
        io.write_all(data.as_bytes()).await?;
        io.flush().await?;
        Ok(())
    }

    pub async fn send(&mut self, element: &Element) -> Result<(), XmppError> {
        self.send_raw(&element.to_xml()?).await
    }

    pub async fn next_item(&mut self) -> Result<StreamItem, XmppError> {
        let Self { io, parser, .. } = self;
        let io = io.as_mut().ok_or(XmppError::NotConnected)?;
        read_item(io, parser).await
    }

    #[instrument(skip(self, upgrader), name = "xmpp.stream.upgrade_tls")]
    pub async fn upgrade_tls<U: TlsUpgrade>(
        &mut self,
        upgrader: &U,
        domain: &str,
    ) -> Result<(), XmppError> {
        let io = self.io.take().ok_or(XmppError::NotConnected)?;
        let upgraded = upgrader.upgrade(domain, io).await?;
        self.io = Some(upgraded);
        self.encrypted = true;
        self.parser.reset();
        debug!("TLS established");
        Ok(())
    }

    /// Close the underlying connection.
    pub async fn shutdown(&mut self) {
        if let Some(io) = self.io.as_mut() {
            let _ = io.shutdown().await;
        }
    }

    /// Split into independent halves once negotiation is complete.
    pub fn into_split(self) -> Result<(StreamReader, StreamWriter), XmppError> {
        let io = self.io.ok_or(XmppError::NotConnected)?;
        let (reader, writer) = tokio::io::split(io);
        Ok((
            StreamReader {
                reader,
                parser: self.parser,
            },
            StreamWriter { writer },
        ))
    }
}

async fn read_item<R>(reader: &mut R, parser: &mut StreamParser) -> Result<StreamItem, XmppError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        if let Some(item) = parser.next_item()? {
            return Ok(item);
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(XmppError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )));
        }
        parser.feed(&buf[..n]);
    }
}

pub struct StreamReader {
    reader: ReadHalf<BoxedIo>,
    parser: StreamParser,
}

impl StreamReader {
    pub async fn next_item(&mut self) -> Result<StreamItem, XmppError> {
        read_item(&mut self.reader, &mut self.parser).await
    }
}

pub struct StreamWriter {
    writer: WriteHalf<BoxedIo>,
}

impl StreamWriter {
    pub async fn send_raw(&mut self, data: &str) -> Result<(), XmppError> {
        trace!(xml = data, "send");
        self.writer.write_all(data.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn send(&mut self, element: &Element) -> Result<(), XmppError> {
        self.send_raw(&element.to_xml()?).await
    }

    /// Send the closing stream tag and shut the write side down.
    pub async fn close(&mut self) -> Result<(), XmppError> {
        self.send_raw("</stream:stream>").await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn reads_items_across_chunks() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = XmppStream::new(Box::new(client));

        tokio::spawn(async move {
            server
                .write_all(b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='abc'>")
                .await
                .unwrap();
            server.write_all(b"<presence from='a@b/c'/>").await.unwrap();
            server.write_all(b"</stream:stream>").await.unwrap();
        });

        assert_matches!(stream.next_item().await.unwrap(), StreamItem::Open(h) if h.id.as_deref() == Some("abc"));
        assert_matches!(stream.next_item().await.unwrap(), StreamItem::Element(p) if p.name() == "presence");
        assert_matches!(stream.next_item().await.unwrap(), StreamItem::Close);
    }

    #[tokio::test]
    async fn eof_is_transport_error() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut stream = XmppStream::new(Box::new(client));
        assert_matches!(stream.next_item().await, Err(XmppError::Transport(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn split_halves_share_the_connection() {
        let (client, server) = tokio::io::duplex(256);
        let stream = XmppStream::new(Box::new(client));
        let (_reader, mut writer) = stream.into_split().unwrap();

        let mut peer = XmppStream::new(Box::new(server));
        peer.parser.feed(b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>");
        writer.send(&Element::bare("presence", crate::ns::CLIENT)).await.unwrap();

        assert_matches!(peer.next_item().await.unwrap(), StreamItem::Open(_));
        assert_matches!(peer.next_item().await.unwrap(), StreamItem::Element(p) if p.name() == "presence");
    }
}
