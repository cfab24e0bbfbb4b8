use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use perch_core::config::{AccountConfig, TimeoutConfig};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::encryption::{NoEncryption, PayloadEncryption};
use crate::error::XmppError;
use crate::jid::Jid;
use crate::negotiator::{NegotiationParams, negotiate};
use crate::session::{Session, SessionEvent, SessionTimeouts};
use crate::transport::{BoxedIo, RustlsUpgrader, TlsUpgrade, XmppStream};

/// Opens the raw byte stream to an account's server.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        account: &AccountConfig,
    ) -> impl Future<Output = Result<BoxedIo, XmppError>> + Send;
}

/// Plain TCP to the configured host, or the JID domain, on port 5222 by default.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(TimeoutConfig::default().connect_seconds))
    }
}

impl Connector for TcpConnector {
    #[instrument(skip_all, name = "xmpp.tcp.connect", fields(host = account.host(), port = account.port()))]
    async fn connect(&self, account: &AccountConfig) -> Result<BoxedIo, XmppError> {
        let stream = tokio::time::timeout(
            self.timeout,
            TcpStream::connect((account.host(), account.port())),
        )
        .await
        .map_err(|_| XmppError::Timeout)??;
        stream.set_nodelay(true)?;
        debug!(peer = ?stream.peer_addr().ok(), "TCP connected");
        Ok(Box::new(stream))
    }
}

/// Builds sessions: connect, negotiate, then start the dispatch loop.
pub struct Client<C = TcpConnector, U = RustlsUpgrader> {
    connector: C,
    upgrader: U,
    encryption: Arc<dyn PayloadEncryption>,
    connect_timeout: Duration,
    timeouts: SessionTimeouts,
}

impl Client {
    pub fn new(config: &TimeoutConfig) -> Self {
        let connect_timeout = Duration::from_secs(config.connect_seconds);
        Client::with_parts(
            TcpConnector::new(connect_timeout),
            RustlsUpgrader::default(),
            config,
        )
    }
}

impl<C: Connector, U: TlsUpgrade> Client<C, U> {
    pub fn with_parts(connector: C, upgrader: U, config: &TimeoutConfig) -> Self {
        Self {
            connector,
            upgrader,
            encryption: Arc::new(NoEncryption),
            connect_timeout: Duration::from_secs(config.connect_seconds),
            timeouts: SessionTimeouts::from(config),
        }
    }

    pub fn with_encryption(mut self, encryption: Arc<dyn PayloadEncryption>) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Connect and negotiate one account. The whole handshake is bounded by
    /// the connect timeout.
    #[instrument(skip_all, name = "xmpp.client.connect", fields(jid = %account.jid))]
    pub async fn connect(
        &self,
        account: &AccountConfig,
    ) -> Result<(Session, mpsc::UnboundedReceiver<SessionEvent>), XmppError> {
        let params = NegotiationParams {
            jid: Jid::parse(&account.jid)?.to_bare(),
            password: account.password.clone(),
            resource: account.resource.clone(),
            tls: account.tls,
            bind_timeout: self.timeouts.bind,
        };

        let handshake = async {
            let io = self.connector.connect(account).await?;
            negotiate(XmppStream::new(io), &params, &self.upgrader).await
        };
        let negotiated = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| XmppError::Timeout)??;

        Session::start(negotiated, self.encryption.clone(), self.timeouts)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use perch_core::config::TlsPolicy;
    use tokio::net::TcpListener;

    use super::*;
    use crate::testing::{PlainUpgrader, ScriptedConnector};

    fn account() -> AccountConfig {
        let mut account = AccountConfig::new("alice@example.com", "secret");
        account.tls = TlsPolicy::Disabled;
        account
    }

    #[tokio::test]
    async fn connects_negotiates_and_starts_session() {
        let (connector, mut servers) = ScriptedConnector::new();
        let client = Client::with_parts(connector, PlainUpgrader, &TimeoutConfig::default());

        let server = tokio::spawn(async move {
            let mut server = servers.recv().await.unwrap();
            server.accept_login("alice@example.com/abc").await;
            server
        });

        let (session, mut events) = client.connect(&account()).await.unwrap();
        assert_eq!(session.jid().to_string(), "alice@example.com/abc");
        assert_matches!(events.recv().await, Some(SessionEvent::Connected { jid }) if jid.resource() == Some("abc"));
        assert_eq!(client.connector().attempts(), 1);
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn connect_failure_is_transport_error() {
        let (connector, _servers) = ScriptedConnector::new();
        connector.refuse_next(std::io::ErrorKind::ConnectionRefused);
        let client = Client::with_parts(connector, PlainUpgrader, &TimeoutConfig::default());

        let err = client.connect(&account()).await.unwrap_err();
        assert_matches!(&err, XmppError::Transport(e) if e.kind() == std::io::ErrorKind::ConnectionRefused);
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_times_out() {
        let (connector, mut servers) = ScriptedConnector::new();
        let client = Client::with_parts(connector, PlainUpgrader, &TimeoutConfig::default());
        let _held = tokio::spawn(async move {
            let server = servers.recv().await;
            std::future::pending::<()>().await;
            drop(server);
        });

        assert_matches!(client.connect(&account()).await, Err(XmppError::Timeout));
    }

    #[tokio::test]
    async fn tcp_connector_reaches_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut account = account();
        account.server = Some("127.0.0.1".into());
        account.port = Some(port);

        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        TcpConnector::default().connect(&account).await.unwrap();
        accept.await.unwrap().unwrap();
    }
}
