//! XMPP session engine: stream transport, stanza codec, negotiation,
//! IQ correlation, the per-session dispatch loop, and session operations.

pub mod codec;
pub mod connection;
pub mod correlator;
mod dispatch;
pub mod element;
pub mod encryption;
pub mod error;
pub mod extensions;
pub mod jid;
pub mod muc;
pub mod negotiator;
pub mod ns;
pub mod roster;
pub mod session;
pub mod stanza;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use connection::{Client, Connector, TcpConnector};
pub use element::{Element, ElementExt};
pub use encryption::{EncryptedEnvelope, NoEncryption, PayloadEncryption};
pub use error::{Condition, ErrorType, NegotiationError, RemoteError, XmppError};
pub use crate::jid::{Jid, JidError};
pub use session::{ArchiveQuery, RoomOptions, Session, SessionEvent, SessionTimeouts};
pub use transport::{RustlsUpgrader, TlsUpgrade};
