use perch_storage::StorageError;
use perch_xmpp::{JidError, XmppError};

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("unknown account {0}")]
    UnknownAccount(String),

    #[error("account {0} is already configured")]
    DuplicateAccount(String),

    #[error("invalid account JID: {0}")]
    InvalidJid(#[from] JidError),

    #[error("account {0} is not connected")]
    NotConnected(String),

    #[error("connection attempt for {0} was cancelled")]
    Cancelled(String),

    #[error("connection attempt for {jid} failed: {reason}")]
    ConnectFailed { jid: String, reason: String },

    #[error(transparent)]
    Xmpp(#[from] XmppError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AccountError {
    /// Whether trying again later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            AccountError::Xmpp(e) => e.is_retryable(),
            AccountError::ConnectFailed { .. } | AccountError::Storage(_) => true,
            _ => false,
        }
    }
}
