//! Persistence for messages, rosters, and account status.
//!
//! [`Storage`] is what the account layer talks to. [`MemoryStorage`] keeps
//! everything in process; [`SqlStorage`] maps the same operations onto any
//! [`Database`], of which [`SqliteDatabase`] is the native backend.

use std::future::Future;

use chrono::{DateTime, SecondsFormat, Utc};
use perch_core::event::{AccountStatus, ChatMessage, ReceiptStatus, RosterItem};
use serde::{Deserialize, Serialize};

mod database;
mod memory;
mod sql;
#[cfg(feature = "native")]
mod sqlite;

pub use database::{Database, FromRow, Row, SqlValue, Statement, ToSqlValue};
pub use memory::MemoryStorage;
pub use sql::SqlStorage;
#[cfg(feature = "native")]
pub use sqlite::{SqliteDatabase, open_database};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to open database: {0}")]
    OpenFailed(String),

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("migration failed: {0}")]
    MigrationFailed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "incoming" => Some(Direction::Incoming),
            "outgoing" => Some(Direction::Outgoing),
            _ => None,
        }
    }
}

/// Delivery state of a stored message. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageStatus {
    Received,
    Sent,
    Delivered,
    Displayed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Received => "received",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Displayed => "displayed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "received" => Some(MessageStatus::Received),
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "displayed" => Some(MessageStatus::Displayed),
            _ => None,
        }
    }

    /// Ordering used to reject status regressions. Received and sent are
    /// both initial states.
    pub fn rank(&self) -> i64 {
        match self {
            MessageStatus::Received | MessageStatus::Sent => 0,
            MessageStatus::Delivered => 1,
            MessageStatus::Displayed => 2,
        }
    }
}

impl From<ReceiptStatus> for MessageStatus {
    fn from(status: ReceiptStatus) -> Self {
        match status {
            ReceiptStatus::Delivered => MessageStatus::Delivered,
            ReceiptStatus::Displayed => MessageStatus::Displayed,
        }
    }
}

/// One message as persisted for an account.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    /// Bare JID of the owning account.
    pub account: String,
    /// Bare JID of the conversation partner or room.
    pub peer: String,
    pub direction: Direction,
    pub status: MessageStatus,
    pub message: ChatMessage,
}

impl StoredMessage {
    pub fn incoming(account: impl Into<String>, peer: impl Into<String>, message: ChatMessage) -> Self {
        Self {
            account: account.into(),
            peer: peer.into(),
            direction: Direction::Incoming,
            status: MessageStatus::Received,
            message,
        }
    }

    pub fn outgoing(account: impl Into<String>, peer: impl Into<String>, message: ChatMessage) -> Self {
        Self {
            account: account.into(),
            peer: peer.into(),
            direction: Direction::Outgoing,
            status: MessageStatus::Sent,
            message,
        }
    }
}

/// Persistence interface used by the account layer. Every call happens
/// after the in-memory state it mirrors has already changed.
pub trait Storage: Send + Sync + 'static {
    /// Store a message. Returns `false` if the account already has a
    /// message with the same id.
    fn append_message(
        &self,
        record: &StoredMessage,
    ) -> impl Future<Output = Result<bool, StorageError>> + Send;

    /// The most recent `limit` messages with `peer`, oldest first.
    fn messages_for(
        &self,
        account: &str,
        peer: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<StoredMessage>, StorageError>> + Send;

    /// Advance the status of an outgoing message. Returns `false` when the
    /// message is unknown or already at or past `status`.
    fn update_message_status(
        &self,
        account: &str,
        id: &str,
        status: MessageStatus,
    ) -> impl Future<Output = Result<bool, StorageError>> + Send;

    /// Replace the stored roster of an account.
    fn save_roster(
        &self,
        account: &str,
        items: &[RosterItem],
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn load_roster(
        &self,
        account: &str,
    ) -> impl Future<Output = Result<Vec<RosterItem>, StorageError>> + Send;

    fn save_account_status(
        &self,
        account: &str,
        status: AccountStatus,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn load_account_status(
        &self,
        account: &str,
    ) -> impl Future<Output = Result<Option<AccountStatus>, StorageError>> + Send;
}

/// Fixed-width RFC 3339, so stored timestamps sort as text.
pub(crate) fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::QueryFailed(format!("invalid timestamp '{value}': {e}")))
}
