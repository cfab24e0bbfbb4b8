use std::sync::Arc;

use perch_core::event::{
    AccountStatus, ArchiveInfo, ChatMessage, MessageType, Reactions, RosterItem, Subscription,
};
use tracing::{debug, instrument};

use crate::database::{Database, FromRow, Row, Statement};
use crate::{
    Direction, MessageStatus, Storage, StorageError, StoredMessage, format_timestamp,
    parse_timestamp,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS messages (
        account TEXT NOT NULL,
        id TEXT NOT NULL,
        peer TEXT NOT NULL,
        from_jid TEXT NOT NULL,
        to_jid TEXT NOT NULL,
        body TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        message_type TEXT NOT NULL,
        thread TEXT,
        replaces TEXT,
        reactions_json TEXT,
        archive_id TEXT,
        query_id TEXT,
        encrypted INTEGER NOT NULL DEFAULT 0,
        direction TEXT NOT NULL,
        status TEXT NOT NULL,
        PRIMARY KEY (account, id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_peer ON messages (account, peer, timestamp)",
    "CREATE TABLE IF NOT EXISTS roster (
        account TEXT NOT NULL,
        jid TEXT NOT NULL,
        name TEXT,
        subscription TEXT NOT NULL,
        groups_json TEXT NOT NULL,
        PRIMARY KEY (account, jid)
    )",
    "CREATE TABLE IF NOT EXISTS account_status (
        account TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
];

const MESSAGE_COLUMNS: &str = "account, id, peer, from_jid, to_jid, body, timestamp, message_type, \
     thread, replaces, reactions_json, archive_id, query_id, encrypted, direction, status";

/// SQL expression ranking a status column, mirroring [`MessageStatus::rank`].
const STATUS_RANK: &str =
    "CASE status WHEN 'delivered' THEN 1 WHEN 'displayed' THEN 2 ELSE 0 END";

/// [`Storage`] over any [`Database`].
pub struct SqlStorage<D> {
    db: Arc<D>,
}

impl<D> Clone for SqlStorage<D> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}

impl<D: Database> SqlStorage<D> {
    /// Wrap `db`, creating the schema if needed.
    pub async fn open(db: D) -> Result<Self, StorageError> {
        let storage = Self { db: Arc::new(db) };
        storage.migrate().await?;
        Ok(storage)
    }

    pub fn database(&self) -> &D {
        &self.db
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        let statements = SCHEMA.iter().map(|sql| Statement::new(*sql, &[])).collect();
        self.db
            .execute_batch(statements)
            .await
            .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;
        debug!("Storage schema ready");
        Ok(())
    }
}

impl FromRow for StoredMessage {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        let reactions = match row.opt_text(10)? {
            Some(json) => Some(serde_json::from_str::<Reactions>(&json)?),
            None => None,
        };
        let query_id = row.opt_text(12)?;
        let archive = row.opt_text(11)?.map(|archive_id| ArchiveInfo {
            query_id,
            archive_id,
        });

        let direction = row.text(14)?;
        let status = row.text(15)?;
        Ok(StoredMessage {
            account: row.text(0)?,
            peer: row.text(2)?,
            direction: Direction::parse(&direction)
                .ok_or_else(|| StorageError::QueryFailed(format!("unknown direction '{direction}'")))?,
            status: MessageStatus::parse(&status)
                .ok_or_else(|| StorageError::QueryFailed(format!("unknown status '{status}'")))?,
            message: ChatMessage {
                id: row.text(1)?,
                from: row.text(3)?,
                to: row.text(4)?,
                body: row.text(5)?,
                timestamp: parse_timestamp(&row.text(6)?)?,
                message_type: MessageType::parse(Some(row.text(7)?.as_str())),
                thread: row.opt_text(8)?,
                replaces: row.opt_text(9)?,
                reactions,
                archive,
                encrypted: row.integer(13)? != 0,
            },
        })
    }
}

impl FromRow for RosterItem {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        Ok(RosterItem {
            jid: row.text(0)?,
            name: row.opt_text(1)?,
            subscription: Subscription::parse(&row.text(2)?),
            groups: serde_json::from_str(&row.text(3)?)?,
        })
    }
}

struct StatusRow(String);

impl FromRow for StatusRow {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        row.text(0).map(StatusRow)
    }
}

impl<D: Database> Storage for SqlStorage<D> {
    #[instrument(skip_all, fields(account = %record.account, id = %record.message.id))]
    async fn append_message(&self, record: &StoredMessage) -> Result<bool, StorageError> {
        let message = &record.message;
        let reactions = message.reactions.as_ref().map(serde_json::to_string).transpose()?;
        let archive_id = message.archive.as_ref().map(|a| a.archive_id.clone());
        let query_id = message.archive.as_ref().and_then(|a| a.query_id.clone());
        let sql = format!(
            "INSERT OR IGNORE INTO messages ({MESSAGE_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        );
        let inserted = self
            .db
            .execute(
                &sql,
                &[
                    &record.account,
                    &message.id,
                    &record.peer,
                    &message.from,
                    &message.to,
                    &message.body,
                    &format_timestamp(&message.timestamp),
                    &message.message_type.as_str(),
                    &message.thread,
                    &message.replaces,
                    &reactions,
                    &archive_id,
                    &query_id,
                    &message.encrypted,
                    &record.direction.as_str(),
                    &record.status.as_str(),
                ],
            )
            .await?;
        Ok(inserted > 0)
    }

    async fn messages_for(
        &self,
        account: &str,
        peer: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE account = ?1 AND peer = ?2 \
             ORDER BY timestamp DESC, rowid DESC LIMIT ?3"
        );
        let mut messages: Vec<StoredMessage> =
            self.db.query(&sql, &[&account, &peer, &limit]).await?;
        messages.reverse();
        Ok(messages)
    }

    async fn update_message_status(
        &self,
        account: &str,
        id: &str,
        status: MessageStatus,
    ) -> Result<bool, StorageError> {
        let sql = format!(
            "UPDATE messages SET status = ?3 \
             WHERE account = ?1 AND id = ?2 AND direction = 'outgoing' AND {STATUS_RANK} < ?4"
        );
        let changed = self
            .db
            .execute(&sql, &[&account, &id, &status.as_str(), &status.rank()])
            .await?;
        Ok(changed > 0)
    }

    #[instrument(skip_all, fields(account = %account, count = items.len()))]
    async fn save_roster(&self, account: &str, items: &[RosterItem]) -> Result<(), StorageError> {
        let mut statements = vec![Statement::new(
            "DELETE FROM roster WHERE account = ?1",
            &[&account],
        )];
        for item in items {
            let groups = serde_json::to_string(&item.groups)?;
            statements.push(Statement::new(
                "INSERT OR REPLACE INTO roster (account, jid, name, subscription, groups_json) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                &[&account, &item.jid, &item.name, &item.subscription.as_str(), &groups],
            ));
        }
        self.db.execute_batch(statements).await
    }

    async fn load_roster(&self, account: &str) -> Result<Vec<RosterItem>, StorageError> {
        self.db
            .query(
                "SELECT jid, name, subscription, groups_json FROM roster \
                 WHERE account = ?1 ORDER BY jid",
                &[&account],
            )
            .await
    }

    async fn save_account_status(
        &self,
        account: &str,
        status: AccountStatus,
    ) -> Result<(), StorageError> {
        let now = format_timestamp(&chrono::Utc::now());
        self.db
            .execute(
                "INSERT INTO account_status (account, status, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(account) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
                &[&account, &status.as_str(), &now],
            )
            .await?;
        Ok(())
    }

    async fn load_account_status(&self, account: &str) -> Result<Option<AccountStatus>, StorageError> {
        let rows: Vec<StatusRow> = self
            .db
            .query("SELECT status FROM account_status WHERE account = ?1", &[&account])
            .await?;
        Ok(rows.into_iter().next().and_then(|StatusRow(s)| AccountStatus::parse(&s)))
    }
}
