//! Session events to bus events, with persistence on the way.

use chrono::Utc;
use perch_core::event::{ChatMessage, EventPayload, MessageType};
use perch_storage::{Direction, Storage, StoredMessage};
use perch_xmpp::{Connector, Jid, SessionEvent, TlsUpgrade};
use tracing::{debug, warn};

use crate::error::AccountError;
use crate::manager::AccountManager;

fn bare(jid: &str) -> String {
    match Jid::parse(jid) {
        Ok(jid) => jid.bare_string(),
        Err(_) => jid.split('/').next().unwrap_or(jid).to_string(),
    }
}

impl<C: Connector, U: TlsUpgrade, S: Storage> AccountManager<C, U, S> {
    pub(crate) async fn handle_session_event(&self, account: &str, epoch: u64, event: SessionEvent) {
        let owned = account.to_string();
        match event {
            SessionEvent::Connected { jid } => self.publish(
                account,
                "system.connection.established",
                EventPayload::ConnectionEstablished {
                    account: owned,
                    jid: jid.to_string(),
                },
            ),
            SessionEvent::Disconnected { reason } => {
                if self.session_lost(account, epoch, &reason).await {
                    self.publish(
                        account,
                        "system.connection.lost",
                        EventPayload::ConnectionLost {
                            account: owned,
                            reason,
                            will_retry: false,
                        },
                    );
                }
            }
            SessionEvent::MessageReceived(message) => {
                self.record_received(account, &message).await;
                self.publish(
                    account,
                    "xmpp.message.received",
                    EventPayload::MessageReceived {
                        account: owned,
                        message,
                    },
                );
            }
            SessionEvent::PresenceChanged {
                jid,
                show,
                status,
                priority,
            } => self.publish(
                account,
                "xmpp.presence.changed",
                EventPayload::PresenceChanged {
                    account: owned,
                    jid: jid.to_string(),
                    show,
                    status,
                    priority,
                },
            ),
            SessionEvent::SubscriptionRequest { from } => self.publish(
                account,
                "xmpp.subscription.request",
                EventPayload::SubscriptionRequest {
                    account: owned,
                    from: from.to_string(),
                },
            ),
            SessionEvent::SubscriptionApproved { jid } => self.publish(
                account,
                "xmpp.subscription.approved",
                EventPayload::SubscriptionApproved {
                    account: owned,
                    jid: jid.to_string(),
                },
            ),
            SessionEvent::SubscriptionRevoked { jid } => self.publish(
                account,
                "xmpp.subscription.revoked",
                EventPayload::SubscriptionRevoked {
                    account: owned,
                    jid: jid.to_string(),
                },
            ),
            SessionEvent::RosterUpdated(items) => {
                if let Err(e) = self.inner.storage.save_roster(account, &items).await {
                    self.storage_failed(account, &e.into());
                }
                self.publish(
                    account,
                    "xmpp.roster.updated",
                    EventPayload::RosterUpdated {
                        account: owned,
                        items,
                    },
                );
            }
            SessionEvent::Receipt { id, from, status } => {
                match self
                    .inner
                    .storage
                    .update_message_status(account, &id, status.into())
                    .await
                {
                    Ok(updated) => debug!(account = %account, id = %id, updated, "Receipt applied"),
                    Err(e) => self.storage_failed(account, &e.into()),
                }
                self.publish(
                    account,
                    "xmpp.message.receipt",
                    EventPayload::ReceiptReceived {
                        account: owned,
                        id,
                        from: from.to_string(),
                        status,
                    },
                );
            }
            SessionEvent::RoomJoined { room, nick } => self.publish(
                account,
                "xmpp.room.joined",
                EventPayload::RoomJoined {
                    account: owned,
                    room: room.to_string(),
                    nick,
                },
            ),
            SessionEvent::RoomLeft { room } => self.publish(
                account,
                "xmpp.room.left",
                EventPayload::RoomLeft {
                    account: owned,
                    room: room.to_string(),
                },
            ),
            SessionEvent::RoomSubjectChanged { room, subject } => self.publish(
                account,
                "xmpp.room.subject_changed",
                EventPayload::RoomSubjectChanged {
                    account: owned,
                    room: room.to_string(),
                    subject,
                },
            ),
            SessionEvent::OccupantChanged { room, occupant } => self.publish(
                account,
                "xmpp.room.occupant_changed",
                EventPayload::RoomOccupantChanged {
                    account: owned,
                    room: room.to_string(),
                    occupant,
                },
            ),
            SessionEvent::ArchivePageComplete {
                query_id,
                complete,
                last_id,
            } => self.publish(
                account,
                "xmpp.archive.page_complete",
                EventPayload::ArchivePageComplete {
                    account: owned,
                    query_id,
                    complete,
                    last_id,
                },
            ),
            SessionEvent::OperationResult { operation, outcome } => self.publish(
                account,
                "xmpp.operation.result",
                EventPayload::OperationResult {
                    account: owned,
                    operation,
                    outcome,
                },
            ),
        }
    }

    /// Store a received message and count it as unread when it is new, live,
    /// and from someone else.
    async fn record_received(&self, account: &str, message: &ChatMessage) {
        let from = bare(&message.from);
        let record = if message.message_type != MessageType::Groupchat && from == account {
            // Our own message from another resource or the archive.
            StoredMessage::outgoing(account, bare(&message.to), message.clone())
        } else {
            StoredMessage::incoming(account, from, message.clone())
        };

        let appended = match self.inner.storage.append_message(&record).await {
            Ok(appended) => appended,
            Err(e) => {
                self.storage_failed(account, &e.into());
                return;
            }
        };

        let counts = appended
            && record.direction == Direction::Incoming
            && message.archive.is_none()
            && !message.body.is_empty();
        if counts {
            if let Some(entry) = self.write().get_mut(account) {
                *entry.unread.entry(record.peer).or_insert(0) += 1;
            }
        }
    }

    /// Store a message we just sent and announce it.
    pub(crate) async fn record_sent(
        &self,
        account: &str,
        from: &Jid,
        to: &Jid,
        id: String,
        body: &str,
        message_type: MessageType,
    ) {
        let message = ChatMessage {
            id,
            from: from.to_string(),
            to: to.to_string(),
            body: body.to_string(),
            timestamp: Utc::now(),
            message_type,
            thread: None,
            replaces: None,
            reactions: None,
            archive: None,
            encrypted: false,
        };
        let record = StoredMessage::outgoing(account, to.bare_string(), message.clone());
        if let Err(e) = self.inner.storage.append_message(&record).await {
            self.storage_failed(account, &e.into());
        }
        self.publish(
            account,
            "xmpp.message.sent",
            EventPayload::MessageSent {
                account: account.to_string(),
                message,
            },
        );
    }

    fn storage_failed(&self, account: &str, error: &AccountError) {
        warn!(account = %account, error = %error, "Persisting session state failed");
        self.publish(
            account,
            "system.error.occurred",
            EventPayload::ErrorOccurred {
                component: "storage".to_string(),
                message: error.to_string(),
                recoverable: true,
            },
        );
    }

    /// Send a chat message through the account's session and store it.
    pub async fn send_message(&self, account: &str, to: &Jid, body: &str) -> Result<String, AccountError> {
        let session = self.session(account)?;
        let id = session.send_message(to, body).await?;
        self.record_sent(account, &session.jid(), to, id.clone(), body, MessageType::Chat)
            .await;
        Ok(id)
    }

    /// Send to a room. The room's echo carries the same id and is not
    /// stored twice.
    pub async fn send_room_message(&self, account: &str, room: &Jid, body: &str) -> Result<String, AccountError> {
        let session = self.session(account)?;
        let id = session.send_room_message(room, body).await?;
        self.record_sent(account, &session.jid(), &room.to_bare(), id.clone(), body, MessageType::Groupchat)
            .await;
        Ok(id)
    }
}
