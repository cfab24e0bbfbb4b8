//! The per-session reader loop. Stanzas are handled one at a time, in the
//! order they arrived.

use chrono::{DateTime, Utc};
use perch_core::event::{ArchiveInfo, ChatMessage, MessageType, OperationOutcome, Reactions, ReceiptStatus};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::codec::StreamItem;
use crate::element::Element;
use crate::error::{Condition, RemoteError};
use crate::extensions::{CarbonDirection, Extension, Forwarded, MarkerKind};
use crate::jid::Jid;
use crate::muc::RoomUpdate;
use crate::ns;
use crate::roster;
use crate::session::{Session, SessionEvent, new_id};
use crate::stanza::{Iq, IqType, Message, Presence, PresenceType, Stanza};
use crate::transport::StreamReader;

/// Where a delivered message came from.
enum Origin {
    Live,
    Carbon {
        direction: CarbonDirection,
        stamp: Option<DateTime<Utc>>,
    },
    Archive {
        info: ArchiveInfo,
        stamp: Option<DateTime<Utc>>,
    },
}

impl Origin {
    fn stamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Origin::Live => None,
            Origin::Carbon { stamp, .. } | Origin::Archive { stamp, .. } => *stamp,
        }
    }
}

pub(crate) async fn run(session: Session, mut reader: StreamReader, mut shutdown: watch::Receiver<bool>) {
    let reason = loop {
        if *shutdown.borrow() {
            break None;
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => break None,
            item = reader.next_item() => match item {
                Ok(StreamItem::Element(element)) if element.is("error", ns::STREAM) => {
                    let condition = element
                        .children()
                        .find(|c| c.ns() == ns::STREAMS_ERRORS && c.name() != "text")
                        .map(|c| c.name().to_string())
                        .unwrap_or_else(|| "undefined-condition".to_string());
                    break Some(format!("stream error: {condition}"));
                }
                Ok(StreamItem::Element(element)) => session.dispatch(element).await,
                Ok(StreamItem::Open(_)) => debug!("Ignoring stream header on established stream"),
                Ok(StreamItem::Invalid(reason)) => warn!(jid = %session.jid(), %reason, "Skipping undecodable stanza"),
                Ok(StreamItem::Close) => break Some("stream closed by server".to_string()),
                Err(e) => break Some(e.to_string()),
            }
        }
    };

    if let Some(reason) = reason {
        warn!(jid = %session.jid(), %reason, "Dispatch loop stopped");
        session.terminate(&reason);
        session.close_writer().await;
    }
}

impl Session {
    async fn dispatch(&self, element: Element) {
        match Stanza::decode(&element) {
            Ok(Some(Stanza::Iq(iq))) => self.handle_iq(iq).await,
            Ok(Some(Stanza::Message(message))) => self.handle_message(message).await,
            Ok(Some(Stanza::Presence(presence))) => self.handle_presence(presence),
            Ok(None) => debug!(name = element.name(), ns = %element.ns(), "Skipping non-stanza element"),
            Err(e) => warn!(name = element.name(), error = %e, "Skipping malformed stanza"),
        }
    }

    async fn reply(&self, iq: Iq) {
        if let Err(e) = self.write(&iq.to_element()).await {
            debug!(id = %iq.id, error = %e, "IQ reply not sent");
        }
    }

    async fn handle_iq(&self, iq: Iq) {
        match iq.kind {
            IqType::Result | IqType::Error => {
                let id = iq.id.clone();
                if !self.correlator().complete(iq) {
                    debug!(id = %id, "Dropping reply with no pending query");
                }
            }
            IqType::Set if iq.payload_is("query", ns::ROSTER) => self.handle_roster_push(iq).await,
            IqType::Get if iq.payload_is("ping", ns::PING) => self.reply(Iq::result_for(&iq)).await,
            _ => {
                debug!(id = %iq.id, payload = ?iq.payload.as_ref().map(Element::name), "Unsupported request");
                self.reply(Iq::error_for(&iq, Condition::ServiceUnavailable)).await;
            }
        }
    }

    /// Pushes are only trusted from our own account or our server.
    fn is_trusted_push(&self, from: Option<&Jid>) -> bool {
        let Some(from) = from else {
            return true;
        };
        let own = self.jid();
        from.bare_eq(&own) || (from.local().is_none() && from.is_bare() && from.domain() == own.domain())
    }

    async fn handle_roster_push(&self, iq: Iq) {
        if !self.is_trusted_push(iq.from.as_ref()) {
            warn!(from = ?iq.from.as_ref().map(Jid::to_string), "Ignoring roster push from foreign sender");
            self.reply(Iq::error_for(&iq, Condition::ServiceUnavailable)).await;
            return;
        }

        let items = iq.payload.as_ref().map(roster::parse_query).unwrap_or_default();
        debug!(id = %iq.id, count = items.len(), "Roster push");
        let snapshot = self.apply_roster_push(items);
        self.reply(Iq::result_for(&iq)).await;
        self.emit(SessionEvent::RosterUpdated(snapshot));
    }

    async fn handle_message(&self, message: Message) {
        let extensions: Vec<Extension> = message.extensions().collect();

        for extension in &extensions {
            match extension {
                Extension::Carbon { direction, forwarded } => {
                    if !self.is_own_account(message.from.as_ref()) {
                        warn!(from = ?message.from.as_ref().map(Jid::to_string), "Ignoring carbon from foreign sender");
                        return;
                    }
                    let origin = Origin::Carbon {
                        direction: *direction,
                        stamp: forwarded.stamp,
                    };
                    self.unwrap_forwarded(forwarded, origin).await;
                    return;
                }
                Extension::ArchiveResult { query_id, id, forwarded } => {
                    let trusted = self.is_own_account(message.from.as_ref())
                        || message
                            .from
                            .as_ref()
                            .is_some_and(|from| self.with_rooms(|rooms| rooms.contains(from)));
                    if !trusted {
                        warn!(from = ?message.from.as_ref().map(Jid::to_string), "Ignoring archive result from foreign sender");
                        return;
                    }
                    let origin = Origin::Archive {
                        info: ArchiveInfo {
                            query_id: query_id.clone(),
                            archive_id: id.clone(),
                        },
                        stamp: forwarded.stamp,
                    };
                    self.unwrap_forwarded(forwarded, origin).await;
                    return;
                }
                _ => {}
            }
        }

        self.deliver(message, extensions, Origin::Live).await;
    }

    fn is_own_account(&self, from: Option<&Jid>) -> bool {
        from.is_none_or(|from| from.is_bare() && from.bare_eq(&self.jid()))
    }

    async fn unwrap_forwarded(&self, forwarded: &Forwarded, origin: Origin) {
        match Message::from_element(&forwarded.message) {
            Ok(inner) => {
                let extensions = inner.extensions().collect();
                self.deliver(inner, extensions, origin).await;
            }
            Err(e) => warn!(error = %e, "Skipping malformed forwarded message"),
        }
    }

    async fn deliver(&self, message: Message, extensions: Vec<Extension>, origin: Origin) {
        let own = self.jid();
        let from = message.from.clone().unwrap_or_else(|| own.to_bare());

        if message.kind == MessageType::Error {
            let reason = message
                .payloads
                .iter()
                .find(|p| p.is("error", ns::CLIENT))
                .map(RemoteError::from_error_element)
                .map(|err| err.to_string())
                .unwrap_or_else(|| "message bounced".to_string());
            debug!(from = %from, id = ?message.id, %reason, "Message error");
            self.emit(SessionEvent::OperationResult {
                operation: "send_message".to_string(),
                outcome: OperationOutcome::Error(reason),
            });
            return;
        }

        let mut receipt_requested = false;
        let mut replaces = None;
        let mut reactions = None;
        let mut delay = None;
        let mut envelope = None;
        for extension in extensions {
            match extension {
                Extension::ReceiptRequest => receipt_requested = true,
                Extension::ReceiptReceived { id } => self.emit(SessionEvent::Receipt {
                    id,
                    from: from.clone(),
                    status: ReceiptStatus::Delivered,
                }),
                Extension::Marker { kind, id } => {
                    let status = match kind {
                        MarkerKind::Received => ReceiptStatus::Delivered,
                        MarkerKind::Displayed | MarkerKind::Acknowledged => ReceiptStatus::Displayed,
                    };
                    self.emit(SessionEvent::Receipt {
                        id,
                        from: from.clone(),
                        status,
                    });
                }
                Extension::Correction { id } => replaces = Some(id),
                Extension::Reactions { id, emojis } => {
                    reactions = Some(Reactions {
                        target_id: id,
                        emojis,
                    })
                }
                Extension::Delay { stamp } => delay = Some(stamp),
                Extension::Encrypted(payload) => envelope = Some(payload),
                _ => {}
            }
        }

        if message.kind == MessageType::Groupchat && message.body.is_none() {
            if let Some(subject) = &message.subject {
                let room = from.to_bare();
                if self.with_rooms(|rooms| rooms.set_subject(&room, subject)) {
                    self.emit(SessionEvent::RoomSubjectChanged {
                        room,
                        subject: subject.clone(),
                    });
                }
                return;
            }
        }

        let mut encrypted = false;
        let mut body = message.body.clone().unwrap_or_default();
        if let Some(envelope) = envelope {
            match self.encryption().decrypt(&envelope) {
                Ok(plaintext) => {
                    body = plaintext;
                    encrypted = true;
                }
                Err(e) => debug!(from = %from, error = %e, "Decryption failed, using fallback body"),
            }
        }

        if body.is_empty() && reactions.is_none() && replaces.is_none() {
            return;
        }

        if receipt_requested && matches!(origin, Origin::Live) && message.kind != MessageType::Groupchat {
            if let Some(id) = &message.id {
                if let Err(e) = self.send_receipt(&from, id).await {
                    debug!(to = %from, error = %e, "Receipt not sent");
                }
            }
        }

        let timestamp = origin.stamp().or(delay).unwrap_or_else(Utc::now);
        let archive = match origin {
            Origin::Archive { info, .. } => Some(info),
            _ => None,
        };
        let to = message.to.clone().unwrap_or_else(|| own.clone());
        let id = message
            .id
            .clone()
            .or_else(|| archive.as_ref().map(|a| a.archive_id.clone()))
            .unwrap_or_else(new_id);

        self.emit(SessionEvent::MessageReceived(ChatMessage {
            id,
            from: from.to_string(),
            to: to.to_string(),
            body,
            timestamp,
            message_type: message.kind,
            thread: message.thread,
            replaces,
            reactions,
            archive,
            encrypted,
        }));
    }

    fn handle_presence(&self, presence: Presence) {
        if let Some(updates) = self.with_rooms(|rooms| rooms.handle_presence(&presence)) {
            for update in updates {
                self.apply_room_update(update);
            }
            return;
        }

        let Some(from) = presence.from.clone() else {
            debug!("Ignoring presence without sender");
            return;
        };
        match presence.kind {
            PresenceType::Available | PresenceType::Unavailable => {
                self.emit(SessionEvent::PresenceChanged {
                    jid: from,
                    show: presence.availability(),
                    status: presence.status,
                    priority: presence.priority,
                });
            }
            PresenceType::Subscribe => self.emit(SessionEvent::SubscriptionRequest { from: from.to_bare() }),
            PresenceType::Subscribed => self.emit(SessionEvent::SubscriptionApproved { jid: from.to_bare() }),
            PresenceType::Unsubscribed => self.emit(SessionEvent::SubscriptionRevoked { jid: from.to_bare() }),
            PresenceType::Unsubscribe => debug!(from = %from, "Contact unsubscribed from our presence"),
            PresenceType::Probe => debug!(from = %from, "Ignoring presence probe"),
            PresenceType::Error => {
                debug!(from = %from, error = %RemoteError::from_stanza(&presence.to_element()), "Presence error")
            }
        }
    }

    fn apply_room_update(&self, update: RoomUpdate) {
        match update {
            RoomUpdate::Joined { room, nick } => self.emit(SessionEvent::RoomJoined { room, nick }),
            RoomUpdate::Left { room } => self.emit(SessionEvent::RoomLeft { room }),
            RoomUpdate::OccupantChanged { room, occupant } => {
                self.emit(SessionEvent::OccupantChanged { room, occupant })
            }
            RoomUpdate::NeedsInstantConfig { room } => {
                let session = self.clone();
                tokio::spawn(async move { session.configure_instant_room(room).await });
            }
            RoomUpdate::JoinFailed { room, reason } => {
                warn!(room = %room, %reason, "Room join refused");
                self.emit(SessionEvent::OperationResult {
                    operation: "join_room".to_string(),
                    outcome: OperationOutcome::Error(reason),
                });
            }
        }
    }
}
