//! An established XMPP session and the operations callers run on it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use perch_core::config::TimeoutConfig;
use perch_core::event::{
    ChatMessage, MessageType, MucOccupant, OperationOutcome, PresenceShow, ReceiptStatus,
    RosterItem,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::correlator::IqCorrelator;
use crate::dispatch;
use crate::element::{Element, ElementExt};
use crate::encryption::{FALLBACK_BODY, PayloadEncryption};
use crate::error::{Condition, XmppError};
use crate::extensions::{self, MarkerKind};
use crate::jid::Jid;
use crate::muc::{self, Room, RoomRegistry};
use crate::negotiator::Negotiated;
use crate::ns;
use crate::roster::{self, Roster};
use crate::stanza::{Iq, Message, Presence, PresenceType};
use crate::transport::StreamWriter;

/// Everything a session reports to its owner, in wire order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected {
        jid: Jid,
    },
    Disconnected {
        reason: String,
    },
    MessageReceived(ChatMessage),
    PresenceChanged {
        jid: Jid,
        show: PresenceShow,
        status: Option<String>,
        priority: i8,
    },
    SubscriptionRequest {
        from: Jid,
    },
    SubscriptionApproved {
        jid: Jid,
    },
    SubscriptionRevoked {
        jid: Jid,
    },
    /// Full roster snapshot after a query reply or a push.
    RosterUpdated(Vec<RosterItem>),
    Receipt {
        id: String,
        from: Jid,
        status: ReceiptStatus,
    },
    RoomJoined {
        room: Jid,
        nick: String,
    },
    RoomLeft {
        room: Jid,
    },
    RoomSubjectChanged {
        room: Jid,
        subject: String,
    },
    OccupantChanged {
        room: Jid,
        occupant: MucOccupant,
    },
    ArchivePageComplete {
        query_id: String,
        complete: bool,
        last_id: Option<String>,
    },
    OperationResult {
        operation: String,
        outcome: OperationOutcome,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub roster: Duration,
    pub roster_set: Duration,
    pub carbons: Duration,
    pub bind: Duration,
    pub ping: Duration,
    pub archive: Duration,
    pub query: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self::from(&TimeoutConfig::default())
    }
}

impl From<&TimeoutConfig> for SessionTimeouts {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            roster: Duration::from_secs(config.roster_seconds),
            roster_set: Duration::from_secs(config.query_seconds),
            carbons: Duration::from_secs(config.carbons_seconds),
            bind: Duration::from_secs(config.query_seconds),
            ping: Duration::from_secs(config.ping_seconds),
            archive: Duration::from_secs(config.archive_seconds),
            query: Duration::from_secs(config.query_seconds),
        }
    }
}

/// How a room created by [`Session::create_room`] gets configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RoomOptions {
    /// Accept the server defaults as soon as the room exists.
    #[default]
    Instant,
    /// Leave the room locked for the caller to configure.
    Reserved,
}

/// Paging controls for a message archive query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveQuery {
    /// Only messages exchanged with this JID.
    pub with: Option<Jid>,
    /// Archive id to page forward from.
    pub after: Option<String>,
    /// Archive id to page backward from; an empty string requests the last page.
    pub before: Option<String>,
    pub max: usize,
}

impl Default for ArchiveQuery {
    fn default() -> Self {
        Self {
            with: None,
            after: None,
            before: None,
            max: 50,
        }
    }
}

impl ArchiveQuery {
    pub fn with(jid: Jid) -> Self {
        Self {
            with: Some(jid),
            ..Self::default()
        }
    }

    pub fn after(mut self, id: impl Into<String>) -> Self {
        self.after = Some(id.into());
        self
    }

    fn to_element(&self, query_id: &str) -> Element {
        let mut fields = vec![
            Element::builder("field", ns::DATA_FORMS)
                .attr("var", "FORM_TYPE")
                .attr("type", "hidden")
                .append(Element::builder("value", ns::DATA_FORMS).append(ns::MAM).build())
                .build(),
        ];
        if let Some(with) = &self.with {
            fields.push(
                Element::builder("field", ns::DATA_FORMS)
                    .attr("var", "with")
                    .append(
                        Element::builder("value", ns::DATA_FORMS)
                            .append(with.to_string())
                            .build(),
                    )
                    .build(),
            );
        }

        let mut set = Element::builder("set", ns::RSM)
            .append(Element::builder("max", ns::RSM).append(self.max.to_string()).build());
        if let Some(after) = &self.after {
            set = set.append(Element::builder("after", ns::RSM).append(after.as_str()).build());
        }
        if let Some(before) = &self.before {
            set = set.append(Element::builder("before", ns::RSM).append(before.as_str()).build());
        }

        Element::builder("query", ns::MAM)
            .attr("queryid", query_id)
            .append(
                Element::builder("x", ns::DATA_FORMS)
                    .attr("type", "submit")
                    .append_all(fields)
                    .build(),
            )
            .append(set.build())
            .build()
    }
}

struct State {
    jid: Jid,
    established: bool,
}

struct Inner {
    state: RwLock<State>,
    writer: tokio::sync::Mutex<StreamWriter>,
    correlator: IqCorrelator,
    roster: Mutex<Roster>,
    rooms: Mutex<RoomRegistry>,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: watch::Sender<bool>,
    encryption: Arc<dyn PayloadEncryption>,
    timeouts: SessionTimeouts,
}

/// Handle to one established session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl Session {
    /// Take over a negotiated stream and start its dispatch loop.
    pub fn start(
        negotiated: Negotiated,
        encryption: Arc<dyn PayloadEncryption>,
        timeouts: SessionTimeouts,
    ) -> Result<(Session, mpsc::UnboundedReceiver<SessionEvent>), XmppError> {
        let jid = negotiated.jid;
        let (reader, writer) = negotiated.stream.into_split()?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let session = Session {
            inner: Arc::new(Inner {
                state: RwLock::new(State {
                    jid: jid.clone(),
                    established: true,
                }),
                writer: tokio::sync::Mutex::new(writer),
                correlator: IqCorrelator::new(jid.clone()),
                roster: Mutex::new(Roster::new()),
                rooms: Mutex::new(RoomRegistry::default()),
                events,
                shutdown,
                encryption,
                timeouts,
            }),
        };

        info!(jid = %jid, "Session established");
        session.emit(SessionEvent::Connected { jid });
        tokio::spawn(dispatch::run(session.clone(), reader, shutdown_rx));
        Ok((session, events_rx))
    }

    pub fn jid(&self) -> Jid {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .jid
            .clone()
    }

    pub fn bare_jid(&self) -> Jid {
        self.jid().to_bare()
    }

    pub fn is_established(&self) -> bool {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .established
    }

    pub fn timeouts(&self) -> SessionTimeouts {
        self.inner.timeouts
    }

    pub fn roster(&self) -> Vec<RosterItem> {
        lock(&self.inner.roster).items()
    }

    pub fn room(&self, room: &Jid) -> Option<Room> {
        lock(&self.inner.rooms).get(room).cloned()
    }

    pub fn rooms(&self) -> Vec<Room> {
        lock(&self.inner.rooms).rooms()
    }

    pub fn pending_queries(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    fn ensure_established(&self) -> Result<(), XmppError> {
        if self.is_established() {
            Ok(())
        } else {
            Err(XmppError::NotConnected)
        }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if self.inner.events.send(event).is_err() {
            debug!("Session event dropped; receiver is gone");
        }
    }

    pub(crate) fn correlator(&self) -> &IqCorrelator {
        &self.inner.correlator
    }

    pub(crate) fn encryption(&self) -> &dyn PayloadEncryption {
        self.inner.encryption.as_ref()
    }

    pub(crate) fn with_rooms<R>(&self, f: impl FnOnce(&mut RoomRegistry) -> R) -> R {
        f(&mut lock(&self.inner.rooms))
    }

    /// Apply roster items and return the resulting snapshot.
    pub(crate) fn apply_roster_push(&self, items: Vec<RosterItem>) -> Vec<RosterItem> {
        let mut roster = lock(&self.inner.roster);
        roster.apply_push(items);
        roster.items()
    }

    /// Write one element. A failed write ends the session.
    pub(crate) async fn write(&self, element: &Element) -> Result<(), XmppError> {
        self.ensure_established()?;
        let result = self.inner.writer.lock().await.send(element).await;
        if let Err(e) = &result {
            self.terminate(&e.to_string());
        }
        result
    }

    /// Mark the session closed, fail pending queries, and stop the loop.
    /// Only the first call has any effect.
    pub(crate) fn terminate(&self, reason: &str) {
        {
            let mut state = self
                .inner
                .state
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if !state.established {
                return;
            }
            state.established = false;
        }
        self.inner.correlator.cancel_all();
        let _ = self.inner.shutdown.send(true);
        info!(jid = %self.jid(), reason, "Session closed");
        self.emit(SessionEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    pub(crate) async fn close_writer(&self) {
        if let Err(e) = self.inner.writer.lock().await.close().await {
            debug!(error = %e, "Closing stream failed");
        }
    }

    /// Send an IQ and wait for its reply.
    pub async fn send_iq(&self, iq: Iq, timeout: Duration) -> Result<Iq, XmppError> {
        self.ensure_established()?;
        let element = iq.to_element();
        self.inner
            .correlator
            .send_and_wait(&iq.id, iq.to.as_ref(), timeout, self.write(&element))
            .await
    }

    pub async fn send_message(&self, to: &Jid, body: &str) -> Result<String, XmppError> {
        let id = new_id();
        let message = Message::chat(to.clone(), body)
            .with_id(&id)
            .with_payload(extensions::receipt_request())
            .with_payload(extensions::markable());
        self.write(&message.to_element()).await?;
        debug!(id = %id, to = %to, "Message sent");
        Ok(id)
    }

    pub async fn send_room_message(&self, room: &Jid, body: &str) -> Result<String, XmppError> {
        let id = new_id();
        let message = Message::new(MessageType::Groupchat, Some(room.to_bare()))
            .with_id(&id)
            .with_body(body)
            .with_payload(extensions::markable());
        self.write(&message.to_element()).await?;
        Ok(id)
    }

    /// Send an end-to-end encrypted message, or plaintext when the
    /// recipient has no known devices or encryption fails.
    pub async fn send_encrypted_message(&self, to: &Jid, body: &str) -> Result<String, XmppError> {
        self.ensure_established()?;
        let bare = to.bare_string();
        let devices = self.encryption().known_devices(&bare);
        if devices.is_empty() {
            debug!(to = %bare, "No known devices, sending plaintext");
            return self.send_message(to, body).await;
        }

        let envelope = match self.encryption().encrypt(body, &devices) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(to = %bare, error = %e, "Encryption failed, sending plaintext");
                return self.send_message(to, body).await;
            }
        };

        let id = new_id();
        let message = Message::chat(to.clone(), FALLBACK_BODY)
            .with_id(&id)
            .with_payload(envelope.to_element())
            .with_payload(extensions::encryption_notice())
            .with_payload(extensions::store_hint())
            .with_payload(extensions::receipt_request())
            .with_payload(extensions::markable());
        self.write(&message.to_element()).await?;
        Ok(id)
    }

    pub async fn send_presence(
        &self,
        show: PresenceShow,
        status: Option<&str>,
        priority: i8,
    ) -> Result<(), XmppError> {
        let presence = availability_presence(show, status, priority);
        self.write(&presence.to_element()).await
    }

    pub async fn send_directed_presence(
        &self,
        to: &Jid,
        show: PresenceShow,
        status: Option<&str>,
    ) -> Result<(), XmppError> {
        let presence = availability_presence(show, status, 0).to(to.clone());
        self.write(&presence.to_element()).await
    }

    /// Appear offline to one contact.
    pub async fn hide_status_from(&self, to: &Jid) -> Result<(), XmppError> {
        let presence = Presence::new(PresenceType::Unavailable).to(to.clone());
        self.write(&presence.to_element()).await
    }

    async fn send_subscription(&self, to: &Jid, kind: PresenceType) -> Result<(), XmppError> {
        let presence = Presence::new(kind).to(to.to_bare());
        self.write(&presence.to_element()).await
    }

    pub async fn subscribe(&self, to: &Jid) -> Result<(), XmppError> {
        self.send_subscription(to, PresenceType::Subscribe).await
    }

    pub async fn unsubscribe(&self, to: &Jid) -> Result<(), XmppError> {
        self.send_subscription(to, PresenceType::Unsubscribe).await
    }

    pub async fn approve_subscription(&self, to: &Jid) -> Result<(), XmppError> {
        self.send_subscription(to, PresenceType::Subscribed).await
    }

    pub async fn deny_subscription(&self, to: &Jid) -> Result<(), XmppError> {
        self.send_subscription(to, PresenceType::Unsubscribed).await
    }

    /// Fetch the roster and replace the local copy with it.
    pub async fn request_roster(&self) -> Result<Vec<RosterItem>, XmppError> {
        let reply = self
            .send_iq(Iq::get(new_id(), roster::query()), self.inner.timeouts.roster)
            .await?;
        let items = reply
            .payload
            .as_ref()
            .filter(|payload| payload.is("query", ns::ROSTER))
            .map(roster::parse_query)
            .unwrap_or_default();

        let snapshot = {
            let mut roster = lock(&self.inner.roster);
            roster.replace_all(items);
            roster.items()
        };
        debug!(count = snapshot.len(), "Roster received");
        self.emit(SessionEvent::RosterUpdated(snapshot.clone()));
        Ok(snapshot)
    }

    /// Ask the server to add or update a contact. The local roster changes
    /// when the resulting push arrives.
    pub async fn add_contact(
        &self,
        jid: &Jid,
        name: Option<&str>,
        groups: &[String],
    ) -> Result<(), XmppError> {
        let query = roster::set_query(jid, name, groups, false);
        self.send_iq(Iq::set(new_id(), query), self.inner.timeouts.roster_set)
            .await
            .map(|_| ())
    }

    pub async fn remove_contact(&self, jid: &Jid) -> Result<(), XmppError> {
        let query = roster::set_query(jid, None, &[], true);
        self.send_iq(Iq::set(new_id(), query), self.inner.timeouts.roster_set)
            .await
            .map(|_| ())
    }

    pub async fn join_room(
        &self,
        room: &Jid,
        nick: &str,
        password: Option<&str>,
    ) -> Result<(), XmppError> {
        self.enter_room(room, nick, password, false).await
    }

    pub async fn create_room(
        &self,
        room: &Jid,
        nick: &str,
        options: RoomOptions,
    ) -> Result<(), XmppError> {
        self.enter_room(room, nick, None, options == RoomOptions::Instant)
            .await
    }

    async fn enter_room(
        &self,
        room: &Jid,
        nick: &str,
        password: Option<&str>,
        instant: bool,
    ) -> Result<(), XmppError> {
        self.ensure_established()?;
        let occupant = room.to_bare().with_resource(nick)?;
        self.with_rooms(|rooms| rooms.begin_join(room, nick, instant));

        let presence = Presence::new(PresenceType::Available)
            .to(occupant)
            .with_payload(muc::join_payload(password));
        if let Err(e) = self.write(&presence.to_element()).await {
            self.with_rooms(|rooms| rooms.remove(room));
            return Err(e);
        }
        Ok(())
    }

    pub async fn leave_room(&self, room: &Jid) -> Result<(), XmppError> {
        let nick = self
            .room(room)
            .map(|state| state.nick)
            .ok_or_else(|| XmppError::UnknownRoom(room.bare_string()))?;
        let presence = Presence::new(PresenceType::Unavailable).to(room.to_bare().with_resource(&nick)?);
        self.write(&presence.to_element()).await
    }

    /// Unlock a room we just created with its default configuration.
    pub(crate) async fn configure_instant_room(&self, room: Jid) {
        let iq = Iq::set(new_id(), muc::instant_room_config()).to(room.clone());
        let outcome = match self.send_iq(iq, self.inner.timeouts.query).await {
            Ok(_) => {
                debug!(room = %room, "Instant room configured");
                OperationOutcome::Success
            }
            Err(e) => {
                warn!(room = %room, error = %e, "Instant room configuration failed");
                OperationOutcome::Error(e.to_string())
            }
        };
        self.emit(SessionEvent::OperationResult {
            operation: "create_room".to_string(),
            outcome,
        });
    }

    /// Enable message carbons. Servers without support are not an error.
    pub async fn enable_carbons(&self) -> Result<(), XmppError> {
        let iq = Iq::set(new_id(), Element::bare("enable", ns::CARBONS));
        match self.send_iq(iq, self.inner.timeouts.carbons).await {
            Ok(_) => Ok(()),
            Err(XmppError::Remote(err))
                if matches!(
                    err.condition,
                    Some(
                        Condition::FeatureNotImplemented
                            | Condition::ServiceUnavailable
                            | Condition::NotAuthorized
                    )
                ) =>
            {
                debug!(error = %err, "Carbons unavailable");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn send_receipt(&self, to: &Jid, id: &str) -> Result<(), XmppError> {
        let message = Message::new(MessageType::Chat, Some(to.clone()))
            .with_id(new_id())
            .with_payload(extensions::receipt_received(id));
        self.write(&message.to_element()).await
    }

    pub async fn send_displayed_marker(&self, to: &Jid, id: &str) -> Result<(), XmppError> {
        let message = Message::new(MessageType::Chat, Some(to.clone()))
            .with_id(new_id())
            .with_payload(extensions::marker(MarkerKind::Displayed, id))
            .with_payload(extensions::store_hint());
        self.write(&message.to_element()).await
    }

    /// Request one page of archived messages. Returns the query id that
    /// tags the replayed messages; completion is reported as
    /// [`SessionEvent::ArchivePageComplete`].
    pub async fn request_archive_page(&self, query: ArchiveQuery) -> Result<String, XmppError> {
        self.ensure_established()?;
        let query_id = new_id();
        let iq = Iq::set(new_id(), query.to_element(&query_id));

        let rx = self.inner.correlator.register(&iq.id, iq.to.as_ref())?;
        if let Err(e) = self.write(&iq.to_element()).await {
            self.inner.correlator.forget(&iq.id);
            return Err(e);
        }

        let session = self.clone();
        let timeout = self.inner.timeouts.archive;
        let fin_query_id = query_id.clone();
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(XmppError::Cancelled),
                Err(_) => {
                    session.inner.correlator.forget(&iq.id);
                    Err(XmppError::Timeout)
                }
            };
            session.finish_archive_page(fin_query_id, outcome);
        });
        Ok(query_id)
    }

    fn finish_archive_page(&self, query_id: String, outcome: Result<Iq, XmppError>) {
        match outcome {
            Ok(reply) => {
                let fin = reply.payload.as_ref().filter(|p| p.is("fin", ns::MAM));
                let complete = fin.is_some_and(|f| matches!(f.attr("complete"), Some("true" | "1")));
                let last_id = fin
                    .and_then(|f| f.get_child("set", ns::RSM))
                    .and_then(|set| set.child_text("last", ns::RSM));
                self.emit(SessionEvent::ArchivePageComplete {
                    query_id,
                    complete,
                    last_id,
                });
            }
            Err(XmppError::Cancelled) => debug!(query_id = %query_id, "Archive query cancelled"),
            Err(e) => {
                warn!(query_id = %query_id, error = %e, "Archive query failed");
                self.emit(SessionEvent::OperationResult {
                    operation: "request_archive_page".to_string(),
                    outcome: OperationOutcome::Error(e.to_string()),
                });
            }
        }
    }

    /// Ping the server. Any reply, including an error, proves liveness.
    pub async fn ping(&self) -> Result<(), XmppError> {
        let server = Jid::parse(self.jid().domain())?;
        let iq = Iq::get(new_id(), Element::bare("ping", ns::PING)).to(server);
        match self.send_iq(iq, self.inner.timeouts.ping).await {
            Ok(_) | Err(XmppError::Remote(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Close the stream gracefully and cancel everything pending.
    pub async fn close(&self) {
        if !self.is_established() {
            return;
        }
        self.close_writer().await;
        self.terminate("closed by client");
    }
}

fn availability_presence(show: PresenceShow, status: Option<&str>, priority: i8) -> Presence {
    let kind = if show == PresenceShow::Unavailable {
        PresenceType::Unavailable
    } else {
        PresenceType::Available
    };
    let mut presence = Presence::new(kind);
    presence.show = Some(show);
    presence.status = status.map(str::to_string);
    presence.priority = priority;
    presence
}
