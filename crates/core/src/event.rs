use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::EventBusError;

/// Hierarchical channel name validation and parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(crate::PerchError::Internal(format!(
                "Invalid channel name: {}",
                name
            )))
        }
    }

    /// Check if a channel name is valid.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        // Lowercase a-z, 0-9, underscores and dots only
        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.' | '_'))
        {
            return false;
        }

        matches!(name.split('.').next(), Some("system" | "xmpp"))
    }

    /// Get the domain of the channel.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// Get the full channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// The standard event envelope wrapping all events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hierarchical channel name (e.g., "xmpp.message.received")
    pub channel: Channel,

    /// When the event was created (UTC)
    pub timestamp: DateTime<Utc>,

    /// Unique identifier for this event
    pub id: Uuid,

    /// Optional correlation ID linking related events (e.g., connect attempt and outcome)
    pub correlation_id: Option<Uuid>,

    /// Source component that emitted this event
    pub source: EventSource,

    /// The typed event payload
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with a given channel and payload.
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            correlation_id: None,
            source,
            payload,
        }
    }

    /// Create a new event with a correlation ID.
    pub fn with_correlation(
        channel: Channel,
        source: EventSource,
        payload: EventPayload,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            correlation_id: Some(correlation_id),
            source,
            payload,
        }
    }
}

/// Identifies the source of an event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    /// Core system component
    System(String),
    /// Session engine of one account, identified by its bare JID
    Account(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── System events ──────────────────────────────────────────────
    ConnectionEstablished {
        account: String,
        jid: String,
    },
    ConnectionLost {
        account: String,
        reason: String,
        will_retry: bool,
    },
    ConnectionReconnecting {
        account: String,
        attempt: u32,
    },
    AccountStatusChanged {
        account: String,
        status: AccountStatus,
    },
    ErrorOccurred {
        component: String,
        message: String,
        recoverable: bool,
    },

    // ── XMPP Roster events ────────────────────────────────────────
    RosterUpdated {
        account: String,
        items: Vec<RosterItem>,
    },
    SubscriptionRequest {
        account: String,
        from: String,
    },
    SubscriptionApproved {
        account: String,
        jid: String,
    },
    SubscriptionRevoked {
        account: String,
        jid: String,
    },

    // ── XMPP Presence events ──────────────────────────────────────
    PresenceChanged {
        account: String,
        jid: String,
        show: PresenceShow,
        status: Option<String>,
        priority: i8,
    },

    // ── XMPP Message events ──────────────────────────────────────
    MessageReceived {
        account: String,
        message: ChatMessage,
    },
    MessageSent {
        account: String,
        message: ChatMessage,
    },
    ReceiptReceived {
        account: String,
        id: String,
        from: String,
        status: ReceiptStatus,
    },

    // ── XMPP MUC events ──────────────────────────────────────────
    RoomJoined {
        account: String,
        room: String,
        nick: String,
    },
    RoomLeft {
        account: String,
        room: String,
    },
    RoomSubjectChanged {
        account: String,
        room: String,
        subject: String,
    },
    RoomOccupantChanged {
        account: String,
        room: String,
        occupant: MucOccupant,
    },

    // ── XMPP archive events ──────────────────────────────────────
    ArchivePageComplete {
        account: String,
        query_id: String,
        complete: bool,
        last_id: Option<String>,
    },

    // ── Operation outcomes ───────────────────────────────────────
    OperationResult {
        account: String,
        operation: String,
        outcome: OperationOutcome,
    },
}

/// Lifecycle status of one configured account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccountStatus {
    Offline,
    Connecting,
    Online,
    Failed,
    Disconnecting,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Offline => "offline",
            AccountStatus::Connecting => "connecting",
            AccountStatus::Online => "online",
            AccountStatus::Failed => "failed",
            AccountStatus::Disconnecting => "disconnecting",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "offline" => Some(AccountStatus::Offline),
            "connecting" => Some(AccountStatus::Connecting),
            "online" => Some(AccountStatus::Online),
            "failed" => Some(AccountStatus::Failed),
            "disconnecting" => Some(AccountStatus::Disconnecting),
            _ => None,
        }
    }
}

/// A single entry in the XMPP roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterItem {
    /// The contact's bare JID (e.g., "alice@example.com")
    pub jid: String,

    /// Display name set by the user, if any
    pub name: Option<String>,

    /// Roster subscription state
    pub subscription: Subscription,

    /// User-defined groups this contact belongs to
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Subscription {
    None,
    To,
    From,
    Both,
    /// Delete marker carried by roster pushes; never stored.
    Remove,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
            Subscription::Remove => "remove",
        }
    }

    /// Unknown values fall back to `none`, as RFC 6121 treats a missing attribute.
    pub fn parse(value: &str) -> Self {
        match value {
            "to" => Subscription::To,
            "from" => Subscription::From,
            "both" => Subscription::Both,
            "remove" => Subscription::Remove,
            _ => Subscription::None,
        }
    }
}

/// A chat message (1:1 or MUC).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Server-assigned or client-generated unique message ID
    pub id: String,

    /// JID of the sender (full JID for MUC occupants)
    pub from: String,

    /// JID of the recipient (or room JID for MUC)
    pub to: String,

    /// Plain-text message body
    pub body: String,

    /// When the message was sent (UTC); the delay stamp for archived messages
    pub timestamp: DateTime<Utc>,

    /// Message type
    pub message_type: MessageType,

    /// Thread ID for conversation threading, if present
    pub thread: Option<String>,

    /// Id of the message this one corrects (XEP-0308)
    pub replaces: Option<String>,

    /// Reactions carried by this message, keyed to the reacted message id (XEP-0444)
    pub reactions: Option<Reactions>,

    /// Set when the message was replayed from the server archive
    pub archive: Option<ArchiveInfo>,

    /// True when the body was decrypted from an end-to-end encrypted payload
    pub encrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reactions {
    pub target_id: String,
    pub emojis: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveInfo {
    pub query_id: Option<String>,
    pub archive_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Chat,
    Groupchat,
    Normal,
    Headline,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Chat => "chat",
            MessageType::Groupchat => "groupchat",
            MessageType::Normal => "normal",
            MessageType::Headline => "headline",
            MessageType::Error => "error",
        }
    }

    /// A missing or unknown type attribute means `normal` (RFC 6121 §5.2.2).
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("chat") => MessageType::Chat,
            Some("groupchat") => MessageType::Groupchat,
            Some("headline") => MessageType::Headline,
            Some("error") => MessageType::Error,
            _ => MessageType::Normal,
        }
    }
}

/// XMPP presence "show" values (RFC 6121 section 4.7.2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PresenceShow {
    /// Available (no <show/> element -- the default)
    Available,
    /// Free for chat
    Chat,
    /// Away
    Away,
    /// Extended away
    Xa,
    /// Do not disturb
    Dnd,
    /// Unavailable (offline)
    Unavailable,
}

impl PresenceShow {
    /// The `<show/>` element text, if this value is carried by one.
    pub fn show_text(&self) -> Option<&'static str> {
        match self {
            PresenceShow::Chat => Some("chat"),
            PresenceShow::Away => Some("away"),
            PresenceShow::Xa => Some("xa"),
            PresenceShow::Dnd => Some("dnd"),
            PresenceShow::Available | PresenceShow::Unavailable => None,
        }
    }

    pub fn from_show_text(value: &str) -> Self {
        match value {
            "chat" => PresenceShow::Chat,
            "away" => PresenceShow::Away,
            "xa" => PresenceShow::Xa,
            "dnd" => PresenceShow::Dnd,
            _ => PresenceShow::Available,
        }
    }
}

/// Delivery state reported back by a peer for a message we sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReceiptStatus {
    /// XEP-0184 receipt or XEP-0333 `received` marker
    Delivered,
    /// XEP-0333 `displayed` marker
    Displayed,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Delivered => "delivered",
            ReceiptStatus::Displayed => "displayed",
        }
    }
}

/// An occupant in a MUC room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MucOccupant {
    /// The occupant's room nick
    pub nick: String,

    /// The occupant's real JID, if visible
    pub jid: Option<String>,

    /// MUC affiliation
    pub affiliation: MucAffiliation,

    /// MUC role
    pub role: MucRole,

    /// Presence of the occupant inside the room
    pub show: PresenceShow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MucAffiliation {
    Owner,
    Admin,
    Member,
    Outcast,
    None,
}

impl MucAffiliation {
    pub fn parse(value: &str) -> Self {
        match value {
            "owner" => MucAffiliation::Owner,
            "admin" => MucAffiliation::Admin,
            "member" => MucAffiliation::Member,
            "outcast" => MucAffiliation::Outcast,
            _ => MucAffiliation::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MucRole {
    Moderator,
    Participant,
    Visitor,
    None,
}

impl MucRole {
    pub fn parse(value: &str) -> Self {
        match value {
            "moderator" => MucRole::Moderator,
            "participant" => MucRole::Participant,
            "visitor" => MucRole::Visitor,
            _ => MucRole::None,
        }
    }
}

/// Outcome of a UI-initiated operation that completes asynchronously.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "camelCase")]
pub enum OperationOutcome {
    Success,
    Error(String),
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> std::result::Result<(), EventBusError>;
    fn subscribe(&self, pattern: &str) -> std::result::Result<EventSubscription, EventBusError>;
}

#[derive(Clone)]
pub struct BroadcastEventBus {
    system_sender: broadcast::Sender<Event>,
    xmpp_sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let (system_sender, _) = broadcast::channel(capacity);
        let (xmpp_sender, _) = broadcast::channel(capacity);

        Self {
            system_sender,
            xmpp_sender,
        }
    }

    fn sender_for_domain(&self, domain: &str) -> Option<&broadcast::Sender<Event>> {
        match domain {
            "system" => Some(&self.system_sender),
            "xmpp" => Some(&self.xmpp_sender),
            _ => None,
        }
    }

    fn receivers_for_pattern(
        &self,
        pattern: &str,
    ) -> std::result::Result<DomainReceivers, EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();

        if first_segment.is_empty() {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }

        if has_glob_meta(first_segment) {
            return Ok(DomainReceivers {
                system: Some(self.system_sender.subscribe()),
                xmpp: Some(self.xmpp_sender.subscribe()),
            });
        }

        match first_segment {
            "system" => Ok(DomainReceivers {
                system: Some(self.system_sender.subscribe()),
                xmpp: None,
            }),
            "xmpp" => Ok(DomainReceivers {
                system: None,
                xmpp: Some(self.xmpp_sender.subscribe()),
            }),
            _ => Err(EventBusError::InvalidPattern(pattern.to_string())),
        }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> std::result::Result<(), EventBusError> {
        let sender = self
            .sender_for_domain(event.channel.domain())
            .ok_or_else(|| EventBusError::InvalidChannel(event.channel.to_string()))?;

        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> std::result::Result<EventSubscription, EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = self.receivers_for_pattern(pattern)?;

        Ok(EventSubscription { matcher, receivers })
    }
}

struct DomainReceivers {
    system: Option<broadcast::Receiver<Event>>,
    xmpp: Option<broadcast::Receiver<Event>>,
}

pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: DomainReceivers,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> std::result::Result<Event, EventBusError> {
        loop {
            let system_receiver = self.receivers.system.as_mut();
            let xmpp_receiver = self.receivers.xmpp.as_mut();

            let received = tokio::select! {
                result = recv_from_domain(system_receiver) => result,
                result = recv_from_domain(xmpp_receiver) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(EventBusError::Lagged(count));
                }
            }
        }
    }
}

async fn recv_from_domain(
    receiver: Option<&mut broadcast::Receiver<Event>>,
) -> std::result::Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains('*')
        || segment.contains('?')
        || segment.contains('[')
        || segment.contains(']')
        || segment.contains('{')
        || segment.contains('}')
        || segment.contains('!')
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_channel_validation() {
        assert!(Channel::is_valid("system.connection.established"));
        assert!(Channel::is_valid("xmpp.message.received"));
        assert!(Channel::is_valid("xmpp.room.occupant_changed"));

        assert!(!Channel::is_valid("ui.theme.changed"));
        assert!(!Channel::is_valid("invalid.domain.event"));
        assert!(!Channel::is_valid("system..double.dot"));
        assert!(!Channel::is_valid(".starts.with.dot"));
        assert!(!Channel::is_valid("ends.with.dot."));
        assert!(!Channel::is_valid("UpperCase"));
        assert!(!Channel::is_valid("with-hyphen"));
        assert!(!Channel::is_valid(""));
    }

    #[test]
    fn test_channel_domain() {
        let c = Channel::new("xmpp.message.received").unwrap();
        assert_eq!(c.domain(), "xmpp");
    }

    #[test]
    fn subscription_parse_defaults_to_none() {
        assert_eq!(Subscription::parse("both"), Subscription::Both);
        assert_eq!(Subscription::parse("remove"), Subscription::Remove);
        assert_eq!(Subscription::parse("bogus"), Subscription::None);
    }

    #[test]
    fn message_type_parse_defaults_to_normal() {
        assert_eq!(MessageType::parse(Some("chat")), MessageType::Chat);
        assert_eq!(MessageType::parse(None), MessageType::Normal);
        assert_eq!(MessageType::parse(Some("weird")), MessageType::Normal);
    }

    #[tokio::test]
    async fn subscription_filters_by_glob() {
        let bus = BroadcastEventBus::default();
        let mut rooms = bus.subscribe("xmpp.room.**").unwrap();

        bus.publish(Event::new(
            Channel::new("xmpp.message.received").unwrap(),
            EventSource::Account("alice@example.com".into()),
            EventPayload::RoomLeft {
                account: "alice@example.com".into(),
                room: "ignored@muc.example.com".into(),
            },
        ))
        .unwrap();
        bus.publish(Event::new(
            Channel::new("xmpp.room.left").unwrap(),
            EventSource::Account("alice@example.com".into()),
            EventPayload::RoomLeft {
                account: "alice@example.com".into(),
                room: "team@muc.example.com".into(),
            },
        ))
        .unwrap();

        let event = tokio::time::timeout(Duration::from_millis(100), rooms.recv())
            .await
            .expect("timed out")
            .expect("should receive event");
        assert_matches!(
            event.payload,
            EventPayload::RoomLeft { ref room, .. } if room == "team@muc.example.com"
        );
    }

    #[tokio::test]
    async fn wildcard_domain_receives_system_and_xmpp() {
        let bus = BroadcastEventBus::new(8);
        let mut all = bus.subscribe("{system,xmpp}.**").unwrap();

        bus.publish(Event::new(
            Channel::new("system.account.status").unwrap(),
            EventSource::System("test".into()),
            EventPayload::AccountStatusChanged {
                account: "alice@example.com".into(),
                status: AccountStatus::Online,
            },
        ))
        .unwrap();

        let event = tokio::time::timeout(Duration::from_millis(100), all.recv())
            .await
            .expect("timed out")
            .expect("should receive event");
        assert_eq!(event.channel.as_str(), "system.account.status");
    }

    #[test]
    fn unknown_domain_pattern_is_rejected() {
        let bus = BroadcastEventBus::default();
        assert!(matches!(
            bus.subscribe("ui.**"),
            Err(EventBusError::InvalidPattern(_))
        ));
    }
}
