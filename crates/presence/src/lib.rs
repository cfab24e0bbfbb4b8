//! Contact presence per account, aggregated across resources.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use perch_core::error::EventBusError;
use perch_core::event::{Event, EventBus, EventPayload, PresenceShow};
use perch_xmpp::Jid;

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("invalid priority value: {0} (must be -128..127)")]
    InvalidPriority(i16),

    #[error("event bus error: {0}")]
    EventBus(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceInfo {
    /// Bare JID of the contact (or of the account, for own presence).
    pub jid: String,
    /// Resource the presence came from; `None` when nothing is online.
    pub resource: Option<String>,
    pub show: PresenceShow,
    pub status: Option<String>,
    pub priority: i8,
    pub last_updated: DateTime<Utc>,
}

impl PresenceInfo {
    fn unavailable(jid: &str) -> Self {
        Self {
            jid: jid.to_string(),
            resource: None,
            show: PresenceShow::Unavailable,
            status: None,
            priority: 0,
            last_updated: Utc::now(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.show != PresenceShow::Unavailable
    }
}

/// Tie-break between resources of equal priority.
fn show_rank(show: PresenceShow) -> u8 {
    match show {
        PresenceShow::Chat => 5,
        PresenceShow::Available => 4,
        PresenceShow::Away => 3,
        PresenceShow::Dnd => 2,
        PresenceShow::Xa => 1,
        PresenceShow::Unavailable => 0,
    }
}

fn preference(a: &PresenceInfo, b: &PresenceInfo) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| show_rank(a.show).cmp(&show_rank(b.show)))
        .then_with(|| a.last_updated.cmp(&b.last_updated))
}

struct AccountPresence {
    own: PresenceInfo,
    /// bare JID -> resource -> presence
    contacts: HashMap<String, HashMap<String, PresenceInfo>>,
}

impl AccountPresence {
    fn new(account: &str) -> Self {
        Self {
            own: PresenceInfo::unavailable(account),
            contacts: HashMap::new(),
        }
    }
}

/// Tracks presence for every account it sees events for. Feed it with
/// [`PresenceTracker::handle_event`] or let [`PresenceTracker::run`] follow
/// the event bus.
pub struct PresenceTracker {
    accounts: RwLock<HashMap<String, AccountPresence>>,
    event_bus: Arc<dyn EventBus>,
}

impl PresenceTracker {
    pub fn new(event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            event_bus,
        }
    }

    pub fn own_presence(&self, account: &str) -> PresenceInfo {
        let accounts = self.accounts.read().unwrap_or_else(PoisonError::into_inner);
        accounts
            .get(account)
            .map(|a| a.own.clone())
            .unwrap_or_else(|| PresenceInfo::unavailable(account))
    }

    /// The presence of the contact's highest-priority resource.
    pub fn get_presence(&self, account: &str, jid: &str) -> PresenceInfo {
        let bare = bare_jid(jid);
        self.resources(account, &bare)
            .into_iter()
            .next()
            .unwrap_or_else(|| PresenceInfo::unavailable(&bare))
    }

    /// All online resources of a contact, preferred first.
    pub fn resources(&self, account: &str, jid: &str) -> Vec<PresenceInfo> {
        let bare = bare_jid(jid);
        let accounts = self.accounts.read().unwrap_or_else(PoisonError::into_inner);
        let mut resources: Vec<PresenceInfo> = accounts
            .get(account)
            .and_then(|a| a.contacts.get(&bare))
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default();
        resources.sort_by(|a, b| preference(b, a));
        resources
    }

    /// Contacts with at least one online resource, sorted by JID.
    pub fn available_contacts(&self, account: &str) -> Vec<PresenceInfo> {
        let mut bare_jids: Vec<String> = {
            let accounts = self.accounts.read().unwrap_or_else(PoisonError::into_inner);
            accounts
                .get(account)
                .map(|a| a.contacts.keys().cloned().collect())
                .unwrap_or_default()
        };
        bare_jids.sort();
        bare_jids
            .iter()
            .map(|jid| self.get_presence(account, jid))
            .filter(PresenceInfo::is_available)
            .collect()
    }

    /// Record the presence this account is broadcasting. Sending it is the
    /// caller's job.
    pub fn set_own_presence(
        &self,
        account: &str,
        show: PresenceShow,
        status: Option<&str>,
        priority: Option<i16>,
    ) -> Result<(), PresenceError> {
        let priority = priority
            .map(|p| i8::try_from(p).map_err(|_| PresenceError::InvalidPriority(p)))
            .transpose()?;

        let mut accounts = self.accounts.write().unwrap_or_else(PoisonError::into_inner);
        let entry = accounts
            .entry(account.to_string())
            .or_insert_with(|| AccountPresence::new(account));
        entry.own.show = show;
        entry.own.status = status.map(String::from);
        if let Some(p) = priority {
            entry.own.priority = p;
        }
        entry.own.last_updated = Utc::now();
        Ok(())
    }

    pub fn handle_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::ConnectionEstablished { account, jid } => {
                debug!(account = %account, jid = %jid, "connection established, resetting presence");
                let mut accounts = self.accounts.write().unwrap_or_else(PoisonError::into_inner);
                let mut fresh = AccountPresence::new(account);
                fresh.own.resource = Jid::parse(jid).ok().and_then(|j| j.resource().map(String::from));
                fresh.own.show = PresenceShow::Available;
                accounts.insert(account.clone(), fresh);
            }
            EventPayload::ConnectionLost { account, .. } => {
                debug!(account = %account, "connection lost, clearing presence map");
                self.clear(account);
            }
            EventPayload::PresenceChanged {
                account,
                jid,
                show,
                status,
                priority,
            } => {
                debug!(account = %account, jid = %jid, ?show, "contact presence changed");
                self.apply(account, jid, *show, status.clone(), *priority);
            }
            _ => {}
        }
    }

    fn clear(&self, account: &str) {
        let mut accounts = self.accounts.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = accounts.get_mut(account) {
            entry.contacts.clear();
            entry.own.show = PresenceShow::Unavailable;
            entry.own.status = None;
            entry.own.last_updated = Utc::now();
        }
    }

    fn apply(&self, account: &str, jid: &str, show: PresenceShow, status: Option<String>, priority: i8) {
        let jid = match Jid::parse(jid) {
            Ok(jid) => jid,
            Err(e) => {
                warn!(jid = %jid, error = %e, "ignoring presence with invalid JID");
                return;
            }
        };
        let bare = jid.bare_string();
        let resource = jid.resource().unwrap_or_default().to_string();

        let mut accounts = self.accounts.write().unwrap_or_else(PoisonError::into_inner);
        let entry = accounts
            .entry(account.to_string())
            .or_insert_with(|| AccountPresence::new(account));

        if show == PresenceShow::Unavailable {
            // A bare unavailable covers every resource.
            let now_empty = match entry.contacts.get_mut(&bare) {
                Some(resources) if jid.is_bare() => {
                    resources.clear();
                    true
                }
                Some(resources) => {
                    resources.remove(&resource);
                    resources.is_empty()
                }
                None => false,
            };
            if now_empty {
                entry.contacts.remove(&bare);
            }
            return;
        }

        let info = PresenceInfo {
            jid: bare.clone(),
            resource: jid.resource().map(String::from),
            show,
            status,
            priority,
            last_updated: Utc::now(),
        };
        entry.contacts.entry(bare).or_default().insert(resource, info);
    }

    pub async fn run(self: Arc<Self>) -> Result<(), PresenceError> {
        let mut sub = self
            .event_bus
            .subscribe("{system,xmpp}.**")
            .map_err(|e| PresenceError::EventBus(e.to_string()))?;

        loop {
            match sub.recv().await {
                Ok(event) => self.handle_event(&event),
                Err(EventBusError::ChannelClosed) => {
                    debug!("event bus closed, presence tracker stopping");
                    return Ok(());
                }
                Err(EventBusError::Lagged(count)) => {
                    warn!(count, "presence tracker lagged, some events dropped");
                }
                Err(e) => {
                    error!(error = %e, "presence tracker subscription error");
                    return Err(PresenceError::EventBus(e.to_string()));
                }
            }
        }
    }
}

fn bare_jid(jid: &str) -> String {
    match Jid::parse(jid) {
        Ok(jid) => jid.bare_string(),
        Err(_) => jid.split('/').next().unwrap_or(jid).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use perch_core::event::{BroadcastEventBus, Channel, EventSource};

    use super::*;

    const ACCOUNT: &str = "me@example.com";

    fn make_tracker() -> (Arc<PresenceTracker>, Arc<dyn EventBus>) {
        let event_bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
        let tracker = Arc::new(PresenceTracker::new(event_bus.clone()));
        (tracker, event_bus)
    }

    fn make_event(channel: &str, payload: EventPayload) -> Event {
        Event::new(
            Channel::new(channel).unwrap(),
            EventSource::Account(ACCOUNT.into()),
            payload,
        )
    }

    fn presence(jid: &str, show: PresenceShow, status: Option<&str>, priority: i8) -> Event {
        make_event(
            "xmpp.presence.changed",
            EventPayload::PresenceChanged {
                account: ACCOUNT.to_string(),
                jid: jid.to_string(),
                show,
                status: status.map(String::from),
                priority,
            },
        )
    }

    fn connected(tracker: &PresenceTracker) {
        tracker.handle_event(&make_event(
            "system.connection.established",
            EventPayload::ConnectionEstablished {
                account: ACCOUNT.to_string(),
                jid: format!("{ACCOUNT}/laptop"),
            },
        ));
    }

    #[test]
    fn unknown_account_and_contact_are_unavailable() {
        let (tracker, _) = make_tracker();
        assert_eq!(tracker.own_presence(ACCOUNT).show, PresenceShow::Unavailable);
        let info = tracker.get_presence(ACCOUNT, "unknown@example.com/x");
        assert_eq!(info.show, PresenceShow::Unavailable);
        assert_eq!(info.jid, "unknown@example.com");
    }

    #[test]
    fn connection_established_marks_own_presence_available() {
        let (tracker, _) = make_tracker();
        connected(&tracker);
        let own = tracker.own_presence(ACCOUNT);
        assert_eq!(own.show, PresenceShow::Available);
        assert_eq!(own.resource.as_deref(), Some("laptop"));
    }

    #[test]
    fn highest_priority_resource_wins() {
        let (tracker, _) = make_tracker();
        tracker.handle_event(&presence("bob@example.com/phone", PresenceShow::Away, Some("mobile"), 0));
        tracker.handle_event(&presence("bob@example.com/desk", PresenceShow::Dnd, Some("busy"), 10));

        let info = tracker.get_presence(ACCOUNT, "bob@example.com");
        assert_eq!(info.show, PresenceShow::Dnd);
        assert_eq!(info.resource.as_deref(), Some("desk"));
        assert_eq!(tracker.resources(ACCOUNT, "bob@example.com").len(), 2);

        tracker.handle_event(&presence("bob@example.com/desk", PresenceShow::Unavailable, None, 0));
        let info = tracker.get_presence(ACCOUNT, "bob@example.com/desk");
        assert_eq!(info.show, PresenceShow::Away);
        assert_eq!(info.status.as_deref(), Some("mobile"));
    }

    #[test]
    fn equal_priority_prefers_more_available_show() {
        let (tracker, _) = make_tracker();
        tracker.handle_event(&presence("bob@example.com/a", PresenceShow::Xa, None, 1));
        tracker.handle_event(&presence("bob@example.com/b", PresenceShow::Chat, None, 1));
        assert_eq!(tracker.get_presence(ACCOUNT, "bob@example.com").show, PresenceShow::Chat);
    }

    #[test]
    fn bare_unavailable_clears_all_resources() {
        let (tracker, _) = make_tracker();
        tracker.handle_event(&presence("bob@example.com/a", PresenceShow::Available, None, 0));
        tracker.handle_event(&presence("bob@example.com/b", PresenceShow::Available, None, 0));
        tracker.handle_event(&presence("bob@example.com", PresenceShow::Unavailable, None, 0));
        assert!(tracker.resources(ACCOUNT, "bob@example.com").is_empty());
        assert!(tracker.available_contacts(ACCOUNT).is_empty());
    }

    #[test]
    fn connection_lost_clears_only_that_account() {
        let (tracker, _) = make_tracker();
        connected(&tracker);
        tracker.handle_event(&presence("alice@example.com", PresenceShow::Available, None, 0));
        tracker.handle_event(&Event::new(
            Channel::new("xmpp.presence.changed").unwrap(),
            EventSource::Account("other@example.com".into()),
            EventPayload::PresenceChanged {
                account: "other@example.com".into(),
                jid: "carol@example.com/x".into(),
                show: PresenceShow::Away,
                status: None,
                priority: 0,
            },
        ));

        tracker.handle_event(&make_event(
            "system.connection.lost",
            EventPayload::ConnectionLost {
                account: ACCOUNT.to_string(),
                reason: "network error".to_string(),
                will_retry: true,
            },
        ));

        assert_eq!(tracker.own_presence(ACCOUNT).show, PresenceShow::Unavailable);
        assert_eq!(tracker.get_presence(ACCOUNT, "alice@example.com").show, PresenceShow::Unavailable);
        assert_eq!(
            tracker.get_presence("other@example.com", "carol@example.com").show,
            PresenceShow::Away
        );
    }

    #[test]
    fn available_contacts_sorted_by_jid() {
        let (tracker, _) = make_tracker();
        for jid in ["carol@example.com/x", "alice@example.com/y", "bob@example.com/z"] {
            tracker.handle_event(&presence(jid, PresenceShow::Available, None, 0));
        }
        let jids: Vec<_> = tracker.available_contacts(ACCOUNT).into_iter().map(|p| p.jid).collect();
        assert_eq!(jids, vec!["alice@example.com", "bob@example.com", "carol@example.com"]);
    }

    #[test]
    fn set_own_presence_validates_priority() {
        let (tracker, _) = make_tracker();
        tracker
            .set_own_presence(ACCOUNT, PresenceShow::Xa, Some("vacation"), Some(5))
            .unwrap();
        let own = tracker.own_presence(ACCOUNT);
        assert_eq!(own.show, PresenceShow::Xa);
        assert_eq!(own.status.as_deref(), Some("vacation"));
        assert_eq!(own.priority, 5);

        assert_matches!(
            tracker.set_own_presence(ACCOUNT, PresenceShow::Away, None, Some(300)),
            Err(PresenceError::InvalidPriority(300))
        );
        assert_eq!(tracker.own_presence(ACCOUNT).priority, 5);
    }

    #[test]
    #[tracing_test::traced_test]
    fn invalid_jid_is_ignored() {
        let (tracker, _) = make_tracker();
        tracker.handle_event(&presence("@example.com", PresenceShow::Available, None, 0));
        assert!(tracker.available_contacts(ACCOUNT).is_empty());
        assert!(logs_contain("ignoring presence with invalid JID"));
    }

    #[tokio::test]
    async fn run_loop_processes_events() {
        let (tracker, event_bus) = make_tracker();

        let handle = tokio::spawn(tracker.clone().run());
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        event_bus
            .publish(presence("test@example.com/r", PresenceShow::Chat, Some("free to chat"), 0))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let info = tracker.get_presence(ACCOUNT, "test@example.com");
        assert_eq!(info.show, PresenceShow::Chat);
        assert_eq!(info.status.as_deref(), Some("free to chat"));

        handle.abort();
    }

    #[test]
    fn bare_jid_strips_resource() {
        assert_eq!(bare_jid("user@example.com/resource"), "user@example.com");
        assert_eq!(bare_jid("user@Example.com"), "user@example.com");
        assert_eq!(bare_jid("user@example.com/res/extra"), "user@example.com");
    }
}
