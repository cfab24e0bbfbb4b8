use std::collections::HashMap;
use std::sync::Mutex;

use perch_core::event::{AccountStatus, RosterItem};

use crate::{MessageStatus, Direction, Storage, StorageError, StoredMessage};

#[derive(Default)]
struct State {
    messages: HashMap<String, Vec<StoredMessage>>,
    rosters: HashMap<String, Vec<RosterItem>>,
    statuses: HashMap<String, AccountStatus>,
}

/// Process-local storage. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }
}

impl Storage for MemoryStorage {
    async fn append_message(&self, record: &StoredMessage) -> Result<bool, StorageError> {
        Ok(self.with_state(|state| {
            let messages = state.messages.entry(record.account.clone()).or_default();
            if messages.iter().any(|m| m.message.id == record.message.id) {
                return false;
            }
            // Keep each account's log ordered by timestamp; archive pages
            // arrive out of order relative to live traffic.
            let at = messages.partition_point(|m| m.message.timestamp <= record.message.timestamp);
            messages.insert(at, record.clone());
            true
        }))
    }

    async fn messages_for(
        &self,
        account: &str,
        peer: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        Ok(self.with_state(|state| {
            let Some(messages) = state.messages.get(account) else {
                return Vec::new();
            };
            let matching: Vec<_> = messages.iter().filter(|m| m.peer == peer).collect();
            let skip = matching.len().saturating_sub(limit);
            matching.into_iter().skip(skip).cloned().collect()
        }))
    }

    async fn update_message_status(
        &self,
        account: &str,
        id: &str,
        status: MessageStatus,
    ) -> Result<bool, StorageError> {
        Ok(self.with_state(|state| {
            let found = state
                .messages
                .get_mut(account)
                .and_then(|messages| messages.iter_mut().find(|m| m.message.id == id));
            match found {
                Some(record)
                    if record.direction == Direction::Outgoing
                        && record.status.rank() < status.rank() =>
                {
                    record.status = status;
                    true
                }
                _ => false,
            }
        }))
    }

    async fn save_roster(&self, account: &str, items: &[RosterItem]) -> Result<(), StorageError> {
        let mut items = items.to_vec();
        items.sort_by(|a, b| a.jid.cmp(&b.jid));
        self.with_state(|state| {
            state.rosters.insert(account.to_string(), items);
        });
        Ok(())
    }

    async fn load_roster(&self, account: &str) -> Result<Vec<RosterItem>, StorageError> {
        Ok(self.with_state(|state| state.rosters.get(account).cloned().unwrap_or_default()))
    }

    async fn save_account_status(
        &self,
        account: &str,
        status: AccountStatus,
    ) -> Result<(), StorageError> {
        self.with_state(|state| {
            state.statuses.insert(account.to_string(), status);
        });
        Ok(())
    }

    async fn load_account_status(&self, account: &str) -> Result<Option<AccountStatus>, StorageError> {
        Ok(self.with_state(|state| state.statuses.get(account).copied()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{exercise_storage, message};

    #[tokio::test]
    async fn shared_behaviour() {
        exercise_storage(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn late_archive_message_sorts_by_timestamp() {
        let storage = MemoryStorage::new();
        let account = "alice@example.com";
        for (id, minute) in [("live", 30), ("archived", 10)] {
            let record = StoredMessage::incoming(account, "bob@example.com", message(id, "bob@example.com", id, minute));
            storage.append_message(&record).await.unwrap();
        }

        let ids: Vec<_> = storage
            .messages_for(account, "bob@example.com", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.message.id)
            .collect();
        assert_eq!(ids, vec!["archived", "live"]);
    }

    #[tokio::test]
    async fn incoming_status_never_changes() {
        let storage = MemoryStorage::new();
        let record = StoredMessage::incoming("alice@example.com", "bob@example.com", message("m1", "bob@example.com", "hi", 1));
        storage.append_message(&record).await.unwrap();
        assert!(!storage
            .update_message_status("alice@example.com", "m1", MessageStatus::Delivered)
            .await
            .unwrap());
    }
}
