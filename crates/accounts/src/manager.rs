use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use perch_core::config::AccountConfig;
use perch_core::event::{
    AccountStatus, Channel, Event, EventBus, EventPayload, EventSource, PresenceShow, RosterItem,
};
use perch_storage::{MemoryStorage, Storage, StoredMessage};
use perch_xmpp::{Client, Connector, Jid, RustlsUpgrader, Session, SessionEvent, TcpConnector, TlsUpgrade};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::error::AccountError;

const INITIAL_RECONNECT_DELAY_SECONDS: u64 = 1;
const MAX_RECONNECT_DELAY_SECONDS: u64 = 60;

pub(crate) struct AccountEntry {
    config: AccountConfig,
    status: watch::Sender<AccountStatus>,
    /// Bumped by every disconnect; attempts and sessions from an older
    /// epoch must not touch the entry.
    epoch: watch::Sender<u64>,
    session: Option<Session>,
    last_error: Option<String>,
    pub(crate) unread: HashMap<String, u32>,
}

impl AccountEntry {
    fn new(config: AccountConfig) -> Self {
        Self {
            config,
            status: watch::Sender::new(AccountStatus::Offline),
            epoch: watch::Sender::new(0),
            session: None,
            last_error: None,
            unread: HashMap::new(),
        }
    }

    fn status(&self) -> AccountStatus {
        *self.status.borrow()
    }

    pub(crate) fn is_epoch(&self, epoch: u64) -> bool {
        *self.epoch.borrow() == epoch
    }
}

enum Claim {
    /// Another call is connecting or disconnecting this account.
    Wait {
        status: watch::Receiver<AccountStatus>,
        joining: bool,
    },
    /// This call owns the attempt.
    Attempt { config: AccountConfig, epoch: watch::Receiver<u64> },
}

/// Returns the account to `Offline` when the `connect` call owning an
/// attempt is dropped before the attempt settled, so waiters wake up and
/// later calls can start a new attempt.
struct AttemptGuard<C: Connector, U: TlsUpgrade, S: Storage> {
    manager: AccountManager<C, U, S>,
    account: String,
    epoch: u64,
    settled: bool,
}

impl<C: Connector, U: TlsUpgrade, S: Storage> Drop for AttemptGuard<C, U, S> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let abandoned = {
            let mut table = self.manager.write();
            match table.get_mut(&self.account) {
                Some(entry) if entry.is_epoch(self.epoch) && entry.status() == AccountStatus::Connecting => {
                    entry.status.send_replace(AccountStatus::Offline);
                    true
                }
                _ => false,
            }
        };
        if !abandoned {
            return;
        }
        warn!(account = %self.account, "Connection attempt abandoned");
        let manager = self.manager.clone();
        let account = std::mem::take(&mut self.account);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { manager.announce(&account, AccountStatus::Offline).await });
            }
            Err(_) => debug!(account = %account, "No runtime to announce abandoned attempt"),
        }
    }
}

pub(crate) struct Inner<C, U, S> {
    pub(crate) client: Client<C, U>,
    pub(crate) storage: Arc<S>,
    pub(crate) event_bus: Arc<dyn EventBus>,
    pub(crate) accounts: RwLock<HashMap<String, AccountEntry>>,
}

/// Owns the account table: one entry per configured account, each with its
/// own status, session, and unread counters.
pub struct AccountManager<C = TcpConnector, U = RustlsUpgrader, S = MemoryStorage> {
    pub(crate) inner: Arc<Inner<C, U, S>>,
}

impl<C, U, S> Clone for AccountManager<C, U, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector, U: TlsUpgrade, S: Storage> AccountManager<C, U, S> {
    pub fn new(client: Client<C, U>, storage: Arc<S>, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                storage,
                event_bus,
                accounts: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn client(&self) -> &Client<C, U> {
        &self.inner.client
    }

    pub fn storage(&self) -> &S {
        &self.inner.storage
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, HashMap<String, AccountEntry>> {
        self.inner.accounts.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, AccountEntry>> {
        self.inner.accounts.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an account. Returns the bare JID it is keyed by.
    pub fn add_account(&self, config: AccountConfig) -> Result<String, AccountError> {
        let key = Jid::parse(&config.jid)?.bare_string();
        let mut table = self.write();
        if table.contains_key(&key) {
            return Err(AccountError::DuplicateAccount(key));
        }
        table.insert(key.clone(), AccountEntry::new(config));
        debug!(account = %key, "Account added");
        Ok(key)
    }

    pub async fn remove_account(&self, account: &str) -> Result<(), AccountError> {
        self.disconnect(account).await?;
        self.write().remove(account);
        Ok(())
    }

    pub fn accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self.read().keys().cloned().collect();
        accounts.sort();
        accounts
    }

    pub fn status(&self, account: &str) -> Option<AccountStatus> {
        self.read().get(account).map(AccountEntry::status)
    }

    /// The live session of an online account.
    pub fn session(&self, account: &str) -> Result<Session, AccountError> {
        let table = self.read();
        let entry = table
            .get(account)
            .ok_or_else(|| AccountError::UnknownAccount(account.to_string()))?;
        entry
            .session
            .clone()
            .ok_or_else(|| AccountError::NotConnected(account.to_string()))
    }

    pub fn unread(&self, account: &str, peer: &str) -> u32 {
        self.read()
            .get(account)
            .and_then(|entry| entry.unread.get(peer).copied())
            .unwrap_or(0)
    }

    pub fn unread_counts(&self, account: &str) -> HashMap<String, u32> {
        self.read()
            .get(account)
            .map(|entry| entry.unread.clone())
            .unwrap_or_default()
    }

    pub fn mark_read(&self, account: &str, peer: &str) {
        if let Some(entry) = self.write().get_mut(account) {
            entry.unread.remove(peer);
        }
    }

    /// Open a session for `account`. Returns the existing session if the
    /// account is already online, and joins an attempt already in flight
    /// instead of starting a second one.
    #[instrument(skip(self), fields(account = %account))]
    pub async fn connect(&self, account: &str) -> Result<Session, AccountError> {
        loop {
            let claim = {
                let mut table = self.write();
                let entry = table
                    .get_mut(account)
                    .ok_or_else(|| AccountError::UnknownAccount(account.to_string()))?;
                match (entry.status(), &entry.session) {
                    (AccountStatus::Online, Some(session)) => return Ok(session.clone()),
                    (status @ (AccountStatus::Connecting | AccountStatus::Disconnecting), _) => {
                        Claim::Wait {
                            status: entry.status.subscribe(),
                            joining: status == AccountStatus::Connecting,
                        }
                    }
                    _ => {
                        entry.status.send_replace(AccountStatus::Connecting);
                        entry.last_error = None;
                        Claim::Attempt {
                            config: entry.config.clone(),
                            epoch: entry.epoch.subscribe(),
                        }
                    }
                }
            };

            match claim {
                Claim::Wait { mut status, joining } => {
                    let settled = status
                        .wait_for(|s| {
                            !matches!(s, AccountStatus::Connecting | AccountStatus::Disconnecting)
                        })
                        .await
                        .map(|s| *s)
                        .map_err(|_| AccountError::UnknownAccount(account.to_string()))?;
                    if !joining {
                        continue;
                    }
                    match settled {
                        AccountStatus::Online => continue,
                        AccountStatus::Failed => return Err(self.last_failure(account)),
                        _ => return Err(AccountError::Cancelled(account.to_string())),
                    }
                }
                Claim::Attempt { config, mut epoch } => {
                    let started = *epoch.borrow_and_update();
                    let mut guard = AttemptGuard {
                        manager: self.clone(),
                        account: account.to_string(),
                        epoch: started,
                        settled: false,
                    };
                    self.announce(account, AccountStatus::Connecting).await;
                    let result = tokio::select! {
                        result = self.inner.client.connect(&config) => result,
                        _ = epoch.changed() => {
                            guard.settled = true;
                            return Err(AccountError::Cancelled(account.to_string()));
                        }
                    };
                    guard.settled = true;
                    return self.finish_attempt(account, started, result).await;
                }
            }
        }
    }

    async fn finish_attempt(
        &self,
        account: &str,
        epoch: u64,
        result: Result<(Session, mpsc::UnboundedReceiver<SessionEvent>), perch_xmpp::XmppError>,
    ) -> Result<Session, AccountError> {
        match result {
            Ok((session, events)) => {
                let installed = {
                    let mut table = self.write();
                    match table.get_mut(account) {
                        Some(entry) if entry.is_epoch(epoch) => {
                            entry.session = Some(session.clone());
                            entry.status.send_replace(AccountStatus::Online);
                            true
                        }
                        _ => false,
                    }
                };
                if !installed {
                    session.close().await;
                    return Err(AccountError::Cancelled(account.to_string()));
                }

                info!(jid = %session.jid(), "Account online");
                self.spawn_forwarder(account, epoch, events);
                self.announce(account, AccountStatus::Online).await;
                Ok(session)
            }
            Err(error) => {
                warn!(error = %error, "Connection attempt failed");
                let current = {
                    let mut table = self.write();
                    match table.get_mut(account) {
                        Some(entry) if entry.is_epoch(epoch) => {
                            entry.status.send_replace(AccountStatus::Failed);
                            entry.last_error = Some(error.to_string());
                            true
                        }
                        _ => false,
                    }
                };
                if current {
                    self.announce(account, AccountStatus::Failed).await;
                }
                Err(error.into())
            }
        }
    }

    fn last_failure(&self, account: &str) -> AccountError {
        let reason = self
            .read()
            .get(account)
            .and_then(|entry| entry.last_error.clone())
            .unwrap_or_else(|| "unknown error".to_string());
        AccountError::ConnectFailed {
            jid: account.to_string(),
            reason,
        }
    }

    /// [`connect`](Self::connect) with exponential backoff on retryable
    /// failures. A disconnect while waiting cancels the loop.
    #[instrument(skip(self), fields(account = %account))]
    pub async fn connect_with_retry(&self, account: &str) -> Result<Session, AccountError> {
        let max_attempts = self.config(account)?.max_reconnect_attempts;
        let mut reconnect_attempt = 0_u32;
        let mut epoch = self.epoch_receiver(account)?;

        loop {
            if epoch.has_changed().unwrap_or(true) {
                return Err(AccountError::Cancelled(account.to_string()));
            }
            let error = match self.connect(account).await {
                Ok(session) => return Ok(session),
                Err(AccountError::Xmpp(error)) => error,
                Err(other) => return Err(other),
            };

            let next_attempt = reconnect_attempt.saturating_add(1);
            let will_retry = error.is_retryable() && should_retry(max_attempts, next_attempt);
            self.publish(
                account,
                "system.connection.lost",
                EventPayload::ConnectionLost {
                    account: account.to_string(),
                    reason: error.to_string(),
                    will_retry,
                },
            );
            self.publish(
                account,
                "system.error.occurred",
                EventPayload::ErrorOccurred {
                    component: "connection".to_string(),
                    message: error.to_string(),
                    recoverable: error.is_retryable(),
                },
            );

            if !will_retry {
                return Err(error.into());
            }

            reconnect_attempt = next_attempt;
            self.publish(
                account,
                "system.connection.reconnecting",
                EventPayload::ConnectionReconnecting {
                    account: account.to_string(),
                    attempt: reconnect_attempt,
                },
            );

            tokio::select! {
                _ = tokio::time::sleep(reconnect_delay(reconnect_attempt)) => {}
                _ = epoch.changed() => return Err(AccountError::Cancelled(account.to_string())),
            }
        }
    }

    /// Connect with retries, then enable carbons, fetch the roster, and
    /// announce availability.
    pub async fn go_online(&self, account: &str) -> Result<Session, AccountError> {
        let session = self.connect_with_retry(account).await?;
        if let Err(e) = session.enable_carbons().await {
            warn!(account = %account, error = %e, "Enabling carbons failed");
        }
        if let Err(e) = session.request_roster().await {
            warn!(account = %account, error = %e, "Roster request failed");
            self.publish(
                account,
                "system.error.occurred",
                EventPayload::ErrorOccurred {
                    component: "roster".to_string(),
                    message: e.to_string(),
                    recoverable: true,
                },
            );
        }
        session.send_presence(PresenceShow::Available, None, 0).await?;
        Ok(session)
    }

    /// Bring every `auto_connect` account online concurrently.
    pub async fn connect_all(&self) -> Vec<(String, Result<(), AccountError>)> {
        let accounts: Vec<String> = {
            let table = self.read();
            let mut accounts: Vec<String> = table
                .iter()
                .filter(|(_, entry)| entry.config.auto_connect)
                .map(|(key, _)| key.clone())
                .collect();
            accounts.sort();
            accounts
        };

        let mut tasks = JoinSet::new();
        for account in accounts {
            let manager = self.clone();
            tasks.spawn(async move {
                let result = manager.go_online(&account).await.map(|_| ());
                (account, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => results.push(outcome),
                Err(e) => warn!(error = %e, "Connect task failed"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Tear down this account's session. Other accounts are untouched.
    #[instrument(skip(self), fields(account = %account))]
    pub async fn disconnect(&self, account: &str) -> Result<(), AccountError> {
        let (session, was_active) = {
            let mut table = self.write();
            let entry = table
                .get_mut(account)
                .ok_or_else(|| AccountError::UnknownAccount(account.to_string()))?;
            let status = entry.status();
            if status == AccountStatus::Offline && entry.session.is_none() {
                return Ok(());
            }
            entry.epoch.send_modify(|epoch| *epoch += 1);
            entry.status.send_replace(AccountStatus::Disconnecting);
            let session = entry.session.take();
            let was_active = session.is_some() || status == AccountStatus::Connecting;
            (session, was_active)
        };

        self.announce(account, AccountStatus::Disconnecting).await;
        if let Some(session) = session {
            session.close().await;
        }

        if let Some(entry) = self.write().get_mut(account) {
            entry.status.send_replace(AccountStatus::Offline);
        }
        self.announce(account, AccountStatus::Offline).await;

        if was_active {
            self.publish(
                account,
                "system.connection.lost",
                EventPayload::ConnectionLost {
                    account: account.to_string(),
                    reason: "user requested disconnect".to_string(),
                    will_retry: false,
                },
            );
        }
        info!("Account offline");
        Ok(())
    }

    pub async fn reconnect(&self, account: &str) -> Result<Session, AccountError> {
        self.disconnect(account).await?;
        self.connect_with_retry(account).await
    }

    /// Stored conversation history with `peer`, oldest first.
    pub async fn messages(
        &self,
        account: &str,
        peer: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, AccountError> {
        Ok(self.inner.storage.messages_for(account, peer, limit).await?)
    }

    /// The live roster when online, otherwise the last saved one.
    pub async fn roster(&self, account: &str) -> Result<Vec<RosterItem>, AccountError> {
        match self.session(account) {
            Ok(session) => Ok(session.roster()),
            Err(AccountError::NotConnected(_)) => Ok(self.inner.storage.load_roster(account).await?),
            Err(e) => Err(e),
        }
    }

    fn config(&self, account: &str) -> Result<AccountConfig, AccountError> {
        self.read()
            .get(account)
            .map(|entry| entry.config.clone())
            .ok_or_else(|| AccountError::UnknownAccount(account.to_string()))
    }

    fn epoch_receiver(&self, account: &str) -> Result<watch::Receiver<u64>, AccountError> {
        self.read()
            .get(account)
            .map(|entry| entry.epoch.subscribe())
            .ok_or_else(|| AccountError::UnknownAccount(account.to_string()))
    }

    fn spawn_forwarder(
        &self,
        account: &str,
        epoch: u64,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let manager = self.clone();
        let account = account.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let finished = matches!(event, SessionEvent::Disconnected { .. });
                manager.handle_session_event(&account, epoch, event).await;
                if finished {
                    break;
                }
            }
            debug!(account = %account, "Session event forwarder finished");
        });
    }

    /// Mark an account offline after its session ended on its own.
    pub(crate) async fn session_lost(&self, account: &str, epoch: u64, reason: &str) -> bool {
        let current = {
            let mut table = self.write();
            match table.get_mut(account) {
                Some(entry) if entry.is_epoch(epoch) && entry.session.is_some() => {
                    entry.session = None;
                    entry.status.send_replace(AccountStatus::Offline);
                    true
                }
                _ => false,
            }
        };
        if current {
            warn!(account = %account, reason = %reason, "Session lost");
            self.announce(account, AccountStatus::Offline).await;
        }
        current
    }

    /// Publish a status change and persist it.
    async fn announce(&self, account: &str, status: AccountStatus) {
        self.publish(
            account,
            "system.account.status_changed",
            EventPayload::AccountStatusChanged {
                account: account.to_string(),
                status,
            },
        );
        if let Err(e) = self.inner.storage.save_account_status(account, status).await {
            warn!(account = %account, error = %e, "Failed to save account status");
        }
    }

    pub(crate) fn publish(&self, account: &str, channel: &str, payload: EventPayload) {
        let Ok(channel) = Channel::new(channel) else {
            warn!(channel, "Invalid event channel");
            return;
        };
        let event = Event::new(channel, EventSource::Account(account.to_string()), payload);
        if let Err(e) = self.inner.event_bus.publish(event) {
            debug!(error = %e, "Event not published");
        }
    }
}

fn should_retry(max_attempts: u32, attempt: u32) -> bool {
    max_attempts == 0 || attempt <= max_attempts
}

fn reconnect_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1);
    let seconds = 1_u64
        .checked_shl(shift)
        .unwrap_or(u64::MAX)
        .clamp(INITIAL_RECONNECT_DELAY_SECONDS, MAX_RECONNECT_DELAY_SECONDS);
    Duration::from_secs(seconds)
}
