//! Matches IQ replies to the callers waiting for them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::XmppError;
use crate::jid::Jid;
use crate::stanza::{Iq, IqType};

type Responder = oneshot::Sender<Result<Iq, XmppError>>;

struct Pending {
    /// The `to` of the request; replies must come from there.
    to: Option<Jid>,
    responder: Responder,
}

#[derive(Default)]
struct PendingTable {
    pending: HashMap<String, Pending>,
    closed: bool,
}

/// Pending-query table of one session.
///
/// Every entry is removed by exactly one of: its reply, its caller's
/// timeout, a failed write, or [`IqCorrelator::cancel_all`].
pub struct IqCorrelator {
    account: Jid,
    table: Mutex<PendingTable>,
}

impl IqCorrelator {
    /// `account` is the session's own address, used to accept replies to
    /// requests sent without a `to`.
    pub fn new(account: Jid) -> Self {
        Self {
            account,
            table: Mutex::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(
        &self,
        id: &str,
        to: Option<&Jid>,
    ) -> Result<oneshot::Receiver<Result<Iq, XmppError>>, XmppError> {
        let mut table = self.lock();
        if table.closed {
            return Err(XmppError::NotConnected);
        }
        if table.pending.contains_key(id) {
            return Err(XmppError::DuplicateQueryId(id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        table.pending.insert(
            id.to_string(),
            Pending {
                to: to.cloned(),
                responder: tx,
            },
        );
        Ok(rx)
    }

    pub fn forget(&self, id: &str) -> bool {
        self.lock().pending.remove(id).is_some()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.lock().pending.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whether a reply from `from` may answer a request sent to `to`.
    fn is_expected_sender(&self, to: Option<&Jid>, from: Option<&Jid>) -> bool {
        match (to, from) {
            (Some(to), Some(from)) => to == from,
            // The server answers on behalf of our own bare JID without a from.
            (Some(to), None) => to.is_bare() && to.bare_eq(&self.account),
            (None, None) => true,
            (None, Some(from)) => {
                from.bare_eq(&self.account)
                    || (from.local().is_none() && from.is_bare() && from.domain() == self.account.domain())
            }
        }
    }

    /// Hand a `result` or `error` IQ to its waiter. Returns `false` if no
    /// query with that id is pending, or the reply came from an address the
    /// query was not sent to; the query then stays pending.
    pub fn complete(&self, iq: Iq) -> bool {
        let pending = {
            let mut table = self.lock();
            let Some(pending) = table.pending.get(&iq.id) else {
                return false;
            };
            if !self.is_expected_sender(pending.to.as_ref(), iq.from.as_ref()) {
                warn!(
                    id = %iq.id,
                    from = ?iq.from.as_ref().map(Jid::to_string),
                    expected = ?pending.to.as_ref().map(Jid::to_string),
                    "Ignoring reply from unexpected sender"
                );
                return false;
            }
            match table.pending.remove(&iq.id) {
                Some(pending) => pending,
                None => return false,
            }
        };
        let outcome = match iq.kind {
            IqType::Error => Err(XmppError::Remote(iq.remote_error())),
            _ => Ok(iq),
        };
        if pending.responder.send(outcome).is_err() {
            debug!("Reply arrived after its waiter went away");
        }
        true
    }

    /// Fail every pending query with `Cancelled` and refuse new ones.
    pub fn cancel_all(&self) {
        let drained: Vec<Responder> = {
            let mut table = self.lock();
            table.closed = true;
            table.pending.drain().map(|(_, pending)| pending.responder).collect()
        };
        for responder in drained {
            let _ = responder.send(Err(XmppError::Cancelled));
        }
    }

    /// Register `id`, run `write`, then wait up to `timeout` for the reply.
    pub async fn send_and_wait<W>(
        &self,
        id: &str,
        to: Option<&Jid>,
        timeout: Duration,
        write: W,
    ) -> Result<Iq, XmppError>
    where
        W: Future<Output = Result<(), XmppError>>,
    {
        let rx = self.register(id, to)?;

        if let Err(e) = write.await {
            self.forget(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(XmppError::Cancelled),
            Err(_) => {
                self.forget(id);
                Err(XmppError::Timeout)
            }
        }
    }
}
