//! Correlation table for emit-and-wait calls.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use modos_protocol::{EventPayload, RequestId, RuntimeError, RuntimeResult};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

struct PendingEntry {
    sender: oneshot::Sender<EventPayload>,
    issued_at: Instant,
    event: String,
    timeout: Duration,
}

/// At most one entry per request id; an entry is resolved at most once.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: Mutex<HashMap<RequestId, PendingEntry>>,
    claimed: Mutex<HashSet<RequestId>>,
}

impl PendingTable {
    /// Check-and-insert under one lock so two callers never both win an id.
    pub(crate) fn claim(&self, request_id: &RequestId) -> bool {
        let entries = self.entries.lock();
        if entries.contains_key(request_id) {
            return false;
        }
        self.claimed.lock().insert(request_id.clone())
    }

    pub(crate) fn release(&self, request_id: &RequestId) {
        self.claimed.lock().remove(request_id);
    }

    pub(crate) fn is_claimed(&self, request_id: &RequestId) -> bool {
        self.claimed.lock().contains(request_id)
    }

    pub(crate) fn register(
        &self,
        request_id: RequestId,
        event: &str,
        timeout: Duration,
    ) -> RuntimeResult<oneshot::Receiver<EventPayload>> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&request_id) {
            return Err(RuntimeError::Internal(format!(
                "request id {request_id} is already pending"
            )));
        }
        let (sender, receiver) = oneshot::channel();
        entries.insert(
            request_id,
            PendingEntry {
                sender,
                issued_at: Instant::now(),
                event: event.to_owned(),
                timeout,
            },
        );
        Ok(receiver)
    }

    pub(crate) fn complete(&self, request_id: &RequestId, payload: EventPayload) -> bool {
        let Some(entry) = self.entries.lock().remove(request_id) else {
            warn!(request_id = %request_id, "reply for unknown or expired request discarded");
            return false;
        };
        let elapsed_ms = entry.issued_at.elapsed().as_millis() as u64;
        if entry.sender.send(payload).is_err() {
            debug!(request_id = %request_id, event = %entry.event, "caller went away before reply");
            return false;
        }
        debug!(request_id = %request_id, event = %entry.event, elapsed_ms, "correlated reply delivered");
        true
    }

    pub(crate) fn remove(&self, request_id: &RequestId) -> bool {
        self.entries.lock().remove(request_id).is_some()
    }

    pub(crate) fn contains(&self, request_id: &RequestId) -> bool {
        self.entries.lock().contains_key(request_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Drops every entry; waiting callers observe a closed channel.
    pub(crate) fn clear(&self) -> usize {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        drained.len()
    }

    pub(crate) fn remove_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|request_id, entry| {
            let elapsed = now.saturating_duration_since(entry.issued_at);
            let keep = elapsed <= entry.timeout;
            if !keep {
                warn!(
                    request_id = %request_id,
                    event = %entry.event,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "evicting expired pending request"
                );
            }
            keep
        });
        before - entries.len()
    }
}

/// Reply capability attached to a correlated bus event.
///
/// Holds the table weakly so a listener that keeps the handle around does not
/// keep the bus alive.
#[derive(Clone)]
pub struct ReplyHandle {
    table: Weak<PendingTable>,
    request_id: RequestId,
}

impl ReplyHandle {
    pub(crate) fn new(table: &Arc<PendingTable>, request_id: RequestId) -> Self {
        Self {
            table: Arc::downgrade(table),
            request_id,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Returns `false` when the caller already timed out or a reply was already sent.
    pub fn reply(&self, payload: EventPayload) -> bool {
        match self.table.upgrade() {
            Some(table) => table.complete(&self.request_id, payload),
            None => false,
        }
    }
}

impl std::fmt::Debug for ReplyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyHandle")
            .field("request_id", &self.request_id)
            .finish()
    }
}

/// Exclusive use of one request id, held for as long as any clone lives.
#[derive(Clone)]
pub struct RequestIdClaim(Arc<ClaimInner>);

struct ClaimInner {
    table: Weak<PendingTable>,
    request_id: RequestId,
}

impl RequestIdClaim {
    pub(crate) fn new(table: &Arc<PendingTable>, request_id: RequestId) -> Self {
        Self(Arc::new(ClaimInner {
            table: Arc::downgrade(table),
            request_id,
        }))
    }

    pub fn id(&self) -> &RequestId {
        &self.0.request_id
    }
}

impl std::ops::Deref for RequestIdClaim {
    type Target = RequestId;

    fn deref(&self) -> &RequestId {
        self.id()
    }
}

impl Drop for ClaimInner {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.release(&self.request_id);
        }
    }
}

impl std::fmt::Debug for RequestIdClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RequestIdClaim").field(self.id()).finish()
    }
}

/// Removes the pending entry when the waiting call ends, however it ends.
pub(crate) struct PendingGuard<'a> {
    pub(crate) table: &'a PendingTable,
    pub(crate) request_id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_reply_is_ignored() {
        let table = Arc::new(PendingTable::default());
        let id = RequestId::from_string("r1");
        let mut receiver = table
            .register(id.clone(), "users.get", Duration::from_secs(1))
            .unwrap();

        let handle = ReplyHandle::new(&table, id.clone());
        assert!(handle.reply(EventPayload::Empty));
        assert!(!handle.reply(EventPayload::Empty));
        assert_eq!(receiver.try_recv().unwrap(), EventPayload::Empty);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let table = PendingTable::default();
        let id = RequestId::from_string("r1");
        let _receiver = table.register(id.clone(), "a", Duration::from_secs(1)).unwrap();
        assert!(table.register(id, "b", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn expired_entries_are_swept() {
        let table = PendingTable::default();
        let _short = table
            .register(RequestId::from_string("short"), "a", Duration::from_millis(10))
            .unwrap();
        let _long = table
            .register(RequestId::from_string("long"), "b", Duration::from_secs(60))
            .unwrap();

        let removed = table.remove_expired(Instant::now() + Duration::from_secs(1));
        assert_eq!(removed, 1);
        assert!(table.contains(&RequestId::from_string("long")));
    }

    #[test]
    fn guard_removes_entry() {
        let table = PendingTable::default();
        let id = RequestId::from_string("r1");
        let _receiver = table.register(id.clone(), "a", Duration::from_secs(1)).unwrap();
        {
            let _guard = PendingGuard {
                table: &table,
                request_id: id.clone(),
            };
        }
        assert!(!table.contains(&id));
    }

    #[test]
    fn claim_is_exclusive_until_every_clone_drops() {
        let table = Arc::new(PendingTable::default());
        let id = RequestId::from_string("r1");
        assert!(table.claim(&id));
        let claim = RequestIdClaim::new(&table, id.clone());
        let held = claim.clone();
        assert!(!table.claim(&id));

        drop(claim);
        assert!(table.is_claimed(&id));
        drop(held);
        assert!(!table.is_claimed(&id));
        assert!(table.claim(&id));
    }

    #[test]
    fn pending_id_cannot_be_claimed() {
        let table = PendingTable::default();
        let id = RequestId::from_string("r1");
        let _receiver = table.register(id.clone(), "a", Duration::from_secs(1)).unwrap();
        assert!(!table.claim(&id));
    }

    #[test]
    fn reply_after_bus_dropped_is_noop() {
        let table = Arc::new(PendingTable::default());
        let handle = ReplyHandle::new(&table, RequestId::from_string("gone"));
        drop(table);
        assert!(!handle.reply(EventPayload::Empty));
    }
}
