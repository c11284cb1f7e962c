use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use modos_protocol::{
    CanonicalRequest, EventPayload, RequestId, RuntimeError, RuntimeResult, names,
};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, instrument, trace, warn};

use crate::pattern;
use crate::pending::{PendingGuard, PendingTable, ReplyHandle, RequestIdClaim};
use crate::stream::StreamSubscription;

pub type ListenerId = u64;

type SyncListener = Arc<dyn Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync>;
type AsyncListener = Arc<dyn Fn(BusEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone)]
enum Callback {
    Sync(SyncListener),
    Async(AsyncListener),
}

struct Listener {
    id: ListenerId,
    pattern: String,
    once: bool,
    callback: Callback,
}

/// One delivery to a listener.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub name: String,
    /// Set for correlated calls.
    pub request_id: Option<RequestId>,
    pub payload: EventPayload,
    pub emitted_at: DateTime<Utc>,
    reply: Option<ReplyHandle>,
}

impl BusEvent {
    fn new(name: &str, payload: EventPayload) -> Self {
        Self {
            name: name.to_owned(),
            request_id: None,
            payload,
            emitted_at: Utc::now(),
            reply: None,
        }
    }

    /// Answer a correlated call. Returns `false` for plain emits, late or
    /// duplicate replies.
    pub fn reply(&self, payload: EventPayload) -> bool {
        match &self.reply {
            Some(handle) => handle.reply(payload),
            None => {
                debug!(event = %self.name, "reply on uncorrelated event ignored");
                false
            }
        }
    }

    pub fn reply_handle(&self) -> Option<ReplyHandle> {
        self.reply.clone()
    }

    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    pub fn canonical_request(&self) -> Option<&CanonicalRequest> {
        match &self.payload {
            EventPayload::Request(request) => Some(request.as_ref()),
            _ => None,
        }
    }
}

struct BusInner {
    listeners: Mutex<Vec<Listener>>,
    next_listener_id: AtomicU64,
    pending: Arc<PendingTable>,
    active_handlers: AtomicUsize,
    idle: Notify,
}

/// In-process publish/subscribe hub with request/response correlation.
///
/// Cloning is cheap; clones share listeners and pending correlations.
/// Listener tables are only locked while snapshotting, never while a listener
/// runs, so listeners may freely subscribe, unsubscribe, and emit.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.inner.listeners.lock().len())
            .field("pending", &self.inner.pending.len())
            .field("active_handlers", &self.active_handlers())
            .finish()
    }
}

struct ActiveHandler(Arc<BusInner>);

impl ActiveHandler {
    fn enter(inner: &Arc<BusInner>) -> Self {
        inner.active_handlers.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(inner))
    }
}

impl Drop for ActiveHandler {
    fn drop(&mut self) {
        if self.0.active_handlers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                pending: Arc::new(PendingTable::default()),
                active_handlers: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    fn subscribe(&self, pattern: String, once: bool, callback: Callback) -> ListenerId {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        trace!(listener = id, pattern = %pattern, once, "listener added");
        self.inner.listeners.lock().push(Listener {
            id,
            pattern,
            once,
            callback,
        });
        id
    }

    /// Subscribe a listener that runs inline on the emitting task.
    pub fn on<F>(&self, pattern: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(pattern.into(), false, Callback::Sync(Arc::new(listener)))
    }

    /// Subscribe a listener that is spawned per event and counted as an
    /// active handler until it finishes.
    pub fn on_async<F, Fut>(&self, pattern: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: AsyncListener = Arc::new(move |event| listener(event).boxed());
        self.subscribe(pattern.into(), false, Callback::Async(callback))
    }

    pub fn once<F>(&self, pattern: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(pattern.into(), true, Callback::Sync(Arc::new(listener)))
    }

    /// Remove one listener. Returns whether it was still subscribed.
    pub fn off(&self, pattern: &str, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|listener| !(listener.id == id && listener.pattern == pattern));
        before != listeners.len()
    }

    pub fn remove_all_listeners(&self, pattern: &str) -> usize {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|listener| listener.pattern != pattern);
        before - listeners.len()
    }

    /// Listeners subscribed under exactly this name.
    pub fn listener_count(&self, name: &str) -> usize {
        self.inner
            .listeners
            .lock()
            .iter()
            .filter(|listener| listener.pattern == name)
            .count()
    }

    /// Whether an emit of `name` would reach anyone, wildcards included.
    pub fn has_listeners(&self, name: &str) -> bool {
        self.inner
            .listeners
            .lock()
            .iter()
            .any(|listener| pattern::matches(&listener.pattern, name))
    }

    /// Fire-and-forget publish. Returns the number of listeners reached.
    pub fn emit(&self, name: &str, payload: EventPayload) -> usize {
        self.dispatch(BusEvent::new(name, payload))
    }

    fn dispatch(&self, event: BusEvent) -> usize {
        let targets: Vec<(ListenerId, Callback)> = {
            let mut listeners = self.inner.listeners.lock();
            let targets = listeners
                .iter()
                .filter(|listener| pattern::matches(&listener.pattern, &event.name))
                .map(|listener| (listener.id, listener.callback.clone()))
                .collect();
            listeners.retain(|listener| {
                !(listener.once && pattern::matches(&listener.pattern, &event.name))
            });
            targets
        };

        trace!(event = %event.name, payload = event.payload.kind(), listeners = targets.len(), "emit");
        for (id, callback) in &targets {
            match callback {
                Callback::Sync(listener) => {
                    match std::panic::catch_unwind(AssertUnwindSafe(|| (**listener)(&event))) {
                        Ok(Ok(())) => {}
                        Ok(Err(error)) => {
                            warn!(event = %event.name, listener = id, error = %error, "listener failed");
                        }
                        Err(_) => {
                            warn!(event = %event.name, listener = id, "listener panicked");
                        }
                    }
                }
                Callback::Async(listener) => self.spawn_handler(*id, listener, event.clone()),
            }
        }
        targets.len()
    }

    fn spawn_handler(&self, id: ListenerId, listener: &AsyncListener, event: BusEvent) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(event = %event.name, listener = id, "no async runtime, async listener skipped");
            return;
        };
        let active = ActiveHandler::enter(&self.inner);
        let name = event.name.clone();
        let future = AssertUnwindSafe((**listener)(event)).catch_unwind();
        runtime.spawn(async move {
            let _active = active;
            match future.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(event = %name, listener = id, error = %error, "async listener failed");
                }
                Err(_) => warn!(event = %name, listener = id, "async listener panicked"),
            }
        });
    }

    /// Correlated call under a fresh request id.
    pub async fn emit_and_wait(
        &self,
        name: &str,
        payload: EventPayload,
        timeout: Duration,
    ) -> RuntimeResult<EventPayload> {
        self.request(name, RequestId::new_uuid(), payload, timeout)
            .await
    }

    /// Correlated call under a caller-chosen request id.
    ///
    /// Fails fast with `HandlerNotFound` when nobody listens on `name`. The
    /// pending entry is removed on reply, timeout, and when the returned
    /// future is dropped.
    #[instrument(skip(self, payload, timeout), fields(event = %name, request_id = %request_id, timeout_ms = timeout.as_millis() as u64))]
    pub async fn request(
        &self,
        name: &str,
        request_id: RequestId,
        payload: EventPayload,
        timeout: Duration,
    ) -> RuntimeResult<EventPayload> {
        if !self.has_listeners(name) {
            return Err(RuntimeError::HandlerNotFound(name.to_owned()));
        }

        let issued_at = Instant::now();
        let receiver = self
            .inner
            .pending
            .register(request_id.clone(), name, timeout)?;
        let _guard = PendingGuard {
            table: &self.inner.pending,
            request_id: request_id.clone(),
        };

        let mut event = BusEvent::new(name, payload);
        event.request_id = Some(request_id.clone());
        event.reply = Some(ReplyHandle::new(&self.inner.pending, request_id));
        self.dispatch(event);

        let timed_out = || RuntimeError::Timeout {
            event: name.to_owned(),
            timeout_ms: timeout.as_millis() as u64,
        };
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) if issued_at.elapsed() >= timeout => Err(timed_out()),
            Ok(Err(_)) => Err(RuntimeError::Internal(format!(
                "pending call to {name} was cleared"
            ))),
            Err(_) => {
                debug!("correlated call timed out");
                Err(timed_out())
            }
        }
    }

    /// Id-only reply form of [`BusEvent::reply`].
    pub fn respond(&self, request_id: &RequestId, payload: EventPayload) -> bool {
        self.inner.pending.complete(request_id, payload)
    }

    /// Reserve `request_id` until the returned claim and its clones drop.
    ///
    /// `None` when another caller holds the id or a call under it is still
    /// pending.
    pub fn claim_request_id(&self, request_id: RequestId) -> Option<RequestIdClaim> {
        self.inner
            .pending
            .claim(&request_id)
            .then(|| RequestIdClaim::new(&self.inner.pending, request_id))
    }

    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.inner.pending.contains(request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Drop every pending correlation; waiting callers fail immediately.
    pub fn clear_pending(&self) -> usize {
        let cleared = self.inner.pending.clear();
        if cleared > 0 {
            warn!(cleared, "cleared pending correlations");
        }
        cleared
    }

    /// Evict correlations that outlived their timeout.
    pub fn sweep_expired(&self) -> usize {
        self.inner.pending.remove_expired(Instant::now())
    }

    pub fn active_handlers(&self) -> usize {
        self.inner.active_handlers.load(Ordering::SeqCst)
    }

    /// Wait until no async listener is running. Returns `false` if
    /// `max_wait` elapsed first.
    pub async fn wait_for_active_handlers(&self, max_wait: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.inner.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.active_handlers() == 0 {
                    return;
                }
                notified.await;
            }
        };
        let finished = tokio::time::timeout(max_wait, drained).await.is_ok();
        if !finished {
            warn!(
                active = self.active_handlers(),
                max_wait_ms = max_wait.as_millis() as u64,
                "active handlers still running"
            );
        }
        finished
    }

    /// Subscribe to `stream.<request_id>` chunks.
    pub fn stream(&self, request_id: &RequestId) -> StreamSubscription {
        let channel = names::stream_channel(request_id);
        let (sender, receiver) = mpsc::unbounded_channel();
        let listener = self.on(channel.clone(), move |event| {
            match &event.payload {
                EventPayload::StreamChunk(chunk) => {
                    let _ = sender.send(chunk.clone());
                }
                other => warn!(event = %event.name, payload = other.kind(), "non-chunk payload on stream channel"),
            }
            Ok(())
        });
        StreamSubscription::new(self.clone(), channel, listener, receiver)
    }
}
