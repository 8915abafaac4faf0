//! EventBus - central pub/sub system for daemon events
//!
//! Every significant state change in the daemon emits an event to this
//! bus. Consumers subscribe by concrete type, by named group, or with a
//! wildcard; WebSocket clients register a send channel with an optional
//! filter. Emission is serialized: handlers observe events in strict
//! emission order, and a handler must not emit from within its own
//! callback (arrange off-path work through a channel instead).

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::logger::EventLogger;
use super::types::{Event, EventGroup};

/// Default ring-buffer capacity for event history
pub const DEFAULT_MAX_HISTORY: usize = 1_000;

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// What a handler entry matches against
enum Matcher {
    Type(String),
    Types(Vec<String>),
    Group(EventGroup),
    All,
}

impl Matcher {
    fn matches(&self, event: &Event) -> bool {
        match self {
            Matcher::Type(t) => t == &event.event_type,
            Matcher::Types(ts) => ts.iter().any(|t| t == &event.event_type),
            Matcher::Group(g) => g.contains(&event.event_type),
            Matcher::All => true,
        }
    }
}

struct HandlerEntry {
    id: u64,
    matcher: Matcher,
    handler: Handler,
}

/// Per-client subscription filter for WebSocket fanout.
///
/// A client with no filter receives every event; with a filter, an event
/// is delivered when it matches any listed type or any listed group.
#[derive(Debug, Clone, Default)]
pub struct ClientFilter {
    pub types: Option<Vec<String>>,
    pub groups: Option<Vec<EventGroup>>,
    pub session_id: Option<String>,
    pub workflow_id: Option<String>,
}

impl ClientFilter {
    fn matches(&self, event: &Event) -> bool {
        if let Some(session_id) = &self.session_id
            && &event.session_id != session_id
        {
            return false;
        }
        if let Some(workflow_id) = &self.workflow_id
            && event.workflow_id.as_ref() != Some(workflow_id)
        {
            return false;
        }
        match (&self.types, &self.groups) {
            (None, None) => true,
            (types, groups) => {
                let type_hit = types
                    .as_ref()
                    .is_some_and(|ts| ts.iter().any(|t| t == &event.event_type));
                let group_hit = groups
                    .as_ref()
                    .is_some_and(|gs| gs.iter().any(|g| g.contains(&event.event_type)));
                type_hit || group_hit
            }
        }
    }
}

struct WsClient {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
    filter: ClientFilter,
}

struct Inner {
    handlers: Vec<HandlerEntry>,
    ws_clients: Vec<WsClient>,
    history: VecDeque<Event>,
    max_history: usize,
    next_id: u64,
    logger: Option<EventLogger>,
}

/// Central event bus. Cheap to share via `Arc`.
pub struct EventBus {
    inner: Mutex<Inner>,
    /// Serializes the whole emit path so handlers see emission order
    emit_lock: Mutex<()>,
}

impl EventBus {
    pub fn new(max_history: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                handlers: Vec::new(),
                ws_clients: Vec::new(),
                history: VecDeque::new(),
                max_history,
                next_id: 0,
                logger: None,
            }),
            emit_lock: Mutex::new(()),
        })
    }

    pub fn with_default_capacity() -> Arc<Self> {
        Self::new(DEFAULT_MAX_HISTORY)
    }

    /// Enable per-session JSONL persistence under `dir`
    pub fn enable_persistence(self: &Arc<Self>, dir: impl Into<std::path::PathBuf>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.logger = Some(EventLogger::new(dir));
    }

    // === Subscriptions ===

    /// Subscribe to one concrete event type
    pub fn subscribe(
        self: &Arc<Self>,
        event_type: impl Into<String>,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        self.add_handler(Matcher::Type(event_type.into()), Arc::new(handler))
    }

    /// Subscribe to several concrete event types at once
    pub fn subscribe_multiple(
        self: &Arc<Self>,
        event_types: &[&str],
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        let types = event_types.iter().map(|t| t.to_string()).collect();
        self.add_handler(Matcher::Types(types), Arc::new(handler))
    }

    /// Subscribe to every type in a named group
    pub fn subscribe_by_group(
        self: &Arc<Self>,
        group: EventGroup,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        self.add_handler(Matcher::Group(group), Arc::new(handler))
    }

    /// Wildcard subscription
    pub fn subscribe_all(self: &Arc<Self>, handler: impl Fn(&Event) + Send + Sync + 'static) -> Subscription {
        self.add_handler(Matcher::All, Arc::new(handler))
    }

    fn add_handler(self: &Arc<Self>, matcher: Matcher, handler: Handler) -> Subscription {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.next_id;
        inner.next_id += 1;
        inner.handlers.push(HandlerEntry { id, matcher, handler });
        debug!(id, "EventBus: handler registered");
        Subscription {
            id,
            bus: Arc::downgrade(self),
        }
    }

    fn remove_handler(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.handlers.retain(|entry| entry.id != id);
    }

    /// Number of registered handlers (all matchers)
    pub fn handler_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).handlers.len()
    }

    // === WebSocket clients ===

    /// Register a WebSocket client's outbound channel. Returns the client
    /// id used for unregistration.
    pub fn register_ws_client(&self, tx: mpsc::UnboundedSender<String>, filter: ClientFilter) -> u64 {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.next_id;
        inner.next_id += 1;
        inner.ws_clients.push(WsClient { id, tx, filter });
        debug!(id, "EventBus: websocket client registered");
        id
    }

    /// Replace a client's filter (a later `subscribe` frame)
    pub fn update_ws_filter(&self, client_id: u64, filter: ClientFilter) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = inner.ws_clients.iter_mut().find(|c| c.id == client_id) {
            client.filter = filter;
        }
    }

    pub fn unregister_ws_client(&self, client_id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.ws_clients.retain(|c| c.id != client_id);
    }

    pub fn ws_client_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).ws_clients.len()
    }

    // === Emit ===

    /// Emit an event: record history, persist, invoke matching handlers in
    /// registration order (type and group matchers before wildcard), then
    /// broadcast to WebSocket clients. Clients whose channel is gone are
    /// evicted; a panicking handler is caught and logged and never poisons
    /// the other handlers or the emit call.
    pub fn emit(&self, event: Event) {
        let _serial = self.emit_lock.lock().unwrap_or_else(|e| e.into_inner());
        debug!(event_type = %event.event_type, session_id = %event.session_id, "EventBus::emit");

        let (matched, wildcard) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

            inner.history.push_back(event.clone());
            while inner.history.len() > inner.max_history {
                inner.history.pop_front();
            }

            if let Some(logger) = &inner.logger
                && let Err(e) = logger.append(&event)
            {
                warn!(error = %e, "EventBus: failed to persist event");
            }

            let line = serde_json::to_string(&event).unwrap_or_default();

            // Fan out to clients while we hold the lock; failed sends mark
            // the client for eviction.
            let mut dead = Vec::new();
            for client in &inner.ws_clients {
                if client.filter.matches(&event) && client.tx.send(line.clone()).is_err() {
                    dead.push(client.id);
                }
            }
            if !dead.is_empty() {
                debug!(evicted = dead.len(), "EventBus: evicting dead websocket clients");
                inner.ws_clients.retain(|c| !dead.contains(&c.id));
            }

            let mut matched: Vec<Handler> = Vec::new();
            let mut wildcard: Vec<Handler> = Vec::new();
            for entry in &inner.handlers {
                match &entry.matcher {
                    Matcher::All => {
                        if entry.matcher.matches(&event) {
                            wildcard.push(entry.handler.clone());
                        }
                    }
                    _ => {
                        if entry.matcher.matches(&event) {
                            matched.push(entry.handler.clone());
                        }
                    }
                }
            }
            (matched, wildcard)
        };

        for handler in matched.into_iter().chain(wildcard) {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                warn!(event_type = %event.event_type, "EventBus: handler panicked; continuing");
            }
        }
    }

    // === History queries ===

    pub fn get_history(&self, limit: Option<usize>) -> Vec<Event> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let events: Vec<Event> = inner.history.iter().cloned().collect();
        tail(events, limit)
    }

    pub fn get_history_by_type(&self, event_type: &str, limit: Option<usize>) -> Vec<Event> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let events: Vec<Event> = inner
            .history
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect();
        tail(events, limit)
    }

    pub fn get_history_by_group(&self, group: EventGroup, limit: Option<usize>) -> Vec<Event> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let events: Vec<Event> = inner
            .history
            .iter()
            .filter(|e| group.contains(&e.event_type))
            .cloned()
            .collect();
        tail(events, limit)
    }

    pub fn get_session_history(&self, session_id: &str, limit: Option<usize>) -> Vec<Event> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let events: Vec<Event> = inner
            .history
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect();
        tail(events, limit)
    }

    pub fn clear_history(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.history.clear();
    }
}

fn tail(events: Vec<Event>, limit: Option<usize>) -> Vec<Event> {
    match limit {
        Some(n) if events.len() > n => events[events.len() - n..].to_vec(),
        _ => events,
    }
}

/// Unsubscribe handle returned by all subscribe methods.
///
/// Removal is idempotent; dropping the handle without calling
/// [`Subscription::unsubscribe`] leaves the handler registered.
pub struct Subscription {
    id: u64,
    bus: Weak<EventBus>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove_handler(self.id);
        }
    }
}
