use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use amcp_types::{Event, EventKind};

use crate::id::{self, Prefix};

/// Handler priority classes. Within a class, handlers run in subscription
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    Low = 0,
    Normal = 50,
    High = 100,
    Critical = 200,
}

pub type HandlerId = String;

type BoxedCallback =
    Arc<dyn Fn(Event) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Handler {
    seq: u64,
    kinds: Option<Vec<EventKind>>,
    priority: EventPriority,
    session_filter: Option<String>,
    once: bool,
    callback: BoxedCallback,
}

impl Handler {
    fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(filter) = &self.session_filter {
            if event.session_id.as_deref() != Some(filter.as_str()) {
                return false;
            }
        }
        true
    }
}

const MAX_HISTORY: usize = 100;

/// Central pub/sub bus. The bus is a leaf: it holds no references back into
/// sessions or agents, only handler callbacks keyed by opaque ids.
pub struct EventBus {
    handlers: RwLock<HashMap<HandlerId, Handler>>,
    history: RwLock<Vec<Event>>,
    next_seq: RwLock<u64>,
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            handlers: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            next_seq: RwLock::new(0),
            tx,
        }
    }

    /// Register a handler. `kinds = None` subscribes to every event kind;
    /// `session_filter` skips events for other sessions; `once` removes the
    /// handler before its first invocation completes.
    pub async fn subscribe<F, Fut>(
        &self,
        kinds: Option<Vec<EventKind>>,
        priority: EventPriority,
        session_filter: Option<String>,
        once: bool,
        callback: F,
    ) -> HandlerId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let seq = {
            let mut next = self.next_seq.write().await;
            *next += 1;
            *next
        };

        let handler_id = id::create(Prefix::Handler);
        let handler = Handler {
            seq,
            kinds,
            priority,
            session_filter,
            once,
            callback: Arc::new(move |event| Box::pin(callback(event))),
        };

        self.handlers.write().await.insert(handler_id.clone(), handler);
        handler_id
    }

    pub async fn subscribe_kind<F, Fut>(&self, kind: EventKind, callback: F) -> HandlerId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(Some(vec![kind]), EventPriority::Normal, None, false, callback)
            .await
    }

    pub async fn unsubscribe(&self, handler_id: &str) -> bool {
        self.handlers.write().await.remove(handler_id).is_some()
    }

    pub async fn clear_session(&self, session_id: &str) -> usize {
        let mut handlers = self.handlers.write().await;
        let before = handlers.len();
        handlers.retain(|_, h| h.session_filter.as_deref() != Some(session_id));
        before - handlers.len()
    }

    /// Receiver carrying every event, for transports that fan out to
    /// clients (SSE, WebSocket).
    pub fn subscribe_channel(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Emit an event and await every matching handler, highest priority
    /// class first, subscription order within a class. A failing handler is
    /// logged and does not stop the rest.
    pub async fn emit(&self, event: Event) {
        self.record(&event).await;
        let _ = self.tx.send(event.clone());

        let matched = self.collect_matching(&event).await;
        for (handler_id, callback) in matched {
            let fut = callback(event.clone());
            // Catch panics so one handler cannot poison the emit loop.
            if let Err(panic) = tokio::spawn(fut).await {
                tracing::error!(
                    handler_id = %handler_id,
                    kind = %event.kind,
                    "event handler panicked: {panic}"
                );
            }
        }
    }

    /// Fire-and-forget emit: handlers are scheduled but not awaited.
    pub fn emit_sync(self: &Arc<Self>, event: Event) {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            bus.emit(event).await;
        });
    }

    async fn collect_matching(&self, event: &Event) -> Vec<(HandlerId, BoxedCallback)> {
        let mut matched: Vec<(HandlerId, EventPriority, u64, bool, BoxedCallback)> = {
            let handlers = self.handlers.read().await;
            handlers
                .iter()
                .filter(|(_, h)| h.matches(event))
                .map(|(id, h)| (id.clone(), h.priority, h.seq, h.once, Arc::clone(&h.callback)))
                .collect()
        };
        matched.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        // A `once` handler is removed before its callback runs, so it never
        // observes a second event even if the callback re-enters the bus.
        let once_ids: Vec<HandlerId> = matched
            .iter()
            .filter(|(_, _, _, once, _)| *once)
            .map(|(id, ..)| id.clone())
            .collect();
        if !once_ids.is_empty() {
            let mut handlers = self.handlers.write().await;
            for id in &once_ids {
                handlers.remove(id);
            }
        }

        matched
            .into_iter()
            .map(|(id, _, _, _, cb)| (id, cb))
            .collect()
    }

    async fn record(&self, event: &Event) {
        let mut history = self.history.write().await;
        history.push(event.clone());
        if history.len() > MAX_HISTORY {
            let overflow = history.len() - MAX_HISTORY;
            history.drain(..overflow);
        }
    }

    pub async fn history(
        &self,
        kind: Option<EventKind>,
        session_id: Option<&str>,
        limit: Option<usize>,
    ) -> Vec<Event> {
        let history = self.history.read().await;
        let mut events: Vec<Event> = history
            .iter()
            .rev()
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .filter(|e| session_id.map_or(true, |s| e.session_id.as_deref() == Some(s)))
            .cloned()
            .collect();
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        events
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
