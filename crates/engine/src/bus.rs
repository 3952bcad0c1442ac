//! In-process publish/subscribe with a bounded replay buffer.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use runq_core::{lock_unpoisoned, Event};

/// Synchronous event callback. Must not call back into the bus publisher
/// that delivered the event while holding locks of its own.
pub type EventHandler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Options for [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Deliver matching retained events before live ones.
    pub replay: bool,
}

/// Options for [`EventBus::publish`].
#[derive(Debug, Clone, Copy)]
pub struct PublishOptions {
    /// Keep the event in the replay buffer.
    pub retain: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self { retain: true }
    }
}

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Handlers that returned `Ok`.
    pub delivered: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    All,
    Prefix(String),
    Exact(String),
}

impl Pattern {
    fn parse(raw: &str) -> Self {
        if raw == "*" {
            Pattern::All
        } else if let Some(prefix) = raw.strip_suffix('*') {
            // "task.*" matches "task.started" but not "taskforce"
            Pattern::Prefix(prefix.to_string())
        } else {
            Pattern::Exact(raw.to_string())
        }
    }

    fn matches(&self, event_type: &str) -> bool {
        match self {
            Pattern::All => true,
            Pattern::Prefix(prefix) => event_type.starts_with(prefix.as_str()),
            Pattern::Exact(exact) => event_type == exact,
        }
    }
}

struct Subscriber {
    id: u64,
    pattern: Pattern,
    handler: EventHandler,
}

struct Inner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
    history: VecDeque<Event>,
}

/// Fire-and-forget event bus.
///
/// Handlers run on the publishing task, in subscription order, outside the
/// bus lock. A failing or panicking handler is logged and counted; the rest
/// still run.
pub struct EventBus {
    inner: Arc<Mutex<Inner>>,
    capacity: usize,
}

/// Registration returned by [`EventBus::subscribe`]. Dropping it keeps the
/// subscription alive; call [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: u64,
    bus: Weak<Mutex<Inner>>,
}

impl Subscription {
    /// Stop delivering events to this handler.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.bus.upgrade() {
            lock_unpoisoned(&inner).subscribers.retain(|s| s.id != self.id);
        }
    }
}

impl EventBus {
    /// A bus retaining at most `capacity` events for replay.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                subscribers: Vec::new(),
                history: VecDeque::with_capacity(capacity),
            })),
            capacity,
        }
    }

    /// Deliver `event` to every matching subscriber.
    pub fn publish(&self, event: Event, options: PublishOptions) -> PublishReport {
        let targets: Vec<(u64, EventHandler)> = {
            let mut inner = lock_unpoisoned(&self.inner);
            if options.retain && self.capacity > 0 {
                if inner.history.len() == self.capacity {
                    inner.history.pop_front();
                }
                inner.history.push_back(event.clone());
            }
            inner
                .subscribers
                .iter()
                .filter(|s| s.pattern.matches(&event.event_type))
                .map(|s| (s.id, Arc::clone(&s.handler)))
                .collect()
        };

        let mut report = PublishReport::default();
        for (id, handler) in targets {
            if invoke(id, &handler, &event) {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }
        report
    }

    /// Register `handler` for events matching `pattern`: an exact type,
    /// `prefix.*`, or `*`.
    ///
    /// With `replay`, retained matches are delivered before this returns.
    /// Events published concurrently with the replay may reach the handler
    /// before older replayed ones.
    pub fn subscribe<F>(&self, pattern: &str, options: SubscribeOptions, handler: F) -> Subscription
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        let pattern = Pattern::parse(pattern);
        let (id, backlog) = {
            let mut inner = lock_unpoisoned(&self.inner);
            inner.next_id += 1;
            let id = inner.next_id;
            let backlog: Vec<Event> = if options.replay {
                inner
                    .history
                    .iter()
                    .filter(|e| pattern.matches(&e.event_type))
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };
            inner.subscribers.push(Subscriber {
                id,
                pattern,
                handler: Arc::clone(&handler),
            });
            (id, backlog)
        };

        for event in &backlog {
            invoke(id, &handler, event);
        }

        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Up to `limit` most recent retained events matching `pattern`, oldest
    /// first.
    pub fn recent(&self, pattern: &str, limit: usize) -> Vec<Event> {
        let pattern = Pattern::parse(pattern);
        let inner = lock_unpoisoned(&self.inner);
        let mut matched: Vec<Event> = inner
            .history
            .iter()
            .rev()
            .filter(|e| pattern.matches(&e.event_type))
            .take(limit)
            .cloned()
            .collect();
        matched.reverse();
        matched
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        lock_unpoisoned(&self.inner).subscribers.len()
    }
}

fn invoke(id: u64, handler: &EventHandler, event: &Event) -> bool {
    match catch_unwind(AssertUnwindSafe(|| handler(event))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!(subscriber = id, event_type = %event.event_type, error = %e, "event handler failed");
            false
        }
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic".to_string());
            tracing::error!(subscriber = id, event_type = %event.event_type, panic = %msg, "event handler panicked");
            false
        }
    }
}
