use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::events::{EventKind, StreamEvent};

/// Receives dispatched events synchronously, in arrival order.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &StreamEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&StreamEvent) + Send + Sync,
{
    fn handle(&self, event: &StreamEvent) {
        self(event)
    }
}

/// Registry: event tag -> handlers.
///
/// Handlers for one tag run in registration order. Lookups return `Option`
/// rather than failing when a tag has no handler.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    handlers: HashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
}

impl EventDispatcher {
    /// Dispatcher with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `handler` to the list for `kind`.
    pub fn register(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    /// Registers one handler for several tags.
    pub fn register_many(&mut self, kinds: &[EventKind], handler: Arc<dyn EventHandler>) {
        for kind in kinds {
            self.register(*kind, handler.clone());
        }
    }

    /// Builder form of [`register`](EventDispatcher::register).
    pub fn with_handler(mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    /// Handlers registered for `kind`, `None` when there are none.
    pub fn handlers(&self, kind: EventKind) -> Option<&[Arc<dyn EventHandler>]> {
        self.handlers
            .get(&kind)
            .filter(|handlers| !handlers.is_empty())
            .map(Vec::as_slice)
    }

    /// Delivers the event to every handler for its tag. Returns how many
    /// handlers received it; events without handlers are dropped.
    pub fn dispatch(&self, event: &StreamEvent) -> usize {
        let Some(handlers) = self.handlers(event.kind()) else {
            trace!(kind = %event.kind(), "no handler registered");
            return 0;
        };
        for handler in handlers {
            handler.handle(event);
        }
        handlers.len()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handler that records every event it receives.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<StreamEvent>>>,
}

impl EventLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes this log to every event tag.
    pub fn attach(&self, dispatcher: &mut EventDispatcher) {
        dispatcher.register_many(&EventKind::ALL, Arc::new(self.clone()));
    }

    /// Snapshot of the events recorded so far.
    pub fn events(&self) -> Vec<StreamEvent> {
        lock(&self.events).clone()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    /// True when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        lock(&self.events).is_empty()
    }
}

impl EventHandler for EventLog {
    fn handle(&self, event: &StreamEvent) {
        lock(&self.events).push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn delta(step: &str) -> StreamEvent {
        StreamEvent::ReasoningDelta {
            step_id: step.into(),
            text: "t".into(),
        }
    }

    #[test]
    fn missing_handler_is_none_not_error() {
        let dispatcher = EventDispatcher::new();
        assert!(dispatcher.handlers(EventKind::ToolEnd).is_none());
        assert_eq!(dispatcher.dispatch(&delta("s")), 0);
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();
        for name in ["first", "second"] {
            let order = order.clone();
            dispatcher.register(
                EventKind::ReasoningDelta,
                Arc::new(move |_: &StreamEvent| lock(&order).push(name)),
            );
        }
        assert_eq!(dispatcher.dispatch(&delta("s")), 2);
        assert_eq!(*lock(&order), vec!["first", "second"]);
    }

    #[test]
    fn events_route_by_tag_only() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let dispatcher = EventDispatcher::new().with_handler(
            EventKind::MessageDelta,
            Arc::new(move |_: &StreamEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        dispatcher.dispatch(&delta("s"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn event_log_preserves_arrival_order() {
        let log = EventLog::new();
        let mut dispatcher = EventDispatcher::new();
        log.attach(&mut dispatcher);
        dispatcher.dispatch(&delta("a"));
        dispatcher.dispatch(&delta("b"));
        let ids: Vec<String> = log
            .events()
            .iter()
            .filter_map(|e| e.step_id().map(str::to_string))
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
