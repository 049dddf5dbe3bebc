//! Change-data-capture events.
//!
//! Every committed mutation emits an event after it is in memory and queued
//! to the WAL. Dispatch is synchronous to in-process subscribers and to any
//! registered [`EventSink`]; a sink that fails (or a subscriber that went
//! away) never fails the originating mutation.

use mikrodb_codec::Record;
use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};

/// Kind of change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A record was written (insert or update).
    ItemWritten,
    /// A record was deleted by request.
    ItemDeleted,
    /// A record was removed because its expiration passed.
    ItemExpired,
    /// A table was dropped from the engine.
    TableDeleted,
}

impl EventKind {
    /// Wire name of the event, as carried in notification payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ItemWritten => "item.written",
            Self::ItemDeleted => "item.deleted",
            Self::ItemExpired => "item.expired",
            Self::TableDeleted => "table.deleted",
        }
    }
}

/// A single change event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// Table the change applies to.
    pub table: String,
    /// Key of the affected record, when the event concerns one record.
    pub key: Option<String>,
    /// The record as of the event, when one is available.
    pub record: Option<Record>,
}

impl Event {
    /// Creates a per-record event.
    #[must_use]
    pub fn item(kind: EventKind, table: &str, key: &str, record: Option<Record>) -> Self {
        Self {
            kind,
            table: table.to_string(),
            key: Some(key.to_string()),
            record,
        }
    }

    /// Creates a table-level event.
    #[must_use]
    pub fn table(kind: EventKind, table: &str) -> Self {
        Self {
            kind,
            table: table.to_string(),
            key: None,
            record: None,
        }
    }
}

/// External delivery hook for events.
///
/// The engine only defines the interface; the embedder wires up the actual
/// fan-out (webhook POSTs, queues). Delivery is best effort and must not
/// panic.
pub trait EventSink: Send + Sync {
    /// Delivers one event.
    fn deliver(&self, event: &Event);
}

/// Distributes events to subscribers and sinks.
pub struct EventHub {
    subscribers: RwLock<Vec<Sender<Event>>>,
    sinks: RwLock<Vec<Box<dyn EventSink>>>,
}

impl EventHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Subscribes to all future events.
    ///
    /// The receiver should be drained regularly; disconnected receivers are
    /// pruned on the next emit.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Registers an external sink.
    pub fn register_sink(&self, sink: Box<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    /// Emits an event to every subscriber and sink.
    pub fn emit(&self, event: Event) {
        {
            let sinks = self.sinks.read();
            for sink in sinks.iter() {
                sink.deliver(&event);
            }
        }
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Returns the number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mikrodb_codec::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn emit_and_receive() {
        let hub = EventHub::new();
        let rx = hub.subscribe();

        let record = Record::new(Value::Int(1), 1, 0, None);
        let event = Event::item(EventKind::ItemWritten, "users", "u1", Some(record));
        hub.emit(event.clone());

        assert_eq!(rx.try_recv().unwrap(), event);
    }

    #[test]
    fn multiple_subscribers_all_receive() {
        let hub = EventHub::new();
        let rx1 = hub.subscribe();
        let rx2 = hub.subscribe();

        hub.emit(Event::table(EventKind::TableDeleted, "users"));

        assert_eq!(rx1.try_recv().unwrap().kind, EventKind::TableDeleted);
        assert_eq!(rx2.try_recv().unwrap().kind, EventKind::TableDeleted);
    }

    #[test]
    fn dead_subscribers_are_pruned() {
        let hub = EventHub::new();
        let rx = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);

        drop(rx);
        hub.emit(Event::table(EventKind::TableDeleted, "t"));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn sinks_are_invoked() {
        struct Counter(Arc<AtomicUsize>);
        impl EventSink for Counter {
            fn deliver(&self, _event: &Event) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let count = Arc::new(AtomicUsize::new(0));
        let hub = EventHub::new();
        hub.register_sink(Box::new(Counter(Arc::clone(&count))));

        hub.emit(Event::table(EventKind::TableDeleted, "a"));
        hub.emit(Event::item(EventKind::ItemDeleted, "a", "k", None));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn wire_names() {
        assert_eq!(EventKind::ItemWritten.as_str(), "item.written");
        assert_eq!(EventKind::ItemDeleted.as_str(), "item.deleted");
        assert_eq!(EventKind::ItemExpired.as_str(), "item.expired");
        assert_eq!(EventKind::TableDeleted.as_str(), "table.deleted");
    }
}
