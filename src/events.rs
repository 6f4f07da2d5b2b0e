//! Synchronous lifecycle event bus.
//!
//! Publication happens on whichever thread raised the event, iterating
//! listeners in registration order. A panicking listener is isolated with
//! `catch_unwind` so it cannot stop delivery to the rest, grounded in the
//! corpus's tolerance for per-task failure in batch operations (applied
//! here to listener dispatch instead).

use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::device::Device;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Connected,
    Disconnected,
    PingFailed,
    Recovered,
    Removed,
}

/// A published lifecycle event. `device` is a cheap clone of the actor
/// handle current at publish time, not a strong reference into the
/// registry — per §9's design note, listeners must not cache it beyond
/// the callback.
#[derive(Clone)]
pub struct Event {
    pub kind: EventKind,
    pub device_id: String,
    pub device: Option<Device>,
    pub timestamp_unix_ms: u128,
}

impl Event {
    pub(crate) fn new(kind: EventKind, device_id: impl Into<String>, device: Option<Device>) -> Self {
        let timestamp_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        Event { kind, device_id: device_id.into(), device, timestamp_unix_ms }
    }
}

type Listener = Box<dyn Fn(&Event) + Send + Sync>;

/// Registry of subscribed listeners. Owned by `Client`; publication is
/// synchronous and does not touch any async runtime.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus { listeners: Mutex::new(Vec::new()) }
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.listeners.lock().expect("event bus mutex poisoned").push(Box::new(listener));
    }

    pub(crate) fn publish(&self, event: Event) {
        let listeners = self.listeners.lock().expect("event bus mutex poisoned");
        for listener in listeners.iter() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| listener(&event)));
            if let Err(_) = result {
                log::error!("event listener panicked while handling {:?} for device {}", event.kind, event.device_id);
            }
        }
    }
}

impl std::fmt::Debug for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Connected => "Connected",
            EventKind::Disconnected => "Disconnected",
            EventKind::PingFailed => "PingFailed",
            EventKind::Recovered => "Recovered",
            EventKind::Removed => "Removed",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn delivers_to_all_listeners_in_order() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let calls = calls.clone();
            bus.subscribe(move |ev| calls.lock().unwrap().push((tag, ev.kind)));
        }
        bus.publish(Event::new(EventKind::Connected, "dev1", None));
        let recorded = calls.lock().unwrap();
        assert_eq!(recorded.len(), 3);
        assert!(recorded.iter().all(|(_, k)| *k == EventKind::Connected));
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let bus = EventBus::new();
        let after_count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(|_ev| panic!("boom"));
        let after_count2 = after_count.clone();
        bus.subscribe(move |_ev| {
            after_count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(Event::new(EventKind::PingFailed, "dev1", None));
        bus.publish(Event::new(EventKind::PingFailed, "dev1", None));
        assert_eq!(after_count.load(Ordering::SeqCst), 2);
    }
}
