//! Process-wide event bus: the single native event source for session
//! events on the consuming side.
//!
//! Listener registration is deliberately cheap to observe
//! ([`EventBus::data_listener_count`]) because installing listeners is the
//! resource the router economizes: the router installs at most one per
//! event kind no matter how many panes subscribe.

use std::sync::{Arc, Mutex};

use spool_pty::{ActivityEvent, DataEvent, EventSink, ExitEvent};

/// Identifies an installed listener so it can be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: u64,
    data: Vec<(ListenerId, Listener<DataEvent>)>,
    exit: Vec<(ListenerId, Listener<ExitEvent>)>,
    activity: Vec<(ListenerId, Listener<ActivityEvent>)>,
}

impl BusInner {
    fn next_id(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }
}

pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn listen_data(
        &self,
        listener: impl Fn(&DataEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let mut inner = self.lock();
        let id = inner.next_id();
        inner.data.push((id, Arc::new(listener)));
        id
    }

    pub fn listen_exit(
        &self,
        listener: impl Fn(&ExitEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let mut inner = self.lock();
        let id = inner.next_id();
        inner.exit.push((id, Arc::new(listener)));
        id
    }

    pub fn listen_activity(
        &self,
        listener: impl Fn(&ActivityEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let mut inner = self.lock();
        let id = inner.next_id();
        inner.activity.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener of any kind. Unknown ids are ignored.
    pub fn unlisten(&self, id: ListenerId) {
        let mut inner = self.lock();
        inner.data.retain(|(lid, _)| *lid != id);
        inner.exit.retain(|(lid, _)| *lid != id);
        inner.activity.retain(|(lid, _)| *lid != id);
    }

    pub fn data_listener_count(&self) -> usize {
        self.lock().data.len()
    }

    pub fn exit_listener_count(&self) -> usize {
        self.lock().exit.len()
    }

    pub fn activity_listener_count(&self) -> usize {
        self.lock().activity.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// Dispatch snapshots the listener list and calls outside the lock, so a
// listener may install or remove listeners without deadlocking.
impl EventSink for EventBus {
    fn emit_data(&self, event: DataEvent) {
        let listeners: Vec<Listener<DataEvent>> =
            self.lock().data.iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener(&event);
        }
    }

    fn emit_exit(&self, event: ExitEvent) {
        let listeners: Vec<Listener<ExitEvent>> =
            self.lock().exit.iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener(&event);
        }
    }

    fn emit_activity(&self, event: ActivityEvent) {
        let listeners: Vec<Listener<ActivityEvent>> = self
            .lock()
            .activity
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn data_event(id: &str) -> DataEvent {
        DataEvent {
            session_id: id.to_string(),
            bytes: b"x".to_vec(),
        }
    }

    #[test]
    fn listeners_receive_emitted_events() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        bus.listen_data(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit_data(data_event("a"));
        bus.emit_data(data_event("b"));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unlisten_stops_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let id = bus.listen_data(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit_data(data_event("a"));
        bus.unlisten(id);
        bus.emit_data(data_event("a"));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.data_listener_count(), 0);
    }

    #[test]
    fn listener_kinds_are_independent() {
        let bus = EventBus::new();
        bus.listen_exit(|_| {});
        assert_eq!(bus.data_listener_count(), 0);
        assert_eq!(bus.exit_listener_count(), 1);
        assert_eq!(bus.activity_listener_count(), 0);
    }
}
