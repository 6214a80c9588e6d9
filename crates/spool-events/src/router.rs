//! Per-session event subscriptions over a single native listener.
//!
//! The router keeps a map from session id to callback list per event kind,
//! plus a global data list for cross-cutting observers. The first
//! subscription of a kind installs exactly one bus listener; later
//! subscriptions reuse it. When the last subscriber for a session id goes
//! away its map entry is deleted, so long-lived processes don't accumulate
//! bookkeeping as panes open and close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use spool_pty::{DataEvent, ExitEvent};

use crate::bus::{EventBus, ListenerId};

struct Slot<E> {
    token: u64,
    active: Arc<AtomicBool>,
    callback: Arc<dyn Fn(&E) + Send + Sync>,
}

impl<E> Clone for Slot<E> {
    fn clone(&self) -> Self {
        Self {
            token: self.token,
            active: Arc::clone(&self.active),
            callback: Arc::clone(&self.callback),
        }
    }
}

#[derive(Default)]
struct RouterInner {
    next_token: u64,
    data: HashMap<String, Vec<Slot<DataEvent>>>,
    global_data: Vec<Slot<DataEvent>>,
    exit: HashMap<String, Vec<Slot<ExitEvent>>>,
    data_listener: Option<ListenerId>,
    exit_listener: Option<ListenerId>,
}

impl RouterInner {
    fn next_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SubscriptionKind {
    Data,
    GlobalData,
    Exit,
}

/// Handle returned by the subscribe calls. Cancels explicitly via
/// [`Subscription::cancel`] or implicitly on drop.
pub struct Subscription {
    router: Weak<EventRouter>,
    kind: SubscriptionKind,
    session_id: Option<String>,
    token: u64,
    active: Arc<AtomicBool>,
}

impl Subscription {
    /// Stop delivering events to this subscription. Safe to call from
    /// inside a callback currently being dispatched: the flag flips first,
    /// so an in-flight snapshot skips it.
    pub fn cancel(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(router) = self.router.upgrade() {
            router.remove(self.kind, self.session_id.as_deref(), self.token);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub struct EventRouter {
    bus: Arc<EventBus>,
    inner: Mutex<RouterInner>,
    // Handed to subscriptions and bus listeners; breaks the cycle that a
    // listener holding the router strongly would create.
    weak_self: Weak<EventRouter>,
}

impl EventRouter {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            bus,
            inner: Mutex::new(RouterInner::default()),
            weak_self: weak_self.clone(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RouterInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to one session's data events.
    pub fn subscribe_data(
        &self,
        session_id: &str,
        callback: impl Fn(&DataEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let slot = self.new_slot(callback);
        let subscription = self.subscription(SubscriptionKind::Data, Some(session_id), &slot);
        {
            let mut inner = self.lock();
            inner
                .data
                .entry(session_id.to_string())
                .or_default()
                .push(slot);
        }
        self.ensure_data_listener();
        subscription
    }

    /// Subscribe to every session's data events. Fires in addition to any
    /// per-session subscriptions for the same event.
    pub fn subscribe_data_global(
        &self,
        callback: impl Fn(&DataEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let slot = self.new_slot(callback);
        let subscription = self.subscription(SubscriptionKind::GlobalData, None, &slot);
        self.lock().global_data.push(slot);
        self.ensure_data_listener();
        subscription
    }

    /// Subscribe to one session's exit event.
    pub fn subscribe_exit(
        &self,
        session_id: &str,
        callback: impl Fn(&ExitEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let slot = self.new_slot(callback);
        let subscription = self.subscription(SubscriptionKind::Exit, Some(session_id), &slot);
        {
            let mut inner = self.lock();
            inner
                .exit
                .entry(session_id.to_string())
                .or_default()
                .push(slot);
        }
        self.ensure_exit_listener();
        subscription
    }

    /// Number of session ids with live bookkeeping, across both kinds.
    /// Stays bounded as panes open and close.
    pub fn tracked_sessions(&self) -> usize {
        let inner = self.lock();
        let mut ids: std::collections::HashSet<&str> =
            inner.data.keys().map(String::as_str).collect();
        ids.extend(inner.exit.keys().map(String::as_str));
        ids.len()
    }

    fn new_slot<E>(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> Slot<E> {
        let token = self.lock().next_token();
        Slot {
            token,
            active: Arc::new(AtomicBool::new(true)),
            callback: Arc::new(callback),
        }
    }

    fn subscription<E>(
        &self,
        kind: SubscriptionKind,
        session_id: Option<&str>,
        slot: &Slot<E>,
    ) -> Subscription {
        Subscription {
            router: self.weak_self.clone(),
            kind,
            session_id: session_id.map(str::to_string),
            token: slot.token,
            active: Arc::clone(&slot.active),
        }
    }

    fn ensure_data_listener(&self) {
        let mut inner = self.lock();
        if inner.data_listener.is_some() {
            return;
        }
        let router = self.weak_self.clone();
        let id = self.bus.listen_data(move |event| {
            if let Some(router) = router.upgrade() {
                router.dispatch_data(event);
            }
        });
        log::debug!("installed the native data listener");
        inner.data_listener = Some(id);
    }

    fn ensure_exit_listener(&self) {
        let mut inner = self.lock();
        if inner.exit_listener.is_some() {
            return;
        }
        let router = self.weak_self.clone();
        let id = self.bus.listen_exit(move |event| {
            if let Some(router) = router.upgrade() {
                router.dispatch_exit(event);
            }
        });
        log::debug!("installed the native exit listener");
        inner.exit_listener = Some(id);
    }

    // Dispatch never holds the lock while running callbacks: a callback is
    // free to subscribe or cancel without deadlock, and a cancellation
    // mid-dispatch is honored via the slot's active flag.
    fn dispatch_data(&self, event: &DataEvent) {
        let (targeted, global) = {
            let inner = self.lock();
            let targeted: Vec<Slot<DataEvent>> = inner
                .data
                .get(&event.session_id)
                .map(|slots| slots.to_vec())
                .unwrap_or_default();
            let global = inner.global_data.to_vec();
            (targeted, global)
        };
        for slot in targeted.iter().chain(global.iter()) {
            if slot.active.load(Ordering::SeqCst) {
                (slot.callback)(event);
            }
        }
    }

    fn dispatch_exit(&self, event: &ExitEvent) {
        let targeted: Vec<Slot<ExitEvent>> = {
            let inner = self.lock();
            inner
                .exit
                .get(&event.session_id)
                .map(|slots| slots.to_vec())
                .unwrap_or_default()
        };
        for slot in &targeted {
            if slot.active.load(Ordering::SeqCst) {
                (slot.callback)(event);
            }
        }
    }

    fn remove(&self, kind: SubscriptionKind, session_id: Option<&str>, token: u64) {
        let mut inner = self.lock();
        match (kind, session_id) {
            (SubscriptionKind::Data, Some(id)) => {
                if let Some(slots) = inner.data.get_mut(id) {
                    slots.retain(|s| s.token != token);
                    if slots.is_empty() {
                        inner.data.remove(id);
                    }
                }
            }
            (SubscriptionKind::Exit, Some(id)) => {
                if let Some(slots) = inner.exit.get_mut(id) {
                    slots.retain(|s| s.token != token);
                    if slots.is_empty() {
                        inner.exit.remove(id);
                    }
                }
            }
            (SubscriptionKind::GlobalData, _) => {
                inner.global_data.retain(|s| s.token != token);
            }
            _ => {}
        }
    }
}
