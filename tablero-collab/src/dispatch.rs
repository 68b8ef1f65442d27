//! Per-kind subscriber registry with handle-based removal.
//!
//! The channel's reader task funnels every accepted envelope through a
//! [`Dispatcher`]. Subscribers for a kind run in registration order on
//! that one task, so handler code never races against itself. Removal is
//! by the [`HandlerId`] returned at registration: closures have no usable
//! equality, and two subscribers with identical behavior must still be
//! removable independently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::protocol::{Envelope, EventKind};

/// Opaque handle identifying one registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Subscriber lists keyed by event kind.
#[derive(Default)]
pub struct Dispatcher {
    handlers: Mutex<HashMap<EventKind, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.lock().unwrap();
        handlers.entry(kind).or_default().push((id, Arc::new(handler)));
        id
    }

    /// Remove one subscriber. Returns false when the handle is unknown
    /// (already removed, or registered under a different kind).
    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap();
        match handlers.get_mut(&kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|(handler_id, _)| *handler_id != id);
                before != list.len()
            }
            None => false,
        }
    }

    /// Remove every subscriber for every kind.
    pub fn clear(&self) {
        self.handlers.lock().unwrap().clear();
    }

    /// Invoke the subscribers for `env.kind` in registration order.
    ///
    /// The list is snapshotted before invocation, so handlers may call
    /// `on`/`off` without deadlocking; a removal takes effect from the
    /// next dispatch.
    pub fn dispatch(&self, env: &Envelope) {
        let snapshot: Vec<Handler> = {
            let handlers = self.handlers.lock().unwrap();
            match handlers.get(&env.kind) {
                Some(list) => list.iter().map(|(_, handler)| handler.clone()).collect(),
                None => Vec::new(),
            }
        };
        if snapshot.is_empty() {
            log::trace!("No subscribers for {:?}", env.kind);
            return;
        }
        for handler in snapshot {
            handler(env);
        }
    }

    /// Number of subscribers currently registered for a kind.
    pub fn count(&self, kind: EventKind) -> usize {
        self.handlers
            .lock()
            .unwrap()
            .get(&kind)
            .map_or(0, |list| list.len())
    }
}
