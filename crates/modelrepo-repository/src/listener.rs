//! Unit lifecycle listeners

use derive_more::Display;
use modelrepo_common::{RecordKey, UnitDescriptor, UnitId};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Something that happened to a unit
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitEvent {
    Opened {
        unit: UnitId,
        descriptor: UnitDescriptor,
    },
    Closed {
        unit: UnitId,
        expunged: bool,
    },
    /// A stored record failed to decode; `key` is in client numbering
    RecordCorrupted {
        key: RecordKey,
        layer: usize,
        reason: String,
    },
}

/// Handle returned by [`UnitListeners::subscribe`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[display("listener-{_0}")]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&UnitEvent) + Send + Sync>;

/// Subscriber list for [`UnitEvent`]s
#[derive(Default)]
pub struct UnitListeners {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
}

impl UnitListeners {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl Fn(&UnitEvent) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener; removing it again is a no-op that returns `false`
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Deliver `event` to every current listener
    ///
    /// Listeners run outside the internal lock and may (un)subscribe.
    pub fn fire(&self, event: &UnitEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
