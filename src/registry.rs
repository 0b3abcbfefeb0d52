//! Owned listener collections with handle-based unsubscribe.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::error;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slots<T> {
    next_id: u64,
    listeners: HashMap<u64, Listener<T>>,
}

/// A set of callbacks receiving `&T`.
///
/// * `add` returns a [`ListenerHandle`]; unsubscribing is O(1) and idempotent.
/// * `emit` calls listeners in registration order, outside the internal lock,
///   so a listener may add or remove listeners (including itself).
/// * A panicking listener is caught and logged; the remaining listeners still
///   run.
pub struct ListenerRegistry<T> {
    name: &'static str,
    slots: Arc<Mutex<Slots<T>>>,
}

impl<T: 'static> ListenerRegistry<T> {
    /// `name` labels log output for panicking listeners.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Arc::new(Mutex::new(Slots {
                next_id: 0,
                listeners: HashMap::new(),
            })),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots<T>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerHandle {
        let mut slots = self.slots();
        let id = slots.next_id;
        slots.next_id += 1;
        slots.listeners.insert(id, Arc::new(listener));

        let weak: Weak<Mutex<Slots<T>>> = Arc::downgrade(&self.slots);
        ListenerHandle {
            remove: Arc::new(move || {
                if let Some(slots) = weak.upgrade() {
                    slots
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .listeners
                        .remove(&id);
                }
            }),
        }
    }

    pub fn emit(&self, value: &T) {
        let mut snapshot: Vec<(u64, Listener<T>)> = self
            .slots()
            .listeners
            .iter()
            .map(|(id, l)| (*id, Arc::clone(l)))
            .collect();
        snapshot.sort_unstable_by_key(|(id, _)| *id);

        for (id, listener) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
                error!("{} listener #{id} panicked; continuing with the rest", self.name);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every listener.  Outstanding handles become no-ops.
    pub fn clear(&self) {
        self.slots().listeners.clear();
    }
}

/// Returned by listener registration; call [`unsubscribe`](Self::unsubscribe)
/// to remove the listener.
///
/// Dropping the handle does **not** unsubscribe, so fire-and-forget
/// registrations stay alive for the lifetime of their registry.
#[derive(Clone)]
pub struct ListenerHandle {
    remove: Arc<dyn Fn() + Send + Sync>,
}

impl ListenerHandle {
    /// Remove the listener.  Safe to call any number of times, and after the
    /// registry itself is gone.
    pub fn unsubscribe(&self) {
        (self.remove)();
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ListenerHandle")
    }
}
