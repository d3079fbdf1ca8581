//! Typed publish/subscribe channels.
//!
//! DESIGN
//! ======
//! Each event kind gets its own `Signal<T>`; producers own the signal and
//! consumers connect closures to it. Emission snapshots the observer list
//! before invoking anything, so observers may connect, disconnect, or call
//! back into the producer without tripping a `RefCell` borrow.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Handle returned by [`Signal::connect`], used to disconnect later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Callback<T> = Rc<dyn Fn(&T)>;

pub struct Signal<T> {
    next_id: Cell<u64>,
    observers: RefCell<Vec<(ObserverId, Callback<T>)>>,
}

impl<T> Signal<T> {
    #[must_use]
    pub fn new() -> Self {
        Self { next_id: Cell::new(1), observers: RefCell::new(Vec::new()) }
    }

    /// Subscribe `callback` to every future emission.
    pub fn connect(&self, callback: impl Fn(&T) + 'static) -> ObserverId {
        let id = ObserverId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.observers.borrow_mut().push((id, Rc::new(callback)));
        id
    }

    /// Remove an observer. Returns false if it was not connected.
    pub fn disconnect(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.borrow_mut();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn disconnect_all(&self) {
        self.observers.borrow_mut().clear();
    }

    /// Deliver `payload` to observers in connection order.
    pub fn emit(&self, payload: &T) {
        let snapshot: Vec<Callback<T>> = self.observers.borrow().iter().map(|(_, cb)| Rc::clone(cb)).collect();
        for callback in snapshot {
            callback(payload);
        }
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.borrow().len()
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal").field("observers", &self.observer_count()).finish()
    }
}

#[cfg(test)]
#[path = "events_test.rs"]
mod tests;
