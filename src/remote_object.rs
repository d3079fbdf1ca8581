//! Identity, location and push/pull contract shared by every replicated object.
//!
//! DESIGN
//! ======
//! Concrete objects (proxies, links, selection models, the session proxy
//! manager, the collaboration manager) embed a [`RemoteCore`] and implement
//! [`RemoteObject`]. The core owns the lazily assigned [`GlobalId`], the
//! session back-reference (weak) and a weak handle to its owner so it can
//! register the owner in the session's object table on first id assignment.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use frames::StateMessage;

use crate::error::SmResult;
use crate::guard::ScopedFlag;
use crate::link::Link;
use crate::location::{GlobalId, Location};
use crate::locator::ProxyLocator;
use crate::proxy::ProxyRef;
use crate::selection::ProxySelectionModel;
use crate::session::{Session, WeakSession};

/// Restores the client-only flag when dropped.
pub type LocalPushOnlyGuard<'a> = ScopedFlag<'a>;

pub trait RemoteObject {
    fn remote(&self) -> &RemoteCore;

    /// Complete state of the object, or `None` for purely local objects.
    fn full_state(&self) -> Option<StateMessage>;

    /// Apply a state message received from a server or another client.
    ///
    /// # Errors
    ///
    /// Implementations fail when the message body does not match the object.
    fn load_state(&self, message: &StateMessage, locator: &ProxyLocator) -> SmResult<()>;

    fn as_proxy(self: Rc<Self>) -> Option<ProxyRef> {
        None
    }

    fn as_link(self: Rc<Self>) -> Option<Link> {
        None
    }

    fn as_selection_model(self: Rc<Self>) -> Option<Rc<ProxySelectionModel>> {
        None
    }
}

pub struct RemoteCore {
    global_id: Cell<GlobalId>,
    location: Cell<Location>,
    prototype: Cell<bool>,
    client_only: Cell<bool>,
    session: RefCell<WeakSession>,
    owner: Weak<dyn RemoteObject>,
}

impl RemoteCore {
    pub fn new(owner: Weak<dyn RemoteObject>, location: Location) -> Self {
        Self {
            global_id: Cell::new(GlobalId::UNSET),
            location: Cell::new(location),
            prototype: Cell::new(false),
            client_only: Cell::new(false),
            session: RefCell::new(WeakSession::default()),
            owner,
        }
    }

    /// Current id, assigning a fresh one from the attached session if unset.
    ///
    /// Returns [`GlobalId::UNSET`] when no live session is attached.
    pub fn global_id(&self) -> GlobalId {
        let current = self.global_id.get();
        if current.is_set() {
            return current;
        }
        let Some(session) = self.session() else {
            return GlobalId::UNSET;
        };
        match session.reserve_global_id() {
            Ok(id) => {
                self.global_id.set(id);
                session.register_remote_object(id, self.owner.clone());
                id
            }
            Err(e) => {
                tracing::error!(error = %e, "session: failed to reserve a global id");
                GlobalId::UNSET
            }
        }
    }

    /// Current id without assigning one.
    #[must_use]
    pub fn global_id_if_set(&self) -> Option<GlobalId> {
        let id = self.global_id.get();
        id.is_set().then_some(id)
    }

    #[must_use]
    pub fn has_global_id(&self) -> bool {
        self.global_id.get().is_set()
    }

    /// Id as a string, assigning one if needed.
    pub fn global_id_as_string(&self) -> String {
        self.global_id().to_string()
    }

    /// Force a specific id, registering the owner under it in the attached session.
    pub fn set_global_id(&self, id: GlobalId) {
        let previous = self.global_id.replace(id);
        let Some(session) = self.session() else {
            return;
        };
        if previous.is_set() && previous != id {
            session.unregister_remote_object(previous, &self.owner);
        }
        if id.is_set() {
            session.register_remote_object(id, self.owner.clone());
        }
    }

    /// Attach to `session`, moving the object-table registration if needed.
    pub fn set_session(&self, session: &Session) {
        let old = self.session.replace(session.downgrade());
        if let Some(old) = old.upgrade() {
            if old.ptr_eq(session) {
                return;
            }
            let id = self.global_id.get();
            if id.is_set() {
                old.unregister_remote_object(id, &self.owner);
            }
        }

        let id = self.global_id.get();
        if !id.is_set() {
            return;
        }
        let collides = session.remote_object(id).is_some_and(|existing| !ptr_eq_owner(&existing, &self.owner));
        if collides {
            tracing::warn!(%id, "session: global id already in use, assigning a new one");
            self.global_id.set(GlobalId::UNSET);
            self.global_id();
        } else {
            session.register_remote_object(id, self.owner.clone());
        }
    }

    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.session.borrow().upgrade()
    }

    #[must_use]
    pub fn weak_session(&self) -> WeakSession {
        self.session.borrow().clone()
    }

    #[must_use]
    pub fn location(&self) -> Location {
        self.location.get()
    }

    pub fn set_location(&self, location: Location) {
        self.location.set(location);
    }

    #[must_use]
    pub fn is_prototype(&self) -> bool {
        self.prototype.get()
    }

    /// Mark as prototype. Prototypes live at location 0 and are never pushed.
    pub fn set_prototype(&self, prototype: bool) {
        self.prototype.set(prototype);
        if prototype {
            self.location.set(Location::empty());
        }
    }

    /// Location with server bits stripped while pushes are local-only.
    #[must_use]
    pub fn filtered_location(&self) -> Location {
        if self.client_only.get() { self.location.get() & Location::CLIENT } else { self.location.get() }
    }

    pub fn enable_local_push_only(&self) {
        self.client_only.set(true);
    }

    pub fn disable_local_push_only(&self) {
        self.client_only.set(false);
    }

    #[must_use]
    pub fn is_local_push_only(&self) -> bool {
        self.client_only.get()
    }

    /// Restrict pushes to the client until the guard is dropped.
    pub fn local_push_only(&self) -> LocalPushOnlyGuard<'_> {
        ScopedFlag::set(&self.client_only, true)
    }

    /// Send `message` to the processes in [`RemoteCore::filtered_location`].
    ///
    /// Nothing goes over the wire for prototypes, client-only locations, or
    /// while the session is applying a notification from another client.
    ///
    /// # Errors
    ///
    /// Propagates transport and server failures.
    pub fn push_state(&self, mut message: StateMessage) -> SmResult<()> {
        if self.prototype.get() {
            return Ok(());
        }
        let location = self.filtered_location();
        if location.server_part().is_empty() {
            return Ok(());
        }
        let Some(session) = self.session() else {
            return Ok(());
        };
        if session.is_processing_remote_notification() {
            return Ok(());
        }
        message.global_id = self.global_id().get();
        message.location = location.bits();
        session.push_state(&message)
    }

    /// Fetch the server's copy of this object's state into `message`.
    ///
    /// Returns false for prototypes, detached objects and failed round trips.
    pub fn pull_state(&self, message: &mut StateMessage) -> bool {
        if self.prototype.get() {
            return false;
        }
        let Some(session) = self.session() else {
            return false;
        };
        let id = self.global_id();
        match session.pull_state(id, self.location.get()) {
            Ok(state) => {
                *message = state;
                true
            }
            Err(e) => {
                tracing::warn!(%id, error = %e, "session: pull failed");
                false
            }
        }
    }
}

impl Drop for RemoteCore {
    fn drop(&mut self) {
        let id = self.global_id.get();
        if !id.is_set() {
            return;
        }
        if let Some(session) = self.session.get_mut().upgrade() {
            session.forget_dead_object(id);
        }
    }
}

fn ptr_eq_owner(existing: &Rc<dyn RemoteObject>, owner: &Weak<dyn RemoteObject>) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(existing), owner.as_ptr())
}

#[cfg(test)]
#[path = "remote_object_test.rs"]
mod tests;
