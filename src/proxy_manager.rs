//! Process-wide coordinator across sessions.
//!
//! DESIGN
//! ======
//! One `ProxyManager` is created per process with [`ProxyManager::initialize`]
//! and torn down with [`ProxyManager::finalize`]. It tracks the registered
//! sessions and which one is active, forwards proxy operations to the active
//! session's [`SessionProxyManager`], and owns the services shared by every
//! session: the global properties managers, the plugin manager and the
//! reader and writer factories.
//!
//! The factories follow the definitions of the active session. Global
//! property link changes become undo elements on the active session's undo
//! builder, but only while a single session is registered.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::events::{ObserverId, Signal};
use crate::global_properties::{GlobalPropertiesManager, GlobalPropertiesRegistry, GlobalPropertyLinkModified};
use crate::plugins::PluginManager;
use crate::proxy::ProxyRef;
use crate::pxm::SessionProxyManager;
use crate::readers::ReaderFactory;
use crate::session::{Session, SessionId};
use crate::undo::GlobalPropertyLinkUpdate;
use crate::version::{CURRENT_STATE_VERSION, StateVersion};
use crate::writers::WriterFactory;

struct SessionEntry {
    session: Session,
    definitions_observer: ObserverId,
}

struct GlobalObserver {
    manager: Weak<GlobalPropertiesManager>,
    observer: ObserverId,
}

pub struct ProxyManager {
    self_weak: Weak<ProxyManager>,
    initialized: Cell<bool>,
    sessions: RefCell<IndexMap<SessionId, SessionEntry>>,
    active: Cell<Option<SessionId>>,
    globals: Rc<GlobalPropertiesRegistry>,
    global_observers: RefCell<HashMap<String, GlobalObserver>>,
    registry_observers: Cell<Option<(ObserverId, ObserverId)>>,
    plugins: PluginManager,
    readers: Rc<ReaderFactory>,
    writers: Rc<WriterFactory>,
    pub active_session_changed: Signal<Option<SessionId>>,
}

impl fmt::Debug for ProxyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyManager")
            .field("initialized", &self.initialized.get())
            .field("sessions", &self.sessions.borrow().keys().collect::<Vec<_>>())
            .field("active", &self.active.get())
            .finish_non_exhaustive()
    }
}

impl ProxyManager {
    /// Create the coordinator. Call [`ProxyManager::finalize`] before
    /// dropping it.
    #[must_use]
    pub fn initialize() -> Rc<Self> {
        let manager = Rc::new_cyclic(|weak: &Weak<ProxyManager>| ProxyManager {
            self_weak: weak.clone(),
            initialized: Cell::new(true),
            sessions: RefCell::new(IndexMap::new()),
            active: Cell::new(None),
            globals: Rc::new(GlobalPropertiesRegistry::new()),
            global_observers: RefCell::new(HashMap::new()),
            registry_observers: Cell::new(None),
            plugins: PluginManager::new(),
            readers: Rc::new(ReaderFactory::new()),
            writers: Rc::new(WriterFactory::new()),
            active_session_changed: Signal::new(),
        });

        let weak = Rc::downgrade(&manager);
        let registered = manager.globals.registered.connect(move |name| {
            if let Some(manager) = weak.upgrade() {
                manager.observe_global_manager(name);
            }
        });
        let weak = Rc::downgrade(&manager);
        let unregistered = manager.globals.unregistered.connect(move |name| {
            if let Some(manager) = weak.upgrade() {
                manager.forget_global_manager(name);
            }
        });
        manager.registry_observers.set(Some((registered, unregistered)));
        tracing::info!(version = %CURRENT_STATE_VERSION, "proxy manager: initialized");
        manager
    }

    /// Unregister every session and detach every observer.
    pub fn finalize(&self) {
        if !self.initialized.replace(false) {
            return;
        }
        let ids: Vec<SessionId> = self.sessions.borrow().keys().copied().collect();
        for id in ids {
            self.unregister_session(id);
        }
        let names: Vec<String> = self.global_observers.borrow().keys().cloned().collect();
        for name in names {
            self.forget_global_manager(&name);
        }
        if let Some((registered, unregistered)) = self.registry_observers.take() {
            self.globals.registered.disconnect(registered);
            self.globals.unregistered.disconnect(unregistered);
        }
        tracing::info!("proxy manager: finalized");
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.get()
    }

    /// Version of the state documents this process writes.
    #[must_use]
    pub fn version(&self) -> StateVersion {
        CURRENT_STATE_VERSION
    }

    // =========================================================================
    // SESSIONS
    // =========================================================================

    /// Track `session` and make it the active one.
    pub fn register_session(&self, session: &Session) {
        let id = session.id();
        if self.sessions.borrow().contains_key(&id) {
            return;
        }
        session.proxy_manager().set_global_properties(Some(Rc::clone(&self.globals)));
        self.plugins.register_session(session);

        let weak = self.self_weak.clone();
        let definitions_observer = session.definition_manager().updated.connect(move |_| {
            if let Some(manager) = weak.upgrade() {
                if manager.active.get() == Some(id) {
                    manager.refresh_factories();
                }
            }
        });
        self.sessions.borrow_mut().insert(id, SessionEntry { session: session.clone(), definitions_observer });
        tracing::info!(session = %id, uri = %session.uri(), "proxy manager: session registered");
        self.set_active_session(Some(id));
    }

    /// Stop tracking a session. If it was active, another registered session
    /// (if any) becomes active.
    pub fn unregister_session(&self, id: SessionId) -> bool {
        let Some(entry) = self.sessions.borrow_mut().shift_remove(&id) else {
            return false;
        };
        entry.session.definition_manager().updated.disconnect(entry.definitions_observer);
        entry.session.proxy_manager().set_global_properties(None);
        self.plugins.unregister_session(id);
        tracing::info!(session = %id, "proxy manager: session unregistered");

        if self.active.get() == Some(id) {
            let next = self.sessions.borrow().keys().next().copied();
            self.set_active_session(next);
        }
        true
    }

    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.sessions.borrow().get(&id).map(|e| e.session.clone())
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.borrow().values().map(|e| e.session.clone()).collect()
    }

    #[must_use]
    pub fn number_of_sessions(&self) -> usize {
        self.sessions.borrow().len()
    }

    #[must_use]
    pub fn active_session(&self) -> Option<Session> {
        self.session(self.active.get()?)
    }

    /// Switch the active session. `None` leaves no session active. Returns
    /// false for unregistered ids.
    pub fn set_active_session(&self, id: Option<SessionId>) -> bool {
        if id.is_some_and(|id| !self.sessions.borrow().contains_key(&id)) {
            tracing::warn!(session = ?id, "proxy manager: cannot activate unregistered session");
            return false;
        }
        if self.active.replace(id) == id {
            return true;
        }
        tracing::debug!(session = ?id, "proxy manager: active session changed");
        self.refresh_factories();
        self.active_session_changed.emit(&id);
        true
    }

    #[must_use]
    pub fn active_session_proxy_manager(&self) -> Option<Rc<SessionProxyManager>> {
        self.active_session().map(|s| s.proxy_manager())
    }

    fn refresh_factories(&self) {
        let Some(session) = self.active_session() else {
            return;
        };
        let definitions = session.definition_manager();
        self.readers.update_available_readers(&definitions);
        self.writers.update_available_writers(&definitions);
    }

    fn active_or_log(&self) -> Option<Rc<SessionProxyManager>> {
        let pxm = self.active_session_proxy_manager();
        if pxm.is_none() {
            tracing::error!("proxy manager: No active session found.");
        }
        pxm
    }

    // =========================================================================
    // FORWARDED PROXY OPERATIONS
    // =========================================================================

    pub fn new_proxy(&self, group: &str, name: &str, sub_proxy_name: Option<&str>) -> Option<ProxyRef> {
        self.active_or_log()?.new_proxy(group, name, sub_proxy_name).ok()
    }

    pub fn register_proxy(&self, group: &str, name: &str, proxy: &ProxyRef) {
        if let Some(pxm) = self.active_or_log() {
            pxm.register_proxy(group, name, proxy);
        }
    }

    pub fn proxy(&self, group: &str, name: &str) -> Option<ProxyRef> {
        self.active_or_log()?.proxy(group, name)
    }

    pub fn unregister_proxy(&self, group: &str, name: &str, proxy: &ProxyRef) -> bool {
        self.active_or_log().is_some_and(|pxm| pxm.unregister_proxy(group, name, proxy))
    }

    pub fn proxy_name_at(&self, group: &str, index: usize) -> Option<String> {
        self.active_or_log()?.proxy_name_at(group, index)
    }

    pub fn proxy_name_of(&self, group: &str, proxy: &ProxyRef) -> Option<String> {
        self.active_or_log()?.proxy_name_of(group, proxy)
    }

    // =========================================================================
    // SHARED SERVICES
    // =========================================================================

    #[must_use]
    pub fn plugin_manager(&self) -> &PluginManager {
        &self.plugins
    }

    #[must_use]
    pub fn reader_factory(&self) -> Rc<ReaderFactory> {
        Rc::clone(&self.readers)
    }

    #[must_use]
    pub fn writer_factory(&self) -> Rc<WriterFactory> {
        Rc::clone(&self.writers)
    }

    #[must_use]
    pub fn global_properties(&self) -> Rc<GlobalPropertiesRegistry> {
        Rc::clone(&self.globals)
    }

    /// Register `manager` as `name`, replacing any previous manager.
    pub fn set_global_properties_manager(&self, name: &str, manager: &Rc<GlobalPropertiesManager>) {
        self.globals.register(name, manager);
    }

    pub fn remove_global_properties_manager(&self, name: &str) -> bool {
        self.globals.unregister(name)
    }

    #[must_use]
    pub fn global_properties_manager(&self, name: &str) -> Option<Rc<GlobalPropertiesManager>> {
        self.globals.manager(name)
    }

    #[must_use]
    pub fn global_properties_manager_name(&self, manager: &Rc<GlobalPropertiesManager>) -> Option<String> {
        self.globals.managers().into_iter().find(|(_, m)| Rc::ptr_eq(m, manager)).map(|(name, _)| name)
    }

    #[must_use]
    pub fn number_of_global_properties_managers(&self) -> usize {
        self.globals.len()
    }

    fn observe_global_manager(&self, name: &str) {
        self.forget_global_manager(name);
        let Some(manager) = self.globals.manager(name) else {
            return;
        };
        let weak_self = self.self_weak.clone();
        let weak_manager = Rc::downgrade(&manager);
        let observer = manager.link_modified.connect(move |change| {
            if let (Some(this), Some(manager)) = (weak_self.upgrade(), weak_manager.upgrade()) {
                this.record_link_change(&manager, change);
            }
        });
        self.global_observers
            .borrow_mut()
            .insert(name.to_owned(), GlobalObserver { manager: Rc::downgrade(&manager), observer });
    }

    fn forget_global_manager(&self, name: &str) {
        let Some(GlobalObserver { manager, observer }) = self.global_observers.borrow_mut().remove(name) else {
            return;
        };
        if let Some(manager) = manager.upgrade() {
            manager.link_modified.disconnect(observer);
        }
    }

    fn record_link_change(&self, manager: &Rc<GlobalPropertiesManager>, change: &GlobalPropertyLinkModified) {
        // Link history spans sessions, so it is only kept with one session.
        if self.number_of_sessions() != 1 {
            return;
        }
        let Some(builder) = self.active_session().and_then(|s| s.undo_stack_builder()) else {
            return;
        };
        builder.add(Box::new(GlobalPropertyLinkUpdate::new(
            manager,
            &change.global_name,
            &change.proxy,
            &change.property,
            change.added,
        )));
    }
}

#[cfg(test)]
#[path = "proxy_manager_test.rs"]
mod tests;
