//! Resolve global ids to proxies while loading state.
//!
//! Lookup order: proxies already located in this pass, live objects of the
//! attached session, then the deserializer, which may construct the proxy
//! from server state ([`SessionDeserializer`]) or from an XML document.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use frames::StateMessage;

use crate::location::{GlobalId, Location};
use crate::proxy::ProxyRef;
use crate::remote_object::RemoteObject;
use crate::session::{Session, WeakSession};

/// Builds proxies that are referenced by state but not yet alive.
pub trait Deserializer {
    /// Create the proxy `id`, register it with `locator` before loading its
    /// state (references may be cyclic), and return it.
    fn new_proxy(&self, id: GlobalId, locator: &ProxyLocator) -> Option<ProxyRef>;

    /// Raw state for `id`, when the source has one.
    fn state_for(&self, _id: GlobalId) -> Option<StateMessage> {
        None
    }
}

/// Rebuilds proxies from the state the server holds for them.
pub struct SessionDeserializer {
    session: WeakSession,
}

impl SessionDeserializer {
    #[must_use]
    pub fn new(session: &Session) -> Self {
        Self { session: session.downgrade() }
    }
}

impl Deserializer for SessionDeserializer {
    fn new_proxy(&self, id: GlobalId, locator: &ProxyLocator) -> Option<ProxyRef> {
        let session = self.session.upgrade()?;
        let state = self.state_for(id)?;
        if state.proxy_state().is_none() {
            tracing::warn!(%id, "locator: server state is not a proxy");
            return None;
        }
        let sub_proxy = Some(state.xml_sub_proxy_name.as_str()).filter(|s| !s.is_empty());
        let proxy = match session.proxy_manager().new_proxy(&state.xml_group, &state.xml_name, sub_proxy) {
            Ok(proxy) => proxy,
            Err(e) => {
                tracing::warn!(%id, error = %e, "locator: could not instantiate proxy from server state");
                return None;
            }
        };
        proxy.remote().set_global_id(id);
        locator.insert(id, Rc::clone(&proxy));
        if let Err(e) = proxy.load_state(&state, locator) {
            tracing::warn!(%id, error = %e, "locator: could not load server state");
        }
        Some(proxy)
    }

    fn state_for(&self, id: GlobalId) -> Option<StateMessage> {
        let session = self.session.upgrade()?;
        match session.pull_state(id, Location::DATA_SERVER) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::debug!(%id, error = %e, "locator: no server state");
                None
            }
        }
    }
}

#[derive(Default)]
pub struct ProxyLocator {
    session: WeakSession,
    deserializer: Option<Box<dyn Deserializer>>,
    located: RefCell<HashMap<GlobalId, ProxyRef>>,
}

impl ProxyLocator {
    /// Locator that finds live proxies of `session` and rebuilds missing ones
    /// from server state.
    #[must_use]
    pub fn for_session(session: &Session) -> Self {
        Self {
            session: session.downgrade(),
            deserializer: Some(Box::new(SessionDeserializer::new(session))),
            located: RefCell::new(HashMap::new()),
        }
    }

    /// Locator that consults `session`'s live objects, then `deserializer`.
    #[must_use]
    pub fn with_deserializer(session: &Session, deserializer: Box<dyn Deserializer>) -> Self {
        Self { session: session.downgrade(), deserializer: Some(deserializer), located: RefCell::new(HashMap::new()) }
    }

    /// Locator that never looks at live session objects; ids are only
    /// meaningful to `deserializer`.
    #[must_use]
    pub fn detached(deserializer: Box<dyn Deserializer>) -> Self {
        Self { session: WeakSession::default(), deserializer: Some(deserializer), located: RefCell::new(HashMap::new()) }
    }

    pub fn locate(&self, id: GlobalId) -> Option<ProxyRef> {
        if !id.is_set() {
            return None;
        }
        if let Some(found) = self.located.borrow().get(&id) {
            return Some(Rc::clone(found));
        }
        if let Some(proxy) = self.session.upgrade().and_then(|s| s.remote_object(id)).and_then(|o| o.as_proxy()) {
            self.insert(id, Rc::clone(&proxy));
            return Some(proxy);
        }
        let proxy = self.deserializer.as_ref()?.new_proxy(id, self)?;
        self.insert(id, Rc::clone(&proxy));
        Some(proxy)
    }

    pub fn insert(&self, id: GlobalId, proxy: ProxyRef) {
        self.located.borrow_mut().insert(id, proxy);
    }

    #[must_use]
    pub fn state_for(&self, id: GlobalId) -> Option<StateMessage> {
        self.deserializer.as_ref()?.state_for(id)
    }

    /// Everything located so far, keyed by the id it was requested under.
    #[must_use]
    pub fn located(&self) -> Vec<(GlobalId, ProxyRef)> {
        let mut located: Vec<_> = self.located.borrow().iter().map(|(id, p)| (*id, Rc::clone(p))).collect();
        located.sort_by_key(|(id, _)| *id);
        located
    }

    pub fn clear(&self) {
        self.located.borrow_mut().clear();
    }
}

#[cfg(test)]
#[path = "locator_test.rs"]
mod tests;
