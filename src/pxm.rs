//! Per-session registry of proxies, links and selection models.
//!
//! DESIGN
//! ======
//! Registrations are `(group, name) → [proxy]` tuples. Real registrations
//! (not prototypes, non-empty location, group not `*_prototypes`) are
//! mirrored in a [`RegistrationState`] which is this manager's remote state
//! under [`GlobalId::PROXY_MANAGER`]. Every change to that record triggers a
//! state update: the new record is pushed to the server (which relays it to
//! the other clients) and the before/after pair goes to the undo builder.
//!
//! Incoming registration states are applied as a diff. New tuples are
//! registered before stale ones are removed, with state updates suppressed
//! until the whole diff is applied, and then issued once.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::{Rc, Weak};

use frames::{NamedEntry, ProxyEntry, RegistrationState, StateBody, StateMessage, REGISTRATION_STATE_VERSION};
use indexmap::IndexMap;

use crate::definitions::ProxyDefinitionManager;
use crate::error::{SmError, SmResult};
use crate::events::{ObserverId, Signal};
use crate::factory::{ProxyConstructor, ProxyFactory};
use crate::global_properties::GlobalPropertiesRegistry;
use crate::guard::ScopedFlag;
use crate::link::Link;
use crate::location::{GlobalId, Location};
use crate::locator::ProxyLocator;
use crate::proxy::{ProxyBuilder, ProxyRef};
use crate::remote_object::{RemoteCore, RemoteObject};
use crate::selection::ProxySelectionModel;
use crate::session::WeakSession;
use crate::state_loader;
use crate::xml::XmlElement;

/// Suffix of the groups holding prototype proxies.
pub const PROTOTYPES_SUFFIX: &str = "_prototypes";

/// Client class advertised in this manager's state.
pub const CLIENT_CLASS: &str = "SMSessionProxyManager";

/// Groups that are never saved nor counted as real registrations.
#[must_use]
pub fn is_internal_group(group: &str) -> bool {
    group.starts_with('_') || group.ends_with(PROTOTYPES_SUFFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationKind {
    Proxy,
    CompoundProxyDefinition,
    Link,
    SelectionModel,
    GlobalPropertiesManager,
}

#[derive(Debug, Clone)]
pub struct RegistrationEvent {
    pub kind: RegistrationKind,
    pub group: String,
    pub name: String,
    pub proxy: Option<ProxyRef>,
}

#[derive(Debug, Clone)]
pub struct PropertyModified {
    pub proxy: ProxyRef,
    pub property: String,
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub group: String,
    pub name: String,
    pub proxy: ProxyRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationFilter<'a> {
    All,
    /// Skips prototype and `_`-prefixed groups.
    NonPrototypes,
    Group(&'a str),
}

struct RegisteredProxy {
    proxy: ProxyRef,
    observers: [ObserverId; 4],
}

impl RegisteredProxy {
    fn detach(&self) {
        let [modified, state, updated, information] = self.observers;
        self.proxy.property_modified.disconnect(modified);
        self.proxy.state_changed.disconnect(state);
        self.proxy.updated.disconnect(updated);
        self.proxy.information_updated.disconnect(information);
    }
}

type Registry = BTreeMap<String, BTreeMap<String, Vec<RegisteredProxy>>>;

pub struct SessionProxyManager {
    remote: RemoteCore,
    self_weak: Weak<SessionProxyManager>,
    session: WeakSession,
    definitions: Rc<ProxyDefinitionManager>,
    factory: RefCell<ProxyFactory>,
    registry: RefCell<Registry>,
    links: RefCell<IndexMap<String, Link>>,
    selection_models: RefCell<IndexMap<String, Rc<ProxySelectionModel>>>,
    modified: RefCell<Vec<ProxyRef>>,
    registration: RefCell<RegistrationState>,
    last_pushed: RefCell<Option<StateMessage>>,
    notification_enabled: Cell<bool>,
    globals: RefCell<Option<Rc<GlobalPropertiesRegistry>>>,
    pub registered: Signal<RegistrationEvent>,
    pub unregistered: Signal<RegistrationEvent>,
    pub property_modified: Signal<PropertyModified>,
    pub proxy_state_changed: Signal<ProxyRef>,
    pub proxy_updated: Signal<ProxyRef>,
    pub proxy_information_updated: Signal<ProxyRef>,
    /// Root of an XML state document after it was loaded.
    pub state_loaded: Signal<XmlElement>,
    /// Root of an XML state document after it was saved.
    pub state_saved: Signal<XmlElement>,
}

impl std::fmt::Debug for SessionProxyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionProxyManager")
            .field("session", &self.session)
            .field("groups", &self.registry.borrow().keys().collect::<Vec<_>>())
            .field("links", &self.links.borrow().len())
            .finish_non_exhaustive()
    }
}

impl SessionProxyManager {
    /// Manager for `session`, preloaded with the built-in definitions.
    pub fn new(session: WeakSession) -> Rc<Self> {
        Self::with_definitions(session, Rc::new(ProxyDefinitionManager::with_builtin_definitions()))
    }

    pub fn with_definitions(session: WeakSession, definitions: Rc<ProxyDefinitionManager>) -> Rc<Self> {
        let pxm = Rc::new_cyclic(|weak: &Weak<SessionProxyManager>| {
            let owner: Weak<dyn RemoteObject> = weak.clone();
            SessionProxyManager {
                remote: RemoteCore::new(owner, Location::DATA_SERVER),
                self_weak: weak.clone(),
                session,
                definitions,
                factory: RefCell::new(ProxyFactory::with_builtin_types()),
                registry: RefCell::new(BTreeMap::new()),
                links: RefCell::new(IndexMap::new()),
                selection_models: RefCell::new(IndexMap::new()),
                modified: RefCell::new(Vec::new()),
                registration: RefCell::new(RegistrationState::default()),
                last_pushed: RefCell::new(None),
                notification_enabled: Cell::new(true),
                globals: RefCell::new(None),
                registered: Signal::new(),
                unregistered: Signal::new(),
                property_modified: Signal::new(),
                proxy_state_changed: Signal::new(),
                proxy_updated: Signal::new(),
                proxy_information_updated: Signal::new(),
                state_loaded: Signal::new(),
                state_saved: Signal::new(),
            }
        });
        let weak = Rc::downgrade(&pxm);
        pxm.definitions.updated.connect(move |_| {
            if let Some(pxm) = weak.upgrade() {
                pxm.clear_prototypes();
            }
        });
        pxm
    }

    #[must_use]
    pub fn definitions(&self) -> Rc<ProxyDefinitionManager> {
        Rc::clone(&self.definitions)
    }

    pub(crate) fn handle(&self) -> Option<Rc<Self>> {
        self.self_weak.upgrade()
    }

    #[must_use]
    pub fn weak_session(&self) -> WeakSession {
        self.session.clone()
    }

    /// Make an additional client class instantiable.
    pub fn register_proxy_class(&self, client_class: &str, constructor: ProxyConstructor) {
        self.factory.borrow_mut().register(client_class, constructor);
    }

    pub fn set_global_properties(&self, globals: Option<Rc<GlobalPropertiesRegistry>>) {
        *self.globals.borrow_mut() = globals;
    }

    #[must_use]
    pub fn global_properties(&self) -> Option<Rc<GlobalPropertiesRegistry>> {
        self.globals.borrow().clone()
    }

    // =========================================================================
    // PROXY CREATION
    // =========================================================================

    /// Instantiate a proxy from its definition. The proxy is not registered.
    ///
    /// # Errors
    ///
    /// [`SmError::DefinitionNotFound`] or [`SmError::UnknownProxyType`].
    pub fn new_proxy(&self, group: &str, name: &str, sub_proxy_name: Option<&str>) -> SmResult<ProxyRef> {
        let factory = self.factory.borrow();
        let builder = ProxyBuilder { definitions: &self.definitions, factory: &factory, session: self.session.clone() };
        builder.build(group, name, sub_proxy_name).inspect_err(|e| {
            tracing::error!(group, name, error = %e, "pxm: could not create proxy");
        })
    }

    /// Cached prototype of `(group, name)`, created on first request.
    /// Returns `None` without logging when no such definition exists.
    pub fn prototype_proxy(&self, group: &str, name: &str) -> Option<ProxyRef> {
        let prototype_group = format!("{group}{PROTOTYPES_SUFFIX}");
        if let Some(existing) = self.proxy(&prototype_group, name) {
            return Some(existing);
        }
        if !self.definitions.has_definition(group, name) {
            return None;
        }
        let proxy = self.new_proxy(group, name, None).ok()?;
        proxy.set_prototype(true);
        self.register_proxy(&prototype_group, name, &proxy);
        Some(proxy)
    }

    /// Create a prototype for every known definition.
    pub fn instantiate_prototypes(&self) {
        for (group, name) in self.definitions.iter() {
            self.prototype_proxy(&group, &name);
        }
    }

    pub fn instantiate_group_prototypes(&self, group: &str) {
        for name in self.definitions.single_group_iter(group) {
            self.prototype_proxy(group, &name);
        }
    }

    fn clear_prototypes(&self) {
        let stale: Vec<Registration> = self
            .registrations(RegistrationFilter::All)
            .into_iter()
            .filter(|r| r.group.ends_with(PROTOTYPES_SUFFIX))
            .collect();
        if stale.is_empty() {
            return;
        }
        tracing::debug!(count = stale.len(), "pxm: definitions changed, dropping prototypes");
        for Registration { group, name, proxy } in stale {
            self.unregister_proxy(&group, &name, &proxy);
        }
    }

    // =========================================================================
    // REGISTRATION
    // =========================================================================

    /// Register `proxy` as `(group, name)`. Registering an identical tuple
    /// again does nothing.
    pub fn register_proxy(&self, group: &str, name: &str, proxy: &ProxyRef) {
        let already = self
            .registry
            .borrow()
            .get(group)
            .and_then(|names| names.get(name))
            .is_some_and(|entries| entries.iter().any(|e| Rc::ptr_eq(&e.proxy, proxy)));
        if already {
            return;
        }

        let observers = self.attach_observers(proxy);
        self.registry
            .borrow_mut()
            .entry(group.to_owned())
            .or_default()
            .entry(name.to_owned())
            .or_default()
            .push(RegisteredProxy { proxy: Rc::clone(proxy), observers });

        let real = !proxy.is_prototype() && !proxy.remote().location().is_empty() && !group.ends_with(PROTOTYPES_SUFFIX);
        if real {
            if let Err(e) = proxy.create_vtk_objects() {
                tracing::error!(group, name, error = %e, "pxm: could not create server objects");
            }
            let entry = ProxyEntry::new(group, name, proxy.global_id().get());
            {
                let mut registration = self.registration.borrow_mut();
                if !registration.proxies.contains(&entry) {
                    registration.proxies.push(entry);
                }
            }
            tracing::debug!(group, name, id = %proxy.global_id(), "pxm: registered proxy");
            self.trigger_state_update();
        }

        self.registered.emit(&RegistrationEvent {
            kind: RegistrationKind::Proxy,
            group: group.to_owned(),
            name: name.to_owned(),
            proxy: Some(Rc::clone(proxy)),
        });
    }

    fn attach_observers(&self, proxy: &ProxyRef) -> [ObserverId; 4] {
        let pxm = self.self_weak.clone();
        let target = Rc::downgrade(proxy);
        let modified = proxy.property_modified.connect(move |property| {
            if let (Some(pxm), Some(proxy)) = (pxm.upgrade(), target.upgrade()) {
                pxm.mark_modified(&proxy);
                pxm.property_modified.emit(&PropertyModified { proxy, property: property.clone() });
            }
        });

        let pxm = self.self_weak.clone();
        let target = Rc::downgrade(proxy);
        let state = proxy.state_changed.connect(move |()| {
            if let (Some(pxm), Some(proxy)) = (pxm.upgrade(), target.upgrade()) {
                pxm.proxy_state_changed.emit(&proxy);
            }
        });

        let pxm = self.self_weak.clone();
        let target = Rc::downgrade(proxy);
        let updated = proxy.updated.connect(move |()| {
            if let (Some(pxm), Some(proxy)) = (pxm.upgrade(), target.upgrade()) {
                pxm.modified.borrow_mut().retain(|p| !Rc::ptr_eq(p, &proxy));
                pxm.proxy_updated.emit(&proxy);
            }
        });

        let pxm = self.self_weak.clone();
        let target = Rc::downgrade(proxy);
        let information = proxy.information_updated.connect(move |()| {
            if let (Some(pxm), Some(proxy)) = (pxm.upgrade(), target.upgrade()) {
                pxm.proxy_information_updated.emit(&proxy);
            }
        });

        [modified, state, updated, information]
    }

    /// Values applied from another client's state leave nothing to push.
    fn mark_modified(&self, proxy: &ProxyRef) {
        if proxy.is_prototype() || !proxy.has_modified_properties() {
            return;
        }
        let mut modified = self.modified.borrow_mut();
        if !modified.iter().any(|p| Rc::ptr_eq(p, proxy)) {
            modified.push(Rc::clone(proxy));
        }
    }

    /// Remove one tuple. Returns false if it was not registered.
    pub fn unregister_proxy(&self, group: &str, name: &str, proxy: &ProxyRef) -> bool {
        let removed = {
            let mut registry = self.registry.borrow_mut();
            let Some(names) = registry.get_mut(group) else {
                return false;
            };
            let Some(entries) = names.get_mut(name) else {
                return false;
            };
            let Some(position) = entries.iter().position(|e| Rc::ptr_eq(&e.proxy, proxy)) else {
                return false;
            };
            let removed = entries.remove(position);
            if entries.is_empty() {
                names.remove(name);
            }
            if names.is_empty() {
                registry.remove(group);
            }
            removed
        };
        removed.detach();

        let still_registered = self.registrations(RegistrationFilter::All).iter().any(|r| Rc::ptr_eq(&r.proxy, proxy));
        if !still_registered {
            self.modified.borrow_mut().retain(|p| !Rc::ptr_eq(p, proxy));
        }
        if let Some(id) = proxy.remote().global_id_if_set() {
            self.registration
                .borrow_mut()
                .proxies
                .retain(|e| !(e.group == group && e.name == name && e.global_id == id.get()));
        }
        tracing::debug!(group, name, "pxm: unregistered proxy");

        self.unregistered.emit(&RegistrationEvent {
            kind: RegistrationKind::Proxy,
            group: group.to_owned(),
            name: name.to_owned(),
            proxy: Some(Rc::clone(proxy)),
        });
        self.trigger_state_update();
        true
    }

    /// Remove every tuple referencing `proxy`. Returns how many were removed.
    pub fn unregister_proxy_by_ref(&self, proxy: &ProxyRef) -> usize {
        let tuples: Vec<Registration> = self
            .registrations(RegistrationFilter::All)
            .into_iter()
            .filter(|r| Rc::ptr_eq(&r.proxy, proxy))
            .collect();
        tuples.iter().filter(|r| self.unregister_proxy(&r.group, &r.name, &r.proxy)).count()
    }

    /// Remove every proxy registered as `name`, in any group.
    pub fn unregister_proxy_by_name(&self, name: &str) -> usize {
        let tuples: Vec<Registration> =
            self.registrations(RegistrationFilter::All).into_iter().filter(|r| r.name == name).collect();
        tuples.iter().filter(|r| self.unregister_proxy(&r.group, &r.name, &r.proxy)).count()
    }

    /// Tear down every registration, link and selection model. Fires one
    /// unregister event per tuple and at most one state update, only while
    /// the session is alive.
    pub fn unregister_proxies(&self) {
        {
            let _quiet = self.suppress_state_updates();
            for Registration { group, name, proxy } in self.registrations(RegistrationFilter::All) {
                self.unregister_proxy(&group, &name, &proxy);
            }
            self.unregister_all_links();
            let names: Vec<String> = self.selection_models.borrow().keys().cloned().collect();
            for name in names {
                self.unregister_selection_model(&name);
            }
            self.modified.borrow_mut().clear();
            *self.registration.borrow_mut() = RegistrationState::default();
        }
        if self.session.upgrade().is_some_and(|s| s.is_alive()) {
            self.trigger_state_update();
        }
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    #[must_use]
    pub fn proxy(&self, group: &str, name: &str) -> Option<ProxyRef> {
        self.registry.borrow().get(group)?.get(name)?.first().map(|e| Rc::clone(&e.proxy))
    }

    /// First proxy registered as `name` in any group.
    #[must_use]
    pub fn proxy_by_name(&self, name: &str) -> Option<ProxyRef> {
        self.registry.borrow().values().find_map(|names| names.get(name)?.first().map(|e| Rc::clone(&e.proxy)))
    }

    #[must_use]
    pub fn proxies(&self, group: &str, name: &str) -> Vec<ProxyRef> {
        self.registry
            .borrow()
            .get(group)
            .and_then(|names| names.get(name))
            .map(|entries| entries.iter().map(|e| Rc::clone(&e.proxy)).collect())
            .unwrap_or_default()
    }

    /// Every name `proxy` is registered under in `group`.
    #[must_use]
    pub fn proxy_names(&self, group: &str, proxy: &ProxyRef) -> Vec<String> {
        self.registry
            .borrow()
            .get(group)
            .map(|names| {
                names
                    .iter()
                    .filter(|(_, entries)| entries.iter().any(|e| Rc::ptr_eq(&e.proxy, proxy)))
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn proxy_name_of(&self, group: &str, proxy: &ProxyRef) -> Option<String> {
        self.proxy_names(group, proxy).into_iter().next()
    }

    #[must_use]
    pub fn proxy_name_at(&self, group: &str, index: usize) -> Option<String> {
        self.registry.borrow().get(group)?.keys().nth(index).cloned()
    }

    #[must_use]
    pub fn is_proxy_in_group(&self, proxy: &ProxyRef, group: &str) -> bool {
        self.registry
            .borrow()
            .get(group)
            .is_some_and(|names| names.values().flatten().any(|e| Rc::ptr_eq(&e.proxy, proxy)))
    }

    /// Proxies registered in `group`.
    #[must_use]
    pub fn number_of_proxies(&self, group: &str) -> usize {
        self.registry.borrow().get(group).map_or(0, |names| names.values().map(Vec::len).sum())
    }

    /// Registered tuples outside prototype and internal groups.
    #[must_use]
    pub fn number_of_real_registrations(&self) -> usize {
        self.registrations(RegistrationFilter::NonPrototypes).len()
    }

    #[must_use]
    pub fn groups(&self) -> Vec<String> {
        self.registry.borrow().keys().cloned().collect()
    }

    /// Snapshot of registered tuples, ordered by group then name.
    #[must_use]
    pub fn registrations(&self, filter: RegistrationFilter<'_>) -> Vec<Registration> {
        let registry = self.registry.borrow();
        let mut out = Vec::new();
        for (group, names) in registry.iter() {
            let keep = match filter {
                RegistrationFilter::All => true,
                RegistrationFilter::NonPrototypes => !is_internal_group(group),
                RegistrationFilter::Group(wanted) => group == wanted,
            };
            if !keep {
                continue;
            }
            for (name, entries) in names {
                for entry in entries {
                    out.push(Registration { group: group.clone(), name: name.clone(), proxy: Rc::clone(&entry.proxy) });
                }
            }
        }
        out
    }

    // =========================================================================
    // MODIFICATION TRACKING
    // =========================================================================

    #[must_use]
    pub fn are_proxies_modified(&self) -> bool {
        !self.modified.borrow().is_empty()
    }

    /// Push registered proxies (only modified ones when `modified_only`).
    pub fn update_registered_proxies(&self, modified_only: bool) {
        self.update_matching(None, modified_only);
    }

    pub fn update_registered_proxies_in_group(&self, group: &str, modified_only: bool) {
        self.update_matching(Some(group), modified_only);
    }

    fn update_matching(&self, group: Option<&str>, modified_only: bool) {
        let filter = group.map_or(RegistrationFilter::NonPrototypes, RegistrationFilter::Group);
        let mut seen: Vec<ProxyRef> = Vec::new();
        for Registration { proxy, .. } in self.registrations(filter) {
            if proxy.is_prototype() || seen.iter().any(|p| Rc::ptr_eq(p, &proxy)) {
                continue;
            }
            seen.push(Rc::clone(&proxy));
            if modified_only && !self.modified.borrow().iter().any(|p| Rc::ptr_eq(p, &proxy)) {
                continue;
            }
            if let Err(e) = proxy.update_vtk_objects() {
                tracing::error!(group = proxy.xml_group(), name = proxy.xml_name(), error = %e, "pxm: update failed");
            }
            self.modified.borrow_mut().retain(|p| !Rc::ptr_eq(p, &proxy));
        }
    }

    // =========================================================================
    // LINKS AND SELECTION MODELS
    // =========================================================================

    /// Register `link` as `name`, replacing (with a warning) any previous link.
    pub fn register_link(&self, name: &str, link: Link) {
        if self.links.borrow().contains_key(name) {
            tracing::warn!(name, "pxm: replacing existing link");
            self.unregister_link(name);
        }
        if let Some(session) = self.session.upgrade() {
            link.remote().set_session(&session);
            if let Err(e) = link.push_full_state() {
                tracing::error!(name, error = %e, "pxm: could not push link state");
            }
        }
        let id = link.remote().global_id();
        self.links.borrow_mut().insert(name.to_owned(), link);
        if id.is_set() {
            self.registration.borrow_mut().links.push(NamedEntry::new(name, id.get()));
        }
        self.trigger_state_update();
        self.registered.emit(&RegistrationEvent {
            kind: RegistrationKind::Link,
            group: String::new(),
            name: name.to_owned(),
            proxy: None,
        });
    }

    pub fn unregister_link(&self, name: &str) -> bool {
        let Some(link) = self.links.borrow_mut().shift_remove(name) else {
            return false;
        };
        link.disconnect();
        self.registration.borrow_mut().links.retain(|e| e.name != name);
        self.unregistered.emit(&RegistrationEvent {
            kind: RegistrationKind::Link,
            group: String::new(),
            name: name.to_owned(),
            proxy: None,
        });
        self.trigger_state_update();
        true
    }

    pub fn unregister_all_links(&self) {
        let names: Vec<String> = self.links.borrow().keys().cloned().collect();
        for name in names {
            self.unregister_link(&name);
        }
    }

    #[must_use]
    pub fn registered_link(&self, name: &str) -> Option<Link> {
        self.links.borrow().get(name).cloned()
    }

    #[must_use]
    pub fn link_name(&self, index: usize) -> Option<String> {
        self.links.borrow().get_index(index).map(|(name, _)| name.clone())
    }

    #[must_use]
    pub fn number_of_links(&self) -> usize {
        self.links.borrow().len()
    }

    /// Registered links in registration order.
    #[must_use]
    pub fn links(&self) -> Vec<(String, Link)> {
        self.links.borrow().iter().map(|(name, link)| (name.clone(), link.clone())).collect()
    }

    pub fn register_selection_model(&self, name: &str, model: &Rc<ProxySelectionModel>) {
        if self.selection_models.borrow().contains_key(name) {
            tracing::warn!(name, "pxm: replacing existing selection model");
            self.unregister_selection_model(name);
        }
        if let Some(session) = self.session.upgrade() {
            model.remote().set_session(&session);
            if let Err(e) = model.push_full_state() {
                tracing::error!(name, error = %e, "pxm: could not push selection state");
            }
        }
        let id = model.remote().global_id();
        self.selection_models.borrow_mut().insert(name.to_owned(), Rc::clone(model));
        if id.is_set() {
            self.registration.borrow_mut().selection_models.push(NamedEntry::new(name, id.get()));
        }
        self.trigger_state_update();
        self.registered.emit(&RegistrationEvent {
            kind: RegistrationKind::SelectionModel,
            group: String::new(),
            name: name.to_owned(),
            proxy: None,
        });
    }

    pub fn unregister_selection_model(&self, name: &str) -> bool {
        if self.selection_models.borrow_mut().shift_remove(name).is_none() {
            return false;
        }
        self.registration.borrow_mut().selection_models.retain(|e| e.name != name);
        self.unregistered.emit(&RegistrationEvent {
            kind: RegistrationKind::SelectionModel,
            group: String::new(),
            name: name.to_owned(),
            proxy: None,
        });
        self.trigger_state_update();
        true
    }

    #[must_use]
    pub fn selection_model(&self, name: &str) -> Option<Rc<ProxySelectionModel>> {
        self.selection_models.borrow().get(name).cloned()
    }

    #[must_use]
    pub fn selection_model_at(&self, index: usize) -> Option<(String, Rc<ProxySelectionModel>)> {
        self.selection_models.borrow().get_index(index).map(|(name, model)| (name.clone(), Rc::clone(model)))
    }

    #[must_use]
    pub fn number_of_selection_models(&self) -> usize {
        self.selection_models.borrow().len()
    }

    // =========================================================================
    // CUSTOM DEFINITIONS
    // =========================================================================

    pub fn register_custom_proxy_definition(&self, group: &str, name: &str, definition: XmlElement) -> bool {
        if !self.definitions.add_custom_proxy_definition(group, name, definition) {
            return false;
        }
        self.registered.emit(&RegistrationEvent {
            kind: RegistrationKind::CompoundProxyDefinition,
            group: group.to_owned(),
            name: name.to_owned(),
            proxy: None,
        });
        true
    }

    pub fn unregister_custom_proxy_definition(&self, group: &str, name: &str) -> bool {
        if !self.definitions.remove_custom_proxy_definition(group, name) {
            return false;
        }
        self.unregistered.emit(&RegistrationEvent {
            kind: RegistrationKind::CompoundProxyDefinition,
            group: group.to_owned(),
            name: name.to_owned(),
            proxy: None,
        });
        true
    }

    pub fn unregister_custom_proxy_definitions(&self) {
        self.definitions.clear_custom_proxy_definitions();
    }

    pub fn load_custom_proxy_definitions(&self, root: &XmlElement) -> usize {
        self.definitions.load_custom_proxy_definitions(root)
    }

    #[must_use]
    pub fn save_custom_proxy_definitions(&self) -> XmlElement {
        self.definitions.save_custom_proxy_definitions()
    }

    #[must_use]
    pub fn proxy_definition(&self, group: &str, name: &str) -> Option<Rc<XmlElement>> {
        self.definitions.proxy_definition(group, name)
    }

    #[must_use]
    pub fn has_definition(&self, group: &str, name: &str) -> bool {
        self.definitions.has_definition(group, name)
    }

    // =========================================================================
    // STATE UPDATES
    // =========================================================================

    pub fn enable_state_update_notification(&self) {
        self.notification_enabled.set(true);
    }

    pub fn disable_state_update_notification(&self) {
        self.notification_enabled.set(false);
    }

    #[must_use]
    pub fn is_state_update_notification_enabled(&self) -> bool {
        self.notification_enabled.get()
    }

    /// Suppress state updates until the guard is dropped.
    pub fn suppress_state_updates(&self) -> ScopedFlag<'_> {
        ScopedFlag::set(&self.notification_enabled, false)
    }

    /// Push the registration record if it changed since the last push and
    /// hand the transition to the undo builder.
    pub fn trigger_state_update(&self) {
        if !self.notification_enabled.get() {
            return;
        }
        let after = self.full_state_message();
        let before = self.last_pushed.replace(Some(after.clone())).unwrap_or_else(|| self.empty_state_message());
        if before == after {
            return;
        }
        if let Err(e) = self.remote.push_state(after.clone()) {
            tracing::error!(error = %e, "pxm: could not push registration state");
        }
        if let Some(session) = self.session.upgrade() {
            session.update_state_history(GlobalId::PROXY_MANAGER, &before, &after);
        }
    }

    fn empty_state_message(&self) -> StateMessage {
        let registration = RegistrationState { version: REGISTRATION_STATE_VERSION, ..RegistrationState::default() };
        self.header().with_body(StateBody::Registration(registration))
    }

    fn header(&self) -> StateMessage {
        StateMessage {
            global_id: GlobalId::PROXY_MANAGER.get(),
            location: Location::DATA_SERVER.bits(),
            client_class: CLIENT_CLASS.to_owned(),
            ..StateMessage::default()
        }
    }

    fn full_state_message(&self) -> StateMessage {
        let mut registration = self.registration.borrow().clone();
        registration.version = REGISTRATION_STATE_VERSION;
        self.header().with_body(StateBody::Registration(registration))
    }

    /// Mirror the registrations the server holds (e.g. made by other
    /// clients) without pushing anything back.
    pub fn update_from_remote(&self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let state = match session.pull_state(GlobalId::PROXY_MANAGER, Location::DATA_SERVER) {
            Ok(state) => state,
            Err(e) => {
                tracing::debug!(error = %e, "pxm: no registration state on server yet");
                return;
            }
        };
        {
            let _local = self.remote.local_push_only();
            let _quiet = self.suppress_state_updates();
            let locator = ProxyLocator::for_session(&session);
            if let Err(e) = self.apply_registration_state(&state, &locator) {
                tracing::warn!(error = %e, "pxm: could not apply server registration state");
            }
        }
        *self.last_pushed.borrow_mut() = Some(self.full_state_message());
    }

    fn apply_registration_state(&self, message: &StateMessage, locator: &ProxyLocator) -> SmResult<()> {
        let Some(target) = message.registration() else {
            return Err(SmError::UnexpectedReply(format!("state {} is not a registration state", message.global_id)));
        };
        let _quiet = self.suppress_state_updates();

        let current: BTreeSet<ProxyEntry> = self.registration.borrow().proxies.iter().cloned().collect();
        let wanted: BTreeSet<ProxyEntry> = target.proxies.iter().cloned().collect();

        for entry in wanted.difference(&current) {
            match locator.locate(GlobalId::new(entry.global_id)) {
                Some(proxy) => self.register_proxy(&entry.group, &entry.name, &proxy),
                None => tracing::warn!(group = %entry.group, name = %entry.name, id = entry.global_id, "pxm: cannot locate proxy"),
            }
        }
        for entry in current.difference(&wanted) {
            let proxy = self
                .proxies(&entry.group, &entry.name)
                .into_iter()
                .find(|p| p.remote().global_id_if_set() == Some(GlobalId::new(entry.global_id)));
            if let Some(proxy) = proxy {
                self.unregister_proxy(&entry.group, &entry.name, &proxy);
            }
        }

        self.apply_links(&target.links, locator);
        self.apply_selection_models(&target.selection_models, locator);
        Ok(())
    }

    fn apply_links(&self, wanted: &[NamedEntry], locator: &ProxyLocator) {
        let current: Vec<NamedEntry> = self.registration.borrow().links.clone();
        for entry in wanted.iter().filter(|e| !current.contains(e)) {
            let id = GlobalId::new(entry.global_id);
            let Some(session) = self.session.upgrade() else {
                return;
            };
            let link = match session.remote_object(id).and_then(|o| o.as_link()) {
                Some(link) => link,
                None => {
                    let Some(state) = locator.state_for(id) else {
                        tracing::warn!(name = %entry.name, %id, "pxm: no state for link");
                        continue;
                    };
                    let link = Link::from_client_class(&state.client_class, &session);
                    link.remote().set_global_id(id);
                    if let Err(e) = link.load_state(&state, locator) {
                        tracing::warn!(name = %entry.name, error = %e, "pxm: could not load link state");
                    }
                    link
                }
            };
            self.links.borrow_mut().insert(entry.name.clone(), link);
            self.registration.borrow_mut().links.push(entry.clone());
            self.registered.emit(&RegistrationEvent {
                kind: RegistrationKind::Link,
                group: String::new(),
                name: entry.name.clone(),
                proxy: None,
            });
        }
        for entry in current.iter().filter(|e| !wanted.contains(e)) {
            self.unregister_link(&entry.name);
        }
    }

    fn apply_selection_models(&self, wanted: &[NamedEntry], locator: &ProxyLocator) {
        let current: Vec<NamedEntry> = self.registration.borrow().selection_models.clone();
        for entry in wanted.iter().filter(|e| !current.contains(e)) {
            let id = GlobalId::new(entry.global_id);
            let Some(session) = self.session.upgrade() else {
                return;
            };
            let model = match session.remote_object(id).and_then(|o| o.as_selection_model()) {
                Some(model) => model,
                None => {
                    let model = ProxySelectionModel::new();
                    model.remote().set_session(&session);
                    model.remote().set_global_id(id);
                    if let Some(state) = locator.state_for(id) {
                        if let Err(e) = model.load_state(&state, locator) {
                            tracing::warn!(name = %entry.name, error = %e, "pxm: could not load selection state");
                        }
                    }
                    model
                }
            };
            self.selection_models.borrow_mut().insert(entry.name.clone(), model);
            self.registration.borrow_mut().selection_models.push(entry.clone());
            self.registered.emit(&RegistrationEvent {
                kind: RegistrationKind::SelectionModel,
                group: String::new(),
                name: entry.name.clone(),
                proxy: None,
            });
        }
        for entry in current.iter().filter(|e| !wanted.contains(e)) {
            self.unregister_selection_model(&entry.name);
        }
    }

    // =========================================================================
    // XML STATE
    // =========================================================================

    /// Save every real registration, custom definitions, links and global
    /// properties managers.
    #[must_use]
    pub fn save_xml_state(&self) -> XmlElement {
        let root = state_loader::save_state(self, self.global_properties().as_deref());
        self.state_saved.emit(&root);
        root
    }

    /// Load an XML state document. Ids in the document are remapped to
    /// fresh ones unless `keep_original_ids` is set.
    ///
    /// # Errors
    ///
    /// Fails for documents of an unsupported version or malformed structure.
    pub fn load_xml_state(
        &self,
        root: &XmlElement,
        locator: Option<&ProxyLocator>,
        keep_original_ids: bool,
    ) -> SmResult<()> {
        let mut document = root.clone();
        state_loader::load_state(self, &mut document, locator, keep_original_ids, self.global_properties().as_deref())?;
        self.state_loaded.emit(&document);
        Ok(())
    }
}

impl RemoteObject for SessionProxyManager {
    fn remote(&self) -> &RemoteCore {
        &self.remote
    }

    fn full_state(&self) -> Option<StateMessage> {
        Some(self.full_state_message())
    }

    fn load_state(&self, message: &StateMessage, locator: &ProxyLocator) -> SmResult<()> {
        {
            let _quiet = self.suppress_state_updates();
            self.apply_registration_state(message, locator)?;
        }
        self.trigger_state_update();
        Ok(())
    }
}

#[cfg(test)]
#[path = "pxm_test.rs"]
mod tests;
