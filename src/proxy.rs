//! Client-side handle on a server object, described by an XML definition.
//!
//! DESIGN
//! ======
//! A proxy owns its properties and its sub-proxies. Property edits mark the
//! property modified and fire [`Proxy::property_modified`]; nothing goes to
//! the server until [`Proxy::update_vtk_objects`], which pushes only the
//! modified properties (or the full state the first time). Each push hands
//! the before/after full state to the session so undo can record it.
//!
//! Exposed properties are aliases for sub-proxy properties. Setting one
//! routes to the sub-proxy, which pushes under its own id.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use frames::{ProxyState, StateBody, StateMessage, SubProxyEntry};
use indexmap::IndexMap;

use crate::definitions::ProxyDefinitionManager;
use crate::error::{SmError, SmResult};
use crate::events::Signal;
use crate::factory::{ProxyFactory, ProxyKind};
use crate::location::{GlobalId, Location};
use crate::locator::ProxyLocator;
use crate::property::{Elements, Property, ProxyInput};
use crate::remote_object::{RemoteCore, RemoteObject};
use crate::session::{Session, WeakSession};
use crate::xml::XmlElement;

pub type ProxyRef = Rc<Proxy>;

/// What a proxy needs from its proxy manager to be built.
pub(crate) struct ProxyBuilder<'a> {
    pub definitions: &'a ProxyDefinitionManager,
    pub factory: &'a ProxyFactory,
    pub session: WeakSession,
}

impl ProxyBuilder<'_> {
    /// Instantiate `(group, name)`, or its sub-proxy `sub_proxy_name`.
    pub fn build(&self, group: &str, name: &str, sub_proxy_name: Option<&str>) -> SmResult<ProxyRef> {
        let definition = self
            .definitions
            .collapsed_proxy_definition(group, name, sub_proxy_name, true)
            .ok_or_else(|| SmError::DefinitionNotFound { group: group.to_owned(), name: name.to_owned() })?;
        self.build_from(definition, group, name, sub_proxy_name)
    }

    fn build_from(
        &self,
        definition: Rc<XmlElement>,
        group: &str,
        name: &str,
        sub_proxy_name: Option<&str>,
    ) -> SmResult<ProxyRef> {
        let kind = self.factory.kind_for(&definition)?;

        let mut sub_proxies = IndexMap::new();
        let mut exposed = IndexMap::new();
        if sub_proxy_name.is_none() {
            for block in definition.children_named("SubProxy") {
                for nested in block.children.iter().filter(|c| c.name != "ExposedProperties") {
                    let Some(sub_name) = nested.attribute("name") else {
                        continue;
                    };
                    let sub = self.build(group, name, Some(sub_name))?;
                    if let Some(list) = block.child("ExposedProperties") {
                        for property in list.children_named("Property") {
                            let Some(inner) = property.attribute("name") else {
                                continue;
                            };
                            let alias = property.attribute("exposed_name").unwrap_or(inner);
                            exposed.insert(alias.to_owned(), (sub_name.to_owned(), inner.to_owned()));
                        }
                    }
                    sub_proxies.insert(sub_name.to_owned(), sub);
                }
            }
        }

        let properties: IndexMap<String, Property> = definition
            .children
            .iter()
            .filter_map(Property::from_xml)
            .map(|p| (p.name().to_owned(), p))
            .collect();

        let proxy = Rc::new_cyclic(|weak: &Weak<Proxy>| {
            let owner: Weak<dyn RemoteObject> = weak.clone();
            Proxy {
                remote: RemoteCore::new(owner, Location::from_processes_attribute(definition.attribute("processes"))),
                self_weak: weak.clone(),
                xml_group: group.to_owned(),
                xml_name: name.to_owned(),
                sub_proxy_name: sub_proxy_name.map(str::to_owned),
                label: definition.attribute("label").map(str::to_owned),
                class_name: definition.attribute("class").unwrap_or_default().to_owned(),
                client_class: ProxyFactory::client_class_for(&definition),
                kind,
                properties,
                exposed,
                sub_proxies,
                parent: RefCell::new(Weak::new()),
                objects_created: Cell::new(false),
                last_state: RefCell::new(None),
                definition: Rc::clone(&definition),
                property_modified: Signal::new(),
                state_changed: Signal::new(),
                updated: Signal::new(),
                information_updated: Signal::new(),
                domain_modified: Signal::new(),
            }
        });
        for sub in proxy.sub_proxies.values() {
            *sub.parent.borrow_mut() = Rc::downgrade(&proxy);
        }
        if let Some(session) = self.session.upgrade() {
            proxy.set_session(&session);
        }
        Ok(proxy)
    }
}

pub struct Proxy {
    remote: RemoteCore,
    self_weak: Weak<Proxy>,
    xml_group: String,
    xml_name: String,
    sub_proxy_name: Option<String>,
    label: Option<String>,
    class_name: String,
    client_class: String,
    kind: ProxyKind,
    definition: Rc<XmlElement>,
    properties: IndexMap<String, Property>,
    /// Alias → (sub-proxy, property).
    exposed: IndexMap<String, (String, String)>,
    sub_proxies: IndexMap<String, ProxyRef>,
    parent: RefCell<Weak<Proxy>>,
    objects_created: Cell<bool>,
    last_state: RefCell<Option<StateMessage>>,
    /// Property name, after its value changed locally or from a state load.
    pub property_modified: Signal<String>,
    pub state_changed: Signal<()>,
    /// Fired after modified properties were pushed.
    pub updated: Signal<()>,
    pub information_updated: Signal<()>,
    /// Property whose domain changed.
    pub domain_modified: Signal<String>,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("group", &self.xml_group)
            .field("name", &self.xml_name)
            .field("sub_proxy", &self.sub_proxy_name)
            .field("global_id", &self.remote.global_id_if_set())
            .finish_non_exhaustive()
    }
}

impl Proxy {
    #[must_use]
    pub fn xml_group(&self) -> &str {
        &self.xml_group
    }

    #[must_use]
    pub fn xml_name(&self) -> &str {
        &self.xml_name
    }

    #[must_use]
    pub fn sub_proxy_name(&self) -> Option<&str> {
        self.sub_proxy_name.as_deref()
    }

    #[must_use]
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.xml_name)
    }

    /// Server-side class instantiated for this proxy.
    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    #[must_use]
    pub fn client_class(&self) -> &str {
        &self.client_class
    }

    #[must_use]
    pub fn kind(&self) -> &ProxyKind {
        &self.kind
    }

    #[must_use]
    pub fn definition(&self) -> &XmlElement {
        &self.definition
    }

    /// `<Hints>` of the definition, if any.
    #[must_use]
    pub fn hints(&self) -> Option<&XmlElement> {
        self.definition.child("Hints")
    }

    #[must_use]
    pub fn global_id(&self) -> GlobalId {
        self.remote.global_id()
    }

    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.remote.session()
    }

    #[must_use]
    pub fn objects_created(&self) -> bool {
        self.objects_created.get()
    }

    #[must_use]
    pub fn parent(&self) -> Option<ProxyRef> {
        self.parent.borrow().upgrade()
    }

    /// Strong handle to this proxy. Only `None` while it is being dropped.
    #[must_use]
    pub fn handle(&self) -> Option<ProxyRef> {
        self.self_weak.upgrade()
    }

    /// Attach this proxy and its sub-proxies to `session`.
    pub fn set_session(&self, session: &Session) {
        self.remote.set_session(session);
        for sub in self.sub_proxies.values() {
            sub.set_session(session);
        }
    }

    /// Mark as a prototype (never pushed), recursively.
    pub fn set_prototype(&self, prototype: bool) {
        self.remote.set_prototype(prototype);
        for sub in self.sub_proxies.values() {
            sub.set_prototype(prototype);
        }
    }

    #[must_use]
    pub fn is_prototype(&self) -> bool {
        self.remote.is_prototype()
    }

    /// Data class produced on output `port`, for pipeline sources.
    #[must_use]
    pub fn output_data_type(&self, port: u32) -> Option<String> {
        match &self.kind {
            ProxyKind::Source { output_types } => output_types.get(port as usize).cloned(),
            _ => None,
        }
    }

    #[must_use]
    pub fn number_of_output_ports(&self) -> usize {
        match &self.kind {
            ProxyKind::Source { output_types } => output_types.len(),
            _ => 0,
        }
    }

    // =========================================================================
    // PROPERTIES
    // =========================================================================

    /// Own or exposed property.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Property> {
        if let Some(property) = self.properties.get(name) {
            return Some(property);
        }
        let (sub, inner) = self.exposed.get(name)?;
        self.sub_proxies.get(sub)?.property(inner)
    }

    /// Own property names in definition order, followed by exposed names.
    #[must_use]
    pub fn property_names(&self) -> Vec<String> {
        self.properties.keys().chain(self.exposed.keys()).cloned().collect()
    }

    #[must_use]
    pub fn sub_proxy(&self, name: &str) -> Option<ProxyRef> {
        self.sub_proxies.get(name).cloned()
    }

    #[must_use]
    pub fn sub_proxy_names(&self) -> Vec<String> {
        self.sub_proxies.keys().cloned().collect()
    }

    /// Replace a property value. Returns true if it changed.
    pub fn set_elements(&self, name: &str, elements: Elements) -> bool {
        if let Some(property) = self.properties.get(name) {
            if !property.set_elements(elements) {
                return false;
            }
            self.property_changed(name);
            return true;
        }
        if let Some((sub, inner)) = self.exposed.get(name) {
            let changed = self.sub_proxies.get(sub).is_some_and(|proxy| proxy.set_elements(inner, elements));
            if changed {
                self.property_modified.emit(&name.to_owned());
            }
            return changed;
        }
        tracing::warn!(group = %self.xml_group, name = %self.xml_name, property = name, "proxy: no such property");
        false
    }

    pub fn set_int(&self, name: &str, index: usize, value: i64) -> bool {
        match self.property(name).and_then(|p| p.with_int(index, value)) {
            Some(elements) => self.set_elements(name, elements),
            None => self.type_mismatch(name),
        }
    }

    pub fn set_ints(&self, name: &str, values: &[i64]) -> bool {
        self.set_elements(name, Elements::Int(values.to_vec()))
    }

    pub fn set_double(&self, name: &str, index: usize, value: f64) -> bool {
        match self.property(name).and_then(|p| p.with_double(index, value)) {
            Some(elements) => self.set_elements(name, elements),
            None => self.type_mismatch(name),
        }
    }

    pub fn set_doubles(&self, name: &str, values: &[f64]) -> bool {
        self.set_elements(name, Elements::Double(values.to_vec()))
    }

    pub fn set_text(&self, name: &str, index: usize, value: &str) -> bool {
        match self.property(name).and_then(|p| p.with_text(index, value)) {
            Some(elements) => self.set_elements(name, elements),
            None => self.type_mismatch(name),
        }
    }

    /// Set a proxy or input property to a single referenced proxy.
    pub fn set_proxy_input(&self, name: &str, proxy: &ProxyRef, port: u32) -> bool {
        self.set_elements(name, Elements::Proxy(vec![ProxyInput::new(Rc::clone(proxy), port)]))
    }

    /// Append to a repeatable proxy property.
    pub fn add_proxy(&self, name: &str, proxy: &ProxyRef) -> bool {
        let Some(property) = self.property(name) else {
            return self.type_mismatch(name);
        };
        let mut inputs = property.inputs();
        inputs.push(ProxyInput::new(Rc::clone(proxy), 0));
        self.set_elements(name, Elements::Proxy(inputs))
    }

    pub fn remove_proxy(&self, name: &str, proxy: &ProxyRef) -> bool {
        let Some(property) = self.property(name) else {
            return false;
        };
        let mut inputs = property.inputs();
        inputs.retain(|input| !Rc::ptr_eq(&input.proxy, proxy));
        self.set_elements(name, Elements::Proxy(inputs))
    }

    pub fn reset_property_to_default(&self, name: &str) -> bool {
        match self.property(name) {
            Some(property) => self.set_elements(name, property.default_elements().clone()),
            None => false,
        }
    }

    #[must_use]
    pub fn int_element(&self, name: &str, index: usize) -> Option<i64> {
        self.property(name)?.int(index)
    }

    #[must_use]
    pub fn double_element(&self, name: &str, index: usize) -> Option<f64> {
        self.property(name)?.double(index)
    }

    #[must_use]
    pub fn text_element(&self, name: &str, index: usize) -> Option<String> {
        self.property(name)?.text(index)
    }

    /// Whether any own or sub-proxy property awaits a push.
    #[must_use]
    pub fn has_modified_properties(&self) -> bool {
        self.properties.values().any(|p| p.is_modified() && !p.is_information_only())
            || self.sub_proxies.values().any(|s| s.has_modified_properties())
    }

    fn type_mismatch(&self, name: &str) -> bool {
        tracing::warn!(
            group = %self.xml_group,
            name = %self.xml_name,
            property = name,
            "proxy: property missing or of another type"
        );
        false
    }

    fn property_changed(&self, name: &str) {
        self.property_modified.emit(&name.to_owned());
        self.update_dependent_domains(name);
    }

    /// Refresh domains that list `changed` among their required properties.
    fn update_dependent_domains(&self, changed: &str) {
        let lookup = |name: &str| self.properties.get(name).map(Property::elements);
        for property in self.properties.values() {
            for domain in property.domains() {
                if !domain.required_properties().iter().any(|r| r.name == changed) {
                    continue;
                }
                if domain.update(&lookup) {
                    self.domain_modified.emit(&property.name().to_owned());
                }
            }
        }
    }

    // =========================================================================
    // SERVER OBJECTS
    // =========================================================================

    /// Push the full state so the server creates its objects. Referenced
    /// proxies and sub-proxies are created first.
    ///
    /// # Errors
    ///
    /// Propagates push failures.
    pub fn create_vtk_objects(&self) -> SmResult<()> {
        if self.objects_created.get() || self.remote.is_prototype() {
            return Ok(());
        }
        self.objects_created.set(true);

        for sub in self.sub_proxies.values() {
            sub.create_vtk_objects()?;
        }
        self.create_referenced_proxies()?;

        let state = self.full_state_message();
        if let Err(e) = self.remote.push_state(state.clone()) {
            self.objects_created.set(false);
            return Err(e);
        }
        for property in self.properties.values() {
            property.set_modified(false);
        }
        tracing::debug!(group = %self.xml_group, name = %self.xml_name, id = %self.global_id(), "proxy: objects created");
        *self.last_state.borrow_mut() = Some(state);
        Ok(())
    }

    fn create_referenced_proxies(&self) -> SmResult<()> {
        for property in self.properties.values() {
            for proxy in property.proxies() {
                proxy.create_vtk_objects()?;
            }
        }
        Ok(())
    }

    /// Push modified properties (all of them on first call).
    ///
    /// # Errors
    ///
    /// Propagates push failures.
    pub fn update_vtk_objects(&self) -> SmResult<()> {
        if self.remote.is_prototype() {
            return Ok(());
        }
        if !self.objects_created.get() {
            self.create_vtk_objects()?;
            self.updated.emit(&());
            return Ok(());
        }
        for sub in self.sub_proxies.values() {
            sub.update_vtk_objects()?;
        }

        let modified: Vec<&Property> =
            self.properties.values().filter(|p| p.is_modified() && !p.is_information_only()).collect();
        if modified.is_empty() {
            return Ok(());
        }
        self.create_referenced_proxies()?;

        let mut partial = self.header();
        partial.body = Some(StateBody::Proxy(ProxyState {
            properties: modified.iter().map(|p| p.to_state()).collect(),
            sub_proxies: Vec::new(),
        }));
        self.remote.push_state(partial)?;
        for property in modified {
            property.set_modified(false);
        }

        self.record_state_change();
        self.updated.emit(&());
        Ok(())
    }

    /// Push the complete state regardless of modification flags.
    ///
    /// # Errors
    ///
    /// Propagates push failures.
    pub fn push_full_state(&self) -> SmResult<()> {
        let state = self.full_state_message();
        self.remote.push_state(state.clone())?;
        self.objects_created.set(true);
        *self.last_state.borrow_mut() = Some(state);
        Ok(())
    }

    fn record_state_change(&self) {
        let after = self.full_state_message();
        let before = self.last_state.replace(Some(after.clone()));
        if let (Some(before), Some(session)) = (before, self.session()) {
            session.update_state_history(self.global_id(), &before, &after);
        }
    }

    /// Pull information-only properties from the server.
    pub fn update_information(&self) {
        if self.remote.is_prototype() {
            return;
        }
        if let Err(e) = self.create_vtk_objects() {
            tracing::error!(error = %e, "proxy: could not create objects before pulling information");
            return;
        }
        let mut message = StateMessage::default();
        if !self.remote.pull_state(&mut message) {
            return;
        }
        let Some(session) = self.session() else {
            return;
        };
        let locator = ProxyLocator::for_session(&session);
        let mut changed = Vec::new();
        if let Some(state) = message.proxy_state() {
            for property_state in &state.properties {
                let Some(property) = self.properties.get(&property_state.name) else {
                    continue;
                };
                if property.is_information_only() && property.load_state(property_state, &locator) {
                    changed.push(property.name().to_owned());
                }
            }
        }
        for sub in self.sub_proxies.values() {
            sub.update_information();
        }
        for name in &changed {
            self.update_dependent_domains(name);
        }
        self.information_updated.emit(&());
    }

    fn header(&self) -> StateMessage {
        StateMessage {
            global_id: self.global_id().get(),
            location: self.remote.location().bits(),
            client_class: self.client_class.clone(),
            server_class: self.class_name.clone(),
            xml_group: self.xml_group.clone(),
            xml_name: self.xml_name.clone(),
            xml_sub_proxy_name: self.sub_proxy_name.clone().unwrap_or_default(),
            body: None,
        }
    }

    fn full_state_message(&self) -> StateMessage {
        let properties =
            self.properties.values().filter(|p| !p.is_information_only()).map(Property::to_state).collect();
        let sub_proxies = self
            .sub_proxies
            .iter()
            .map(|(name, sub)| SubProxyEntry { name: name.clone(), global_id: sub.global_id().get() })
            .collect();
        self.header().with_body(StateBody::Proxy(ProxyState { properties, sub_proxies }))
    }

    // =========================================================================
    // XML STATE
    // =========================================================================

    /// `<Proxy group type id servers>` with property and nested sub-proxy state.
    #[must_use]
    pub fn save_xml_state(&self) -> XmlElement {
        let id = self.global_id();
        let mut element = XmlElement::new("Proxy")
            .with_attribute("group", &self.xml_group)
            .with_attribute("type", &self.xml_name)
            .with_attribute("id", id)
            .with_attribute("servers", self.remote.location().bits());
        self.append_xml_body(&mut element, id);
        element
    }

    fn append_xml_body(&self, element: &mut XmlElement, id: GlobalId) {
        for property in self.properties.values().filter(|p| !p.is_information_only()) {
            element.add_child(property.save_xml(id));
        }
        for (name, sub) in &self.sub_proxies {
            let sub_id = sub.global_id();
            let mut child = XmlElement::new("SubProxy")
                .with_attribute("name", name)
                .with_attribute("id", sub_id)
                .with_attribute("servers", sub.remote.location().bits());
            sub.append_xml_body(&mut child, sub_id);
            element.add_child(child);
        }
    }

    /// Restore properties and sub-proxies from [`Proxy::save_xml_state`] output.
    /// Restored properties stay modified so the next update pushes them.
    pub fn load_xml_state(&self, element: &XmlElement, locator: &ProxyLocator) {
        if let Some(servers) = element.attribute_as::<u32>("servers") {
            if servers != 0 && !self.remote.is_prototype() {
                self.remote.set_location(Location::from_bits_truncate(servers));
            }
        }
        for child in element.children_named("Property") {
            let Some(name) = child.attribute("name") else {
                continue;
            };
            let Some(property) = self.properties.get(name) else {
                tracing::debug!(property = name, "proxy: ignoring unknown property in xml state");
                continue;
            };
            if property.load_xml(child, locator) {
                self.property_changed(name);
            }
        }
        for child in element.children_named("SubProxy") {
            if let Some(sub) = child.attribute("name").and_then(|name| self.sub_proxies.get(name)) {
                sub.load_xml_state(child, locator);
            }
        }
        self.state_changed.emit(&());
    }

    /// Copy property values from another proxy of the same definition.
    pub fn copy_from(&self, other: &Proxy) {
        for (name, property) in &self.properties {
            if property.is_information_only() {
                continue;
            }
            if let Some(source) = other.properties.get(name) {
                self.set_elements(name, source.elements());
            }
        }
        for (name, sub) in &self.sub_proxies {
            if let Some(source) = other.sub_proxies.get(name) {
                sub.copy_from(source);
            }
        }
    }
}

impl RemoteObject for Proxy {
    fn remote(&self) -> &RemoteCore {
        &self.remote
    }

    fn full_state(&self) -> Option<StateMessage> {
        Some(self.full_state_message())
    }

    fn load_state(&self, message: &StateMessage, locator: &ProxyLocator) -> SmResult<()> {
        let Some(state) = message.proxy_state() else {
            return Err(SmError::UnexpectedReply(format!("state {} is not a proxy state", message.global_id)));
        };
        if message.location != 0 && !self.remote.is_prototype() {
            self.remote.set_location(Location::from_bits_truncate(message.location));
        }
        for entry in &state.sub_proxies {
            let Some(sub) = self.sub_proxies.get(&entry.name) else {
                continue;
            };
            let id = GlobalId::new(entry.global_id);
            if !id.is_set() || sub.remote.global_id_if_set() == Some(id) {
                continue;
            }
            sub.remote.set_global_id(id);
            if let Some(sub_state) = locator.state_for(id) {
                sub.load_state(&sub_state, locator)?;
            }
        }

        let mut changed = Vec::new();
        for property_state in &state.properties {
            match self.properties.get(&property_state.name) {
                Some(property) => {
                    if property.load_state(property_state, locator) {
                        changed.push(property.name().to_owned());
                    }
                }
                None => tracing::debug!(property = %property_state.name, "proxy: ignoring unknown property in state"),
            }
        }
        self.objects_created.set(true);
        *self.last_state.borrow_mut() = Some(self.full_state_message());
        for name in &changed {
            self.property_changed(name);
        }
        self.state_changed.emit(&());
        Ok(())
    }

    fn as_proxy(self: Rc<Self>) -> Option<ProxyRef> {
        Some(self)
    }
}

#[cfg(test)]
#[path = "proxy_test.rs"]
mod tests;
