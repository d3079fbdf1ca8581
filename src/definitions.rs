//! Catalog of XML proxy definitions.
//!
//! DESIGN
//! ======
//! Definitions are `<ProxyGroup>` children of `<ServerManagerConfiguration>`
//! documents, keyed by `(group, name)`. A definition may extend another via
//! `base_proxygroup` / `base_proxyname`; [`ProxyDefinitionManager::collapsed_proxy_definition`]
//! resolves that chain into one self-contained element and caches it. Any
//! catalog change clears the cache and fires [`DefinitionsUpdated`].

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use frames::{DefinitionEntry, StateMessage};

use crate::error::{SmError, SmResult};
use crate::events::Signal;
use crate::location::{GlobalId, Location};
use crate::session::Session;
use crate::xml::XmlElement;

/// Built-in definitions compiled into the crate.
pub const BUILTIN_DEFINITIONS: &str = include_str!("../resources/servermanager.xml");

const MAX_INHERITANCE_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionKind {
    /// Ordinary definitions changed (configuration or plugin load).
    Proxy,
    /// Custom (compound) definitions changed.
    Compound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefinitionsUpdated {
    pub kind: DefinitionKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionRegistered {
    pub group: String,
    pub name: String,
    pub custom: bool,
    /// False when the definition was removed.
    pub registered: bool,
}

#[derive(Debug, Clone)]
struct DefinitionRecord {
    element: Rc<XmlElement>,
    custom: bool,
}

type DefinitionKey = (String, String);

#[derive(Debug, Default)]
pub struct ProxyDefinitionManager {
    definitions: RefCell<BTreeMap<DefinitionKey, DefinitionRecord>>,
    collapsed: RefCell<HashMap<(String, String, Option<String>), Rc<XmlElement>>>,
    pub updated: Signal<DefinitionsUpdated>,
    pub registered: Signal<DefinitionRegistered>,
}

impl ProxyDefinitionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager preloaded with [`BUILTIN_DEFINITIONS`].
    #[must_use]
    pub fn with_builtin_definitions() -> Self {
        let manager = Self::new();
        if let Err(e) = manager.load_configuration_xml(BUILTIN_DEFINITIONS) {
            tracing::error!(error = %e, "definitions: built-in configuration is invalid");
        }
        manager
    }

    /// Merge a `<ServerManagerConfiguration>` document. Returns the number of
    /// definitions added or replaced.
    ///
    /// # Errors
    ///
    /// Fails for unparsable XML or a different root element.
    pub fn load_configuration_xml(&self, xml: &str) -> SmResult<usize> {
        let root = XmlElement::parse(xml)?;
        self.load_configuration_element(&root)
    }

    /// Same as [`ProxyDefinitionManager::load_configuration_xml`] for a parsed element.
    ///
    /// # Errors
    ///
    /// Fails when `root` is not a `<ServerManagerConfiguration>`.
    pub fn load_configuration_element(&self, root: &XmlElement) -> SmResult<usize> {
        if root.name != "ServerManagerConfiguration" {
            return Err(SmError::MalformedXml(format!("expected <ServerManagerConfiguration>, found <{}>", root.name)));
        }
        let mut added = Vec::new();
        for group in root.children_named("ProxyGroup") {
            let Some(group_name) = group.attribute("name") else {
                tracing::warn!("definitions: skipping <ProxyGroup> without a name");
                continue;
            };
            for definition in &group.children {
                let Some(name) = definition.attribute("name") else {
                    continue;
                };
                self.insert(group_name, name, definition.clone(), false);
                added.push((group_name.to_owned(), name.to_owned()));
            }
        }
        if !added.is_empty() {
            self.definitions_changed(DefinitionKind::Proxy);
            for (group, name) in &added {
                self.registered.emit(&DefinitionRegistered {
                    group: group.clone(),
                    name: name.clone(),
                    custom: false,
                    registered: true,
                });
            }
        }
        Ok(added.len())
    }

    fn insert(&self, group: &str, name: &str, element: XmlElement, custom: bool) {
        self.definitions
            .borrow_mut()
            .insert((group.to_owned(), name.to_owned()), DefinitionRecord { element: Rc::new(element), custom });
    }

    fn definitions_changed(&self, kind: DefinitionKind) {
        self.collapsed.borrow_mut().clear();
        self.updated.emit(&DefinitionsUpdated { kind });
    }

    /// Raw (uncollapsed) definition.
    #[must_use]
    pub fn proxy_definition(&self, group: &str, name: &str) -> Option<Rc<XmlElement>> {
        self.definitions.borrow().get(&(group.to_owned(), name.to_owned())).map(|r| Rc::clone(&r.element))
    }

    #[must_use]
    pub fn has_definition(&self, group: &str, name: &str) -> bool {
        self.definitions.borrow().contains_key(&(group.to_owned(), name.to_owned()))
    }

    #[must_use]
    pub fn is_custom(&self, group: &str, name: &str) -> bool {
        self.definitions.borrow().get(&(group.to_owned(), name.to_owned())).is_some_and(|r| r.custom)
    }

    /// Definition with its inheritance chain merged in, optionally narrowed
    /// to the nested `<Proxy>` of sub-proxy `sub_proxy_name`.
    pub fn collapsed_proxy_definition(
        &self,
        group: &str,
        name: &str,
        sub_proxy_name: Option<&str>,
        warn_if_not_found: bool,
    ) -> Option<Rc<XmlElement>> {
        let key = (group.to_owned(), name.to_owned(), sub_proxy_name.map(str::to_owned));
        if let Some(cached) = self.collapsed.borrow().get(&key) {
            return Some(Rc::clone(cached));
        }

        let Some(raw) = self.proxy_definition(group, name) else {
            if warn_if_not_found {
                tracing::warn!(group, name, "definitions: no proxy definition found");
            }
            return None;
        };
        let collapsed = self.collapse(&raw, 0);

        let result = match sub_proxy_name {
            None => collapsed,
            Some(sub) => {
                let nested = self.sub_proxy_definition(&collapsed, sub);
                if nested.is_none() && warn_if_not_found {
                    tracing::warn!(group, name, sub, "definitions: no such sub-proxy");
                }
                nested?
            }
        };

        let result = Rc::new(result);
        self.collapsed.borrow_mut().insert(key, Rc::clone(&result));
        Some(result)
    }

    fn collapse(&self, element: &XmlElement, depth: usize) -> XmlElement {
        let base_group = element.attribute("base_proxygroup");
        let base_name = element.attribute("base_proxyname");
        let (Some(base_group), Some(base_name)) = (base_group, base_name) else {
            return element.clone();
        };
        if depth >= MAX_INHERITANCE_DEPTH {
            tracing::error!(base_group, base_name, "definitions: inheritance chain too deep");
            return element.clone();
        }
        let Some(base) = self.proxy_definition(base_group, base_name) else {
            tracing::error!(base_group, base_name, "definitions: missing base definition");
            return element.clone();
        };
        let base = self.collapse(&base, depth + 1);
        merge_definitions(&base, element)
    }

    fn sub_proxy_definition(&self, collapsed: &XmlElement, sub: &str) -> Option<XmlElement> {
        for sub_proxy in collapsed.children_named("SubProxy") {
            for nested in &sub_proxy.children {
                if nested.attribute("name") != Some(sub) {
                    continue;
                }
                if let (Some(group), Some(name)) = (nested.attribute("proxygroup"), nested.attribute("proxyname")) {
                    let referenced = self.collapsed_proxy_definition(group, name, None, true)?;
                    return Some(merge_definitions(&referenced, nested));
                }
                return Some(self.collapse(nested, 0));
            }
        }
        None
    }

    /// Restartable snapshot of every `(group, name)` pair, sorted.
    pub fn iter(&self) -> impl Iterator<Item = (String, String)> + Clone + use<> {
        let keys: Vec<DefinitionKey> = self.definitions.borrow().keys().cloned().collect();
        keys.into_iter()
    }

    /// Restartable snapshot of the definition names in `group`, sorted.
    pub fn single_group_iter(&self, group: &str) -> impl Iterator<Item = String> + Clone + use<> {
        let names: Vec<String> =
            self.definitions.borrow().keys().filter(|(g, _)| g == group).map(|(_, n)| n.clone()).collect();
        names.into_iter()
    }

    #[must_use]
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.definitions.borrow().keys().map(|(g, _)| g.clone()).collect();
        groups.dedup();
        groups
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.borrow().is_empty()
    }

    // =========================================================================
    // CUSTOM DEFINITIONS
    // =========================================================================

    /// Add or replace a custom definition. Built-in definitions cannot be replaced.
    pub fn add_custom_proxy_definition(&self, group: &str, name: &str, element: XmlElement) -> bool {
        if self.has_definition(group, name) && !self.is_custom(group, name) {
            tracing::warn!(group, name, "definitions: refusing to shadow a built-in definition");
            return false;
        }
        self.insert(group, name, element, true);
        self.definitions_changed(DefinitionKind::Compound);
        self.registered.emit(&DefinitionRegistered {
            group: group.to_owned(),
            name: name.to_owned(),
            custom: true,
            registered: true,
        });
        true
    }

    /// Remove a custom definition. Returns false for unknown or built-in definitions.
    pub fn remove_custom_proxy_definition(&self, group: &str, name: &str) -> bool {
        if !self.is_custom(group, name) {
            return false;
        }
        self.definitions.borrow_mut().remove(&(group.to_owned(), name.to_owned()));
        self.definitions_changed(DefinitionKind::Compound);
        self.registered.emit(&DefinitionRegistered {
            group: group.to_owned(),
            name: name.to_owned(),
            custom: true,
            registered: false,
        });
        true
    }

    pub fn clear_custom_proxy_definitions(&self) {
        let removed: Vec<DefinitionKey> =
            self.definitions.borrow().iter().filter(|(_, r)| r.custom).map(|(k, _)| k.clone()).collect();
        if removed.is_empty() {
            return;
        }
        self.definitions.borrow_mut().retain(|_, r| !r.custom);
        self.definitions_changed(DefinitionKind::Compound);
        for (group, name) in removed {
            self.registered.emit(&DefinitionRegistered { group, name, custom: true, registered: false });
        }
    }

    /// Load `<CustomProxyDefinitions>` with `<CustomProxyDefinition group name>` children.
    pub fn load_custom_proxy_definitions(&self, root: &XmlElement) -> usize {
        let mut loaded = 0;
        for entry in root.children_named("CustomProxyDefinition") {
            let (Some(group), Some(name)) = (entry.attribute("group"), entry.attribute("name")) else {
                tracing::warn!("definitions: custom definition without group or name");
                continue;
            };
            let Some(definition) = entry.children.first() else {
                continue;
            };
            if self.add_custom_proxy_definition(group, name, definition.clone()) {
                loaded += 1;
            }
        }
        loaded
    }

    #[must_use]
    pub fn save_custom_proxy_definitions(&self) -> XmlElement {
        let mut root = XmlElement::new("CustomProxyDefinitions");
        for ((group, name), record) in self.definitions.borrow().iter() {
            if !record.custom {
                continue;
            }
            root.add_child(
                XmlElement::new("CustomProxyDefinition")
                    .with_attribute("group", group)
                    .with_attribute("name", name)
                    .with_child((*record.element).clone()),
            );
        }
        root
    }

    // =========================================================================
    // SERVER SYNCHRONIZATION
    // =========================================================================

    /// Pull definitions known to the server (e.g. from server-side plugins)
    /// and merge the ones missing or different here. Returns how many changed.
    ///
    /// # Errors
    ///
    /// Propagates the pull failure.
    pub fn synchronize_definitions(&self, session: &Session) -> SmResult<usize> {
        let state: StateMessage = session.pull_state(GlobalId::DEFINITION_MANAGER, Location::DATA_SERVER)?;
        let Some(remote) = state.definitions() else {
            return Ok(0);
        };

        let mut changed = Vec::new();
        for DefinitionEntry { group, name, xml, custom } in &remote.definitions {
            let element = match XmlElement::parse(xml) {
                Ok(element) => element,
                Err(e) => {
                    tracing::warn!(group, name, error = %e, "definitions: skipping malformed server definition");
                    continue;
                }
            };
            if self.proxy_definition(group, name).is_some_and(|current| *current == element) {
                continue;
            }
            self.insert(group, name, element, *custom);
            changed.push((group.clone(), name.clone(), *custom));
        }

        if !changed.is_empty() {
            tracing::info!(count = changed.len(), "definitions: synchronized from server");
            self.definitions_changed(DefinitionKind::Proxy);
            for (group, name, custom) in changed.iter().cloned() {
                self.registered.emit(&DefinitionRegistered { group, name, custom, registered: true });
            }
        }
        Ok(changed.len())
    }
}

/// Overlay `derived` on `base`: attributes and same-named children of the
/// derived element win; everything else is inherited.
fn merge_definitions(base: &XmlElement, derived: &XmlElement) -> XmlElement {
    let mut merged = base.clone();
    merged.name.clone_from(&derived.name);
    for (key, value) in &derived.attributes {
        merged.set_attribute(key, value);
    }
    merged.remove_attribute("base_proxygroup");
    merged.remove_attribute("base_proxyname");

    for child in &derived.children {
        let slot = match child.attribute("name") {
            Some(name) => merged.children.iter().position(|c| c.attribute("name") == Some(name)),
            None => merged.children.iter().position(|c| c.name == child.name && c.attribute("name").is_none()),
        };
        match slot {
            Some(index) => merged.children[index] = child.clone(),
            None => merged.children.push(child.clone()),
        }
    }
    if !derived.text.is_empty() {
        merged.text.clone_from(&derived.text);
    }
    merged
}

#[cfg(test)]
#[path = "definitions_test.rs"]
mod tests;
