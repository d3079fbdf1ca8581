//! Saving and loading XML state documents.
//!
//! Layout:
//!
//! ```text
//! <ServerManagerApplication version>
//!   <ServerManagerState version>
//!     <Proxy group type id servers>…</Proxy>
//!     <ProxyCollection name><Item id name/></ProxyCollection>
//!     <CustomProxyDefinitions>…</CustomProxyDefinitions>
//!     <Links>…</Links>
//!     <GlobalPropertiesManagers>…</GlobalPropertiesManagers>
//!   </ServerManagerState>
//! </ServerManagerApplication>
//! ```
//!
//! Ids in a document only identify elements within it. Loading builds
//! proxies on demand through an [`XmlDeserializer`], so references resolve
//! in any order.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use crate::error::{SmError, SmResult};
use crate::global_properties::{GlobalPropertiesManager, GlobalPropertiesRegistry};
use crate::link::{Link, LinkKind};
use crate::location::GlobalId;
use crate::locator::{Deserializer, ProxyLocator};
use crate::proxy::ProxyRef;
use crate::pxm::{RegistrationFilter, SessionProxyManager};
use crate::remote_object::RemoteObject;
use crate::version::{CURRENT_STATE_VERSION, StateVersionController, state_element};
use crate::xml::XmlElement;

/// Serialize the registrations of `pxm` (and the global properties managers,
/// when given) into a state document.
#[must_use]
pub fn save_state(pxm: &SessionProxyManager, globals: Option<&GlobalPropertiesRegistry>) -> XmlElement {
    let mut state = XmlElement::new("ServerManagerState").with_attribute("version", CURRENT_STATE_VERSION);

    let registrations = pxm.registrations(RegistrationFilter::NonPrototypes);
    let mut proxies: BTreeMap<GlobalId, ProxyRef> = BTreeMap::new();
    for registration in &registrations {
        collect_with_references(&registration.proxy, &mut proxies);
    }
    for proxy in proxies.values() {
        state.add_child(proxy.save_xml_state());
    }

    let mut collections: BTreeMap<&str, XmlElement> = BTreeMap::new();
    for registration in &registrations {
        collections
            .entry(registration.group.as_str())
            .or_insert_with(|| XmlElement::new("ProxyCollection").with_attribute("name", &registration.group))
            .add_child(
                XmlElement::new("Item")
                    .with_attribute("id", registration.proxy.global_id())
                    .with_attribute("name", &registration.name),
            );
    }
    for collection in collections.into_values() {
        state.add_child(collection);
    }

    let custom = pxm.save_custom_proxy_definitions();
    if !custom.children.is_empty() {
        state.add_child(custom);
    }

    let links = pxm.links();
    if !links.is_empty() {
        let mut element = XmlElement::new("Links");
        for (name, link) in &links {
            element.add_child(link.save_xml(name));
        }
        state.add_child(element);
    }

    if let Some(globals) = globals.filter(|g| !g.is_empty()) {
        let mut element = XmlElement::new("GlobalPropertiesManagers");
        for (name, manager) in globals.managers() {
            element.add_child(manager.save_xml(&name));
        }
        state.add_child(element);
    }

    tracing::debug!(proxies = proxies.len(), "state: saved xml state");
    XmlElement::new("ServerManagerApplication").with_attribute("version", CURRENT_STATE_VERSION).with_child(state)
}

fn collect_with_references(proxy: &ProxyRef, into: &mut BTreeMap<GlobalId, ProxyRef>) {
    let id = proxy.global_id();
    if into.insert(id, Rc::clone(proxy)).is_some() {
        return;
    }
    for name in proxy.property_names() {
        let Some(property) = proxy.property(&name) else {
            continue;
        };
        for referenced in property.proxies() {
            collect_with_references(&referenced, into);
        }
    }
}

/// Builds proxies from the `<Proxy>` elements of a state document.
pub struct XmlDeserializer {
    pxm: Rc<SessionProxyManager>,
    elements: HashMap<u32, XmlElement>,
    keep_original_ids: bool,
}

impl XmlDeserializer {
    #[must_use]
    pub fn new(pxm: Rc<SessionProxyManager>, state: &XmlElement, keep_original_ids: bool) -> Self {
        let elements = state
            .children_named("Proxy")
            .filter_map(|element| Some((element.attribute_as::<u32>("id")?, element.clone())))
            .collect();
        Self { pxm, elements, keep_original_ids }
    }

    /// Adopt the document's id when it is free in the session.
    fn adopt_id(&self, proxy: &ProxyRef, id: GlobalId) {
        let Some(session) = proxy.session() else {
            return;
        };
        if id.get() <= GlobalId::RESERVED_MAX {
            tracing::warn!(%id, "state: id from document is reserved, assigning a new one");
            return;
        }
        if session.remote_object(id).is_some() {
            tracing::warn!(%id, "state: id from document already in use, assigning a new one");
            return;
        }
        if let Err(e) = session.claim_global_id(id) {
            tracing::warn!(%id, error = %e, "state: could not claim id, assigning a new one");
            return;
        }
        proxy.remote().set_global_id(id);
    }

    fn adopt_sub_proxy_ids(&self, proxy: &ProxyRef, element: &XmlElement) {
        for child in element.children_named("SubProxy") {
            let (Some(name), Some(id)) = (child.attribute("name"), child.attribute_as::<u32>("id")) else {
                continue;
            };
            if let Some(sub) = proxy.sub_proxy(name) {
                self.adopt_id(&sub, GlobalId::new(id));
                self.adopt_sub_proxy_ids(&sub, child);
            }
        }
    }
}

impl Deserializer for XmlDeserializer {
    fn new_proxy(&self, id: GlobalId, locator: &ProxyLocator) -> Option<ProxyRef> {
        let Some(element) = self.elements.get(&id.get()) else {
            tracing::warn!(%id, "state: no proxy element with this id");
            return None;
        };
        let (Some(group), Some(name)) = (element.attribute("group"), element.attribute("type")) else {
            tracing::warn!(%id, "state: proxy element without group or type");
            return None;
        };
        let proxy = self.pxm.new_proxy(group, name, None).ok()?;
        if self.keep_original_ids {
            self.adopt_id(&proxy, id);
            self.adopt_sub_proxy_ids(&proxy, element);
        }
        locator.insert(id, Rc::clone(&proxy));
        proxy.load_xml_state(element, locator);
        Some(proxy)
    }
}

/// Load a state document into `pxm`.
///
/// `root` is upgraded in place. Without a caller-supplied locator, proxies
/// are built from the document itself.
///
/// # Errors
///
/// Fails for unsupported versions and documents without a
/// `<ServerManagerState>`.
pub fn load_state(
    pxm: &SessionProxyManager,
    root: &mut XmlElement,
    locator: Option<&ProxyLocator>,
    keep_original_ids: bool,
    globals: Option<&GlobalPropertiesRegistry>,
) -> SmResult<()> {
    let from = StateVersionController::upgrade(root)?;
    let state = state_element(root)
        .ok_or_else(|| SmError::MalformedXml(format!("<{}> holds no <ServerManagerState>", root.name)))?;

    if let Some(custom) = state.child("CustomProxyDefinitions") {
        pxm.load_custom_proxy_definitions(custom);
    }

    let handle = pxm.handle().ok_or(SmError::NoSession)?;
    let own_locator;
    let locator = match locator {
        Some(locator) => locator,
        None => {
            own_locator = ProxyLocator::detached(Box::new(XmlDeserializer::new(handle, state, keep_original_ids)));
            &own_locator
        }
    };

    {
        let _quiet = pxm.suppress_state_updates();
        let mut registered = 0;
        for collection in state.children_named("ProxyCollection") {
            let Some(group) = collection.attribute("name") else {
                continue;
            };
            for item in collection.children_named("Item") {
                let (Some(id), Some(name)) = (item.attribute_as::<u32>("id"), item.attribute("name")) else {
                    continue;
                };
                match locator.locate(GlobalId::new(id)) {
                    Some(proxy) => {
                        pxm.register_proxy(group, name, &proxy);
                        registered += 1;
                    }
                    None => tracing::warn!(group, name, id, "state: could not create proxy"),
                }
            }
        }

        if let Some(links) = state.child("Links") {
            for element in &links.children {
                let (Some(kind), Some(name)) = (LinkKind::from_xml_tag(&element.name), element.attribute("name")) else {
                    continue;
                };
                let link = Link::new(kind);
                link.load_xml(element, locator);
                pxm.register_link(name, link);
            }
        }

        if let (Some(globals), Some(managers)) = (globals, state.child("GlobalPropertiesManagers")) {
            for element in managers.children_named("GlobalPropertiesManager") {
                let Some(name) = element.attribute("name") else {
                    continue;
                };
                let manager = globals.manager(name).unwrap_or_else(|| {
                    let manager = GlobalPropertiesManager::new();
                    globals.register(name, &manager);
                    manager
                });
                manager.load_xml(element, locator);
            }
        }
        tracing::info!(%from, registered, "state: loaded xml state");
    }
    pxm.trigger_state_update();
    Ok(())
}

#[cfg(test)]
#[path = "state_loader_test.rs"]
mod tests;
