//! Named application-wide property values linked to proxy properties.
//!
//! Setting a global value copies it into every linked proxy property. The
//! registry of managers lives on the global proxy manager and is saved with
//! XML state.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::events::Signal;
use crate::location::GlobalId;
use crate::locator::ProxyLocator;
use crate::property::Elements;
use crate::proxy::{Proxy, ProxyRef};
use crate::xml::XmlElement;

/// Colors every application palette defines.
const DEFAULT_PALETTE: &[(&str, [f64; 3])] = &[
    ("ForegroundColor", [1.0, 1.0, 1.0]),
    ("BackgroundColor", [0.32, 0.34, 0.43]),
    ("SurfaceColor", [1.0, 1.0, 1.0]),
    ("EdgeColor", [0.0, 0.0, 0.5]),
    ("TextAnnotationColor", [1.0, 1.0, 1.0]),
    ("SelectionColor", [1.0, 0.0, 1.0]),
];

#[derive(Debug, Clone)]
pub struct GlobalPropertyLinkModified {
    pub global_name: String,
    pub proxy: ProxyRef,
    pub property: String,
    pub added: bool,
}

struct GlobalLink {
    global_name: String,
    proxy: Weak<Proxy>,
    property: String,
}

pub struct GlobalPropertiesManager {
    values: RefCell<IndexMap<String, Elements>>,
    links: RefCell<Vec<GlobalLink>>,
    pub link_modified: Signal<GlobalPropertyLinkModified>,
    pub value_changed: Signal<String>,
}

impl fmt::Debug for GlobalPropertiesManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalPropertiesManager")
            .field("values", &self.values.borrow().keys().collect::<Vec<_>>())
            .field("links", &self.links.borrow().len())
            .finish_non_exhaustive()
    }
}

impl GlobalPropertiesManager {
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            values: RefCell::new(IndexMap::new()),
            links: RefCell::new(Vec::new()),
            link_modified: Signal::new(),
            value_changed: Signal::new(),
        })
    }

    /// Manager preloaded with the default color palette.
    #[must_use]
    pub fn with_default_palette() -> Rc<Self> {
        let manager = Self::new();
        for (name, rgb) in DEFAULT_PALETTE {
            manager.define_global_property(name, Elements::Double(rgb.to_vec()));
        }
        manager
    }

    /// Add a global value without touching links.
    pub fn define_global_property(&self, name: &str, value: Elements) {
        self.values.borrow_mut().insert(name.to_owned(), value);
    }

    #[must_use]
    pub fn global_property(&self, name: &str) -> Option<Elements> {
        self.values.borrow().get(name).cloned()
    }

    #[must_use]
    pub fn global_property_names(&self) -> Vec<String> {
        self.values.borrow().keys().cloned().collect()
    }

    /// Change a global value and copy it into every linked property.
    /// Returns false for unknown names.
    pub fn set_global_property(&self, name: &str, value: Elements) -> bool {
        {
            let mut values = self.values.borrow_mut();
            let Some(slot) = values.get_mut(name) else {
                tracing::warn!(name, "global: no such global property");
                return false;
            };
            if *slot == value {
                return true;
            }
            *slot = value.clone();
        }
        for (proxy, property) in self.global_property_links(name) {
            proxy.set_elements(&property, value.clone());
        }
        self.value_changed.emit(&name.to_owned());
        true
    }

    /// Link `property` of `proxy` to a global value; the value is applied
    /// immediately. Returns false if the link exists or the name is unknown.
    pub fn set_global_property_link(&self, global_name: &str, proxy: &ProxyRef, property: &str) -> bool {
        let Some(value) = self.global_property(global_name) else {
            tracing::warn!(global_name, "global: cannot link unknown global property");
            return false;
        };
        if self.find_link(global_name, proxy, property).is_some() {
            return false;
        }
        // A property follows one global value at a time.
        if let Some(previous) = self.global_property_name_for(proxy, property) {
            self.remove_global_property_link(&previous, proxy, property);
        }
        self.links.borrow_mut().push(GlobalLink {
            global_name: global_name.to_owned(),
            proxy: Rc::downgrade(proxy),
            property: property.to_owned(),
        });
        proxy.set_elements(property, value);
        self.link_modified.emit(&GlobalPropertyLinkModified {
            global_name: global_name.to_owned(),
            proxy: Rc::clone(proxy),
            property: property.to_owned(),
            added: true,
        });
        true
    }

    pub fn remove_global_property_link(&self, global_name: &str, proxy: &ProxyRef, property: &str) -> bool {
        let Some(index) = self.find_link(global_name, proxy, property) else {
            return false;
        };
        self.links.borrow_mut().remove(index);
        self.link_modified.emit(&GlobalPropertyLinkModified {
            global_name: global_name.to_owned(),
            proxy: Rc::clone(proxy),
            property: property.to_owned(),
            added: false,
        });
        true
    }

    fn find_link(&self, global_name: &str, proxy: &ProxyRef, property: &str) -> Option<usize> {
        self.links.borrow().iter().position(|link| {
            link.global_name == global_name
                && link.property == property
                && link.proxy.upgrade().is_some_and(|p| Rc::ptr_eq(&p, proxy))
        })
    }

    /// Live `(proxy, property)` pairs following `global_name`.
    #[must_use]
    pub fn global_property_links(&self, global_name: &str) -> Vec<(ProxyRef, String)> {
        self.links
            .borrow()
            .iter()
            .filter(|link| link.global_name == global_name)
            .filter_map(|link| Some((link.proxy.upgrade()?, link.property.clone())))
            .collect()
    }

    #[must_use]
    pub fn global_property_name_for(&self, proxy: &ProxyRef, property: &str) -> Option<String> {
        self.links
            .borrow()
            .iter()
            .find(|link| link.property == property && link.proxy.upgrade().is_some_and(|p| Rc::ptr_eq(&p, proxy)))
            .map(|link| link.global_name.clone())
    }

    /// `<GlobalPropertiesManager name>` with values and links.
    #[must_use]
    pub fn save_xml(&self, name: &str) -> XmlElement {
        let mut element = XmlElement::new("GlobalPropertiesManager").with_attribute("name", name);
        for (global_name, value) in self.values.borrow().iter() {
            let kind = match value {
                Elements::Int(_) => "int",
                Elements::Double(_) => "double",
                Elements::Text(_) => "string",
                Elements::Proxy(_) => continue,
            };
            let mut child = XmlElement::new("GlobalProperty").with_attribute("name", global_name).with_attribute("type", kind);
            for index in 0..value.len() {
                if let Some(text) = value.element_string(index) {
                    child.add_child(XmlElement::new("Element").with_attribute("index", index).with_attribute("value", text));
                }
            }
            element.add_child(child);
        }
        for link in self.links.borrow().iter() {
            let Some(proxy) = link.proxy.upgrade() else {
                continue;
            };
            element.add_child(
                XmlElement::new("Link")
                    .with_attribute("global_name", &link.global_name)
                    .with_attribute("proxy", proxy.global_id())
                    .with_attribute("property", &link.property),
            );
        }
        element
    }

    /// Restore values and links from [`GlobalPropertiesManager::save_xml`] output.
    pub fn load_xml(&self, element: &XmlElement, locator: &ProxyLocator) {
        for child in element.children_named("GlobalProperty") {
            let Some(name) = child.attribute("name") else {
                continue;
            };
            let texts: Vec<&str> = child.children_named("Element").filter_map(|e| e.attribute("value")).collect();
            let value = match child.attribute("type") {
                Some("int") => Elements::Int(texts.iter().filter_map(|t| t.parse().ok()).collect()),
                Some("string") => Elements::Text(texts.iter().map(|t| (*t).to_owned()).collect()),
                _ => Elements::Double(texts.iter().filter_map(|t| t.parse().ok()).collect()),
            };
            if self.values.borrow().contains_key(name) {
                self.set_global_property(name, value);
            } else {
                self.define_global_property(name, value);
            }
        }
        for child in element.children_named("Link") {
            let (Some(global_name), Some(id), Some(property)) =
                (child.attribute("global_name"), child.attribute_as::<u32>("proxy"), child.attribute("property"))
            else {
                continue;
            };
            match locator.locate(GlobalId::new(id)) {
                Some(proxy) => {
                    self.set_global_property_link(global_name, &proxy, property);
                }
                None => tracing::warn!(global_name, id, "global: linked proxy not found"),
            }
        }
    }
}

/// Named global properties managers, saved with XML state.
#[derive(Default)]
pub struct GlobalPropertiesRegistry {
    managers: RefCell<IndexMap<String, Rc<GlobalPropertiesManager>>>,
    pub registered: Signal<String>,
    pub unregistered: Signal<String>,
}

impl fmt::Debug for GlobalPropertiesRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalPropertiesRegistry").field("managers", &self.names()).finish_non_exhaustive()
    }
}

impl GlobalPropertiesRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `manager` as `name`, replacing any previous one.
    pub fn register(&self, name: &str, manager: &Rc<GlobalPropertiesManager>) {
        let replaced = self.managers.borrow_mut().insert(name.to_owned(), Rc::clone(manager));
        if replaced.is_some() {
            tracing::warn!(name, "global: replaced global properties manager");
        }
        self.registered.emit(&name.to_owned());
    }

    pub fn unregister(&self, name: &str) -> bool {
        if self.managers.borrow_mut().shift_remove(name).is_none() {
            return false;
        }
        self.unregistered.emit(&name.to_owned());
        true
    }

    #[must_use]
    pub fn manager(&self, name: &str) -> Option<Rc<GlobalPropertiesManager>> {
        self.managers.borrow().get(name).cloned()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.managers.borrow().keys().cloned().collect()
    }

    #[must_use]
    pub fn managers(&self) -> Vec<(String, Rc<GlobalPropertiesManager>)> {
        self.managers.borrow().iter().map(|(name, m)| (name.clone(), Rc::clone(m))).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.managers.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.managers.borrow().is_empty()
    }
}

#[cfg(test)]
#[path = "global_properties_test.rs"]
mod tests;
