//! Typed property values attached to proxies.
//!
//! A property holds its checked value (what gets pushed), an optional
//! unchecked value (tentative, consulted by domains), and the default parsed
//! from the definition. Mutation goes through the owning proxy so that
//! modification events fire; the setters here only report whether anything
//! changed.

use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::rc::Rc;

use frames::PropertyState;

use crate::domain::Domain;
use crate::location::GlobalId;
use crate::locator::ProxyLocator;
use crate::proxy::ProxyRef;
use crate::remote_object::RemoteObject;
use crate::xml::XmlElement;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Int,
    Double,
    String,
    Proxy,
    /// Proxy plus output port.
    Input,
}

impl PropertyKind {
    /// Kind for a definition element tag, e.g. `IntVectorProperty`.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "IntVectorProperty" | "IdTypeVectorProperty" => Some(Self::Int),
            "DoubleVectorProperty" => Some(Self::Double),
            "StringVectorProperty" => Some(Self::String),
            "ProxyProperty" => Some(Self::Proxy),
            "InputProperty" => Some(Self::Input),
            _ => None,
        }
    }

    #[must_use]
    pub fn empty_elements(self) -> Elements {
        match self {
            Self::Int => Elements::Int(Vec::new()),
            Self::Double => Elements::Double(Vec::new()),
            Self::String => Elements::Text(Vec::new()),
            Self::Proxy | Self::Input => Elements::Proxy(Vec::new()),
        }
    }
}

/// A proxy referenced by a proxy or input property.
#[derive(Clone)]
pub struct ProxyInput {
    pub proxy: ProxyRef,
    pub port: u32,
}

impl ProxyInput {
    #[must_use]
    pub fn new(proxy: ProxyRef, port: u32) -> Self {
        Self { proxy, port }
    }
}

impl PartialEq for ProxyInput {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.proxy, &other.proxy) && self.port == other.port
    }
}

impl fmt::Debug for ProxyInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.proxy.xml_group(), self.proxy.xml_name(), self.port)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Elements {
    Int(Vec<i64>),
    Double(Vec<f64>),
    Text(Vec<String>),
    Proxy(Vec<ProxyInput>),
}

impl Elements {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Int(v) => v.len(),
            Self::Double(v) => v.len(),
            Self::Text(v) => v.len(),
            Self::Proxy(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn same_kind(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Element `index` formatted the way XML state stores it.
    #[must_use]
    pub fn element_string(&self, index: usize) -> Option<String> {
        match self {
            Self::Int(v) => v.get(index).map(ToString::to_string),
            Self::Double(v) => v.get(index).map(ToString::to_string),
            Self::Text(v) => v.get(index).cloned(),
            Self::Proxy(v) => v.get(index).map(|input| input.proxy.remote().global_id().to_string()),
        }
    }
}

pub struct Property {
    name: String,
    kind: PropertyKind,
    command: Option<String>,
    declared_elements: Option<usize>,
    repeatable: bool,
    information_only: bool,
    values: RefCell<Elements>,
    unchecked: RefCell<Option<Elements>>,
    defaults: Elements,
    modified: Cell<bool>,
    domains: Vec<Domain>,
    hints: Option<XmlElement>,
    documentation: Option<String>,
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("values", &*self.values.borrow())
            .field("modified", &self.modified.get())
            .finish_non_exhaustive()
    }
}

impl Property {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            command: None,
            declared_elements: None,
            repeatable: false,
            information_only: false,
            values: RefCell::new(kind.empty_elements()),
            unchecked: RefCell::new(None),
            defaults: kind.empty_elements(),
            modified: Cell::new(false),
            domains: Vec::new(),
            hints: None,
            documentation: None,
        }
    }

    /// Build from a definition element. Returns `None` for non-property tags.
    #[must_use]
    pub fn from_xml(element: &XmlElement) -> Option<Self> {
        let kind = PropertyKind::from_tag(&element.name)?;
        let name = element.attribute("name")?;
        let declared_elements = element.attribute_as::<usize>("number_of_elements");
        let defaults = parse_defaults(kind, element.attribute("default_values"), declared_elements);

        Some(Self {
            name: name.to_owned(),
            kind,
            command: element.attribute("command").map(str::to_owned),
            declared_elements,
            repeatable: element.attribute_flag("repeat_command") || element.attribute_flag("repeatable"),
            information_only: element.attribute_flag("information_only"),
            values: RefCell::new(defaults.clone()),
            unchecked: RefCell::new(None),
            defaults,
            modified: Cell::new(false),
            domains: element.children.iter().filter_map(Domain::from_xml).collect(),
            hints: element.child("Hints").cloned(),
            documentation: element.child("Documentation").map(|d| d.text.trim().to_owned()),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> PropertyKind {
        self.kind
    }

    #[must_use]
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    #[must_use]
    pub fn is_information_only(&self) -> bool {
        self.information_only
    }

    #[must_use]
    pub fn is_repeatable(&self) -> bool {
        self.repeatable
    }

    #[must_use]
    pub fn declared_number_of_elements(&self) -> Option<usize> {
        self.declared_elements
    }

    #[must_use]
    pub fn number_of_elements(&self) -> usize {
        self.values.borrow().len()
    }

    #[must_use]
    pub fn documentation(&self) -> Option<&str> {
        self.documentation.as_deref()
    }

    #[must_use]
    pub fn hints(&self) -> Option<&XmlElement> {
        self.hints.as_ref()
    }

    #[must_use]
    pub fn domains(&self) -> &[Domain] {
        &self.domains
    }

    #[must_use]
    pub fn domain(&self, name: &str) -> Option<&Domain> {
        self.domains.iter().find(|d| d.name() == name)
    }

    // =========================================================================
    // VALUES
    // =========================================================================

    #[must_use]
    pub fn elements(&self) -> Elements {
        self.values.borrow().clone()
    }

    #[must_use]
    pub fn elements_ref(&self) -> Ref<'_, Elements> {
        self.values.borrow()
    }

    #[must_use]
    pub fn default_elements(&self) -> &Elements {
        &self.defaults
    }

    /// Replace the checked value. Returns true if it changed.
    pub(crate) fn set_elements(&self, elements: Elements) -> bool {
        if !self.values.borrow().same_kind(&elements) {
            tracing::warn!(property = %self.name, "property: element kind mismatch");
            return false;
        }
        self.unchecked.borrow_mut().take();
        if *self.values.borrow() == elements {
            return false;
        }
        *self.values.borrow_mut() = elements;
        self.modified.set(true);
        true
    }

    pub(crate) fn reset_to_default(&self) -> bool {
        self.set_elements(self.defaults.clone())
    }

    /// Tentative value used by domain checks; falls back to the checked value.
    #[must_use]
    pub fn unchecked_elements(&self) -> Elements {
        match &*self.unchecked.borrow() {
            Some(unchecked) => unchecked.clone(),
            None => self.elements(),
        }
    }

    pub fn set_unchecked_elements(&self, elements: Elements) {
        if !self.values.borrow().same_kind(&elements) {
            tracing::warn!(property = %self.name, "property: unchecked element kind mismatch");
            return;
        }
        *self.unchecked.borrow_mut() = Some(elements);
    }

    pub fn clear_unchecked_elements(&self) {
        self.unchecked.borrow_mut().take();
    }

    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.modified.get()
    }

    pub(crate) fn set_modified(&self, modified: bool) {
        self.modified.set(modified);
    }

    #[must_use]
    pub fn int(&self, index: usize) -> Option<i64> {
        match &*self.values.borrow() {
            Elements::Int(v) => v.get(index).copied(),
            _ => None,
        }
    }

    #[must_use]
    pub fn ints(&self) -> Vec<i64> {
        match &*self.values.borrow() {
            Elements::Int(v) => v.clone(),
            _ => Vec::new(),
        }
    }

    #[must_use]
    pub fn double(&self, index: usize) -> Option<f64> {
        match &*self.values.borrow() {
            Elements::Double(v) => v.get(index).copied(),
            _ => None,
        }
    }

    #[must_use]
    pub fn doubles(&self) -> Vec<f64> {
        match &*self.values.borrow() {
            Elements::Double(v) => v.clone(),
            _ => Vec::new(),
        }
    }

    #[must_use]
    pub fn text(&self, index: usize) -> Option<String> {
        match &*self.values.borrow() {
            Elements::Text(v) => v.get(index).cloned(),
            _ => None,
        }
    }

    #[must_use]
    pub fn texts(&self) -> Vec<String> {
        match &*self.values.borrow() {
            Elements::Text(v) => v.clone(),
            _ => Vec::new(),
        }
    }

    #[must_use]
    pub fn inputs(&self) -> Vec<ProxyInput> {
        match &*self.values.borrow() {
            Elements::Proxy(v) => v.clone(),
            _ => Vec::new(),
        }
    }

    #[must_use]
    pub fn proxies(&self) -> Vec<ProxyRef> {
        self.inputs().into_iter().map(|input| input.proxy).collect()
    }

    /// Elements with position `index` replaced, growing the vector if needed.
    pub(crate) fn with_int(&self, index: usize, value: i64) -> Option<Elements> {
        let mut values = match &*self.values.borrow() {
            Elements::Int(v) => v.clone(),
            _ => return None,
        };
        set_at(&mut values, index, value);
        Some(Elements::Int(values))
    }

    pub(crate) fn with_double(&self, index: usize, value: f64) -> Option<Elements> {
        let mut values = match &*self.values.borrow() {
            Elements::Double(v) => v.clone(),
            _ => return None,
        };
        set_at(&mut values, index, value);
        Some(Elements::Double(values))
    }

    pub(crate) fn with_text(&self, index: usize, value: &str) -> Option<Elements> {
        let mut values = match &*self.values.borrow() {
            Elements::Text(v) => v.clone(),
            _ => return None,
        };
        set_at(&mut values, index, value.to_owned());
        Some(Elements::Text(values))
    }

    /// Whether every domain accepts the unchecked value.
    #[must_use]
    pub fn is_in_domain(&self) -> bool {
        self.domains.iter().all(|d| d.is_in_domain(self))
    }

    // =========================================================================
    // STATE
    // =========================================================================

    /// Protobuf form. Referenced proxies get their ids assigned here.
    #[must_use]
    pub fn to_state(&self) -> PropertyState {
        let mut state = PropertyState { name: self.name.clone(), ..PropertyState::default() };
        match &*self.values.borrow() {
            Elements::Int(v) => state.integers.clone_from(v),
            Elements::Double(v) => state.doubles.clone_from(v),
            Elements::Text(v) => state.texts.clone_from(v),
            Elements::Proxy(v) => {
                for input in v {
                    state.proxies.push(input.proxy.remote().global_id().get());
                    state.ports.push(input.port);
                }
            }
        }
        state
    }

    /// Apply a protobuf value. Returns true if the value changed. The
    /// property is left unmodified since the value came from elsewhere.
    pub(crate) fn load_state(&self, state: &PropertyState, locator: &ProxyLocator) -> bool {
        let elements = match self.kind {
            PropertyKind::Int => Elements::Int(state.integers.clone()),
            PropertyKind::Double => Elements::Double(state.doubles.clone()),
            PropertyKind::String => Elements::Text(state.texts.clone()),
            PropertyKind::Proxy | PropertyKind::Input => {
                let mut inputs = Vec::with_capacity(state.proxies.len());
                for (index, id) in state.proxies.iter().enumerate() {
                    let Some(proxy) = locator.locate(GlobalId::new(*id)) else {
                        tracing::warn!(property = %self.name, id, "property: referenced proxy not found");
                        continue;
                    };
                    inputs.push(ProxyInput::new(proxy, state.ports.get(index).copied().unwrap_or(0)));
                }
                Elements::Proxy(inputs)
            }
        };
        let changed = self.set_elements(elements);
        self.modified.set(false);
        changed
    }

    /// `<Property name id number_of_elements>` with `<Element>` or `<Proxy>` children.
    #[must_use]
    pub fn save_xml(&self, owner: GlobalId) -> XmlElement {
        let values = self.values.borrow();
        let mut element = XmlElement::new("Property")
            .with_attribute("name", &self.name)
            .with_attribute("id", format!("{owner}.{}", self.name))
            .with_attribute("number_of_elements", values.len());
        match &*values {
            Elements::Proxy(inputs) => {
                for input in inputs {
                    let mut child =
                        XmlElement::new("Proxy").with_attribute("value", input.proxy.remote().global_id());
                    if self.kind == PropertyKind::Input {
                        child.set_attribute("output_port", input.port);
                    }
                    element.add_child(child);
                }
            }
            other => {
                for index in 0..other.len() {
                    let value = other.element_string(index).unwrap_or_default();
                    element.add_child(XmlElement::new("Element").with_attribute("index", index).with_attribute("value", value));
                }
            }
        }
        element
    }

    /// Restore from [`Property::save_xml`] output. Returns true if the value changed.
    pub(crate) fn load_xml(&self, element: &XmlElement, locator: &ProxyLocator) -> bool {
        let elements = match self.kind {
            PropertyKind::Proxy | PropertyKind::Input => {
                let mut inputs = Vec::new();
                for child in element.children_named("Proxy") {
                    let Some(id) = child.attribute_as::<u32>("value") else {
                        continue;
                    };
                    match locator.locate(GlobalId::new(id)) {
                        Some(proxy) => inputs.push(ProxyInput::new(proxy, child.attribute_as("output_port").unwrap_or(0))),
                        None => tracing::warn!(property = %self.name, id, "property: referenced proxy not found"),
                    }
                }
                Elements::Proxy(inputs)
            }
            kind => {
                let mut indexed: Vec<(usize, &str)> = element
                    .children_named("Element")
                    .filter_map(|e| Some((e.attribute_as::<usize>("index")?, e.attribute("value")?)))
                    .collect();
                indexed.sort_by_key(|(index, _)| *index);
                let raw: Vec<&str> = indexed.into_iter().map(|(_, value)| value).collect();
                match parse_values(kind, &raw) {
                    Some(elements) => elements,
                    None => {
                        tracing::warn!(property = %self.name, "property: unparsable element in xml state");
                        return false;
                    }
                }
            }
        };
        self.set_elements(elements)
    }
}

fn set_at<T: Clone + Default>(values: &mut Vec<T>, index: usize, value: T) {
    if values.len() <= index {
        values.resize(index + 1, T::default());
    }
    values[index] = value;
}

fn parse_values(kind: PropertyKind, raw: &[&str]) -> Option<Elements> {
    Some(match kind {
        PropertyKind::Int => Elements::Int(raw.iter().map(|v| v.trim().parse().ok()).collect::<Option<_>>()?),
        PropertyKind::Double => Elements::Double(raw.iter().map(|v| v.trim().parse().ok()).collect::<Option<_>>()?),
        PropertyKind::String => Elements::Text(raw.iter().map(|v| (*v).to_owned()).collect()),
        PropertyKind::Proxy | PropertyKind::Input => Elements::Proxy(Vec::new()),
    })
}

fn parse_defaults(kind: PropertyKind, raw: Option<&str>, declared: Option<usize>) -> Elements {
    let declared = declared.unwrap_or(0);
    match (kind, raw) {
        (PropertyKind::Proxy | PropertyKind::Input, _) => Elements::Proxy(Vec::new()),
        (PropertyKind::String, Some(raw)) if declared <= 1 => Elements::Text(vec![raw.to_owned()]),
        (PropertyKind::String, None) if declared == 1 => Elements::Text(vec![String::new()]),
        (kind, Some(raw)) => {
            let tokens: Vec<&str> = raw.split_whitespace().collect();
            parse_values(kind, &tokens).unwrap_or_else(|| {
                tracing::warn!(default = raw, "property: unparsable default values");
                kind.empty_elements()
            })
        }
        (PropertyKind::Int, None) => Elements::Int(vec![0; declared]),
        (PropertyKind::Double, None) => Elements::Double(vec![0.0; declared]),
        (PropertyKind::String, None) => Elements::Text(vec![String::new(); declared]),
    }
}

#[cfg(test)]
#[path = "property_test.rs"]
mod tests;
