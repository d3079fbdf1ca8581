//! Property and proxy links.
//!
//! A link watches its input members and copies changed values to its output
//! members. Property links pair individual `(proxy, property)` members; proxy
//! links copy every property of an input proxy to each output proxy except
//! the listed exceptions. Links are remote objects so collaborating clients
//! and undo see membership changes.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use frames::{LinkDirection, LinkMember, LinkState, StateBody, StateMessage};

use crate::error::{SmError, SmResult};
use crate::events::ObserverId;
use crate::guard::ScopedFlag;
use crate::location::{GlobalId, Location};
use crate::locator::ProxyLocator;
use crate::property::Property;
use crate::proxy::ProxyRef;
use crate::remote_object::{RemoteCore, RemoteObject};
use crate::session::Session;
use crate::xml::XmlElement;

pub const PROPERTY_LINK_CLASS: &str = "SMPropertyLink";
pub const PROXY_LINK_CLASS: &str = "SMProxyLink";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Property,
    Proxy,
}

impl LinkKind {
    #[must_use]
    pub fn client_class(self) -> &'static str {
        match self {
            Self::Property => PROPERTY_LINK_CLASS,
            Self::Proxy => PROXY_LINK_CLASS,
        }
    }

    /// Element tag used in XML state.
    #[must_use]
    pub fn xml_tag(self) -> &'static str {
        match self {
            Self::Property => "PropertyLink",
            Self::Proxy => "ProxyLink",
        }
    }

    #[must_use]
    pub fn from_xml_tag(tag: &str) -> Option<Self> {
        match tag {
            "PropertyLink" => Some(Self::Property),
            "ProxyLink" => Some(Self::Proxy),
            _ => None,
        }
    }
}

/// One linked proxy (and property, for property links).
#[derive(Debug, Clone)]
pub struct LinkedMember {
    pub proxy: ProxyRef,
    pub property: Option<String>,
    pub direction: LinkDirection,
}

struct Attached {
    member: LinkedMember,
    modified: Option<ObserverId>,
    updated: Option<ObserverId>,
}

impl Attached {
    fn detach(&mut self) {
        if let Some(id) = self.modified.take() {
            self.member.proxy.property_modified.disconnect(id);
        }
        if let Some(id) = self.updated.take() {
            self.member.proxy.updated.disconnect(id);
        }
    }
}

struct LinkInner {
    kind: LinkKind,
    remote: RemoteCore,
    self_weak: Weak<LinkInner>,
    members: RefCell<Vec<Attached>>,
    exceptions: RefCell<Vec<String>>,
    propagate_update: Cell<bool>,
    propagating: Cell<bool>,
    loading: Cell<bool>,
    last_state: RefCell<Option<StateMessage>>,
}

/// Shared handle to a property or proxy link.
#[derive(Clone)]
pub struct Link(Rc<LinkInner>);

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("kind", &self.0.kind)
            .field("id", &self.0.remote.global_id_if_set())
            .field("members", &self.0.members.borrow().len())
            .finish_non_exhaustive()
    }
}

impl Link {
    #[must_use]
    pub fn new(kind: LinkKind) -> Self {
        Self(Rc::new_cyclic(|weak: &Weak<LinkInner>| {
            let owner: Weak<dyn RemoteObject> = weak.clone();
            LinkInner {
                kind,
                remote: RemoteCore::new(owner, Location::DATA_SERVER),
                self_weak: weak.clone(),
                members: RefCell::new(Vec::new()),
                exceptions: RefCell::new(Vec::new()),
                propagate_update: Cell::new(false),
                propagating: Cell::new(false),
                loading: Cell::new(false),
                last_state: RefCell::new(None),
            }
        }))
    }

    #[must_use]
    pub fn property_link() -> Self {
        Self::new(LinkKind::Property)
    }

    #[must_use]
    pub fn proxy_link() -> Self {
        Self::new(LinkKind::Proxy)
    }

    /// Instantiate the link class named in a state message.
    ///
    /// # Panics
    ///
    /// Panics for client classes that are not links; such a state means the
    /// registration record is corrupt.
    #[must_use]
    pub fn from_client_class(client_class: &str, session: &Session) -> Self {
        let kind = match client_class {
            PROPERTY_LINK_CLASS => LinkKind::Property,
            PROXY_LINK_CLASS => LinkKind::Proxy,
            other => panic!("unknown link class `{other}` in registration state"),
        };
        let link = Self::new(kind);
        link.0.remote.set_session(session);
        link
    }

    #[must_use]
    pub fn kind(&self) -> LinkKind {
        self.0.kind
    }

    #[must_use]
    pub fn client_class(&self) -> &'static str {
        self.0.kind.client_class()
    }

    #[must_use]
    pub fn remote(&self) -> &RemoteCore {
        &self.0.remote
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Link) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Link `property` of `proxy`. Only meaningful for property links.
    pub fn add_link_property(&self, proxy: &ProxyRef, property: &str, direction: LinkDirection) {
        self.0.add_member(LinkedMember { proxy: Rc::clone(proxy), property: Some(property.to_owned()), direction });
        self.0.state_modified();
    }

    /// Link every property of `proxy`. Only meaningful for proxy links.
    pub fn add_linked_proxy(&self, proxy: &ProxyRef, direction: LinkDirection) {
        self.0.add_member(LinkedMember { proxy: Rc::clone(proxy), property: None, direction });
        self.0.state_modified();
    }

    /// Remove every membership of `proxy` (restricted to `property` if given).
    pub fn remove_member(&self, proxy: &ProxyRef, property: Option<&str>) -> bool {
        let removed = {
            let mut members = self.0.members.borrow_mut();
            let before = members.len();
            members.retain_mut(|attached| {
                let matches = Rc::ptr_eq(&attached.member.proxy, proxy)
                    && property.is_none_or(|p| attached.member.property.as_deref() == Some(p));
                if matches {
                    attached.detach();
                }
                !matches
            });
            before != members.len()
        };
        if removed {
            self.0.state_modified();
        }
        removed
    }

    pub fn remove_all_members(&self) {
        self.0.clear_members();
        self.0.state_modified();
    }

    #[must_use]
    pub fn members(&self) -> Vec<LinkedMember> {
        self.0.members.borrow().iter().map(|a| a.member.clone()).collect()
    }

    #[must_use]
    pub fn number_of_members(&self) -> usize {
        self.0.members.borrow().len()
    }

    /// Exclude `property` from a proxy link.
    pub fn add_exception(&self, property: &str) {
        {
            let mut exceptions = self.0.exceptions.borrow_mut();
            if exceptions.iter().any(|e| e == property) {
                return;
            }
            exceptions.push(property.to_owned());
        }
        self.0.state_modified();
    }

    pub fn remove_exception(&self, property: &str) -> bool {
        let removed = {
            let mut exceptions = self.0.exceptions.borrow_mut();
            let before = exceptions.len();
            exceptions.retain(|e| e != property);
            before != exceptions.len()
        };
        if removed {
            self.0.state_modified();
        }
        removed
    }

    #[must_use]
    pub fn exceptions(&self) -> Vec<String> {
        self.0.exceptions.borrow().clone()
    }

    /// Also run `update_vtk_objects` on outputs whenever an input is updated.
    pub fn set_propagate_update(&self, propagate: bool) {
        if self.0.propagate_update.replace(propagate) != propagate {
            self.0.state_modified();
        }
    }

    #[must_use]
    pub fn propagate_update(&self) -> bool {
        self.0.propagate_update.get()
    }

    /// Stop observing members. Membership is kept.
    pub fn disconnect(&self) {
        for attached in self.0.members.borrow_mut().iter_mut() {
            attached.detach();
        }
    }

    /// # Errors
    ///
    /// Propagates push failures.
    pub fn push_full_state(&self) -> SmResult<()> {
        let state = self.0.state_message();
        self.0.remote.push_state(state.clone())?;
        *self.0.last_state.borrow_mut() = Some(state);
        Ok(())
    }

    #[must_use]
    pub fn full_state(&self) -> StateMessage {
        self.0.state_message()
    }

    /// # Errors
    ///
    /// Fails if `message` does not carry a link state.
    pub fn load_state(&self, message: &StateMessage, locator: &ProxyLocator) -> SmResult<()> {
        self.0.load_state(message, locator)
    }

    /// `<PropertyLink name>` or `<ProxyLink name>` element.
    #[must_use]
    pub fn save_xml(&self, name: &str) -> XmlElement {
        let mut element = XmlElement::new(self.0.kind.xml_tag()).with_attribute("name", name);
        for attached in self.0.members.borrow().iter() {
            let member = &attached.member;
            let mut child = match self.0.kind {
                LinkKind::Property => XmlElement::new("Property")
                    .with_attribute("name", member.property.as_deref().unwrap_or_default()),
                LinkKind::Proxy => XmlElement::new("Proxy"),
            };
            child.set_attribute("id", member.proxy.global_id());
            child.set_attribute("direction", i32::from(member.direction));
            element.add_child(child);
        }
        for exception in self.0.exceptions.borrow().iter() {
            element.add_child(XmlElement::new("Exception").with_attribute("name", exception));
        }
        if self.0.propagate_update.get() {
            element.set_attribute("propagate_update", 1);
        }
        element
    }

    /// Restore members from [`Link::save_xml`] output. Members whose proxy
    /// cannot be located are skipped.
    pub fn load_xml(&self, element: &XmlElement, locator: &ProxyLocator) {
        let member_tag = match self.0.kind {
            LinkKind::Property => "Property",
            LinkKind::Proxy => "Proxy",
        };
        {
            let _loading = ScopedFlag::set(&self.0.loading, true);
            for child in element.children_named(member_tag) {
                let Some(id) = child.attribute_as::<u32>("id") else {
                    continue;
                };
                let Some(proxy) = locator.locate(GlobalId::new(id)) else {
                    tracing::warn!(id, "link: member proxy not found");
                    continue;
                };
                let direction = child
                    .attribute_as::<i32>("direction")
                    .and_then(|d| LinkDirection::try_from(d).ok())
                    .unwrap_or(LinkDirection::None);
                let property = child.attribute("name").map(str::to_owned);
                self.0.add_member(LinkedMember { proxy, property, direction });
            }
            for child in element.children_named("Exception") {
                if let Some(name) = child.attribute("name") {
                    self.0.exceptions.borrow_mut().push(name.to_owned());
                }
            }
            self.0.propagate_update.set(element.attribute_flag("propagate_update"));
        }
        self.0.state_modified();
    }
}

impl LinkInner {
    fn add_member(&self, member: LinkedMember) {
        let duplicate = self.members.borrow().iter().any(|a| {
            Rc::ptr_eq(&a.member.proxy, &member.proxy)
                && a.member.property == member.property
                && a.member.direction == member.direction
        });
        if duplicate {
            return;
        }
        let (modified, updated) = if member.direction == LinkDirection::Input {
            let link = self.self_weak.clone();
            let source = Rc::downgrade(&member.proxy);
            let modified = member.proxy.property_modified.connect(move |property| {
                if let (Some(link), Some(source)) = (link.upgrade(), source.upgrade()) {
                    link.on_input_modified(&source, property);
                }
            });
            let link = self.self_weak.clone();
            let updated = member.proxy.updated.connect(move |()| {
                if let Some(link) = link.upgrade() {
                    link.on_input_updated();
                }
            });
            (Some(modified), Some(updated))
        } else {
            (None, None)
        };
        self.members.borrow_mut().push(Attached { member, modified, updated });
    }

    fn clear_members(&self) {
        let mut members = self.members.borrow_mut();
        for attached in members.iter_mut() {
            attached.detach();
        }
        members.clear();
    }

    fn outputs(&self) -> Vec<LinkedMember> {
        self.members
            .borrow()
            .iter()
            .filter(|a| a.member.direction == LinkDirection::Output)
            .map(|a| a.member.clone())
            .collect()
    }

    fn on_input_modified(&self, source: &ProxyRef, property: &str) {
        if self.propagating.get() {
            return;
        }
        let _busy = ScopedFlag::set(&self.propagating, true);

        let targets: Vec<(ProxyRef, String)> = match self.kind {
            LinkKind::Property => {
                let is_input = self.members.borrow().iter().any(|a| {
                    a.member.direction == LinkDirection::Input
                        && Rc::ptr_eq(&a.member.proxy, source)
                        && a.member.property.as_deref() == Some(property)
                });
                if !is_input {
                    return;
                }
                self.outputs().into_iter().filter_map(|m| Some((m.proxy, m.property?))).collect()
            }
            LinkKind::Proxy => {
                if self.exceptions.borrow().iter().any(|e| e == property) {
                    return;
                }
                self.outputs().into_iter().map(|m| (m.proxy, property.to_owned())).collect()
            }
        };
        let Some(values) = source.property(property).map(Property::elements) else {
            return;
        };
        for (target, name) in targets {
            if Rc::ptr_eq(&target, source) || target.property(&name).is_none() {
                continue;
            }
            target.set_elements(&name, values.clone());
        }
    }

    fn on_input_updated(&self) {
        if !self.propagate_update.get() || self.propagating.get() {
            return;
        }
        let _busy = ScopedFlag::set(&self.propagating, true);
        for output in self.outputs() {
            if let Err(e) = output.proxy.update_vtk_objects() {
                tracing::error!(error = %e, "link: could not update linked proxy");
            }
        }
    }

    fn state_message(&self) -> StateMessage {
        let members = self
            .members
            .borrow()
            .iter()
            .map(|a| LinkMember {
                proxy: a.member.proxy.global_id().get(),
                property: a.member.property.clone().unwrap_or_default(),
                direction: a.member.direction.into(),
            })
            .collect();
        let state = LinkState {
            members,
            exceptions: self.exceptions.borrow().clone(),
            propagate_update: self.propagate_update.get(),
        };
        StateMessage {
            global_id: self.remote.global_id().get(),
            location: self.remote.location().bits(),
            client_class: self.kind.client_class().to_owned(),
            ..StateMessage::default()
        }
        .with_body(StateBody::Link(state))
    }

    /// Push the new membership and record it for undo.
    fn state_modified(&self) {
        if self.loading.get() {
            return;
        }
        let Some(session) = self.remote.session() else {
            return;
        };
        let after = self.state_message();
        if let Err(e) = self.remote.push_state(after.clone()) {
            tracing::error!(error = %e, "link: could not push state");
        }
        let before = self.last_state.replace(Some(after.clone()));
        if let Some(before) = before {
            session.update_state_history(self.remote.global_id(), &before, &after);
        }
    }
}

impl RemoteObject for LinkInner {
    fn remote(&self) -> &RemoteCore {
        &self.remote
    }

    fn full_state(&self) -> Option<StateMessage> {
        Some(self.state_message())
    }

    fn load_state(&self, message: &StateMessage, locator: &ProxyLocator) -> SmResult<()> {
        let Some(state) = message.link() else {
            return Err(SmError::UnexpectedReply(format!("state {} is not a link state", message.global_id)));
        };
        let _loading = ScopedFlag::set(&self.loading, true);
        self.clear_members();
        for member in &state.members {
            let Some(proxy) = locator.locate(GlobalId::new(member.proxy)) else {
                tracing::warn!(id = member.proxy, "link: member proxy not found");
                continue;
            };
            let property = Some(member.property.clone()).filter(|p| !p.is_empty());
            self.add_member(LinkedMember { proxy, property, direction: member.direction() });
        }
        *self.exceptions.borrow_mut() = state.exceptions.clone();
        self.propagate_update.set(state.propagate_update);
        *self.last_state.borrow_mut() = Some(self.state_message());
        Ok(())
    }

    fn as_link(self: Rc<Self>) -> Option<Link> {
        Some(Link(self))
    }
}

#[cfg(test)]
#[path = "link_test.rs"]
mod tests;
