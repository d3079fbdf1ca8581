//! Undo/redo of remote object state.
//!
//! DESIGN
//! ======
//! Remote objects report every pushed state transition to
//! [`Session::update_state_history`], which forwards it to the session's
//! [`UndoStackBuilder`]. Between `begin` and `end` the builder collects those
//! transitions as [`RemoteObjectUpdate`] elements; `end` pushes the set on
//! the [`UndoStack`]. Undoing reloads each `before` state through a locator
//! (so objects that were dropped meanwhile are rebuilt from the server) and
//! pushes it again; redo does the same with `after`.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use frames::StateMessage;

use crate::error::{SmError, SmResult};
use crate::events::Signal;
use crate::global_properties::GlobalPropertiesManager;
use crate::guard::ScopedFlag;
use crate::location::GlobalId;
use crate::locator::ProxyLocator;
use crate::proxy::ProxyRef;
use crate::remote_object::RemoteObject;
use crate::session::{Session, WeakSession};

/// Default number of undo sets kept.
pub const DEFAULT_STACK_DEPTH: usize = 10;

pub trait UndoElement: fmt::Debug {
    /// # Errors
    ///
    /// Fails when the recorded state can no longer be applied.
    fn undo(&self) -> SmResult<()>;

    /// # Errors
    ///
    /// Fails when the recorded state can no longer be applied.
    fn redo(&self) -> SmResult<()>;

    /// Fold a later element into this one. Returns false if unrelated.
    fn merge(&mut self, _later: &dyn UndoElement) -> bool {
        false
    }

    /// State transition carried by the element, if it is one.
    fn as_remote_object_update(&self) -> Option<&RemoteObjectUpdate> {
        None
    }
}

/// Before/after state of one remote object.
pub struct RemoteObjectUpdate {
    session: WeakSession,
    pub global_id: GlobalId,
    pub before: StateMessage,
    pub after: StateMessage,
}

impl fmt::Debug for RemoteObjectUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObjectUpdate").field("global_id", &self.global_id).finish_non_exhaustive()
    }
}

impl RemoteObjectUpdate {
    #[must_use]
    pub fn new(session: &Session, global_id: GlobalId, before: StateMessage, after: StateMessage) -> Self {
        Self { session: session.downgrade(), global_id, before, after }
    }

    fn apply(&self, state: &StateMessage) -> SmResult<()> {
        let session = self.session.upgrade().ok_or(SmError::NoSession)?;
        let locator = ProxyLocator::for_session(&session);
        let object: Rc<dyn RemoteObject> = match session.remote_object(self.global_id) {
            Some(object) => object,
            None => match locator.locate(self.global_id) {
                Some(proxy) => proxy as Rc<dyn RemoteObject>,
                None => {
                    tracing::warn!(id = %self.global_id, "undo: object no longer exists");
                    return Ok(());
                }
            },
        };
        object.load_state(state, &locator)?;
        republish(&object)
    }
}

/// Push an object's freshly loaded state back to the servers.
fn republish(object: &Rc<dyn RemoteObject>) -> SmResult<()> {
    if let Some(proxy) = Rc::clone(object).as_proxy() {
        return proxy.push_full_state();
    }
    if let Some(link) = Rc::clone(object).as_link() {
        return link.push_full_state();
    }
    if let Some(model) = Rc::clone(object).as_selection_model() {
        return model.push_full_state();
    }
    // The proxy manager pushes its own registration state while loading.
    Ok(())
}

impl UndoElement for RemoteObjectUpdate {
    fn undo(&self) -> SmResult<()> {
        self.apply(&self.before)
    }

    fn redo(&self) -> SmResult<()> {
        self.apply(&self.after)
    }

    fn merge(&mut self, later: &dyn UndoElement) -> bool {
        let Some(later) = later.as_remote_object_update() else {
            return false;
        };
        if later.global_id != self.global_id {
            return false;
        }
        self.after = later.after.clone();
        true
    }

    fn as_remote_object_update(&self) -> Option<&RemoteObjectUpdate> {
        Some(self)
    }
}

/// Addition or removal of a link between a global property and a proxy property.
pub struct GlobalPropertyLinkUpdate {
    manager: Weak<GlobalPropertiesManager>,
    pub global_name: String,
    pub proxy: ProxyRef,
    pub property: String,
    pub added: bool,
}

impl fmt::Debug for GlobalPropertyLinkUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalPropertyLinkUpdate")
            .field("global_name", &self.global_name)
            .field("property", &self.property)
            .field("added", &self.added)
            .finish_non_exhaustive()
    }
}

impl GlobalPropertyLinkUpdate {
    #[must_use]
    pub fn new(manager: &Rc<GlobalPropertiesManager>, global_name: &str, proxy: &ProxyRef, property: &str, added: bool) -> Self {
        Self {
            manager: Rc::downgrade(manager),
            global_name: global_name.to_owned(),
            proxy: Rc::clone(proxy),
            property: property.to_owned(),
            added,
        }
    }

    fn set_linked(&self, linked: bool) -> SmResult<()> {
        let manager = self.manager.upgrade().ok_or(SmError::NoActiveSession)?;
        if linked {
            manager.set_global_property_link(&self.global_name, &self.proxy, &self.property);
        } else {
            manager.remove_global_property_link(&self.global_name, &self.proxy, &self.property);
        }
        Ok(())
    }
}

impl UndoElement for GlobalPropertyLinkUpdate {
    fn undo(&self) -> SmResult<()> {
        self.set_linked(!self.added)
    }

    fn redo(&self) -> SmResult<()> {
        self.set_linked(self.added)
    }
}

/// Ordered group of elements undone and redone together.
#[derive(Debug, Default)]
pub struct UndoSet {
    label: String,
    elements: Vec<Box<dyn UndoElement>>,
}

impl UndoSet {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), elements: Vec::new() }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Append an element, merging it into the previous one when possible.
    pub fn add(&mut self, element: Box<dyn UndoElement>) {
        if let Some(last) = self.elements.last_mut() {
            if last.merge(element.as_ref()) {
                return;
            }
        }
        self.elements.push(element);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Undo every element, last first.
    ///
    /// # Errors
    ///
    /// Stops at the first failing element.
    pub fn undo(&self) -> SmResult<()> {
        self.elements.iter().rev().try_for_each(|e| e.undo())
    }

    /// Redo every element in recording order.
    ///
    /// # Errors
    ///
    /// Stops at the first failing element.
    pub fn redo(&self) -> SmResult<()> {
        self.elements.iter().try_for_each(|e| e.redo())
    }
}

pub struct UndoStack {
    undo: RefCell<Vec<UndoSet>>,
    redo: RefCell<Vec<UndoSet>>,
    depth: Cell<usize>,
    in_undo_redo: Cell<bool>,
    pub changed: Signal<()>,
}

impl fmt::Debug for UndoStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoStack")
            .field("undo", &self.undo.borrow().len())
            .field("redo", &self.redo.borrow().len())
            .field("depth", &self.depth.get())
            .finish_non_exhaustive()
    }
}

impl Default for UndoStack {
    fn default() -> Self {
        Self::new()
    }
}

impl UndoStack {
    #[must_use]
    pub fn new() -> Self {
        Self {
            undo: RefCell::new(Vec::new()),
            redo: RefCell::new(Vec::new()),
            depth: Cell::new(DEFAULT_STACK_DEPTH),
            in_undo_redo: Cell::new(false),
            changed: Signal::new(),
        }
    }

    /// Push a finished set. Clears the redo history; the oldest set is
    /// dropped once the depth limit is exceeded.
    pub fn push(&self, set: UndoSet) {
        {
            let mut undo = self.undo.borrow_mut();
            undo.push(set);
            let depth = self.depth.get().max(1);
            if undo.len() > depth {
                let excess = undo.len() - depth;
                undo.drain(..excess);
            }
        }
        self.redo.borrow_mut().clear();
        self.changed.emit(&());
    }

    pub fn set_stack_depth(&self, depth: usize) {
        self.depth.set(depth);
    }

    #[must_use]
    pub fn stack_depth(&self) -> usize {
        self.depth.get()
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.undo.borrow().is_empty()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.redo.borrow().is_empty()
    }

    #[must_use]
    pub fn undo_set_label(&self) -> Option<String> {
        self.undo.borrow().last().map(|s| s.label.clone())
    }

    #[must_use]
    pub fn redo_set_label(&self) -> Option<String> {
        self.redo.borrow().last().map(|s| s.label.clone())
    }

    #[must_use]
    pub fn number_of_undo_sets(&self) -> usize {
        self.undo.borrow().len()
    }

    #[must_use]
    pub fn number_of_redo_sets(&self) -> usize {
        self.redo.borrow().len()
    }

    /// True while a set is being undone or redone.
    #[must_use]
    pub fn is_undoing_or_redoing(&self) -> bool {
        self.in_undo_redo.get()
    }

    /// Undo the newest set. Returns false if there was nothing to undo.
    ///
    /// # Errors
    ///
    /// Propagates the first failing element; the set moves to the redo
    /// history regardless.
    pub fn undo(&self) -> SmResult<bool> {
        let Some(set) = self.undo.borrow_mut().pop() else {
            return Ok(false);
        };
        let result = {
            let _busy = ScopedFlag::set(&self.in_undo_redo, true);
            set.undo()
        };
        self.redo.borrow_mut().push(set);
        self.changed.emit(&());
        result.map(|()| true)
    }

    /// Redo the newest undone set. Returns false if there was nothing to redo.
    ///
    /// # Errors
    ///
    /// Propagates the first failing element; the set moves back to the undo
    /// history regardless.
    pub fn redo(&self) -> SmResult<bool> {
        let Some(set) = self.redo.borrow_mut().pop() else {
            return Ok(false);
        };
        let result = {
            let _busy = ScopedFlag::set(&self.in_undo_redo, true);
            set.redo()
        };
        self.undo.borrow_mut().push(set);
        self.changed.emit(&());
        result.map(|()| true)
    }

    pub fn clear(&self) {
        self.undo.borrow_mut().clear();
        self.redo.borrow_mut().clear();
        self.changed.emit(&());
    }
}

/// Collects state transitions into undo sets.
pub struct UndoStackBuilder {
    stack: Rc<UndoStack>,
    session: WeakSession,
    current: RefCell<Option<UndoSet>>,
    nesting: Cell<u32>,
    ignore_all_changes: Cell<bool>,
}

impl fmt::Debug for UndoStackBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoStackBuilder")
            .field("nesting", &self.nesting.get())
            .field("ignore_all_changes", &self.ignore_all_changes.get())
            .finish_non_exhaustive()
    }
}

impl UndoStackBuilder {
    /// Builder feeding `stack`. Install it with [`UndoStackBuilder::attach`].
    #[must_use]
    pub fn new(stack: Rc<UndoStack>) -> Rc<Self> {
        Rc::new(Self {
            stack,
            session: WeakSession::default(),
            current: RefCell::new(None),
            nesting: Cell::new(0),
            ignore_all_changes: Cell::new(false),
        })
    }

    /// Builder recording changes made through `session`.
    #[must_use]
    pub fn attach(session: &Session, stack: Rc<UndoStack>) -> Rc<Self> {
        let builder = Rc::new(Self {
            stack,
            session: session.downgrade(),
            current: RefCell::new(None),
            nesting: Cell::new(0),
            ignore_all_changes: Cell::new(false),
        });
        session.set_undo_stack_builder(Some(Rc::clone(&builder)));
        builder
    }

    #[must_use]
    pub fn stack(&self) -> Rc<UndoStack> {
        Rc::clone(&self.stack)
    }

    /// Open a set. Nested calls extend the outermost set.
    pub fn begin(&self, label: &str) {
        if self.nesting.get() == 0 {
            *self.current.borrow_mut() = Some(UndoSet::new(label));
        }
        self.nesting.set(self.nesting.get() + 1);
    }

    /// Close a set; the outermost `end` pushes it if it recorded anything.
    pub fn end(&self) {
        let nesting = self.nesting.get();
        if nesting == 0 {
            tracing::warn!("undo: end without begin");
            return;
        }
        self.nesting.set(nesting - 1);
        if nesting > 1 {
            return;
        }
        if let Some(set) = self.current.borrow_mut().take() {
            if !set.is_empty() {
                self.stack.push(set);
            }
        }
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.nesting.get() > 0
    }

    /// Drop whatever the open set collected so far.
    pub fn clear(&self) {
        if let Some(set) = self.current.borrow_mut().as_mut() {
            set.elements.clear();
        }
    }

    pub fn set_ignore_all_changes(&self, ignore: bool) {
        self.ignore_all_changes.set(ignore);
    }

    #[must_use]
    pub fn ignore_all_changes(&self) -> bool {
        self.ignore_all_changes.get()
    }

    /// Add an element to the open set. Ignored outside `begin`/`end` and
    /// while the stack replays history.
    pub fn add(&self, element: Box<dyn UndoElement>) {
        if self.ignore_all_changes.get() || self.stack.is_undoing_or_redoing() {
            return;
        }
        match self.current.borrow_mut().as_mut() {
            Some(set) => set.add(element),
            None => tracing::trace!("undo: change outside of an undo set ignored"),
        }
    }

    /// Record a remote object's transition from `before` to `after`.
    pub fn on_state_change(&self, id: GlobalId, before: &StateMessage, after: &StateMessage) {
        if before == after {
            return;
        }
        let Some(session) = self.session.upgrade() else {
            return;
        };
        self.add(Box::new(RemoteObjectUpdate::new(&session, id, before.clone(), after.clone())));
    }
}

#[cfg(test)]
#[path = "undo_test.rs"]
mod tests;
