//! Shared current-proxy and selection tracking.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use bitflags::bitflags;
use frames::{SelectionState, StateBody, StateMessage};

use crate::error::{SmError, SmResult};
use crate::events::Signal;
use crate::location::{GlobalId, Location};
use crate::locator::ProxyLocator;
use crate::proxy::ProxyRef;
use crate::remote_object::{RemoteCore, RemoteObject};

pub const SELECTION_MODEL_CLASS: &str = "SMProxySelectionModel";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SelectionCommand: u8 {
        const CLEAR = 0x01;
        const SELECT = 0x02;
        const DESELECT = 0x04;
        const CLEAR_AND_SELECT = Self::CLEAR.bits() | Self::SELECT.bits();
    }
}

pub struct ProxySelectionModel {
    remote: RemoteCore,
    current: RefCell<Option<ProxyRef>>,
    selection: RefCell<Vec<ProxyRef>>,
    last_state: RefCell<Option<StateMessage>>,
    pub current_changed: Signal<Option<ProxyRef>>,
    pub selection_changed: Signal<()>,
}

impl fmt::Debug for ProxySelectionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxySelectionModel")
            .field("id", &self.remote.global_id_if_set())
            .field("selected", &self.selection.borrow().len())
            .finish_non_exhaustive()
    }
}

impl ProxySelectionModel {
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<ProxySelectionModel>| {
            let owner: Weak<dyn RemoteObject> = weak.clone();
            ProxySelectionModel {
                remote: RemoteCore::new(owner, Location::DATA_SERVER),
                current: RefCell::new(None),
                selection: RefCell::new(Vec::new()),
                last_state: RefCell::new(None),
                current_changed: Signal::new(),
                selection_changed: Signal::new(),
            }
        })
    }

    #[must_use]
    pub fn current_proxy(&self) -> Option<ProxyRef> {
        self.current.borrow().clone()
    }

    /// Make `proxy` current and apply `command` to the selection with it.
    pub fn set_current_proxy(&self, proxy: Option<&ProxyRef>, command: SelectionCommand) {
        let changed = {
            let mut current = self.current.borrow_mut();
            let same = match (current.as_ref(), proxy) {
                (Some(a), Some(b)) => Rc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            };
            if !same {
                *current = proxy.cloned();
            }
            !same
        };
        let selected = match proxy {
            Some(proxy) => self.apply(std::slice::from_ref(proxy), command),
            None => self.apply(&[], command),
        };
        if changed {
            self.current_changed.emit(&proxy.cloned());
        }
        if selected {
            self.selection_changed.emit(&());
        }
        if changed || selected {
            self.state_modified();
        }
    }

    /// Update the selection. Returns true if it changed.
    pub fn select(&self, proxies: &[ProxyRef], command: SelectionCommand) -> bool {
        let changed = self.apply(proxies, command);
        if changed {
            self.selection_changed.emit(&());
            self.state_modified();
        }
        changed
    }

    fn apply(&self, proxies: &[ProxyRef], command: SelectionCommand) -> bool {
        let mut selection = self.selection.borrow_mut();
        let before: Vec<ProxyRef> = selection.clone();
        if command.contains(SelectionCommand::CLEAR) {
            selection.clear();
        }
        for proxy in proxies {
            if command.contains(SelectionCommand::SELECT) {
                if !selection.iter().any(|p| Rc::ptr_eq(p, proxy)) {
                    selection.push(Rc::clone(proxy));
                }
            } else if command.contains(SelectionCommand::DESELECT) {
                selection.retain(|p| !Rc::ptr_eq(p, proxy));
            }
        }
        before.len() != selection.len() || before.iter().zip(selection.iter()).any(|(a, b)| !Rc::ptr_eq(a, b))
    }

    #[must_use]
    pub fn is_selected(&self, proxy: &ProxyRef) -> bool {
        self.selection.borrow().iter().any(|p| Rc::ptr_eq(p, proxy))
    }

    #[must_use]
    pub fn selection(&self) -> Vec<ProxyRef> {
        self.selection.borrow().clone()
    }

    #[must_use]
    pub fn number_of_selected_proxies(&self) -> usize {
        self.selection.borrow().len()
    }

    #[must_use]
    pub fn selected_proxy(&self, index: usize) -> Option<ProxyRef> {
        self.selection.borrow().get(index).cloned()
    }

    /// # Errors
    ///
    /// Propagates push failures.
    pub fn push_full_state(&self) -> SmResult<()> {
        let state = self.state_message();
        self.remote.push_state(state.clone())?;
        *self.last_state.borrow_mut() = Some(state);
        Ok(())
    }

    fn state_message(&self) -> StateMessage {
        let state = SelectionState {
            current: self.current.borrow().as_ref().map_or(0, |p| p.global_id().get()),
            selection: self.selection.borrow().iter().map(|p| p.global_id().get()).collect(),
        };
        StateMessage {
            global_id: self.remote.global_id().get(),
            location: self.remote.location().bits(),
            client_class: SELECTION_MODEL_CLASS.to_owned(),
            ..StateMessage::default()
        }
        .with_body(StateBody::Selection(state))
    }

    fn state_modified(&self) {
        let Some(session) = self.remote.session() else {
            return;
        };
        let after = self.state_message();
        if let Err(e) = self.remote.push_state(after.clone()) {
            tracing::error!(error = %e, "selection: could not push state");
        }
        if let Some(before) = self.last_state.replace(Some(after.clone())) {
            session.update_state_history(self.remote.global_id(), &before, &after);
        }
    }
}

impl RemoteObject for ProxySelectionModel {
    fn remote(&self) -> &RemoteCore {
        &self.remote
    }

    fn full_state(&self) -> Option<StateMessage> {
        Some(self.state_message())
    }

    fn load_state(&self, message: &StateMessage, locator: &ProxyLocator) -> SmResult<()> {
        let Some(state) = message.selection() else {
            return Err(SmError::UnexpectedReply(format!("state {} is not a selection state", message.global_id)));
        };
        let current = locator.locate(GlobalId::new(state.current));
        let selection: Vec<ProxyRef> =
            state.selection.iter().filter_map(|id| locator.locate(GlobalId::new(*id))).collect();
        *self.current.borrow_mut() = current.clone();
        *self.selection.borrow_mut() = selection;
        *self.last_state.borrow_mut() = Some(self.state_message());
        self.current_changed.emit(&current);
        self.selection_changed.emit(&());
        Ok(())
    }

    fn as_selection_model(self: Rc<Self>) -> Option<Rc<ProxySelectionModel>> {
        Some(self)
    }
}

#[cfg(test)]
#[path = "selection_test.rs"]
mod tests;
