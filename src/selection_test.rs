use super::*;

use std::cell::Cell;

use crate::server::{self, ServerCore};
use crate::session::Session;
use crate::test_helpers::{builtin_session, sphere};

fn count(signal: &Signal<()>) -> Rc<Cell<usize>> {
    let hits = Rc::new(Cell::new(0));
    let sink = Rc::clone(&hits);
    signal.connect(move |_| sink.set(sink.get() + 1));
    hits
}

#[test]
fn commands_combine_clear_select_and_deselect() {
    let session = builtin_session();
    let (a, b, c) = (sphere(&session), sphere(&session), sphere(&session));
    let model = ProxySelectionModel::new();
    let changes = count(&model.selection_changed);

    assert!(model.select(&[Rc::clone(&a), Rc::clone(&b)], SelectionCommand::SELECT));
    assert!(!model.select(&[Rc::clone(&a)], SelectionCommand::SELECT));
    assert_eq!(model.number_of_selected_proxies(), 2);

    assert!(model.select(&[Rc::clone(&a)], SelectionCommand::DESELECT));
    assert!(!model.is_selected(&a));
    assert!(model.is_selected(&b));

    assert!(model.select(&[Rc::clone(&c)], SelectionCommand::CLEAR_AND_SELECT));
    assert_eq!(model.selection().len(), 1);
    assert!(model.selected_proxy(0).is_some_and(|p| Rc::ptr_eq(&p, &c)));
    assert!(model.selected_proxy(1).is_none());

    assert!(model.select(&[], SelectionCommand::CLEAR));
    assert!(!model.select(&[], SelectionCommand::CLEAR));
    assert_eq!(changes.get(), 4);
}

#[test]
fn current_proxy_changes_fire_once() {
    let session = builtin_session();
    let (a, b) = (sphere(&session), sphere(&session));
    let model = ProxySelectionModel::new();
    let currents = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&currents);
    model.current_changed.connect(move |proxy| sink.borrow_mut().push(proxy.clone()));
    let selections = count(&model.selection_changed);

    model.set_current_proxy(Some(&a), SelectionCommand::CLEAR_AND_SELECT);
    model.set_current_proxy(Some(&a), SelectionCommand::CLEAR_AND_SELECT);
    model.set_current_proxy(Some(&b), SelectionCommand::empty());
    model.set_current_proxy(None, SelectionCommand::CLEAR);

    assert!(model.current_proxy().is_none());
    assert!(model.selection().is_empty());
    assert_eq!(selections.get(), 2);
    let seen = currents.borrow();
    assert_eq!(seen.len(), 3);
    assert!(seen[0].as_ref().is_some_and(|p| Rc::ptr_eq(p, &a)));
    assert!(seen[1].as_ref().is_some_and(|p| Rc::ptr_eq(p, &b)));
    assert!(seen[2].is_none());
}

#[test]
fn selection_state_is_shared_through_the_server() {
    let server = ServerCore::new(1).shared();
    let session = Session::builtin_with(&server, "solo").expect("session");
    let (a, b) = (sphere(&session), sphere(&session));
    let model = ProxySelectionModel::new();
    model.remote().set_session(&session);

    model.set_current_proxy(Some(&b), SelectionCommand::SELECT);
    model.select(&[Rc::clone(&a)], SelectionCommand::SELECT);

    let id = model.remote().global_id().get();
    let stored = server::lock(&server).object_state(id).cloned().expect("selection state");
    assert_eq!(stored.client_class, SELECTION_MODEL_CLASS);
    let state = stored.selection().cloned().expect("selection body");
    assert_eq!(state.current, b.global_id().get());
    assert_eq!(state.selection, vec![b.global_id().get(), a.global_id().get()]);

    let mirror = ProxySelectionModel::new();
    let currents = count_current(&mirror);
    mirror.load_state(&stored, &ProxyLocator::for_session(&session)).expect("loads");
    assert!(mirror.current_proxy().is_some_and(|p| Rc::ptr_eq(&p, &b)));
    assert_eq!(mirror.number_of_selected_proxies(), 2);
    assert_eq!(currents.get(), 1);

    let bogus = StateMessage::addressed(id, 1);
    assert!(matches!(mirror.load_state(&bogus, &ProxyLocator::default()), Err(SmError::UnexpectedReply(_))));
}

fn count_current(model: &ProxySelectionModel) -> Rc<Cell<usize>> {
    let hits = Rc::new(Cell::new(0));
    let sink = Rc::clone(&hits);
    model.current_changed.connect(move |_| sink.set(sink.get() + 1));
    hits
}

#[test]
fn unknown_members_are_dropped_on_load() {
    let session = builtin_session();
    let a = sphere(&session);
    let state = StateMessage::addressed(777, Location::DATA_SERVER.bits()).with_body(StateBody::Selection(SelectionState {
        current: 123_456,
        selection: vec![a.global_id().get(), 123_457],
    }));

    let model = ProxySelectionModel::new();
    model.load_state(&state, &ProxyLocator::for_session(&session)).expect("loads");
    assert!(model.current_proxy().is_none());
    assert_eq!(model.number_of_selected_proxies(), 1);
    assert!(model.is_selected(&a));
}
