use super::*;

use std::cell::Cell;

use crate::test_helpers::{builtin_session, collaborating_sessions, sphere};

/// Serves canned states and counts what it was asked for.
struct Canned {
    session: Session,
    state: StateMessage,
    built: Rc<Cell<usize>>,
}

impl Deserializer for Canned {
    fn new_proxy(&self, id: GlobalId, locator: &ProxyLocator) -> Option<ProxyRef> {
        if id.get() != self.state.global_id {
            return None;
        }
        self.built.set(self.built.get() + 1);
        let proxy = sphere(&self.session);
        locator.insert(id, Rc::clone(&proxy));
        proxy.load_state(&self.state, locator).ok()?;
        Some(proxy)
    }

    fn state_for(&self, id: GlobalId) -> Option<StateMessage> {
        (id.get() == self.state.global_id).then(|| self.state.clone())
    }
}

fn canned(session: &Session, id: u32, radius: f64) -> (Box<dyn Deserializer>, Rc<Cell<usize>>) {
    let source = sphere(session);
    source.set_double("Radius", 0, radius);
    let mut state = source.full_state().expect("state");
    state.global_id = id;
    let built = Rc::new(Cell::new(0));
    (Box::new(Canned { session: session.clone(), state, built: Rc::clone(&built) }), built)
}

#[test]
fn unset_ids_resolve_to_nothing() {
    let session = builtin_session();
    let locator = ProxyLocator::for_session(&session);
    assert!(locator.locate(GlobalId::UNSET).is_none());
    assert!(ProxyLocator::default().locate(GlobalId::new(500)).is_none());
}

#[test]
fn live_proxies_are_found_first() {
    let session = builtin_session();
    let source = sphere(&session);
    let id = source.global_id();
    let (deserializer, built) = canned(&session, id.get(), 9.0);
    let locator = ProxyLocator::with_deserializer(&session, deserializer);

    let found = locator.locate(id).expect("live proxy");
    assert!(Rc::ptr_eq(&found, &source));
    assert_eq!(built.get(), 0);
    assert_eq!(locator.located().len(), 1);
}

#[test]
fn missing_proxies_come_from_the_deserializer_once() {
    let session = builtin_session();
    let (deserializer, built) = canned(&session, 4000, 6.0);
    let locator = ProxyLocator::detached(deserializer);

    let first = locator.locate(GlobalId::new(4000)).expect("built");
    let second = locator.locate(GlobalId::new(4000)).expect("cached");
    assert!(Rc::ptr_eq(&first, &second));
    assert_eq!(built.get(), 1);
    assert_eq!(first.double_element("Radius", 0), Some(6.0));
    assert!(locator.state_for(GlobalId::new(4000)).is_some());
    assert!(locator.locate(GlobalId::new(4001)).is_none());

    locator.clear();
    assert!(locator.located().is_empty());
    locator.locate(GlobalId::new(4000)).expect("rebuilt");
    assert_eq!(built.get(), 2);
}

#[test]
fn detached_locators_ignore_live_objects() {
    let session = builtin_session();
    let source = sphere(&session);
    let id = source.global_id();
    let (deserializer, built) = canned(&session, id.get(), 1.25);
    let locator = ProxyLocator::detached(deserializer);

    let found = locator.locate(id).expect("rebuilt from state");
    assert!(!Rc::ptr_eq(&found, &source));
    assert_eq!(found.double_element("Radius", 0), Some(1.25));
    assert_eq!(built.get(), 1);
}

#[test]
fn server_state_rebuilds_proxies_another_client_made() {
    let (_server, a, b) = collaborating_sessions();
    let source = sphere(&a);
    source.set_double("Radius", 0, 4.5);
    source.update_vtk_objects().expect("push");

    let locator = ProxyLocator::for_session(&b);
    let rebuilt = locator.locate(source.global_id()).expect("rebuilt from server");
    assert_eq!(rebuilt.xml_name(), "SphereSource");
    assert_eq!(rebuilt.global_id(), source.global_id());
    assert_eq!(rebuilt.double_element("Radius", 0), Some(4.5));
    assert!(b.remote_object(source.global_id()).is_some());

    assert!(locator.locate(GlobalId::new(987_654)).is_none());
}
