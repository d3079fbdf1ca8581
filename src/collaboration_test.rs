use super::*;

use crate::server;
use crate::test_helpers::{builtin_session, collaborating_sessions};

fn record<T: Clone + 'static>(signal: &Signal<T>) -> Rc<RefCell<Vec<T>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    signal.connect(move |value: &T| sink.borrow_mut().push(value.clone()));
    seen
}

#[test]
fn both_clients_see_the_same_roster() {
    let (server, a, b) = collaborating_sessions();
    let (alice, bob) = (a.collaboration_manager(), b.collaboration_manager());

    for manager in [&alice, &bob] {
        assert_eq!(manager.number_of_connected_clients(), 2);
        assert_eq!(manager.user_id_at(0), Some(1));
        assert_eq!(manager.user_label(2).as_deref(), Some("bob"));
        assert_eq!(manager.master_id(), 1);
    }
    assert_eq!(alice.user_id(), 1);
    assert!(alice.is_master());
    assert!(!bob.is_master());
    assert_eq!(server::lock(&server).master(), 1);
}

#[test]
fn renames_reach_the_other_client() {
    let (_server, a, b) = collaborating_sessions();
    let (alice, bob) = (a.collaboration_manager(), b.collaboration_manager());
    let heard = record(&alice.user_renamed);
    let local = record(&bob.user_renamed);

    bob.set_user_label("robert");
    bob.set_user_label("robert");
    assert_eq!(local.borrow().len(), 1);
    assert_eq!(bob.user_label(2).as_deref(), Some("robert"));

    assert_eq!(a.process_notifications(), 1);
    assert_eq!(*heard.borrow(), vec![UserRenamed { client: 2, name: "robert".to_owned() }]);
    assert_eq!(alice.user_label(2).as_deref(), Some("robert"));

    let solo = builtin_session();
    let fresh = solo.collaboration_manager();
    fresh.set_user_label_for(7, "guest");
    assert_eq!(fresh.user_label(7).as_deref(), Some("guest"));
}

#[test]
fn promotion_moves_the_master_everywhere() {
    let (server, a, b) = collaborating_sessions();
    let (alice, bob) = (a.collaboration_manager(), b.collaboration_manager());
    let changes = record(&alice.master_changed);
    let remote = record(&bob.master_changed);

    alice.promote_to_master(9);
    assert_eq!(alice.master_id(), 1);

    alice.promote_to_master(2);
    alice.promote_to_master(2);
    assert_eq!(*changes.borrow(), vec![2]);
    assert!(!alice.is_master());
    assert_eq!(server::lock(&server).master(), 2);

    b.process_notifications();
    assert!(bob.is_master());
    assert_eq!(*remote.borrow(), vec![2]);
}

#[test]
fn a_departing_master_hands_over() {
    let (_server, a, b) = collaborating_sessions();
    let alice = a.collaboration_manager();
    let lists = record(&alice.user_list_changed);
    alice.promote_to_master(2);
    alice.follow_user(2);

    b.close();
    a.process_notifications();

    assert_eq!(alice.number_of_connected_clients(), 1);
    assert_eq!(alice.master_id(), 1);
    assert!(alice.is_master());
    assert_eq!(alice.followed_user(), 0);
    assert_eq!(lists.borrow().len(), 1);
}

#[test]
fn followers_track_the_followed_camera() {
    let (_server, a, b) = collaborating_sessions();
    let (alice, bob) = (a.collaboration_manager(), b.collaboration_manager());
    let follows = record(&bob.follow_user_camera);
    let cameras = record(&alice.camera_changed);

    alice.follow_user(2);
    assert_eq!(alice.followed_user(), 2);
    b.process_notifications();
    assert_eq!(bob.followed_user(), 2);
    assert_eq!(*follows.borrow(), vec![2]);

    bob.broadcast_camera(&[0.0, 1.0, 2.0]);
    a.process_notifications();
    assert_eq!(*cameras.borrow(), vec![CameraUpdate { client: 2, camera: vec![0.0, 1.0, 2.0] }]);

    bob.follow_user(1);
    assert_eq!(a.process_notifications(), 0);
    assert_eq!(alice.followed_user(), 2);
}

#[test]
fn notifications_are_relayed_but_not_stored() {
    let (server, a, b) = collaborating_sessions();
    let payload = StateMessage::addressed(42, Location::CLIENT.bits());
    let received = record(&b.collaboration_manager().notification);

    assert!(a.collaboration_manager().send_notification(payload));
    b.process_notifications();
    assert_eq!(received.borrow().len(), 1);
    assert_eq!(received.borrow()[0].global_id, 42);
    assert!(server::lock(&server).object_state(42).is_none());
    assert_eq!(a.process_notifications(), 0);
}

#[test]
fn roster_state_loads_and_rejects_other_bodies() {
    let (_server, a, _b) = collaborating_sessions();
    let alice = a.collaboration_manager();
    let snapshot = alice.full_state().expect("roster");
    assert_eq!(snapshot.global_id, GlobalId::COLLABORATION_MANAGER.get());

    let other = CollaborationManager::new(WeakSession::default());
    let lists = record(&other.user_list_changed);
    other.load_state(&snapshot, &ProxyLocator::default()).expect("roster loads");
    assert_eq!(other.number_of_connected_clients(), 2);
    assert_eq!(other.master_id(), 1);
    assert_eq!(other.user_id(), 0);
    assert!(!other.is_master());
    assert_eq!(lists.borrow().len(), 1);

    let bogus = StateMessage::addressed(GlobalId::COLLABORATION_MANAGER.get(), 0);
    assert!(matches!(other.load_state(&bogus, &ProxyLocator::default()), Err(SmError::UnexpectedReply(_))));
}
