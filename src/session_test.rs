use super::*;

use frames::{RegistrationState, StateBody};

use crate::server;
use crate::test_helpers::{builtin_session, collaborating_sessions, sphere};

/// Built-in transport that also hands out frames queued by the test.
struct Injecting {
    inner: BuiltinTransport,
    queued: Rc<RefCell<Vec<Frame>>>,
}

impl Transport for Injecting {
    fn uri(&self) -> String {
        "test:".to_owned()
    }

    fn request(&self, frame: Frame) -> SmResult<Frame> {
        self.inner.request(frame)
    }

    fn drain_notifications(&self) -> Vec<Frame> {
        let mut frames = self.inner.drain_notifications();
        frames.append(&mut self.queued.borrow_mut());
        frames
    }

    fn close(&self) {
        self.inner.close();
    }
}

/// Rejects every request.
struct Refusing;

impl Transport for Refusing {
    fn uri(&self) -> String {
        "refusing:".to_owned()
    }

    fn request(&self, frame: Frame) -> SmResult<Frame> {
        Ok(frame.error_with_code("E_DENIED", "go away"))
    }

    fn drain_notifications(&self) -> Vec<Frame> {
        Vec::new()
    }

    fn close(&self) {}
}

struct Mute;

impl Transport for Mute {
    fn uri(&self) -> String {
        "mute:".to_owned()
    }

    fn request(&self, frame: Frame) -> SmResult<Frame> {
        Ok(frame.done())
    }

    fn drain_notifications(&self) -> Vec<Frame> {
        Vec::new()
    }

    fn close(&self) {}
}

#[test]
fn builtin_session_registers_its_managers() {
    let session = builtin_session();
    assert!(session.is_alive());
    assert_eq!(session.uri(), "builtin:");
    assert_eq!(session.number_of_processes(), 1);
    assert_ne!(session.client_id(), 0);

    assert!(session.remote_object(GlobalId::PROXY_MANAGER).is_some());
    assert!(session.remote_object(GlobalId::COLLABORATION_MANAGER).is_some());
    assert_eq!(session.collaboration_manager().number_of_connected_clients(), 1);
    assert!(session.collaboration_manager().is_master());
    assert!(session.definition_manager().has_definition("sources", "SphereSource"));
}

#[test]
fn sessions_get_distinct_ids() {
    let first = builtin_session();
    let second = builtin_session();
    assert_ne!(first.id(), second.id());
    assert!(first.ptr_eq(&first.clone()));
    assert!(!first.ptr_eq(&second));
    assert!(first.downgrade().upgrade().expect("alive").ptr_eq(&first));
}

#[test]
fn handshake_errors_are_reported() {
    let refused = Session::with_transport(Box::new(Refusing), "eve", SessionConfig::default());
    assert!(matches!(refused, Err(SmError::Remote(message)) if message == "go away"));

    let mute = Session::with_transport(Box::new(Mute), "eve", SessionConfig::default());
    assert!(matches!(mute, Err(SmError::UnexpectedReply(call)) if call == SYSCALL_HELLO));
}

#[test]
fn connect_refuses_reverse_urls() {
    let config = SessionConfig {
        server_url: ServerUrl::ReverseTcp { port: 11111 },
        ..SessionConfig::default()
    };
    assert!(matches!(Session::connect(config, "eve"), Err(SmError::Config(_))));

    let builtin = Session::connect(SessionConfig { num_processes: 3, ..SessionConfig::default() }, "eve")
        .expect("builtin connection");
    assert_eq!(builtin.number_of_processes(), 3);
}

#[test]
fn ids_come_from_one_server_wide_sequence() {
    let (_server, a, b) = collaborating_sessions();
    let first = a.reserve_global_id().expect("id");
    let second = a.reserve_global_id().expect("id");
    assert_eq!(second.get(), first.get() + 1);
    assert!(first.get() > GlobalId::RESERVED_MAX);

    let other = b.reserve_global_id().expect("id");
    assert!(other.get() >= first.get() + a.config().id_block_size);
}

#[test]
fn claimed_ids_are_never_reserved_again() {
    let server = ServerCore::new(1).shared();
    let a = Session::builtin_with(&server, "alice").expect("session");
    a.claim_global_id(GlobalId::new(5000)).expect("claim");

    let b = Session::builtin_with(&server, "bob").expect("session");
    assert!(b.reserve_global_id().expect("id").get() > 5000);
}

#[test]
fn closed_sessions_refuse_remote_calls() {
    let server = ServerCore::new(1).shared();
    let session = Session::builtin_with(&server, "solo").expect("session");
    assert_eq!(server::lock(&server).number_of_clients(), 1);

    session.close();
    session.close();
    assert!(!session.is_alive());
    assert_eq!(server::lock(&server).number_of_clients(), 0);
    assert!(matches!(session.pull_state(GlobalId::PROXY_MANAGER, Location::DATA_SERVER), Err(SmError::TransportClosed)));
}

#[test]
fn dropping_the_last_handle_disconnects() {
    let server = ServerCore::new(1).shared();
    let session = Session::builtin_with(&server, "solo").expect("session");
    let weak = session.downgrade();
    drop(session);
    assert!(weak.upgrade().is_none());
    assert_eq!(server::lock(&server).number_of_clients(), 0);
}

#[test]
fn remote_calls_are_bracketed_by_progress() {
    let session = builtin_session();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    session.progress().connect(move |progress| sink.borrow_mut().push(progress.clone()));

    let id = session.reserve_global_id().expect("id");
    assert!(id.is_set());
    assert_eq!(
        *seen.borrow(),
        vec![
            Progress::Prepare { call: SYSCALL_RESERVE_IDS.to_owned() },
            Progress::Cleanup { call: SYSCALL_RESERVE_IDS.to_owned() },
        ]
    );
    assert!(!session.is_in_remote_call());
}

#[test]
fn nested_remote_calls_are_refused() {
    let session = builtin_session();
    let weak = session.downgrade();
    let nested = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&nested);
    session.progress().connect(move |progress| {
        if let (Progress::Prepare { .. }, Some(session)) = (progress, weak.upgrade()) {
            if sink.borrow().is_none() {
                *sink.borrow_mut() = Some(session.pull_state(GlobalId::PROXY_MANAGER, Location::DATA_SERVER));
            }
        }
    });

    session.remote_plugins().expect("outer call succeeds");
    assert!(matches!(nested.borrow().as_ref(), Some(Err(SmError::ReentrantRemoteCall(_)))));
}

#[test]
fn pulling_an_unknown_object_is_a_remote_error() {
    let session = builtin_session();
    let result = session.pull_state(GlobalId::new(4242), Location::DATA_SERVER);
    assert!(matches!(result, Err(SmError::Remote(message)) if message.contains("4242")));
}

#[test]
fn notifications_are_filtered_before_applying() {
    let server = ServerCore::new(1).shared();
    let queued = Rc::new(RefCell::new(Vec::new()));
    let transport = Injecting { inner: BuiltinTransport::attach(&server), queued: Rc::clone(&queued) };
    let session = Session::with_transport(Box::new(transport), "solo", SessionConfig::default()).expect("session");
    assert_eq!(session.uri(), "test:");
    session.process_notifications();

    let writer = Session::builtin_with(&server, "writer").expect("writer");
    assert_eq!(session.process_notifications(), 1);

    let source = sphere(&writer);
    writer.proxy_manager().register_proxy("sources", "S", &source);
    let registration = server::lock(&server)
        .object_state(GlobalId::PROXY_MANAGER.get())
        .cloned()
        .expect("registration on server");
    queued.borrow_mut().extend([
        Frame::notify("session:other").with_state(registration),
        Frame::notify(SYSCALL_CHANGED),
        Frame::notify(SYSCALL_CHANGED).with_state(StateMessage::addressed(9999, 1)),
    ]);
    assert_eq!(session.process_notifications(), 1);
    assert!(session.proxy_manager().proxy("sources", "S").is_some());

    let stale = StateMessage::addressed(GlobalId::PROXY_MANAGER.get(), 1)
        .with_body(StateBody::Registration(RegistrationState::default()));
    queued.borrow_mut().push(Frame::notify(SYSCALL_CHANGED).with_state(stale));
    assert_eq!(session.process_notifications(), 1);
    assert!(session.proxy_manager().proxy("sources", "S").is_none());
    assert!(server::lock(&server).object_state(GlobalId::PROXY_MANAGER.get()).is_some_and(|s| s
        .registration()
        .is_some_and(|r| !r.proxies.is_empty())));
}

#[test]
fn applying_notifications_does_not_push_back() {
    let (server, a, b) = collaborating_sessions();
    let source = sphere(&a);
    a.proxy_manager().register_proxy("sources", "S", &source);
    b.process_notifications();

    let mirrored = b.proxy_manager().proxy("sources", "S").expect("mirrored");
    assert_eq!(mirrored.global_id(), source.global_id());
    assert!(!b.is_processing_remote_notification());
    assert_eq!(a.process_notifications(), 0);
    assert_eq!(server::lock(&server).number_of_clients(), 2);
}
