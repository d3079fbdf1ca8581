use super::*;

use frames::{CollaborationNotice, FRAME_CODE, FRAME_MESSAGE, ProxyEntry, RegistrationState, Status};

use crate::location::Location;

struct Client {
    id: u32,
    inbox: UnboundedReceiver<Frame>,
}

impl Client {
    fn attach(core: &mut ServerCore) -> Self {
        let (tx, inbox) = unbounded_channel();
        Self { id: core.attach_client(tx), inbox }
    }

    fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.inbox.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

fn push(core: &mut ServerCore, client: u32, state: StateMessage) -> Frame {
    core.handle(client, Frame::request(SYSCALL_PUSH).with_state(state))
}

fn pull(core: &mut ServerCore, client: u32, id: u32) -> Frame {
    core.handle(client, Frame::request(SYSCALL_PULL).with_state(StateMessage::addressed(id, 1)))
}

fn proxy_message(id: u32, properties: Vec<PropertyState>) -> StateMessage {
    StateMessage { xml_group: "sources".into(), xml_name: "SphereSource".into(), ..StateMessage::addressed(id, 1) }
        .with_body(StateBody::Proxy(ProxyState { properties, sub_proxies: Vec::new() }))
}

fn doubles(name: &str, values: &[f64]) -> PropertyState {
    PropertyState { name: name.to_owned(), doubles: values.to_vec(), ..PropertyState::default() }
}

fn notice(kind: NoticeKind, client: u32, text: &str) -> StateMessage {
    let notice = CollaborationNotice { kind: kind.into(), client, text: text.to_owned(), ..CollaborationNotice::default() };
    StateMessage::addressed(GlobalId::COLLABORATION_MANAGER.get(), 1)
        .with_body(StateBody::Collaboration(CollaborationState { kind: Some(CollaborationKind::Notice(notice)) }))
}

fn roster(frame: &Frame) -> RosterSnapshot {
    match frame.state.as_ref().and_then(|s| s.collaboration()).and_then(|c| c.kind.clone()) {
        Some(CollaborationKind::Roster(roster)) => roster,
        _ => panic!("expected a roster in {frame:?}"),
    }
}

const CONE_CONFIGURATION: &str = r#"<ServerManagerConfiguration>
  <ProxyGroup name="sources">
    <SourceProxy name="Cone" class="vtkConeSource">
      <IntVectorProperty name="Resolution" command="SetResolution" number_of_elements="1" default_values="6"/>
    </SourceProxy>
  </ProxyGroup>
</ServerManagerConfiguration>"#;

#[test]
fn first_client_is_master_until_it_leaves() {
    let mut core = ServerCore::new(1);
    let mut first = Client::attach(&mut core);
    let mut second = Client::attach(&mut core);
    assert_eq!(core.master(), first.id);
    assert_eq!(core.number_of_clients(), 2);

    core.detach_client(first.id);
    core.detach_client(first.id);
    assert_eq!(core.master(), second.id);
    assert_eq!(core.number_of_clients(), 1);

    let notified = second.drain();
    assert_eq!(notified.len(), 1);
    assert_eq!(roster(&notified[0]).master, second.id);
    assert!(first.drain().is_empty());
}

#[test]
fn hello_names_the_client_and_tells_the_others() {
    let mut core = ServerCore::new(4);
    let mut alice = Client::attach(&mut core);
    let mut bob = Client::attach(&mut core);

    let reply = core.handle(bob.id, Frame::request(SYSCALL_HELLO).with_data("user", "bob"));
    assert_eq!(reply.status, Status::Done);
    assert_eq!(reply.data_u32("client"), Some(bob.id));
    assert_eq!(reply.data_u32("processes"), Some(4));

    assert!(bob.drain().is_empty());
    let notified = alice.drain();
    assert_eq!(notified.len(), 1);
    assert_eq!(notified[0].syscall, SYSCALL_CHANGED);
    let users = roster(&notified[0]).users;
    assert_eq!(users.iter().find(|u| u.id == bob.id).map(|u| u.name.as_str()), Some("bob"));
    assert_eq!(users.iter().find(|u| u.id == alice.id).map(|u| u.name.clone()), Some(format!("User {}", alice.id)));
}

#[test]
fn ids_are_handed_out_in_blocks() {
    let mut core = ServerCore::new(1);
    let client = Client::attach(&mut core);

    let first = core.handle(client.id, Frame::request(SYSCALL_RESERVE_IDS).with_data("count", 10));
    assert_eq!(first.data_u32("first"), Some(GlobalId::RESERVED_MAX + 1));
    assert_eq!(first.data_u32("count"), Some(10));

    let second = core.handle(client.id, Frame::request(SYSCALL_RESERVE_IDS).with_data("count", 0));
    assert_eq!(second.data_u32("first"), Some(GlobalId::RESERVED_MAX + 11));
    assert_eq!(second.data_u32("count"), Some(1));
}

#[test]
fn claimed_ids_move_the_sequence_forward() {
    let mut core = ServerCore::new(1);
    let client = Client::attach(&mut core);

    let claimed = core.handle(client.id, Frame::request(SYSCALL_CLAIM_ID).with_data("id", 700));
    assert_eq!(claimed.status, Status::Done);
    core.handle(client.id, Frame::request(SYSCALL_CLAIM_ID).with_data("id", 300));

    let block = core.handle(client.id, Frame::request(SYSCALL_RESERVE_IDS).with_data("count", 1));
    assert_eq!(block.data_u32("first"), Some(701));

    let missing = core.handle(client.id, Frame::request(SYSCALL_CLAIM_ID));
    assert_eq!(missing.status, Status::Error);
    assert_eq!(missing.data_str(FRAME_CODE), Some("E_BAD_REQUEST"));
}

#[test]
fn the_id_space_never_wraps_or_reaches_reserved_ids() {
    let mut core = ServerCore::new(1);
    let client = Client::attach(&mut core);

    let reserved = core.handle(client.id, Frame::request(SYSCALL_CLAIM_ID).with_data("id", 2));
    assert_eq!(reserved.status, Status::Error);
    assert_eq!(reserved.data_str(FRAME_CODE), Some("E_BAD_REQUEST"));

    let last = core.handle(client.id, Frame::request(SYSCALL_CLAIM_ID).with_data("id", u32::MAX));
    assert_eq!(last.status, Status::Error);
    assert_eq!(last.data_str(FRAME_CODE), Some("E_IDS_EXHAUSTED"));

    let near = core.handle(client.id, Frame::request(SYSCALL_CLAIM_ID).with_data("id", u32::MAX - 1));
    assert_eq!(near.status, Status::Done);
    let block = core.handle(client.id, Frame::request(SYSCALL_RESERVE_IDS).with_data("count", 10));
    assert_eq!(block.status, Status::Error);
    assert_eq!(block.data_str(FRAME_CODE), Some("E_IDS_EXHAUSTED"));
    let again = core.handle(client.id, Frame::request(SYSCALL_RESERVE_IDS).with_data("count", 1));
    assert_eq!(again.data_str(FRAME_CODE), Some("E_IDS_EXHAUSTED"));
}

#[test]
fn pushes_are_stored_merged_and_relayed() {
    let mut core = ServerCore::new(1);
    let mut alice = Client::attach(&mut core);
    let mut bob = Client::attach(&mut core);

    let state = proxy_message(200, vec![doubles("Radius", &[0.5]), doubles("Center", &[0.0, 0.0, 0.0])]);
    assert_eq!(push(&mut core, alice.id, state).status, Status::Done);
    assert_eq!(push(&mut core, alice.id, proxy_message(200, vec![doubles("Radius", &[2.0])])).status, Status::Done);

    let stored = core.object_state(200).expect("stored");
    let properties = stored.proxy_state().expect("proxy body");
    assert_eq!(properties.property("Radius").map(|p| p.doubles.clone()), Some(vec![2.0]));
    assert_eq!(properties.property("Center").map(|p| p.doubles.clone()), Some(vec![0.0, 0.0, 0.0]));
    assert_eq!(stored.xml_name, "SphereSource");

    assert!(alice.drain().is_empty());
    let relayed = bob.drain();
    assert_eq!(relayed.len(), 2);
    assert_eq!(relayed[1].from.as_deref(), Some(alice.id.to_string().as_str()));
    assert_eq!(relayed[1].state.as_ref().map(|s| s.global_id), Some(200));
}

#[test]
fn non_proxy_bodies_replace_the_stored_state() {
    let mut core = ServerCore::new(1);
    let client = Client::attach(&mut core);
    let registration = |proxies| {
        StateMessage::addressed(GlobalId::PROXY_MANAGER.get(), Location::DATA_SERVER.bits())
            .with_body(StateBody::Registration(RegistrationState { version: 1, proxies, ..RegistrationState::default() }))
    };

    push(&mut core, client.id, registration(vec![ProxyEntry::new("sources", "A", 200)]));
    push(&mut core, client.id, registration(vec![ProxyEntry::new("sources", "B", 201)]));

    let stored = core.object_state(GlobalId::PROXY_MANAGER.get()).and_then(|s| s.registration().cloned());
    assert_eq!(stored.map(|r| r.proxies), Some(vec![ProxyEntry::new("sources", "B", 201)]));
}

#[test]
fn bad_requests_are_rejected() {
    let mut core = ServerCore::new(1);
    let client = Client::attach(&mut core);

    let no_id = push(&mut core, client.id, StateMessage::default());
    assert_eq!(no_id.data_str(FRAME_CODE), Some("E_BAD_REQUEST"));
    let no_state = core.handle(client.id, Frame::request(SYSCALL_PUSH));
    assert_eq!(no_state.data_str(FRAME_CODE), Some("E_BAD_REQUEST"));

    let unknown = core.handle(client.id, Frame::request("state:explode"));
    assert_eq!(unknown.status, Status::Error);
    assert_eq!(unknown.data_str(FRAME_CODE), Some("E_UNKNOWN_SYSCALL"));

    let missing = pull(&mut core, client.id, 4242);
    assert_eq!(missing.data_str(FRAME_CODE), Some("E_NOT_FOUND"));
    assert!(missing.data_str(FRAME_MESSAGE).is_some_and(|m| m.contains("4242")));
}

#[test]
fn relayed_notifications_are_not_stored() {
    let mut core = ServerCore::new(1);
    let alice = Client::attach(&mut core);
    let mut bob = Client::attach(&mut core);

    let reply =
        core.handle(alice.id, Frame::request(SYSCALL_NOTIFY_CLIENTS).with_state(proxy_message(300, Vec::new())));
    assert_eq!(reply.status, Status::Done);
    assert!(core.object_state(300).is_none());
    assert_eq!(bob.drain().len(), 1);
}

#[test]
fn collaboration_notices_update_the_roster() {
    let mut core = ServerCore::new(1);
    let alice = Client::attach(&mut core);
    let mut bob = Client::attach(&mut core);

    push(&mut core, alice.id, notice(NoticeKind::UpdateMasterUser, bob.id, ""));
    push(&mut core, alice.id, notice(NoticeKind::UpdateUserName, bob.id, "Robert"));
    push(&mut core, alice.id, notice(NoticeKind::UpdateMasterUser, 99, ""));
    assert_eq!(core.master(), bob.id);
    assert!(core.object_state(GlobalId::COLLABORATION_MANAGER.get()).is_none());
    assert_eq!(bob.drain().len(), 3);

    let snapshot = roster(&pull(&mut core, alice.id, GlobalId::COLLABORATION_MANAGER.get()));
    assert_eq!(snapshot.master, bob.id);
    assert_eq!(snapshot.users.iter().find(|u| u.id == bob.id).map(|u| u.name.as_str()), Some("Robert"));
}

#[test]
fn plugin_loader_registers_inline_configurations() {
    let mut core = ServerCore::new(1);
    let client = Client::attach(&mut core);

    let mut loader = proxy_message(400, vec![PropertyState {
        name: "ConfigurationXML".into(),
        texts: vec![CONE_CONFIGURATION.into()],
        ..PropertyState::default()
    }]);
    loader.server_class = PLUGIN_LOADER_CLASS.into();
    push(&mut core, client.id, loader);

    let stored = core.object_state(400).and_then(|s| s.proxy_state().cloned()).expect("loader state");
    assert_eq!(stored.property("Loaded").map(|p| p.integers.clone()), Some(vec![1]));

    let definitions = pull(&mut core, client.id, GlobalId::DEFINITION_MANAGER.get());
    let entries = definitions.state.as_ref().and_then(|s| s.definitions().cloned()).expect("definitions");
    assert_eq!(entries.definitions.len(), 1);
    assert_eq!((entries.definitions[0].group.as_str(), entries.definitions[0].name.as_str()), ("sources", "Cone"));
}

#[test]
fn plugin_loader_reports_files_it_cannot_load() {
    let mut core = ServerCore::new(1);
    let client = Client::attach(&mut core);

    let mut loader = proxy_message(401, vec![PropertyState {
        name: "FileName".into(),
        texts: vec!["/nonexistent/plugin.xml".into()],
        ..PropertyState::default()
    }]);
    loader.server_class = PLUGIN_LOADER_CLASS.into();
    push(&mut core, client.id, loader);

    let stored = core.object_state(401).and_then(|s| s.proxy_state().cloned()).expect("loader state");
    assert_eq!(stored.property("Loaded").map(|p| p.integers.clone()), Some(vec![0]));
    assert!(stored.property("ErrorString").is_some_and(|p| p.texts[0].contains("/nonexistent/plugin.xml")));
    assert!(core.plugins().is_empty());
}

#[test]
fn plugin_files_are_listed_once_loaded() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("Cones.xml");
    std::fs::write(&path, format!(r#"<Plugin name="Cones" version="1.2">{CONE_CONFIGURATION}</Plugin>"#))
        .expect("plugin file");

    let mut core = ServerCore::new(1);
    let client = Client::attach(&mut core);
    let mut loader = proxy_message(402, vec![PropertyState {
        name: "FileName".into(),
        texts: vec![path.display().to_string()],
        ..PropertyState::default()
    }]);
    loader.server_class = PLUGIN_LOADER_CLASS.into();
    push(&mut core, client.id, loader);

    let stored = core.object_state(402).and_then(|s| s.proxy_state().cloned()).expect("loader state");
    assert_eq!(stored.property("PluginName").map(|p| p.texts.clone()), Some(vec!["Cones".to_owned()]));
    assert_eq!(stored.property("PluginVersion").map(|p| p.texts.clone()), Some(vec!["1.2".to_owned()]));

    let listing = core.handle(client.id, Frame::request(SYSCALL_LIST_PLUGINS));
    let plugins: Vec<PluginInfo> =
        serde_json::from_value(listing.data.get("plugins").cloned().expect("listing")).expect("plugin infos");
    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0].name, "Cones");
    assert!(plugins[0].loaded);
}

#[test]
fn builtin_transport_detaches_once() {
    let server = ServerCore::new(1).shared();
    let transport = BuiltinTransport::attach(&server);
    assert_eq!(lock(&server).number_of_clients(), 1);
    assert_eq!(transport.uri(), "builtin:");

    let reply = transport.request(Frame::request(SYSCALL_HELLO)).expect("hello");
    assert_eq!(reply.data_u32("client"), Some(transport.client()));

    transport.close();
    transport.close();
    assert_eq!(lock(&server).number_of_clients(), 0);
    assert!(matches!(transport.request(Frame::request(SYSCALL_HELLO)), Err(crate::error::SmError::TransportClosed)));
    drop(transport);
    assert_eq!(lock(&server).number_of_clients(), 0);
}
