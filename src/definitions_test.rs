use super::*;

use std::cell::Cell;

use crate::server::{self, ServerCore};

const EXTRA: &str = r#"<ServerManagerConfiguration>
  <ProxyGroup name="sources">
    <SourceProxy name="Cone" class="vtkConeSource">
      <IntVectorProperty name="Resolution" command="SetResolution" number_of_elements="1" default_values="6"/>
    </SourceProxy>
    <SourceProxy name="TallCone" base_proxygroup="sources" base_proxyname="Cone">
      <DoubleVectorProperty name="Height" command="SetHeight" number_of_elements="1" default_values="3"/>
    </SourceProxy>
  </ProxyGroup>
</ServerManagerConfiguration>"#;

fn counter(signal: &Signal<DefinitionsUpdated>) -> Rc<Cell<usize>> {
    let count = Rc::new(Cell::new(0));
    let sink = Rc::clone(&count);
    signal.connect(move |_| sink.set(sink.get() + 1));
    count
}

fn property_names(element: &XmlElement) -> Vec<&str> {
    element.children.iter().filter_map(|c| c.attribute("name")).collect()
}

#[test]
fn builtin_catalog_is_loaded() {
    let manager = ProxyDefinitionManager::with_builtin_definitions();
    assert!(manager.has_definition("sources", "SphereSource"));
    assert!(manager.has_definition("misc", "PluginLoader"));
    assert!(!manager.has_definition("sources", "Cone"));
    assert!(!manager.is_custom("sources", "SphereSource"));
    assert!(!manager.is_empty());
    assert_eq!(
        manager.groups(),
        vec!["filters", "misc", "representations", "sources", "views", "writers"]
    );
}

#[test]
fn configurations_merge_and_notify() {
    let manager = ProxyDefinitionManager::new();
    let updates = counter(&manager.updated);
    let registered = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&registered);
    manager.registered.connect(move |event| sink.borrow_mut().push(event.name.clone()));

    assert_eq!(manager.load_configuration_xml(EXTRA).expect("valid"), 2);
    assert_eq!(manager.len(), 2);
    assert_eq!(updates.get(), 1);
    assert_eq!(*registered.borrow(), vec!["Cone", "TallCone"]);

    assert!(matches!(manager.load_configuration_xml("<Plugin/>"), Err(SmError::MalformedXml(_))));
    assert!(manager.load_configuration_xml("<ServerManagerConfiguration>").is_err());
    assert_eq!(manager.load_configuration_xml("<ServerManagerConfiguration/>").expect("empty"), 0);
    assert_eq!(updates.get(), 1);
}

#[test]
fn inheritance_is_collapsed_and_cached() {
    let manager = ProxyDefinitionManager::new();
    manager.load_configuration_xml(EXTRA).expect("valid");

    let collapsed = manager.collapsed_proxy_definition("sources", "TallCone", None, true).expect("collapsed");
    assert_eq!(property_names(&collapsed), vec!["Resolution", "Height"]);
    assert_eq!(collapsed.attribute("class"), Some("vtkConeSource"));
    assert!(collapsed.attribute("base_proxyname").is_none());

    let again = manager.collapsed_proxy_definition("sources", "TallCone", None, true).expect("cached");
    assert!(Rc::ptr_eq(&collapsed, &again));

    manager.load_configuration_xml(EXTRA).expect("reload");
    let fresh = manager.collapsed_proxy_definition("sources", "TallCone", None, true).expect("recomputed");
    assert!(!Rc::ptr_eq(&collapsed, &fresh));
    assert!(manager.collapsed_proxy_definition("sources", "Missing", None, false).is_none());
}

#[test]
fn derived_properties_override_the_base() {
    let manager = ProxyDefinitionManager::with_builtin_definitions();
    let clip = manager.collapsed_proxy_definition("filters", "ClipClosedSurface", None, true).expect("collapsed");
    assert_eq!(clip.attribute("class"), Some("vtkPVClipClosedSurface"));
    let value = clip.child_with_name_attribute("Value").expect("value property");
    assert_eq!(value.attribute("default_values"), Some("0.5"));
    assert!(clip.child_with_name_attribute("ClipType").is_some());
    assert!(clip.child_with_name_attribute("GenerateFaces").is_some());
}

#[test]
fn sub_proxy_definitions_resolve_references() {
    let manager = ProxyDefinitionManager::with_builtin_definitions();
    let camera =
        manager.collapsed_proxy_definition("views", "RenderView", Some("ActiveCamera"), true).expect("sub-proxy");
    assert!(camera.child_with_name_attribute("CameraPosition").is_some());
    assert_eq!(camera.attribute("class"), Some("vtkCamera"));
    assert!(manager.collapsed_proxy_definition("views", "RenderView", Some("Nope"), false).is_none());
}

#[test]
fn iterators_are_sorted_snapshots() {
    let manager = ProxyDefinitionManager::with_builtin_definitions();
    let sources: Vec<String> = manager.single_group_iter("sources").collect();
    assert_eq!(sources, vec!["CSVReader", "LegacyVTKReader", "SphereSource", "Wavelet"]);

    let all = manager.iter();
    manager.load_configuration_xml(EXTRA).expect("valid");
    assert_eq!(all.clone().count(), all.count());
    assert_eq!(manager.iter().count(), manager.len());
    assert!(manager.iter().any(|(g, n)| g == "sources" && n == "Cone"));
}

#[test]
fn custom_definitions_cannot_shadow_builtins() {
    let manager = ProxyDefinitionManager::with_builtin_definitions();
    let custom = XmlElement::new("CompoundSourceProxy").with_attribute("name", "Pair");

    assert!(!manager.add_custom_proxy_definition("sources", "SphereSource", custom.clone()));
    assert!(manager.add_custom_proxy_definition("sources", "Pair", custom.clone()));
    assert!(manager.add_custom_proxy_definition("sources", "Pair", custom));
    assert!(manager.is_custom("sources", "Pair"));

    assert!(!manager.remove_custom_proxy_definition("sources", "SphereSource"));
    assert!(manager.remove_custom_proxy_definition("sources", "Pair"));
    assert!(!manager.has_definition("sources", "Pair"));
}

#[test]
fn custom_definitions_save_and_load() {
    let manager = ProxyDefinitionManager::with_builtin_definitions();
    manager.add_custom_proxy_definition("sources", "Pair", XmlElement::new("CompoundSourceProxy"));
    manager.add_custom_proxy_definition("filters", "Twice", XmlElement::new("CompoundSourceProxy"));
    let saved = manager.save_custom_proxy_definitions();
    assert_eq!(saved.children_named("CustomProxyDefinition").count(), 2);

    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    manager.registered.connect(move |event| sink.borrow_mut().push((event.name.clone(), event.registered)));
    manager.clear_custom_proxy_definitions();
    manager.clear_custom_proxy_definitions();
    assert!(!manager.has_definition("sources", "Pair"));
    assert_eq!(events.borrow().len(), 2);
    assert!(events.borrow().iter().all(|(_, registered)| !registered));

    let restored = ProxyDefinitionManager::new();
    assert_eq!(restored.load_custom_proxy_definitions(&saved), 2);
    assert!(restored.is_custom("filters", "Twice"));
}

#[test]
fn server_definitions_are_pulled_in() {
    let server = ServerCore::new(1).shared();
    let session = Session::builtin_with(&server, "solo").expect("session");
    let definitions = session.definition_manager();
    assert_eq!(definitions.synchronize_definitions(&session).expect("nothing new"), 0);

    let loader = StateMessage {
        server_class: crate::server::PLUGIN_LOADER_CLASS.into(),
        ..StateMessage::addressed(900, Location::DATA_SERVER.bits())
    }
    .with_body(frames::StateBody::Proxy(frames::ProxyState {
        properties: vec![frames::PropertyState {
            name: "ConfigurationXML".into(),
            texts: vec![EXTRA.into()],
            ..frames::PropertyState::default()
        }],
        sub_proxies: Vec::new(),
    }));
    let reply = server::lock(&server).handle(99, frames::Frame::request(crate::session::SYSCALL_PUSH).with_state(loader));
    assert_eq!(reply.status, frames::Status::Done);

    let updates = counter(&definitions.updated);
    assert_eq!(definitions.synchronize_definitions(&session).expect("pulled"), 2);
    assert!(definitions.has_definition("sources", "TallCone"));
    assert_eq!(updates.get(), 1);
    assert_eq!(definitions.synchronize_definitions(&session).expect("unchanged"), 0);
}
