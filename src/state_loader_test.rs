use super::*;

use frames::LinkDirection;

use crate::property::Elements;
use crate::session::Session;
use crate::test_helpers::{builtin_session, shrink, sphere};

/// A sphere feeding a shrink filter, only the filter registered.
fn pipeline(session: &Session) -> (ProxyRef, ProxyRef) {
    let source = sphere(session);
    source.set_double("Radius", 0, 2.5);
    let filter = shrink(session, &source);
    session.proxy_manager().register_proxy("filters", "Shrink1", &filter);
    (source, filter)
}

fn parse(text: &str) -> XmlElement {
    XmlElement::parse(text).expect("valid xml")
}

#[test]
fn saving_follows_references_out_of_the_registrations() {
    let session = builtin_session();
    let (source, filter) = pipeline(&session);
    let pxm = session.proxy_manager();
    pxm.register_custom_proxy_definition("sources", "Pair", XmlElement::new("CompoundSourceProxy"));

    let root = save_state(&pxm, None);
    assert_eq!(root.name, "ServerManagerApplication");
    assert_eq!(root.attribute("version"), Some("5.11.0"));
    let state = state_element(&root).expect("state element");

    let mut ids: Vec<u32> = state.children_named("Proxy").filter_map(|p| p.attribute_as("id")).collect();
    ids.sort_unstable();
    let mut expected = vec![source.global_id().get(), filter.global_id().get()];
    expected.sort_unstable();
    assert_eq!(ids, expected);

    let collections: Vec<_> = state.children_named("ProxyCollection").collect();
    assert_eq!(collections.len(), 1);
    assert_eq!(collections[0].attribute("name"), Some("filters"));
    assert_eq!(collections[0].child("Item").and_then(|i| i.attribute("name")), Some("Shrink1"));
    assert!(state.child("CustomProxyDefinitions").is_some());
    assert!(state.child("Links").is_none());
    assert!(state.child("GlobalPropertiesManagers").is_none());
}

#[test]
fn loading_rebuilds_the_pipeline_in_another_session() {
    let session = builtin_session();
    let (source, filter) = pipeline(&session);
    let link = Link::proxy_link();
    link.add_linked_proxy(&filter, LinkDirection::Input);
    link.add_linked_proxy(&source, LinkDirection::Output);
    session.proxy_manager().register_link("Follow", link);
    let saved = session.proxy_manager().save_xml_state();

    let other = builtin_session();
    let pxm = other.proxy_manager();
    pxm.load_xml_state(&saved, None, false).expect("state loads");

    assert_eq!(pxm.number_of_real_registrations(), 1);
    let rebuilt = pxm.proxy("filters", "Shrink1").expect("registered filter");
    let inputs = rebuilt.property("Input").expect("input property").proxies();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].xml_name(), "SphereSource");
    assert_eq!(inputs[0].double_element("Radius", 0), Some(2.5));

    let restored = pxm.registered_link("Follow").expect("link restored");
    assert_eq!(restored.number_of_members(), 2);
    assert_eq!(restored.kind(), LinkKind::Proxy);
}

#[test]
fn original_ids_are_kept_when_asked() {
    let session = builtin_session();
    let (_source, filter) = pipeline(&session);
    let saved = session.proxy_manager().save_xml_state();

    let other = builtin_session();
    let pxm = other.proxy_manager();
    pxm.load_xml_state(&saved, None, true).expect("state loads");
    let rebuilt = pxm.proxy("filters", "Shrink1").expect("registered filter");
    assert_eq!(rebuilt.global_id(), filter.global_id());
    assert!(other.remote_object(filter.global_id()).is_some());
}

#[test]
fn out_of_range_document_ids_get_fresh_ones() {
    let session = builtin_session();
    let mut root = parse(
        r#"<ServerManagerState version="5.11">
             <Proxy group="sources" type="SphereSource" id="4294967295"/>
             <Proxy group="sources" type="SphereSource" id="2"/>
             <ProxyCollection name="sources">
               <Item id="4294967295" name="Last"/>
               <Item id="2" name="Reserved"/>
             </ProxyCollection>
           </ServerManagerState>"#,
    );
    load_state(&session.proxy_manager(), &mut root, None, true, None).expect("loads");

    let pxm = session.proxy_manager();
    let last = pxm.proxy("sources", "Last").expect("registered");
    let reserved = pxm.proxy("sources", "Reserved").expect("registered");
    for proxy in [&last, &reserved] {
        assert!(proxy.global_id().get() > GlobalId::RESERVED_MAX);
        assert_ne!(proxy.global_id().get(), u32::MAX);
    }
    assert_ne!(last.global_id(), reserved.global_id());
    assert!(sphere(&session).global_id().get() > GlobalId::RESERVED_MAX);
}

#[test]
fn global_property_links_survive_a_round_trip() {
    let session = builtin_session();
    let source = sphere(&session);
    session.proxy_manager().register_proxy("sources", "Sphere1", &source);
    let globals = Rc::new(GlobalPropertiesRegistry::new());
    let palette = GlobalPropertiesManager::with_default_palette();
    globals.register("ColorPalette", &palette);
    assert!(palette.set_global_property_link("ForegroundColor", &source, "Center"));
    session.proxy_manager().set_global_properties(Some(Rc::clone(&globals)));
    let saved = session.proxy_manager().save_xml_state();
    assert!(state_element(&saved).and_then(|s| s.child("GlobalPropertiesManagers")).is_some());

    let other = builtin_session();
    let registry = Rc::new(GlobalPropertiesRegistry::new());
    other.proxy_manager().set_global_properties(Some(Rc::clone(&registry)));
    other.proxy_manager().load_xml_state(&saved, None, false).expect("state loads");

    let manager = registry.manager("ColorPalette").expect("manager created");
    let rebuilt = other.proxy_manager().proxy("sources", "Sphere1").expect("sphere");
    assert_eq!(manager.global_property_name_for(&rebuilt, "Center").as_deref(), Some("ForegroundColor"));
    assert_eq!(manager.global_property("ForegroundColor"), Some(Elements::Double(vec![1.0, 1.0, 1.0])));
}

#[test]
fn legacy_documents_are_upgraded_before_loading() {
    let session = builtin_session();
    let mut root = parse(
        r#"<ServerManagerState version="0.9">
             <Proxy group="sources" type="SphereSource" id="50"/>
             <ProxyCollection name="displays"><Item id="50" name="Old"/></ProxyCollection>
           </ServerManagerState>"#,
    );
    load_state(&session.proxy_manager(), &mut root, None, false, None).expect("loads");
    assert_eq!(root.attribute("version"), Some("5.11.0"));
    assert!(session.proxy_manager().proxy("representations", "Old").is_some());
    assert!(session.proxy_manager().proxy("displays", "Old").is_none());
}

#[test]
fn unresolvable_items_are_skipped() {
    let session = builtin_session();
    let mut root = parse(
        r#"<ServerManagerState version="5.11">
             <Proxy group="sources" type="SphereSource" id="60"/>
             <Proxy group="sources" type="NoSuchSource" id="61"/>
             <ProxyCollection name="sources">
               <Item id="60" name="Kept"/>
               <Item id="61" name="Unknown"/>
               <Item id="62" name="Missing"/>
               <Item name="NoId"/>
             </ProxyCollection>
           </ServerManagerState>"#,
    );
    load_state(&session.proxy_manager(), &mut root, None, false, None).expect("loads");
    let pxm = session.proxy_manager();
    assert_eq!(pxm.number_of_proxies("sources"), 1);
    assert!(pxm.proxy("sources", "Kept").is_some());
}

#[test]
fn bad_documents_are_rejected() {
    let session = builtin_session();
    let pxm = session.proxy_manager();

    let mut newer = parse(r#"<ServerManagerState version="7.0"/>"#);
    assert!(matches!(
        load_state(&pxm, &mut newer, None, false, None),
        Err(SmError::UnsupportedStateVersion(_))
    ));

    let mut stateless = parse("<Other/>");
    assert!(matches!(load_state(&pxm, &mut stateless, None, false, None), Err(SmError::MalformedXml(_))));
    assert_eq!(pxm.number_of_real_registrations(), 0);
}
