use super::*;

use std::cell::Cell;

use crate::test_helpers::{builtin_session, sphere};

fn link_events(manager: &GlobalPropertiesManager) -> Rc<RefCell<Vec<(String, String, bool)>>> {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    manager.link_modified.connect(move |change| {
        sink.borrow_mut().push((change.global_name.clone(), change.property.clone(), change.added));
    });
    events
}

#[test]
fn default_palette_defines_colors() {
    let palette = GlobalPropertiesManager::with_default_palette();
    let names = palette.global_property_names();
    assert_eq!(names.first().map(String::as_str), Some("ForegroundColor"));
    assert!(names.contains(&"SelectionColor".to_owned()));
    assert_eq!(palette.global_property("BackgroundColor"), Some(Elements::Double(vec![0.32, 0.34, 0.43])));
    assert!(palette.global_property("NoSuchColor").is_none());
}

#[test]
fn linking_applies_the_value_immediately() {
    let session = builtin_session();
    let palette = GlobalPropertiesManager::with_default_palette();
    let events = link_events(&palette);
    let source = sphere(&session);

    assert!(palette.set_global_property_link("ForegroundColor", &source, "Center"));
    assert!(!palette.set_global_property_link("ForegroundColor", &source, "Center"));
    assert!(!palette.set_global_property_link("NoSuchColor", &source, "Center"));

    assert_eq!(source.property("Center").expect("center").doubles(), vec![1.0, 1.0, 1.0]);
    assert_eq!(palette.global_property_name_for(&source, "Center").as_deref(), Some("ForegroundColor"));
    assert_eq!(*events.borrow(), vec![("ForegroundColor".to_owned(), "Center".to_owned(), true)]);
}

#[test]
fn setting_a_value_updates_linked_properties() {
    let session = builtin_session();
    let palette = GlobalPropertiesManager::with_default_palette();
    let representation =
        session.proxy_manager().new_proxy("representations", "GeometryRepresentation", None).expect("representation");
    let source = sphere(&session);
    palette.set_global_property_link("SurfaceColor", &representation, "DiffuseColor");
    palette.set_global_property_link("SurfaceColor", &source, "Center");

    let changes = Rc::new(Cell::new(0));
    let counter = Rc::clone(&changes);
    palette.value_changed.connect(move |_| counter.set(counter.get() + 1));

    let red = Elements::Double(vec![1.0, 0.0, 0.0]);
    assert!(palette.set_global_property("SurfaceColor", red.clone()));
    assert!(palette.set_global_property("SurfaceColor", red.clone()));
    assert!(!palette.set_global_property("NoSuchColor", red.clone()));

    assert_eq!(changes.get(), 1);
    assert_eq!(representation.property("DiffuseColor").expect("color").elements(), red);
    assert_eq!(source.property("Center").expect("center").elements(), red);
    assert_eq!(palette.global_property_links("SurfaceColor").len(), 2);
}

#[test]
fn a_property_follows_one_global_at_a_time() {
    let session = builtin_session();
    let palette = GlobalPropertiesManager::with_default_palette();
    let source = sphere(&session);
    palette.set_global_property_link("ForegroundColor", &source, "Center");
    let events = link_events(&palette);

    assert!(palette.set_global_property_link("EdgeColor", &source, "Center"));
    assert_eq!(palette.global_property_name_for(&source, "Center").as_deref(), Some("EdgeColor"));
    assert!(palette.global_property_links("ForegroundColor").is_empty());
    assert_eq!(
        *events.borrow(),
        vec![("ForegroundColor".to_owned(), "Center".to_owned(), false), ("EdgeColor".to_owned(), "Center".to_owned(), true)]
    );

    palette.set_global_property("ForegroundColor", Elements::Double(vec![0.0, 0.0, 0.0]));
    assert_eq!(source.property("Center").expect("center").doubles(), vec![0.0, 0.0, 0.5]);
}

#[test]
fn removing_links_and_dropped_proxies() {
    let session = builtin_session();
    let palette = GlobalPropertiesManager::with_default_palette();
    let kept = sphere(&session);
    palette.set_global_property_link("ForegroundColor", &kept, "Center");
    {
        let dropped = sphere(&session);
        palette.set_global_property_link("ForegroundColor", &dropped, "Center");
        assert_eq!(palette.global_property_links("ForegroundColor").len(), 2);
    }
    assert_eq!(palette.global_property_links("ForegroundColor").len(), 1);

    assert!(palette.remove_global_property_link("ForegroundColor", &kept, "Center"));
    assert!(!palette.remove_global_property_link("ForegroundColor", &kept, "Center"));
    assert!(palette.global_property_links("ForegroundColor").is_empty());
}

#[test]
fn xml_round_trip_restores_values_and_links() {
    let session = builtin_session();
    let source = sphere(&session);
    session.proxy_manager().register_proxy("sources", "S", &source);

    let palette = GlobalPropertiesManager::new();
    palette.define_global_property("Tint", Elements::Double(vec![0.25, 0.5, 0.75]));
    palette.define_global_property("Label", Elements::Text(vec!["title".to_owned()]));
    palette.define_global_property("Width", Elements::Int(vec![3]));
    palette.set_global_property_link("Tint", &source, "Center");

    let saved = palette.save_xml("Custom");
    assert_eq!(saved.attribute("name"), Some("Custom"));
    assert_eq!(saved.children_named("GlobalProperty").count(), 3);
    assert_eq!(saved.children_named("Link").count(), 1);

    source.set_doubles("Center", &[0.0, 0.0, 0.0]);
    let restored = GlobalPropertiesManager::new();
    restored.load_xml(&saved, &ProxyLocator::for_session(&session));

    assert_eq!(restored.global_property("Tint"), Some(Elements::Double(vec![0.25, 0.5, 0.75])));
    assert_eq!(restored.global_property("Label"), Some(Elements::Text(vec!["title".to_owned()])));
    assert_eq!(restored.global_property("Width"), Some(Elements::Int(vec![3])));
    assert_eq!(restored.global_property_name_for(&source, "Center").as_deref(), Some("Tint"));
    assert_eq!(source.property("Center").expect("center").doubles(), vec![0.25, 0.5, 0.75]);
}

#[test]
fn registry_signals_registration_changes() {
    let registry = GlobalPropertiesRegistry::new();
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    registry.registered.connect(move |name| sink.borrow_mut().push(format!("+{name}")));
    let sink = Rc::clone(&events);
    registry.unregistered.connect(move |name| sink.borrow_mut().push(format!("-{name}")));

    let palette = GlobalPropertiesManager::with_default_palette();
    registry.register("ColorPalette", &palette);
    registry.register("Fonts", &GlobalPropertiesManager::new());

    assert_eq!(registry.len(), 2);
    assert_eq!(registry.names(), vec!["ColorPalette".to_owned(), "Fonts".to_owned()]);
    assert!(Rc::ptr_eq(&registry.manager("ColorPalette").expect("palette"), &palette));

    assert!(registry.unregister("Fonts"));
    assert!(!registry.unregister("Fonts"));
    assert_eq!(*events.borrow(), vec!["+ColorPalette", "+Fonts", "-Fonts"]);
    assert!(!registry.is_empty());
}
