use super::*;

use crate::test_helpers::{builtin_session, shrink, sphere};

fn parsed(xml: &str) -> Property {
    let element = XmlElement::parse(xml).expect("valid xml");
    Property::from_xml(&element).expect("property element")
}

#[test]
fn definitions_become_typed_defaults() {
    let center = parsed(r#"<DoubleVectorProperty name="Center" command="SetCenter" number_of_elements="3" default_values="0 1 2"/>"#);
    assert_eq!(center.name(), "Center");
    assert_eq!(center.kind(), PropertyKind::Double);
    assert_eq!(center.command(), Some("SetCenter"));
    assert_eq!(center.declared_number_of_elements(), Some(3));
    assert_eq!(center.doubles(), vec![0.0, 1.0, 2.0]);
    assert_eq!(center.default_elements(), &Elements::Double(vec![0.0, 1.0, 2.0]));
    assert!(!center.is_modified());

    let sized = parsed(r#"<IntVectorProperty name="Extent" number_of_elements="2"/>"#);
    assert_eq!(sized.ints(), vec![0, 0]);

    let delimiter = parsed(r#"<StringVectorProperty name="Delimiter" number_of_elements="1" default_values="a b"/>"#);
    assert_eq!(delimiter.texts(), vec!["a b".to_owned()]);

    let info = parsed(r#"<StringVectorProperty name="Arrays" information_only="1" repeat_command="1"/>"#);
    assert!(info.is_information_only());
    assert!(info.is_repeatable());
    assert!(info.texts().is_empty());

    let bad = parsed(r#"<IntVectorProperty name="Broken" default_values="x"/>"#);
    assert!(bad.elements().is_empty());

    assert!(Property::from_xml(&XmlElement::new("OutputPort").with_attribute("name", "Output")).is_none());
    assert!(Property::from_xml(&XmlElement::new("IntVectorProperty")).is_none());
}

#[test]
fn documentation_hints_and_domains_are_kept() {
    let property = parsed(
        r#"<IntVectorProperty name="Mode" default_values="1">
             <Documentation>
               Picks a mode.
             </Documentation>
             <EnumerationDomain name="enum"><Entry text="A" value="1"/></EnumerationDomain>
             <Hints><NoDefault/></Hints>
           </IntVectorProperty>"#,
    );
    assert_eq!(property.documentation(), Some("Picks a mode."));
    assert!(property.hints().is_some_and(|h| h.child("NoDefault").is_some()));
    assert_eq!(property.domains().len(), 1);
    assert!(property.domain("enum").is_some());
    assert!(property.domain("range").is_none());
}

#[test]
fn setters_report_changes_and_mark_modified() {
    let radius = parsed(r#"<DoubleVectorProperty name="Radius" number_of_elements="1" default_values="0.5"/>"#);
    assert!(!radius.set_elements(Elements::Double(vec![0.5])));
    assert!(!radius.is_modified());

    assert!(radius.set_elements(Elements::Double(vec![2.0])));
    assert!(radius.is_modified());
    assert!(!radius.set_elements(Elements::Int(vec![2])));
    assert_eq!(radius.double(0), Some(2.0));

    radius.set_modified(false);
    assert!(radius.reset_to_default());
    assert_eq!(radius.double(0), Some(0.5));
    assert_eq!(radius.with_double(2, 7.0), Some(Elements::Double(vec![0.5, 0.0, 7.0])));
    assert_eq!(radius.with_int(0, 1), None);
}

#[test]
fn unchecked_values_shadow_until_the_next_set() {
    let mode = parsed(r#"<IntVectorProperty name="Mode" default_values="1"><BooleanDomain name="bool"/></IntVectorProperty>"#);
    assert!(mode.is_in_domain());

    mode.set_unchecked_elements(Elements::Int(vec![5]));
    assert_eq!(mode.unchecked_elements(), Elements::Int(vec![5]));
    assert_eq!(mode.int(0), Some(1));
    assert!(!mode.is_in_domain());

    mode.set_unchecked_elements(Elements::Text(vec!["no".into()]));
    assert_eq!(mode.unchecked_elements(), Elements::Int(vec![5]));

    mode.set_elements(Elements::Int(vec![0]));
    assert_eq!(mode.unchecked_elements(), Elements::Int(vec![0]));
    assert!(mode.is_in_domain());

    mode.set_unchecked_elements(Elements::Int(vec![1]));
    mode.clear_unchecked_elements();
    assert_eq!(mode.unchecked_elements(), Elements::Int(vec![0]));
}

#[test]
fn state_round_trip_leaves_the_property_clean() {
    let labels = parsed(r#"<StringVectorProperty name="Labels"/>"#);
    labels.set_elements(Elements::Text(vec!["x".into(), "y".into()]));
    let state = labels.to_state();
    assert_eq!(state.name, "Labels");
    assert_eq!(state.texts, vec!["x".to_owned(), "y".to_owned()]);

    let copy = parsed(r#"<StringVectorProperty name="Labels"/>"#);
    assert!(copy.load_state(&state, &ProxyLocator::default()));
    assert!(!copy.is_modified());
    assert_eq!(copy.texts(), labels.texts());
    assert!(!copy.load_state(&state, &ProxyLocator::default()));
}

#[test]
fn xml_elements_are_indexed() {
    let center = parsed(r#"<DoubleVectorProperty name="Center" number_of_elements="3" default_values="0.25 1 -3"/>"#);
    let saved = center.save_xml(GlobalId::new(321));
    assert_eq!(saved.attribute("id"), Some("321.Center"));
    assert_eq!(saved.attribute("number_of_elements"), Some("3"));
    let values: Vec<_> = saved.children_named("Element").filter_map(|e| e.attribute("value")).collect();
    assert_eq!(values, vec!["0.25", "1", "-3"]);

    let reordered = XmlElement::new("Property")
        .with_child(XmlElement::new("Element").with_attribute("index", 1).with_attribute("value", "9"))
        .with_child(XmlElement::new("Element").with_attribute("index", 0).with_attribute("value", "8"));
    assert!(center.load_xml(&reordered, &ProxyLocator::default()));
    assert_eq!(center.doubles(), vec![8.0, 9.0]);

    let garbage = XmlElement::new("Property")
        .with_child(XmlElement::new("Element").with_attribute("index", 0).with_attribute("value", "nan-ish"));
    assert!(!center.load_xml(&garbage, &ProxyLocator::default()));
    assert_eq!(center.doubles(), vec![8.0, 9.0]);
}

#[test]
fn proxy_references_travel_as_global_ids() {
    let session = builtin_session();
    let source = sphere(&session);
    let filter = shrink(&session, &source);
    let input = filter.property("Input").expect("input property");
    assert_eq!(input.kind(), PropertyKind::Input);
    assert!(Rc::ptr_eq(&input.proxies()[0], &source));

    let state = input.to_state();
    assert_eq!(state.proxies, vec![source.remote().global_id().get()]);
    assert_eq!(state.ports, vec![0]);

    let saved = input.save_xml(filter.remote().global_id());
    let child = saved.child("Proxy").expect("proxy child");
    assert_eq!(child.attribute_as::<u32>("value"), Some(source.remote().global_id().get()));
    assert_eq!(child.attribute("output_port"), Some("0"));

    let locator = ProxyLocator::for_session(&session);
    let copy = Property::new("Input", PropertyKind::Input);
    assert!(copy.load_xml(&saved, &locator));
    assert_eq!(copy.inputs(), vec![ProxyInput::new(Rc::clone(&source), 0)]);
    assert_eq!(Elements::Proxy(copy.inputs()).element_string(0), Some(source.remote().global_id().to_string()));

    let dangling = PropertyState { name: "Input".into(), proxies: vec![987_654], ports: vec![0], ..PropertyState::default() };
    assert!(copy.load_state(&dangling, &locator));
    assert!(copy.inputs().is_empty());
}
