use super::*;

use crate::test_helpers::builtin_session;

fn factory_for(session: &Session) -> ReaderFactory {
    let factory = ReaderFactory::new();
    factory.update_available_readers(&session.definition_manager());
    factory
}

#[test]
fn finds_hinted_readers_in_sources() {
    let session = builtin_session();
    let factory = factory_for(&session);

    assert_eq!(factory.number_of_registered_prototypes(), 2);
    assert_eq!(factory.supported_file_types(), "Delimited Text Files(*.csv *.txt);;Legacy VTK Files(*.vtk)");
}

#[test]
fn extension_match_is_case_insensitive_and_needs_a_dot() {
    let entry = ReaderEntry {
        group: "sources".into(),
        name: "CSVReader".into(),
        extensions: vec!["csv".into(), "txt".into()],
        description: "Delimited Text Files".into(),
    };
    assert!(entry.accepts("data.csv"));
    assert!(entry.accepts("/tmp/DATA.TXT"));
    assert!(!entry.accepts("datacsv"));
    assert!(!entry.accepts(".csv"));
    assert!(!entry.accepts("data.csv.gz"));
}

#[test]
fn creates_reader_with_file_name() {
    let session = builtin_session();
    let factory = factory_for(&session);

    assert!(factory.can_read_file("points.csv", &session));
    let reader = factory.create_reader("points.csv", &session).expect("csv reader");
    assert_eq!(reader.xml_name(), "CSVReader");
    assert_eq!(reader.text_element("FileName", 0).as_deref(), Some("points.csv"));
    assert!(session.proxy_manager().proxy_name_of("sources", &reader).is_none());

    let legacy = factory.create_reader("mesh.VTK", &session).expect("legacy reader");
    assert_eq!(legacy.xml_name(), "LegacyVTKReader");
}

#[test]
fn unknown_extension_has_no_reader() {
    let session = builtin_session();
    let factory = factory_for(&session);

    assert!(factory.readers_for_file("image.png").is_empty());
    assert!(!factory.can_read_file("image.png", &session));
    assert!(factory.create_reader("image.png", &session).is_none());
}

#[test]
fn prototypes_without_hint_are_refused() {
    let session = builtin_session();
    let definitions = session.definition_manager();
    let factory = ReaderFactory::new();

    assert!(!factory.register_prototype(&definitions, "sources", "SphereSource"));
    assert!(!factory.register_prototype(&definitions, "sources", "Missing"));
    assert!(factory.register_prototype(&definitions, "sources", "CSVReader"));
    assert!(factory.unregister_prototype("sources", "CSVReader"));
    assert_eq!(factory.number_of_registered_prototypes(), 0);
}

#[test]
fn extra_groups_are_scanned() {
    let session = builtin_session();
    let definitions = session.definition_manager();
    definitions
        .load_configuration_xml(
            r#"<ServerManagerConfiguration><ProxyGroup name="internal_sources">
                 <SourceProxy name="PNGReader" class="vtkPNGReader">
                   <StringVectorProperty name="FileName" command="SetFileName" number_of_elements="1"/>
                   <Hints><ReaderFactory extensions=".png" file_description="PNG Images"/></Hints>
                 </SourceProxy>
               </ProxyGroup></ServerManagerConfiguration>"#,
        )
        .expect("configuration");

    let factory = factory_for(&session);
    assert!(factory.readers_for_file("a.png").is_empty());

    factory.add_group("internal_sources");
    factory.update_available_readers(&definitions);
    let found = factory.readers_for_file("a.png");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].extensions, vec!["png".to_owned()]);
    assert_eq!(factory.groups(), vec!["internal_sources".to_owned(), "sources".to_owned()]);

    factory.remove_group("internal_sources");
    factory.update_available_readers(&definitions);
    assert!(factory.readers_for_file("a.png").is_empty());
}

#[test]
fn watch_rescans_on_definition_changes() {
    let session = builtin_session();
    let definitions = session.definition_manager();
    let factory = Rc::new(ReaderFactory::new());
    factory.watch(&definitions);
    assert_eq!(factory.number_of_registered_prototypes(), 0);

    definitions
        .load_configuration_xml(
            r#"<ServerManagerConfiguration><ProxyGroup name="sources">
                 <SourceProxy name="STLReader" class="vtkSTLReader">
                   <StringVectorProperty name="FileName" command="SetFileName" number_of_elements="1"/>
                   <Hints><ReaderFactory extensions="stl" file_description="Stereo Lithography"/></Hints>
                 </SourceProxy>
               </ProxyGroup></ServerManagerConfiguration>"#,
        )
        .expect("configuration");
    assert_eq!(factory.number_of_registered_prototypes(), 3);
}
