use std::collections::HashMap;

use super::*;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
    move |key| map.get(key).cloned()
}

#[test]
fn defaults_when_nothing_is_set() {
    let cfg = SessionConfig::from_lookup(lookup_from(&[])).expect("config");
    assert_eq!(cfg, SessionConfig::default());
    assert_eq!(cfg.server_url, ServerUrl::Builtin);
    assert_eq!(cfg.id_block_size, DEFAULT_ID_BLOCK_SIZE);
}

#[test]
fn reads_every_variable() {
    let cfg = SessionConfig::from_lookup(lookup_from(&[
        ("SM_SERVER_URL", "cs://render-node:22221"),
        ("SM_PLUGIN_PATH", "/opt/a:/opt/b"),
        ("SM_NUM_PROCESSES", "4"),
        ("SM_ID_BLOCK_SIZE", "50"),
        ("SM_REVERSE_CONNECT_POLL_MS", "5"),
    ]))
    .expect("config");

    assert_eq!(cfg.server_url, ServerUrl::Tcp { host: "render-node".into(), port: 22221 });
    assert_eq!(cfg.plugin_paths, vec![PathBuf::from("/opt/a"), PathBuf::from("/opt/b")]);
    assert_eq!(cfg.num_processes, 4);
    assert_eq!(cfg.id_block_size, 50);
    assert_eq!(cfg.reverse_connect_poll_ms, 5);
}

#[test]
fn invalid_number_is_a_config_error() {
    let err = SessionConfig::from_lookup(lookup_from(&[("SM_NUM_PROCESSES", "many")])).expect_err("invalid");
    assert!(matches!(err, SmError::Config(ref m) if m.contains("SM_NUM_PROCESSES")));

    let err = SessionConfig::from_lookup(lookup_from(&[("SM_ID_BLOCK_SIZE", "0")])).expect_err("zero");
    assert!(matches!(err, SmError::Config(_)));
}

#[test]
fn server_url_forms() {
    assert_eq!("builtin:".parse::<ServerUrl>().expect("builtin"), ServerUrl::Builtin);
    assert_eq!(
        "tcp://localhost".parse::<ServerUrl>().expect("tcp"),
        ServerUrl::Tcp { host: "localhost".into(), port: DEFAULT_SERVER_PORT }
    );
    assert_eq!("csrc://11112".parse::<ServerUrl>().expect("reverse"), ServerUrl::ReverseTcp { port: 11112 });
    assert_eq!("csrc://host:9".parse::<ServerUrl>().expect("reverse host"), ServerUrl::ReverseTcp { port: 9 });

    assert!(matches!("ftp://x".parse::<ServerUrl>(), Err(SmError::Config(_))));
    assert!(matches!("localhost".parse::<ServerUrl>(), Err(SmError::Config(_))));
    assert!(matches!("cs://host:notaport".parse::<ServerUrl>(), Err(SmError::Config(_))));
}

#[test]
fn server_url_display_parses_back() {
    for url in [ServerUrl::Builtin, ServerUrl::Tcp { host: "h".into(), port: 1 }, ServerUrl::ReverseTcp { port: 2 }] {
        assert_eq!(url.to_string().parse::<ServerUrl>().expect("parse"), url);
    }
}
