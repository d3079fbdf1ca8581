use super::*;

use std::io::Cursor;
use std::time::Instant;

use crate::config::{ServerUrl, SessionConfig};
use crate::server::ServerCore;
use crate::session::Session;
use crate::test_helpers::sphere;

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn spawn_server() -> (SharedServer, u16) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    let server = ServerCore::new(1).shared();
    let shared = SharedServer::clone(&server);
    thread::spawn(move || {
        let _ = serve(&listener, &shared);
    });
    (server, port)
}

fn tcp_config(port: u16) -> SessionConfig {
    SessionConfig { server_url: ServerUrl::Tcp { host: "127.0.0.1".to_owned(), port }, ..SessionConfig::default() }
}

#[test]
fn frames_survive_the_length_prefix() {
    let frame = Frame::request("session:hello").with_data("user", "alice").with_from("7");
    let mut buffer = Vec::new();
    write_frame(&mut buffer, &frame).expect("write");
    let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
    assert_eq!(len as usize, buffer.len() - 4);

    let decoded = read_frame(&mut Cursor::new(buffer)).expect("read");
    assert_eq!(decoded.id, frame.id);
    assert_eq!(decoded.syscall, "session:hello");
    assert_eq!(decoded.status, Status::Request);
    assert_eq!(decoded.from.as_deref(), Some("7"));
    assert_eq!(decoded.data_str("user"), Some("alice"));
}

#[test]
fn clean_eof_closes_the_transport() {
    let mut empty = Cursor::new(Vec::<u8>::new());
    assert!(matches!(read_frame(&mut empty), Err(SmError::TransportClosed)));

    let mut truncated = Cursor::new(vec![0, 0, 0, 8, 1, 2]);
    assert!(matches!(read_frame(&mut truncated), Err(SmError::Io(_))));
}

#[test]
fn oversized_frames_are_refused() {
    let mut huge = Cursor::new((MAX_FRAME_LEN + 1).to_be_bytes().to_vec());
    assert!(matches!(read_frame(&mut huge), Err(SmError::Io(e)) if e.kind() == io::ErrorKind::InvalidData));
}

#[test]
fn sessions_collaborate_over_tcp() {
    let (server, port) = spawn_server();
    let a = Session::connect(tcp_config(port), "alice").expect("alice connects");
    let b = Session::connect(tcp_config(port), "bob").expect("bob connects");
    assert_eq!(a.uri(), format!("cs://127.0.0.1:{port}"));
    assert!(wait_until(|| lock(&server).number_of_clients() == 2));

    let source = sphere(&a);
    source.set_double("Radius", 0, 1.5);
    a.proxy_manager().register_proxy("sources", "S", &source);

    assert!(wait_until(|| {
        b.process_notifications();
        b.proxy_manager().proxy("sources", "S").is_some()
    }));
    let mirrored = b.proxy_manager().proxy("sources", "S").expect("mirrored");
    assert_eq!(mirrored.double_element("Radius", 0), Some(1.5));

    a.close();
    assert!(wait_until(|| lock(&server).number_of_clients() == 1));
}

#[test]
fn server_connects_back_to_a_waiting_client() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    let server = ServerCore::new(2).shared();
    let handle = connect_back(("127.0.0.1", port), &server).expect("server dials out");

    let transport = reverse_connect_with_listener(&listener, Duration::from_millis(10), || true)
        .expect("accept")
        .expect("connected");
    assert_eq!(transport.uri(), format!("csrc://{port}"));
    let session = Session::with_transport(Box::new(transport), "carol", SessionConfig::default()).expect("session");
    assert_eq!(session.number_of_processes(), 2);

    session.close();
    handle.join().expect("server thread");
    assert_eq!(lock(&server).number_of_clients(), 0);
}

#[test]
fn giving_up_on_a_reverse_connection() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
    let mut polls = 0;
    let outcome = reverse_connect_with_listener(&listener, Duration::from_millis(1), || {
        polls += 1;
        polls < 3
    })
    .expect("no accept error");
    assert!(outcome.is_none());
    assert_eq!(polls, 3);

    let aborted = Session::reverse_connect_to_remote(0, "dave", SessionConfig::default(), || false);
    assert!(matches!(aborted, Err(SmError::ConnectionAborted)));
}
